use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderValue, Method};
use clap::Parser;
use mimalloc::MiMalloc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, TraceLayer};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use qopy_server::{gen_router, security_headers, AppState, ServerConfig};
use qopy_service::clips::ClipService;
use qopy_service::guard::{AccessGuard, GuardConfig};
use qopy_service::metadata::MetadataStore;
use qopy_service::session::{UploadConfig, UploadSessionManager};
use qopy_service::sweeper::{Sweeper, SweeperConfig};
use qopy_storage::{BlobStore, ChunkStore};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// End-to-end encrypted ephemeral clipboard and file sharing server.
/// Stores only ciphertext; clips expire or self-destruct on first read.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// SQLite DSN of the metadata store, e.g. sqlite:///var/lib/qopy/qopy.db
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Root directory for chunk staging and blob storage.
    #[arg(long, env = "STORAGE_PATH")]
    storage_path: PathBuf,

    /// Cap on a session's declared filesize, in bytes.
    #[arg(long, env = "MAX_FILE_SIZE", default_value_t = 100 * 1024 * 1024)]
    max_file_size: u64,

    /// Chunk size used when the client does not pick one, in bytes.
    #[arg(long, env = "CHUNK_SIZE_DEFAULT", default_value_t = 5 * 1024 * 1024)]
    chunk_size_default: u64,

    /// Seconds an unfinished upload session stays alive.
    #[arg(long, env = "UPLOAD_TTL", default_value_t = 3600)]
    upload_ttl: u64,

    /// Seconds between sweep passes.
    #[arg(long, env = "SWEEP_INTERVAL", default_value_t = 300)]
    sweep_interval: u64,

    /// Minimum age in seconds before unreferenced on-disk state is removed.
    #[arg(long, env = "ORPHAN_GRACE", default_value_t = 600)]
    orphan_grace: u64,

    #[arg(long, env = "RATE_LIMIT_DOWNLOADS_PER_MIN", default_value_t = 60)]
    rate_limit_downloads_per_min: u32,

    #[arg(long, env = "RATE_LIMIT_CREATES_PER_MIN", default_value_t = 30)]
    rate_limit_creates_per_min: u32,

    #[arg(long, env = "RATE_LIMIT_ADMIN_PER_MIN", default_value_t = 30)]
    rate_limit_admin_per_min: u32,

    /// Global cap on uploads in flight; excess requests are refused.
    #[arg(long, env = "MAX_CONCURRENT_UPLOADS", default_value_t = 64)]
    max_concurrent_uploads: usize,

    /// Bearer token for the admin endpoints. Unset disables them.
    #[arg(long, env = "ADMIN_TOKEN")]
    admin_token: Option<String>,

    /// Public base for the clip URLs returned on completion.
    #[arg(long, env = "BASE_URL", default_value = "http://localhost:9000")]
    base_url: String,

    /// Comma-separated allowlist of CORS origins. Empty allows none.
    #[arg(long, env = "CORS_ALLOWED_ORIGINS", value_delimiter = ',')]
    cors_allowed_origins: Vec<String>,

    /// Emit HSTS headers (enable when TLS-terminated upstream).
    #[arg(long, env = "HSTS", default_value_t = false)]
    hsts: bool,

    /// The address to listen on.
    #[clap(flatten)]
    listen_args: tokio_listener::ListenerAddressLFlag,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Stores.
    let metadata = Arc::new(MetadataStore::connect(&cli.database_url).await?);
    let chunks = Arc::new(ChunkStore::open(&cli.storage_path).await?);
    let blobs = Arc::new(BlobStore::open(&cli.storage_path).await?);

    // Services.
    let guard = Arc::new(AccessGuard::new(GuardConfig {
        downloads_per_minute: cli.rate_limit_downloads_per_min,
        creates_per_minute: cli.rate_limit_creates_per_min,
        admin_per_minute: cli.rate_limit_admin_per_min,
        ..GuardConfig::default()
    }));
    let sessions = Arc::new(UploadSessionManager::new(
        metadata.clone(),
        chunks.clone(),
        blobs.clone(),
        UploadConfig {
            max_file_size: cli.max_file_size,
            default_chunk_size: cli.chunk_size_default,
            upload_ttl: Duration::from_secs(cli.upload_ttl),
            max_concurrent_uploads: cli.max_concurrent_uploads,
        },
    ));
    let clips = Arc::new(ClipService::new(
        metadata.clone(),
        blobs.clone(),
        guard.clone(),
    ));

    // Background tasks.
    guard.spawn_cleanup();
    Arc::new(Sweeper::new(
        metadata.clone(),
        chunks.clone(),
        blobs.clone(),
        SweeperConfig {
            interval: Duration::from_secs(cli.sweep_interval),
            orphan_grace: Duration::from_secs(cli.orphan_grace),
        },
    ))
    .spawn();

    let state = AppState {
        sessions,
        clips,
        guard,
        metadata,
        config: Arc::new(ServerConfig {
            base_url: cli.base_url,
            admin_token: cli.admin_token,
            hsts: cli.hsts,
        }),
    };

    let origins = cli
        .cors_allowed_origins
        .iter()
        .map(|origin| origin.parse::<HeaderValue>())
        .collect::<Result<Vec<_>, _>>()?;
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_origin(origins);

    let app = gen_router()
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(tracing::Level::INFO)),
                )
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TimeoutLayer::new(Duration::from_secs(300)))
                .layer(cors)
                .layer(axum::middleware::from_fn_with_state(
                    state.clone(),
                    security_headers,
                )),
        )
        .with_state(state);

    let listen_address = &cli.listen_args.listen_address.unwrap_or_else(|| {
        "[::]:9000"
            .parse()
            .expect("invalid fallback listen address")
    });

    let listener = tokio_listener::Listener::bind(
        listen_address,
        &Default::default(),
        &cli.listen_args.listener_options,
    )
    .await?;

    info!(listen_address=%listen_address, "starting daemon");

    tokio_listener::axum07::serve(
        listener,
        app.into_make_service_with_connect_info::<tokio_listener::SomeSocketAddrClonable>(),
    )
    .await?;

    Ok(())
}
