use std::convert::Infallible;
use std::net::SocketAddr;

use axum::async_trait;
use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;

/// Opaque per-client key for rate limiting and the brute-force blocker:
/// the first `X-Forwarded-For` hop when a reverse proxy provides one,
/// otherwise the peer address.
#[derive(Debug, Clone)]
pub struct ClientKey(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for ClientKey
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(forwarded) = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
        {
            if let Some(first) = forwarded
                .split(',')
                .next()
                .map(str::trim)
                .filter(|s| !s.is_empty())
            {
                return Ok(ClientKey(first.to_string()));
            }
        }
        if let Some(ConnectInfo(addr)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
            return Ok(ClientKey(addr.ip().to_string()));
        }
        if let Some(ConnectInfo(addr)) = parts
            .extensions
            .get::<ConnectInfo<tokio_listener::SomeSocketAddrClonable>>()
        {
            return Ok(ClientKey(addr.to_string()));
        }
        Ok(ClientKey("unknown".to_string()))
    }
}
