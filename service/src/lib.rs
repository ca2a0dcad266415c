//! Domain services of the qopy server: session lifecycle, clip retrieval,
//! identifier allocation, access guarding, metadata persistence and the
//! background sweeper.

pub mod clips;
pub mod error;
pub mod guard;
pub mod ident;
pub mod metadata;
pub mod retention;
pub mod session;
pub mod sweeper;

#[cfg(test)]
mod tests;

pub use error::Error;

/// Milliseconds since the unix epoch; the timestamp unit used throughout
/// the data model.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}
