//! Error types for the matcher core.

use thiserror::Error;

/// Failures of a reservation or settings backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not hand out a connection.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// A statement was rejected or failed mid-flight.
    #[error("store query failed: {0}")]
    Query(String),
    /// An in-memory store's lock was poisoned by a panicking writer.
    #[error("store lock poisoned")]
    Poisoned,
}

#[cfg(feature = "connections")]
impl From<tokio_postgres::Error> for StoreError {
    fn from(e: tokio_postgres::Error) -> Self {
        StoreError::Query(e.to_string())
    }
}

#[cfg(feature = "connections")]
impl From<deadpool_postgres::PoolError> for StoreError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// Failures talking to the candidate feed.
#[derive(Debug, Clone, Error)]
pub enum FeedError {
    /// Connection, TLS, timeout or body read failure.
    #[error("transport error: {0}")]
    Transport(String),
    /// The request could not be built (bad URL, bad header value).
    #[error("invalid request: {0}")]
    Build(String),
}

#[cfg(feature = "retrieve")]
impl From<reqwest::Error> for FeedError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_builder() {
            FeedError::Build(e.to_string())
        } else {
            FeedError::Transport(e.to_string())
        }
    }
}

/// Errors surfaced to front ends by [`crate::core::MatchService`].
#[derive(Debug, Error)]
pub enum ServiceError {
    /// No feed URL has been configured yet.
    #[error("feed url is not configured")]
    FeedUrlMissing,
    /// The supplied feed URL was rejected.
    #[error("invalid feed url: {0}")]
    InvalidFeedUrl(String),
    /// The owner has no stored credentials to start.
    #[error("no credentials stored for owner {0}")]
    NoCredentials(String),
    /// An empty credential was submitted.
    #[error("credential must not be empty")]
    EmptyCredential,
    /// The settings or reservation backend failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A fault inside the engine loop. Always ends the run with
/// [`crate::core::TerminalReason::Error`].
#[derive(Debug, Error)]
pub enum EngineFault {
    /// The reservation or settings backend failed.
    #[error("store failure: {0}")]
    Store(#[from] StoreError),
    /// The feed page could not be fetched.
    #[error("feed fetch failed: {0}")]
    Feed(#[from] FeedError),
    /// A spawned accept call panicked or was aborted.
    #[error("accept call aborted: {0}")]
    Join(String),
    /// The loop itself panicked.
    #[error("engine panicked: {0}")]
    Panic(String),
}
