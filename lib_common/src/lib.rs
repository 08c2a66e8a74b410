//! # lib_common
//!
//! Shared library for the matcher workspace. The `core` module holds the
//! matching engine and everything it needs to run against in-memory
//! collaborators; the optional `retrieve` and `connections` modules plug in
//! the real HTTP feed client and the PostgreSQL stores.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// The matching engine, its registry and its collaborator traits.
pub mod core;

/// HTTP clients for the candidate feed.
#[cfg(feature = "retrieve")]
pub mod retrieve;

/// PostgreSQL-backed stores.
#[cfg(feature = "connections")]
pub mod connections;

// Re-export the types most callers reach for.
pub use crate::core::{
    EngineTiming, MatchService, StatsSnapshot, StopOutcome, TaskId, TaskKey, TerminalReason,
};
