//! # Core Engine Module
//!
//! This module is the heart of the matcher. It aggregates everything needed to
//! run one automation per (owner, credential) pair against a candidate feed.
//!
//! ## Core Components:
//!
//! - **`filter`**: country normalization and the include/exclude policy.
//! - **`reservation`**: the shared, globally deduplicated candidate ledger and
//!   its in-memory implementation.
//! - **`dispatcher`**: runs up to one batch of accept calls concurrently and
//!   classifies every outcome.
//! - **`engine`**: the per-task polling loop.
//! - **`registry`**: the process-wide table of running engines, enforcing
//!   single-flight starts and routing stop requests.
//! - **`reporter`**: the sink for live stats and terminal notifications.
//! - **`service`**: the facade front ends talk to.
//!
//! The feed API, the settings store and the reservation store are traits so
//! that the engine can run against PostgreSQL and reqwest in production and
//! against in-memory fakes in tests.

#![forbid(unsafe_code)]

/// Error types shared by the core components.
pub mod error;
/// Feed API seam and page decoding.
pub mod feed;
/// Identifiers, candidates, stats and terminal reasons.
pub mod model;
/// Country normalization and filter policy.
pub mod filter;
/// Key-value settings collaborator.
pub mod settings;
/// Candidate reservation ledger.
pub mod reservation;
/// Concurrent accept-call batches.
pub mod dispatcher;
/// The per-task matching loop.
pub mod engine;
/// Process-wide registry of running engines.
pub mod registry;
/// Stats and terminal notification sink.
pub mod reporter;
/// Front-end facade.
pub mod service;

#[cfg(test)]
pub(crate) mod test_support;

// --- Public API Re-exports ---
pub use dispatcher::{AcceptOutcome, BatchDispatcher, DispatchResult, FailureReason, OpenReservations};
pub use engine::{EngineTiming, MatchingEngine};
pub use error::{FeedError, ServiceError, StoreError};
pub use feed::{ApiReply, FeedApi, PageOutcome};
pub use filter::{FilterConfig, FilterMode};
pub use model::{Candidate, StatsSnapshot, TaskId, TaskKey, TaskState, TaskStats, TerminalReason};
pub use registry::{Registration, StopOutcome, TaskHandle, TaskRegistry, TaskView};
pub use reporter::{ChannelReporter, ReportError, ReportEvent, StatsReporter, TracingReporter};
pub use reservation::{MemoryReservationStore, ReservationRecord, ReservationStore};
pub use service::{MatchService, StartOutcome};
pub use settings::{MemorySettingsStore, SettingsStore};
