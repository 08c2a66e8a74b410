//! # Task Model
//!
//! Identifiers, the transient candidate record, live counters and the terminal
//! reasons an engine run can end with.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of one automation: the owner it runs for and the credential it
/// authenticates with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskKey {
    /// The external identity (chat, user) the engine runs on behalf of.
    pub owner: String,
    /// The feed access token.
    pub credential: String,
}

impl TaskKey {
    /// Builds a key from borrowed parts.
    pub fn new(owner: &str, credential: &str) -> Self {
        Self {
            owner: owner.to_string(),
            credential: credential.to_string(),
        }
    }

    /// The credential in a form that is safe to log or display.
    pub fn masked_credential(&self) -> String {
        mask_credential(&self.credential)
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.owner, self.masked_credential())
    }
}

/// Keeps the first four characters of a credential and hides the rest.
pub fn mask_credential(credential: &str) -> String {
    let visible: String = credential.chars().take(4).collect();
    if credential.chars().count() > 4 {
        format!("{}…", visible)
    } else {
        visible
    }
}

/// Opaque, unique task token handed to front ends for stop requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// A fresh random id (UUID v4, simple hex form).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Borrow the raw token.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One profile entry from a feed page. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// The feed's identifier for the profile.
    pub external_id: String,
    /// Nationality code or locale as sent by the feed, not normalized.
    pub country_hint: Option<String>,
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// The engine loop is active.
    Running,
    /// A stop was requested; the engine has not finished cleanup yet.
    StopRequested,
    /// The engine exited and released its slot.
    Stopped,
}

/// Why an engine run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalReason {
    /// The feed or an accept call rejected the credential.
    TokenExpired,
    /// The feed reported the daily accept limit.
    LimitExceeded,
    /// Too many consecutive empty pages.
    NoCandidatesFound,
    /// Cancelled through the registry.
    Stopped,
    /// An unhandled fault ended the loop.
    Error(String),
}

impl TerminalReason {
    /// Cancellation is the only terminal path that is not a failure.
    pub fn is_failure(&self) -> bool {
        !matches!(self, TerminalReason::Stopped)
    }
}

impl fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminalReason::TokenExpired => f.write_str("TOKEN EXPIRED"),
            TerminalReason::LimitExceeded => f.write_str("LIMIT EXCEEDED"),
            TerminalReason::NoCandidatesFound => f.write_str("NO USERS FOUND"),
            TerminalReason::Stopped => f.write_str("STOPPED"),
            TerminalReason::Error(message) => write!(f, "ERROR: {}", message),
        }
    }
}

/// Live counters of one task, shared between the engine, its dispatcher and
/// the registry.
#[derive(Debug, Default)]
pub struct TaskStats {
    requests_sent: AtomicU64,
    cycles_completed: AtomicU64,
    error_count: AtomicU64,
}

impl TaskStats {
    /// Counts one submitted accept call.
    pub fn record_request(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one fully processed page.
    pub fn record_cycle(&self) {
        self.cycles_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one transient failure.
    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies the counters as they are right now.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            cycles_completed: self.cycles_completed.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            terminal_reason: None,
        }
    }
}

/// Immutable copy of a task's counters at report time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Accept calls submitted.
    pub requests_sent: u64,
    /// Pages fully processed.
    pub cycles_completed: u64,
    /// Transient failures (transport errors, unexpected statuses).
    pub error_count: u64,
    /// Set only on the final snapshot of a run.
    pub terminal_reason: Option<String>,
}

impl StatsSnapshot {
    /// Pairs the snapshot with the reason the run ended.
    pub fn with_reason(mut self, reason: &TerminalReason) -> Self {
        self.terminal_reason = Some(reason.to_string());
        self
    }

    /// Text form used by chat-style front ends.
    pub fn render(&self) -> String {
        let mut text = format!(
            "Live Stats:\nRequests: {}\nCycles: {}\nErrors: {}",
            self.requests_sent, self.cycles_completed, self.error_count
        );
        if let Some(reason) = &self.terminal_reason {
            text.push_str(&format!("\n\n⚠️ {}", reason));
        }
        text
    }
}
