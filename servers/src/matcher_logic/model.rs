use lib_common::core::{FilterMode, ReservationRecord, StartOutcome, StopOutcome, TaskId};
use serde::{Deserialize, Serialize};

pub const DEFAULT_HISTORY_LIMIT: usize = 20;
pub const MAX_HISTORY_LIMIT: usize = 500;

#[derive(Debug, Clone, Deserialize)]
pub struct FeedUrlRequest {
    pub url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedUrlResponse {
    pub feed_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CredentialRequest {
    pub credential: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartResponse {
    pub task_id: TaskId,
    pub status: &'static str,
}

impl From<StartOutcome> for StartResponse {
    fn from(outcome: StartOutcome) -> Self {
        match outcome {
            StartOutcome::Started(task_id) => Self { task_id, status: "started" },
            StartOutcome::AlreadyRunning(task_id) => Self {
                task_id,
                status: "already_running",
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StopResponse {
    pub task_id: TaskId,
    pub outcome: StopOutcome,
    pub message: &'static str,
}

impl StopResponse {
    pub fn new(task_id: TaskId, outcome: StopOutcome) -> Self {
        let message = match outcome {
            StopOutcome::Stopping => "Stopping…",
            StopOutcome::AlreadyStopped => "Already stopped.",
        };
        Self {
            task_id,
            outcome,
            message,
        }
    }
}

/// Partial filter update; absent fields are left as they are.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilterUpdate {
    pub mode: Option<FilterMode>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CountriesRequest {
    pub codes: Vec<String>,
}

impl CountriesRequest {
    /// Entries may themselves hold several codes separated by commas or
    /// whitespace, the way users type them.
    pub fn split_codes(&self) -> Vec<String> {
        self.codes
            .iter()
            .flat_map(|entry| entry.split(|c: char| c == ',' || c.is_whitespace()))
            .filter(|code| !code.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DedupRequest {
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

impl HistoryQuery {
    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).min(MAX_HISTORY_LIMIT)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryResponse {
    pub owner: String,
    pub total: u64,
    pub recent: Vec<ReservationRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemovedResponse {
    pub removed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub active_tasks: usize,
}
