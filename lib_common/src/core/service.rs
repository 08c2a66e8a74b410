//! # Match Service
//!
//! The facade front ends talk to. It owns the registry and the shared engine,
//! spawns one tokio task per started credential and tracks them so that a
//! shutdown can wait for every engine's teardown.

use std::sync::Arc;
use tokio_util::task::TaskTracker;

use crate::core::engine::{EngineTiming, MatchingEngine};
use crate::core::error::{ServiceError, StoreError};
use crate::core::feed::FeedApi;
use crate::core::model::{TaskId, TaskKey};
use crate::core::registry::{Registration, StopOutcome, TaskRegistry, TaskView};
use crate::core::reporter::StatsReporter;
use crate::core::reservation::ReservationStore;
use crate::core::settings::{SettingsStore, FEED_URL_KEY};

/// Result of a start request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new engine was spawned.
    Started(TaskId),
    /// An engine for the same (owner, credential) is already running.
    AlreadyRunning(TaskId),
}

impl StartOutcome {
    /// The task id, whichever way the start went.
    pub fn task_id(&self) -> &TaskId {
        match self {
            StartOutcome::Started(id) | StartOutcome::AlreadyRunning(id) => id,
        }
    }
}

/// Entry point for starting, stopping and inspecting matching tasks.
pub struct MatchService {
    registry: Arc<TaskRegistry>,
    engine: Arc<MatchingEngine>,
    settings: Arc<dyn SettingsStore>,
    reservations: Arc<dyn ReservationStore>,
    tracker: TaskTracker,
}

impl MatchService {
    /// Builds the service and its engine around the given collaborators.
    pub fn new(
        api: Arc<dyn FeedApi>,
        reservations: Arc<dyn ReservationStore>,
        settings: Arc<dyn SettingsStore>,
        reporter: Arc<dyn StatsReporter>,
        timing: EngineTiming,
    ) -> Self {
        let registry = Arc::new(TaskRegistry::new());
        let engine = Arc::new(MatchingEngine::new(
            api,
            Arc::clone(&reservations),
            Arc::clone(&settings),
            reporter,
            Arc::clone(&registry),
            timing,
        ));
        Self {
            registry,
            engine,
            settings,
            reservations,
            tracker: TaskTracker::new(),
        }
    }

    /// The settings store, for filter and dedup commands.
    pub fn settings(&self) -> &dyn SettingsStore {
        self.settings.as_ref()
    }

    /// The reservation ledger, for history commands and the sweeper.
    pub fn reservations(&self) -> &dyn ReservationStore {
        self.reservations.as_ref()
    }

    /// Stores the global feed URL. Only `https` URLs are accepted.
    pub async fn set_feed_url(&self, url: &str) -> Result<(), ServiceError> {
        let url = url.trim();
        if !url.starts_with("https://") || url.len() <= "https://".len() {
            return Err(ServiceError::InvalidFeedUrl(url.to_string()));
        }
        self.settings.set_value(FEED_URL_KEY, url).await?;
        tracing::info!(feed_url = %url, "feed url updated");
        Ok(())
    }

    /// The configured feed URL.
    pub async fn feed_url(&self) -> Result<String, ServiceError> {
        self.settings
            .get_value(FEED_URL_KEY)
            .await?
            .filter(|url| !url.is_empty())
            .ok_or(ServiceError::FeedUrlMissing)
    }

    /// Remembers the credential for the owner and starts an engine for it.
    /// Submitting a credential that is already running returns its task.
    pub async fn submit_credential(&self, owner: &str, credential: &str) -> Result<StartOutcome, ServiceError> {
        let credential = credential.trim();
        if credential.is_empty() {
            return Err(ServiceError::EmptyCredential);
        }
        self.registry.add_credential(owner, credential);
        let feed_url = self.feed_url().await?;
        Ok(self.start(owner, credential, &feed_url))
    }

    /// Starts an engine for every credential the owner has submitted.
    pub async fn start_all(&self, owner: &str) -> Result<Vec<StartOutcome>, ServiceError> {
        let credentials = self.registry.credentials(owner);
        if credentials.is_empty() {
            return Err(ServiceError::NoCredentials(owner.to_string()));
        }
        let feed_url = self.feed_url().await?;
        Ok(credentials
            .iter()
            .map(|credential| self.start(owner, credential, &feed_url))
            .collect())
    }

    fn start(&self, owner: &str, credential: &str, feed_url: &str) -> StartOutcome {
        let handle = match self.registry.try_register(TaskKey::new(owner, credential)) {
            Registration::Existing(task_id) => return StartOutcome::AlreadyRunning(task_id),
            Registration::New(handle) => handle,
        };
        let task_id = handle.id().clone();
        let engine = Arc::clone(&self.engine);
        let feed_url = feed_url.to_string();
        self.tracker.spawn(async move {
            engine.run(&handle, &feed_url).await;
        });
        StartOutcome::Started(task_id)
    }

    /// Asks a task to stop. Idempotent.
    pub fn request_stop(&self, task_id: &TaskId) -> StopOutcome {
        self.registry.request_stop(task_id)
    }

    /// Active tasks of one owner.
    pub fn tasks(&self, owner: &str) -> Vec<TaskView> {
        self.registry.active_for_owner(owner)
    }

    /// One active task.
    pub fn task(&self, task_id: &TaskId) -> Option<TaskView> {
        self.registry.get(task_id)
    }

    /// Number of active tasks.
    pub fn active_count(&self) -> usize {
        self.registry.active_count()
    }

    /// Releases reservations older than `ttl` that were never resolved.
    pub async fn sweep_stale(&self, ttl: std::time::Duration) -> Result<u64, StoreError> {
        let removed = self.reservations.sweep_stale(ttl).await?;
        if removed > 0 {
            tracing::info!(removed, "stale reservations swept");
        }
        Ok(removed)
    }

    /// Stops every task and waits until all engines finished their teardown.
    pub async fn shutdown(&self) {
        let stopped = self.registry.stop_all();
        tracing::info!(stopped, "stopping all matching tasks");
        self.tracker.close();
        self.tracker.wait().await;
    }
}
