//! # Task Registry
//!
//! Process-wide table of running engines. It is the single authority for:
//!
//! - **Single flight**: at most one active task per (owner, credential).
//! - **Stop routing**: a task id resolves to its cancellation token.
//! - **Owner credentials**: the credentials an owner has submitted and that
//!   `start_all` restarts.
//!
//! Every mutation happens under one lock, so a check-then-insert can never
//! interleave with another start for the same key.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

use crate::core::model::{StatsSnapshot, TaskId, TaskKey, TaskState, TaskStats};

/// Shared handle to one running task. Cloned between the engine and the
/// registry; every clone observes the same state, stats and token.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: TaskId,
    key: TaskKey,
    state: Arc<Mutex<TaskState>>,
    stats: Arc<TaskStats>,
    cancel: CancellationToken,
    finished: Arc<AtomicBool>,
}

impl TaskHandle {
    fn new(key: TaskKey) -> Self {
        Self {
            id: TaskId::generate(),
            key,
            state: Arc::new(Mutex::new(TaskState::Running)),
            stats: Arc::new(TaskStats::default()),
            cancel: CancellationToken::new(),
            finished: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The task's id.
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    /// The (owner, credential) pair the task serves.
    pub fn key(&self) -> &TaskKey {
        &self.key
    }

    /// Live counters.
    pub fn stats(&self) -> &Arc<TaskStats> {
        &self.stats
    }

    /// Token the engine watches for stop requests.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: TaskState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    /// Serializable snapshot of the task.
    pub fn view(&self) -> TaskView {
        TaskView {
            task_id: self.id.clone(),
            owner: self.key.owner.clone(),
            credential: self.key.masked_credential(),
            state: self.state(),
            stats: self.stats.snapshot(),
        }
    }
}

/// What front ends see of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskView {
    /// Task id, used to stop it.
    pub task_id: TaskId,
    /// Owning user.
    pub owner: String,
    /// Masked credential.
    pub credential: String,
    /// Lifecycle state.
    pub state: TaskState,
    /// Counters at the time of the snapshot.
    pub stats: StatsSnapshot,
}

/// Result of [`TaskRegistry::try_register`].
#[derive(Debug)]
pub enum Registration {
    /// The key was free; the caller owns the new task and must run it.
    New(TaskHandle),
    /// A task for the key is already active.
    Existing(TaskId),
}

/// Result of [`TaskRegistry::request_stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// The task was active and has been told to stop.
    Stopping,
    /// Unknown id, or the task already ended.
    AlreadyStopped,
}

#[derive(Debug, Default)]
struct RegistryState {
    tasks: HashMap<TaskKey, TaskHandle>,
    by_id: HashMap<TaskId, TaskKey>,
    credentials: HashMap<String, Vec<String>>,
}

/// The process-wide task table.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    state: Mutex<RegistryState>,
}

impl TaskRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    // Every critical section leaves the maps consistent, so a poisoned lock
    // still holds usable data.
    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remembers a credential for the owner. Returns false when it was
    /// already known.
    pub fn add_credential(&self, owner: &str, credential: &str) -> bool {
        let mut state = self.lock();
        let list = state.credentials.entry(owner.to_string()).or_default();
        if list.iter().any(|c| c == credential) {
            return false;
        }
        list.push(credential.to_string());
        true
    }

    /// The owner's known credentials, in submission order.
    pub fn credentials(&self, owner: &str) -> Vec<String> {
        self.lock().credentials.get(owner).cloned().unwrap_or_default()
    }

    /// Claims the key for a new task unless one is already active.
    pub fn try_register(&self, key: TaskKey) -> Registration {
        let mut state = self.lock();
        if let Some(existing) = state.tasks.get(&key) {
            return Registration::Existing(existing.id.clone());
        }
        let handle = TaskHandle::new(key.clone());
        state.by_id.insert(handle.id.clone(), key.clone());
        state.tasks.insert(key, handle.clone());
        Registration::New(handle)
    }

    /// Cancels the task and frees its key for a new start. The engine keeps
    /// running until it observes the token and tears itself down.
    pub fn request_stop(&self, task_id: &TaskId) -> StopOutcome {
        let mut state = self.lock();
        let Some(key) = state.by_id.remove(task_id) else {
            return StopOutcome::AlreadyStopped;
        };
        let Some(handle) = state.tasks.remove(&key) else {
            return StopOutcome::AlreadyStopped;
        };
        drop(state);

        handle.set_state(TaskState::StopRequested);
        handle.cancel.cancel();
        tracing::info!(task_id = %task_id, task = %key, "stop requested");
        StopOutcome::Stopping
    }

    /// Called by the engine on exit. Runs its effect once per task: marks it
    /// stopped, drops its entry if it still owns the key and forgets the
    /// credential when no other task serves it.
    pub fn finish(&self, handle: &TaskHandle) {
        if handle.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        handle.set_state(TaskState::Stopped);

        let mut state = self.lock();
        let owns_key = state
            .tasks
            .get(&handle.key)
            .is_some_and(|current| current.id == handle.id);
        if owns_key {
            state.tasks.remove(&handle.key);
        }
        state.by_id.remove(&handle.id);

        if !state.tasks.contains_key(&handle.key) {
            let owner = &handle.key.owner;
            if let Some(list) = state.credentials.get_mut(owner) {
                list.retain(|c| c != &handle.key.credential);
                if list.is_empty() {
                    state.credentials.remove(owner);
                }
            }
        }
    }

    /// Looks up an active task.
    pub fn get(&self, task_id: &TaskId) -> Option<TaskView> {
        let state = self.lock();
        let key = state.by_id.get(task_id)?;
        state.tasks.get(key).map(TaskHandle::view)
    }

    /// Active tasks of one owner.
    pub fn active_for_owner(&self, owner: &str) -> Vec<TaskView> {
        let state = self.lock();
        let mut views: Vec<TaskView> = state
            .tasks
            .values()
            .filter(|h| h.key.owner == owner)
            .map(TaskHandle::view)
            .collect();
        views.sort_by(|a, b| a.credential.cmp(&b.credential));
        views
    }

    /// Number of active tasks across all owners.
    pub fn active_count(&self) -> usize {
        self.lock().tasks.len()
    }

    /// Requests a stop for every active task. Returns how many were told.
    pub fn stop_all(&self) -> usize {
        let ids: Vec<TaskId> = self.lock().by_id.keys().cloned().collect();
        ids.iter()
            .filter(|id| self.request_stop(id) == StopOutcome::Stopping)
            .count()
    }
}
