//! Scripted collaborators for unit tests.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::core::error::{FeedError, StoreError};
use crate::core::feed::{ApiReply, FeedApi};
use crate::core::reservation::{MemoryReservationStore, ReservationRecord, ReservationStore};

/// A feed page listing `ids` without country hints.
pub(crate) fn page(ids: &[&str]) -> ApiReply {
    let users: Vec<serde_json::Value> = ids.iter().map(|id| serde_json::json!({ "_id": id })).collect();
    ApiReply::new(200, serde_json::json!({ "users": users }).to_string())
}

/// Feed fake: pages are served in push order, then every fetch is empty.
/// Answers default to `200 {}` unless scripted per candidate.
#[derive(Default)]
pub(crate) struct ScriptedFeed {
    pages: Mutex<VecDeque<Result<ApiReply, FeedError>>>,
    answers: Mutex<HashMap<String, Result<ApiReply, FeedError>>>,
    answered: Mutex<Vec<String>>,
    answer_delay: Mutex<Option<Duration>>,
    held: Mutex<HashMap<String, Duration>>,
    fetches: AtomicUsize,
}

impl ScriptedFeed {
    pub(crate) fn push_page(&self, reply: Result<ApiReply, FeedError>) {
        self.pages.lock().unwrap().push_back(reply);
    }

    pub(crate) fn answer_with(&self, candidate_id: &str, reply: Result<ApiReply, FeedError>) {
        self.answers.lock().unwrap().insert(candidate_id.to_string(), reply);
    }

    /// Makes every answer call sleep before replying.
    pub(crate) fn hold_answers(&self, delay: Duration) {
        *self.answer_delay.lock().unwrap() = Some(delay);
    }

    /// Makes the answer for one candidate sleep before replying.
    pub(crate) fn hold_answer(&self, candidate_id: &str, delay: Duration) {
        self.held.lock().unwrap().insert(candidate_id.to_string(), delay);
    }

    /// Candidate ids that reached `answer`, in call order.
    pub(crate) fn answered(&self) -> Vec<String> {
        self.answered.lock().unwrap().clone()
    }

    pub(crate) fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeedApi for ScriptedFeed {
    async fn fetch_page(&self, _feed_url: &str, _credential: &str) -> Result<ApiReply, FeedError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let next = self.pages.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(ApiReply::new(200, r#"{"users":[]}"#)))
    }

    async fn answer(&self, candidate_id: &str, _credential: &str) -> Result<ApiReply, FeedError> {
        self.answered.lock().unwrap().push(candidate_id.to_string());
        let held = self.held.lock().unwrap().get(candidate_id).copied();
        let delay = held.or(*self.answer_delay.lock().unwrap());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.answers.lock().unwrap().get(candidate_id).cloned();
        scripted.unwrap_or_else(|| Ok(ApiReply::new(200, "{}")))
    }
}

/// Memory ledger whose confirm or release can be switched to fail.
#[derive(Default)]
pub(crate) struct FaultyLedger {
    inner: MemoryReservationStore,
    fail_confirm: AtomicBool,
    fail_release: AtomicBool,
}

impl FaultyLedger {
    pub(crate) fn fail_confirm(&self) {
        self.fail_confirm.store(true, Ordering::SeqCst);
    }

    pub(crate) fn fail_release(&self) {
        self.fail_release.store(true, Ordering::SeqCst);
    }

    pub(crate) fn inner(&self) -> &MemoryReservationStore {
        &self.inner
    }
}

#[async_trait]
impl ReservationStore for FaultyLedger {
    async fn reserve(&self, candidate_id: &str, owner: &str) -> Result<bool, StoreError> {
        self.inner.reserve(candidate_id, owner).await
    }

    async fn confirm(&self, candidate_id: &str, owner: &str) -> Result<(), StoreError> {
        if self.fail_confirm.load(Ordering::SeqCst) {
            return Err(StoreError::Query("confirm rejected".to_string()));
        }
        self.inner.confirm(candidate_id, owner).await
    }

    async fn release(&self, candidate_id: &str) -> Result<bool, StoreError> {
        if self.fail_release.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("release rejected".to_string()));
        }
        self.inner.release(candidate_id).await
    }

    async fn count_for_owner(&self, owner: &str) -> Result<u64, StoreError> {
        self.inner.count_for_owner(owner).await
    }

    async fn recent_for_owner(&self, owner: &str, limit: usize) -> Result<Vec<ReservationRecord>, StoreError> {
        self.inner.recent_for_owner(owner, limit).await
    }

    async fn clear_owner(&self, owner: &str) -> Result<u64, StoreError> {
        self.inner.clear_owner(owner).await
    }

    async fn wipe(&self) -> Result<u64, StoreError> {
        self.inner.wipe().await
    }

    async fn sweep_stale(&self, older_than: Duration) -> Result<u64, StoreError> {
        self.inner.sweep_stale(older_than).await
    }
}
