//! # Matching Engine
//!
//! The per-task control loop. One engine run serves one (owner, credential)
//! pair and repeats the same cycle until something ends it:
//!
//! 1. Re-read the owner's filter configuration.
//! 2. Fetch one feed page.
//! 3. Filter and reserve each candidate, submitting accepted ones to the
//!    [`BatchDispatcher`] with a random stagger between submissions.
//! 4. Flush every full batch; a failure-class result stops the page.
//! 5. Report the cycle and pause before the next page.
//!
//! Pages are strictly sequential; the only concurrency inside a run is one
//! batch of accept calls. Cancellation interrupts whatever the loop is
//! waiting on. Every exit path, including panics, goes through the same
//! teardown: release open reservations, send the terminal notification and
//! free the registry slot.

use futures_util::FutureExt;
use rand::Rng;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use crate::core::dispatcher::{AcceptOutcome, BatchDispatcher, DispatchResult, FailureReason, OpenReservations};
use crate::core::error::EngineFault;
use crate::core::feed::{classify_page, FeedApi, PageOutcome};
use crate::core::filter::FilterConfig;
use crate::core::model::{Candidate, TerminalReason};
use crate::core::registry::{TaskHandle, TaskRegistry};
use crate::core::reporter::StatsReporter;
use crate::core::reservation::ReservationStore;
use crate::core::settings::SettingsStore;

/// Pacing and thresholds of the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineTiming {
    /// Accept calls collected before a batch is flushed.
    pub batch_size: usize,
    /// Consecutive empty pages that end the run.
    pub empty_page_limit: u32,
    /// Pause after an empty page.
    pub empty_page_retry: Duration,
    /// Lower bound of the random delay between two submissions.
    pub stagger_min: Duration,
    /// Upper bound of the random delay between two submissions.
    pub stagger_max: Duration,
    /// Lower bound of the random pause between two cycles.
    pub cycle_pause_min: Duration,
    /// Upper bound of the random pause between two cycles.
    pub cycle_pause_max: Duration,
}

impl Default for EngineTiming {
    fn default() -> Self {
        Self {
            batch_size: 10,
            empty_page_limit: 6,
            empty_page_retry: Duration::from_secs(1),
            stagger_min: Duration::from_millis(50),
            stagger_max: Duration::from_millis(200),
            cycle_pause_min: Duration::from_secs(1),
            cycle_pause_max: Duration::from_secs(2),
        }
    }
}

impl EngineTiming {
    /// Same thresholds, no waiting. Used by tests and dry runs.
    pub fn immediate() -> Self {
        Self {
            empty_page_retry: Duration::ZERO,
            stagger_min: Duration::ZERO,
            stagger_max: Duration::ZERO,
            cycle_pause_min: Duration::ZERO,
            cycle_pause_max: Duration::ZERO,
            ..Self::default()
        }
    }
}

/// Uniform random duration in `[min, max]`, millisecond resolution.
fn jitter(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let lo = min.as_millis() as u64;
    let hi = max.as_millis() as u64;
    Duration::from_millis(rand::rng().random_range(lo..=hi))
}

async fn pause(duration: Duration) {
    if !duration.is_zero() {
        tokio::time::sleep(duration).await;
    }
}

/// Mutable state carried across the cycles of one run.
#[derive(Debug, Default)]
struct RunState {
    empty_pages: u32,
    open: OpenReservations,
}

/// The first failure-class result of a flush, if any.
fn first_failure(results: Vec<DispatchResult>) -> Option<FailureReason> {
    results.into_iter().find_map(|result| match result.outcome {
        AcceptOutcome::Failed(reason) => Some(reason),
        _ => None,
    })
}

/// Runs matching loops. One instance is shared by every task of a process.
pub struct MatchingEngine {
    api: Arc<dyn FeedApi>,
    reservations: Arc<dyn ReservationStore>,
    settings: Arc<dyn SettingsStore>,
    reporter: Arc<dyn StatsReporter>,
    registry: Arc<TaskRegistry>,
    timing: EngineTiming,
}

impl MatchingEngine {
    /// Wires an engine to its collaborators.
    pub fn new(
        api: Arc<dyn FeedApi>,
        reservations: Arc<dyn ReservationStore>,
        settings: Arc<dyn SettingsStore>,
        reporter: Arc<dyn StatsReporter>,
        registry: Arc<TaskRegistry>,
        timing: EngineTiming,
    ) -> Self {
        Self {
            api,
            reservations,
            settings,
            reporter,
            registry,
            timing,
        }
    }

    /// # Run
    ///
    /// Drives one task until a terminal condition or cancellation and returns
    /// the reason it ended. Never fails: faults and panics become
    /// [`TerminalReason::Error`].
    ///
    /// On return the task's open reservations are released, the reporter has
    /// received exactly one terminal notification and the registry slot is
    /// free.
    pub async fn run(&self, handle: &TaskHandle, feed_url: &str) -> TerminalReason {
        let key = handle.key();
        tracing::info!(task_id = %handle.id(), task = %key, "matching started");

        let mut run = RunState::default();
        let reason = match AssertUnwindSafe(self.drive(handle, feed_url, &mut run))
            .catch_unwind()
            .await
        {
            Ok(reason) => reason,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                TerminalReason::Error(EngineFault::Panic(message).to_string())
            }
        };

        self.release_open(&run).await;

        let snapshot = handle.stats().snapshot().with_reason(&reason);
        match &reason {
            TerminalReason::Stopped => {
                tracing::info!(task_id = %handle.id(), task = %key, "matching stopped on request")
            }
            TerminalReason::Error(message) => {
                tracing::error!(task_id = %handle.id(), task = %key, error = %message, "matching failed")
            }
            other => {
                tracing::info!(task_id = %handle.id(), task = %key, reason = %other, "matching finished")
            }
        }
        if let Err(e) = self.reporter.on_terminal(&handle.view(), &reason, &snapshot).await {
            tracing::debug!(task_id = %handle.id(), error = %e, "terminal report not delivered");
        }

        self.registry.finish(handle);
        reason
    }

    async fn drive(&self, handle: &TaskHandle, feed_url: &str, run: &mut RunState) -> TerminalReason {
        let cancel = handle.cancel_token();
        loop {
            if cancel.is_cancelled() {
                return TerminalReason::Stopped;
            }
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => return TerminalReason::Stopped,
                step = self.iteration(handle, feed_url, run) => step,
            };
            match step {
                Ok(None) => continue,
                Ok(Some(reason)) => return reason,
                Err(fault) => return TerminalReason::Error(fault.to_string()),
            }
        }
    }

    /// One pass of the loop, pauses included. `Ok(None)` means keep going.
    async fn iteration(
        &self,
        handle: &TaskHandle,
        feed_url: &str,
        run: &mut RunState,
    ) -> Result<Option<TerminalReason>, EngineFault> {
        let key = handle.key();
        let config = FilterConfig::load(self.settings.as_ref(), &key.owner).await?;

        let reply = self.api.fetch_page(feed_url, &key.credential).await?;
        let page = classify_page(&reply);

        let candidates = match page {
            PageOutcome::AuthFailed => return Ok(Some(TerminalReason::TokenExpired)),
            PageOutcome::Empty => {
                run.empty_pages += 1;
                tracing::debug!(task_id = %handle.id(), streak = run.empty_pages, "empty feed page");
                if run.empty_pages >= self.timing.empty_page_limit {
                    return Ok(Some(TerminalReason::NoCandidatesFound));
                }
                pause(self.timing.empty_page_retry).await;
                return Ok(None);
            }
            PageOutcome::Candidates(candidates) => {
                run.empty_pages = 0;
                candidates
            }
        };

        if let Some(failure) = self.process_page(handle, &config, candidates, run).await? {
            return Ok(Some(failure.into()));
        }

        handle.stats().record_cycle();
        let snapshot = handle.stats().snapshot();
        if let Err(e) = self.reporter.on_cycle(&handle.view(), &snapshot).await {
            tracing::debug!(task_id = %handle.id(), error = %e, "cycle report not delivered");
        }

        pause(jitter(self.timing.cycle_pause_min, self.timing.cycle_pause_max)).await;
        Ok(None)
    }

    /// Filters, reserves and dispatches one page. Returns the failure that
    /// ended the page early, if any.
    async fn process_page(
        &self,
        handle: &TaskHandle,
        config: &FilterConfig,
        candidates: Vec<Candidate>,
        run: &mut RunState,
    ) -> Result<Option<FailureReason>, EngineFault> {
        let key = handle.key();
        let mut dispatcher = BatchDispatcher::new(
            Arc::clone(&self.api),
            Arc::clone(&self.reservations),
            Arc::clone(handle.stats()),
            run.open.clone(),
            &key.owner,
            &key.credential,
        );

        for candidate in candidates {
            if !config.passes(&candidate) {
                continue;
            }
            let reserved = if config.dedup_enabled {
                if !self.reservations.reserve(&candidate.external_id, &key.owner).await? {
                    continue;
                }
                true
            } else {
                false
            };

            dispatcher.submit(candidate.external_id, reserved);
            pause(jitter(self.timing.stagger_min, self.timing.stagger_max)).await;

            if dispatcher.pending() >= self.timing.batch_size {
                if let Some(failure) = first_failure(dispatcher.flush().await) {
                    return Ok(Some(failure));
                }
            }
        }

        Ok(first_failure(dispatcher.flush().await))
    }

    /// Releases what no accept call has claimed.
    async fn release_open(&self, run: &RunState) {
        for candidate_id in run.open.drain() {
            if let Err(e) = self.reservations.release(&candidate_id).await {
                tracing::warn!(candidate_id = %candidate_id, error = %e, "open reservation left for the sweeper");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::feed::ApiReply;
    use crate::core::filter::{self, FilterMode};
    use crate::core::model::TaskKey;
    use crate::core::registry::Registration;
    use crate::core::reporter::{ChannelReporter, ReportEvent};
    use crate::core::reservation::MemoryReservationStore;
    use crate::core::settings::MemorySettingsStore;
    use crate::core::error::FeedError;
    use crate::core::test_support::{page, FaultyLedger, ScriptedFeed};
    use tokio::sync::mpsc;

    struct Fixture {
        feed: Arc<ScriptedFeed>,
        store: Arc<MemoryReservationStore>,
        settings: Arc<MemorySettingsStore>,
        registry: Arc<TaskRegistry>,
        events: mpsc::UnboundedReceiver<ReportEvent>,
        engine: MatchingEngine,
    }

    fn fixture() -> Fixture {
        let feed = Arc::new(ScriptedFeed::default());
        let store = Arc::new(MemoryReservationStore::default());
        let settings = Arc::new(MemorySettingsStore::default());
        let registry = Arc::new(TaskRegistry::new());
        let (reporter, events) = ChannelReporter::new();
        let engine = MatchingEngine::new(
            feed.clone(),
            store.clone(),
            settings.clone(),
            Arc::new(reporter),
            Arc::clone(&registry),
            EngineTiming::immediate(),
        );
        Fixture {
            feed,
            store,
            settings,
            registry,
            events,
            engine,
        }
    }

    fn register(registry: &TaskRegistry) -> TaskHandle {
        registry.add_credential("owner-1", "token-1");
        match registry.try_register(TaskKey::new("owner-1", "token-1")) {
            Registration::New(handle) => handle,
            Registration::Existing(_) => panic!("fresh registry already had the task"),
        }
    }

    fn ids(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{}{}", prefix, i)).collect()
    }

    #[tokio::test]
    async fn six_empty_pages_end_the_run() {
        let mut fx = fixture();
        let handle = register(&fx.registry);

        let reason = fx.engine.run(&handle, "https://feed").await;

        assert_eq!(reason, TerminalReason::NoCandidatesFound);
        assert_eq!(fx.feed.fetches(), 6);
        match fx.events.recv().await {
            Some(ReportEvent::Terminal { reason, snapshot, .. }) => {
                assert_eq!(reason, TerminalReason::NoCandidatesFound);
                assert_eq!(snapshot.terminal_reason.as_deref(), Some("NO USERS FOUND"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn a_non_empty_page_resets_the_empty_streak() {
        let fx = fixture();
        for _ in 0..5 {
            fx.feed.push_page(Ok(ApiReply::new(200, r#"{"users":[]}"#)));
        }
        fx.feed.push_page(Ok(page(&["a"])));
        let handle = register(&fx.registry);

        let reason = fx.engine.run(&handle, "https://feed").await;

        // 5 empty + 1 full + 6 empty from the exhausted script.
        assert_eq!(reason, TerminalReason::NoCandidatesFound);
        assert_eq!(fx.feed.fetches(), 12);
        assert_eq!(handle.stats().snapshot().cycles_completed, 1);
        assert_eq!(fx.feed.answered(), ["a"]);
    }

    #[tokio::test]
    async fn auth_failure_on_fetch_ends_with_token_expired() {
        let fx = fixture();
        fx.feed.push_page(Ok(ApiReply::new(401, "")));
        let handle = register(&fx.registry);

        assert_eq!(fx.engine.run(&handle, "https://feed").await, TerminalReason::TokenExpired);
        assert!(fx.feed.answered().is_empty());
    }

    #[tokio::test]
    async fn limit_in_first_batch_stops_the_page() {
        let fx = fixture();
        let page_ids = ids("c", 15);
        let refs: Vec<&str> = page_ids.iter().map(String::as_str).collect();
        fx.feed.push_page(Ok(page(&refs)));
        fx.feed.answer_with("c6", Ok(ApiReply::new(429, "")));
        let handle = register(&fx.registry);

        let reason = fx.engine.run(&handle, "https://feed").await;

        assert_eq!(reason, TerminalReason::LimitExceeded);
        let mut answered = fx.feed.answered();
        answered.sort();
        assert_eq!(answered.len(), 10);
        assert!(!answered.contains(&"c10".to_string()));
        assert_eq!(handle.stats().snapshot().requests_sent, 10);
        assert_eq!(handle.stats().snapshot().cycles_completed, 0);
        // The rejected candidate was released, the other nine confirmed.
        assert!(fx.store.get("c6").unwrap().is_none());
        assert_eq!(fx.store.count_for_owner("owner-1").await.unwrap(), 9);
    }

    #[tokio::test]
    async fn filtered_and_already_seen_candidates_are_skipped() {
        let fx = fixture();
        let body = r#"{"users":[
            {"_id":"us","nationalityCode":"en-US"},
            {"_id":"fr","nationalityCode":"FR"},
            {"_id":"seen"},
            {"_id":"fresh"}
        ]}"#;
        fx.feed.push_page(Ok(ApiReply::new(200, body)));
        filter::add_countries(fx.settings.as_ref(), "owner-1", &["US".to_string()])
            .await
            .unwrap();
        fx.store.confirm("seen", "someone-else").await.unwrap();
        let handle = register(&fx.registry);

        fx.engine.run(&handle, "https://feed").await;

        let mut answered = fx.feed.answered();
        answered.sort();
        assert_eq!(answered, ["fr", "fresh"]);
    }

    #[tokio::test]
    async fn include_mode_and_disabled_dedup() {
        let fx = fixture();
        fx.feed.push_page(Ok(ApiReply::new(
            200,
            r#"{"users":[{"_id":"a","locale":"fr_FR"},{"_id":"b"},{"_id":"c","locale":"de"}]}"#,
        )));
        filter::set_mode(fx.settings.as_ref(), "owner-1", FilterMode::Include)
            .await
            .unwrap();
        filter::add_countries(fx.settings.as_ref(), "owner-1", &["fr".to_string(), "de".to_string()])
            .await
            .unwrap();
        filter::set_dedup(fx.settings.as_ref(), "owner-1", false).await.unwrap();
        fx.store.confirm("a", "owner-1").await.unwrap();
        let handle = register(&fx.registry);

        fx.engine.run(&handle, "https://feed").await;

        let mut answered = fx.feed.answered();
        answered.sort();
        assert_eq!(answered, ["a", "c"]);
    }

    #[tokio::test]
    async fn each_completed_cycle_is_reported() {
        let mut fx = fixture();
        fx.feed.push_page(Ok(page(&["a", "b"])));
        fx.feed.push_page(Ok(page(&["c"])));
        let handle = register(&fx.registry);

        fx.engine.run(&handle, "https://feed").await;

        let mut cycles = Vec::new();
        let mut terminals = 0;
        while let Ok(event) = fx.events.try_recv() {
            match event {
                ReportEvent::Cycle { snapshot, .. } => cycles.push(snapshot.cycles_completed),
                ReportEvent::Terminal { .. } => terminals += 1,
            }
        }
        assert_eq!(cycles, [1, 2]);
        assert_eq!(terminals, 1);
    }

    #[tokio::test]
    async fn store_failure_is_terminal_error() {
        let fx = fixture();
        fx.feed.push_page(Ok(page(&["a"])));
        let handle = register(&fx.registry);
        // Poison the ledger lock so every store call fails.
        let store = Arc::clone(&fx.store);
        let _ = std::thread::spawn(move || store.poison_for_tests()).join();

        let reason = fx.engine.run(&handle, "https://feed").await;
        assert!(matches!(reason, TerminalReason::Error(ref m) if m.contains("poisoned")));
    }

    #[tokio::test]
    async fn unreachable_feed_is_terminal_error() {
        let fx = fixture();
        fx.feed.push_page(Err(FeedError::Transport("connection refused".into())));
        let handle = register(&fx.registry);

        let reason = fx.engine.run(&handle, "https://feed").await;

        assert!(matches!(reason, TerminalReason::Error(ref m) if m.contains("connection refused")));
        assert_eq!(fx.feed.fetches(), 1);
        // Only accept calls count as errors.
        assert_eq!(handle.stats().snapshot().error_count, 0);
    }

    #[tokio::test]
    async fn confirm_failure_ends_the_run_with_error() {
        let feed = Arc::new(ScriptedFeed::default());
        feed.push_page(Ok(page(&["a", "b"])));
        let store = Arc::new(FaultyLedger::default());
        store.fail_confirm();
        let registry = Arc::new(TaskRegistry::new());
        let (reporter, _events) = ChannelReporter::new();
        let engine = MatchingEngine::new(
            feed.clone(),
            store.clone(),
            Arc::new(MemorySettingsStore::default()),
            Arc::new(reporter),
            Arc::clone(&registry),
            EngineTiming::immediate(),
        );
        let handle = register(&registry);

        let reason = engine.run(&handle, "https://feed").await;

        assert!(matches!(reason, TerminalReason::Error(ref m) if m.contains("confirm rejected")));
        assert_eq!(handle.stats().snapshot().cycles_completed, 0);
        // Neither candidate was confirmed.
        assert_eq!(store.inner().count_for_owner("owner-1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn teardown_keeps_reservations_claimed_by_others() {
        let fx = fixture();
        fx.feed.push_page(Ok(page(&["x", "slow"])));
        fx.feed.answer_with("x", Ok(ApiReply::new(500, "")));
        fx.feed.hold_answer("slow", Duration::from_secs(30));
        let handle = register(&fx.registry);
        let task_id = handle.id().clone();

        let registry = Arc::clone(&fx.registry);
        let store = Arc::clone(&fx.store);
        let feed = Arc::clone(&fx.feed);
        let stopper = tokio::spawn(async move {
            // "x" got its 500 and was released while "slow" is still in flight.
            while !(feed.answered().len() == 2 && store.get("x").unwrap().is_none()) {
                tokio::task::yield_now().await;
            }
            // A second engine claims "x" before this task is stopped.
            assert!(store.reserve("x", "owner-2").await.unwrap());
            registry.request_stop(&task_id)
        });

        let reason = fx.engine.run(&handle, "https://feed").await;
        stopper.await.unwrap();

        assert_eq!(reason, TerminalReason::Stopped);
        let foreign = fx.store.get("x").unwrap().expect("second engine's reservation");
        assert!(foreign.reserved);
        assert!(fx.store.get("slow").unwrap().is_none());
    }

    #[tokio::test]
    async fn cancellation_releases_open_reservations() {
        let mut fx = fixture();
        fx.feed.push_page(Ok(page(&["slow"])));
        fx.feed.hold_answers(Duration::from_secs(30));
        let handle = register(&fx.registry);
        let task_id = handle.id().clone();

        let registry = Arc::clone(&fx.registry);
        let store = Arc::clone(&fx.store);
        let stopper = tokio::spawn(async move {
            // Wait until the candidate is reserved and its call is in flight.
            while store.get("slow").unwrap().is_none() {
                tokio::task::yield_now().await;
            }
            registry.request_stop(&task_id)
        });

        let reason = fx.engine.run(&handle, "https://feed").await;
        stopper.await.unwrap();

        assert_eq!(reason, TerminalReason::Stopped);
        assert!(fx.store.get("slow").unwrap().is_none());
        match fx.events.recv().await {
            Some(ReportEvent::Terminal { reason, snapshot, .. }) => {
                assert_eq!(reason, TerminalReason::Stopped);
                assert_eq!(snapshot.requests_sent, 1);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn teardown_frees_the_registry_slot() {
        let fx = fixture();
        let handle = register(&fx.registry);
        assert_eq!(fx.registry.credentials("owner-1"), ["token-1"]);

        fx.engine.run(&handle, "https://feed").await;

        assert!(fx.registry.get(handle.id()).is_none());
        assert!(fx.registry.credentials("owner-1").is_empty());
        assert!(fx.registry.active_for_owner("owner-1").is_empty());
    }

    #[test]
    fn jitter_stays_in_range() {
        let min = Duration::from_millis(50);
        let max = Duration::from_millis(200);
        for _ in 0..100 {
            let d = jitter(min, max);
            assert!(d >= min && d <= max);
        }
        assert_eq!(jitter(Duration::ZERO, Duration::ZERO), Duration::ZERO);
    }
}
