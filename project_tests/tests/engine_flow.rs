use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

use lib_common::core::settings::FEED_URL_KEY;
use lib_common::core::{
    ChannelReporter, MatchService, MemoryReservationStore, MemorySettingsStore, ReportEvent,
    ReservationStore, SettingsStore, StatsSnapshot, filter,
};
use lib_common::{EngineTiming, TerminalReason};
use project_tests::{EXPIRED, MockFeed, client_for};

struct Harness {
    service: MatchService,
    events: UnboundedReceiver<ReportEvent>,
    ledger: Arc<MemoryReservationStore>,
    settings: Arc<MemorySettingsStore>,
}

async fn harness(feed: &MockFeed) -> Harness {
    let base = feed.serve().await;
    let ledger = Arc::new(MemoryReservationStore::default());
    let settings = Arc::new(MemorySettingsStore::default());
    // Plain http is fine for the local mock; the service API only takes https.
    settings
        .set_value(FEED_URL_KEY, &format!("{}/explore", base))
        .await
        .unwrap();
    let (reporter, events) = ChannelReporter::new();
    let service = MatchService::new(
        Arc::new(client_for(&base)),
        ledger.clone(),
        settings.clone(),
        Arc::new(reporter),
        EngineTiming::immediate(),
    );
    Harness {
        service,
        events,
        ledger,
        settings,
    }
}

async fn next_terminal(events: &mut UnboundedReceiver<ReportEvent>) -> (TerminalReason, StatsSnapshot) {
    let wait = async {
        while let Some(event) = events.recv().await {
            if let ReportEvent::Terminal { reason, snapshot, .. } = event {
                return (reason, snapshot);
            }
        }
        panic!("reporter closed without a terminal event");
    };
    tokio::time::timeout(Duration::from_secs(20), wait)
        .await
        .expect("engine did not finish in time")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn runs_until_the_feed_dries_up() {
    let feed = MockFeed::with_users(&["u1", "u2", "u3"], 1);
    let mut h = harness(&feed).await;

    h.service.submit_credential("owner-1", "good-token").await.unwrap();
    let (reason, snapshot) = next_terminal(&mut h.events).await;

    assert_eq!(reason, TerminalReason::NoCandidatesFound);
    assert_eq!(snapshot.requests_sent, 3);
    assert_eq!(snapshot.cycles_completed, 1);
    assert_eq!(feed.answered_ids(), ["u1", "u2", "u3"]);
    assert_eq!(h.ledger.count_for_owner("owner-1").await.unwrap(), 3);
    assert!(snapshot.render().ends_with("⚠️ NO USERS FOUND"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn owners_never_accept_the_same_candidate_twice() {
    let ids = ["u0", "u1", "u2", "u3", "u4"];
    let feed = MockFeed::with_users(&ids, 4);
    let mut h = harness(&feed).await;

    h.service.submit_credential("owner-a", "token-a").await.unwrap();
    h.service.submit_credential("owner-b", "token-b").await.unwrap();
    next_terminal(&mut h.events).await;
    next_terminal(&mut h.events).await;

    assert_eq!(feed.answered_ids(), ids);
    let a = h.ledger.count_for_owner("owner-a").await.unwrap();
    let b = h.ledger.count_for_owner("owner-b").await.unwrap();
    assert_eq!(a + b, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn limit_reply_ends_the_run_and_frees_the_candidate() {
    let feed = MockFeed::with_users(&["u0", "u1", "u2", "u3", "u4"], 1).limit_on("u2");
    let mut h = harness(&feed).await;

    h.service.submit_credential("owner-1", "good-token").await.unwrap();
    let (reason, snapshot) = next_terminal(&mut h.events).await;

    assert_eq!(reason, TerminalReason::LimitExceeded);
    assert_eq!(snapshot.cycles_completed, 0);
    assert!(h.ledger.get("u2").unwrap().is_none());
    assert_eq!(h.ledger.count_for_owner("owner-1").await.unwrap(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn expired_credential_stops_before_any_accept() {
    let feed = MockFeed::with_users(&["u1"], 1);
    let mut h = harness(&feed).await;

    h.service.submit_credential("owner-1", EXPIRED).await.unwrap();
    let (reason, _) = next_terminal(&mut h.events).await;

    assert_eq!(reason, TerminalReason::TokenExpired);
    assert!(feed.answered().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disabled_dedup_accepts_repeats() {
    let feed = MockFeed::with_users(&["u1", "u2"], 2);
    let mut h = harness(&feed).await;
    filter::set_dedup(h.settings.as_ref(), "owner-1", false).await.unwrap();

    h.service.submit_credential("owner-1", "good-token").await.unwrap();
    let (_, snapshot) = next_terminal(&mut h.events).await;

    assert_eq!(snapshot.requests_sent, 4);
    assert_eq!(feed.answered_ids(), ["u1", "u1", "u2", "u2"]);
    // Confirmations still land in the history.
    assert_eq!(h.ledger.count_for_owner("owner-1").await.unwrap(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_stops_running_engines() {
    // Enough pages to keep the engine busy until the stop arrives.
    let feed = MockFeed::with_users(&["u1"], 10_000);
    let mut h = harness(&feed).await;

    h.service.submit_credential("owner-1", "good-token").await.unwrap();
    h.service.shutdown().await;

    let (reason, _) = next_terminal(&mut h.events).await;
    assert_eq!(reason, TerminalReason::Stopped);
    assert_eq!(h.service.active_count(), 0);
}
