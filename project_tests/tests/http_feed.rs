use lib_common::core::{FeedApi, FeedError, PageOutcome, feed::classify_page};
use lib_common::retrieve::{HttpFeedApi, HttpFeedConfig};
use project_tests::{EXPIRED, MockFeed, client_for};

#[tokio::test]
async fn fetches_a_page_with_the_credential_header() {
    let feed = MockFeed::with_users(&["u1", "u2"], 1);
    let base = feed.serve().await;
    let api = client_for(&base);

    let reply = api.fetch_page(&format!("{}/explore", base), "good-token").await.unwrap();
    assert_eq!(reply.status, 200);
    match classify_page(&reply) {
        PageOutcome::Candidates(candidates) => {
            let ids: Vec<&str> = candidates.iter().map(|c| c.external_id.as_str()).collect();
            assert_eq!(ids, ["u1", "u2"]);
        }
        other => panic!("unexpected page {:?}", other),
    }

    let agents = feed.state.lock().unwrap().user_agents.clone();
    assert!(agents[0].starts_with("okhttp/"));
}

#[tokio::test]
async fn expired_credentials_classify_as_auth_failure() {
    let feed = MockFeed::with_users(&["u1"], 1);
    let base = feed.serve().await;
    let api = client_for(&base);

    let reply = api.fetch_page(&format!("{}/explore", base), EXPIRED).await.unwrap();
    assert_eq!(reply.status, 401);
    assert_eq!(classify_page(&reply), PageOutcome::AuthFailed);
}

#[tokio::test]
async fn answers_carry_the_encoded_candidate_id() {
    let feed = MockFeed::with_users(&[], 0).limit_on("over&out");
    let base = feed.serve().await;
    let api = client_for(&base);

    let ok = api.answer("64f0 a", "good-token").await.unwrap();
    assert_eq!(ok.status, 200);
    let limited = api.answer("over&out", "good-token").await.unwrap();
    assert_eq!(limited.status, 429);
    assert!(limited.body.contains("LikeExceeded"));

    assert_eq!(
        feed.answered(),
        [
            ("good-token".to_string(), "64f0 a".to_string()),
            ("good-token".to_string(), "over&out".to_string()),
        ]
    );
}

#[tokio::test]
async fn unreachable_feed_is_a_transport_error() {
    // Bind and drop a listener to get a port nobody listens on.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let api = HttpFeedApi::new(HttpFeedConfig::default()).unwrap();
    let err = api
        .fetch_page(&format!("http://{}/explore", addr), "good-token")
        .await
        .unwrap_err();
    assert!(matches!(err, FeedError::Transport(_)));
}
