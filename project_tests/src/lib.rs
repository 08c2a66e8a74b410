//! # Project Tests
//!
//! End-to-end tests of `lib_common` live in `tests/`. This library holds what
//! they share: a local stand-in for the candidate feed.
//!
//! `GET /explore` serves the configured page to every valid credential until
//! `page_budget` pages have been handed out, then empty pages. `GET /answer`
//! records who accepted whom and replies `429` for the configured limit id.

use axum::Router;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use lib_common::retrieve::{HttpFeedApi, HttpFeedConfig};

pub const CREDENTIAL_HEADER: &str = "meeff-access-token";
pub const EXPIRED: &str = "expired-token";

#[derive(Default)]
pub struct MockState {
    pub users: Vec<serde_json::Value>,
    pub page_budget: usize,
    pub pages_served: usize,
    pub limit_id: Option<String>,
    /// (credential, candidate id) per accept call.
    pub answered: Vec<(String, String)>,
    pub user_agents: Vec<String>,
}

#[derive(Clone, Default)]
pub struct MockFeed {
    pub state: Arc<Mutex<MockState>>,
}

impl MockFeed {
    pub fn with_users(ids: &[&str], page_budget: usize) -> Self {
        let feed = MockFeed::default();
        {
            let mut state = feed.state.lock().unwrap();
            state.users = ids.iter().map(|id| json!({ "_id": id })).collect();
            state.page_budget = page_budget;
        }
        feed
    }

    pub fn limit_on(self, id: &str) -> Self {
        self.state.lock().unwrap().limit_id = Some(id.to_string());
        self
    }

    pub fn answered(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().answered.clone()
    }

    pub fn answered_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.answered().into_iter().map(|(_, id)| id).collect();
        ids.sort();
        ids
    }

    /// Serves the mock on an ephemeral port and returns its base URL.
    pub async fn serve(&self) -> String {
        let app = Router::new()
            .route("/explore", get(explore))
            .route("/answer", get(answer))
            .with_state(self.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }
}

fn credential(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CREDENTIAL_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn explore(State(feed): State<MockFeed>, headers: HeaderMap) -> (StatusCode, String) {
    let mut state = feed.state.lock().unwrap();
    if let Some(ua) = headers.get("user-agent").and_then(|v| v.to_str().ok()) {
        state.user_agents.push(ua.to_string());
    }
    match credential(&headers).as_deref() {
        None | Some(EXPIRED) => {
            return (
                StatusCode::UNAUTHORIZED,
                json!({ "errorCode": "AuthRequired" }).to_string(),
            );
        }
        Some(_) => {}
    }
    if state.pages_served < state.page_budget {
        state.pages_served += 1;
        (StatusCode::OK, json!({ "users": state.users }).to_string())
    } else {
        (StatusCode::OK, json!({ "users": [] }).to_string())
    }
}

async fn answer(
    State(feed): State<MockFeed>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, String) {
    let Some(credential) = credential(&headers) else {
        return (StatusCode::UNAUTHORIZED, String::new());
    };
    let id = params.get("userId").cloned().unwrap_or_default();
    let mut state = feed.state.lock().unwrap();
    state.answered.push((credential, id.clone()));
    if state.limit_id.as_deref() == Some(id.as_str()) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            json!({ "errorCode": "LikeExceeded" }).to_string(),
        );
    }
    (StatusCode::OK, "{}".to_string())
}

/// A client pointed at the mock's answer endpoint.
pub fn client_for(base: &str) -> HttpFeedApi {
    HttpFeedApi::new(HttpFeedConfig {
        answer_url_template: format!("{}/answer?userId={{user_id}}&isOkay=1", base),
        ..HttpFeedConfig::default()
    })
    .unwrap()
}
