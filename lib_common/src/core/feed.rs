//! # Feed API Seam
//!
//! The engine only ever issues two kinds of calls: fetch one feed page and
//! send one accept action. Both are modelled as raw status + body replies so
//! that classification lives in the core and not in the transport.

use async_trait::async_trait;
use serde_json::Value;

use crate::core::error::FeedError;
use crate::core::model::Candidate;

/// Body marker the feed uses for a rejected credential.
pub const AUTH_MARKER: &str = "AuthRequired";
/// Body marker the feed uses once the daily accept quota is spent.
pub const LIMIT_MARKER: &str = "LikeExceeded";

/// Raw outcome of one HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiReply {
    /// Numeric HTTP status.
    pub status: u16,
    /// Response body as text. Empty when the body could not be read.
    pub body: String,
}

impl ApiReply {
    /// Convenience constructor.
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// Transport for the candidate feed.
#[async_trait]
pub trait FeedApi: Send + Sync {
    /// GET one page of candidates from `feed_url`.
    async fn fetch_page(&self, feed_url: &str, credential: &str) -> Result<ApiReply, FeedError>;

    /// Send the accept action for one candidate.
    async fn answer(&self, candidate_id: &str, credential: &str) -> Result<ApiReply, FeedError>;
}

/// What a feed page reply means to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOutcome {
    /// The credential was rejected.
    AuthFailed,
    /// Nothing usable on the page (including undecodable bodies).
    Empty,
    /// Usable candidates in page order.
    Candidates(Vec<Candidate>),
}

/// Classifies a feed page reply.
///
/// A 401, or any non-200 reply carrying [`AUTH_MARKER`], ends the run. Every
/// other non-200 or non-JSON reply is an empty page. Entries without a string
/// `_id` are dropped.
pub fn classify_page(reply: &ApiReply) -> PageOutcome {
    if reply.status == 401 || (reply.status != 200 && reply.body.contains(AUTH_MARKER)) {
        return PageOutcome::AuthFailed;
    }
    if reply.status != 200 {
        return PageOutcome::Empty;
    }

    let Ok(doc) = serde_json::from_str::<Value>(&reply.body) else {
        return PageOutcome::Empty;
    };
    let Some(users) = doc.get("users").and_then(Value::as_array) else {
        return PageOutcome::Empty;
    };

    let candidates: Vec<Candidate> = users.iter().filter_map(candidate_from_json).collect();
    if candidates.is_empty() {
        PageOutcome::Empty
    } else {
        PageOutcome::Candidates(candidates)
    }
}

fn candidate_from_json(user: &Value) -> Option<Candidate> {
    let external_id = user.get("_id").and_then(Value::as_str)?.trim();
    if external_id.is_empty() {
        return None;
    }
    let country_hint = ["nationalityCode", "locale"]
        .iter()
        .filter_map(|field| user.get(*field).and_then(Value::as_str))
        .map(str::trim)
        .find(|hint| !hint.is_empty())
        .map(str::to_string);

    Some(Candidate {
        external_id: external_id.to_string(),
        country_hint,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_failure_on_401_or_marked_error() {
        assert_eq!(classify_page(&ApiReply::new(401, "")), PageOutcome::AuthFailed);
        assert_eq!(
            classify_page(&ApiReply::new(403, r#"{"errorCode":"AuthRequired"}"#)),
            PageOutcome::AuthFailed
        );
    }

    #[test]
    fn undecodable_replies_are_empty_pages() {
        assert_eq!(classify_page(&ApiReply::new(500, "oops")), PageOutcome::Empty);
        assert_eq!(classify_page(&ApiReply::new(200, "<html>")), PageOutcome::Empty);
        assert_eq!(classify_page(&ApiReply::new(200, r#"{"users":[]}"#)), PageOutcome::Empty);
        assert_eq!(classify_page(&ApiReply::new(200, r#"{"other":1}"#)), PageOutcome::Empty);
    }

    #[test]
    fn keeps_page_order_and_drops_entries_without_id() {
        let body = r#"{"users":[
            {"_id":"a","nationalityCode":"fr"},
            {"name":"no id"},
            {"_id":""},
            {"_id":"b","locale":"en-US"},
            {"_id":"c","nationalityCode":"","locale":"de_DE"},
            {"_id":"d"}
        ]}"#;
        let PageOutcome::Candidates(list) = classify_page(&ApiReply::new(200, body)) else {
            panic!("expected candidates");
        };
        let ids: Vec<&str> = list.iter().map(|c| c.external_id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c", "d"]);
        assert_eq!(list[0].country_hint.as_deref(), Some("fr"));
        assert_eq!(list[1].country_hint.as_deref(), Some("en-US"));
        assert_eq!(list[2].country_hint.as_deref(), Some("de_DE"));
        assert_eq!(list[3].country_hint, None);
    }
}
