//! # Data Retrieval Module
//!
//! HTTP clients for the external services the matcher talks to.
//!
//! ## Contained Modules:
//!
//! - **`feed_http`**: the reqwest implementation of
//!   [`crate::core::FeedApi`]. It fetches feed pages from the owner-supplied
//!   URL and sends accept calls, returning raw status and body so that
//!   classification stays in the core.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// reqwest-backed feed API client.
pub mod feed_http;

pub use feed_http::{HttpFeedApi, HttpFeedConfig};
