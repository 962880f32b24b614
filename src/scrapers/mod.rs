//! Collaborators that talk to the content site.
//!
//! The pipeline engine only sees these through two traits:
//!
//! | Trait | Used by | Default implementation |
//! |-------|---------|------------------------|
//! | [`Discovery`] | Discover stage | [`archive::ArchiveSearcher`] |
//! | [`Fetch`] | Download stage | [`fetch::PageFetcher`] |
//!
//! Parsing needs no network access and lives in [`medium`].
//!
//! Neither trait returns errors: expected network failures degrade to empty
//! URL lists or to a [`Page`](crate::models::Page) whose status records what
//! went wrong.

use crate::models::Page;
use std::future::Future;

pub mod archive;
pub mod fetch;
pub mod medium;

/// Source of candidate article URLs.
pub trait Discovery: Send + Sync + 'static {
    /// Fetch the next `num_batches` batches of URLs. May be empty.
    fn next_batches(&self, num_batches: usize) -> impl Future<Output = Vec<String>> + Send;

    /// `true` once there is nothing left to discover.
    fn is_exhausted(&self) -> bool {
        false
    }
}

/// Downloads one page.
pub trait Fetch: Send + Sync + 'static {
    fn fetch(&self, url: &str) -> impl Future<Output = Page> + Send;
}

/// Browser-like headers sent with every request.
pub(crate) fn default_headers() -> reqwest::header::HeaderMap {
    use reqwest::header::{ACCEPT, HeaderMap, HeaderName, HeaderValue, USER_AGENT};

    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT,
        HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml,application/json",
        ),
    );
    headers.insert(
        USER_AGENT,
        HeaderValue::from_static(
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
             (KHTML, like Gecko) Chrome/90.0.4430.85 Safari/537.36",
        ),
    );
    headers.insert(
        HeaderName::from_static("sec-fetch-site"),
        HeaderValue::from_static("same-origin"),
    );
    headers.insert(
        HeaderName::from_static("sec-fetch-mode"),
        HeaderValue::from_static("cors"),
    );
    headers.insert(
        HeaderName::from_static("x-xsrf-token"),
        HeaderValue::from_static("1"),
    );
    headers
}
