//! Data models passed between the harvesting stages.
//!
//! - [`Page`]: a downloaded page (or the reason it could not be downloaded)
//! - [`Article`]: the structured record extracted from a page
//! - [`ParsedArticle`]: the parse outcome handed to the persistence stage
//! - [`PageStatus`]: the outcome code carried through every stage

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of downloading and parsing one article URL.
///
/// Network failures are encoded here rather than raised, so a bad URL
/// travels through the pipeline as data and is discarded at persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PageStatus {
    Ok,
    MissingSchema,
    ConnectionError,
    Timeout,
    DecodingError,
    TooShort,
    NotFound,
    Forbidden,
    UnknownError,
}

impl PageStatus {
    /// Map an HTTP status code to the statuses tracked by the pipeline.
    pub fn from_http(code: u16) -> Self {
        match code {
            200 => PageStatus::Ok,
            403 => PageStatus::Forbidden,
            404 => PageStatus::NotFound,
            _ => PageStatus::UnknownError,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, PageStatus::Ok)
    }
}

impl fmt::Display for PageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PageStatus::Ok => "OK",
            PageStatus::MissingSchema => "MISSING_SCHEMA",
            PageStatus::ConnectionError => "CONNECTION_ERROR",
            PageStatus::Timeout => "TIMEOUT",
            PageStatus::DecodingError => "DECODING_ERROR",
            PageStatus::TooShort => "TOO_SHORT",
            PageStatus::NotFound => "NOT_FOUND",
            PageStatus::Forbidden => "FORBIDDEN",
            PageStatus::UnknownError => "UNKNOWN_ERROR",
        };
        f.write_str(name)
    }
}

/// A downloaded article page.
#[derive(Clone, PartialEq, Eq)]
pub struct Page {
    /// Final URL after redirects, or the requested URL on failure.
    pub url: String,
    /// Response body; `None` when no response was received.
    pub body: Option<String>,
    pub status: PageStatus,
}

impl Page {
    pub fn failed(url: impl Into<String>, status: PageStatus) -> Self {
        Self {
            url: url.into(),
            body: None,
            status,
        }
    }
}

// Bodies are large; logs only need their size.
impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("url", &self.url)
            .field("body_bytes", &self.body.as_ref().map(String::len))
            .field("status", &self.status)
            .finish()
    }
}

/// A structured article record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
    /// Site-assigned article identifier; also the on-disk file stem.
    pub id: String,
    /// Canonical URL without query string.
    pub url: String,
    pub title: Option<String>,
    pub author: Option<String>,
    pub paragraphs: Vec<String>,
    /// Estimated reading time, when the page states one.
    pub duration_minutes: Option<u32>,
}

/// What the parse stage emits for each page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedArticle {
    pub url: String,
    pub article: Option<Article>,
    pub status: PageStatus,
}

impl ParsedArticle {
    pub fn accepted(article: Article) -> Self {
        Self {
            url: article.url.clone(),
            article: Some(article),
            status: PageStatus::Ok,
        }
    }

    pub fn rejected(url: impl Into<String>, status: PageStatus) -> Self {
        Self {
            url: url.into(),
            article: None,
            status,
        }
    }
}
