//! Date-windowed URL discovery over a tag archive.
//!
//! The archive lists the articles published under a tag on a given day at
//! `{base}/tag/{tag}/archive/{YYYY}/{MM}/{DD}`. The searcher walks backwards
//! one day at a time starting from the day before `today`, so every call to
//! [`ArchiveSearcher::next_batches`] covers days no earlier call has seen.
//!
//! # Selectors
//!
//! Each article in `div.js-postStream` is a `div.streamItem`; its link is
//! the first `a[href]` inside the class-less "read more" block.

use super::{Discovery, default_headers};
use crate::utils::remove_query_parameters;
use chrono::{Days, NaiveDate};
use futures::stream::{self, StreamExt};
use itertools::Itertools;
use once_cell::sync::Lazy;
use reqwest::{Client, StatusCode};
use scraper::{Html, Selector};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use url::Url;

static STREAM_ITEM: Lazy<Selector> =
    Lazy::new(|| Selector::parse("div.js-postStream div.streamItem").unwrap());
static READ_MORE_LINK: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"div[class=""] a[href]"#).unwrap());

/// Settings for [`ArchiveSearcher`].
#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    pub base_url: Url,
    pub tag: String,
    /// Upper bound on days downloaded at the same time.
    pub max_concurrency: usize,
    pub request_timeout: Duration,
    /// Earliest day worth querying; `None` walks back forever.
    pub oldest_date: Option<NaiveDate>,
}

#[derive(Debug)]
pub struct ArchiveSearcher {
    client: Client,
    options: ArchiveOptions,
    /// Day the next batch counts back from (exclusive).
    query_date: Mutex<NaiveDate>,
}

impl ArchiveSearcher {
    /// Build a searcher that walks the archive back from `today`.
    ///
    /// # Arguments
    ///
    /// * `options` - Site, tag, concurrency and date limit of the walk
    /// * `today` - The first batch covers the days before this date
    ///
    /// # Returns
    ///
    /// The searcher, or the `reqwest` error if the client cannot be built.
    pub fn new(options: ArchiveOptions, today: NaiveDate) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .default_headers(default_headers())
            .timeout(options.request_timeout)
            .build()?;
        Ok(Self {
            client,
            options,
            query_date: Mutex::new(today),
        })
    }

    pub fn query_date(&self) -> NaiveDate {
        *self.query_date.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn archive_url(&self, day: NaiveDate) -> String {
        format!(
            "{}/tag/{}/archive/{}",
            self.options.base_url.as_str().trim_end_matches('/'),
            urlencoding::encode(&self.options.tag),
            day.format("%Y/%m/%d")
        )
    }

    /// Claim the next `n` days, newest first, and move the window past them.
    fn claim_days(&self, n: usize) -> Vec<NaiveDate> {
        let mut query_date = self.query_date.lock().unwrap_or_else(|e| e.into_inner());
        let mut days = Vec::with_capacity(n);
        for _ in 0..n {
            let Some(day) = query_date.checked_sub_days(Days::new(1)) else {
                break;
            };
            if self.options.oldest_date.is_some_and(|oldest| day < oldest) {
                break;
            }
            days.push(day);
            *query_date = day;
        }
        days
    }

    /// Article URLs published on one day. Failures degrade to an empty list.
    #[instrument(level = "info", skip(self), fields(%day))]
    pub async fn articles_for_day(&self, day: NaiveDate) -> Vec<String> {
        let url = self.archive_url(day);
        info!(%url, "Get urls from day");

        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                warn!(%url, "Timeout when getting articles for the day");
                return Vec::new();
            }
            Err(e) => {
                warn!(%url, error = %e, "Archive request failed");
                return Vec::new();
            }
        };

        if response.status() != StatusCode::OK {
            warn!(%url, status = %response.status(), "Archive returned a non-OK status");
            return Vec::new();
        }

        match response.text().await {
            Ok(html) => self.article_urls_from_archive_page(&html),
            Err(e) => {
                warn!(%url, error = %e, "Failed reading archive page");
                Vec::new()
            }
        }
    }

    /// Extract article links from an archive page, without query strings.
    pub fn article_urls_from_archive_page(&self, html: &str) -> Vec<String> {
        let document = Html::parse_document(html);
        let urls: Vec<String> = document
            .select(&STREAM_ITEM)
            .filter_map(|item| item.select(&READ_MORE_LINK).next())
            .filter_map(|link| link.value().attr("href"))
            .filter_map(|href| self.options.base_url.join(href).ok())
            .map(|resolved| remove_query_parameters(resolved.as_str()))
            .collect();
        debug!(count = urls.len(), "Parsed archive page");
        urls
    }
}

impl Discovery for ArchiveSearcher {
    #[instrument(level = "info", skip(self))]
    async fn next_batches(&self, num_batches: usize) -> Vec<String> {
        let days = self.claim_days(num_batches);
        if days.is_empty() {
            return Vec::new();
        }
        let concurrency = self.options.max_concurrency.clamp(1, days.len());

        let batches: Vec<Vec<String>> = stream::iter(days)
            .map(|day| self.articles_for_day(day))
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let urls: Vec<String> = batches.into_iter().flatten().unique().collect();
        info!(count = urls.len(), "Discovered article URLs");
        urls
    }

    fn is_exhausted(&self) -> bool {
        let query_date = self.query_date();
        match (self.options.oldest_date, query_date.checked_sub_days(Days::new(1))) {
            (Some(oldest), Some(next)) => next < oldest,
            (_, None) => true,
            (None, Some(_)) => false,
        }
    }
}
