//! Article page download.

use super::{Fetch, default_headers};
use crate::models::{Page, PageStatus};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use url::{ParseError, Url};

/// HTTP client for article pages.
///
/// Never fails: connection problems, timeouts and malformed URLs come back
/// as a [`Page`] with no body and the matching [`PageStatus`].
#[derive(Debug, Clone)]
pub struct PageFetcher {
    client: Client,
}

impl PageFetcher {
    /// Build a fetcher with browser-like default headers.
    ///
    /// # Arguments
    ///
    /// * `timeout` - Limit for a whole request, body included
    ///
    /// # Returns
    ///
    /// The fetcher, or the `reqwest` error if the client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .default_headers(default_headers())
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    fn classify(error: &reqwest::Error) -> PageStatus {
        if error.is_timeout() {
            PageStatus::Timeout
        } else if error.is_builder() {
            PageStatus::MissingSchema
        } else {
            PageStatus::ConnectionError
        }
    }
}

impl Fetch for PageFetcher {
    #[instrument(level = "debug", skip(self))]
    async fn fetch(&self, url: &str) -> Page {
        if let Err(e) = Url::parse(url) {
            let status = match e {
                ParseError::RelativeUrlWithoutBase => PageStatus::MissingSchema,
                _ => PageStatus::UnknownError,
            };
            warn!(%url, error = %e, %status, "Refusing malformed URL");
            return Page::failed(url, status);
        }

        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) => {
                let status = Self::classify(&e);
                if status == PageStatus::Timeout {
                    warn!(%url, "Timeout for url");
                } else {
                    debug!(%url, error = %e, %status, "Request failed");
                }
                return Page::failed(url, status);
            }
        };

        let code = response.status().as_u16();
        let status = PageStatus::from_http(code);
        if status == PageStatus::UnknownError {
            debug!(%url, code, "Unmapped HTTP status");
        }
        let final_url = response.url().to_string();

        match response.text().await {
            Ok(body) => Page {
                url: final_url,
                body: Some(body),
                status,
            },
            Err(e) => {
                let status = if e.is_timeout() {
                    PageStatus::Timeout
                } else {
                    PageStatus::DecodingError
                };
                warn!(%url, error = %e, %status, "Failed reading response body");
                Page::failed(final_url, status)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher() -> PageFetcher {
        PageFetcher::new(Duration::from_millis(500)).unwrap()
    }

    #[tokio::test]
    async fn test_ok_page_keeps_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/some_path/article"))
            .and(header("x-xsrf-token", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>hi</html>"))
            .mount(&server)
            .await;

        let url = format!("{}/some_path/article", server.uri());
        let page = fetcher().fetch(&url).await;
        assert_eq!(page.status, PageStatus::Ok);
        assert_eq!(page.body.as_deref(), Some("<html>hi</html>"));
        assert_eq!(page.url, url);
    }

    #[tokio::test]
    async fn test_not_found_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let page = fetcher().fetch(&format!("{}/missing", server.uri())).await;
        assert_eq!(page.status, PageStatus::NotFound);
    }

    #[tokio::test]
    async fn test_forbidden_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/members-only"))
            .respond_with(ResponseTemplate::new(403).set_body_string("paywall"))
            .mount(&server)
            .await;

        let page = fetcher().fetch(&format!("{}/members-only", server.uri())).await;
        assert_eq!(page.status, PageStatus::Forbidden);
        assert!(!page.status.is_ok());
    }

    #[tokio::test]
    async fn test_unmapped_status_is_unknown_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(507).set_body_string("full"))
            .mount(&server)
            .await;

        let page = fetcher().fetch(&format!("{}/a", server.uri())).await;
        assert_eq!(page.status, PageStatus::UnknownError);
    }

    #[tokio::test]
    async fn test_missing_schema() {
        let page = fetcher().fetch("some_article.com/some_path/article").await;
        assert_eq!(page.status, PageStatus::MissingSchema);
        assert!(page.body.is_none());
    }

    #[tokio::test]
    async fn test_connection_error() {
        // Port 9 (discard) is essentially never listening locally.
        let page = fetcher().fetch("http://127.0.0.1:9/article").await;
        assert!(matches!(
            page.status,
            PageStatus::ConnectionError | PageStatus::Timeout
        ));
        assert!(page.body.is_none());
    }

    #[tokio::test]
    async fn test_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let page = fetcher().fetch(&format!("{}/slow", server.uri())).await;
        assert_eq!(page.status, PageStatus::Timeout);
    }
}
