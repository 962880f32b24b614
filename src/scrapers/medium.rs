//! Article page parsing.
//!
//! Pages come in two forms. The JSON form (served for `?format=json`) is a
//! `{"payload": …}` document behind an anti-hijacking prefix such as
//! `])}while(1);</x>`; anything else is treated as HTML.
//!
//! # HTML fields
//!
//! | Field | Source |
//! |-------|--------|
//! | id | `meta[name=parsely-post-id]`, else the last `-` segment of `meta[property=og:url]` |
//! | title | `meta[name=title]` |
//! | author | `meta[name=author]` |
//! | reading time | first "N min read" in the page text |
//! | paragraphs | text of `p, li, h1..h4` inside `article` |

use crate::models::{Article, Page, PageStatus, ParsedArticle};
use crate::utils::remove_query_parameters;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

static MIN_READ: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d+)\s+min read").unwrap());
static META_POST_ID: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"meta[name="parsely-post-id"]"#).unwrap());
static META_OG_URL: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"meta[property="og:url"]"#).unwrap());
static META_TITLE: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"meta[name="title"]"#).unwrap());
static META_AUTHOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"meta[name="author"]"#).unwrap());
static ARTICLE: Lazy<Selector> = Lazy::new(|| Selector::parse("article").unwrap());
static BODY_ELEMENTS: Lazy<Selector> =
    Lazy::new(|| Selector::parse("p, li, h1, h2, h3, h4").unwrap());

#[derive(Debug, Error, PartialEq, Eq)]
enum ExtractError {
    #[error("missing {0}")]
    Missing(&'static str),
}

/// Fields pulled out of a page, before acceptance rules are applied.
#[derive(Debug, PartialEq, Eq)]
struct Extracted {
    id: String,
    title: String,
    author: String,
    paragraphs: Vec<String>,
    duration_minutes: Option<u32>,
}

/// Turns downloaded pages into article records.
#[derive(Debug, Clone, Copy)]
pub struct ArticleParser {
    minimum_duration_minutes: u32,
    lenient: bool,
}

impl ArticleParser {
    /// `lenient` accepts pages whose reading time cannot be found.
    pub fn new(minimum_duration_minutes: u32, lenient: bool) -> Self {
        Self {
            minimum_duration_minutes,
            lenient,
        }
    }

    /// Extract an article from a downloaded page.
    ///
    /// # Arguments
    ///
    /// * `page` - A fetched page; failed pages pass through unchanged
    ///
    /// # Returns
    ///
    /// A [`ParsedArticle`] that carries the article only when its status is
    /// `Ok`. Undecodable pages become `DecodingError`; pages under the
    /// minimum reading time become `TooShort`.
    pub fn parse(&self, page: Page) -> ParsedArticle {
        if !page.status.is_ok() {
            return ParsedArticle::rejected(page.url, page.status);
        }
        let url = remove_query_parameters(&page.url);
        let Some(body) = page.body else {
            return ParsedArticle::rejected(url, PageStatus::DecodingError);
        };

        let extracted = match json_payload(&body) {
            Some(payload) => extract_json(&payload),
            None => extract_html(&body),
        };
        let extracted = match extracted {
            Ok(extracted) => extracted,
            Err(e) => {
                debug!(%url, error = %e, "Could not decode article page");
                return ParsedArticle::rejected(url, PageStatus::DecodingError);
            }
        };

        match extracted.duration_minutes {
            Some(minutes) if minutes < self.minimum_duration_minutes => {
                debug!(%url, minutes, "Article too short");
                return ParsedArticle::rejected(url, PageStatus::TooShort);
            }
            None if !self.lenient => {
                debug!(%url, "Article has no reading time");
                return ParsedArticle::rejected(url, PageStatus::DecodingError);
            }
            _ => {}
        }

        ParsedArticle::accepted(Article {
            id: extracted.id,
            url,
            title: Some(extracted.title),
            author: Some(extracted.author),
            paragraphs: extracted.paragraphs,
            duration_minutes: extracted.duration_minutes,
        })
    }
}

/// The JSON document following the first `{`, if it carries a payload.
fn json_payload(body: &str) -> Option<Value> {
    let start = body.find('{')?;
    let value: Value = serde_json::from_str(&body[start..]).ok()?;
    value.get("payload").is_some().then_some(value)
}

fn extract_json(document: &Value) -> Result<Extracted, ExtractError> {
    let payload = &document["payload"];
    let value = &payload["value"];

    let id = value["id"].as_str().ok_or(ExtractError::Missing("id"))?;
    let title = value["title"].as_str().ok_or(ExtractError::Missing("title"))?;
    let creator = value["creatorId"]
        .as_str()
        .ok_or(ExtractError::Missing("creatorId"))?;
    let author = payload["references"]["User"][creator]["name"]
        .as_str()
        .ok_or(ExtractError::Missing("author"))?;
    let paragraphs = value["content"]["bodyModel"]["paragraphs"]
        .as_array()
        .ok_or(ExtractError::Missing("paragraphs"))?
        .iter()
        .filter(|p| is_truthy(&p["type"]))
        .filter_map(|p| p["text"].as_str().map(str::to_string))
        .collect();
    let duration_minutes = value["virtuals"]["readingTime"]
        .as_f64()
        .map(|minutes| minutes.ceil() as u32);

    Ok(Extracted {
        id: id.to_string(),
        title: title.to_string(),
        author: author.to_string(),
        paragraphs,
        duration_minutes,
    })
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn meta_content(document: &Html, selector: &Selector) -> Option<String> {
    document
        .select(selector)
        .next()
        .and_then(|meta| meta.value().attr("content"))
        .map(str::to_string)
}

fn extract_html(html: &str) -> Result<Extracted, ExtractError> {
    let document = Html::parse_document(html);

    let id = meta_content(&document, &META_POST_ID)
        .or_else(|| {
            meta_content(&document, &META_OG_URL)
                .and_then(|url| url.rsplit('-').next().map(str::to_string))
        })
        .filter(|id| !id.is_empty())
        .ok_or(ExtractError::Missing("id"))?;
    let title = meta_content(&document, &META_TITLE).ok_or(ExtractError::Missing("title"))?;
    let author = meta_content(&document, &META_AUTHOR).ok_or(ExtractError::Missing("author"))?;

    let article = document
        .select(&ARTICLE)
        .next()
        .ok_or(ExtractError::Missing("article"))?;
    let paragraphs = article
        .select(&BODY_ELEMENTS)
        .map(|element| element.text().collect::<String>())
        .collect();

    // Text nodes are kept apart so digits from neighbouring elements never merge.
    let text = document.root_element().text().collect::<Vec<_>>().join(" ");
    let duration_minutes = MIN_READ
        .captures(&text)
        .and_then(|caps| caps[1].parse().ok());

    Ok(Extracted {
        id,
        title,
        author,
        paragraphs,
        duration_minutes,
    })
}

#[cfg(test)]
pub(crate) mod fixtures {
    /// A minimal article page in the HTML form.
    pub fn article_html(id: &str, minutes: u32) -> String {
        format!(
            r#"<!DOCTYPE html>
<html><head>
  <meta name="title" content="SEO Secrets: Reverse-Engineering Google’s Algorithm">
  <meta name="author" content="benjamin bannister">
  <meta name="parsely-post-id" content="{id}">
  <meta property="og:url" content="https://medium.com/@ben/seo-secrets-{id}">
</head><body>
  <span>{minutes} min read</span>
  <article>
    <h1>SEO Secrets: Reverse-Engineering Google’s Algorithm</h1>
    <p>First paragraph with <a href="/x">a link</a>.</p>
    <ul><li>A list item</li></ul>
  </article>
</body></html>"#
        )
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::article_html;
    use super::*;

    fn ok_page(body: String) -> Page {
        Page {
            url: "https://medium.com/@ben/seo-secrets-1a2b3c?source=tag_archive".to_string(),
            body: Some(body),
            status: PageStatus::Ok,
        }
    }

    #[test]
    fn test_parse_html_article() {
        let parsed = ArticleParser::new(5, false).parse(ok_page(article_html("1a2b3c", 7)));

        assert_eq!(parsed.status, PageStatus::Ok);
        let article = parsed.article.unwrap();
        assert_eq!(article.id, "1a2b3c");
        assert_eq!(article.url, "https://medium.com/@ben/seo-secrets-1a2b3c");
        assert_eq!(
            article.title.as_deref(),
            Some("SEO Secrets: Reverse-Engineering Google’s Algorithm")
        );
        assert_eq!(article.author.as_deref(), Some("benjamin bannister"));
        assert_eq!(article.duration_minutes, Some(7));
        assert_eq!(
            article.paragraphs,
            vec![
                "SEO Secrets: Reverse-Engineering Google’s Algorithm",
                "First paragraph with a link.",
                "A list item",
            ]
        );
    }

    #[test]
    fn test_id_falls_back_to_og_url() {
        let html = article_html("ignored", 7).replace(
            r#"<meta name="parsely-post-id" content="ignored">"#,
            "",
        );
        let parsed = ArticleParser::new(5, false).parse(ok_page(html));
        assert_eq!(parsed.article.unwrap().id, "ignored");
    }

    #[test]
    fn test_too_short_article_is_rejected() {
        let parsed = ArticleParser::new(30, false).parse(ok_page(article_html("abc", 7)));
        assert_eq!(parsed.status, PageStatus::TooShort);
        assert!(parsed.article.is_none());
    }

    #[test]
    fn test_missing_reading_time_depends_on_leniency() {
        let html = article_html("abc", 7).replace("7 min read", "");
        let strict = ArticleParser::new(5, false).parse(ok_page(html.clone()));
        assert_eq!(strict.status, PageStatus::DecodingError);

        let lenient = ArticleParser::new(5, true).parse(ok_page(html));
        assert_eq!(lenient.status, PageStatus::Ok);
        assert_eq!(lenient.article.unwrap().duration_minutes, None);
    }

    #[test]
    fn test_reading_time_ignores_numbers_in_neighbouring_elements() {
        let html = article_html("abc", 7).replace(
            "<span>7 min read</span>",
            "<h2>Top 10</h2><span>3 min read</span>",
        );
        let parsed = ArticleParser::new(5, false).parse(ok_page(html));
        assert_eq!(parsed.status, PageStatus::TooShort);

        let html = article_html("abc", 7)
            .replace("<span>7 min read</span>", "<b>12</b><i>4 min read</i>");
        let parsed = ArticleParser::new(1, false).parse(ok_page(html));
        assert_eq!(parsed.article.unwrap().duration_minutes, Some(4));
    }

    #[test]
    fn test_missing_title_is_decoding_error() {
        let html = article_html("abc", 7).replace(r#"name="title""#, r#"name="other""#);
        let parsed = ArticleParser::new(5, false).parse(ok_page(html));
        assert_eq!(parsed.status, PageStatus::DecodingError);
    }

    #[test]
    fn test_failed_page_passes_status_through() {
        let page = Page::failed("https://medium.com/x", PageStatus::NotFound);
        let parsed = ArticleParser::new(5, false).parse(page);
        assert_eq!(parsed.status, PageStatus::NotFound);
        assert_eq!(parsed.url, "https://medium.com/x");
    }

    #[test]
    fn test_parse_json_payload() {
        let body = r#"])}while(1);</x>{"success":true,"payload":{
            "value":{"id":"9f8e7d","title":"Async Rust","creatorId":"u1",
                     "virtuals":{"readingTime":6.2},
                     "content":{"bodyModel":{"paragraphs":[
                        {"type":3,"text":"Async Rust"},
                        {"type":0,"text":"hidden"},
                        {"type":1,"text":"Body text"}]}}},
            "references":{"User":{"u1":{"name":"Ferris"}}}}}"#;
        let parsed = ArticleParser::new(5, false).parse(ok_page(body.to_string()));

        let article = parsed.article.unwrap();
        assert_eq!(article.id, "9f8e7d");
        assert_eq!(article.author.as_deref(), Some("Ferris"));
        assert_eq!(article.paragraphs, vec!["Async Rust", "Body text"]);
        assert_eq!(article.duration_minutes, Some(7));
    }

    #[test]
    fn test_json_without_user_is_decoding_error() {
        let body = r#"{"payload":{"value":{"id":"x","title":"t","creatorId":"u1",
            "content":{"bodyModel":{"paragraphs":[]}}},"references":{"User":{}}}}"#;
        let parsed = ArticleParser::new(0, true).parse(ok_page(body.to_string()));
        assert_eq!(parsed.status, PageStatus::DecodingError);
    }
}
