//! Feed fetching over HTTP.

use super::FeedItem;
use crate::{Error, Result};
use feed_rs::model::Entry;
use std::time::Duration;
use tracing::{debug, instrument};

/// Default request timeout for feed downloads.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Source of feed items.
///
/// Implementations are called from blocking worker threads.
pub trait FeedFetcher: Send + Sync {
    /// Fetches and parses the feed at `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the feed cannot be downloaded or parsed.
    fn fetch(&self, url: &str) -> Result<Vec<FeedItem>>;
}

/// Fetches feeds with a blocking `reqwest` client.
pub struct HttpFeedFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFeedFetcher {
    /// Creates a fetcher with the default timeout.
    #[must_use]
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_FETCH_TIMEOUT)
    }

    /// Creates a fetcher with a custom timeout.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        let client = reqwest::blocking::Client::builder()
            .user_agent(format!("feedrelay/{}", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());

        Self { client }
    }
}

impl Default for HttpFeedFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedFetcher for HttpFeedFetcher {
    #[instrument(skip(self), fields(operation = "fetch_feed"))]
    fn fetch(&self, url: &str) -> Result<Vec<FeedItem>> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| Error::operation("fetch_feed", format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::operation(
                "fetch_feed",
                format!("{url}: HTTP {}", status.as_u16()),
            ));
        }

        let body = response
            .bytes()
            .map_err(|e| Error::operation("fetch_feed", format!("{url}: {e}")))?;

        let items = parse_feed(&body)?;
        debug!(url, items = items.len(), "Feed fetched");
        Ok(items)
    }
}

/// Parses an RSS, Atom, or JSON Feed document into items, in document order.
///
/// Entries without a guid keep an empty `guid`, so [`resolve_item_id`]
/// falls back to the link and then to title and publish time. The parser's
/// synthesized ids are not stable across fetches.
///
/// [`resolve_item_id`]: super::resolve_item_id
///
/// # Errors
///
/// Returns [`Error::OperationFailed`] if the document is not a recognizable feed.
pub fn parse_feed(body: &[u8]) -> Result<Vec<FeedItem>> {
    let feed = feed_rs::parser::Builder::new()
        .id_generator(|_, _, _| String::new())
        .build()
        .parse(body)
        .map_err(|e| Error::operation("parse_feed", e))?;
    Ok(feed.entries.into_iter().map(item_from_entry).collect())
}

fn item_from_entry(entry: Entry) -> FeedItem {
    let published = entry.published.or(entry.updated);
    FeedItem {
        title: entry.title.map(|t| t.content).unwrap_or_default(),
        link: entry
            .links
            .into_iter()
            .next()
            .map(|l| l.href)
            .unwrap_or_default(),
        guid: entry.id,
        published,
        published_raw: published.map(|p| p.to_rfc3339()).unwrap_or_default(),
        description: entry.summary.map(|s| s.content).unwrap_or_default(),
        content: entry.content.and_then(|c| c.body).unwrap_or_default(),
    }
}
