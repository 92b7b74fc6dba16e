//! Feed items, identity resolution, and fetching.
//!
//! The pipeline only sees [`FeedItem`] values. Where they come from is the
//! business of a [`FeedFetcher`]; the stock implementation is
//! [`HttpFeedFetcher`], which downloads a URL and parses RSS, Atom, or JSON
//! Feed documents.

mod fetch;
mod identity;

pub use fetch::{FeedFetcher, HttpFeedFetcher, parse_feed};
pub use identity::resolve_item_id;

use chrono::{DateTime, Utc};

/// A read-only view of one entry in a fetched feed.
///
/// Missing text fields are empty strings rather than `None`; only the
/// publish timestamp is genuinely optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedItem {
    /// Entry title.
    pub title: String,
    /// Primary link.
    pub link: String,
    /// Globally unique id as published by the feed.
    pub guid: String,
    /// Parsed publish time, if the feed supplied one.
    pub published: Option<DateTime<Utc>>,
    /// Publish time as a string, used for identity.
    pub published_raw: String,
    /// Summary, usually HTML.
    pub description: String,
    /// Full content, usually HTML.
    pub content: String,
}

impl FeedItem {
    /// Creates an item with a title and link.
    #[must_use]
    pub fn new(title: impl Into<String>, link: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            link: link.into(),
            ..Self::default()
        }
    }

    /// Sets the guid.
    #[must_use]
    pub fn with_guid(mut self, guid: impl Into<String>) -> Self {
        self.guid = guid.into();
        self
    }

    /// Sets the publish time, also filling the raw string.
    #[must_use]
    pub fn with_published(mut self, published: DateTime<Utc>) -> Self {
        self.published_raw = published.to_rfc3339();
        self.published = Some(published);
        self
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets the content.
    #[must_use]
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    /// Returns `true` if the item has neither a title nor a link.
    #[must_use]
    pub fn is_unaddressable(&self) -> bool {
        self.title.is_empty() && self.link.is_empty()
    }
}
