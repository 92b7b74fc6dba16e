//! # Feedrelay
//!
//! Relays new items from periodically polled feeds to chat channels.
//!
//! Every (item, channel) pair is delivered at most practically once, even
//! across restarts: delivery state lives in a persistent, per-feed-per-channel
//! probabilistic set that is only mutated after a confirmed send.
//!
//! ## Components
//!
//! - [`dedup`]: membership filters, bucket files, and the [`DedupStore`]
//! - [`feed`]: the [`FeedItem`] view, identity resolution, and fetching
//! - [`rendering`]: template rendering of items into message text
//! - [`transport`]: outbound message delivery
//! - [`pipeline`]: the per-cycle concurrent [`DeliveryPipeline`]
//! - [`config`] and [`observability`]: the ambient service plumbing
//!
//! ## Example
//!
//! ```rust,ignore
//! use feedrelay::{DedupStore, DeliveryPipeline, StoreConfig};
//! use std::sync::Arc;
//!
//! let store = Arc::new(DedupStore::open(StoreConfig::new("./data"))?);
//! let pipeline = DeliveryPipeline::new(store, fetcher, transport, renderer, settings);
//! let report = pipeline.run_cycle(&config.feeds).await?;
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![allow(clippy::multiple_crate_versions)]

use std::fmt;
use std::path::PathBuf;
use thiserror::Error as ThisError;

pub mod config;
pub mod dedup;
pub mod feed;
pub mod observability;
pub mod pipeline;
pub mod rendering;
pub mod transport;

pub use config::{DeliverySettings, FeedConfig, RelayConfig};
pub use dedup::{BloomFilter, DedupStore, ExactSet, FilterParams, MembershipFilter, StoreConfig};
pub use feed::{FeedFetcher, FeedItem, resolve_item_id};
pub use pipeline::{CycleReport, DeliveryPipeline, RetryPolicy};
pub use rendering::{Renderer, TemplateRenderer};
pub use transport::Transport;

/// Error type for feedrelay operations.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `InvalidInput` | Configuration fails validation, bad CLI arguments |
/// | `OperationFailed` | I/O errors, HTTP failures, unparseable feeds |
/// | `CorruptStore` | Undecodable bucket filenames or truncated bucket files at startup |
/// | `Feeds` | One or more feeds failed during a polling cycle |
#[derive(Debug, ThisError)]
pub enum Error {
    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An operation failed.
    ///
    /// Raised when:
    /// - Bucket files cannot be written, synced, or renamed
    /// - A feed cannot be downloaded or parsed
    /// - The Bot API rejects a message
    #[error("operation '{operation}' failed: {cause}")]
    OperationFailed {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// The dedup store on disk is structurally damaged.
    ///
    /// Fatal to store initialization. Expired buckets are never reported
    /// through this variant; they are reset silently.
    #[error("corrupt store file {}: {reason}", path.display())]
    CorruptStore {
        /// The offending bucket file.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },

    /// Aggregated per-feed failures of one polling cycle.
    #[error("errors processing feeds: {}", FeedErrors(.0))]
    Feeds(Vec<FeedError>),
}

impl Error {
    /// Shorthand for [`Error::OperationFailed`].
    pub fn operation(operation: &str, cause: impl fmt::Display) -> Self {
        Self::OperationFailed {
            operation: operation.to_string(),
            cause: cause.to_string(),
        }
    }
}

/// A single feed's failure within a cycle.
#[derive(Debug)]
pub struct FeedError {
    /// Configured feed name.
    pub feed: String,
    /// What went wrong.
    pub source: Box<Error>,
}

impl fmt::Display for FeedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "feed {}: {}", self.feed, self.source)
    }
}

struct FeedErrors<'a>(&'a [FeedError]);

impl fmt::Display for FeedErrors<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

/// Result type alias for feedrelay operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidInput("test error".to_string());
        assert_eq!(err.to_string(), "invalid input: test error");

        let err = Error::operation("test", "failed");
        assert_eq!(err.to_string(), "operation 'test' failed: failed");
    }

    #[test]
    fn test_corrupt_store_display() {
        let err = Error::CorruptStore {
            path: PathBuf::from("/data/abc.bloom"),
            reason: "file too short".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "corrupt store file /data/abc.bloom: file too short"
        );
    }

    #[test]
    fn test_feed_errors_are_joined_with_feed_names() {
        let err = Error::Feeds(vec![
            FeedError {
                feed: "alpha".to_string(),
                source: Box::new(Error::operation("fetch_feed", "timeout")),
            },
            FeedError {
                feed: "beta".to_string(),
                source: Box::new(Error::operation("fetch_feed", "HTTP 500")),
            },
        ]);
        assert_eq!(
            err.to_string(),
            "errors processing feeds: feed alpha: operation 'fetch_feed' failed: timeout; \
             feed beta: operation 'fetch_feed' failed: HTTP 500"
        );
    }
}
