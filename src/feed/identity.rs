//! Stable identifiers for feed items.

use super::FeedItem;
use sha2::{Digest, Sha256};

/// Derives the dedup identifier for an item.
///
/// Takes the first available of: guid, link, `"<title>|<published>"` (only
/// when both are present), and finally `"content:<hex sha256 of content>"`.
/// The order matters: changing it would re-send every item already recorded
/// under a different id.
#[must_use]
pub fn resolve_item_id(item: &FeedItem) -> String {
    if !item.guid.is_empty() {
        return item.guid.clone();
    }
    if !item.link.is_empty() {
        return item.link.clone();
    }
    if !item.title.is_empty() && !item.published_raw.is_empty() {
        return format!("{}|{}", item.title, item.published_raw);
    }
    format!("content:{}", hex::encode(Sha256::digest(item.content.as_bytes())))
}
