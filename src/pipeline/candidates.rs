//! Candidate selection and delivery ordering for one feed.

use crate::config::FeedConfig;
use crate::dedup::{DedupStore, MembershipFilter};
use crate::feed::{FeedItem, resolve_item_id};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tracing::debug;

/// An item that still needs delivery to at least one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Resolved dedup id.
    pub id: String,
    /// The item itself.
    pub item: FeedItem,
}

/// Filters fetched items down to those worth dispatching, in fetch order.
///
/// Drops items without title and link, repeats of an id within the batch,
/// items every channel has already seen, and items published longer ago
/// than the feed's article expiration.
pub fn select_candidates<F: MembershipFilter>(
    items: Vec<FeedItem>,
    feed: &FeedConfig,
    store: &DedupStore<F>,
    now: DateTime<Utc>,
) -> Vec<Candidate> {
    let max_age = feed.article_expiration();
    let mut seen_this_cycle = HashSet::new();
    let mut candidates = Vec::new();

    for item in items {
        if item.is_unaddressable() {
            skip(&feed.name, "unaddressable", &item.title);
            continue;
        }

        let id = resolve_item_id(&item);
        if seen_this_cycle.contains(&id) {
            skip(&feed.name, "duplicate", &item.title);
            continue;
        }

        if feed
            .channels
            .iter()
            .all(|channel| store.is_seen(&feed.url, channel, &id))
        {
            skip(&feed.name, "seen", &item.title);
            continue;
        }

        let stale = item
            .published
            .and_then(|published| (now - published).to_std().ok())
            .is_some_and(|age| age > max_age);
        if stale {
            skip(&feed.name, "stale", &item.title);
            continue;
        }

        seen_this_cycle.insert(id.clone());
        candidates.push(Candidate { id, item });
    }

    candidates
}

/// Orders candidates oldest first, then those without a publish time in their original order.
pub fn order_candidates(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let (mut dated, undated): (Vec<_>, Vec<_>) = candidates
        .into_iter()
        .partition(|candidate| candidate.item.published.is_some());
    dated.sort_by_key(|candidate| candidate.item.published);
    dated.extend(undated);
    dated
}

fn skip(feed: &str, reason: &'static str, title: &str) {
    metrics::counter!("feedrelay_items_skipped_total", "reason" => reason).increment(1);
    debug!(feed, reason, title, "Skipping item");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::{FilterParams, StoreConfig};
    use chrono::TimeZone;
    use tempfile::TempDir;

    const URL: &str = "https://example.com/feed.xml";

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0)
            .single()
            .expect("date")
    }

    fn store(dir: &TempDir) -> DedupStore {
        DedupStore::open(StoreConfig::new(dir.path()).with_filter(FilterParams::new(1_000, 0.001)))
            .expect("open")
    }

    fn feed() -> FeedConfig {
        FeedConfig::new("example", URL, &["@a", "@b"])
    }

    #[test]
    fn test_ordering_oldest_first_then_undated() {
        let a = FeedItem::new("A", "https://x/a").with_published(day(3));
        let b = FeedItem::new("B", "https://x/b");
        let c = FeedItem::new("C", "https://x/c").with_published(day(1));
        let candidates = vec![a, b, c]
            .into_iter()
            .map(|item| Candidate {
                id: resolve_item_id(&item),
                item,
            })
            .collect();

        let titles: Vec<String> = order_candidates(candidates)
            .into_iter()
            .map(|c| c.item.title)
            .collect();
        assert_eq!(titles, vec!["C", "A", "B"]);
    }

    #[test]
    fn test_undated_items_keep_fetch_order() {
        let items = ["first", "second", "third"]
            .into_iter()
            .map(|t| {
                let item = FeedItem::new(t, format!("https://x/{t}"));
                Candidate {
                    id: resolve_item_id(&item),
                    item,
                }
            })
            .collect();
        let titles: Vec<String> = order_candidates(items)
            .into_iter()
            .map(|c| c.item.title)
            .collect();
        assert_eq!(titles, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_unaddressable_and_duplicate_items_are_dropped() {
        let dir = TempDir::new().expect("tempdir");
        let items = vec![
            FeedItem::default().with_content("orphan"),
            FeedItem::new("One", "https://x/1"),
            FeedItem::new("One again", "https://x/1"),
        ];

        let selected = select_candidates(items, &feed(), &store(&dir), day(5));
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id, "https://x/1");
    }

    #[test]
    fn test_item_seen_by_every_channel_is_dropped() {
        let dir = TempDir::new().expect("tempdir");
        let store = store(&dir);
        store.mark_seen(URL, "@a", "https://x/1").expect("mark");
        store.mark_seen(URL, "@b", "https://x/1").expect("mark");
        store.mark_seen(URL, "@a", "https://x/2").expect("mark");

        let items = vec![
            FeedItem::new("One", "https://x/1"),
            FeedItem::new("Two", "https://x/2"),
        ];
        let selected = select_candidates(items, &feed(), &store, day(5));

        let ids: Vec<&str> = selected.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["https://x/2"]);
    }

    #[test]
    fn test_stale_items_are_dropped_only_when_dated() {
        let dir = TempDir::new().expect("tempdir");
        let mut feed = feed();
        feed.article_expiration_duration_hours = Some(48);

        let items = vec![
            FeedItem::new("Old", "https://x/old").with_published(day(1)),
            FeedItem::new("Fresh", "https://x/fresh").with_published(day(9)),
            FeedItem::new("Undated", "https://x/undated"),
        ];
        let selected = select_candidates(items, &feed, &store(&dir), day(10));

        let titles: Vec<&str> = selected.iter().map(|c| c.item.title.as_str()).collect();
        assert_eq!(titles, vec!["Fresh", "Undated"]);
    }

    #[test]
    fn test_future_items_are_not_stale() {
        let dir = TempDir::new().expect("tempdir");
        let items = vec![FeedItem::new("Soon", "https://x/soon").with_published(day(20))];
        let selected = select_candidates(items, &feed(), &store(&dir), day(10));
        assert_eq!(selected.len(), 1);
    }
}
