//! The persistent dedup store.

use super::bucket::{BucketKey, ChannelState, TIMESTAMP_LEN, decode_timestamp, encode_snapshot};
use super::filter::{BloomFilter, FilterParams, MembershipFilter};
use super::persist::atomic_write;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Default bucket expiration window (30 days).
pub const DEFAULT_BUCKET_EXPIRATION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// feed URL -> channel -> state
type BucketMap<F> = HashMap<String, HashMap<String, ChannelState<F>>>;

/// Configuration for a [`DedupStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding one snapshot file per bucket.
    pub data_dir: PathBuf,
    /// Sizing for newly created filters.
    pub filter: FilterParams,
    /// Buckets idle for longer than this are reset on load.
    pub expiration: Duration,
}

impl StoreConfig {
    /// Creates a configuration with default filter sizing and expiration.
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            filter: FilterParams::default(),
            expiration: DEFAULT_BUCKET_EXPIRATION,
        }
    }

    /// Sets the filter sizing.
    #[must_use]
    pub const fn with_filter(mut self, filter: FilterParams) -> Self {
        self.filter = filter;
        self
    }

    /// Sets the bucket expiration window.
    #[must_use]
    pub const fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = expiration;
        self
    }
}

/// Summary of one bucket, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketSummary {
    /// Source feed URL.
    pub feed_url: String,
    /// Destination channel.
    pub channel: String,
    /// Time of the last mark, creation, or reset.
    pub updated_at: DateTime<Utc>,
}

/// Persistent per-feed, per-channel record of delivered item ids.
///
/// # Locking
///
/// A single reader/writer lock covers the whole bucket map. Lookups take the
/// shared mode; every [`mark_seen`](Self::mark_seen) takes the exclusive mode
/// and rewrites the bucket file while holding it, so marks are serialized
/// store-wide. Sends are rate limited far below disk throughput, so this is
/// not the bottleneck.
///
/// # Example
///
/// ```rust,no_run
/// use feedrelay::{DedupStore, StoreConfig};
///
/// let store = DedupStore::open(StoreConfig::new("./data"))?;
/// let feed = "https://example.com/feed.xml";
/// if !store.is_seen(feed, "@news", "item-1") {
///     // ... send ...
///     store.mark_seen(feed, "@news", "item-1")?;
/// }
/// # Ok::<(), feedrelay::Error>(())
/// ```
#[derive(Debug)]
pub struct DedupStore<F = BloomFilter> {
    states: RwLock<BucketMap<F>>,
    config: StoreConfig,
}

impl DedupStore {
    /// Opens a Bloom-filter backed store, loading every bucket in the data directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptStore`] if any bucket file name or content is
    /// malformed, and [`Error::OperationFailed`] on I/O failures.
    pub fn open(config: StoreConfig) -> Result<Self> {
        Self::open_with_filter(config)
    }
}

impl<F: MembershipFilter> DedupStore<F> {
    /// Opens a store backed by the filter type `F`.
    pub fn open_with_filter(config: StoreConfig) -> Result<Self> {
        Self::open_at(config, Utc::now())
    }

    /// Opens a store, judging bucket expiry relative to `now`.
    #[instrument(skip_all, fields(data_dir = %config.data_dir.display()))]
    pub fn open_at(config: StoreConfig, now: DateTime<Utc>) -> Result<Self> {
        config.filter.validate()?;

        fs::create_dir_all(&config.data_dir).map_err(|e| Error::OperationFailed {
            operation: "create_data_dir".to_string(),
            cause: format!("{}: {e}", config.data_dir.display()),
        })?;

        let entries = fs::read_dir(&config.data_dir).map_err(|e| Error::OperationFailed {
            operation: "read_data_dir".to_string(),
            cause: format!("{}: {e}", config.data_dir.display()),
        })?;

        let mut states: BucketMap<F> = HashMap::new();
        let mut loaded = 0usize;
        let mut reset = 0usize;

        for entry in entries {
            let entry = entry.map_err(|e| Error::OperationFailed {
                operation: "read_dir_entry".to_string(),
                cause: e.to_string(),
            })?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(key) = BucketKey::from_file_path(&path)? else {
                continue;
            };

            let (state, was_reset) = load_bucket::<F>(&path, &config, now)?;
            if was_reset {
                reset += 1;
            }
            loaded += 1;
            states
                .entry(key.feed_url)
                .or_default()
                .insert(key.channel, state);
        }

        info!(buckets = loaded, reset, "Dedup store loaded");

        Ok(Self {
            states: RwLock::new(states),
            config,
        })
    }

    /// Returns `true` if `id` was (possibly) delivered to `channel` for `feed_url`.
    ///
    /// Never returns `false` for an id that was marked, unless its bucket
    /// expired and was reset on load.
    pub fn is_seen(&self, feed_url: &str, channel: &str, id: &str) -> bool {
        self.read()
            .get(feed_url)
            .and_then(|channels| channels.get(channel))
            .is_some_and(|state| state.filter.test(id))
    }

    /// Records `id` as delivered and persists the bucket before returning.
    ///
    /// Creates the bucket on first use. The in-memory bucket is updated even
    /// if the write fails, so the id is not resent during this process lifetime.
    #[instrument(skip(self), fields(operation = "mark_seen"))]
    pub fn mark_seen(&self, feed_url: &str, channel: &str, id: &str) -> Result<()> {
        let mut states = self.write();
        let now = Utc::now();

        let state = states
            .entry(feed_url.to_string())
            .or_default()
            .entry(channel.to_string())
            .or_insert_with(|| ChannelState::new(F::empty(&self.config.filter), now));

        state.filter.add(id);
        state.updated_at = if now > state.updated_at {
            now
        } else {
            state.updated_at + chrono::Duration::nanoseconds(1)
        };

        let snapshot = encode_snapshot(state.updated_at, &state.filter.to_bytes());
        let path = self.bucket_file_path(feed_url, channel);
        atomic_write(&path, &snapshot)?;

        metrics::counter!("feedrelay_store_marks_total").increment(1);
        debug!(path = %path.display(), bytes = snapshot.len(), "Bucket persisted");

        Ok(())
    }

    /// Returns when the bucket was last updated, or `None` if it does not exist.
    pub fn last_updated(&self, feed_url: &str, channel: &str) -> Option<DateTime<Utc>> {
        self.read()
            .get(feed_url)
            .and_then(|channels| channels.get(channel))
            .map(|state| state.updated_at)
    }

    /// Returns the snapshot file path for a bucket, whether or not it exists.
    pub fn bucket_file_path(&self, feed_url: &str, channel: &str) -> PathBuf {
        self.config
            .data_dir
            .join(BucketKey::new(feed_url, channel).file_name())
    }

    /// Returns `true` if the bucket has been persisted at least once.
    pub fn has_bucket_file(&self, feed_url: &str, channel: &str) -> bool {
        self.bucket_file_path(feed_url, channel).is_file()
    }

    /// Number of buckets held in memory.
    pub fn bucket_count(&self) -> usize {
        self.read().values().map(HashMap::len).sum()
    }

    /// Lists all buckets, ordered by feed URL then channel.
    pub fn buckets(&self) -> Vec<BucketSummary> {
        let mut out: Vec<BucketSummary> = self
            .read()
            .iter()
            .flat_map(|(feed_url, channels)| {
                channels.iter().map(move |(channel, state)| BucketSummary {
                    feed_url: feed_url.clone(),
                    channel: channel.clone(),
                    updated_at: state.updated_at,
                })
            })
            .collect();
        out.sort_by(|a, b| {
            a.feed_url
                .cmp(&b.feed_url)
                .then_with(|| a.channel.cmp(&b.channel))
        });
        out
    }

    /// The directory holding bucket snapshots.
    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    // Every mutation leaves the map consistent, so a poisoned lock is still usable.
    fn read(&self) -> RwLockReadGuard<'_, BucketMap<F>> {
        self.states.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BucketMap<F>> {
        self.states.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Loads one bucket file, returning the state and whether it was reset.
fn load_bucket<F: MembershipFilter>(
    path: &Path,
    config: &StoreConfig,
    now: DateTime<Utc>,
) -> Result<(ChannelState<F>, bool)> {
    let bytes = fs::read(path).map_err(|e| Error::OperationFailed {
        operation: "read_bucket_file".to_string(),
        cause: format!("{}: {e}", path.display()),
    })?;

    let updated_at = decode_timestamp(path, &bytes)?;

    let expired = (now - updated_at)
        .to_std()
        .is_ok_and(|age| age > config.expiration);
    if expired {
        metrics::counter!("feedrelay_store_resets_total").increment(1);
        info!(
            path = %path.display(),
            last_updated = %updated_at,
            "Bucket expired, starting with an empty filter"
        );
        return Ok((ChannelState::new(F::empty(&config.filter), now), true));
    }

    let filter_bytes = &bytes[TIMESTAMP_LEN..];
    if filter_bytes.is_empty() {
        return Err(Error::CorruptStore {
            path: path.to_path_buf(),
            reason: "no filter data after timestamp".to_string(),
        });
    }

    let filter = F::from_bytes(filter_bytes, &config.filter).map_err(|e| Error::CorruptStore {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    Ok((ChannelState::new(filter, updated_at), false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::ExactSet;
    use crate::dedup::bucket::temp_path;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    const FEED: &str = "https://example.com/feed.xml";

    fn small_config(dir: &Path) -> StoreConfig {
        StoreConfig::new(dir).with_filter(FilterParams::new(1_000, 0.001))
    }

    #[test]
    fn test_unknown_bucket_is_unseen() {
        let dir = TempDir::new().expect("tempdir");
        let store = DedupStore::open(small_config(dir.path())).expect("open");

        assert!(!store.is_seen(FEED, "@news", "id-1"));
        assert!(store.last_updated(FEED, "@news").is_none());
        assert!(!store.has_bucket_file(FEED, "@news"));
    }

    #[test]
    fn test_mark_seen_creates_bucket_and_file() {
        let dir = TempDir::new().expect("tempdir");
        let store = DedupStore::open(small_config(dir.path())).expect("open");

        store.mark_seen(FEED, "@news", "id-1").expect("mark");

        assert!(store.is_seen(FEED, "@news", "id-1"));
        assert!(!store.is_seen(FEED, "@other", "id-1"));
        assert!(store.has_bucket_file(FEED, "@news"));
        assert!(!temp_path(&store.bucket_file_path(FEED, "@news")).exists());
        assert_eq!(store.bucket_count(), 1);
    }

    #[test]
    fn test_last_updated_increases_on_every_mark() {
        let dir = TempDir::new().expect("tempdir");
        let store = DedupStore::open(small_config(dir.path())).expect("open");

        store.mark_seen(FEED, "@news", "a").expect("mark");
        let first = store.last_updated(FEED, "@news").expect("bucket");
        store.mark_seen(FEED, "@news", "b").expect("mark");
        let second = store.last_updated(FEED, "@news").expect("bucket");

        assert!(second > first);
    }

    #[test]
    fn test_marks_survive_reopen() {
        let dir = TempDir::new().expect("tempdir");
        {
            let store = DedupStore::open(small_config(dir.path())).expect("open");
            store.mark_seen(FEED, "@news", "id-1").expect("mark");
            store.mark_seen(FEED, "@alerts", "id-2").expect("mark");
        }

        let store = DedupStore::open(small_config(dir.path())).expect("reopen");
        assert!(store.is_seen(FEED, "@news", "id-1"));
        assert!(store.is_seen(FEED, "@alerts", "id-2"));
        assert!(!store.is_seen(FEED, "@news", "id-2"));
        assert_eq!(store.bucket_count(), 2);
    }

    #[test]
    fn test_expired_bucket_resets_on_load() {
        let dir = TempDir::new().expect("tempdir");
        {
            let store = DedupStore::open(small_config(dir.path())).expect("open");
            store.mark_seen(FEED, "@news", "id-1").expect("mark");
        }

        let later = Utc::now() + chrono::Duration::days(31);
        let store: DedupStore = DedupStore::open_at(small_config(dir.path()), later).expect("reopen");

        assert!(!store.is_seen(FEED, "@news", "id-1"));
        assert_eq!(store.last_updated(FEED, "@news"), Some(later));
    }

    #[test]
    fn test_bucket_within_window_keeps_timestamp() {
        let dir = TempDir::new().expect("tempdir");
        let marked_at = {
            let store = DedupStore::open(small_config(dir.path())).expect("open");
            store.mark_seen(FEED, "@news", "id-1").expect("mark");
            store.last_updated(FEED, "@news").expect("bucket")
        };

        let later = Utc::now() + chrono::Duration::days(29);
        let store: DedupStore = DedupStore::open_at(small_config(dir.path()), later).expect("reopen");
        assert!(store.is_seen(FEED, "@news", "id-1"));
        assert_eq!(store.last_updated(FEED, "@news"), Some(marked_at));
    }

    #[test]
    fn test_truncated_file_fails_open() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir
            .path()
            .join(BucketKey::new(FEED, "@news").file_name());
        fs::write(&path, [1u8, 2, 3]).expect("write");

        let result = DedupStore::open(small_config(dir.path()));
        assert!(matches!(result, Err(Error::CorruptStore { .. })));
    }

    #[test]
    fn test_timestamp_only_file_fails_open() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir
            .path()
            .join(BucketKey::new(FEED, "@news").file_name());
        fs::write(&path, encode_snapshot(Utc::now(), &[])).expect("write");

        let result = DedupStore::open(small_config(dir.path()));
        assert!(matches!(result, Err(Error::CorruptStore { .. })));
    }

    #[test]
    fn test_garbage_filter_fails_open() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir
            .path()
            .join(BucketKey::new(FEED, "@news").file_name());
        fs::write(&path, encode_snapshot(Utc::now(), b"garbage")).expect("write");

        let result = DedupStore::open(small_config(dir.path()));
        assert!(matches!(result, Err(Error::CorruptStore { .. })));
    }

    #[test]
    fn test_malformed_file_name_fails_open() {
        let dir = TempDir::new().expect("tempdir");
        fs::write(dir.path().join("%%%.bloom"), b"whatever").expect("write");

        let result = DedupStore::open(small_config(dir.path()));
        assert!(matches!(result, Err(Error::CorruptStore { .. })));
    }

    #[test]
    fn test_unrelated_files_are_ignored() {
        let dir = TempDir::new().expect("tempdir");
        fs::write(dir.path().join("README"), b"hello").expect("write");
        fs::create_dir(dir.path().join("nested.bloom")).expect("mkdir");

        let store = DedupStore::open(small_config(dir.path())).expect("open");
        assert_eq!(store.bucket_count(), 0);
    }

    #[test]
    fn test_exact_set_backend() {
        let dir = TempDir::new().expect("tempdir");
        {
            let store =
                DedupStore::<ExactSet>::open_with_filter(small_config(dir.path())).expect("open");
            store.mark_seen(FEED, "@news", "id-1").expect("mark");
        }
        let store =
            DedupStore::<ExactSet>::open_with_filter(small_config(dir.path())).expect("reopen");
        assert!(store.is_seen(FEED, "@news", "id-1"));
        assert!(!store.is_seen(FEED, "@news", "id-2"));
    }

    #[test]
    fn test_buckets_are_listed_in_order() {
        let dir = TempDir::new().expect("tempdir");
        let store = DedupStore::open(small_config(dir.path())).expect("open");
        store.mark_seen("https://b", "@z", "1").expect("mark");
        store.mark_seen("https://a", "@y", "1").expect("mark");
        store.mark_seen("https://a", "@x", "1").expect("mark");

        let listed: Vec<(String, String)> = store
            .buckets()
            .into_iter()
            .map(|b| (b.feed_url, b.channel))
            .collect();
        assert_eq!(
            listed,
            vec![
                ("https://a".to_string(), "@x".to_string()),
                ("https://a".to_string(), "@y".to_string()),
                ("https://b".to_string(), "@z".to_string()),
            ]
        );
    }

    #[test]
    fn test_concurrent_marks_on_different_buckets() {
        let dir = TempDir::new().expect("tempdir");
        let store = Arc::new(DedupStore::open(small_config(dir.path())).expect("open"));

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    let channel = format!("@c{t}");
                    for i in 0..25 {
                        store
                            .mark_seen(FEED, &channel, &format!("id-{i}"))
                            .expect("mark");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }

        let reopened = DedupStore::open(small_config(dir.path())).expect("reopen");
        for t in 0..4 {
            for i in 0..25 {
                assert!(reopened.is_seen(FEED, &format!("@c{t}"), &format!("id-{i}")));
            }
        }
    }
}
