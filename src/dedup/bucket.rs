//! Channel buckets and their on-disk snapshot format.
//!
//! A bucket holds the membership filter for one (feed, channel) pair. Its
//! snapshot file is named by the URL-safe base64 encoding of
//! `"<channel>|<feedURL>"` plus [`BUCKET_FILE_SUFFIX`], and contains an 8-byte
//! little-endian nanosecond timestamp followed by the serialized filter.

use super::filter::MembershipFilter;
use crate::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

/// Suffix of every bucket snapshot file.
pub const BUCKET_FILE_SUFFIX: &str = ".bloom";

/// Size of the timestamp header in a snapshot file.
pub const TIMESTAMP_LEN: usize = 8;

const KEY_SEPARATOR: char = '|';

/// Identity of a bucket: the channel and the feed it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    /// Destination channel handle.
    pub channel: String,
    /// Source feed URL.
    pub feed_url: String,
}

impl BucketKey {
    /// Creates a bucket key.
    #[must_use]
    pub fn new(feed_url: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            feed_url: feed_url.into(),
        }
    }

    /// Returns the snapshot file name for this bucket.
    #[must_use]
    pub fn file_name(&self) -> String {
        let raw = format!("{}{KEY_SEPARATOR}{}", self.channel, self.feed_url);
        format!("{}{BUCKET_FILE_SUFFIX}", URL_SAFE.encode(raw.as_bytes()))
    }

    /// Recovers a bucket key from a snapshot file path.
    ///
    /// Returns `Ok(None)` for files that are not bucket snapshots (including
    /// orphaned temp files). A snapshot name that cannot be decoded is an
    /// [`Error::CorruptStore`].
    pub fn from_file_path(path: &Path) -> Result<Option<Self>> {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return Ok(None);
        };
        let Some(encoded) = name.strip_suffix(BUCKET_FILE_SUFFIX) else {
            return Ok(None);
        };

        let corrupt = |reason: String| Error::CorruptStore {
            path: path.to_path_buf(),
            reason,
        };

        let decoded = URL_SAFE
            .decode(encoded)
            .map_err(|e| corrupt(format!("undecodable file name: {e}")))?;
        let decoded =
            String::from_utf8(decoded).map_err(|e| corrupt(format!("file name is not utf-8: {e}")))?;

        let Some((channel, feed_url)) = decoded.split_once(KEY_SEPARATOR) else {
            return Err(corrupt(format!(
                "decoded name {decoded:?} has no channel separator"
            )));
        };
        if channel.is_empty() {
            return Err(corrupt(format!("decoded name {decoded:?} has an empty channel")));
        }

        Ok(Some(Self::new(feed_url, channel)))
    }
}

/// Membership state for one (feed, channel) pair.
#[derive(Debug, Clone)]
pub struct ChannelState<F> {
    /// Identifiers delivered to this channel.
    pub filter: F,
    /// Time of the last successful mark (or of creation/reset).
    pub updated_at: DateTime<Utc>,
}

impl<F: MembershipFilter> ChannelState<F> {
    /// Creates a state with the given filter.
    #[must_use]
    pub const fn new(filter: F, updated_at: DateTime<Utc>) -> Self {
        Self { filter, updated_at }
    }
}

/// Encodes a snapshot: timestamp header followed by filter bytes.
#[must_use]
pub fn encode_snapshot(updated_at: DateTime<Utc>, filter_bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(TIMESTAMP_LEN + filter_bytes.len());
    out.extend_from_slice(&to_nanos(updated_at).to_le_bytes());
    out.extend_from_slice(filter_bytes);
    out
}

/// Reads the timestamp header of a snapshot.
pub fn decode_timestamp(path: &Path, bytes: &[u8]) -> Result<DateTime<Utc>> {
    let Some(header) = bytes.get(..TIMESTAMP_LEN) else {
        return Err(Error::CorruptStore {
            path: path.to_path_buf(),
            reason: format!(
                "file is {} bytes, shorter than the {TIMESTAMP_LEN}-byte timestamp",
                bytes.len()
            ),
        });
    };
    let mut raw = [0u8; TIMESTAMP_LEN];
    raw.copy_from_slice(header);
    Ok(DateTime::from_timestamp_nanos(i64::from_le_bytes(raw)))
}

/// Returns the sibling temp path used while rewriting `path`.
#[must_use]
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn to_nanos(at: DateTime<Utc>) -> i64 {
    at.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_file_name_roundtrip() {
        let key = BucketKey::new("https://example.com/feed.xml?a=1&b=2", "@news");
        let path = PathBuf::from("/data").join(key.file_name());

        let decoded = BucketKey::from_file_path(&path).expect("decode");
        assert_eq!(decoded, Some(key));
    }

    #[test]
    fn test_file_name_uses_url_safe_alphabet() {
        let key = BucketKey::new("https://example.com/??>>", "@c");
        let name = key.file_name();
        assert!(name.ends_with(".bloom"));
        assert!(!name.contains('/'));
        assert!(!name.contains('+'));
    }

    #[test]
    fn test_feed_url_may_contain_separator() {
        let key = BucketKey::new("https://example.com/a|b", "@c");
        let path = PathBuf::from(key.file_name());
        let decoded = BucketKey::from_file_path(&path).expect("decode");
        assert_eq!(decoded.map(|k| k.feed_url), Some("https://example.com/a|b".to_string()));
    }

    #[test]
    fn test_non_bucket_files_are_ignored() {
        assert!(BucketKey::from_file_path(Path::new("/data/notes.txt")).expect("ok").is_none());
        let key = BucketKey::new("https://x", "@c");
        let tmp = temp_path(&PathBuf::from("/data").join(key.file_name()));
        assert!(BucketKey::from_file_path(&tmp).expect("ok").is_none());
    }

    #[test]
    fn test_undecodable_name_is_corrupt() {
        let err = BucketKey::from_file_path(Path::new("/data/!!!not-base64.bloom"))
            .expect_err("must fail");
        assert!(matches!(err, Error::CorruptStore { .. }));
    }

    #[test]
    fn test_name_without_separator_is_corrupt() {
        let name = format!("{}.bloom", URL_SAFE.encode("no-separator"));
        let err = BucketKey::from_file_path(Path::new(&name)).expect_err("must fail");
        assert!(matches!(err, Error::CorruptStore { .. }));
    }

    #[test]
    fn test_snapshot_timestamp_roundtrip() {
        let at = Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).single().expect("date")
            + chrono::Duration::nanoseconds(123);
        let bytes = encode_snapshot(at, b"filter");

        assert_eq!(&bytes[TIMESTAMP_LEN..], b"filter");
        let decoded = decode_timestamp(Path::new("x"), &bytes).expect("decode");
        assert_eq!(decoded, at);
    }

    #[test]
    fn test_short_snapshot_is_corrupt() {
        let err = decode_timestamp(Path::new("x"), &[1, 2, 3]).expect_err("must fail");
        assert!(matches!(err, Error::CorruptStore { .. }));
    }

    #[test]
    fn test_temp_path_is_sibling() {
        let path = PathBuf::from("/data/abc.bloom");
        assert_eq!(temp_path(&path), PathBuf::from("/data/abc.bloom.tmp"));
    }
}
