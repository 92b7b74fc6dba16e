//! Membership filters.
//!
//! A [`MembershipFilter`] answers "has this identifier been added?" with no
//! false negatives. [`BloomFilter`] is the production implementation with a
//! bounded false-positive rate; [`ExactSet`] is an exact alternative for small
//! deployments and tests.
//!
//! Both serialize to a small self-describing binary layout so the
//! [`DedupStore`](super::DedupStore) can persist them without knowing which
//! implementation it holds.

use crate::{Error, Result};
use std::collections::BTreeSet;
use std::fmt;

/// Default target capacity of a filter.
pub const DEFAULT_EXPECTED_ITEMS: u64 = 100_000;

/// Default target false-positive rate (0.1%).
pub const DEFAULT_FALSE_POSITIVE_RATE: f64 = 0.001;

const BLOOM_MAGIC: &[u8; 4] = b"FRBF";
const EXACT_MAGIC: &[u8; 4] = b"FRES";
const BLOOM_FORMAT_VERSION: u8 = 1;
const EXACT_FORMAT_VERSION: u8 = 1;
// Part of the on-disk format: changing it invalidates every stored filter.
const HASH_SEED: u128 = 0x6665_6564_7265_6c61_795f_626c_6f6f_6d31;
const BLOOM_HEADER_LEN: usize = 4 + 1 + 4 + 8;
const EXACT_HEADER_LEN: usize = 4 + 1 + 4;

/// Sizing parameters shared by every filter in a store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterParams {
    /// Number of identifiers the filter is sized for.
    pub expected_items: u64,
    /// Target false-positive probability at `expected_items`.
    pub false_positive_rate: f64,
}

impl Default for FilterParams {
    fn default() -> Self {
        Self {
            expected_items: DEFAULT_EXPECTED_ITEMS,
            false_positive_rate: DEFAULT_FALSE_POSITIVE_RATE,
        }
    }
}

impl FilterParams {
    /// Creates filter parameters.
    #[must_use]
    pub const fn new(expected_items: u64, false_positive_rate: f64) -> Self {
        Self {
            expected_items,
            false_positive_rate,
        }
    }

    /// Validates that the parameters describe a constructible filter.
    pub fn validate(&self) -> Result<()> {
        if self.expected_items == 0 {
            return Err(Error::InvalidInput(
                "filter capacity must be positive".to_string(),
            ));
        }
        if !(self.false_positive_rate > 0.0 && self.false_positive_rate < 1.0) {
            return Err(Error::InvalidInput(format!(
                "false positive rate must be in (0, 1), got {}",
                self.false_positive_rate
            )));
        }
        Ok(())
    }
}

/// A set of identifiers supporting membership tests.
///
/// `test` may return `true` for an id that was never added (a false
/// positive) but must never return `false` for one that was.
pub trait MembershipFilter: Send + Sync + Sized {
    /// Creates an empty filter sized by `params`.
    fn empty(params: &FilterParams) -> Self;

    /// Returns `true` if `id` is possibly present, `false` if definitely absent.
    fn test(&self, id: &str) -> bool;

    /// Adds `id` to the set.
    fn add(&mut self, id: &str);

    /// Serializes the filter.
    fn to_bytes(&self) -> Vec<u8>;

    /// Deserializes a filter produced by [`to_bytes`](Self::to_bytes).
    ///
    /// `params` are advisory; the encoded filter keeps its own geometry.
    fn from_bytes(bytes: &[u8], params: &FilterParams) -> Result<Self>;
}

/// Bloom filter backed by `fastbloom`.
///
/// Hashing uses a fixed seed, so a filter written by one process answers
/// identically in another.
#[derive(Clone)]
pub struct BloomFilter {
    inner: fastbloom::BloomFilter,
}

impl BloomFilter {
    /// Creates an empty filter for `expected_items` at `false_positive_rate`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn with_estimates(expected_items: u64, false_positive_rate: f64) -> Self {
        let rate = false_positive_rate.clamp(f64::MIN_POSITIVE, 0.5);
        let inner = fastbloom::BloomFilter::with_false_pos(rate)
            .seed(&HASH_SEED)
            .expected_items(expected_items.max(1) as usize);
        Self { inner }
    }

    /// Number of bits in the filter, a multiple of 64.
    #[must_use]
    pub fn num_bits(&self) -> u64 {
        self.inner.num_bits() as u64
    }

    /// Number of hash functions applied per id.
    #[must_use]
    pub fn num_hashes(&self) -> u32 {
        self.inner.num_hashes()
    }

    /// Estimates the current false-positive rate from the fill ratio.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn estimated_false_positive_rate(&self) -> f64 {
        let set: u64 = self
            .inner
            .as_slice()
            .iter()
            .map(|w| u64::from(w.count_ones()))
            .sum();
        let fill = set as f64 / self.num_bits() as f64;
        fill.powi(i32::try_from(self.num_hashes()).unwrap_or(i32::MAX))
    }
}

impl fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BloomFilter")
            .field("num_bits", &self.num_bits())
            .field("num_hashes", &self.num_hashes())
            .finish_non_exhaustive()
    }
}

impl MembershipFilter for BloomFilter {
    fn empty(params: &FilterParams) -> Self {
        Self::with_estimates(params.expected_items, params.false_positive_rate)
    }

    fn test(&self, id: &str) -> bool {
        self.inner.contains(id)
    }

    fn add(&mut self, id: &str) {
        self.inner.insert(id);
    }

    fn to_bytes(&self) -> Vec<u8> {
        let words = self.inner.as_slice();
        let mut out = Vec::with_capacity(BLOOM_HEADER_LEN + words.len() * 8);
        out.extend_from_slice(BLOOM_MAGIC);
        out.push(BLOOM_FORMAT_VERSION);
        out.extend_from_slice(&self.num_hashes().to_le_bytes());
        out.extend_from_slice(&self.num_bits().to_le_bytes());
        for word in words {
            out.extend_from_slice(&word.to_le_bytes());
        }
        out
    }

    fn from_bytes(bytes: &[u8], _params: &FilterParams) -> Result<Self> {
        let body = check_header(
            bytes,
            BLOOM_MAGIC,
            BLOOM_FORMAT_VERSION,
            BLOOM_HEADER_LEN,
            "bloom",
        )?;
        let num_hashes = u32::from_le_bytes(read_array(&bytes[5..9]));
        let num_bits = u64::from_le_bytes(read_array(&bytes[9..17]));

        if num_hashes == 0 || num_bits == 0 || num_bits % 64 != 0 {
            return Err(decode_error(format!(
                "bloom filter has invalid geometry ({num_bits} bits, {num_hashes} hashes)"
            )));
        }

        let expected_len = num_bits / 8;
        if body.len() as u64 != expected_len {
            return Err(decode_error(format!(
                "bloom filter expects {expected_len} data bytes, found {}",
                body.len()
            )));
        }

        let words: Vec<u64> = body
            .chunks_exact(8)
            .map(|chunk| u64::from_le_bytes(read_array(chunk)))
            .collect();
        let inner = fastbloom::BloomFilter::from_vec(words)
            .seed(&HASH_SEED)
            .hashes(num_hashes);

        Ok(Self { inner })
    }
}

/// Exact identifier set with no false positives.
///
/// Grows without bound; intended for small feeds and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExactSet {
    ids: BTreeSet<String>,
}

impl ExactSet {
    /// Number of stored identifiers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns `true` if no identifiers are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl MembershipFilter for ExactSet {
    fn empty(_params: &FilterParams) -> Self {
        Self::default()
    }

    fn test(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    fn add(&mut self, id: &str) {
        self.ids.insert(id.to_string());
    }

    #[allow(clippy::cast_possible_truncation)]
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(EXACT_HEADER_LEN);
        out.extend_from_slice(EXACT_MAGIC);
        out.push(EXACT_FORMAT_VERSION);
        out.extend_from_slice(&(self.ids.len() as u32).to_le_bytes());
        for id in &self.ids {
            out.extend_from_slice(&(id.len() as u32).to_le_bytes());
            out.extend_from_slice(id.as_bytes());
        }
        out
    }

    fn from_bytes(bytes: &[u8], _params: &FilterParams) -> Result<Self> {
        let mut rest = check_header(
            bytes,
            EXACT_MAGIC,
            EXACT_FORMAT_VERSION,
            EXACT_HEADER_LEN,
            "exact",
        )?;
        let count = u32::from_le_bytes(read_array(&bytes[5..9]));
        let mut ids = BTreeSet::new();

        for _ in 0..count {
            if rest.len() < 4 {
                return Err(decode_error("exact set entry length truncated"));
            }
            let len = u32::from_le_bytes(read_array(&rest[..4])) as usize;
            rest = &rest[4..];
            if rest.len() < len {
                return Err(decode_error("exact set entry truncated"));
            }
            let id = std::str::from_utf8(&rest[..len])
                .map_err(|e| decode_error(format!("exact set entry is not utf-8: {e}")))?;
            ids.insert(id.to_string());
            rest = &rest[len..];
        }

        if !rest.is_empty() {
            return Err(decode_error("trailing bytes after exact set"));
        }

        Ok(Self { ids })
    }
}

fn read_array<const N: usize>(slice: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&slice[..N]);
    out
}

fn check_header<'a>(
    bytes: &'a [u8],
    magic: &[u8; 4],
    version: u8,
    header_len: usize,
    kind: &str,
) -> Result<&'a [u8]> {
    if bytes.len() < header_len {
        return Err(decode_error(format!(
            "{kind} filter header truncated ({} bytes)",
            bytes.len()
        )));
    }
    if &bytes[..4] != magic {
        return Err(decode_error(format!("not a {kind} filter")));
    }
    if bytes[4] != version {
        return Err(decode_error(format!(
            "unsupported {kind} filter version {}",
            bytes[4]
        )));
    }
    Ok(&bytes[header_len..])
}

fn decode_error(cause: impl Into<String>) -> Error {
    Error::OperationFailed {
        operation: "decode_filter".to_string(),
        cause: cause.into(),
    }
}
