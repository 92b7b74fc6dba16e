//! Persistent delivery deduplication.
//!
//! Delivered item ids are tracked per (feed URL, channel) bucket in a
//! membership filter. Each bucket is snapshotted to its own file after every
//! mark and reset on load once it has been idle past the expiration window.
//!
//! The default filter is a Bloom filter sized for 100,000 items at a 0.1%
//! false-positive rate. A false positive suppresses a new item; a false
//! negative never happens, so nothing is sent twice while a bucket lives.

mod bucket;
mod filter;
mod persist;
mod store;

pub use bucket::{BUCKET_FILE_SUFFIX, BucketKey};
pub use filter::{
    BloomFilter, DEFAULT_EXPECTED_ITEMS, DEFAULT_FALSE_POSITIVE_RATE, ExactSet, FilterParams,
    MembershipFilter,
};
pub use persist::atomic_write;
pub use store::{BucketSummary, DEFAULT_BUCKET_EXPIRATION, DedupStore, StoreConfig};
