//! Checksum Cache: a range-additive checksum memoization with CLEAR-aware
//! full-checksum detection.
//!
//! Bounded-capacity, evict-oldest memoization keyed by `(group, bucket)`:
//! a hit folds only the ops since the cached checkpoint rather than
//! rescanning the whole bucket.

use crate::config::ChecksumCacheConfig;
use crate::store::{BucketStore, OpKind};
use crate::types::{Bucket, Checksum, GroupId, OpId};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;

/// A bucket's checksum as of some checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BucketChecksum {
    pub count: u64,
    pub checksum: Checksum,
    /// True if any CLEAR op exists in the range folded into this value: a
    /// CLEAR resets the bucket, so the checksum up to and including it is a
    /// *full* checksum rather than a partial one.
    pub is_full: bool,
}

impl BucketChecksum {
    fn fold(self, partial: RangeAggregate) -> Self {
        BucketChecksum {
            count: self.count + partial.count,
            checksum: self.checksum.add(partial.checksum_total),
            is_full: self.is_full || partial.has_clear_op,
        }
    }
}

/// The underlying per-range aggregation: ops grouped by bucket and folded
/// into a count/checksum/has-clear triple.
#[derive(Debug, Clone, Copy, Default)]
struct RangeAggregate {
    count: u64,
    checksum_total: Checksum,
    has_clear_op: bool,
}

fn aggregate_range(store: &BucketStore, group_id: GroupId, bucket: &str, after: OpId, upto: OpId) -> RangeAggregate {
    let mut agg = RangeAggregate::default();
    for op in store.scan_bucket(group_id, bucket, after, upto) {
        agg.count += 1;
        agg.checksum_total = agg.checksum_total.add(op.checksum);
        if op.op_kind == OpKind::Clear {
            agg.has_clear_op = true;
        }
    }
    agg
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    checkpoint: OpId,
    value: BucketChecksum,
}

/// LRU-bounded memoizing fold over `(checkpoint, bucket)`, scoped to one
/// sync-rule group's handle. Interior-mutable so it can be shared behind a
/// single `Arc` the way the group's parse cache is (§9 "shared caches").
pub struct ChecksumCache {
    inner: Mutex<LruCache<(GroupId, Bucket), CacheEntry>>,
}

impl ChecksumCache {
    pub fn new(config: ChecksumCacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity.max(1)).expect("capacity is at least 1");
        ChecksumCache {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// `getChecksumMap(checkpoint, buckets)`.
    ///
    /// For each requested bucket: on a cache hit at checkpoint `C' <=
    /// checkpoint`, fetch the partial `(C', checkpoint]` range from storage
    /// and fold it into the cached value. On a miss, compute `(0,
    /// checkpoint]` directly. Either way the result is cached at the new
    /// checkpoint before returning. Buckets with zero ops still get a
    /// `{count:0, checksum:0, is_full:false}` entry so callers can
    /// distinguish "empty" from "not mentioned" (§4.7 boundary behavior).
    pub fn get_checksum_map(
        &self,
        store: &BucketStore,
        group_id: GroupId,
        checkpoint: OpId,
        buckets: &[Bucket],
    ) -> std::collections::HashMap<Bucket, BucketChecksum> {
        let mut out = std::collections::HashMap::with_capacity(buckets.len());
        let mut cache = self.inner.lock().expect("checksum cache lock poisoned");

        for bucket in buckets {
            let key = (group_id, bucket.clone());
            let cached = cache.get(&key).copied();

            let value = match cached {
                Some(entry) if entry.checkpoint <= checkpoint => {
                    let partial = aggregate_range(store, group_id, bucket, entry.checkpoint, checkpoint);
                    entry.value.fold(partial)
                }
                // A cached entry at a checkpoint *past* the one requested
                // can't be reused downward (the fold is only additive going
                // forward); recompute from scratch rather than risk
                // returning a superset.
                _ => {
                    let partial = aggregate_range(store, group_id, bucket, OpId::ZERO, checkpoint);
                    BucketChecksum::default().fold(partial)
                }
            };

            cache.put(
                key,
                CacheEntry {
                    checkpoint,
                    value,
                },
            );
            out.insert(bucket.clone(), value);
        }

        out
    }

    /// Drop every cached entry for `group_id`. Used by `terminate`/`clear`
    /// (§4.9) so a torn-down group's stale checksums can't leak into a
    /// later group that happens to reuse the same bucket names.
    pub fn invalidate_group(&self, group_id: GroupId) {
        let mut cache = self.inner.lock().expect("checksum cache lock poisoned");
        let stale: Vec<(GroupId, Bucket)> = cache
            .iter()
            .filter(|((g, _), _)| *g == group_id)
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            cache.pop(&key);
        }
    }
}
