//! Per-subsystem configuration structs.
//!
//! Grounded in the teacher's `Config`/`GraniteConfig`/`SandstoneConfig`
//! pattern (`lib.rs`, `engines/granite/config.rs`,
//! `engines/sandstone/config.rs`): one small `Default`-able struct per
//! subsystem, with named presets where a subsystem has more than one
//! sensible operating point.

use std::time::Duration;

/// Options for the Bucket Batch Writer (§4.4).
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Auto-flush once buffered bytes exceed this threshold.
    pub flush_threshold_bytes: usize,
    /// Upper bound on how long a batch may buffer before an idle flush,
    /// used by callers that drive `Batch` from a timer rather than purely
    /// on `save()` backpressure.
    pub flush_interval: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        WriterConfig {
            flush_threshold_bytes: crate::batch::DEFAULT_FLUSH_THRESHOLD_BYTES,
            flush_interval: Duration::from_secs(5),
        }
    }
}

impl WriterConfig {
    /// Smaller buffers, more frequent flushes: lower latency to readers at
    /// the cost of more, smaller storage writes.
    pub fn low_latency() -> Self {
        WriterConfig {
            flush_threshold_bytes: 4 * 1024 * 1024,
            flush_interval: Duration::from_millis(500),
        }
    }

    /// Larger buffers, less frequent flushes: fewer, larger storage writes.
    pub fn high_throughput() -> Self {
        WriterConfig {
            flush_threshold_bytes: 200 * 1024 * 1024,
            flush_interval: Duration::from_secs(30),
        }
    }
}

/// Options for the background Compactor (§4.8).
#[derive(Debug, Clone)]
pub struct CompactorConfig {
    /// Soft cap on the memory the compactor may buffer while rewriting a
    /// bucket; exceeding it forces an early batch boundary.
    pub memory_limit_mb: usize,
    /// Don't compact within this many op-ids of the bucket's tip at the
    /// start of the run (the "Open Questions" note in §4.9/§4.8: the tip
    /// may keep advancing while compaction runs, so the window is bounded
    /// relative to the tip observed at start, not re-measured per bucket).
    pub max_op_id_lag: u64,
    /// Maximum ops collapsed into a single CLEAR batch write.
    pub clear_batch_lines: usize,
    /// Maximum ops rewritten into MOVEs in a single batch write.
    pub move_batch_lines: usize,
    /// How often the background worker wakes to check for compactable
    /// buckets.
    pub interval: Duration,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        CompactorConfig {
            memory_limit_mb: 128,
            max_op_id_lag: 10_000,
            clear_batch_lines: 5_000,
            move_batch_lines: 5_000,
            interval: Duration::from_secs(60),
        }
    }
}

impl CompactorConfig {
    /// Aggressive compaction: shorter lag window, smaller batches, tighter
    /// loop. Useful for groups with many small buckets and frequent REMOVE
    /// churn.
    pub fn aggressive() -> Self {
        CompactorConfig {
            memory_limit_mb: 64,
            max_op_id_lag: 1_000,
            clear_batch_lines: 1_000,
            move_batch_lines: 1_000,
            interval: Duration::from_secs(10),
        }
    }

    /// Conservative compaction: wide lag window, large batches, long loop.
    /// Favors fewer storage writes over cold-read acceleration.
    pub fn conservative() -> Self {
        CompactorConfig {
            memory_limit_mb: 256,
            max_op_id_lag: 100_000,
            clear_batch_lines: 20_000,
            move_batch_lines: 20_000,
            interval: Duration::from_secs(600),
        }
    }
}

/// Options for the Checksum Cache (§4.7).
#[derive(Debug, Clone, Copy)]
pub struct ChecksumCacheConfig {
    /// Maximum number of `(group, bucket)` entries retained in the LRU.
    pub capacity: usize,
}

impl Default for ChecksumCacheConfig {
    fn default() -> Self {
        ChecksumCacheConfig { capacity: 4096 }
    }
}

/// Options for the Bucket Reader (§4.5).
#[derive(Debug, Clone, Copy)]
pub struct ReaderOptions {
    /// Stop scanning once this many ops have been read across all buckets
    /// in this call, regardless of `chunk_limit_bytes`.
    pub limit: usize,
    /// Start a new output batch once accumulated serialized size reaches
    /// this many bytes.
    pub chunk_limit_bytes: usize,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        ReaderOptions {
            limit: 10_000,
            chunk_limit_bytes: 1_000_000,
        }
    }
}
