//! Bucket Reader: serves range scans over `(bucket, op_id]` windows as
//! bounded batches to clients (§4.5).
//!
//! Grounded in the teacher's cursor-style `ResultSet`/`scan_table` pattern
//! (`storage.rs`, `executor/mod.rs`): a pull-based iterator that yields one
//! output chunk per step rather than materializing the whole scan, matching
//! §9's "never prefetch more than one storage chunk ahead" note.

use crate::store::{BucketOp, BucketStore, OpKind};
use crate::types::{Bucket, GroupId, OpId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Options controlling a single `getBucketDataBatch` call.
#[derive(Debug, Clone, Copy)]
pub struct BucketDataBatchOptions {
    pub limit: usize,
    pub chunk_limit_bytes: usize,
}

impl Default for BucketDataBatchOptions {
    fn default() -> Self {
        BucketDataBatchOptions {
            limit: 10_000,
            chunk_limit_bytes: 1_000_000,
        }
    }
}

/// One op as rendered to a client, stripped of storage-internal fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncOp {
    pub op_id: OpId,
    pub op: WireOpKind,
    pub subkey: Option<String>,
    pub table: Option<String>,
    pub row_id: Option<String>,
    pub data: Option<JsonValue>,
    pub checksum: crate::types::Checksum,
    pub target_op: Option<OpId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireOpKind {
    Put,
    Remove,
    Move,
    Clear,
}

impl From<OpKind> for WireOpKind {
    fn from(k: OpKind) -> Self {
        match k {
            OpKind::Put => WireOpKind::Put,
            OpKind::Remove => WireOpKind::Remove,
            OpKind::Move => WireOpKind::Move,
            OpKind::Clear => WireOpKind::Clear,
        }
    }
}

impl From<&BucketOp> for SyncOp {
    fn from(op: &BucketOp) -> Self {
        SyncOp {
            op_id: op.op_id,
            op: op.op_kind.into(),
            subkey: op.subkey.clone(),
            table: op.table.clone(),
            row_id: op.row_id.clone(),
            data: op.data.clone(),
            checksum: op.checksum,
            target_op: op.target_op,
        }
    }
}

/// One output batch of `getBucketDataBatch`: all-or-part of one bucket's
/// pending ops.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncBucketData {
    pub bucket: Bucket,
    /// The `after_op_id` this batch's ops continue from.
    pub after: OpId,
    /// The client's next request for this bucket must pass this as `after`.
    pub next_after: OpId,
    /// True when the same bucket has more ops not yet delivered in this
    /// response.
    pub has_more: bool,
    pub data: Vec<SyncOp>,
    /// The maximum `target_op` carried by any MOVE/CLEAR op in this batch,
    /// if any; clients may use it to skip forward.
    pub target_op: Option<OpId>,
}

/// A lazily-driven cursor over a client's requested `(bucket, after_op_id)`
/// map, bounded by `checkpoint`. Each call to `next_batch` advances the scan
/// by at most one storage chunk and returns the next `SyncBucketData`, or
/// `None` once every bucket is exhausted.
///
/// Reads observe a consistent snapshot: `checkpoint` is fixed for the
/// lifetime of the cursor, so ops committed by flushes that land mid-scan
/// are never observed (§4.5).
pub struct BucketDataCursor<'a> {
    store: &'a BucketStore,
    group_id: GroupId,
    checkpoint: OpId,
    opts: BucketDataBatchOptions,
    // Remaining (bucket, after_op_id) requests, in the order supplied by
    // the caller. Each is drained fully (possibly across several returned
    // batches) before moving to the next.
    pending: std::collections::VecDeque<(Bucket, OpId)>,
    // Ops for the bucket currently being drained, queued but not yet
    // emitted; refilled from storage one bucket at a time.
    current_bucket: Option<Bucket>,
    current_ops: std::collections::VecDeque<BucketOp>,
    total_emitted: usize,
    limit_reached: bool,
}

impl<'a> BucketDataCursor<'a> {
    pub fn new(
        store: &'a BucketStore,
        group_id: GroupId,
        checkpoint: OpId,
        buckets: impl IntoIterator<Item = (Bucket, OpId)>,
        opts: BucketDataBatchOptions,
    ) -> Self {
        BucketDataCursor {
            store,
            group_id,
            checkpoint,
            opts,
            pending: buckets.into_iter().collect(),
            current_bucket: None,
            current_ops: std::collections::VecDeque::new(),
            total_emitted: 0,
            limit_reached: false,
        }
    }

    /// Pull the next output batch. Returns `None` once every requested
    /// bucket has been fully drained (or the global `limit` has been hit
    /// and there is nothing left buffered to flush out).
    pub fn next_batch(&mut self) -> Option<SyncBucketData> {
        loop {
            if self.current_ops.is_empty() {
                if !self.refill() {
                    return None;
                }
            }

            let bucket = self.current_bucket.clone()?;
            let after = self
                .pending
                .iter()
                .find(|(b, _)| b == &bucket)
                .map(|(_, a)| *a)
                .unwrap_or(OpId::ZERO);

            let mut batch_ops: Vec<BucketOp> = Vec::new();
            let mut batch_bytes = 0usize;
            let mut target_op: Option<OpId> = None;

            while let Some(op) = self.current_ops.front() {
                if self.total_emitted >= self.opts.limit {
                    self.limit_reached = true;
                    break;
                }
                if !batch_ops.is_empty() && batch_bytes >= self.opts.chunk_limit_bytes {
                    break;
                }
                let op = self.current_ops.pop_front().unwrap();
                batch_bytes += estimate_op_bytes(&op);
                if let Some(t) = op.target_op {
                    target_op = Some(target_op.map_or(t, |cur| cur.max(t)));
                }
                self.total_emitted += 1;
                batch_ops.push(op);
                if self.total_emitted >= self.opts.limit {
                    // Per §4.5/§8: ops-returned reaching `limit` means
                    // `has_more = true` globally, even if this exact op
                    // happened to drain the cursor -- the client can't tell
                    // "drained" apart from "cut off by the limit" otherwise.
                    self.limit_reached = true;
                    break;
                }
            }

            if batch_ops.is_empty() {
                // limit hit before anything could be emitted for this
                // bucket: surface as an empty exhausted cursor.
                return None;
            }

            let next_after = batch_ops.last().expect("non-empty").op_id;
            let has_more = !self.current_ops.is_empty() || self.limit_reached;

            // Advance this bucket's resume point so a subsequent
            // `next_batch` call (or a later cursor built from the client's
            // `next_after`) continues correctly.
            if let Some(entry) = self.pending.iter_mut().find(|(b, _)| b == &bucket) {
                entry.1 = next_after;
            }
            if self.current_ops.is_empty() {
                self.pending.retain(|(b, _)| b != &bucket);
                self.current_bucket = None;
            }

            return Some(SyncBucketData {
                bucket,
                after,
                next_after,
                has_more,
                data: batch_ops.iter().map(SyncOp::from).collect(),
                target_op,
            });
        }
    }

    /// Load the next bucket's full op range into `current_ops`. Returns
    /// `false` once there is nothing left to scan.
    fn refill(&mut self) -> bool {
        while let Some((bucket, after)) = self.pending.front().cloned() {
            if self.total_emitted >= self.opts.limit {
                return false;
            }
            let ops = self.store.scan_bucket(self.group_id, &bucket, after, self.checkpoint);
            if ops.is_empty() {
                self.pending.pop_front();
                continue;
            }
            self.current_bucket = Some(bucket);
            self.current_ops = ops.into_iter().collect();
            return true;
        }
        false
    }
}

/// `getBucketDataBatch(checkpoint, buckets, opts)`: drive a cursor to
/// completion and collect every output batch. Exposed for callers that
/// don't need incremental delivery (e.g. tests); production call sites
/// should prefer driving `BucketDataCursor` directly so they can stop
/// early / apply backpressure per §9.
pub fn get_bucket_data_batch(
    store: &BucketStore,
    group_id: GroupId,
    checkpoint: OpId,
    buckets: impl IntoIterator<Item = (Bucket, OpId)>,
    opts: BucketDataBatchOptions,
) -> Vec<SyncBucketData> {
    let mut cursor = BucketDataCursor::new(store, group_id, checkpoint, buckets, opts);
    let mut out = Vec::new();
    while let Some(batch) = cursor.next_batch() {
        out.push(batch);
    }
    out
}

fn estimate_op_bytes(op: &BucketOp) -> usize {
    let mut size = 64;
    if let Some(d) = &op.data {
        size += serde_json::to_vec(d).map(|v| v.len()).unwrap_or(0);
    }
    size
}
