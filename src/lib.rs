//! Bucket storage core for a server-side data synchronization engine.
//!
//! Turns an upstream change-data-capture feed into per-bucket append-only
//! operation logs (the [`batch`] writer), serves incremental reads of those
//! logs to clients at a checkpoint (the [`reader`] cursor), maintains a
//! memoized checksum cache ([`checksum`]), and periodically compacts
//! historical log ranges ([`compactor`]). Sync-rule evaluation, source
//! replication, and client-facing transport are external collaborators;
//! this crate only implements the boundary each of them crosses.
//!
//! [`BucketStorage`] is the facade most callers reach for: it owns the
//! shared [`store::BucketStore`], [`source_table::SourceTableRegistry`],
//! and [`checksum::ChecksumCache`] behind `Arc`s and hands out scoped
//! handles (a [`batch::Batch`] per writer, a read-only view per reader)
//! the way the teacher's `Server` owns a `StorageEngine` + `Executor` and
//! hands out per-connection sessions (`lib.rs`).

pub mod batch;
pub mod checksum;
pub mod compactor;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod lifecycle;
pub mod lookup;
pub mod params;
pub mod reader;
pub mod source_table;
pub mod store;
pub mod types;

use std::path::PathBuf;
use std::sync::Arc;

use batch::{Batch, BatchOptions, WriterLocks};
use checksum::{BucketChecksum, ChecksumCache};
use compactor::Compactor;
use config::{ChecksumCacheConfig, CompactorConfig};
use error::Result;
use evaluator::Evaluator;
use lifecycle::GroupAdmin;
use lookup::LookupBytes;
use reader::{get_bucket_data_batch, BucketDataBatchOptions, SyncBucketData};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use source_table::SourceTableRegistry;
use store::BucketStore;
use types::{Bucket, GroupId, OpId};

/// `getCheckpoint() -> {checkpoint, lsn}`, rendered for the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointView {
    pub checkpoint: OpId,
    pub lsn: Option<String>,
}

/// The bucket storage core, scoped to one process. Owns the shared store,
/// source-table registry, checksum cache, and per-group writer locks;
/// everything else (batches, readers, admin handles) borrows from this.
pub struct BucketStorage {
    store: Arc<BucketStore>,
    registry: Arc<SourceTableRegistry>,
    checksum_cache: Arc<ChecksumCache>,
    locks: WriterLocks,
    evaluator: Arc<dyn Evaluator>,
    compactor: Option<Compactor>,
}

impl BucketStorage {
    /// An ephemeral, in-memory-only instance: no `data_dir`, nothing
    /// survives process restart. Suitable for tests and for deployments
    /// that rebuild state from a full resync on every start.
    pub fn in_memory(evaluator: Arc<dyn Evaluator>) -> Self {
        BucketStorage {
            store: Arc::new(BucketStore::in_memory()),
            registry: Arc::new(SourceTableRegistry::new()),
            checksum_cache: Arc::new(ChecksumCache::new(ChecksumCacheConfig::default())),
            locks: WriterLocks::new(),
            evaluator,
            compactor: None,
        }
    }

    /// Open (and replay) a file-backed instance rooted at `data_dir`.
    pub fn open(data_dir: PathBuf, evaluator: Arc<dyn Evaluator>) -> Result<Self> {
        Ok(BucketStorage {
            store: Arc::new(BucketStore::open(data_dir)?),
            registry: Arc::new(SourceTableRegistry::new()),
            checksum_cache: Arc::new(ChecksumCache::new(ChecksumCacheConfig::default())),
            locks: WriterLocks::new(),
            evaluator,
            compactor: None,
        })
    }

    pub fn store(&self) -> &BucketStore {
        &self.store
    }

    pub fn registry(&self) -> &SourceTableRegistry {
        &self.registry
    }

    pub fn evaluator(&self) -> &dyn Evaluator {
        self.evaluator.as_ref()
    }

    /// `Batch::open(group_id, options)`: the ingress entry point. Exactly
    /// one open batch per group at a time; a second `open_batch` call for
    /// the same group fails until the first is dropped (§5).
    pub fn open_batch(&self, group_id: GroupId, options: BatchOptions) -> Result<Batch<'_>> {
        Batch::open(&self.store, &self.registry, self.evaluator.as_ref(), &self.locks, group_id, options)
    }

    /// `getCheckpoint()`. Applies the "checkpoint hidden before
    /// no_checkpoint_before_lsn" rule of §4.4/I6.
    pub fn get_checkpoint(&self, group_id: GroupId) -> Result<CheckpointView> {
        let checkpoint = self.store.get_checkpoint(group_id)?;
        let (op_id, lsn) = checkpoint.visible();
        Ok(CheckpointView { checkpoint: op_id, lsn })
    }

    /// `getBucketDataBatch(checkpoint, buckets, opts)`, collected eagerly.
    /// Prefer [`reader::BucketDataCursor`] directly when the caller wants
    /// to drive the scan incrementally (§9: never prefetch more than one
    /// storage chunk ahead).
    pub fn get_bucket_data_batch(
        &self,
        group_id: GroupId,
        checkpoint: OpId,
        buckets: impl IntoIterator<Item = (Bucket, OpId)>,
        opts: BucketDataBatchOptions,
    ) -> Vec<SyncBucketData> {
        get_bucket_data_batch(&self.store, group_id, checkpoint, buckets, opts)
    }

    /// `getParameterSets(checkpoint, lookups)`.
    pub fn get_parameter_sets(&self, group_id: GroupId, checkpoint: OpId, lookups: &[LookupBytes]) -> Vec<JsonValue> {
        params::get_parameter_sets(&self.store, group_id, checkpoint, lookups)
    }

    /// `getChecksums(checkpoint, buckets)`.
    pub fn get_checksums(
        &self,
        group_id: GroupId,
        checkpoint: OpId,
        buckets: &[Bucket],
    ) -> std::collections::HashMap<Bucket, BucketChecksum> {
        self.checksum_cache.get_checksum_map(&self.store, group_id, checkpoint, buckets)
    }

    /// A scoped handle for admin operations (`autoActivate`, `terminate`,
    /// `clear`, `reportError`) over one group.
    pub fn admin(&self) -> GroupAdmin<'_> {
        GroupAdmin::new(&self.store, &self.checksum_cache)
    }

    /// Run one compaction pass synchronously over every known bucket of
    /// `group_id`, without spawning a background thread. Useful for tests
    /// and for callers that prefer to drive compaction from their own
    /// scheduler.
    pub fn compact_now(
        &self,
        group_id: GroupId,
        config: &CompactorConfig,
    ) -> std::collections::HashMap<Bucket, compactor::CompactionStats> {
        compactor::compact_group(&self.store, group_id, config)
    }

    /// Spawn the background compactor worker over `group_ids`. The handle
    /// is retained on `self` and joined on `Drop`; calling this a second
    /// time replaces (and joins) the previous worker.
    pub fn spawn_compactor(&mut self, group_ids: Vec<GroupId>, config: CompactorConfig) {
        self.compactor = Some(Compactor::spawn(Arc::clone(&self.store), group_ids, config));
    }

    /// Wake the background compactor immediately, if one is running.
    pub fn trigger_compaction(&self) {
        if let Some(compactor) = &self.compactor {
            compactor.trigger_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::ChangeTag;
    use crate::evaluator::{EvaluatedRow, EvaluationError, EvaluationInput, ParameterResult, RowResult};
    use crate::source_table::{ReplicaColumn, SourceTableDescriptor};

    struct RegionEvaluator;

    impl Evaluator for RegionEvaluator {
        fn evaluate_row(&self, input: EvaluationInput<'_>) -> Vec<RowResult> {
            let region = input.record.get("region").and_then(|v| v.as_str());
            match region {
                Some(r) => vec![Ok(EvaluatedRow {
                    bucket: format!("by_region[\"{}\"]", r),
                    output_table: "users".to_string(),
                    id: input.record.get("id").map(|v| v.to_string()).unwrap_or_default(),
                    data: input.record.clone(),
                })],
                None => vec![Err(EvaluationError::new("missing region"))],
            }
        }

        fn evaluate_parameter_row(&self, _input: EvaluationInput<'_>) -> Vec<ParameterResult> {
            Vec::new()
        }
    }

    #[test]
    fn end_to_end_ingest_read_checksum() {
        let storage = BucketStorage::in_memory(Arc::new(RegionEvaluator));

        let outcome = storage
            .registry()
            .resolve_table(
                1,
                1,
                "pg",
                SourceTableDescriptor {
                    relation_id: "100".to_string(),
                    schema: "public".to_string(),
                    name: "users".to_string(),
                    replica_columns: vec![ReplicaColumn {
                        name: "id".to_string(),
                        data_type: "int".to_string(),
                        type_oid: None,
                    }],
                },
                storage.evaluator(),
            )
            .unwrap();
        let mut table = outcome.table;
        table.syncs_data = true;

        {
            let mut batch = storage.open_batch(1, BatchOptions::default()).unwrap();
            batch
                .save(crate::batch::RowChange {
                    tag: ChangeTag::Insert,
                    source_table: table,
                    before: None,
                    after: Some(serde_json::json!({"id": 1, "region": "eu"})),
                })
                .unwrap();
            batch.commit("10");
            batch.flush().unwrap();
        }

        let checkpoint = storage.get_checkpoint(1).unwrap();
        assert_eq!(checkpoint.checkpoint, OpId(1));
        assert_eq!(checkpoint.lsn.as_deref(), Some("10"));

        let batches = storage.get_bucket_data_batch(
            1,
            checkpoint.checkpoint,
            [("by_region[\"eu\"]".to_string(), OpId::ZERO)],
            BucketDataBatchOptions::default(),
        );
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].data.len(), 1);

        let checksums = storage.get_checksums(1, checkpoint.checkpoint, &["by_region[\"eu\"]".to_string()]);
        assert_eq!(checksums["by_region[\"eu\"]"].count, 1);
        assert!(!checksums["by_region[\"eu\"]"].is_full);
    }

    #[test]
    fn checkpoint_hidden_before_snapshot_boundary() {
        let storage = BucketStorage::in_memory(Arc::new(RegionEvaluator));
        {
            let mut batch = storage
                .open_batch(
                    1,
                    BatchOptions {
                        zero_lsn: "9".to_string(),
                        store_current_data: true,
                    },
                )
                .unwrap();
            batch.keepalive("5").unwrap();
        }
        let checkpoint = storage.get_checkpoint(1).unwrap();
        assert_eq!(checkpoint.checkpoint, OpId::ZERO);
        assert_eq!(checkpoint.lsn, None);
    }
}
