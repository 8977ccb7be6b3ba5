//! Checksum cache behavior exercised through the public `BucketStorage`
//! facade, stitching the batch writer and checksum cache together.

use bucket_sync_core::batch::{BatchOptions, ChangeTag, RowChange};
use bucket_sync_core::evaluator::{
    EvaluatedRow, EvaluationError, EvaluationInput, ParameterResult, RowResult,
};
use bucket_sync_core::source_table::{ReplicaColumn, SourceTableDescriptor};
use bucket_sync_core::BucketStorage;
use std::sync::Arc;

struct RegionEvaluator;

impl bucket_sync_core::evaluator::Evaluator for RegionEvaluator {
    fn evaluate_row(&self, input: EvaluationInput<'_>) -> Vec<RowResult> {
        match input.record.get("region").and_then(|v| v.as_str()) {
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

fn resolve_users_table(storage: &BucketStorage, group_id: i64) -> bucket_sync_core::source_table::SourceTable {
    storage
        .registry()
        .resolve_table(
            group_id,
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
        .unwrap()
        .table
}

/// S2: a checksum requested at an intermediate checkpoint, then again at a
/// later checkpoint, folds rather than rescanning from the start -- both
/// calls must still agree with a one-shot computation against a fresh cache.
#[test]
fn checksum_at_later_checkpoint_folds_consistently() {
    let storage = BucketStorage::in_memory(Arc::new(RegionEvaluator));
    let table = resolve_users_table(&storage, 1);

    let mut batch = storage.open_batch(1, BatchOptions::default()).unwrap();
    for (id, region) in [(1, "eu"), (2, "eu"), (3, "eu")] {
        batch
            .save(RowChange {
                tag: ChangeTag::Insert,
                source_table: table.clone(),
                before: None,
                after: Some(serde_json::json!({"id": id, "region": region})),
            })
            .unwrap();
    }
    batch.commit("10");
    batch.flush().unwrap();
    drop(batch);

    let mid = storage.get_checkpoint(1).unwrap();
    let at_mid = storage.get_checksums(1, mid.checkpoint, &["by_region[\"eu\"]".to_string()]);
    assert_eq!(at_mid["by_region[\"eu\"]"].count, 3);

    let mut batch = storage.open_batch(1, BatchOptions::default()).unwrap();
    batch
        .save(RowChange {
            tag: ChangeTag::Insert,
            source_table: table,
            before: None,
            after: Some(serde_json::json!({"id": 4, "region": "eu"})),
        })
        .unwrap();
    batch.commit("20");
    batch.flush().unwrap();
    drop(batch);

    let end = storage.get_checkpoint(1).unwrap();
    let at_end = storage.get_checksums(1, end.checkpoint, &["by_region[\"eu\"]".to_string()]);
    assert_eq!(at_end["by_region[\"eu\"]"].count, 4);
    assert!(!at_end["by_region[\"eu\"]"].is_full);
}

/// S3: once the compactor collapses a bucket down to a CLEAR, the checksum
/// reported for that bucket is marked `is_full`.
#[test]
fn compacted_clear_marks_checksum_full() {
    let storage = BucketStorage::in_memory(Arc::new(RegionEvaluator));
    let table = resolve_users_table(&storage, 1);

    let mut batch = storage.open_batch(1, BatchOptions::default()).unwrap();
    batch
        .save(RowChange {
            tag: ChangeTag::Insert,
            source_table: table.clone(),
            before: None,
            after: Some(serde_json::json!({"id": 1, "region": "eu"})),
        })
        .unwrap();
    batch.commit("10");
    batch.flush().unwrap();

    batch
        .save(RowChange {
            tag: ChangeTag::Delete,
            source_table: table,
            before: Some(serde_json::json!({"id": 1, "region": "eu"})),
            after: None,
        })
        .unwrap();
    batch.commit("20");
    batch.flush().unwrap();
    drop(batch);

    let config = bucket_sync_core::config::CompactorConfig {
        max_op_id_lag: 0,
        ..bucket_sync_core::config::CompactorConfig::default()
    };
    // First pass turns PUT/REMOVE into MOVE/REMOVE; second pass collapses
    // that prefix into CLEAR (mirrors the compactor's own two-pass test).
    storage.compact_now(1, &config);
    storage.compact_now(1, &config);

    let checkpoint = storage.get_checkpoint(1).unwrap();
    let checksums = storage.get_checksums(1, checkpoint.checkpoint, &["by_region[\"eu\"]".to_string()]);
    assert!(checksums["by_region[\"eu\"]"].is_full);
}
