//! Parameter-Query Index (§4.6): converts client sync-parameters into
//! bucket-parameter rows via the `(group, lookup_bytes) -> bucket_parameters`
//! reverse index maintained by the store.

use crate::lookup::LookupBytes;
use crate::store::BucketStore;
use crate::types::{GroupId, OpId};
use serde_json::Value as JsonValue;

/// `getParameterSets(checkpoint, lookups) -> list<JSON row>`.
///
/// For each lookup, finds the `BucketParameterRow` with the greatest
/// `op_id <= checkpoint` matching that lookup. A tombstone (empty
/// `bucket_parameters`) contributes nothing; otherwise its rows are
/// concatenated into the result. Results across lookups are concatenated in
/// an unspecified order -- callers must treat the result as a set.
pub fn get_parameter_sets(
    store: &BucketStore,
    group_id: GroupId,
    checkpoint: OpId,
    lookups: &[LookupBytes],
) -> Vec<JsonValue> {
    let mut out = Vec::new();
    for lookup in lookups {
        if let Some(row) = store.latest_param_row(group_id, lookup, checkpoint) {
            out.extend(row.bucket_parameters);
        }
    }
    out
}
