//! Lifecycle & Administration (§4.9): group activation, termination, and
//! storage clearing.
//!
//! Grounded in the teacher's `TransactionManager::recover`/WAL deadline
//! pattern (`engines/granite/wal.rs`'s `wait_for_durable(lsn, timeout)`):
//! admin operations here accept a soft deadline and retry with backoff
//! rather than failing outright on a single transient storage timeout,
//! matching §5's "Cancellation & timeouts" and §7's retry policy for
//! `TransientStorageError`.

use crate::checksum::ChecksumCache;
use crate::error::{BucketStoreError, Result};
use crate::source_table::SourceTableRegistry;
use crate::store::{BucketStore, GroupState};
use crate::types::GroupId;
use std::thread;
use std::time::Duration;

/// `terminate({clear_storage})` options.
#[derive(Debug, Clone, Copy)]
pub struct TerminateOptions {
    pub clear_storage: bool,
}

impl Default for TerminateOptions {
    fn default() -> Self {
        TerminateOptions { clear_storage: true }
    }
}

/// Administrative operations over one sync-rule group's handle: activation,
/// termination, storage clearing, and fatal-error reporting. Holds shared
/// references rather than owning the store/cache, since those are also
/// shared with readers and the writer batch.
pub struct GroupAdmin<'a> {
    store: &'a BucketStore,
    cache: &'a ChecksumCache,
}

impl<'a> GroupAdmin<'a> {
    pub fn new(store: &'a BucketStore, cache: &'a ChecksumCache) -> Self {
        GroupAdmin { store, cache }
    }

    /// `autoActivate()`: transactionally move this group from PROCESSING to
    /// ACTIVE, demoting any other ACTIVE group in the same logical role
    /// (here: sharing a `role_of` classification the caller supplies, e.g.
    /// "all groups compiled from the same sync-rule source") to STOP.
    pub fn auto_activate(&self, group_id: GroupId, sibling_group_ids: &[GroupId]) -> Result<()> {
        let mut checkpoint = self.store.get_checkpoint(group_id)?;
        if checkpoint.state != GroupState::Processing {
            return Ok(());
        }

        for sibling in sibling_group_ids {
            if *sibling == group_id {
                continue;
            }
            if let Ok(mut sibling_checkpoint) = self.store.get_checkpoint(*sibling) {
                if sibling_checkpoint.state == GroupState::Active {
                    sibling_checkpoint.state = GroupState::Stop;
                    self.store.put_checkpoint(sibling_checkpoint);
                    log::info!("demoted group {} to STOP for activation of group {}", sibling, group_id);
                }
            }
        }

        checkpoint.state = GroupState::Active;
        self.store.put_checkpoint(checkpoint);
        log::info!("group {} activated", group_id);
        Ok(())
    }

    /// `terminate({clear_storage})`: set state=TERMINATED, null out the
    /// persisted LSN, and (by default) drop all op/parameter/current-data
    /// entries for the group.
    pub fn terminate(&self, group_id: GroupId, opts: TerminateOptions) -> Result<()> {
        let mut checkpoint = self.store.get_checkpoint(group_id)?;
        checkpoint.state = GroupState::Terminated;
        checkpoint.last_checkpoint_lsn = None;
        self.store.put_checkpoint(checkpoint);

        if opts.clear_storage {
            self.clear(group_id, Duration::from_secs(30))?;
        }
        self.cache.invalidate_group(group_id);
        log::info!("group {} terminated (clear_storage={})", group_id, opts.clear_storage);
        Ok(())
    }

    /// `clear()`: idempotent; tolerates storage-engine operation timeouts
    /// by retrying with a backoff of `deadline/5` per §5's cancellation and
    /// timeout policy, logging each retry. Progress per attempt is safe
    /// because `remove_group` is itself atomic from a reader's perspective
    /// (readers either see the group or don't; there is no half-cleared
    /// state visible across the boundary, per I6).
    pub fn clear(&self, group_id: GroupId, deadline: Duration) -> Result<()> {
        let backoff = (deadline / 5).max(Duration::from_millis(1));
        let mut attempt = 0u32;
        loop {
            match self.store.remove_group(group_id) {
                Ok(()) => {
                    self.cache.invalidate_group(group_id);
                    return Ok(());
                }
                Err(BucketStoreError::Storage(msg)) if attempt < 5 => {
                    attempt += 1;
                    log::warn!(
                        "clear() retry {} for group {} after transient storage error: {}",
                        attempt,
                        group_id,
                        msg
                    );
                    thread::sleep(backoff);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// `reportError(e)`: persist `last_fatal_error` without failing the
    /// caller, even if the checkpoint lookup itself errors (there is
    /// nowhere further to escalate from inside error reporting).
    pub fn report_error(&self, group_id: GroupId, message: impl Into<String>) {
        let message = message.into();
        match self.store.get_checkpoint(group_id) {
            Ok(mut checkpoint) => {
                checkpoint.last_fatal_error = Some(message.clone());
                checkpoint.state = GroupState::Stop;
                self.store.put_checkpoint(checkpoint);
            }
            Err(e) => {
                log::error!(
                    "reportError: could not load checkpoint for group {} ({}); error was: {}",
                    group_id,
                    e,
                    message
                );
            }
        }
        log::error!("group {} fatal error: {}", group_id, message);
    }
}

/// Tear down a source-table registry's entries for a group alongside
/// `GroupAdmin::clear`. Kept separate since the registry is a distinct
/// in-memory structure from `BucketStore` and has no group-scoped bulk
/// removal of its own (it is keyed by internal table id, not group id).
pub fn clear_source_tables(registry: &SourceTableRegistry, group_id: GroupId) {
    let ids: Vec<i64> = registry.all_for_group(group_id).iter().map(|t| t.internal_id).collect();
    registry.remove(&ids);
}
