//! Startup and periodic recovery of allocation state from the checkpoint.
//!
//! Recovery runs in two steps. The checkpoint is read and fully decoded
//! without touching the table, then the decoded records are merged under
//! the table lock. A failure in the first step leaves the table unchanged.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use bbuf_state::{
    decode, AllocationKey, AllocationRecord, AllocationTable, CheckpointStore, CodecError, Generation,
    JobBinding, StoreError,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Errors that stop recovery.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error(transparent)]
    Read(#[from] StoreError),

    #[error(
        "can not recover burst buffer state from {}, data version incompatible: {source}",
        .path.display()
    )]
    Incompatible { path: PathBuf, source: CodecError },

    #[error("incomplete burst buffer checkpoint {}: {source}", .path.display())]
    Corrupt { path: PathBuf, source: CodecError },

    #[error("recovery task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl RecoveryError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Read(e) => e.reason_code(),
            Self::Incompatible { .. } => "state_incompatible",
            Self::Corrupt { .. } => "state_corrupt",
            Self::Task(_) => "recovery_task_failed",
        }
    }
}

/// What a recovery pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoverySummary {
    /// Checkpoint file the records came from.
    pub source: Option<PathBuf>,
    /// The current file was unusable and the previous generation was used.
    pub from_previous_generation: bool,
    pub recovered: usize,
    /// Records dropped for violating record invariants: no name, a repeated
    /// key, or an id held by another allocation.
    pub skipped: u32,
    /// The checkpoint was unusable and state loss was tolerated.
    pub discarded: bool,
    /// Unix seconds stamped on every recovered record.
    pub recovered_at: i64,
}

/// Records read from disk, decoded but not merged.
#[derive(Debug, Default)]
pub struct LoadedState {
    pub records: Vec<AllocationRecord>,
    pub summary: RecoverySummary,
}

/// Read and decode the newest usable checkpoint.
///
/// Unknown format versions and malformed streams are errors unless
/// `ignore_state_errors` is set, in which case they yield an empty state.
pub fn read_checkpoint(
    store: &CheckpointStore,
    ignore_state_errors: bool,
) -> Result<LoadedState, RecoveryError> {
    let Some(stored) = store.read()? else {
        return Ok(LoadedState::default());
    };

    let mut summary = RecoverySummary {
        source: Some(stored.path.clone()),
        from_previous_generation: stored.generation == Generation::Old,
        ..RecoverySummary::default()
    };

    match decode(&stored.data) {
        Ok(checkpoint) => {
            summary.skipped = checkpoint.skipped;
            Ok(LoadedState {
                records: checkpoint.records,
                summary,
            })
        }
        Err(source) => {
            let incompatible = source.is_incompatible();
            let err = if incompatible {
                RecoveryError::Incompatible {
                    path: stored.path,
                    source,
                }
            } else {
                RecoveryError::Corrupt {
                    path: stored.path,
                    source,
                }
            };

            if !ignore_state_errors {
                error!(
                    reason = err.reason_code(),
                    error = %err,
                    "Start with --ignore-state-errors to ignore this. Warning: doing so loses the data that can't be recovered"
                );
                return Err(err);
            }

            error!("**********************************************************************");
            if incompatible {
                error!("Can not recover burst buffer state, data version incompatible");
            } else {
                error!("Incomplete burst buffer data checkpoint file");
            }
            error!("**********************************************************************");
            warn!(error = %err, "Continuing with empty burst buffer state");

            summary.discarded = true;
            Ok(LoadedState {
                records: Vec::new(),
                summary,
            })
        }
    }
}

/// Result of merging decoded records into the table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub merged: usize,
    /// Records whose id already belongs to a different allocation.
    pub conflicts: u32,
}

/// Merge decoded records into the table.
///
/// Persisted fields are overwritten, `seen_time` is refreshed to `now` and
/// numeric names are bound to their job. A record whose id is held by a
/// different allocation is left out so ids stay unique.
pub fn merge(table: &mut AllocationTable, records: &[AllocationRecord], now: i64) -> MergeOutcome {
    let mut owners: HashMap<u32, AllocationKey> =
        table.iter().map(|rec| (rec.id, rec.key())).collect();
    let mut outcome = MergeOutcome::default();

    for incoming in records {
        let key = incoming.key();
        if let Some(owner) = owners.get(&incoming.id).filter(|owner| **owner != key) {
            warn!(
                name = %incoming.name,
                user_id = incoming.user_id,
                id = incoming.id,
                holder = %owner,
                "Skipping recovered burst buffer, id already in use"
            );
            outcome.conflicts += 1;
            continue;
        }

        let previous_id = table.get(&incoming.name, incoming.user_id).map(|rec| rec.id);
        let record = table.insert_or_get(&incoming.name, incoming.user_id);
        record.overwrite_from(incoming);
        record.touch(now);
        if let Some(binding) = JobBinding::from_name(&record.name) {
            record.job = Some(binding);
        }
        debug!(
            name = %record.name,
            user_id = record.user_id,
            id = record.id,
            "Recovered burst buffer"
        );

        let id = record.id;
        table.observe_id(id);
        if let Some(previous_id) = previous_id.filter(|prev| *prev != id) {
            owners.remove(&previous_id);
        }
        owners.insert(id, key);
        outcome.merged += 1;
    }
    outcome
}

/// Enforce configured limits against the recovered table.
///
/// No limits are defined for this plugin yet.
pub fn apply_limits(table: &AllocationTable) {
    debug!(allocations = table.len(), "No burst buffer limits to apply");
}

/// Full recovery pass: read, decode, merge, apply limits.
///
/// Takes the table lock itself, and only once decoding has succeeded.
pub async fn load_state(
    store: Arc<CheckpointStore>,
    table: &Mutex<AllocationTable>,
    ignore_state_errors: bool,
) -> Result<RecoverySummary, RecoveryError> {
    let LoadedState {
        records,
        mut summary,
    } = tokio::task::spawn_blocking(move || read_checkpoint(&store, ignore_state_errors))
        .await??;

    let now = chrono::Utc::now().timestamp();
    let mut table = table.lock().await;
    let outcome = merge(&mut table, &records, now);
    summary.recovered = outcome.merged;
    summary.skipped += outcome.conflicts;
    summary.recovered_at = now;
    apply_limits(&table);
    table.mark_updated();
    drop(table);

    if summary.source.is_some() {
        info!(
            recovered = summary.recovered,
            skipped = summary.skipped,
            discarded = summary.discarded,
            "Recovered state of burst buffers"
        );
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bbuf_state::CheckpointEncoder;
    use std::time::Instant;
    use tempfile::tempdir;

    fn record(id: u32, name: &str, user_id: u32) -> AllocationRecord {
        let mut rec = AllocationRecord::new(id, name, user_id, 100);
        rec.size = 1 << 20;
        rec.account = Some("physics".to_string());
        rec
    }

    #[test]
    fn test_merge_overwrites_and_binds_jobs() {
        let mut table = AllocationTable::new();
        table.insert_or_get("scratch", 1000).qos = Some("normal".to_string());

        let outcome = merge(
            &mut table,
            &[record(9, "scratch", 1000), record(12, "4242", 1001)],
            500,
        );
        assert_eq!(outcome.merged, 2);
        assert_eq!(outcome.conflicts, 0);

        let scratch = table.get("scratch", 1000).unwrap();
        assert_eq!(scratch.id, 9);
        assert_eq!(scratch.qos, None);
        assert_eq!(scratch.seen_time, 500);
        assert!(scratch.job.is_none());

        let job = table.get("4242", 1001).unwrap();
        assert_eq!(job.job_id(), Some(4242));

        // Fresh records never reuse a recovered id.
        assert_eq!(table.insert_or_get("new", 1000).id, 13);
    }

    #[test]
    fn test_merge_skips_id_held_by_another_allocation() {
        let mut table = AllocationTable::new();
        let existing = table.insert_or_get("scratch", 1000).id;

        let outcome = merge(
            &mut table,
            &[
                record(existing, "other", 1000),
                record(existing, "scratch", 1000),
                record(7, "a", 1),
                record(7, "b", 1),
            ],
            500,
        );

        assert_eq!(outcome.merged, 2);
        assert_eq!(outcome.conflicts, 2);
        assert!(table.get("other", 1000).is_none());
        assert!(table.get("b", 1).is_none());
        assert_eq!(table.get("a", 1).unwrap().id, 7);

        let mut ids: Vec<u32> = table.iter().map(|rec| rec.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), table.len());
    }

    #[test]
    fn test_merge_frees_replaced_id() {
        let mut table = AllocationTable::new();
        let old_id = table.insert_or_get("scratch", 1000).id;

        let outcome = merge(
            &mut table,
            &[record(40, "scratch", 1000), record(old_id, "reuse", 1000)],
            500,
        );

        assert_eq!(outcome.merged, 2);
        assert_eq!(outcome.conflicts, 0);
        assert_eq!(table.get("reuse", 1000).unwrap().id, old_id);
    }

    #[test]
    fn test_missing_checkpoint_is_empty() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let loaded = read_checkpoint(&store, false).unwrap();
        assert!(loaded.records.is_empty());
        assert!(loaded.summary.source.is_none());
    }

    #[test]
    fn test_corrupt_checkpoint() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());

        let records = [record(1, "scratch", 1000)];
        let data = CheckpointEncoder::new().encode(records.iter());
        store.write(&data[..data.len() - 3], Instant::now()).unwrap();

        let err = read_checkpoint(&store, false).unwrap_err();
        assert_eq!(err.reason_code(), "state_corrupt");

        let loaded = read_checkpoint(&store, true).unwrap();
        assert!(loaded.summary.discarded);
        assert!(loaded.records.is_empty());
    }
}
