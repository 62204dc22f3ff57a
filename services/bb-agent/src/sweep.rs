//! Staleness sweep run under the host global lock and the table lock.
//!
//! - Job-bound records whose stage-out finished are purged once their job is
//!   gone from the scheduler.
//! - Other job-bound records are purged once their job has been missing for
//!   `missing_job_sweeps` consecutive sweeps. Lifecycle state is not
//!   persisted, so this is how records recovered after a restart go away.
//! - Stage-in and stage-out overruns are flagged when a timeout is set.
//!
//! Records not bound to a job are never purged here.

use std::time::Duration;

use bbuf_state::{AllocationKey, AllocationState, AllocationTable};
use tracing::{debug, info, warn};

use crate::jobs::JobDirectory;

/// Sweeps a job may be missing before its allocation is purged.
pub const DEFAULT_MISSING_JOB_SWEEPS: u32 = 3;

/// Inputs that decide what counts as stale.
#[derive(Debug, Clone, Copy)]
pub struct SweepPolicy {
    /// Consecutive sweeps without the bound job before a purge. At least 1.
    pub missing_job_sweeps: u32,
    pub stage_in_timeout: Option<Duration>,
    pub stage_out_timeout: Option<Duration>,
}

impl Default for SweepPolicy {
    fn default() -> Self {
        Self {
            missing_job_sweeps: DEFAULT_MISSING_JOB_SWEEPS,
            stage_in_timeout: None,
            stage_out_timeout: None,
        }
    }
}

/// What one sweep found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub purged: Vec<AllocationKey>,
    pub stage_in_overruns: Vec<AllocationKey>,
    pub stage_out_overruns: Vec<AllocationKey>,
}

impl SweepReport {
    pub fn overruns(&self) -> usize {
        self.stage_in_overruns.len() + self.stage_out_overruns.len()
    }
}

pub fn sweep<J>(
    table: &mut AllocationTable,
    jobs: &J,
    policy: &SweepPolicy,
    now: i64,
) -> SweepReport
where
    J: JobDirectory + ?Sized,
{
    let threshold = policy.missing_job_sweeps.max(1);
    let purged = table.purge_where(|rec| {
        let Some(job_id) = rec.job_id() else {
            return false;
        };
        if jobs.job_exists(job_id) {
            rec.missing_job_sweeps = 0;
            return false;
        }
        if rec.state.is_stage_out_complete() {
            return true;
        }

        rec.missing_job_sweeps = rec.missing_job_sweeps.saturating_add(1);
        debug!(
            name = %rec.name,
            job_id,
            sweeps = rec.missing_job_sweeps,
            "Burst buffer job not found"
        );
        rec.missing_job_sweeps >= threshold
    });

    let mut report = SweepReport {
        purged: purged.iter().map(|rec| rec.key()).collect(),
        ..SweepReport::default()
    };
    for rec in &purged {
        info!(
            name = %rec.name,
            user_id = rec.user_id,
            job_id = rec.job_id(),
            state = rec.state.as_str(),
            "Purged burst buffer record"
        );
    }

    for rec in table.iter() {
        let (timeout, overruns) = match rec.state {
            AllocationState::StagingIn => (policy.stage_in_timeout, &mut report.stage_in_overruns),
            AllocationState::StagingOut => {
                (policy.stage_out_timeout, &mut report.stage_out_overruns)
            }
            _ => continue,
        };
        let Some(timeout) = timeout else {
            continue;
        };

        let elapsed = now.saturating_sub(rec.state_time);
        if elapsed > timeout.as_secs() as i64 {
            warn!(
                name = %rec.name,
                user_id = rec.user_id,
                state = rec.state.as_str(),
                elapsed_secs = elapsed,
                timeout_secs = timeout.as_secs(),
                "Burst buffer staging timed out"
            );
            overruns.push(rec.key());
        }
    }

    report
}
