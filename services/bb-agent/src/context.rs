//! Burst buffer subsystem context and the hooks the scheduler calls.
//!
//! The context is created by [`BurstBufferContext::init`] and torn down by
//! [`BurstBufferContext::shutdown`]. Hooks may be called from any task
//! between the two.

use std::sync::Arc;

use bbuf_script::{
    ScriptBridge, ScriptError, JOB_PROCESS_ENTRY_POINT, STATUS_ERROR, STATUS_SUCCESS,
};
use bbuf_state::{
    AllocationKey, AllocationRecord, AllocationState, CheckpointEncoder, CheckpointStore,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::json;
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info};

use crate::agent::{Agent, AgentPhase, AgentSettings, AgentStatsSnapshot, SharedState};
use crate::config::Config;
use crate::jobs::{JobDescriptor, JobDirectory};
use crate::recovery::{RecoveryError, RecoverySummary};

/// Returned by the stage test hooks when the stage has finished.
pub const STAGE_COMPLETE: i32 = 1;

/// Subsystem lifecycle errors.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error("burst buffer agent task failed: {0}")]
    AgentTask(#[from] JoinError),
}

impl ContextError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Recovery(e) => e.reason_code(),
            Self::Script(e) => e.reason_code(),
            Self::AgentTask(_) => "agent_task_failed",
        }
    }
}

/// Burst buffer subsystem.
pub struct BurstBufferContext<J> {
    config: Config,
    shared: Arc<SharedState<J>>,
    script: Arc<ScriptBridge>,
    shutdown_tx: watch::Sender<bool>,
    agent: Mutex<Option<JoinHandle<Result<(), RecoveryError>>>>,
}

impl<J: JobDirectory> BurstBufferContext<J> {
    /// Recover state and start the background agent.
    ///
    /// Fails when the checkpoint can't be recovered and state loss is not
    /// tolerated.
    pub async fn init(config: Config, jobs: Arc<RwLock<J>>) -> Result<Self, ContextError> {
        info!(
            state_dir = %config.state_save_location.display(),
            script = %config.script_path.display(),
            ignore_state_errors = config.ignore_state_errors,
            "Initializing burst buffer subsystem"
        );

        let store = Arc::new(CheckpointStore::new(config.state_save_location.clone()));
        let shared = Arc::new(SharedState::new(store, jobs));
        shared.load_state(config.ignore_state_errors).await?;

        let script = Arc::new(ScriptBridge::new(config.script_config())?);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let agent = Agent::new(Arc::clone(&shared), AgentSettings::from(&config));
        let handle = tokio::spawn(agent.run(shutdown_rx));

        Ok(Self {
            config,
            shared,
            script,
            shutdown_tx,
            agent: Mutex::new(Some(handle)),
        })
    }

    /// Stop the agent and wait for its final save.
    ///
    /// Returns the agent's error if it had already stopped on a failed
    /// recovery. Later calls are no-ops.
    pub async fn shutdown(&self) -> Result<(), ContextError> {
        info!("Shutting down burst buffer subsystem");
        self.shutdown_tx.send_replace(true);

        let handle = self.agent.lock().await.take();
        if let Some(handle) = handle {
            handle.await??;
        }
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn shared(&self) -> &Arc<SharedState<J>> {
        &self.shared
    }

    pub fn phase(&self) -> AgentPhase {
        self.shared.phase()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<AgentPhase> {
        self.shared.subscribe_phase()
    }

    pub fn stats(&self) -> AgentStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Copy of every allocation, ordered by id.
    pub async fn allocations(&self) -> Vec<AllocationRecord> {
        let table = self.shared.table.lock().await;
        let mut records: Vec<AllocationRecord> = table.iter().cloned().collect();
        records.sort_by_key(|rec| rec.id);
        records
    }

    /// Move an allocation to a new lifecycle state.
    pub async fn set_allocation_state(
        &self,
        name: &str,
        user_id: u32,
        state: AllocationState,
    ) -> bool {
        let key = AllocationKey::new(name, user_id);
        let mut table = self.shared.table.lock().await;
        table.set_state(&key, state, Utc::now().timestamp())
    }

    /// Re-read the checkpoint and merge it into the table.
    pub async fn load_state(&self, is_startup: bool) -> Result<RecoverySummary, RecoveryError> {
        debug!(is_startup, "Loading burst buffer state");
        self.shared.load_state(self.config.ignore_state_errors).await
    }

    /// JSON description of the agent and every allocation.
    pub async fn status_report(&self) -> String {
        let allocations = self.allocations().await;
        json!({
            "phase": self.shared.phase(),
            "state_dir": self.config.state_save_location,
            "stats": self.shared.stats.snapshot(),
            "last_save": self.shared.last_save(),
            "last_recovery": self.shared.last_recovery(),
            "allocations": allocations,
        })
        .to_string()
    }

    /// Pick up script changes on the next call.
    pub fn reconfigure(&self) -> i32 {
        info!(script = %self.script.path().display(), "Burst buffer reconfigured");
        self.script.invalidate();
        STATUS_SUCCESS
    }

    /// Checkpoint-format stream of the allocations `uid` may see.
    ///
    /// Root sees everything; other users see their own allocations.
    pub async fn pack_state_for_client(&self, uid: u32) -> Bytes {
        let table = self.shared.table.lock().await;
        let visible = table.iter().filter(|rec| uid == 0 || rec.user_id == uid);
        CheckpointEncoder::new().encode(visible)
    }

    /// Preliminary validation, before the job has an id.
    pub fn validate_job_submission(&self, job: &JobDescriptor, submit_uid: u32) -> i32 {
        debug!(user_id = job.user_id, submit_uid, "Validating burst buffer request");
        STATUS_SUCCESS
    }

    /// Validation through the site script, once the job exists.
    pub async fn validate_job_submission_detailed(
        &self,
        job: &JobDescriptor,
    ) -> (i32, Option<String>) {
        debug!(job_id = job.job_id, "Running burst buffer job validation");

        let script = Arc::clone(&self.script);
        let result =
            tokio::task::spawn_blocking(move || script.invoke(JOB_PROCESS_ENTRY_POINT)).await;

        match result {
            Ok(Ok(rc)) => {
                debug!(job_id = job.job_id, rc, "Return code");
                if rc == STATUS_SUCCESS {
                    (rc, None)
                } else {
                    (rc, Some(format!("burst buffer validation failed with status {rc}")))
                }
            }
            Ok(Err(e)) => {
                error!(
                    job_id = job.job_id,
                    reason = e.reason_code(),
                    error = %e,
                    "Burst buffer validation script failed"
                );
                (STATUS_ERROR, Some(e.to_string()))
            }
            Err(e) => {
                error!(job_id = job.job_id, error = %e, "Burst buffer validation task failed");
                (STATUS_ERROR, Some(e.to_string()))
            }
        }
    }

    /// Total burst buffer capacity. No capacity is tracked.
    pub fn system_size(&self) -> u64 {
        0
    }

    pub fn estimated_start(&self, _job: &JobDescriptor) -> DateTime<Utc> {
        Utc::now()
    }

    pub fn translate_to_tres(&self, _burst_buffer: &str) -> Option<String> {
        None
    }

    pub fn try_stage_in(&self, _jobs: &[JobDescriptor]) -> i32 {
        STATUS_SUCCESS
    }

    pub fn test_stage_in(&self, _job: &JobDescriptor, _test_only: bool) -> i32 {
        STAGE_COMPLETE
    }

    pub fn begin(&self, _job: &JobDescriptor) -> i32 {
        STATUS_SUCCESS
    }

    pub fn revoke(&self, _job: &JobDescriptor) -> i32 {
        STATUS_SUCCESS
    }

    pub fn start_stage_out(&self, _job: &JobDescriptor) -> i32 {
        STATUS_SUCCESS
    }

    pub fn test_post_run(&self, _job: &JobDescriptor) -> i32 {
        STAGE_COMPLETE
    }

    pub fn test_stage_out(&self, _job: &JobDescriptor) -> i32 {
        STAGE_COMPLETE
    }

    pub fn cancel(&self, _job: &JobDescriptor) -> i32 {
        STATUS_SUCCESS
    }
}
