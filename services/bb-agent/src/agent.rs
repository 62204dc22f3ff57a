//! Background agent: periodic recovery, reconciliation and checkpointing.
//!
//! The agent cycles `Running -> Reload -> Reconcile -> Checkpoint` and ends in
//! `Stopped` once it sees the shutdown signal. Shutdown wakes a sleeping agent
//! immediately; the final pass skips reconciliation and forces one save.
//!
//! Lock order is always host global lock, then table lock. The global lock is
//! held for the reconcile phase only and never across checkpoint I/O.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use bbuf_state::{AllocationTable, CheckpointEncoder, CheckpointStore, SaveOutcome};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, error, info};

use crate::config::Config;
use crate::jobs::JobDirectory;
use crate::recovery::{self, RecoveryError, RecoverySummary};
use crate::sweep::{self, SweepPolicy, SweepReport};

/// Agent lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    /// Sleeping until the next cycle.
    Running,
    Reload,
    Reconcile,
    Checkpoint,
    Stopped,
}

/// Agent counters.
#[derive(Debug, Default)]
pub struct AgentStats {
    cycles: AtomicU64,
    saves: AtomicU64,
    skipped_saves: AtomicU64,
    failed_saves: AtomicU64,
    purged: AtomicU64,
    overruns: AtomicU64,
}

/// Point-in-time copy of [`AgentStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AgentStatsSnapshot {
    pub cycles: u64,
    pub saves: u64,
    pub skipped_saves: u64,
    pub failed_saves: u64,
    pub purged: u64,
    pub overruns: u64,
}

impl AgentStats {
    pub fn snapshot(&self) -> AgentStatsSnapshot {
        AgentStatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            saves: self.saves.load(Ordering::Relaxed),
            skipped_saves: self.skipped_saves.load(Ordering::Relaxed),
            failed_saves: self.failed_saves.load(Ordering::Relaxed),
            purged: self.purged.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
        }
    }
}

/// Result of the most recent save attempt that reached the disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SaveReport {
    Written {
        time: DateTime<Utc>,
        bytes: usize,
    },
    Failed {
        time: DateTime<Utc>,
        reason: &'static str,
    },
}

/// Agent timing and policy.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub interval: Duration,
    pub reload_each_cycle: bool,
    pub ignore_state_errors: bool,
    pub missing_job_sweeps: u32,
    pub stage_in_timeout: Option<Duration>,
    pub stage_out_timeout: Option<Duration>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            reload_each_cycle: true,
            ignore_state_errors: false,
            missing_job_sweeps: sweep::DEFAULT_MISSING_JOB_SWEEPS,
            stage_in_timeout: None,
            stage_out_timeout: None,
        }
    }
}

impl From<&Config> for AgentSettings {
    fn from(config: &Config) -> Self {
        Self {
            interval: config.agent_interval,
            reload_each_cycle: config.reload_each_cycle,
            ignore_state_errors: config.ignore_state_errors,
            missing_job_sweeps: config.missing_job_sweeps,
            stage_in_timeout: config.stage_in_timeout,
            stage_out_timeout: config.stage_out_timeout,
        }
    }
}

/// State shared by the agent task and the scheduler hooks.
pub struct SharedState<J> {
    pub store: Arc<CheckpointStore>,
    pub table: Mutex<AllocationTable>,
    /// The host's global lock.
    pub jobs: Arc<RwLock<J>>,
    pub stats: AgentStats,
    phase: watch::Sender<AgentPhase>,
    encoder: parking_lot::Mutex<CheckpointEncoder>,
    last_save: parking_lot::Mutex<Option<SaveReport>>,
    last_recovery: parking_lot::Mutex<Option<RecoverySummary>>,
}

impl<J: JobDirectory> SharedState<J> {
    pub fn new(store: Arc<CheckpointStore>, jobs: Arc<RwLock<J>>) -> Self {
        let (phase, _) = watch::channel(AgentPhase::Running);
        Self {
            store,
            table: Mutex::new(AllocationTable::new()),
            jobs,
            stats: AgentStats::default(),
            phase,
            encoder: parking_lot::Mutex::new(CheckpointEncoder::new()),
            last_save: parking_lot::Mutex::new(None),
            last_recovery: parking_lot::Mutex::new(None),
        }
    }

    pub fn phase(&self) -> AgentPhase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<AgentPhase> {
        self.phase.subscribe()
    }

    fn set_phase(&self, phase: AgentPhase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            debug!(?previous, ?phase, "Burst buffer agent phase change");
        }
    }

    pub fn last_save(&self) -> Option<SaveReport> {
        self.last_save.lock().clone()
    }

    pub fn last_recovery(&self) -> Option<RecoverySummary> {
        self.last_recovery.lock().clone()
    }

    /// Recovery pass followed by apply-limits. Takes the table lock itself.
    pub async fn load_state(
        &self,
        ignore_state_errors: bool,
    ) -> Result<RecoverySummary, RecoveryError> {
        let summary =
            recovery::load_state(Arc::clone(&self.store), &self.table, ignore_state_errors)
                .await?;
        *self.last_recovery.lock() = Some(summary.clone());
        Ok(summary)
    }

    /// Staleness sweep under the global write lock and the table lock.
    pub async fn reconcile(&self, settings: &AgentSettings) -> SweepReport {
        let policy = SweepPolicy {
            missing_job_sweeps: settings.missing_job_sweeps,
            stage_in_timeout: settings.stage_in_timeout,
            stage_out_timeout: settings.stage_out_timeout,
        };

        let jobs = self.jobs.write().await;
        let mut table = self.table.lock().await;
        let report = sweep::sweep(&mut table, &*jobs, &policy, Utc::now().timestamp());
        drop(table);
        drop(jobs);

        self.stats
            .purged
            .fetch_add(report.purged.len() as u64, Ordering::Relaxed);
        self.stats
            .overruns
            .fetch_add(report.overruns() as u64, Ordering::Relaxed);
        report
    }

    /// Write a checkpoint if anything changed since the last one.
    ///
    /// The table lock is held while encoding only; the file is written from
    /// a blocking task with no lock held.
    pub async fn save(&self, terminating: bool) -> anyhow::Result<SaveOutcome> {
        let (data, save_time) = {
            let table = self.table.lock().await;
            if !self.store.needs_save(table.last_update(), terminating) {
                self.stats.skipped_saves.fetch_add(1, Ordering::Relaxed);
                debug!("Burst buffer state unchanged, skipping save");
                return Ok(SaveOutcome::Skipped);
            }
            let data = self.encoder.lock().encode(table.iter());
            (data, Instant::now())
        };

        let bytes = data.len();
        let store = Arc::clone(&self.store);
        let result = tokio::task::spawn_blocking(move || store.write(&data, save_time))
            .await
            .context("checkpoint write task failed")?;

        match result {
            Ok(()) => {
                self.stats.saves.fetch_add(1, Ordering::Relaxed);
                *self.last_save.lock() = Some(SaveReport::Written {
                    time: Utc::now(),
                    bytes,
                });
                Ok(SaveOutcome::Written { bytes })
            }
            Err(e) => {
                self.stats.failed_saves.fetch_add(1, Ordering::Relaxed);
                *self.last_save.lock() = Some(SaveReport::Failed {
                    time: Utc::now(),
                    reason: e.reason_code(),
                });
                Err(e.into())
            }
        }
    }
}

/// The background agent.
pub struct Agent<J> {
    shared: Arc<SharedState<J>>,
    settings: AgentSettings,
}

impl<J: JobDirectory> Agent<J> {
    pub fn new(shared: Arc<SharedState<J>>, settings: AgentSettings) -> Self {
        Self { shared, settings }
    }

    /// Run until shutdown.
    ///
    /// Returns an error only when a periodic recovery fails and state loss is
    /// not tolerated; the agent then stops without saving.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), RecoveryError> {
        info!(
            interval_secs = self.settings.interval.as_secs(),
            reload_each_cycle = self.settings.reload_each_cycle,
            "Starting burst buffer agent"
        );

        loop {
            self.shared.set_phase(AgentPhase::Running);
            let terminating = self.sleep(&mut shutdown).await;

            if !terminating {
                self.shared.stats.cycles.fetch_add(1, Ordering::Relaxed);

                if self.settings.reload_each_cycle {
                    self.shared.set_phase(AgentPhase::Reload);
                    if let Err(e) = self
                        .shared
                        .load_state(self.settings.ignore_state_errors)
                        .await
                    {
                        error!(
                            reason = e.reason_code(),
                            error = %e,
                            "Burst buffer state recovery failed, stopping agent"
                        );
                        self.shared.set_phase(AgentPhase::Stopped);
                        return Err(e);
                    }
                }

                self.shared.set_phase(AgentPhase::Reconcile);
                self.shared.reconcile(&self.settings).await;
            }

            self.shared.set_phase(AgentPhase::Checkpoint);
            if let Err(e) = self.shared.save(terminating).await {
                error!(error = %e, "Failed to save burst buffer state");
            }

            if terminating {
                break;
            }
        }

        self.shared.set_phase(AgentPhase::Stopped);
        info!("Burst buffer agent stopped");
        Ok(())
    }

    /// Sleep one interval. Returns true once shutdown was requested.
    async fn sleep(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        if *shutdown.borrow() {
            return true;
        }

        tokio::select! {
            _ = tokio::time::sleep(self.settings.interval) => *shutdown.borrow(),
            changed = shutdown.changed() => {
                // A dropped sender means nobody can stop us later either.
                changed.is_err() || *shutdown.borrow()
            }
        }
    }
}
