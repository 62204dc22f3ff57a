//! View of the host scheduler's jobs.
//!
//! The host owns its job records and guards them with its global lock; the
//! agent takes that lock for writing during the reconcile phase only.

use std::collections::HashMap;

use serde::Serialize;

/// Job existence queries answered by the host scheduler.
pub trait JobDirectory: Send + Sync + 'static {
    /// Whether the scheduler still has a record of `job_id`.
    fn job_exists(&self, job_id: u32) -> bool;
}

/// The parts of a job the burst buffer hooks look at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobDescriptor {
    pub job_id: u32,
    pub user_id: u32,
    /// Raw burst buffer request from the job script, if any.
    pub burst_buffer: Option<String>,
}

impl JobDescriptor {
    pub fn new(job_id: u32, user_id: u32) -> Self {
        Self {
            job_id,
            user_id,
            burst_buffer: None,
        }
    }

    pub fn with_burst_buffer(mut self, request: impl Into<String>) -> Self {
        self.burst_buffer = Some(request.into());
        self
    }
}

/// In-memory job directory.
#[derive(Debug, Default)]
pub struct JobTable {
    jobs: HashMap<u32, JobDescriptor>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, job: JobDescriptor) -> Option<JobDescriptor> {
        self.jobs.insert(job.job_id, job)
    }

    pub fn remove(&mut self, job_id: u32) -> Option<JobDescriptor> {
        self.jobs.remove(&job_id)
    }

    pub fn get(&self, job_id: u32) -> Option<&JobDescriptor> {
        self.jobs.get(&job_id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl JobDirectory for JobTable {
    fn job_exists(&self, job_id: u32) -> bool {
        self.jobs.contains_key(&job_id)
    }
}
