//! Allocation records.

use serde::Serialize;

/// Key identifying an allocation: the name is unique per user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct AllocationKey {
    pub name: String,
    pub user_id: u32,
}

impl AllocationKey {
    pub fn new(name: impl Into<String>, user_id: u32) -> Self {
        Self {
            name: name.into(),
            user_id,
        }
    }
}

impl std::fmt::Display for AllocationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.user_id)
    }
}

/// Scheduler job an allocation belongs to, derived from a numeric name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobBinding {
    pub job_id: u32,
    pub array_job_id: u32,
    /// `None` means "not an array task".
    pub array_task_id: Option<u32>,
}

impl JobBinding {
    /// Derive a binding from an allocation name.
    ///
    /// Only purely numeric names that fit a job id bind to a job.
    pub fn from_name(name: &str) -> Option<Self> {
        if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }

        let job_id = name.parse::<u32>().ok()?;
        Some(Self {
            job_id,
            array_job_id: job_id,
            array_task_id: None,
        })
    }
}

/// Lifecycle state of an allocation.
///
/// Not persisted; recovered records start as `Allocated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationState {
    #[default]
    Allocated,
    StagingIn,
    StagedIn,
    Running,
    StagingOut,
    StagedOut,
    Complete,
}

impl AllocationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allocated => "allocated",
            Self::StagingIn => "staging_in",
            Self::StagedIn => "staged_in",
            Self::Running => "running",
            Self::StagingOut => "staging_out",
            Self::StagedOut => "staged_out",
            Self::Complete => "complete",
        }
    }

    /// Stage-out has finished; the allocation only waits for its job to go away.
    pub fn is_stage_out_complete(&self) -> bool {
        matches!(self, Self::StagedOut | Self::Complete)
    }
}

/// One burst buffer allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocationRecord {
    pub id: u32,
    pub name: String,
    pub user_id: u32,
    pub account: Option<String>,
    pub partition: Option<String>,
    pub pool: Option<String>,
    pub qos: Option<String>,
    /// Size in bytes or abstract capacity units.
    pub size: u64,
    /// Unix seconds.
    pub create_time: i64,
    /// Unix seconds of the last refresh. Never moves backwards.
    pub seen_time: i64,
    pub job: Option<JobBinding>,
    pub state: AllocationState,
    /// Unix seconds at which `state` was entered.
    pub state_time: i64,
    /// Consecutive sweeps that found the bound job gone. Not persisted.
    pub missing_job_sweeps: u32,
}

impl AllocationRecord {
    /// Create an empty record for `(name, user_id)`.
    pub fn new(id: u32, name: impl Into<String>, user_id: u32, now: i64) -> Self {
        let name = name.into();
        let job = JobBinding::from_name(&name);
        Self {
            id,
            name,
            user_id,
            account: None,
            partition: None,
            pool: None,
            qos: None,
            size: 0,
            create_time: now,
            seen_time: now,
            job,
            state: AllocationState::default(),
            state_time: now,
            missing_job_sweeps: 0,
        }
    }

    pub fn key(&self) -> AllocationKey {
        AllocationKey::new(self.name.clone(), self.user_id)
    }

    /// Refresh `seen_time`, keeping it monotonic.
    pub fn touch(&mut self, now: i64) {
        self.seen_time = self.seen_time.max(now);
    }

    pub fn job_id(&self) -> Option<u32> {
        self.job.map(|j| j.job_id)
    }

    /// Copy the persisted fields of `other` over this record.
    ///
    /// Fields are overwritten, never merged: a `None` in `other` clears the
    /// corresponding field here.
    pub fn overwrite_from(&mut self, other: &AllocationRecord) {
        self.id = other.id;
        self.account = other.account.clone();
        self.partition = other.partition.clone();
        self.pool = other.pool.clone();
        self.qos = other.qos.clone();
        self.create_time = other.create_time;
        self.size = other.size;
    }

    /// Persisted-field equality; ignores `seen_time` and lifecycle state.
    pub fn same_persisted_fields(&self, other: &AllocationRecord) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.user_id == other.user_id
            && self.account == other.account
            && self.partition == other.partition
            && self.pool == other.pool
            && self.qos == other.qos
            && self.create_time == other.create_time
            && self.size == other.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_name_binds_job() {
        let binding = JobBinding::from_name("12345").unwrap();
        assert_eq!(binding.job_id, 12345);
        assert_eq!(binding.array_job_id, 12345);
        assert_eq!(binding.array_task_id, None);
    }

    #[test]
    fn test_non_numeric_names_do_not_bind() {
        assert!(JobBinding::from_name("scratch").is_none());
        assert!(JobBinding::from_name("12abc").is_none());
        assert!(JobBinding::from_name("").is_none());
        assert!(JobBinding::from_name("-5").is_none());
        // Larger than u32::MAX
        assert!(JobBinding::from_name("99999999999").is_none());
    }

    #[test]
    fn test_touch_is_monotonic() {
        let mut rec = AllocationRecord::new(1, "scratch", 1000, 500);
        rec.touch(400);
        assert_eq!(rec.seen_time, 500);
        rec.touch(600);
        assert_eq!(rec.seen_time, 600);
    }

    #[test]
    fn test_overwrite_clears_fields() {
        let mut rec = AllocationRecord::new(1, "scratch", 1000, 0);
        rec.account = Some("physics".to_string());
        rec.state = AllocationState::Running;

        let mut incoming = AllocationRecord::new(7, "scratch", 1000, 0);
        incoming.size = 4096;
        incoming.create_time = 42;

        rec.overwrite_from(&incoming);
        assert_eq!(rec.id, 7);
        assert_eq!(rec.account, None);
        assert_eq!(rec.size, 4096);
        assert_eq!(rec.create_time, 42);
        // Lifecycle state is not part of the persisted record
        assert_eq!(rec.state, AllocationState::Running);
    }

    #[test]
    fn test_record_serializes_state_snake_case() {
        let mut rec = AllocationRecord::new(3, "512", 1000, 10);
        rec.state = AllocationState::StagingOut;

        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["state"], "staging_out");
        assert_eq!(json["job"]["job_id"], 512);
        assert!(json["job"]["array_task_id"].is_null());
    }
}
