//! Burst buffer state agent.
//!
//! Keeps the burst buffer allocation table durable across controller
//! restarts and in step with the scheduler:
//!
//! - **Recovery**: rebuilds the table from the newest usable checkpoint
//! - **Agent**: sleeps, reloads, sweeps stale records, checkpoints
//! - **Context**: owns the agent and exposes the scheduler hooks
//!
//! Job validation is delegated to a site script through `bbuf-script`.

pub mod agent;
pub mod config;
pub mod context;
pub mod jobs;
pub mod recovery;
pub mod sweep;

pub use agent::{AgentPhase, AgentSettings, AgentStatsSnapshot, SaveReport};
pub use config::Config;
pub use context::{BurstBufferContext, ContextError, STAGE_COMPLETE};
pub use jobs::{JobDescriptor, JobDirectory, JobTable};
pub use recovery::{RecoveryError, RecoverySummary};
