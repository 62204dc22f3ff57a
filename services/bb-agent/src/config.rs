//! Configuration for the burst buffer agent.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use bbuf_script::ScriptConfig;

use crate::sweep::DEFAULT_MISSING_JOB_SWEEPS;

/// Burst buffer agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the checkpoint files.
    pub state_save_location: PathBuf,

    /// Start with empty state instead of failing when the checkpoint is
    /// unreadable or from an unknown format version.
    pub ignore_state_errors: bool,

    /// Validation script module.
    pub script_path: PathBuf,

    /// Sleep between agent cycles.
    pub agent_interval: Duration,

    /// Re-run recovery at the start of every cycle.
    pub reload_each_cycle: bool,

    /// Consecutive sweeps a bound job may be missing before its allocation
    /// is purged. At least 1.
    pub missing_job_sweeps: u32,

    /// Stage-in overrun threshold. No check when unset.
    pub stage_in_timeout: Option<Duration>,

    /// Stage-out overrun threshold. No check when unset.
    pub stage_out_timeout: Option<Duration>,

    /// Execution budget per script call.
    pub script_fuel: Option<u64>,

    /// Log level used when `RUST_LOG` is not set.
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_save_location: PathBuf::from("/var/spool/slurmctld"),
            ignore_state_errors: false,
            script_path: PathBuf::from("/etc/slurm/burst_buffer.wasm"),
            agent_interval: Duration::from_secs(30),
            reload_each_cycle: true,
            missing_job_sweeps: DEFAULT_MISSING_JOB_SWEEPS,
            stage_in_timeout: None,
            stage_out_timeout: None,
            script_fuel: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let state_save_location = lookup("BBUF_STATE_SAVE_LOCATION")
            .map(PathBuf::from)
            .unwrap_or(defaults.state_save_location);

        let ignore_state_errors = lookup("BBUF_IGNORE_STATE_ERRORS")
            .map(|v| parse_flag(&v))
            .unwrap_or(defaults.ignore_state_errors);

        let script_path = lookup("BBUF_SCRIPT_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.script_path);

        let agent_interval = parse_secs(&lookup, "BBUF_AGENT_INTERVAL_SECS")?
            .map(|d| d.max(Duration::from_secs(1)))
            .unwrap_or(defaults.agent_interval);

        let reload_each_cycle = lookup("BBUF_RELOAD_EACH_CYCLE")
            .map(|v| parse_flag(&v))
            .unwrap_or(defaults.reload_each_cycle);

        let missing_job_sweeps = lookup("BBUF_MISSING_JOB_SWEEPS")
            .map(|v| {
                v.parse::<u32>()
                    .with_context(|| format!("invalid BBUF_MISSING_JOB_SWEEPS: {v}"))
            })
            .transpose()?
            .map(|n| n.max(1))
            .unwrap_or(defaults.missing_job_sweeps);

        let stage_in_timeout = parse_secs(&lookup, "BBUF_STAGE_IN_TIMEOUT_SECS")?;
        let stage_out_timeout = parse_secs(&lookup, "BBUF_STAGE_OUT_TIMEOUT_SECS")?;

        let script_fuel = lookup("BBUF_SCRIPT_FUEL")
            .map(|v| {
                v.parse::<u64>()
                    .with_context(|| format!("invalid BBUF_SCRIPT_FUEL: {v}"))
            })
            .transpose()?;

        let log_level = lookup("BBUF_LOG_LEVEL").unwrap_or(defaults.log_level);

        Ok(Self {
            state_save_location,
            ignore_state_errors,
            script_path,
            agent_interval,
            reload_each_cycle,
            missing_job_sweeps,
            stage_in_timeout,
            stage_out_timeout,
            script_fuel,
            log_level,
        })
    }

    /// Script bridge settings derived from this configuration.
    pub fn script_config(&self) -> ScriptConfig {
        ScriptConfig::new(self.script_path.clone()).with_fuel(self.script_fuel)
    }
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

fn parse_secs<F>(lookup: &F, key: &str) -> Result<Option<Duration>>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| {
            v.parse::<u64>()
                .map(Duration::from_secs)
                .with_context(|| format!("invalid {key}: {v}"))
        })
        .transpose()
}
