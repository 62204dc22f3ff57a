//! Burst buffer state agent daemon.
//!
//! Recovers the allocation table from the checkpoint directory, then keeps
//! it checkpointed until interrupted. Exits non-zero when the checkpoint
//! can't be recovered and `--ignore-state-errors` was not given.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bbuf_agent::{AgentPhase, BurstBufferContext, Config, JobTable};
use clap::Parser;
use tokio::sync::RwLock;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "bb-agent", version, about = "Burst buffer state agent")]
struct Args {
    /// Start with empty state if the checkpoint can't be recovered.
    /// State that can't be recovered is lost.
    #[arg(short = 'i', long)]
    ignore_state_errors: bool,

    /// Checkpoint directory.
    #[arg(long, value_name = "DIR")]
    state_dir: Option<PathBuf>,

    /// Validation script module.
    #[arg(long, value_name = "PATH")]
    script: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = Config::from_env()?;
    if args.ignore_state_errors {
        config.ignore_state_errors = true;
    }
    if let Some(dir) = args.state_dir {
        config.state_save_location = dir;
    }
    if let Some(script) = args.script {
        config.script_path = script;
    }

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        state_dir = %config.state_save_location.display(),
        script = %config.script_path.display(),
        interval_secs = config.agent_interval.as_secs(),
        "Starting burst buffer agent"
    );

    let jobs = Arc::new(RwLock::new(JobTable::new()));
    let context = BurstBufferContext::init(config, jobs)
        .await
        .context("failed to initialize burst buffer subsystem")?;

    let mut phase = context.subscribe_phase();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = phase.wait_for(|p| *p == AgentPhase::Stopped) => {
            warn!("Burst buffer agent stopped on its own");
        }
    }

    context
        .shutdown()
        .await
        .context("burst buffer agent failed")?;

    info!("Burst buffer agent shutdown complete");
    Ok(())
}
