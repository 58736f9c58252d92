use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub mod check;
pub mod rotate;
pub mod run;

use check::CheckArgs;
use rotate::RotateArgs;
use run::RunArgs;

use toolmux::{
    config::{
        EnvConfigManager, MuxSettings, SettingsOverrides, WorkerEntry, default_workers,
        load_workers,
    },
    logger::LogSettings,
};

#[derive(Parser, Debug)]
#[command(
    name = "toolmux",
    about = "Share one outward connection among many tool adapter processes",
    version = "0.2.0"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run every worker at once behind one connection
    Run(RunArgs),

    /// Run one worker at a time on a fixed cycle
    Rotate(RotateArgs),

    /// Validate the configuration and print the worker table
    Check(CheckArgs),
}

/// Options shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// YAML worker table; the built-in list is used when omitted
    #[arg(long)]
    pub workers: Option<PathBuf>,

    /// Env file merged into the process environment
    #[arg(long, default_value = ".env")]
    pub env_file: PathBuf,

    /// Optional log level override (e.g. error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Also write rolling log files into this directory
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// OpenTelemetry endpoint (e.g. http://localhost:4317)
    #[arg(long)]
    pub otel_endpoint: Option<String>,

    /// Grace period before a worker that ignores SIGTERM is killed
    #[arg(long)]
    pub grace_ms: Option<u64>,
}

impl CommonArgs {
    pub fn default_runtime() -> Self {
        Self {
            workers: None,
            env_file: PathBuf::from(".env"),
            log_level: "info".to_string(),
            log_dir: None,
            otel_endpoint: None,
            grace_ms: None,
        }
    }

    pub fn log_settings(&self) -> LogSettings {
        LogSettings {
            level: self.log_level.clone(),
            log_dir: self.log_dir.clone(),
            otel_endpoint: self.otel_endpoint.clone(),
        }
    }

    fn worker_table(&self) -> anyhow::Result<Vec<WorkerEntry>> {
        match &self.workers {
            Some(path) => load_workers(path)
                .with_context(|| format!("loading workers from {}", path.display())),
            None => Ok(default_workers()),
        }
    }

    /// `.env` first, then the worker table, then everything validated.
    pub async fn load_settings(
        &self,
        mut overrides: SettingsOverrides,
    ) -> anyhow::Result<MuxSettings> {
        let config = EnvConfigManager::new(self.env_file.clone());
        let workers = self.worker_table()?;
        overrides.grace_ms = overrides.grace_ms.or(self.grace_ms);
        MuxSettings::load(&config, workers, &overrides)
            .await
            .context("invalid configuration")
    }
}

pub async fn execute(command: Commands) -> anyhow::Result<std::process::ExitCode> {
    match command {
        Commands::Run(args) => run::execute(args).await,
        Commands::Rotate(args) => rotate::execute(args).await,
        Commands::Check(args) => check::execute(args).await,
    }
}

pub fn default_command() -> Commands {
    Commands::Run(RunArgs {
        common: CommonArgs::default_runtime(),
    })
}

/// Cancelled on Ctrl-C, and on SIGTERM where there is one.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        wait_for_stop_signal().await;
        info!("stop signal received, shutting down");
        trigger.cancel();
    });
    token
}

#[cfg(unix)]
async fn wait_for_stop_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGTERM, Ctrl-C only");
            return wait_for_ctrl_c().await;
        }
    };
    tokio::select! {
        _ = wait_for_ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_stop_signal() {
    wait_for_ctrl_c().await
}

async fn wait_for_ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
