use std::process::ExitCode;

use anyhow::Context;
use clap::Args;
use tracing::{error, info};

use super::{CommonArgs, shutdown_token};
use toolmux::{config::SettingsOverrides, logger::init_tracing, rotation::RotationScheduler};

#[derive(Args, Debug)]
pub struct RotateArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// How long each worker runs unless its entry says otherwise
    #[arg(long)]
    pub duration_secs: Option<u64>,

    /// Pause between one worker stopping and the next starting
    #[arg(long)]
    pub gap_secs: Option<u64>,
}

pub async fn execute(args: RotateArgs) -> anyhow::Result<ExitCode> {
    let _logs = init_tracing(&args.common.log_settings()).context("could not create logger")?;

    let overrides = SettingsOverrides {
        grace_ms: None,
        rotation_secs: args.duration_secs,
        rotation_gap_secs: args.gap_secs,
    };
    let settings = args
        .common
        .load_settings(overrides)
        .await
        .inspect_err(|e| error!("{e:#}"))?;
    let table = settings.rotation_table().context("invalid rotation table")?;

    info!(
        endpoint = %settings.endpoint,
        workers = table.len(),
        gap_secs = settings.rotation_gap.as_secs(),
        "toolmux starting in rotation mode; press Ctrl-C to exit"
    );

    let scheduler = RotationScheduler::new(table, settings.rotation_gap, settings.grace_period);
    scheduler.run(shutdown_token()).await;

    info!("toolmux stopped");
    Ok(ExitCode::SUCCESS)
}
