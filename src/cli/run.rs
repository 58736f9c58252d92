use std::{process::ExitCode, sync::Arc};

use anyhow::Context;
use clap::Args;
use tracing::{error, info};

use super::{CommonArgs, shutdown_token};
use toolmux::{
    config::SettingsOverrides,
    logger::init_tracing,
    outward::WsConnector,
    supervisor::{ShutdownReason, Supervisor},
};

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub common: CommonArgs,
}

pub async fn execute(args: RunArgs) -> anyhow::Result<ExitCode> {
    let _logs = init_tracing(&args.common.log_settings()).context("could not create logger")?;

    let settings = args
        .common
        .load_settings(SettingsOverrides::default())
        .await
        .inspect_err(|e| error!("{e:#}"))?;

    info!(
        endpoint = %settings.endpoint,
        workers = settings.workers.len(),
        "toolmux starting in multiplexer mode; press Ctrl-C to exit"
    );

    let cancel = shutdown_token();
    let supervisor = Supervisor::new(
        settings.supervisor_config(),
        Arc::new(WsConnector::new(settings.endpoint.clone())),
    );

    let reason = supervisor
        .run(cancel)
        .await
        .inspect_err(|e| error!("{e}"))
        .context("multiplexer failed")?;

    for (name, status) in supervisor.registry().diagnostics() {
        info!(worker = %name, %status, "final worker status");
    }

    match reason {
        ShutdownReason::Cancelled => {
            info!("toolmux stopped");
            Ok(ExitCode::SUCCESS)
        }
        ShutdownReason::ChannelClosed => {
            error!(endpoint = %settings.endpoint, "outward connection lost, exiting");
            Ok(ExitCode::FAILURE)
        }
    }
}
