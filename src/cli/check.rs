use std::process::ExitCode;

use clap::Args;

use super::CommonArgs;
use toolmux::config::{MuxSettings, SettingsOverrides};

#[derive(Args, Debug)]
pub struct CheckArgs {
    #[command(flatten)]
    pub common: CommonArgs,
}

pub async fn execute(args: CheckArgs) -> anyhow::Result<ExitCode> {
    let settings = args.common.load_settings(SettingsOverrides::default()).await?;
    print!("{}", render(&settings));
    Ok(ExitCode::SUCCESS)
}

fn render(settings: &MuxSettings) -> String {
    let width = settings
        .workers
        .iter()
        .map(|w| w.name.len())
        .max()
        .unwrap_or(0)
        .max("NAME".len());

    let mut out = format!(
        "endpoint: {}\ngrace:    {} ms\nrotation: {} s per worker, {} s gap\n\n{:<width$}  {:<9}  COMMAND\n",
        settings.endpoint,
        settings.grace_period.as_millis(),
        settings.rotation_duration.as_secs(),
        settings.rotation_gap.as_secs(),
        "NAME",
        "DURATION",
    );
    for w in &settings.workers {
        let duration = match w.duration_secs {
            Some(secs) => format!("{secs} s"),
            None => "default".to_string(),
        };
        out.push_str(&format!(
            "{:<width$}  {:<9}  {}\n",
            w.name,
            duration,
            w.command.join(" ")
        ));
    }
    out
}
