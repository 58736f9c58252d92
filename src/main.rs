use std::process::ExitCode;

use clap::Parser;

mod cli;

use cli::{Cli, default_command, execute};

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    execute(cli.command.unwrap_or_else(default_command)).await
}
