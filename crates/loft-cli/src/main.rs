mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Command};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            bind,
            port,
            default_cloud,
            no_engine,
            aws_region,
            azure_location,
            gcp_project,
            gcp_region,
        } => {
            commands::serve(commands::ServeOptions {
                bind,
                port,
                default_cloud,
                no_engine,
                aws_region,
                azure_location,
                gcp_project,
                gcp_region,
            })
            .await
        }
        Command::Validate { file } => commands::validate(&file),
    }
}
