use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "loft", about = "Developer environment orchestrator")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the orchestrator and its API surface.
    Serve {
        /// Address to bind.
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,

        /// Port to listen on.
        #[arg(long, default_value_t = 8080, env = "ORCH_API_PORT")]
        port: u16,

        /// Cloud used by HYBRID templates: aws, azure or gcp.
        #[arg(long, default_value = "aws", env = "ORCH_DEFAULT_CLOUD")]
        default_cloud: String,

        /// Skip connecting to the local container engine (cloud-only node).
        #[arg(long, default_value_t = false)]
        no_engine: bool,

        /// Default region for the AWS provider hooks.
        #[arg(long, default_value = "eu-west-1", env = "ORCH_AWS_REGION")]
        aws_region: String,

        /// Default location for the Azure provider hooks.
        #[arg(long, default_value = "westeurope", env = "ORCH_AZURE_LOCATION")]
        azure_location: String,

        /// GCP project for the GCP provider hooks. Hooks for GCP are only
        /// registered when this is set.
        #[arg(long, env = "ORCH_GCP_PROJECT")]
        gcp_project: Option<String>,

        /// Default region for the GCP provider hooks.
        #[arg(long, default_value = "europe-west1", env = "ORCH_GCP_REGION")]
        gcp_region: String,
    },

    /// Parse and validate a compose-style template document.
    Validate {
        /// Path to the document.
        file: PathBuf,
    },
}
