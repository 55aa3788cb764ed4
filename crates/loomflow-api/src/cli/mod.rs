//! CLI command definitions for the `lflow` binary.
//!
//! Uses clap derive macros for argument parsing. Commands are grouped by
//! noun (e.g., `lflow run start`, `lflow pipeline list`).

pub mod output;
pub mod pipeline;
pub mod run;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Drive content pipelines with checkpoints, approvals and resumable runs.
#[derive(Parser)]
#[command(name = "lflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the REST API server.
    Serve {
        /// Port to listen on (overrides config.toml).
        #[arg(long)]
        port: Option<u16>,

        /// Host to bind to (overrides config.toml).
        #[arg(long)]
        host: Option<String>,
    },

    /// Manage pipeline definitions (list, show, validate, add).
    Pipeline {
        #[command(subcommand)]
        action: pipeline::PipelineCommand,
    },

    /// Start, inspect and steer runs.
    Run {
        /// Tenant the run belongs to.
        #[arg(long, env = "LOOMFLOW_TENANT", default_value = "default", global = true)]
        tenant: String,

        #[command(subcommand)]
        action: run::RunCommand,
    },

    /// Repair runs interrupted by a crash and drive them to their next stop.
    Recover,

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}
