//! deployctl — build, publish, apply, and health-gate a deployment.
//!
//! # Usage
//!
//! ```text
//! deployctl init --name chatbot --image registry.local/chatbot
//! deployctl plan
//! deployctl run --environment staging
//! deployctl history --environment staging
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod digest;
mod shell;
mod sinks;

use commands::Overrides;
use commands::run::RunOptions;

#[derive(Parser)]
#[command(
    name = "deployctl",
    about = "Health-gated deployment orchestrator with automatic rollback",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Path to deploy.toml
    #[arg(short, long, global = true, default_value = "deploy.toml")]
    config: PathBuf,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a deploy.toml scaffold
    Init {
        /// Deployment name
        #[arg(long)]
        name: String,
        /// Default target environment
        #[arg(long, default_value = "staging")]
        environment: String,
        /// Image repository the artifact is published to
        #[arg(long)]
        image: String,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Check deploy.toml and print the apply order
    Validate {
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Print the stages a rollout would run
    Plan {
        #[command(flatten)]
        overrides: Overrides,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Execute a rollout.
    ///
    /// Exits 0 on success, 1 on failure, 2 when rolled back, 3 when
    /// cancelled, and 4 when the rollback itself failed.
    Run {
        #[command(flatten)]
        overrides: Overrides,
        /// Directory holding rollout history and known-good sets
        #[arg(long, default_value = ".deployctl")]
        state_dir: PathBuf,
        /// Use in-memory collaborators; nothing is executed or persisted
        #[arg(long)]
        dry_run: bool,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Show recorded rollouts for an environment
    History {
        #[arg(short, long, default_value = "staging")]
        environment: String,
        #[arg(long, default_value = ".deployctl")]
        state_dir: PathBuf,
        /// Number of rollouts to show
        #[arg(long, default_value = "10")]
        limit: usize,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("deployctl=info,deploy=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match cli.command {
        Commands::Init {
            name,
            environment,
            image,
            force,
        } => commands::init::init(&cli.config, &name, &environment, &image, force),
        Commands::Validate { overrides } => commands::validate::validate(&cli.config, &overrides),
        Commands::Plan { overrides, format } => {
            commands::validate::plan(&cli.config, &overrides, &format)
        }
        Commands::Run {
            overrides,
            state_dir,
            dry_run,
            format,
        } => {
            let code = commands::run::run(RunOptions {
                config: &cli.config,
                overrides: &overrides,
                state_dir: &state_dir,
                dry_run,
                format: &format,
            })
            .await?;
            std::process::exit(code);
        }
        Commands::History {
            environment,
            state_dir,
            limit,
            format,
        } => commands::history::history(&state_dir, &environment, limit, &format),
    }
}
