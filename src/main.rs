use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use testsmith::config::Settings;
use testsmith::telemetry;

mod cmd;

#[derive(Parser)]
#[command(name = "testsmith")]
#[command(version, about = "Self-healing web test orchestrator")]
pub struct Cli {
    /// Debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Path to testsmith.toml (default: ./testsmith.toml, then the user config dir)
    #[arg(long, global = true, env = "TESTSMITH_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Discover, generate, execute and heal tests for one or more URLs
    Run {
        /// Target URLs (each becomes one queued run)
        #[arg(required = true)]
        urls: Vec<String>,

        /// Crawl/execution preset: quick, balanced, deep
        #[arg(long, default_value = "balanced")]
        preset: String,

        /// Run the browser headed
        #[arg(long)]
        headed: bool,

        /// User story to test instead of a generated one
        #[arg(long)]
        story: Option<String>,

        /// Do not heal failing tests
        #[arg(long)]
        no_heal: bool,

        /// Healing attempt budget per run (overrides healing.max_attempts)
        #[arg(long)]
        max_heal_attempts: Option<u32>,

        /// Concurrent runs (overrides queue.max_concurrent)
        #[arg(long)]
        max_concurrent: Option<usize>,
    },
    /// Inspect stored runs
    Runs {
        #[command(subcommand)]
        command: RunsCommands,
    },
    /// View, validate or create configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum RunsCommands {
    /// List recent runs
    List {
        /// Maximum runs to show
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Show one run with its event log
    Show {
        /// Run id (a unique prefix is enough)
        run_id: String,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate the configuration file
    Validate,
    /// Create a default testsmith.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is normal.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    if let Commands::Config { command } = &cli.command {
        return cmd::cmd_config(cli.config.as_deref(), command.clone());
    }

    let (mut settings, _) = Settings::resolve(cli.config.as_deref())?;
    if cli.json_logs {
        settings.logging.json = true;
    }
    let _log_guard = telemetry::init(&settings.logging, cli.verbose)?;

    match cli.command {
        Commands::Run {
            urls,
            preset,
            headed,
            story,
            no_heal,
            max_heal_attempts,
            max_concurrent,
        } => {
            let options = cmd::RunOptions {
                urls,
                preset: preset.parse().map_err(|e: String| anyhow::anyhow!(e))?,
                headed,
                story,
                no_heal,
                max_heal_attempts,
                max_concurrent,
            };
            cmd::cmd_run(settings, options).await?;
        }
        Commands::Runs { command } => cmd::cmd_runs(&settings, command).await?,
        Commands::Config { .. } => {}
    }

    Ok(())
}
