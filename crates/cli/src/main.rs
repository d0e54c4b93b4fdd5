//! Retail analytics CLI
//!
//! Runs the transaction aggregation pipeline and its operator tasks.

mod commands;
mod components;

use clap::{Parser, Subcommand};
use colored::Colorize;
use commands::{ConfigCommand, MigrateCommand, PublishCommand, RunCommand};
use retail_analytics_config::{ObservabilityConfig, ServiceConfig};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "retail-analytics",
    version,
    about = "Windowed revenue aggregation over e-commerce transactions"
)]
struct Cli {
    /// Configuration file (YAML); RETAIL_* environment variables override it
    #[arg(short, long, global = true, value_name = "FILE", env = "RETAIL_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume, aggregate and persist until interrupted
    Run(RunCommand),

    /// Publish transactions from a JSON-lines file
    Publish(PublishCommand),

    /// Apply the durable store schema
    Migrate(MigrateCommand),

    /// Inspect the effective configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = ServiceConfig::load(cli.config)?;
    init_tracing(&config.observability, cli.verbose);

    match cli.command {
        Commands::Run(cmd) => cmd.execute(config).await,
        Commands::Publish(cmd) => cmd.execute(config).await,
        Commands::Migrate(cmd) => cmd.execute(config).await,
        Commands::Config(cmd) => cmd.execute(&config),
    }
}

fn init_tracing(observability: &ObservabilityConfig, verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let directives = if verbose {
            format!("{},processor=debug,retail_analytics=debug", observability.log_level)
        } else {
            observability.log_level.clone()
        };
        EnvFilter::new(directives)
    });

    let registry = tracing_subscriber::registry().with(filter);
    if observability.json_logging {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}
