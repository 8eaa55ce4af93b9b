//! Competition exchange - main entry point
//!
//! This binary provides two subcommands:
//! - replay: Run a JSON order script through the matching engine
//! - check-config: Validate and summarise an exchange configuration

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "competition-exchange")]
#[command(
    about = "Order matching and settlement engine for a simulated trading competition",
    long_about = None
)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replay an order script and print fills, books and portfolios
    Replay {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/exchange.json")]
        config: String,

        /// Path to the JSON order script
        #[arg(short, long, default_value = "demos/replay.json")]
        script: String,

        /// Persist to (and recover from) this directory
        #[arg(long)]
        state_dir: Option<String>,
    },

    /// Validate a configuration file
    CheckConfig {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/exchange.json")]
        config: String,
    },
}

fn setup_logging(verbose: bool, command_name: &str) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    // Log file naming pattern: {command}_{date}.log
    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    let level = if verbose { "debug" } else { "info" };
    let filter_str = format!("{},rusqlite=warn", level);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true);

    // Same format without ANSI colors
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("Logging initialized");
    info!("Log file: {}", log_path.display());

    Ok(())
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let command_name = match &cli.command {
        Commands::Replay { .. } => "replay",
        Commands::CheckConfig { .. } => "check_config",
    };

    setup_logging(cli.verbose, command_name)?;

    match cli.command {
        Commands::Replay {
            config,
            script,
            state_dir,
        } => commands::replay::run(config, script, state_dir),

        Commands::CheckConfig { config } => commands::check_config::run(config),
    }
}
