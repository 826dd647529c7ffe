//! segrun CLI: compose a configuration and drive one experiment run.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// segrun: experiment runs for segmentation and self-supervised training
#[derive(Parser, Debug)]
#[command(name = "segrun", version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Options shared by every subcommand.
#[derive(clap::Args, Debug, Clone)]
pub struct GlobalArgs {
    /// TOML configuration file layered under the command-line overrides
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Trainer script speaking the segrun JSON-lines protocol
    #[arg(long, global = true, default_value = "train.py")]
    pub trainer: PathBuf,

    /// Interpreter used to run the trainer script
    #[arg(long, global = true, default_value = "python3")]
    pub python: PathBuf,

    /// Working directory of the trainer process
    #[arg(long, global = true, default_value = ".")]
    pub run_dir: PathBuf,
}

#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Compose the configuration and run the selected agent
    Run {
        /// Overrides as KEY=VALUE (e.g. architecture=SegNet input_size=(32,32))
        overrides: Vec<String>,
    },
    /// Print the composed configuration as TOML
    Config {
        /// Overrides as KEY=VALUE
        overrides: Vec<String>,
    },
    /// List registered agents, models and data modules
    Strategies,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "segrun", "segrun")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "segrun.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    commands::handle_command(cli.command, &cli.global).await
}
