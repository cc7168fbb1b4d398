//! foris-listener
//!
//! Prints notifications from foris-controller, one line each:
//! `{controller_id} {json}`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use foris_client::args::{load_client_config, BusCommand};
use foris_client::commands::listen_command;
use foris_client::logging;
use foris_client::output::{print_error, NotificationSink};

#[derive(Parser)]
#[command(name = "foris-listener")]
#[command(author, version, about = "Listen for foris-controller notifications")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Where to store output JSON data
    #[arg(short, long, value_name = "OUTPUT_FILE")]
    output: Option<PathBuf>,

    /// Module to listen to (all when absent)
    #[arg(short, long)]
    module: Option<String>,

    /// Timeout in ms (0 listens forever)
    #[arg(short, long, default_value_t = 0)]
    timeout: u64,

    /// File where the logs will be appended
    #[arg(short, long)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    bus: BusCommand,
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = load_client_config(cli.config.as_deref())?;
    cli.bus.apply(&mut config);

    let mut sink = NotificationSink::open(cli.output.as_deref())
        .with_context(|| format!("Failed to open output {:?}", cli.output))?;

    listen_command(
        &cli.bus,
        &config,
        cli.module,
        Duration::from_millis(cli.timeout),
        &mut sink,
    )
    .await?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = logging::init(cli.debug, cli.log_file.as_deref()) {
        print_error(&format!("{:#}", e));
        return ExitCode::FAILURE;
    }
    tracing::debug!("Version {}", env!("CARGO_PKG_VERSION"));

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            print_error(&format!("{:#}", e));
            ExitCode::FAILURE
        }
    }
}
