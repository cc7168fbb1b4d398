//! foris-client
//!
//! Sends one request to a foris-controller and prints the reply as JSON.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use foris_client::args::{load_client_config, read_input, BusCommand};
use foris_client::commands::{send_command, SendRequest};
use foris_client::output::{print_error, write_reply};
use foris_client::logging;

#[derive(Parser)]
#[command(name = "foris-client")]
#[command(author, version, about = "Send requests to foris-controller")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Input data file in JSON format (no data is sent when absent)
    #[arg(short, long, value_name = "INPUT_FILE", conflicts_with = "input_json")]
    input: Option<PathBuf>,

    /// Input data in JSON format (no data is sent when absent)
    #[arg(short = 'I', long, value_name = "INPUT_JSON")]
    input_json: Option<String>,

    /// Where to store the output JSON
    #[arg(short, long, value_name = "OUTPUT_FILE")]
    output: Option<PathBuf>,

    /// Module which will be used
    #[arg(short, long)]
    module: String,

    /// Action which will be performed
    #[arg(short, long)]
    action: String,

    /// Timeout in ms (0 waits forever)
    #[arg(short, long, default_value_t = 0)]
    timeout: u64,

    #[command(subcommand)]
    bus: BusCommand,
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = load_client_config(cli.config.as_deref())?;
    cli.bus.apply(&mut config);

    let data = read_input(cli.input.as_deref(), cli.input_json.as_deref())?;
    let request = SendRequest {
        module: cli.module,
        action: cli.action,
        data,
        timeout: Duration::from_millis(cli.timeout),
    };

    let reply = send_command(&cli.bus, &config, request).await?;
    write_reply(cli.output.as_deref(), &reply).context("Failed to write reply")?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = logging::init(cli.debug, None) {
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
