use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use diffdrive_runtime::config::{DEFAULT_BAUDRATE, DEFAULT_PORT};
use diffdrive_runtime::runtime::{self, RuntimeOptions};

/// Bridge a differential-drive motor controller to zenoh
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Serial port of the motor controller board
    #[arg(long, default_value = DEFAULT_PORT)]
    port: String,

    /// Robot configuration (TOML)
    #[arg(long, value_name = "FILE", default_value = "robot.toml")]
    config: PathBuf,

    /// Serial baud rate
    #[arg(long, default_value_t = DEFAULT_BAUDRATE)]
    baud: u32,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let options = RuntimeOptions {
        port: cli.port,
        config_path: cli.config,
        baud_rate: cli.baud,
    };
    if let Err(e) = runtime::run(options).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
