use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use memkeep::cli::{self, Cli};
use memkeep::config::MemkeepConfig;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match MemkeepConfig::load(cli.root.as_deref()) {
        Ok(config) => config,
        Err(e) => return emit(Err(e)),
    };

    // Log to stderr so stdout carries only the JSON payload.
    let filter = EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    emit(cli::execute(cli.command, config).await)
}

fn emit(result: anyhow::Result<serde_json::Value>) -> ExitCode {
    let (value, code) = match result {
        Ok(value) => (value, ExitCode::SUCCESS),
        Err(e) => (cli::error_payload(&e), ExitCode::FAILURE),
    };
    println!("{value}");
    code
}
