use clap::Parser;
use skiff_core::telemetry::logging;
use skiff_core::terminal::{app, cli::Cli, error::CliError};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(err) = logging::init(&cli.logging.to_config()) {
        eprintln!("❌ {}", CliError::Logging(err.to_string()));
        std::process::exit(1);
    }

    if let Err(err) = app::run(cli).await {
        eprintln!("❌ {err}");
        std::process::exit(1);
    }
}
