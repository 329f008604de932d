mod cli;

use std::time::Duration;

use clap::Parser;
use skiff_relay::config::Config;
use tracing::error;

use crate::cli::{Cli, Commands, ServeArgs};

#[tokio::main]
async fn main() {
    // Default to WARN level if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "warn");
    }
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let serve_args = match cli.command {
        Some(Commands::Roster { url, wait_secs }) => {
            if let Err(e) = cli::run_roster_probe(url, Duration::from_secs(wait_secs)).await {
                error!("roster probe failed: {e:#}");
                std::process::exit(1);
            }
            return;
        }
        Some(Commands::Serve(args)) => args,
        None => ServeArgs::default(),
    };

    let config = serve_args.apply(Config::from_env());
    let addr = config.listen_addr();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind {addr}: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = skiff_relay::serve(listener, &config).await {
        error!("{e:#}");
        std::process::exit(1);
    }
}
