//! Framelink - framed TCP messaging sample
//!
//! Runs either the sample chat server or an interactive chat client on top
//! of the framelink engine.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod chat_client;
mod chat_server;
mod cli;
mod error;
mod protocol;

use cli::{Cli, Command};

fn main() {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Failed to create tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    let result = runtime.block_on(async {
        match cli.command {
            Command::Server(args) => {
                let config = args.resolve()?;
                tracing::info!(port = config.port, "Starting Framelink server");
                chat_server::run(&config).await
            }
            Command::Client(args) => {
                let config = args.resolve()?;
                tracing::info!(host = %config.host, port = config.port, "Starting Framelink client");
                chat_client::run(&config).await
            }
        }
    });

    if let Err(e) = result {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}
