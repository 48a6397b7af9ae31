//! Command line interface

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use framelink_core::{ClientConfig, Config, ServerConfig};

use crate::error::Result;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the sample chat server
    Server(ServerArgs),
    /// Connect to a chat server and chat from stdin
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Port to listen on. Use 0 for an ephemeral port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Maximum number of simultaneous connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Config file (defaults to the platform config directory)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Host name of the server
    #[arg(long)]
    pub host: Option<String>,

    #[arg(long)]
    pub port: Option<u16>,

    /// Connect timeout in milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Config file (defaults to the platform config directory)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl ServerArgs {
    /// Load the config file and apply command line overrides
    pub fn resolve(&self) -> Result<ServerConfig> {
        let mut config = Config::load_or_default(self.config.as_deref())?.server;
        if let Some(port) = self.port {
            config.port = port;
        }
        if self.max_connections.is_some() {
            config.max_connections = self.max_connections;
        }
        Ok(config)
    }
}

impl ClientArgs {
    /// Load the config file and apply command line overrides
    pub fn resolve(&self) -> Result<ClientConfig> {
        let mut config = Config::load_or_default(self.config.as_deref())?.client;
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if self.timeout_ms.is_some() {
            config.connect_timeout_ms = self.timeout_ms;
        }
        Ok(config)
    }
}
