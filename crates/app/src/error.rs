//! Application error types

use framelink_core::{ConfigError, ConnectStatus, StartStatus};

/// Application result type
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Network error: {0}")]
    Net(#[from] framelink_net::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Server failed to start: {0}")]
    StartFailed(StartStatus),

    #[error("Connect failed: {0}")]
    ConnectFailed(ConnectStatus),

    #[error("Connection closed")]
    Closed,
}
