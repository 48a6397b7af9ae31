//! Network error types
//!
//! These cover synchronous rejections and transport failures inside the
//! engine. Per-operation outcomes reach applications as statuses through
//! their callbacks.

use std::io;

/// Network result type
pub type Result<T> = std::result::Result<T, Error>;

/// Network errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("No callback supplied")]
    MissingCallback,

    #[error("Not connected")]
    NotConnected,

    #[error("Already paired")]
    AlreadyPaired,
}
