//! Framelink Core Library
//!
//! Types shared by the networking engine and the applications built on it:
//! completion statuses, endpoint information, defaults and configuration.

pub mod config;
pub mod endpoint;
pub mod status;

pub use config::{ClientConfig, Config, ConfigError, ServerConfig};
pub use endpoint::{EndpointKind, IpInfo};
pub use status::{ConnectStatus, SendStatus, StartStatus};

/// Default host name used when none is configured
pub const DEFAULT_HOSTNAME: &str = "localhost";

/// Default port for clients and servers
pub const DEFAULT_PORT: u16 = 8080;
