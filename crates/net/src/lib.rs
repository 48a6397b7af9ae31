//! Framelink Network Library
//!
//! Length-framed message delivery over TCP with server-side fan-out.
//!
//! # Architecture
//!
//! - **Frame**: 12-byte header (magic + length) with resynchronisation on
//!   corrupted streams
//! - **Engine**: per-connection receive task and single-flight send queue,
//!   with callbacks delivered in order on a dispatcher task
//! - **Client**: outbound connection with an optional connect timeout
//! - **Server**: listener tracking accepted [`Connection`]s, with broadcast
//!   and named [`Room`]s
//! - **P2p**: relay forwarding payloads between two accepted connections
//!
//! # Usage
//!
//! ```ignore
//! struct Echo;
//!
//! impl SocketCallback for Echo {
//!     fn on_received(&self, socket: &Connection, packet: Packet) {
//!         socket.send(packet);
//!     }
//! }
//!
//! struct Host;
//!
//! impl ServerCallback for Host {
//!     fn on_accept(&self, _server: &Server, _ip: &IpInfo) -> Option<Arc<dyn SocketCallback>> {
//!         Some(Arc::new(Echo))
//!     }
//! }
//!
//! let server = Server::new();
//! server.start(ServerOptions::default().with_callback(Arc::new(Host)))?;
//! ```

pub mod callback;
pub mod client;
mod engine;
pub mod error;
pub mod frame;
pub mod p2p;
pub mod packet;
pub mod room;
pub mod server;
pub mod socket;

pub use callback::{ClientCallback, P2pCallback, RoomCallback, ServerCallback, SocketCallback};
pub use client::{Client, ClientOptions, ConnectionState};
pub use engine::ConnectionId;
pub use error::{Error, Result};
pub use framelink_core::{
    ConnectStatus, EndpointKind, IpInfo, SendStatus, StartStatus, DEFAULT_HOSTNAME, DEFAULT_PORT,
};
pub use p2p::P2p;
pub use packet::Packet;
pub use room::Room;
pub use server::{Server, ServerOptions};
pub use socket::Connection;
