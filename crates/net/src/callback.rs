//! Callback interfaces implemented by applications
//!
//! All callbacks run on worker tasks, never on the I/O path, so they may
//! call back into the engine (send, disconnect, join rooms, ...) freely.
//! Notifications for a single connection arrive in order.

use std::sync::Arc;

use framelink_core::{ConnectStatus, IpInfo, SendStatus, StartStatus};

use crate::client::Client;
use crate::p2p::P2p;
use crate::packet::Packet;
use crate::room::Room;
use crate::server::Server;
use crate::socket::Connection;

/// Events of an accepted connection
pub trait SocketCallback: Send + Sync {
    /// The connection is live and receiving
    fn on_new_connection(&self, _socket: &Connection) {}

    /// A complete frame payload arrived
    fn on_received(&self, socket: &Connection, packet: Packet);

    /// Terminal outcome of one send
    fn on_sent(&self, _socket: &Connection, _status: SendStatus, _packet: Packet) {}

    /// Fired exactly once per connection
    fn on_disconnect(&self, _socket: &Connection) {}
}

/// Events of a listening server
pub trait ServerCallback: Send + Sync {
    fn on_server_started(&self, _server: &Server, _status: StartStatus) {}

    /// Supply the callback for a newly accepted peer, or `None` to reject it
    fn on_accept(&self, server: &Server, ip_info: &IpInfo) -> Option<Arc<dyn SocketCallback>>;

    fn on_server_stopped(&self, _server: &Server) {}
}

/// Events of an outbound connection
pub trait ClientCallback: Send + Sync {
    /// Terminal outcome of one connect attempt
    fn on_connected(&self, client: &Client, status: ConnectStatus);

    fn on_received(&self, client: &Client, packet: Packet);

    fn on_sent(&self, _client: &Client, _status: SendStatus, _packet: Packet) {}

    fn on_disconnect(&self, _client: &Client) {}
}

/// Room lifecycle notifications
pub trait RoomCallback: Send + Sync {
    fn on_created(&self, _room: &Room) {}

    fn on_join(&self, _room: &Room, _socket: &Connection) {}

    fn on_leave(&self, _room: &Room, _socket: &Connection) {}

    fn on_broadcast(&self, _room: &Room, _packet: &Packet) {}

    /// The last member left and the room is gone
    fn on_destroy(&self, _room: &Room) {}
}

/// Notified when a P2P pairing is torn down
pub trait P2pCallback: Send + Sync {
    fn on_detached(&self, p2p: &P2p, first: &Connection, second: &Connection);
}
