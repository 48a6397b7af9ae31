//! Server-side connection to one accepted peer

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use framelink_core::{EndpointKind, IpInfo};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::callback::SocketCallback;
use crate::engine::{spawn_dispatcher, ConnectionId, Engine, EngineEvent};
use crate::error::{Error, Result};
use crate::packet::Packet;
use crate::room::Room;
use crate::server::{Server, ServerShared};

pub(crate) struct ConnectionShared {
    engine: Engine,
    ip_info: IpInfo,
    callback: Mutex<Option<Arc<dyn SocketCallback>>>,
    server: Weak<ServerShared>,
}

impl Drop for ConnectionShared {
    fn drop(&mut self) {
        self.engine.disconnect();
    }
}

/// An accepted peer connection
///
/// Cheap to clone; clones refer to the same connection. Equality and hashing
/// follow the connection id.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<ConnectionShared>,
}

impl Connection {
    /// Wrap an accepted stream; the engine is not started yet
    pub(crate) fn accept(
        stream: TcpStream,
        addr: SocketAddr,
        server: Weak<ServerShared>,
    ) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (engine, events) = Engine::new(stream);
        let ip_info = engine
            .ip_info()
            .cloned()
            .unwrap_or_else(|| IpInfo::new(addr, EndpointKind::Remote));

        let shared = ConnectionShared {
            engine,
            ip_info,
            callback: Mutex::new(None),
            server,
        };
        (
            Self {
                shared: Arc::new(shared),
            },
            events,
        )
    }

    /// Start delivering events and receiving frames
    pub(crate) fn start(&self, events: mpsc::UnboundedReceiver<EngineEvent>) {
        spawn_dispatcher(self.shared.clone(), events, dispatch);
        self.shared.engine.start();
    }

    /// Close the stream of a connection that was never started
    pub(crate) fn abandon(&self) {
        self.shared.engine.abandon();
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.engine.id()
    }

    pub fn ip_info(&self) -> &IpInfo {
        &self.shared.ip_info
    }

    pub fn is_connection_alive(&self) -> bool {
        self.shared.engine.is_connected()
    }

    /// Send a packet; the outcome is reported through `on_sent`
    pub fn send(&self, packet: Packet) {
        self.shared.engine.send(packet);
    }

    /// Send a copy of `data`
    pub fn send_bytes(&self, data: &[u8]) {
        self.send(Packet::from_slice(data));
    }

    pub fn disconnect(&self) {
        self.shared.engine.disconnect();
    }

    /// The server that accepted this connection, while it exists
    pub fn server(&self) -> Option<Server> {
        self.shared.server.upgrade().map(Server::from_shared)
    }

    /// Send to every other connection of the server
    pub fn broadcast(&self, packet: Packet) {
        if let Some(server) = self.server() {
            server.broadcast_except(packet, self);
        }
    }

    /// Join (or create) a room on the server
    pub fn join(&self, room_name: &str) -> Result<Room> {
        match self.server() {
            Some(server) => server.join(self, room_name),
            None => Err(Error::NotConnected),
        }
    }

    pub fn leave(&self, room_name: &str) -> bool {
        self.server()
            .map(|server| server.leave(self, room_name))
            .unwrap_or(false)
    }

    /// Send to every other member of `room_name`
    pub fn broadcast_to_room(&self, room_name: &str, packet: Packet) -> usize {
        self.server()
            .map(|server| server.broadcast_to_room(room_name, packet, Some(self)))
            .unwrap_or(0)
    }

    /// Rooms this connection is a member of
    pub fn rooms(&self) -> Vec<String> {
        self.server()
            .map(|server| server.rooms_of(self))
            .unwrap_or_default()
    }

    pub fn callback(&self) -> Option<Arc<dyn SocketCallback>> {
        self.lock_callback().clone()
    }

    /// Replace the callback; later events go to the new one
    pub fn set_callback(&self, callback: Option<Arc<dyn SocketCallback>>) {
        *self.lock_callback() = callback;
    }

    fn lock_callback(&self) -> MutexGuard<'_, Option<Arc<dyn SocketCallback>>> {
        self.shared
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn dispatch(shared: Arc<ConnectionShared>, event: EngineEvent) {
    let socket = Connection { shared };
    let callback = socket.callback();

    match event {
        EngineEvent::Connected => {
            if let Some(cb) = callback {
                cb.on_new_connection(&socket);
            }
        }
        EngineEvent::Received(packet) => {
            if let Some(cb) = callback {
                cb.on_received(&socket, packet);
            }
        }
        EngineEvent::Sent(status, packet) => {
            if let Some(cb) = callback {
                cb.on_sent(&socket, status, packet);
            }
        }
        EngineEvent::Disconnected => {
            if let Some(server) = socket.server() {
                server.detach(&socket);
            }
            if let Some(cb) = callback {
                cb.on_disconnect(&socket);
            }
        }
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Connection {}

impl Hash for Connection {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("peer", &self.shared.ip_info.endpoint())
            .finish()
    }
}
