//! TCP listener that accepts peers and tracks them
//!
//! The server binds a port, admits connections up to an optional cap and
//! asks the application for a [`SocketCallback`] per peer. Every live
//! connection is kept in a table keyed by [`ConnectionId`], which also backs
//! broadcasts and the room registry.
//!
//! [`SocketCallback`]: crate::callback::SocketCallback

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use framelink_core::{ServerConfig, StartStatus, DEFAULT_PORT};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::callback::{RoomCallback, ServerCallback};
use crate::engine::{wait_closed, ConnectionId};
use crate::error::{Error, Result};
use crate::packet::Packet;
use crate::room::{Left, Room, RoomRegistry};
use crate::socket::Connection;

/// Settings for [`Server::start`]
#[derive(Clone)]
pub struct ServerOptions {
    pub callback: Option<Arc<dyn ServerCallback>>,
    /// Notified of room lifecycle events
    pub room_callback: Option<Arc<dyn RoomCallback>>,
    /// Port to listen on; `0` picks an ephemeral port
    pub port: u16,
    /// Admission cap; `None` means unlimited
    pub max_connections: Option<usize>,
    pub no_delay: bool,
}

impl ServerOptions {
    pub fn from_config(config: &ServerConfig, callback: Option<Arc<dyn ServerCallback>>) -> Self {
        Self {
            callback,
            room_callback: None,
            port: config.port,
            max_connections: config.max_connections,
            no_delay: config.no_delay,
        }
    }

    pub fn with_callback(mut self, callback: Arc<dyn ServerCallback>) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn with_room_callback(mut self, callback: Arc<dyn RoomCallback>) -> Self {
        self.room_callback = Some(callback);
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_max_connections(mut self, max_connections: Option<usize>) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_no_delay(mut self, no_delay: bool) -> Self {
        self.no_delay = no_delay;
        self
    }
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default(), None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Stopped,
    Starting,
    Started,
}

struct Lifecycle {
    phase: Phase,
    callback: Option<Arc<dyn ServerCallback>>,
    room_callback: Option<Arc<dyn RoomCallback>>,
    port: u16,
    max_connections: Option<usize>,
    no_delay: bool,
    local_addr: Option<SocketAddr>,
    shutdown: Option<watch::Sender<bool>>,
    /// Set by a `stop()` that arrived while binding
    stop_requested: bool,
}

/// Server state shared across tasks
pub(crate) struct ServerShared {
    lifecycle: Mutex<Lifecycle>,
    connections: Mutex<HashMap<ConnectionId, Connection>>,
    rooms: Mutex<RoomRegistry>,
}

impl ServerShared {
    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_connections(&self) -> MutexGuard<'_, HashMap<ConnectionId, Connection>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_rooms(&self) -> MutexGuard<'_, RoomRegistry> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Server handle
///
/// Cheap to clone; clones control the same listener.
#[derive(Clone)]
pub struct Server {
    shared: Arc<ServerShared>,
}

impl Server {
    pub fn new() -> Self {
        let lifecycle = Lifecycle {
            phase: Phase::Stopped,
            callback: None,
            room_callback: None,
            port: DEFAULT_PORT,
            max_connections: None,
            no_delay: true,
            local_addr: None,
            shutdown: None,
            stop_requested: false,
        };
        Self {
            shared: Arc::new(ServerShared {
                lifecycle: Mutex::new(lifecycle),
                connections: Mutex::new(HashMap::new()),
                rooms: Mutex::new(RoomRegistry::new()),
            }),
        }
    }

    pub(crate) fn from_shared(shared: Arc<ServerShared>) -> Self {
        Self { shared }
    }

    /// Start listening
    ///
    /// Fails synchronously only when `options` carries no callback. The
    /// outcome of the bind is reported through
    /// [`ServerCallback::on_server_started`].
    pub fn start(&self, options: ServerOptions) -> Result<()> {
        let callback = options.callback.clone().ok_or(Error::MissingCallback)?;

        {
            let mut lifecycle = self.shared.lock_lifecycle();
            if lifecycle.phase != Phase::Stopped {
                drop(lifecycle);
                debug!("Server already started");
                let server = self.clone();
                tokio::spawn(async move {
                    callback.on_server_started(&server, StartStatus::FailAlreadyStarted);
                });
                return Ok(());
            }

            lifecycle.phase = Phase::Starting;
            lifecycle.stop_requested = false;
            lifecycle.callback = Some(callback.clone());
            lifecycle.room_callback = options.room_callback.clone();
            lifecycle.port = options.port;
            lifecycle.max_connections = options.max_connections;
            lifecycle.no_delay = options.no_delay;
        }

        tokio::spawn(run(self.clone(), options.port, callback));
        Ok(())
    }

    /// Close the listener and every tracked connection
    ///
    /// A stop issued while the listener is still binding takes effect once
    /// the bind has been reported. Does nothing when already stopped.
    pub fn stop(&self) {
        let (callback, shutdown) = {
            let mut lifecycle = self.shared.lock_lifecycle();
            match lifecycle.phase {
                Phase::Stopped => return,
                Phase::Starting => {
                    debug!("Stop requested while starting");
                    lifecycle.stop_requested = true;
                    return;
                }
                Phase::Started => {}
            }
            lifecycle.phase = Phase::Stopped;
            lifecycle.local_addr = None;
            (lifecycle.callback.take(), lifecycle.shutdown.take())
        };

        if let Some(shutdown) = shutdown {
            shutdown.send_replace(true);
        }

        let drained: Vec<Connection> = self
            .shared
            .lock_connections()
            .drain()
            .map(|(_, connection)| connection)
            .collect();
        for connection in &drained {
            connection.disconnect();
        }
        info!(closed = drained.len(), "Server stopped");

        if let Some(callback) = callback {
            let server = self.clone();
            tokio::spawn(async move {
                callback.on_server_stopped(&server);
            });
        }
    }

    pub fn is_started(&self) -> bool {
        self.shared.lock_lifecycle().phase == Phase::Started
    }

    /// Bound address while started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.lock_lifecycle().local_addr
    }

    /// Bound port while started, otherwise the configured one
    pub fn port(&self) -> u16 {
        let lifecycle = self.shared.lock_lifecycle();
        lifecycle
            .local_addr
            .map_or(lifecycle.port, |addr| addr.port())
    }

    pub fn max_connections(&self) -> Option<usize> {
        self.shared.lock_lifecycle().max_connections
    }

    pub fn no_delay(&self) -> bool {
        self.shared.lock_lifecycle().no_delay
    }

    /// Snapshot of the tracked connections
    pub fn connections(&self) -> Vec<Connection> {
        self.shared.lock_connections().values().cloned().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.lock_connections().len()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Connection> {
        self.shared.lock_connections().get(&id).cloned()
    }

    /// Send `packet` to every tracked connection
    pub fn broadcast(&self, packet: Packet) {
        let packet = packet.into_shared();
        for connection in self.connections() {
            connection.send(packet.clone());
        }
    }

    /// Send `packet` to every tracked connection except `except`
    pub fn broadcast_except(&self, packet: Packet, except: &Connection) {
        let packet = packet.into_shared();
        for connection in self.connections() {
            if connection != *except {
                connection.send(packet.clone());
            }
        }
    }

    /// Add `connection` to `name`, creating the room on first reference
    pub fn join(&self, connection: &Connection, name: &str) -> Result<Room> {
        let joined = {
            let mut rooms = self.shared.lock_rooms();
            if !connection.is_connection_alive() {
                return Err(Error::NotConnected);
            }
            rooms.join(name, connection.id())
        };

        let room = Room::new(name, Arc::downgrade(&self.shared));
        if joined.added {
            debug!(room = name, connection_id = %connection.id(), "Joined room");
            if let Some(callback) = self.room_callback() {
                let room = room.clone();
                let connection = connection.clone();
                tokio::spawn(async move {
                    if joined.created {
                        callback.on_created(&room);
                    }
                    callback.on_join(&room, &connection);
                });
            }
        }
        Ok(room)
    }

    /// Remove `connection` from `name`; returns `false` if it was not a member
    pub fn leave(&self, connection: &Connection, name: &str) -> bool {
        let left = self.shared.lock_rooms().leave(name, connection.id());
        if left == Left::NotMember {
            return false;
        }
        debug!(room = name, connection_id = %connection.id(), "Left room");
        self.notify_left(connection, vec![(name.to_string(), left)]);
        true
    }

    /// Handle for an existing room
    pub fn room(&self, name: &str) -> Option<Room> {
        self.shared
            .lock_rooms()
            .contains(name)
            .then(|| Room::new(name, Arc::downgrade(&self.shared)))
    }

    pub fn room_names(&self) -> Vec<String> {
        self.shared.lock_rooms().names()
    }

    /// Rooms `connection` is a member of
    pub fn rooms_of(&self, connection: &Connection) -> Vec<String> {
        self.shared.lock_rooms().rooms_of(connection.id())
    }

    /// Send to every member of `name` except `excluding`
    ///
    /// Returns how many members a send was issued to.
    pub fn broadcast_to_room(
        &self,
        name: &str,
        packet: Packet,
        excluding: Option<&Connection>,
    ) -> usize {
        let excluded = excluding.map(Connection::id);
        let targets: Vec<Connection> = self
            .room_members(name)
            .into_iter()
            .filter(|connection| Some(connection.id()) != excluded)
            .collect();

        let packet = packet.into_shared();
        for connection in &targets {
            connection.send(packet.clone());
        }

        if let Some(callback) = self.room_callback() {
            if self.shared.lock_rooms().contains(name) {
                let room = Room::new(name, Arc::downgrade(&self.shared));
                tokio::spawn(async move {
                    callback.on_broadcast(&room, &packet);
                });
            }
        }
        targets.len()
    }

    pub(crate) fn room_members(&self, name: &str) -> Vec<Connection> {
        let ids = self.shared.lock_rooms().members(name);
        let connections = self.shared.lock_connections();
        ids.iter()
            .filter_map(|id| connections.get(id).cloned())
            .collect()
    }

    pub(crate) fn room_member_count(&self, name: &str) -> usize {
        self.shared.lock_rooms().member_count(name)
    }

    /// Forget a closed connection: drop it from the table and every room
    pub(crate) fn detach(&self, connection: &Connection) {
        self.shared.lock_connections().remove(&connection.id());
        let left = self.shared.lock_rooms().leave_all(connection.id());
        if !left.is_empty() {
            self.notify_left(connection, left);
        }
    }

    fn room_callback(&self) -> Option<Arc<dyn RoomCallback>> {
        self.shared.lock_lifecycle().room_callback.clone()
    }

    fn notify_left(&self, connection: &Connection, left: Vec<(String, Left)>) {
        let Some(callback) = self.room_callback() else {
            return;
        };
        let weak = Arc::downgrade(&self.shared);
        let connection = connection.clone();
        tokio::spawn(async move {
            for (name, outcome) in left {
                let room = Room::new(&name, weak.clone());
                callback.on_leave(&room, &connection);
                if outcome == Left::Destroyed {
                    callback.on_destroy(&room);
                }
            }
        });
    }

    /// Register an accepted stream and run the accept handshake
    fn admit(&self, stream: TcpStream, addr: SocketAddr) {
        let (callback, max_connections, no_delay) = {
            let lifecycle = self.shared.lock_lifecycle();
            (
                lifecycle.callback.clone(),
                lifecycle.max_connections,
                lifecycle.no_delay,
            )
        };
        let Some(callback) = callback else {
            return;
        };

        if no_delay {
            if let Err(e) = stream.set_nodelay(true) {
                debug!(addr = %addr, error = %e, "Failed to set TCP_NODELAY");
            }
        }

        let (connection, events) =
            Connection::accept(stream, addr, Arc::downgrade(&self.shared));
        {
            let mut connections = self.shared.lock_connections();
            if max_connections.is_some_and(|max| connections.len() >= max) {
                drop(connections);
                info!(addr = %addr, "Connection limit reached, closing");
                connection.abandon();
                return;
            }
            connections.insert(connection.id(), connection.clone());
        }

        let server = self.clone();
        tokio::spawn(async move {
            let ip_info = connection.ip_info().clone();
            match callback.on_accept(&server, &ip_info) {
                Some(socket_callback) => {
                    connection.set_callback(Some(socket_callback));
                    connection.start(events);
                    info!(addr = %addr, connection_id = %connection.id(), "Peer connected");

                    // Stopped while the handshake ran
                    let tracked = server
                        .shared
                        .lock_connections()
                        .contains_key(&connection.id());
                    if !tracked {
                        connection.disconnect();
                    }
                }
                None => {
                    server.shared.lock_connections().remove(&connection.id());
                    connection.abandon();
                    debug!(addr = %addr, "Connection rejected");
                }
            }
        });
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

/// Bind the listener, report the outcome and accept until stopped
async fn run(server: Server, port: u16, callback: Arc<dyn ServerCallback>) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let bound = match TcpListener::bind(addr).await {
        Ok(listener) => listener.local_addr().map(|local| (listener, local)),
        Err(e) => Err(e),
    };

    let (listener, local_addr) = match bound {
        Ok(bound) => bound,
        Err(e) => {
            warn!(addr = %addr, error = %e, "Bind failed");
            {
                let mut lifecycle = server.shared.lock_lifecycle();
                lifecycle.phase = Phase::Stopped;
                lifecycle.callback = None;
            }
            callback.on_server_started(&server, StartStatus::FailSocketError);
            return;
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let stop_requested = {
        let mut lifecycle = server.shared.lock_lifecycle();
        lifecycle.phase = Phase::Started;
        lifecycle.local_addr = Some(local_addr);
        lifecycle.shutdown = Some(shutdown_tx);
        std::mem::take(&mut lifecycle.stop_requested)
    };

    info!(addr = %local_addr, "Server started");
    callback.on_server_started(&server, StartStatus::Success);
    if stop_requested {
        server.stop();
        return;
    }
    accept_loop(server, listener, shutdown_rx).await;
}

/// Accept incoming connections
async fn accept_loop(server: Server, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!(addr = %addr, "New connection");
                        server.admit(stream, addr);
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                    }
                }
            }
            _ = wait_closed(&mut shutdown) => {
                info!("Accept loop shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use framelink_core::IpInfo;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use crate::callback::SocketCallback;

    const WAIT: Duration = Duration::from_secs(5);

    struct Recorder {
        started: mpsc::UnboundedSender<StartStatus>,
        stopped: mpsc::UnboundedSender<()>,
    }

    struct Quiet;

    impl SocketCallback for Quiet {
        fn on_received(&self, _socket: &Connection, _packet: Packet) {}
    }

    impl ServerCallback for Recorder {
        fn on_server_started(&self, _server: &Server, status: StartStatus) {
            let _ = self.started.send(status);
        }

        fn on_accept(&self, _server: &Server, _ip_info: &IpInfo) -> Option<Arc<dyn SocketCallback>> {
            Some(Arc::new(Quiet))
        }

        fn on_server_stopped(&self, _server: &Server) {
            let _ = self.stopped.send(());
        }
    }

    fn recorder() -> (
        Arc<Recorder>,
        mpsc::UnboundedReceiver<StartStatus>,
        mpsc::UnboundedReceiver<()>,
    ) {
        let (started, started_rx) = mpsc::unbounded_channel();
        let (stopped, stopped_rx) = mpsc::unbounded_channel();
        (Arc::new(Recorder { started, stopped }), started_rx, stopped_rx)
    }

    #[tokio::test]
    async fn test_start_requires_callback() {
        let server = Server::new();
        let result = server.start(ServerOptions::default().with_port(0));
        assert!(matches!(result, Err(Error::MissingCallback)));
        assert!(!server.is_started());
    }

    #[tokio::test]
    async fn test_server_start() {
        let (callback, mut started, mut stopped) = recorder();
        let server = Server::new();
        server
            .start(ServerOptions::default().with_port(0).with_callback(callback))
            .unwrap();

        let status = timeout(WAIT, started.recv()).await.unwrap().unwrap();
        assert_eq!(status, StartStatus::Success);
        assert!(server.is_started());
        assert!(server.port() > 0);
        assert_eq!(server.local_addr().map(|a| a.port()), Some(server.port()));

        server.stop();
        timeout(WAIT, stopped.recv()).await.unwrap().unwrap();
        assert!(!server.is_started());
    }

    #[tokio::test]
    async fn test_start_twice_reports_already_started() {
        let (callback, mut started, _stopped) = recorder();
        let server = Server::new();
        let options = ServerOptions::default().with_port(0).with_callback(callback);

        server.start(options.clone()).unwrap();
        server.start(options).unwrap();

        let mut statuses = vec![
            timeout(WAIT, started.recv()).await.unwrap().unwrap(),
            timeout(WAIT, started.recv()).await.unwrap().unwrap(),
        ];
        statuses.sort_by_key(|s| s.is_success());
        assert_eq!(
            statuses,
            vec![StartStatus::FailAlreadyStarted, StartStatus::Success]
        );
        server.stop();
    }

    #[tokio::test]
    async fn test_bind_conflict_reports_socket_error() {
        let taken = TcpListener::bind("0.0.0.0:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let (callback, mut started, _stopped) = recorder();
        let server = Server::new();
        server
            .start(ServerOptions::default().with_port(port).with_callback(callback))
            .unwrap();

        let status = timeout(WAIT, started.recv()).await.unwrap().unwrap();
        assert_eq!(status, StartStatus::FailSocketError);
        assert!(!server.is_started());
    }

    #[tokio::test]
    async fn test_stop_while_starting_closes_listener() {
        let (callback, mut started, mut stopped) = recorder();
        let server = Server::new();
        server
            .start(ServerOptions::default().with_port(0).with_callback(callback))
            .unwrap();
        server.stop();

        let status = timeout(WAIT, started.recv()).await.unwrap().unwrap();
        assert_eq!(status, StartStatus::Success);
        timeout(WAIT, stopped.recv()).await.unwrap().unwrap();
        assert!(!server.is_started());
        assert_eq!(server.local_addr(), None);

        // A later start binds afresh
        let (callback, mut started, _stopped) = recorder();
        server
            .start(ServerOptions::default().with_port(0).with_callback(callback))
            .unwrap();
        let status = timeout(WAIT, started.recv()).await.unwrap().unwrap();
        assert_eq!(status, StartStatus::Success);
        assert!(server.is_started());
        server.stop();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (callback, mut started, mut stopped) = recorder();
        let server = Server::new();

        // Not started yet: nothing happens
        server.stop();

        server
            .start(ServerOptions::default().with_port(0).with_callback(callback))
            .unwrap();
        timeout(WAIT, started.recv()).await.unwrap().unwrap();

        server.stop();
        server.stop();
        timeout(WAIT, stopped.recv()).await.unwrap().unwrap();
        assert!(timeout(Duration::from_millis(100), stopped.recv())
            .await
            .is_err());
    }
}
