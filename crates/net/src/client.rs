//! TCP client for connecting to a framelink server

use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use framelink_core::{ClientConfig, ConnectStatus, IpInfo, SendStatus, DEFAULT_HOSTNAME};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::callback::ClientCallback;
use crate::engine::{spawn_dispatcher, ConnectionId, Engine, EngineEvent};
use crate::error::{Error, Result};
use crate::packet::Packet;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Settings for [`Client::connect`]
#[derive(Clone)]
pub struct ClientOptions {
    pub callback: Option<Arc<dyn ClientCallback>>,
    /// Empty falls back to the default host
    pub host_name: String,
    pub port: u16,
    pub no_delay: bool,
    /// `None` waits for the operating system to give up
    pub connect_timeout: Option<Duration>,
}

impl ClientOptions {
    pub fn from_config(config: &ClientConfig, callback: Option<Arc<dyn ClientCallback>>) -> Self {
        Self {
            callback,
            host_name: config.host.clone(),
            port: config.port,
            no_delay: config.no_delay,
            connect_timeout: config.connect_timeout(),
        }
    }

    pub fn with_callback(mut self, callback: Arc<dyn ClientCallback>) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn with_host(mut self, host_name: impl Into<String>) -> Self {
        self.host_name = host_name.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_no_delay(mut self, no_delay: bool) -> Self {
        self.no_delay = no_delay;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Option<Duration>) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default(), None)
    }
}

struct ClientState {
    connection: ConnectionState,
    /// Bumped by every connect so a stale attempt cannot claim the client
    attempt: u64,
    engine: Option<Engine>,
    callback: Option<Arc<dyn ClientCallback>>,
    host_name: String,
    port: u16,
    no_delay: bool,
    connect_timeout: Option<Duration>,
}

pub(crate) struct ClientShared {
    state: Mutex<ClientState>,
}

/// Client handle for network operations
///
/// Cheap to clone; clones drive the same connection.
#[derive(Clone)]
pub struct Client {
    shared: Arc<ClientShared>,
}

impl Client {
    pub fn new() -> Self {
        let defaults = ClientOptions::default();
        let state = ClientState {
            connection: ConnectionState::Disconnected,
            attempt: 0,
            engine: None,
            callback: None,
            host_name: defaults.host_name,
            port: defaults.port,
            no_delay: defaults.no_delay,
            connect_timeout: defaults.connect_timeout,
        };
        Self {
            shared: Arc::new(ClientShared {
                state: Mutex::new(state),
            }),
        }
    }

    /// Connect to a server
    ///
    /// Fails synchronously only when `options` carries no callback. The
    /// outcome is reported through [`ClientCallback::on_connected`].
    pub fn connect(&self, options: ClientOptions) -> Result<()> {
        if let Some(attempt) = self.begin(options)? {
            let host_name = attempt.host_name.clone();
            let port = attempt.port;
            tokio::spawn(async move {
                attempt
                    .run(TcpStream::connect((host_name.as_str(), port)))
                    .await;
            });
        }
        Ok(())
    }

    /// Claim the client for a new attempt
    ///
    /// Returns `None` after reporting `FailAlreadyConnected`.
    fn begin(&self, options: ClientOptions) -> Result<Option<Attempt>> {
        let callback = options.callback.clone().ok_or(Error::MissingCallback)?;

        let (attempt, host_name) = {
            let mut state = self.lock();
            if state.connection != ConnectionState::Disconnected {
                drop(state);
                debug!("Client already connected");
                let client = self.clone();
                tokio::spawn(async move {
                    callback.on_connected(&client, ConnectStatus::FailAlreadyConnected);
                });
                return Ok(None);
            }

            let host_name = if options.host_name.is_empty() {
                DEFAULT_HOSTNAME.to_string()
            } else {
                options.host_name
            };

            state.connection = ConnectionState::Connecting;
            state.attempt += 1;
            state.callback = Some(callback.clone());
            state.host_name = host_name.clone();
            state.port = options.port;
            state.no_delay = options.no_delay;
            state.connect_timeout = options.connect_timeout;
            (state.attempt, host_name)
        };

        Ok(Some(Attempt {
            client: self.clone(),
            id: attempt,
            host_name,
            port: options.port,
            no_delay: options.no_delay,
            connect_timeout: options.connect_timeout,
            callback,
        }))
    }

    /// Close the connection, or cancel a pending connect
    pub fn disconnect(&self) {
        let engine = {
            let mut state = self.lock();
            state.connection = ConnectionState::Disconnected;
            state.engine.take()
        };
        if let Some(engine) = engine {
            engine.disconnect();
        }
    }

    /// Send a packet; the outcome is reported through `on_sent`
    pub fn send(&self, packet: Packet) {
        let (engine, callback) = {
            let state = self.lock();
            (state.engine.clone(), state.callback.clone())
        };
        match engine {
            Some(engine) => engine.send(packet),
            None => {
                let Some(callback) = callback else {
                    return;
                };
                let client = self.clone();
                tokio::spawn(async move {
                    callback.on_sent(&client, SendStatus::FailNotConnected, packet);
                });
            }
        }
    }

    /// Send a copy of `data`
    pub fn send_bytes(&self, data: &[u8]) {
        self.send(Packet::from_slice(data));
    }

    pub fn is_connection_alive(&self) -> bool {
        self.lock()
            .engine
            .as_ref()
            .is_some_and(Engine::is_connected)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.lock().connection
    }

    pub fn host_name(&self) -> String {
        self.lock().host_name.clone()
    }

    pub fn port(&self) -> u16 {
        self.lock().port
    }

    pub fn no_delay(&self) -> bool {
        self.lock().no_delay
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.lock().connect_timeout
    }

    /// Id of the current connection
    pub fn id(&self) -> Option<ConnectionId> {
        self.lock().engine.as_ref().map(Engine::id)
    }

    /// Endpoint of the current connection
    pub fn ip_info(&self) -> Option<IpInfo> {
        self.lock().engine.as_ref().and_then(|e| e.ip_info().cloned())
    }

    fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

/// One connect attempt, run on its own task
struct Attempt {
    client: Client,
    id: u64,
    host_name: String,
    port: u16,
    no_delay: bool,
    connect_timeout: Option<Duration>,
    callback: Arc<dyn ClientCallback>,
}

impl Attempt {
    async fn run<F>(self, connect: F)
    where
        F: Future<Output = io::Result<TcpStream>>,
    {
        info!(host = %self.host_name, port = self.port, "Connecting to server");

        let result = match self.connect_timeout {
            Some(limit) => match tokio::time::timeout(limit, connect).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(host = %self.host_name, port = self.port, "Connect timed out");
                    self.fail(ConnectStatus::FailTimeOut);
                    return;
                }
            },
            None => connect.await,
        };

        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                warn!(host = %self.host_name, port = self.port, error = %e, "Connect failed");
                self.fail(ConnectStatus::FailSocketError);
                return;
            }
        };

        if self.no_delay {
            if let Err(e) = stream.set_nodelay(true) {
                debug!(error = %e, "Failed to set TCP_NODELAY");
            }
        }

        let (engine, events) = Engine::new(stream);
        {
            let mut state = self.client.lock();
            if state.attempt != self.id || state.connection != ConnectionState::Connecting {
                drop(state);
                debug!("Connect cancelled");
                engine.abandon();
                self.callback
                    .on_connected(&self.client, ConnectStatus::FailSocketError);
                return;
            }
            state.connection = ConnectionState::Connected;
            state.engine = Some(engine.clone());
            // Started under the lock so a racing disconnect finds a live engine
            engine.start();
        }

        info!(connection_id = %engine.id(), "Connected to server");
        let callback = self.callback;
        let engine_id = engine.id();
        spawn_dispatcher(self.client.shared, events, move |shared, event| {
            let client = Client { shared };
            match event {
                EngineEvent::Connected => callback.on_connected(&client, ConnectStatus::Success),
                EngineEvent::Received(packet) => callback.on_received(&client, packet),
                EngineEvent::Sent(status, packet) => callback.on_sent(&client, status, packet),
                EngineEvent::Disconnected => {
                    {
                        let mut state = client.lock();
                        if state.engine.as_ref().is_some_and(|e| e.id() == engine_id) {
                            state.engine = None;
                            state.connection = ConnectionState::Disconnected;
                        }
                    }
                    info!(connection_id = %engine_id, "Disconnected from server");
                    callback.on_disconnect(&client);
                }
            }
        });
    }

    /// Reset the client if this attempt still owns it, then report `status`
    fn fail(self, status: ConnectStatus) {
        {
            let mut state = self.client.lock();
            if state.attempt == self.id && state.connection == ConnectionState::Connecting {
                state.connection = ConnectionState::Disconnected;
            }
        }
        self.callback.on_connected(&self.client, status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio::time::{sleep, timeout};

    use crate::callback::{ServerCallback, SocketCallback};
    use crate::server::{Server, ServerOptions};
    use crate::socket::Connection;
    use framelink_core::StartStatus;

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Debug, PartialEq, Eq)]
    enum Event {
        Connected(ConnectStatus),
        Received(Vec<u8>),
        Sent(SendStatus),
        Disconnected,
    }

    struct Recorder(mpsc::UnboundedSender<Event>);

    impl ClientCallback for Recorder {
        fn on_connected(&self, _client: &Client, status: ConnectStatus) {
            let _ = self.0.send(Event::Connected(status));
        }

        fn on_received(&self, _client: &Client, packet: Packet) {
            let _ = self.0.send(Event::Received(packet.to_vec()));
        }

        fn on_sent(&self, _client: &Client, status: SendStatus, _packet: Packet) {
            let _ = self.0.send(Event::Sent(status));
        }

        fn on_disconnect(&self, _client: &Client) {
            let _ = self.0.send(Event::Disconnected);
        }
    }

    fn recorder() -> (Arc<Recorder>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Recorder(tx)), rx)
    }

    async fn next(events: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        timeout(WAIT, events.recv()).await.unwrap().unwrap()
    }

    struct Pong;

    impl SocketCallback for Pong {
        fn on_received(&self, socket: &Connection, packet: Packet) {
            if packet.as_slice() == b"ping" {
                socket.send_bytes(b"pong");
            }
        }
    }

    struct Accepting(mpsc::UnboundedSender<StartStatus>);

    impl ServerCallback for Accepting {
        fn on_server_started(&self, _server: &Server, status: StartStatus) {
            let _ = self.0.send(status);
        }

        fn on_accept(&self, _server: &Server, _ip_info: &IpInfo) -> Option<Arc<dyn SocketCallback>> {
            Some(Arc::new(Pong))
        }
    }

    async fn pong_server() -> Server {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let server = Server::new();
        server
            .start(
                ServerOptions::default()
                    .with_port(0)
                    .with_callback(Arc::new(Accepting(tx))),
            )
            .unwrap();
        assert_eq!(
            timeout(WAIT, rx.recv()).await.unwrap(),
            Some(StartStatus::Success)
        );
        server
    }

    fn options(port: u16, callback: Arc<Recorder>) -> ClientOptions {
        ClientOptions::default()
            .with_host("127.0.0.1")
            .with_port(port)
            .with_callback(callback)
    }

    #[tokio::test]
    async fn test_connect_requires_callback() {
        let client = Client::new();
        let result = client.connect(ClientOptions::default());
        assert!(matches!(result, Err(Error::MissingCallback)));
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_client_ping_pong() {
        let server = pong_server().await;
        let (callback, mut events) = recorder();
        let client = Client::new();

        client.connect(options(server.port(), callback)).unwrap();
        assert_eq!(next(&mut events).await, Event::Connected(ConnectStatus::Success));
        assert!(client.is_connection_alive());
        assert_eq!(client.connection_state(), ConnectionState::Connected);

        client.send_bytes(b"ping");
        let outcome = [next(&mut events).await, next(&mut events).await];
        assert!(outcome.contains(&Event::Sent(SendStatus::Success)));
        assert!(outcome.contains(&Event::Received(b"pong".to_vec())));

        client.disconnect();
        assert_eq!(next(&mut events).await, Event::Disconnected);
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        assert!(!client.is_connection_alive());
        server.stop();
    }

    #[tokio::test]
    async fn test_connect_twice_reports_already_connected() {
        let server = pong_server().await;
        let (callback, mut events) = recorder();
        let client = Client::new();

        client.connect(options(server.port(), callback.clone())).unwrap();
        assert_eq!(next(&mut events).await, Event::Connected(ConnectStatus::Success));

        client.connect(options(server.port(), callback)).unwrap();
        assert_eq!(
            next(&mut events).await,
            Event::Connected(ConnectStatus::FailAlreadyConnected)
        );
        assert!(client.is_connection_alive());
        client.disconnect();
        server.stop();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let (callback, mut events) = recorder();
        let client = Client::new();

        client.connect(options(port, callback)).unwrap();
        assert_eq!(
            next(&mut events).await,
            Event::Connected(ConnectStatus::FailSocketError)
        );
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_while_disconnected() {
        let server = pong_server().await;
        let (callback, mut events) = recorder();
        let client = Client::new();

        client.connect(options(server.port(), callback)).unwrap();
        assert_eq!(next(&mut events).await, Event::Connected(ConnectStatus::Success));
        client.disconnect();
        assert_eq!(next(&mut events).await, Event::Disconnected);

        client.send_bytes(b"late");
        assert_eq!(
            next(&mut events).await,
            Event::Sent(SendStatus::FailNotConnected)
        );
        server.stop();
    }

    #[tokio::test]
    async fn test_server_stop_disconnects_client() {
        let server = pong_server().await;
        let (callback, mut events) = recorder();
        let client = Client::new();

        client.connect(options(server.port(), callback)).unwrap();
        assert_eq!(next(&mut events).await, Event::Connected(ConnectStatus::Success));

        server.stop();
        assert_eq!(next(&mut events).await, Event::Disconnected);
        assert!(timeout(Duration::from_millis(100), events.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_connect_times_out() {
        let (callback, mut events) = recorder();
        let client = Client::new();
        let attempt = client
            .begin(options(9, callback).with_connect_timeout(Some(Duration::from_millis(50))))
            .unwrap()
            .unwrap();
        assert_eq!(client.connection_state(), ConnectionState::Connecting);

        // A connect that never completes
        attempt
            .run(std::future::pending::<io::Result<TcpStream>>())
            .await;
        assert_eq!(
            next(&mut events).await,
            Event::Connected(ConnectStatus::FailTimeOut)
        );
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        assert!(!client.is_connection_alive());
        assert!(timeout(Duration::from_millis(100), events.recv())
            .await
            .is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_disconnect_right_after_connect() {
        let server = pong_server().await;

        for _ in 0..20 {
            let (callback, mut events) = recorder();
            let client = Client::new();
            client.connect(options(server.port(), callback)).unwrap();

            // Disconnect from another thread the moment the state flips
            let racer = client.clone();
            tokio::task::spawn_blocking(move || {
                while racer.connection_state() == ConnectionState::Connecting {
                    std::hint::spin_loop();
                }
                racer.disconnect();
            })
            .await
            .unwrap();

            assert_eq!(next(&mut events).await, Event::Connected(ConnectStatus::Success));
            assert_eq!(next(&mut events).await, Event::Disconnected);
            assert_eq!(client.connection_state(), ConnectionState::Disconnected);
            assert!(!client.is_connection_alive());
        }

        timeout(WAIT, async {
            while server.connection_count() > 0 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        server.stop();
    }

    #[test]
    fn test_options_from_config() {
        let config = ClientConfig {
            host: "example.org".to_string(),
            port: 9000,
            no_delay: false,
            connect_timeout_ms: Some(250),
        };
        let options = ClientOptions::from_config(&config, None);
        assert_eq!(options.host_name, "example.org");
        assert_eq!(options.port, 9000);
        assert!(!options.no_delay);
        assert_eq!(options.connect_timeout, Some(Duration::from_millis(250)));
    }
}
