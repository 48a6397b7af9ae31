//! Connection engine shared by clients and accepted sockets
//!
//! The engine owns one TCP stream and runs two state machines on it:
//!
//! - **receive**: a task reading frames with [`FrameReader`] and handing each
//!   payload to the owner's dispatcher
//! - **send**: single-flight. Whoever takes the write half writes a frame;
//!   everyone else queues behind it. The writer task drains the queue in FIFO
//!   order and puts the write half back when the queue is empty.
//!
//! Events go through an unbounded channel to a dispatcher task, so callbacks
//! never run on the I/O path and may call straight back into the engine.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use framelink_core::{IpInfo, SendStatus};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::Error;
use crate::frame::{encode_header, write_frame, FrameReader, HEADER_LEN};
use crate::packet::Packet;

/// Unique identity of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }

    #[cfg(test)]
    pub(crate) fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Event produced by the engine for its owner
#[derive(Debug)]
pub(crate) enum EngineEvent {
    Connected,
    Received(Packet),
    Sent(SendStatus, Packet),
    Disconnected,
}

/// A frame waiting for the write half
struct Outbound {
    header: [u8; HEADER_LEN],
    packet: Packet,
}

struct EngineState {
    connected: bool,
    /// Present until the receive task starts
    reader: Option<OwnedReadHalf>,
    /// Absent while a frame is in flight
    writer: Option<OwnedWriteHalf>,
    send_queue: VecDeque<Outbound>,
}

struct EngineInner {
    id: ConnectionId,
    ip_info: Option<IpInfo>,
    state: Mutex<EngineState>,
    events: mpsc::UnboundedSender<EngineEvent>,
    closed: watch::Sender<bool>,
}

/// Handle to a connection engine
#[derive(Clone)]
pub(crate) struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Wrap a connected stream; nothing is read until [`Engine::start`]
    pub fn new(stream: TcpStream) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let ip_info = IpInfo::resolve(stream.peer_addr().ok(), stream.local_addr().ok());
        let (reader, writer) = stream.into_split();
        let (events, events_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);

        let inner = EngineInner {
            id: ConnectionId::new(),
            ip_info,
            state: Mutex::new(EngineState {
                connected: false,
                reader: Some(reader),
                writer: Some(writer),
                send_queue: VecDeque::new(),
            }),
            events,
            closed,
        };

        (
            Self {
                inner: Arc::new(inner),
            },
            events_rx,
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn ip_info(&self) -> Option<&IpInfo> {
        self.inner.ip_info.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }

    /// Mark connected and start the receive loop
    ///
    /// Emits [`EngineEvent::Connected`] ahead of any received frame. Returns
    /// `false` if the engine was already started or abandoned.
    pub fn start(&self) -> bool {
        let reader = {
            let mut state = self.inner.lock();
            let Some(reader) = state.reader.take() else {
                return false;
            };
            state.connected = true;
            reader
        };

        self.inner.emit(EngineEvent::Connected);
        tokio::spawn(receive_loop(self.inner.clone(), reader));
        true
    }

    /// Drop the stream of an engine that was never started
    pub fn abandon(&self) {
        {
            let mut state = self.inner.lock();
            if state.connected {
                return;
            }
            state.reader = None;
            state.writer = None;
        }
        self.inner.closed.send_replace(true);
    }

    /// Queue `packet` for sending; the outcome arrives as [`EngineEvent::Sent`]
    pub fn send(&self, packet: Packet) {
        let mut state = self.inner.lock();
        if !state.connected {
            drop(state);
            self.inner
                .emit(EngineEvent::Sent(SendStatus::FailNotConnected, packet));
            return;
        }

        let header = i32::try_from(packet.len())
            .ok()
            .filter(|len| *len > 0)
            .and_then(encode_header);
        let Some(header) = header else {
            drop(state);
            self.inner
                .emit(EngineEvent::Sent(SendStatus::FailInvalidPacket, packet));
            return;
        };

        let frame = Outbound { header, packet };
        match state.writer.take() {
            Some(writer) => {
                drop(state);
                tokio::spawn(write_loop(self.inner.clone(), writer, frame));
            }
            None => state.send_queue.push_back(frame),
        }
    }

    /// Tear the connection down; only the first call has any effect
    pub fn disconnect(&self) -> bool {
        self.inner.disconnect()
    }
}

impl EngineInner {
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: EngineEvent) {
        if self.events.send(event).is_err() {
            trace!(connection_id = %self.id, "No dispatcher for engine event");
        }
    }

    fn disconnect(&self) -> bool {
        {
            let mut state = self.lock();
            if !state.connected {
                return false;
            }
            state.connected = false;
            state.send_queue.clear();
            state.writer = None;
            state.reader = None;
        }
        self.closed.send_replace(true);
        debug!(connection_id = %self.id, "Connection closed");
        self.emit(EngineEvent::Disconnected);
        true
    }
}

/// Resolves once the watched flag turns true
pub(crate) async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

async fn receive_loop(inner: Arc<EngineInner>, reader: OwnedReadHalf) {
    let mut closed = inner.closed.subscribe();
    let mut frames = FrameReader::new(reader);

    loop {
        let result = tokio::select! {
            result = frames.read_frame() => result,
            _ = wait_closed(&mut closed) => return,
        };
        match result {
            Ok(packet) => {
                trace!(connection_id = %inner.id, len = packet.len(), "Frame received");
                inner.emit(EngineEvent::Received(packet));
            }
            Err(Error::ConnectionClosed) => {
                debug!(connection_id = %inner.id, "Peer closed connection");
                break;
            }
            Err(e) => {
                warn!(connection_id = %inner.id, error = %e, "Read error");
                break;
            }
        }
    }

    inner.disconnect();
}

async fn write_loop(inner: Arc<EngineInner>, mut writer: OwnedWriteHalf, mut frame: Outbound) {
    let mut closed = inner.closed.subscribe();

    loop {
        let result = tokio::select! {
            result = write_frame(&mut writer, &frame.header, frame.packet.as_slice()) => result,
            _ = wait_closed(&mut closed) => Err(Error::NotConnected),
        };

        match result {
            Ok(()) => {
                let Outbound { packet, .. } = frame;
                trace!(connection_id = %inner.id, len = packet.len(), "Frame sent");
                inner.emit(EngineEvent::Sent(SendStatus::Success, packet));

                let mut state = inner.lock();
                match state.send_queue.pop_front() {
                    Some(next) => frame = next,
                    None => {
                        if state.connected {
                            state.writer = Some(writer);
                        }
                        return;
                    }
                }
            }
            Err(e) => {
                let status = match &e {
                    Error::ConnectionClosed => SendStatus::FailConnectionClosing,
                    _ => SendStatus::FailSocketError,
                };
                debug!(connection_id = %inner.id, error = %e, "Write failed");
                inner.emit(EngineEvent::Sent(status, frame.packet));
                inner.disconnect();
                return;
            }
        }
    }
}

/// Deliver engine events to `owner` on a dedicated task, in order
///
/// The task keeps `owner` alive until the disconnect has been delivered and
/// holds only a weak reference afterwards, so late send failures still reach
/// a live owner without keeping a dropped one around.
pub(crate) fn spawn_dispatcher<T, F>(
    owner: Arc<T>,
    mut events: mpsc::UnboundedReceiver<EngineEvent>,
    dispatch: F,
) where
    T: Send + Sync + 'static,
    F: Fn(Arc<T>, EngineEvent) + Send + 'static,
{
    tokio::spawn(async move {
        let weak = Arc::downgrade(&owner);
        let mut strong = Some(owner);

        while let Some(event) = events.recv().await {
            let last = matches!(event, EngineEvent::Disconnected);
            let owner = match &strong {
                Some(owner) => owner.clone(),
                None => match weak.upgrade() {
                    Some(owner) => owner,
                    None => break,
                },
            };
            dispatch(owner, event);
            if last {
                strong = None;
            }
        }
    });
}
