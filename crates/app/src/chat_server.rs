//! Sample chat server
//!
//! Relays chat lines between connected clients. Plain messages go to every
//! other client, room messages to the other members of the room, and two
//! clients that ask to pair get a private relay until one of them leaves.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use framelink_core::{IpInfo, SendStatus, ServerConfig, StartStatus};
use framelink_net::{
    Connection, P2p, P2pCallback, Packet, Room, RoomCallback, Server, ServerCallback,
    ServerOptions, SocketCallback,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::protocol::{ChatEvent, ChatRequest};

/// Callbacks of the chat server
pub struct ChatService {
    me: Weak<ChatService>,
    /// Connection waiting for a pairing partner
    lobby: Mutex<Option<Connection>>,
    started: mpsc::UnboundedSender<StartStatus>,
}

impl ChatService {
    pub fn new(started: mpsc::UnboundedSender<StartStatus>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            lobby: Mutex::new(None),
            started,
        })
    }

    fn socket_callback(&self) -> Option<Arc<dyn SocketCallback>> {
        self.me
            .upgrade()
            .map(|me| me as Arc<dyn SocketCallback>)
    }

    fn handle(&self, socket: &Connection, request: ChatRequest) {
        let from = socket.ip_info().to_string();
        match request {
            ChatRequest::Say { room: None, text } => {
                info!(from = %from, "Say");
                send_event_to_others(socket, &ChatEvent::message(from, None, text));
            }
            ChatRequest::Say {
                room: Some(room),
                text,
            } => {
                if !socket.rooms().contains(&room) {
                    send_event(socket, &ChatEvent::notice(format!("Not in room {room}")));
                    return;
                }
                let event = ChatEvent::message(from, Some(room.clone()), text);
                if let Some(packet) = encode(&event) {
                    let delivered = socket.broadcast_to_room(&room, packet);
                    debug!(room = %room, delivered, "Room message");
                }
            }
            ChatRequest::Join { room } => match socket.join(&room) {
                Ok(handle) => send_event(
                    socket,
                    &ChatEvent::Joined {
                        room,
                        members: handle.len(),
                    },
                ),
                Err(e) => warn!(error = %e, "Join failed"),
            },
            ChatRequest::Leave { room } => {
                if socket.leave(&room) {
                    send_event(socket, &ChatEvent::Left { room });
                } else {
                    send_event(socket, &ChatEvent::notice(format!("Not in room {room}")));
                }
            }
            ChatRequest::Pair => self.pair(socket),
        }
    }

    fn pair(&self, socket: &Connection) {
        let partner = {
            let mut lobby = self.lobby.lock().unwrap_or_else(PoisonError::into_inner);
            match lobby.take() {
                Some(waiting) if waiting != *socket && waiting.is_connection_alive() => {
                    Some(waiting)
                }
                _ => {
                    *lobby = Some(socket.clone());
                    None
                }
            }
        };

        let Some(partner) = partner else {
            send_event(socket, &ChatEvent::Waiting);
            return;
        };

        let detached: Option<Arc<dyn P2pCallback>> =
            self.me.upgrade().map(|me| me as Arc<dyn P2pCallback>);
        match P2p::new().pair(&partner, socket, detached) {
            Ok(()) => {
                send_event(
                    &partner,
                    &ChatEvent::Paired {
                        peer: socket.ip_info().to_string(),
                    },
                );
                send_event(
                    socket,
                    &ChatEvent::Paired {
                        peer: partner.ip_info().to_string(),
                    },
                );
            }
            Err(e) => {
                warn!(error = %e, "Pairing failed");
                send_event(socket, &ChatEvent::notice("Pairing failed, try again"));
            }
        }
    }
}

impl ServerCallback for ChatService {
    fn on_server_started(&self, server: &Server, status: StartStatus) {
        match status {
            StartStatus::Success => info!(port = server.port(), "Chat server started"),
            status => error!(status = %status, "Chat server failed to start"),
        }
        let _ = self.started.send(status);
    }

    fn on_accept(&self, _server: &Server, ip_info: &IpInfo) -> Option<Arc<dyn SocketCallback>> {
        debug!(peer = %ip_info, "Accepting");
        self.socket_callback()
    }

    fn on_server_stopped(&self, _server: &Server) {
        info!("Chat server stopped");
    }
}

impl SocketCallback for ChatService {
    fn on_new_connection(&self, socket: &Connection) {
        let text = format!("** New user({}) connected!", socket.ip_info().address());
        info!("{}", text);
        send_event_to_others(socket, &ChatEvent::notice(text));
    }

    fn on_received(&self, socket: &Connection, packet: Packet) {
        match ChatRequest::from_bytes(packet.as_slice()) {
            Ok(request) => self.handle(socket, request),
            Err(e) => {
                warn!(peer = %socket.ip_info(), error = %e, "Invalid request");
                send_event(socket, &ChatEvent::notice("Invalid request"));
            }
        }
    }

    fn on_sent(&self, socket: &Connection, status: SendStatus, packet: Packet) {
        if !status.is_success() {
            debug!(peer = %socket.ip_info(), status = %status, len = packet.len(), "Send failed");
        }
    }

    fn on_disconnect(&self, socket: &Connection) {
        {
            let mut lobby = self.lobby.lock().unwrap_or_else(PoisonError::into_inner);
            if lobby.as_ref() == Some(socket) {
                *lobby = None;
            }
        }

        let text = format!("** User({}) disconnected!", socket.ip_info().address());
        info!("{}", text);
        if let (Some(server), Some(packet)) = (socket.server(), encode(&ChatEvent::notice(text)))
        {
            server.broadcast(packet);
        }
    }
}

impl P2pCallback for ChatService {
    fn on_detached(&self, _p2p: &P2p, first: &Connection, second: &Connection) {
        for socket in [first, second] {
            if socket.is_connection_alive() {
                socket.set_callback(self.socket_callback());
                send_event(socket, &ChatEvent::notice("Your partner left"));
            }
        }
    }
}

impl RoomCallback for ChatService {
    fn on_created(&self, room: &Room) {
        info!(room = room.name(), "Room created");
    }

    fn on_join(&self, room: &Room, socket: &Connection) {
        debug!(room = room.name(), peer = %socket.ip_info(), "Joined room");
    }

    fn on_leave(&self, room: &Room, socket: &Connection) {
        debug!(room = room.name(), peer = %socket.ip_info(), "Left room");
    }

    fn on_destroy(&self, room: &Room) {
        info!(room = room.name(), "Room destroyed");
    }
}

fn encode(event: &ChatEvent) -> Option<Packet> {
    match event.to_bytes() {
        Ok(bytes) => Some(Packet::from(bytes)),
        Err(e) => {
            error!(error = %e, "Failed to encode event");
            None
        }
    }
}

fn send_event(socket: &Connection, event: &ChatEvent) {
    if let Some(packet) = encode(event) {
        socket.send(packet);
    }
}

fn send_event_to_others(socket: &Connection, event: &ChatEvent) {
    if let Some(packet) = encode(event) {
        socket.broadcast(packet);
    }
}

/// Run the chat server until Ctrl-C
pub async fn run(config: &ServerConfig) -> Result<()> {
    let (started_tx, mut started) = mpsc::unbounded_channel();
    let service = ChatService::new(started_tx);

    let server = Server::new();
    let callback: Arc<dyn ServerCallback> = service.clone();
    let options = ServerOptions::from_config(config, Some(callback)).with_room_callback(service);
    server.start(options)?;

    match started.recv().await {
        Some(StartStatus::Success) => {}
        Some(status) => return Err(Error::StartFailed(status)),
        None => return Err(Error::Closed),
    }

    tokio::signal::ctrl_c().await?;
    info!(connections = server.connection_count(), "Shutting down");
    server.stop();
    Ok(())
}
