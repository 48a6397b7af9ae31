//! Sample chat client
//!
//! Reads commands from stdin and prints whatever the server sends:
//!
//! - `/join <room>` and `/leave <room>`
//! - `/room <room> <text>` says something to one room
//! - `/pair` asks for a private partner
//! - `/quit` disconnects
//! - anything else is said to everyone

use std::sync::Arc;

use framelink_core::{ClientConfig, ConnectStatus, SendStatus};
use framelink_net::{Client, ClientCallback, ClientOptions, Packet};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::protocol::{ChatEvent, ChatRequest};

/// What the connection reports to the input loop
#[derive(Debug)]
enum Update {
    Connected(ConnectStatus),
    Received(Packet),
    Disconnected,
}

struct ChatPeer {
    updates: mpsc::UnboundedSender<Update>,
}

impl ClientCallback for ChatPeer {
    fn on_connected(&self, _client: &Client, status: ConnectStatus) {
        let _ = self.updates.send(Update::Connected(status));
    }

    fn on_received(&self, _client: &Client, packet: Packet) {
        let _ = self.updates.send(Update::Received(packet));
    }

    fn on_sent(&self, _client: &Client, status: SendStatus, packet: Packet) {
        if !status.is_success() {
            warn!(status = %status, len = packet.len(), "Send failed");
        }
    }

    fn on_disconnect(&self, _client: &Client) {
        let _ = self.updates.send(Update::Disconnected);
    }
}

/// A parsed input line
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Send(ChatRequest),
    Quit,
}

fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let Some(rest) = line.strip_prefix('/') else {
        return Some(Command::Send(ChatRequest::Say {
            room: None,
            text: line.to_string(),
        }));
    };

    let (verb, args) = rest.split_once(' ').unwrap_or((rest, ""));
    let args = args.trim();
    let request = match verb {
        "quit" => return Some(Command::Quit),
        "pair" => ChatRequest::Pair,
        "join" if !args.is_empty() => ChatRequest::Join {
            room: args.to_string(),
        },
        "leave" if !args.is_empty() => ChatRequest::Leave {
            room: args.to_string(),
        },
        "room" => {
            let (room, text) = args.split_once(' ')?;
            let text = text.trim();
            if text.is_empty() {
                return None;
            }
            ChatRequest::Say {
                room: Some(room.to_string()),
                text: text.to_string(),
            }
        }
        _ => return None,
    };
    Some(Command::Send(request))
}

fn render(packet: &Packet) -> String {
    if let Ok(event) = ChatEvent::from_bytes(packet.as_slice()) {
        return match event {
            ChatEvent::Message {
                from,
                room: Some(room),
                text,
                timestamp,
            } => format!("[{}] #{room} {from}: {text}", timestamp.format("%H:%M:%S")),
            ChatEvent::Message {
                from,
                room: None,
                text,
                timestamp,
            } => format!("[{}] {from}: {text}", timestamp.format("%H:%M:%S")),
            ChatEvent::Notice { text, timestamp } => {
                format!("[{}] {text}", timestamp.format("%H:%M:%S"))
            }
            ChatEvent::Joined { room, members } => {
                format!("joined #{room} ({members} members)")
            }
            ChatEvent::Left { room } => format!("left #{room}"),
            ChatEvent::Waiting => "waiting for a partner...".to_string(),
            ChatEvent::Paired { peer } => format!("paired with {peer}"),
        };
    }

    // Paired partners relay their requests unchanged
    match ChatRequest::from_bytes(packet.as_slice()) {
        Ok(ChatRequest::Say { text, .. }) => format!("partner: {text}"),
        _ => format!("<{} bytes>", packet.len()),
    }
}

/// Connect and run the interactive loop until `/quit`, EOF or Ctrl-C
pub async fn run(config: &ClientConfig) -> Result<()> {
    let (updates_tx, mut updates) = mpsc::unbounded_channel();
    let client = Client::new();
    let options = ClientOptions::from_config(config, None).with_callback(Arc::new(ChatPeer {
        updates: updates_tx,
    }));
    client.connect(options)?;

    match updates.recv().await {
        Some(Update::Connected(ConnectStatus::Success)) => {
            info!(host = %client.host_name(), port = client.port(), "Connected");
        }
        Some(Update::Connected(status)) => return Err(Error::ConnectFailed(status)),
        _ => return Err(Error::Closed),
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match parse_command(&line) {
                    Some(Command::Send(request)) => match request.to_bytes() {
                        Ok(bytes) => client.send(Packet::from(bytes)),
                        Err(e) => warn!(error = %e, "Failed to encode request"),
                    },
                    Some(Command::Quit) => break,
                    None => println!("?? unknown command"),
                }
            }
            update = updates.recv() => match update {
                Some(Update::Received(packet)) => println!("{}", render(&packet)),
                Some(Update::Connected(status)) => debug!(status = %status, "Ignoring connect report"),
                Some(Update::Disconnected) | None => {
                    info!("Server closed the connection");
                    return Ok(());
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.disconnect();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn say(room: Option<&str>, text: &str) -> Option<Command> {
        Some(Command::Send(ChatRequest::Say {
            room: room.map(str::to_string),
            text: text.to_string(),
        }))
    }

    #[test]
    fn test_plain_text_is_said() {
        assert_eq!(parse_command("  hello there "), say(None, "hello there"));
        assert_eq!(parse_command("   "), None);
    }

    #[test]
    fn test_commands() {
        assert_eq!(
            parse_command("/join games"),
            Some(Command::Send(ChatRequest::Join {
                room: "games".to_string()
            }))
        );
        assert_eq!(
            parse_command("/leave games"),
            Some(Command::Send(ChatRequest::Leave {
                room: "games".to_string()
            }))
        );
        assert_eq!(parse_command("/pair"), Some(Command::Send(ChatRequest::Pair)));
        assert_eq!(parse_command("/quit"), Some(Command::Quit));
        assert_eq!(parse_command("/room games gg wp"), say(Some("games"), "gg wp"));
    }

    #[test]
    fn test_malformed_commands() {
        assert_eq!(parse_command("/join"), None);
        assert_eq!(parse_command("/room games"), None);
        assert_eq!(parse_command("/dance"), None);
    }

    #[test]
    fn test_render() {
        let joined = ChatEvent::Joined {
            room: "games".to_string(),
            members: 3,
        };
        let packet = Packet::from(joined.to_bytes().unwrap());
        assert_eq!(render(&packet), "joined #games (3 members)");

        let relayed = ChatRequest::Say {
            room: None,
            text: "psst".to_string(),
        };
        let packet = Packet::from(relayed.to_bytes().unwrap());
        assert_eq!(render(&packet), "partner: psst");

        assert_eq!(render(&Packet::from_slice(b"\x01\x02")), "<2 bytes>");
    }
}
