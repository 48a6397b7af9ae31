//! Named groups of server connections
//!
//! Membership lives in a [`RoomRegistry`] owned by the server and keyed by
//! connection id. A [`Room`] is only a handle (the name plus a weak server
//! reference), so holding one never keeps connections or the server alive.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};

use crate::engine::ConnectionId;
use crate::packet::Packet;
use crate::server::{Server, ServerShared};
use crate::socket::Connection;

/// Result of adding a member
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Joined {
    /// The room did not exist before this join
    pub created: bool,
    /// The connection was not a member yet
    pub added: bool,
}

/// Result of removing a member
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Left {
    NotMember,
    Left,
    /// The last member left and the room was removed
    Destroyed,
}

/// Room name to member ids
#[derive(Debug, Default)]
pub(crate) struct RoomRegistry {
    rooms: HashMap<String, HashSet<ConnectionId>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `id` to `name`, creating the room on first reference
    pub fn join(&mut self, name: &str, id: ConnectionId) -> Joined {
        let created = !self.rooms.contains_key(name);
        let added = self.rooms.entry(name.to_string()).or_default().insert(id);
        Joined { created, added }
    }

    pub fn leave(&mut self, name: &str, id: ConnectionId) -> Left {
        let Some(members) = self.rooms.get_mut(name) else {
            return Left::NotMember;
        };
        if !members.remove(&id) {
            return Left::NotMember;
        }
        if members.is_empty() {
            self.rooms.remove(name);
            Left::Destroyed
        } else {
            Left::Left
        }
    }

    /// Remove `id` from every room, returning each room it left
    pub fn leave_all(&mut self, id: ConnectionId) -> Vec<(String, Left)> {
        let names = self.rooms_of(id);
        names
            .into_iter()
            .map(|name| {
                let left = self.leave(&name, id);
                (name, left)
            })
            .collect()
    }

    pub fn members(&self, name: &str) -> Vec<ConnectionId> {
        self.rooms
            .get(name)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.rooms.contains_key(name)
    }

    pub fn member_count(&self, name: &str) -> usize {
        self.rooms.get(name).map_or(0, HashSet::len)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rooms.keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of the rooms `id` belongs to, sorted
    pub fn rooms_of(&self, id: ConnectionId) -> Vec<String> {
        let mut names: Vec<String> = self
            .rooms
            .iter()
            .filter(|(_, members)| members.contains(&id))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

/// Handle to a room on a server
#[derive(Clone)]
pub struct Room {
    name: Arc<str>,
    server: Weak<ServerShared>,
}

impl Room {
    pub(crate) fn new(name: &str, server: Weak<ServerShared>) -> Self {
        Self {
            name: Arc::from(name),
            server,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current members; empty once the room is gone
    pub fn members(&self) -> Vec<Connection> {
        self.server()
            .map(|server| server.room_members(&self.name))
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.server()
            .map_or(0, |server| server.room_member_count(&self.name))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send to every member; returns how many sends were issued
    pub fn broadcast(&self, packet: Packet) -> usize {
        self.server()
            .map_or(0, |server| server.broadcast_to_room(&self.name, packet, None))
    }

    /// Send to every member except `excluding`
    pub fn broadcast_except(&self, packet: Packet, excluding: &Connection) -> usize {
        self.server().map_or(0, |server| {
            server.broadcast_to_room(&self.name, packet, Some(excluding))
        })
    }

    fn server(&self) -> Option<Server> {
        self.server.upgrade().map(Server::from_shared)
    }
}

impl PartialEq for Room {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && Weak::ptr_eq(&self.server, &other.server)
    }
}

impl Eq for Room {}

impl fmt::Debug for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Room").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn id() -> ConnectionId {
        ConnectionId::from_uuid(Uuid::new_v4())
    }

    #[test]
    fn test_join_creates_room_once() {
        let mut registry = RoomRegistry::new();
        let (a, b) = (id(), id());

        assert_eq!(
            registry.join("lobby", a),
            Joined {
                created: true,
                added: true
            }
        );
        assert_eq!(
            registry.join("lobby", b),
            Joined {
                created: false,
                added: true
            }
        );
        assert_eq!(
            registry.join("lobby", a),
            Joined {
                created: false,
                added: false
            }
        );
        assert_eq!(registry.member_count("lobby"), 2);
    }

    #[test]
    fn test_last_leave_destroys_room() {
        let mut registry = RoomRegistry::new();
        let (a, b) = (id(), id());
        registry.join("games", a);
        registry.join("games", b);

        assert_eq!(registry.leave("games", a), Left::Left);
        assert!(registry.contains("games"));
        assert_eq!(registry.leave("games", b), Left::Destroyed);
        assert!(!registry.contains("games"));
        assert!(registry.names().is_empty());
    }

    #[test]
    fn test_leave_unknown() {
        let mut registry = RoomRegistry::new();
        let a = id();
        assert_eq!(registry.leave("nowhere", a), Left::NotMember);

        registry.join("here", id());
        assert_eq!(registry.leave("here", a), Left::NotMember);
        assert_eq!(registry.member_count("here"), 1);
    }

    #[test]
    fn test_leave_all() {
        let mut registry = RoomRegistry::new();
        let (a, b) = (id(), id());
        registry.join("one", a);
        registry.join("two", a);
        registry.join("two", b);

        assert_eq!(registry.rooms_of(a), vec!["one", "two"]);

        let mut left = registry.leave_all(a);
        left.sort_by(|x, y| x.0.cmp(&y.0));
        assert_eq!(
            left,
            vec![
                ("one".to_string(), Left::Destroyed),
                ("two".to_string(), Left::Left)
            ]
        );
        assert!(registry.rooms_of(a).is_empty());
        assert_eq!(registry.members("two"), vec![b]);
    }

    #[test]
    fn test_members_of_missing_room() {
        let registry = RoomRegistry::new();
        assert!(registry.members("ghost").is_empty());
        assert_eq!(registry.member_count("ghost"), 0);
    }

    #[test]
    fn test_detached_room_handle() {
        let room = Room::new("orphan", Weak::new());
        assert_eq!(room.name(), "orphan");
        assert!(room.is_empty());
        assert!(room.members().is_empty());
        assert_eq!(room.broadcast(Packet::from_slice(b"x")), 0);
    }
}
