//! Relay that joins two server connections into one pipe
//!
//! While paired, the relay is the socket callback of both connections and
//! forwards every received payload to the other side unchanged. A
//! disconnect on either side tears the pairing down.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, info};

use crate::callback::{P2pCallback, SocketCallback};
use crate::error::{Error, Result};
use crate::packet::Packet;
use crate::socket::Connection;

#[derive(Default)]
struct PairState {
    pair: Option<(Connection, Connection)>,
    callback: Option<Arc<dyn P2pCallback>>,
}

/// Point-to-point relay between two connections
pub struct P2p {
    me: Weak<P2p>,
    state: Mutex<PairState>,
}

impl P2p {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            state: Mutex::new(PairState::default()),
        })
    }

    pub fn is_paired(&self) -> bool {
        self.lock().pair.is_some()
    }

    /// The paired connections, if any
    pub fn peers(&self) -> Option<(Connection, Connection)> {
        self.lock().pair.clone()
    }

    /// Pair `first` with `second`
    ///
    /// Replaces the socket callbacks of both connections. Fails if a pairing
    /// is already active or either side is not connected.
    pub fn pair(
        &self,
        first: &Connection,
        second: &Connection,
        callback: Option<Arc<dyn P2pCallback>>,
    ) -> Result<()> {
        let Some(me) = self.me.upgrade() else {
            return Err(Error::NotConnected);
        };

        {
            let mut state = self.lock();
            if state.pair.is_some() {
                return Err(Error::AlreadyPaired);
            }
            if !first.is_connection_alive() || !second.is_connection_alive() {
                return Err(Error::NotConnected);
            }
            state.pair = Some((first.clone(), second.clone()));
            state.callback = callback;
        }

        let relay: Arc<dyn SocketCallback> = me;
        first.set_callback(Some(relay.clone()));
        second.set_callback(Some(relay));
        info!(first = %first.id(), second = %second.id(), "Connections paired");

        // A side that closed before its callback was swapped never reaches us
        if !first.is_connection_alive() || !second.is_connection_alive() {
            self.detach();
        }
        Ok(())
    }

    /// Tear the pairing down
    ///
    /// Clears both connections' callbacks and notifies the pairing callback
    /// on a worker task. Does nothing when not paired.
    pub fn detach(&self) {
        let (pair, callback) = {
            let mut state = self.lock();
            (state.pair.take(), state.callback.take())
        };
        let Some((first, second)) = pair else {
            return;
        };

        first.set_callback(None);
        second.set_callback(None);
        debug!(first = %first.id(), second = %second.id(), "Pairing detached");

        if let (Some(callback), Some(me)) = (callback, self.me.upgrade()) {
            tokio::spawn(async move {
                callback.on_detached(&me, &first, &second);
            });
        }
    }

    /// The other side of `socket`'s pairing
    fn partner(&self, socket: &Connection) -> Option<Connection> {
        let state = self.lock();
        let (first, second) = state.pair.as_ref()?;
        if first == socket {
            Some(second.clone())
        } else if second == socket {
            Some(first.clone())
        } else {
            None
        }
    }

    fn lock(&self) -> MutexGuard<'_, PairState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SocketCallback for P2p {
    fn on_received(&self, socket: &Connection, packet: Packet) {
        if let Some(partner) = self.partner(socket) {
            partner.send(packet);
        }
    }

    fn on_disconnect(&self, socket: &Connection) {
        if self.partner(socket).is_some() {
            self.detach();
        }
    }
}
