//! Connection registry: one live connection per station.
//!
//! Shared by the accept loop, the per-connection dispatchers and the
//! remote-control API, so every access goes through one lock. Senders are
//! cloned out of the lock before any await.

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use uuid::Uuid;

use solcharge_core::{CoreError, StationId};

use crate::messages::Call;

/// What a connection task can be asked to do from outside
#[derive(Debug)]
pub enum Outbound {
    /// Send a request and track it as pending
    Call(Call),
    /// Close the WebSocket and end the task
    Close,
}

/// Send-capable handle to one station connection
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub station: StationId,
    pub conn_id: Uuid,
    tx: mpsc::Sender<Outbound>,
}

impl ConnectionHandle {
    pub fn new(station: StationId, tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            station,
            conn_id: Uuid::new_v4(),
            tx,
        }
    }

    pub fn sender(&self) -> mpsc::Sender<Outbound> {
        self.tx.clone()
    }

    /// Ask the connection task to shut down. Best effort: a task that is
    /// already gone has a closed channel, which is fine.
    pub fn close(&self) {
        let _ = self.tx.try_send(Outbound::Close);
    }
}

/// Station id -> live connection. At most one connection per station:
/// registering over an existing id closes the old connection first.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<HashMap<StationId, ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, displacing (and closing) any previous one for
    /// the same station. Returns the displaced handle for logging.
    pub fn register(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let displaced = self
            .inner
            .write()
            .insert(handle.station.clone(), handle);
        if let Some(ref old) = displaced {
            old.close();
        }
        displaced
    }

    /// Remove a connection, but only if it is still the registered one.
    /// A displaced connection's cleanup must not evict its successor.
    pub fn remove(&self, station: &str, conn_id: Uuid) -> bool {
        let mut inner = self.inner.write();
        match inner.get(station) {
            Some(handle) if handle.conn_id == conn_id => {
                inner.remove(station);
                true
            }
            _ => false,
        }
    }

    /// Clone the sender for a station, or report it unreachable
    pub fn sender(&self, station: &str) -> Result<mpsc::Sender<Outbound>, CoreError> {
        self.inner
            .read()
            .get(station)
            .map(ConnectionHandle::sender)
            .ok_or_else(|| CoreError::DeviceNotConnected(station.to_string()))
    }

    pub fn is_connected(&self, station: &str) -> bool {
        self.inner.read().contains_key(station)
    }

    pub fn connected_stations(&self) -> Vec<StationId> {
        self.inner.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Ask every connection to close (graceful shutdown path)
    pub fn close_all(&self) {
        for handle in self.inner.read().values() {
            handle.close();
        }
    }
}
