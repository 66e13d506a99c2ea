use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::connection::{Connection, ConnectionId};

/// The set of currently joined connections.
///
/// Only `add`, `remove`, and `snapshot` mutate or traverse membership. Each is
/// a single critical section, so they are linearizable with respect to each
/// other and a snapshot never observes a half-applied change.
#[derive(Debug, Default)]
pub struct Registry {
    members: Mutex<HashMap<ConnectionId, Connection>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `connection`. Returns `false` and leaves the set untouched if its
    /// id is already present.
    pub async fn add(&self, connection: Connection) -> bool {
        let mut members = self.members.lock().await;
        if members.contains_key(&connection.id()) {
            return false;
        }
        members.insert(connection.id(), connection);
        true
    }

    /// Removes the member with `id`, if any. Removing an absent id is a no-op.
    pub async fn remove(&self, id: ConnectionId) -> Option<Connection> {
        self.members.lock().await.remove(&id)
    }

    /// Copies out the current membership. The lock is released before this
    /// returns, so callers can deliver without blocking joins or leaves.
    pub async fn snapshot(&self) -> Vec<Connection> {
        self.members.lock().await.values().cloned().collect()
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.members.lock().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.members.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
