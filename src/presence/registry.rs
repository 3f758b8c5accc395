//! Process-local registry of live connections and their users' statuses.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tracing::debug;

use super::messages::{OnlineStatus, ServerMessage, UserStatus};

pub type ConnectionId = u64;

struct UserEntry {
    status: OnlineStatus,
    connections: HashMap<ConnectionId, mpsc::Sender<ServerMessage>>,
}

/// Owns the presence records of users connected to this process.
#[derive(Default)]
pub struct LocalRegistry {
    users: Mutex<HashMap<i64, UserEntry>>,
    next_id: AtomicU64,
}

impl LocalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<i64, UserEntry>> {
        self.users.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a connection; the user's status becomes `status`.
    pub fn register(
        &self,
        user_id: i64,
        status: OnlineStatus,
        sender: mpsc::Sender<ServerMessage>,
    ) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut users = self.lock();
        let entry = users.entry(user_id).or_insert_with(|| UserEntry {
            status,
            connections: HashMap::new(),
        });
        entry.status = status;
        entry.connections.insert(id, sender);
        id
    }

    /// Remove a connection. Returns true if it was the user's last one here.
    pub fn unregister(&self, user_id: i64, connection: ConnectionId) -> bool {
        let mut users = self.lock();
        let Some(entry) = users.get_mut(&user_id) else {
            return true;
        };
        entry.connections.remove(&connection);
        if entry.connections.is_empty() {
            users.remove(&user_id);
            true
        } else {
            false
        }
    }

    /// Update a connected user's status. Returns false if not connected here.
    pub fn set_status(&self, user_id: i64, status: OnlineStatus) -> bool {
        match self.lock().get_mut(&user_id) {
            Some(entry) => {
                entry.status = status;
                true
            }
            None => false,
        }
    }

    pub fn status_of(&self, user_id: i64) -> Option<OnlineStatus> {
        self.lock().get(&user_id).map(|e| e.status)
    }

    /// Every user with at least one connection here, including those
    /// showing as offline.
    pub fn snapshot(&self) -> Vec<UserStatus> {
        self.lock()
            .iter()
            .map(|(&user_id, entry)| UserStatus {
                user_id,
                status: entry.status,
            })
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.lock().values().map(|e| e.connections.len()).sum()
    }

    /// Send `message` to every local connection of every recipient.
    pub fn deliver(&self, recipients: &[i64], message: &ServerMessage) {
        let users = self.lock();
        for user_id in recipients {
            if let Some(entry) = users.get(user_id) {
                for sender in entry.connections.values() {
                    if sender.try_send(message.clone()).is_err() {
                        debug!(user_id, "Dropping presence message for a slow or closed connection");
                    }
                }
            }
        }
    }

    /// Send `message` to a single connection.
    pub fn deliver_to(&self, user_id: i64, connection: ConnectionId, message: ServerMessage) {
        let users = self.lock();
        if let Some(sender) = users
            .get(&user_id)
            .and_then(|e| e.connections.get(&connection))
        {
            if sender.try_send(message).is_err() {
                debug!(user_id, connection, "Dropping presence message for a slow or closed connection");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_connection_removes_user() {
        let registry = LocalRegistry::new();
        let (tx, _rx) = mpsc::channel(4);

        let first = registry.register(1, OnlineStatus::Available, tx.clone());
        let second = registry.register(1, OnlineStatus::Busy, tx);
        assert_eq!(registry.status_of(1), Some(OnlineStatus::Busy));
        assert_eq!(registry.connection_count(), 2);

        assert!(!registry.unregister(1, first));
        assert_eq!(registry.snapshot().len(), 1);
        assert!(registry.unregister(1, second));
        assert!(registry.snapshot().is_empty());
        assert_eq!(registry.status_of(1), None);
    }

    #[test]
    fn test_deliver_reaches_every_connection_of_recipients() {
        let registry = LocalRegistry::new();
        let (tx_a1, mut rx_a1) = mpsc::channel(4);
        let (tx_a2, mut rx_a2) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);

        registry.register(1, OnlineStatus::Available, tx_a1);
        registry.register(1, OnlineStatus::Available, tx_a2);
        registry.register(2, OnlineStatus::Available, tx_b);

        let message = ServerMessage::Status {
            user_id: 9,
            status: OnlineStatus::Busy,
        };
        registry.deliver(&[1, 3], &message);

        assert_eq!(rx_a1.try_recv().unwrap(), message);
        assert_eq!(rx_a2.try_recv().unwrap(), message);
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn test_set_status_requires_connection() {
        let registry = LocalRegistry::new();
        assert!(!registry.set_status(5, OnlineStatus::Busy));

        let (tx, _rx) = mpsc::channel(1);
        registry.register(5, OnlineStatus::Available, tx);
        assert!(registry.set_status(5, OnlineStatus::Absent));
        assert_eq!(registry.status_of(5), Some(OnlineStatus::Absent));
    }
}
