//! Cross-process presence bus.
//!
//! Workers share no memory; presence changes and online-set queries travel
//! as messages. Two implementations: [`InProcessBus`] joins a hub living in
//! the same process (single-process mode and tests) and
//! [`super::relay::RelayBus`] talks to the relay hosted by the coordinator.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{broadcast, mpsc};
use tracing::warn;
use uuid::Uuid;

use super::messages::{OnlineStatus, UserStatus};

/// Identifier of a worker process on the bus.
pub type WorkerId = u32;

/// A message on the bus, stamped with its sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusMessage {
    pub origin: WorkerId,
    pub payload: BusPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusPayload {
    /// A user's status changed; deliver to local connections of `recipients`
    Status {
        user_id: i64,
        status: OnlineStatus,
        recipients: Vec<i64>,
        /// Workers holding connections of `user_id` take the status over.
        /// False for the offline announced after the last disconnect.
        #[serde(default)]
        adopt: bool,
    },
    /// Ask every sibling for its local online set
    OnlineQuery { request_id: Uuid },
    /// Answer to an `OnlineQuery`, addressed to worker `to`
    OnlineReply {
        request_id: Uuid,
        to: WorkerId,
        users: Vec<UserStatus>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The bus is no longer connected
    Closed,
}

impl std::fmt::Display for BusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BusError::Closed => write!(f, "Presence bus closed"),
        }
    }
}

impl std::error::Error for BusError {}

/// Publish/subscribe channel between worker processes.
pub trait PresenceBus: Send + Sync {
    fn worker_id(&self) -> WorkerId;

    /// Send a payload to every other worker. Never blocks.
    fn publish(&self, payload: BusPayload) -> Result<(), BusError>;

    /// Stream of messages from other workers.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<BusMessage>;

    /// Number of other workers expected to answer queries.
    fn sibling_count(&self) -> usize;
}

/// Capacity of the in-process broadcast channel.
const HUB_CAPACITY: usize = 1024;

/// Shared channel for workers living in one process.
#[derive(Clone)]
pub struct InProcessHub {
    sender: broadcast::Sender<BusMessage>,
    members: Arc<AtomicUsize>,
}

impl Default for InProcessHub {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(HUB_CAPACITY);
        Self {
            sender,
            members: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Attach a worker to the hub.
    pub fn join(&self, worker_id: WorkerId) -> InProcessBus {
        self.members.fetch_add(1, Ordering::SeqCst);
        InProcessBus {
            worker_id,
            hub: self.clone(),
        }
    }
}

pub struct InProcessBus {
    worker_id: WorkerId,
    hub: InProcessHub,
}

impl Drop for InProcessBus {
    fn drop(&mut self) {
        self.hub.members.fetch_sub(1, Ordering::SeqCst);
    }
}

impl PresenceBus for InProcessBus {
    fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    fn publish(&self, payload: BusPayload) -> Result<(), BusError> {
        // No receivers is not an error: nobody else is listening yet
        let _ = self.hub.sender.send(BusMessage {
            origin: self.worker_id,
            payload,
        });
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<BusMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut receiver = self.hub.sender.subscribe();
        let worker_id = self.worker_id;

        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(message) if message.origin == worker_id => {}
                    Ok(message) => {
                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(worker_id, skipped, "Presence bus subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        rx
    }

    fn sibling_count(&self) -> usize {
        self.hub.members.load(Ordering::SeqCst).saturating_sub(1)
    }
}
