//! Presence state machine.
//!
//! A connection is registered locally, announced to the visible peers on
//! every worker, and on close debounced by a grace window before the
//! cluster-wide online set decides whether the user really went offline.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::bus::{BusMessage, BusPayload, PresenceBus, WorkerId};
use super::messages::{OnlineStatus, ServerMessage, UserStatus};
use super::registry::{ConnectionId, LocalRegistry};
use super::visibility::VisibilityWhitelist;
use crate::db::Database;

/// Delay before a closed connection may turn into an offline broadcast.
pub const DISCONNECT_GRACE: Duration = Duration::from_secs(3);

/// Upper bound on waiting for sibling replies to an online query.
pub const GATHER_TIMEOUT: Duration = Duration::from_millis(500);

/// Time after start during which workers are still re-registering
/// connections; the initial peer list is held back until it elapses.
pub const STARTUP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct PresenceSettings {
    pub grace: Duration,
    pub gather_timeout: Duration,
    pub startup_grace: Duration,
    /// Persist explicit status changes as the user's preference
    pub persist: bool,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            grace: DISCONNECT_GRACE,
            gather_timeout: GATHER_TIMEOUT,
            startup_grace: STARTUP_GRACE,
            persist: false,
        }
    }
}

/// Handle for one open connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceConnection {
    pub user_id: i64,
    pub id: ConnectionId,
}

type PendingQueries = HashMap<Uuid, mpsc::UnboundedSender<Vec<UserStatus>>>;

struct Inner {
    registry: LocalRegistry,
    bus: Box<dyn PresenceBus>,
    whitelist: Arc<dyn VisibilityWhitelist>,
    db: Option<Database>,
    settings: PresenceSettings,
    started_at: Instant,
    pending: Mutex<PendingQueries>,
}

#[derive(Clone)]
pub struct PresenceService {
    inner: Arc<Inner>,
}

impl PresenceService {
    /// Create the service and start listening to the bus.
    pub fn start(
        bus: Box<dyn PresenceBus>,
        whitelist: Arc<dyn VisibilityWhitelist>,
        db: Option<Database>,
        settings: PresenceSettings,
    ) -> Self {
        let mut rx = bus.subscribe();
        let inner = Arc::new(Inner {
            registry: LocalRegistry::new(),
            bus,
            whitelist,
            db,
            settings,
            started_at: Instant::now(),
            pending: Mutex::new(HashMap::new()),
        });

        let weak: Weak<Inner> = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.handle_bus_message(message);
            }
        });

        Self { inner }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.inner.bus.worker_id()
    }

    pub fn local_connection_count(&self) -> usize {
        self.inner.registry.connection_count()
    }

    /// Register a new connection and announce it.
    ///
    /// The connecting user first receives `connected`, then after the
    /// startup grace the statuses of its online visible peers.
    pub async fn connect(
        &self,
        user_id: i64,
        initial: OnlineStatus,
        sender: mpsc::Sender<ServerMessage>,
    ) -> PresenceConnection {
        let id = self.inner.registry.register(user_id, initial, sender);
        let connection = PresenceConnection { user_id, id };
        debug!(user_id, connection = id, status = initial.as_str(), "Presence connected");

        self.inner.registry.deliver_to(
            user_id,
            id,
            ServerMessage::Connected {
                user_id,
                status: initial,
            },
        );

        let peers = self.inner.peers_of(user_id).await;
        if initial != OnlineStatus::Offline {
            self.inner.broadcast(user_id, initial, peers.clone(), true);
        }

        let service = self.clone();
        tokio::spawn(async move {
            let ready_at = service.inner.started_at + service.inner.settings.startup_grace;
            tokio::time::sleep_until(ready_at).await;

            let online = service.gather_online().await;
            let users = visible_online(&peers, &online);
            service
                .inner
                .registry
                .deliver_to(user_id, id, ServerMessage::OnlineUsers { users });
        });

        connection
    }

    /// Apply an explicit status change from the client.
    pub async fn change_status(&self, connection: PresenceConnection, status: OnlineStatus) {
        let user_id = connection.user_id;
        if !self.inner.registry.set_status(user_id, status) {
            return;
        }

        let peers = self.inner.peers_of(user_id).await;
        self.inner.broadcast(user_id, status, peers, true);

        // Awaited so that changes from one connection are stored in order
        if self.inner.settings.persist
            && let Some(db) = &self.inner.db
            && let Err(e) = db.users().set_online_status(user_id, status).await
        {
            warn!(user_id, error = %e, "Failed to persist presence status");
        }
    }

    /// Close a connection.
    ///
    /// After the grace window the cluster-wide online set is re-queried and
    /// `offline` is broadcast only if the user has no connection left
    /// anywhere. The handle resolves to whether that broadcast happened.
    pub fn disconnect(&self, connection: PresenceConnection) -> JoinHandle<bool> {
        let user_id = connection.user_id;
        self.inner.registry.unregister(user_id, connection.id);
        debug!(user_id, connection = connection.id, "Presence disconnected");

        let service = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(service.inner.settings.grace).await;

            let online = service.gather_online().await;
            if online.contains_key(&user_id) {
                return false;
            }

            let peers = service.inner.peers_of(user_id).await;
            service
                .inner
                .broadcast(user_id, OnlineStatus::Offline, peers, false);
            true
        })
    }

    /// Union of the local registry and every sibling's reply.
    ///
    /// Waits at most the gather timeout; a sibling that does not answer in
    /// time counts as having nobody online. Local entries win over replies.
    pub async fn gather_online(&self) -> HashMap<i64, OnlineStatus> {
        let mut online: HashMap<i64, OnlineStatus> = self
            .inner
            .registry
            .snapshot()
            .into_iter()
            .map(|u| (u.user_id, u.status))
            .collect();

        let expected = self.inner.bus.sibling_count();
        if expected == 0 {
            return online;
        }

        let request_id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.inner.pending().insert(request_id, tx);

        if let Err(e) = self.inner.bus.publish(BusPayload::OnlineQuery { request_id }) {
            warn!(error = %e, "Online query not sent, using local presence only");
            self.inner.pending().remove(&request_id);
            return online;
        }

        let deadline = Instant::now() + self.inner.settings.gather_timeout;
        let mut replies = 0;
        while replies < expected {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(users)) => {
                    replies += 1;
                    for user in users {
                        online.entry(user.user_id).or_insert(user.status);
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    debug!(replies, expected, "Online query timed out with partial results");
                    break;
                }
            }
        }

        self.inner.pending().remove(&request_id);
        online
    }

    /// Statuses of `user_id`'s visible peers that are online anywhere,
    /// excluding those showing as offline.
    pub async fn visible_online(&self, user_id: i64) -> Vec<UserStatus> {
        let peers = self.inner.peers_of(user_id).await;
        let online = self.gather_online().await;
        visible_online(&peers, &online)
    }
}

fn visible_online(peers: &[i64], online: &HashMap<i64, OnlineStatus>) -> Vec<UserStatus> {
    let mut users: Vec<UserStatus> = peers
        .iter()
        .filter_map(|&user_id| {
            online
                .get(&user_id)
                .filter(|status| **status != OnlineStatus::Offline)
                .map(|&status| UserStatus { user_id, status })
        })
        .collect();
    users.sort_by_key(|u| u.user_id);
    users
}

impl Inner {
    fn pending(&self) -> MutexGuard<'_, PendingQueries> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn peers_of(&self, user_id: i64) -> Vec<i64> {
        match self.whitelist.visible_peers(user_id).await {
            Ok(peers) => peers,
            Err(e) => {
                warn!(user_id, error = %e, "Visibility lookup failed, announcing to nobody");
                Vec::new()
            }
        }
    }

    /// Deliver a status to the user's own connections and its peers, here
    /// and on every other worker. With `adopt`, workers that also hold the
    /// user's connections record the status as the user's current one.
    fn broadcast(
        &self,
        user_id: i64,
        status: OnlineStatus,
        mut recipients: Vec<i64>,
        adopt: bool,
    ) {
        recipients.push(user_id);
        self.registry
            .deliver(&recipients, &ServerMessage::Status { user_id, status });

        if let Err(e) = self.bus.publish(BusPayload::Status {
            user_id,
            status,
            recipients,
            adopt,
        }) {
            warn!(user_id, error = %e, "Presence broadcast not sent to other workers");
        }
    }

    fn handle_bus_message(&self, message: BusMessage) {
        match message.payload {
            BusPayload::Status {
                user_id,
                status,
                recipients,
                adopt,
            } => {
                if adopt {
                    self.registry.set_status(user_id, status);
                }
                self.registry
                    .deliver(&recipients, &ServerMessage::Status { user_id, status });
            }
            BusPayload::OnlineQuery { request_id } => {
                let reply = BusPayload::OnlineReply {
                    request_id,
                    to: message.origin,
                    users: self.registry.snapshot(),
                };
                if let Err(e) = self.bus.publish(reply) {
                    warn!(error = %e, "Online reply not sent");
                }
            }
            BusPayload::OnlineReply {
                request_id,
                to,
                users,
            } => {
                if to != self.bus.worker_id() {
                    return;
                }
                if let Some(tx) = self.pending().get(&request_id) {
                    let _ = tx.send(users);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::bus::InProcessHub;
    use crate::presence::visibility::StaticWhitelist;

    fn service(hub: &InProcessHub, worker_id: WorkerId) -> PresenceService {
        PresenceService::start(
            Box::new(hub.join(worker_id)),
            Arc::new(StaticWhitelist::from_groups(&[&[1, 2, 3]])),
            None,
            PresenceSettings {
                startup_grace: Duration::ZERO,
                ..PresenceSettings::default()
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_sends_connected_then_peer_list() {
        let hub = InProcessHub::new();
        let presence = service(&hub, 1);

        let (bob_tx, mut bob_rx) = mpsc::channel(16);
        presence.connect(2, OnlineStatus::Busy, bob_tx).await;

        let (alice_tx, mut alice_rx) = mpsc::channel(16);
        presence
            .connect(1, OnlineStatus::Available, alice_tx)
            .await;

        assert_eq!(
            alice_rx.recv().await.unwrap(),
            ServerMessage::Connected {
                user_id: 1,
                status: OnlineStatus::Available
            }
        );
        // Own connection hears its own announcement
        assert_eq!(
            alice_rx.recv().await.unwrap(),
            ServerMessage::Status {
                user_id: 1,
                status: OnlineStatus::Available
            }
        );
        assert_eq!(
            alice_rx.recv().await.unwrap(),
            ServerMessage::OnlineUsers {
                users: vec![UserStatus {
                    user_id: 2,
                    status: OnlineStatus::Busy
                }]
            }
        );

        let mut bob_saw_alice = false;
        while let Ok(message) = bob_rx.try_recv() {
            if message
                == (ServerMessage::Status {
                    user_id: 1,
                    status: OnlineStatus::Available,
                })
            {
                bob_saw_alice = true;
            }
        }
        assert!(bob_saw_alice);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_connect_is_not_announced() {
        let hub = InProcessHub::new();
        let presence = service(&hub, 1);

        let (bob_tx, mut bob_rx) = mpsc::channel(16);
        presence.connect(2, OnlineStatus::Available, bob_tx).await;
        while bob_rx.try_recv().is_ok() {}

        let (alice_tx, _alice_rx) = mpsc::channel(16);
        presence.connect(1, OnlineStatus::Offline, alice_tx).await;
        tokio::task::yield_now().await;

        while let Ok(message) = bob_rx.try_recv() {
            assert!(!matches!(message, ServerMessage::Status { user_id: 1, .. }));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_waits_for_grace_before_offline() {
        let hub = InProcessHub::new();
        let presence = service(&hub, 1);

        let (alice_tx, _alice_rx) = mpsc::channel(16);
        let alice = presence
            .connect(1, OnlineStatus::Available, alice_tx)
            .await;

        let handle = presence.disconnect(alice);

        // Quick reconnect inside the grace window
        let (again_tx, _again_rx) = mpsc::channel(16);
        presence
            .connect(1, OnlineStatus::Available, again_tx)
            .await;

        assert!(!handle.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gather_tolerates_silent_sibling() {
        let hub = InProcessHub::new();
        let presence = service(&hub, 1);
        // A member that never answers
        let _silent = hub.join(2);

        let (alice_tx, _alice_rx) = mpsc::channel(16);
        presence
            .connect(1, OnlineStatus::Available, alice_tx)
            .await;

        let started = Instant::now();
        let online = presence.gather_online().await;
        assert_eq!(online.get(&1), Some(&OnlineStatus::Available));
        assert!(Instant::now() - started >= GATHER_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_status_reaches_peers() {
        let hub = InProcessHub::new();
        let presence = service(&hub, 1);

        let (bob_tx, mut bob_rx) = mpsc::channel(16);
        presence.connect(2, OnlineStatus::Available, bob_tx).await;
        let (alice_tx, _alice_rx) = mpsc::channel(16);
        let alice = presence
            .connect(1, OnlineStatus::Available, alice_tx)
            .await;
        tokio::task::yield_now().await;
        while bob_rx.try_recv().is_ok() {}

        presence.change_status(alice, OnlineStatus::Absent).await;

        let mut received = Vec::new();
        while let Ok(message) = bob_rx.try_recv() {
            received.push(message);
        }
        assert!(received.contains(&ServerMessage::Status {
            user_id: 1,
            status: OnlineStatus::Absent
        }));
    }
}
