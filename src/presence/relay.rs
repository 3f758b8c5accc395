//! Presence bus over a Unix socket.
//!
//! The coordinator hosts a [`serve`] loop; every worker connects with
//! [`RelayBus::connect`]. Messages are newline-delimited JSON and each line
//! received from one worker is forwarded to every other connected worker.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::bus::{BusError, BusMessage, BusPayload, PresenceBus, WorkerId};

type Subscribers = Arc<Mutex<Vec<mpsc::UnboundedSender<BusMessage>>>>;

/// Worker side of the relay.
pub struct RelayBus {
    worker_id: WorkerId,
    siblings: usize,
    outgoing: mpsc::UnboundedSender<String>,
    subscribers: Subscribers,
}

impl RelayBus {
    /// Connect to the relay at `socket_path`.
    ///
    /// `siblings` is the number of other workers in the cluster; it bounds
    /// how many replies an online query waits for.
    pub async fn connect(
        socket_path: &Path,
        worker_id: WorkerId,
        siblings: usize,
    ) -> std::io::Result<Self> {
        let stream = UnixStream::connect(socket_path).await?;
        let (read_half, mut write_half) = stream.into_split();

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(line) = outgoing_rx.recv().await {
                if let Err(e) = write_half.write_all(line.as_bytes()).await {
                    warn!(worker_id, error = %e, "Presence relay write failed");
                    break;
                }
            }
        });

        let subscribers: Subscribers = Arc::new(Mutex::new(Vec::new()));
        let reader_subscribers = subscribers.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let message: BusMessage = match serde_json::from_str(&line) {
                            Ok(m) => m,
                            Err(e) => {
                                warn!(worker_id, error = %e, "Dropping malformed relay message");
                                continue;
                            }
                        };
                        if message.origin == worker_id {
                            continue;
                        }
                        let mut subs = reader_subscribers
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner);
                        subs.retain(|tx| tx.send(message.clone()).is_ok());
                    }
                    Ok(None) => {
                        warn!(worker_id, "Presence relay closed the connection");
                        break;
                    }
                    Err(e) => {
                        warn!(worker_id, error = %e, "Presence relay read failed");
                        break;
                    }
                }
            }
            // Dropping the senders ends every subscription
            reader_subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        });

        info!(worker_id, path = %socket_path.display(), "Connected to presence relay");

        Ok(Self {
            worker_id,
            siblings,
            outgoing,
            subscribers,
        })
    }
}

impl PresenceBus for RelayBus {
    fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    fn publish(&self, payload: BusPayload) -> Result<(), BusError> {
        let message = BusMessage {
            origin: self.worker_id,
            payload,
        };
        let mut line = serde_json::to_string(&message).map_err(|_| BusError::Closed)?;
        line.push('\n');
        self.outgoing.send(line).map_err(|_| BusError::Closed)
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<BusMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    fn sibling_count(&self) -> usize {
        self.siblings
    }
}

type Peers = Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<String>>>>;

/// Run the relay: accept worker connections and fan every line out to the
/// other connections. Runs until the listener fails.
pub async fn serve(listener: UnixListener) -> std::io::Result<()> {
    let peers: Peers = Arc::new(Mutex::new(HashMap::new()));
    let next_id = AtomicU64::new(1);

    loop {
        let (stream, _) = listener.accept().await?;
        let peer_id = next_id.fetch_add(1, Ordering::Relaxed);
        debug!(peer_id, "Presence relay peer connected");
        tokio::spawn(handle_peer(peer_id, stream, peers.clone()));
    }
}

async fn handle_peer(peer_id: u64, stream: UnixStream, peers: Peers) {
    let (read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    peers
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(peer_id, tx);

    let writer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(read_half).lines();
    while let Ok(Some(mut line)) = lines.next_line().await {
        line.push('\n');
        let peers = peers.lock().unwrap_or_else(PoisonError::into_inner);
        for (id, tx) in peers.iter() {
            if *id != peer_id {
                let _ = tx.send(line.clone());
            }
        }
    }

    peers
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&peer_id);
    writer.abort();
    debug!(peer_id, "Presence relay peer disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_relay_fans_out_to_other_workers() {
        let dir = std::env::temp_dir().join(format!("sharegate-relay-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let socket = dir.join("relay.sock");

        let listener = UnixListener::bind(&socket).unwrap();
        tokio::spawn(serve(listener));

        let one = RelayBus::connect(&socket, 1, 1).await.unwrap();
        let two = RelayBus::connect(&socket, 2, 1).await.unwrap();
        let mut rx_one = one.subscribe();
        let mut rx_two = two.subscribe();

        // Both peers must be registered before publishing
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let request_id = Uuid::new_v4();
        one.publish(BusPayload::OnlineQuery { request_id }).unwrap();

        let received = tokio::time::timeout(std::time::Duration::from_secs(2), rx_two.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.origin, 1);
        assert_eq!(received.payload, BusPayload::OnlineQuery { request_id });
        assert!(rx_one.try_recv().is_err());
        assert_eq!(one.sibling_count(), 1);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
