//! The bounded queue of fresh peer endpoints.
//!
//! Tracker cycles produce endpoints, the supervisor consumes them. The
//! queue deduplicates on the `(ip, port)` pair: within one announce cycle
//! an endpoint is never handed out twice, and a later cycle may re-announce
//! it (the peer may have come back). When the queue is full, producers wait
//! instead of dropping endpoints.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

use tokio::sync::mpsc;

/// A deduplicated, bounded source of peer endpoints.
#[derive(Debug)]
pub struct PeerQueue {
    sender: mpsc::Sender<SocketAddr>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<SocketAddr>>,
    seen: Mutex<HashMap<SocketAddr, u64>>,
}

impl PeerQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Enqueues an endpoint announced in announce cycle `cycle`, waiting
    /// for room when the queue is full. Duplicates within the same cycle
    /// generation are dropped.
    pub async fn push(&self, endpoint: SocketAddr, cycle: u64) {
        {
            let mut seen = self.seen.lock().expect("peer queue lock poisoned");
            match seen.get(&endpoint) {
                Some(last_cycle) if *last_cycle >= cycle => return,
                _ => seen.insert(endpoint, cycle),
            };
        }

        // The only send error is a dropped receiver, i.e. shutdown.
        let _ = self.sender.send(endpoint).await;
    }

    /// Takes the next endpoint, waiting until a tracker announces one.
    pub async fn pop(&self) -> Option<SocketAddr> {
        self.receiver.lock().await.recv().await
    }
}
