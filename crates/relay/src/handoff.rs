use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::netaddr::ClientKey;
use crate::pipeline::{ConnectDecision, ConnectHook};

/// One pending redirect target, waiting for its client to reconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffEntry {
    pub host: String,
    pub port: u16,
    created_at: Instant,
}

/// Per-role table of pending redirect targets, keyed by client.
///
/// Entries are delivered at most once and expire after `ttl`. Pruning is
/// lazy: an expired entry is discarded only when a `claim` on the same
/// key walks past it. There is no background sweep; growth is bounded by
/// legitimate redirect volume.
pub struct HandoffQueue {
    ttl: Duration,
    table: Mutex<HashMap<ClientKey, VecDeque<HandoffEntry>>>,
}

impl HandoffQueue {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Remember that `key`'s next connection should be relayed to
    /// `host:port`.
    pub async fn enqueue(&self, key: &ClientKey, host: String, port: u16) {
        self.enqueue_at(key, host, port, Instant::now()).await;
    }

    /// Take the earliest still-valid entry for `key`, discarding every
    /// expired entry encountered ahead of it. Returns `None` when the
    /// key has nothing valid pending.
    pub async fn claim(&self, key: &ClientKey) -> Option<HandoffEntry> {
        self.claim_at(key, Instant::now()).await
    }

    async fn enqueue_at(&self, key: &ClientKey, host: String, port: u16, now: Instant) {
        let mut table = self.table.lock().await;
        table.entry(key.clone()).or_default().push_back(HandoffEntry {
            host,
            port,
            created_at: now,
        });
    }

    async fn claim_at(&self, key: &ClientKey, now: Instant) -> Option<HandoffEntry> {
        let mut table = self.table.lock().await;
        let list = table.get_mut(key)?;
        let mut claimed = None;
        while let Some(front) = list.front() {
            if now.duration_since(front.created_at) > self.ttl {
                // Stale; skip it so an old unclaimed entry never blocks
                // a newer valid one.
                list.pop_front();
                continue;
            }
            claimed = list.pop_front();
            break;
        }
        if list.is_empty() {
            table.remove(key);
        }
        claimed
    }
}

/// Pre-connect hook that binds a freshly accepted connection to its
/// pending redirect target. A miss is the admission policy at work: a
/// socket that never earned a redirect gets dropped before any protocol
/// interaction.
pub struct HandoffHook {
    queue: Arc<HandoffQueue>,
}

impl HandoffHook {
    pub fn new(queue: Arc<HandoffQueue>) -> Self {
        Self { queue }
    }
}

impl ConnectHook for HandoffHook {
    fn before_connect<'a>(
        &'a self,
        key: &'a ClientKey,
        peer: SocketAddr,
    ) -> Pin<Box<dyn Future<Output = ConnectDecision> + Send + 'a>> {
        Box::pin(async move {
            match self.queue.claim(key).await {
                Some(entry) => {
                    println!(
                        "relay.handoff.matched key={key} target={}:{}",
                        entry.host, entry.port
                    );
                    ConnectDecision::Redirect {
                        host: entry.host,
                        port: entry.port,
                    }
                }
                None => {
                    println!("relay.handoff.miss key={key} peer={peer}");
                    ConnectDecision::Refuse
                }
            }
        })
    }
}
