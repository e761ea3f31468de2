//! Real-time fan-out of committed snapshots to per-host subscribers.
//!
//! Two backends sit behind [`SnapshotHub`]:
//! - [`LocalHub`] : in-process registry, single instance deployments
//! - [`MqttHub`]  : same registry, plus an MQTT topic shared by every instance
//!
//! Publishing only enqueues; it never blocks and never reports failure.
//! Each subscriber owns an unbounded queue, so one slow reader never holds up
//! the others. The WebSocket side bounds how long a reader may stall.

mod local;
mod mqtt;

pub use local::LocalHub;
pub use mqtt::MqttHub;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Serialized snapshot JSON, shared between all receivers.
pub type Payload = Arc<str>;

pub trait SnapshotHub: Send + Sync {
    /// Registers a listener for `hostname`. It sees every payload published
    /// from now on, in publish order, until the handle is dropped.
    fn subscribe(&self, hostname: &str) -> Subscription;

    /// Best-effort delivery to every current subscriber of `hostname`.
    fn publish(&self, hostname: &str, payload: Payload);

    fn backend(&self) -> &'static str;
}

pub type SharedHub = Arc<dyn SnapshotHub>;

struct Subscriber {
    id: Uuid,
    tx: mpsc::UnboundedSender<Payload>,
}

/// Hostname -> live subscribers. Shared by both backends.
#[derive(Default)]
pub(crate) struct Registry {
    channels: Mutex<HashMap<String, Vec<Subscriber>>>,
}

impl Registry {
    pub(crate) fn subscribe(self: &Arc<Self>, hostname: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();

        self.channels
            .lock()
            .entry(hostname.to_string())
            .or_default()
            .push(Subscriber { id, tx });

        debug!(hostname, %id, "Subscriber registered");
        Subscription {
            hostname: hostname.to_string(),
            id,
            rx,
            registry: Arc::downgrade(self),
        }
    }

    fn unsubscribe(&self, hostname: &str, id: Uuid) {
        let mut channels = self.channels.lock();
        if let Some(subs) = channels.get_mut(hostname) {
            subs.retain(|s| s.id != id);
            if subs.is_empty() {
                channels.remove(hostname);
            }
        }
        debug!(hostname, %id, "Subscriber removed");
    }

    /// Hands `payload` to every subscriber of `hostname` and returns how many
    /// took it. Subscribers whose receiver is gone are pruned on the way.
    pub(crate) fn deliver(&self, hostname: &str, payload: &Payload) -> usize {
        let mut channels = self.channels.lock();
        let Some(subs) = channels.get_mut(hostname) else {
            return 0;
        };

        subs.retain(|s| s.tx.send(Arc::clone(payload)).is_ok());
        let delivered = subs.len();
        if subs.is_empty() {
            channels.remove(hostname);
        }
        delivered
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self, hostname: &str) -> usize {
        self.channels.lock().get(hostname).map_or(0, Vec::len)
    }
}

/// Handle returned by [`SnapshotHub::subscribe`]. Dropping it unsubscribes.
pub struct Subscription {
    hostname: String,
    id: Uuid,
    rx: mpsc::UnboundedReceiver<Payload>,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Next payload for this hostname; `None` once the hub is gone.
    pub async fn recv(&mut self) -> Option<Payload> {
        self.rx.recv().await
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unsubscribe(&self.hostname, self.id);
        }
    }
}
