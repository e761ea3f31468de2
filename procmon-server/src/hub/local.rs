use std::sync::Arc;
use tracing::debug;

use super::{Payload, Registry, SnapshotHub, Subscription};

/// Single-instance hub: publish goes straight to the in-process registry.
#[derive(Default, Clone)]
pub struct LocalHub {
    registry: Arc<Registry>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotHub for LocalHub {
    fn subscribe(&self, hostname: &str) -> Subscription {
        self.registry.subscribe(hostname)
    }

    fn publish(&self, hostname: &str, payload: Payload) {
        let delivered = self.registry.deliver(hostname, &payload);
        debug!(hostname, delivered, "Snapshot published");
    }

    fn backend(&self) -> &'static str {
        "local"
    }
}
