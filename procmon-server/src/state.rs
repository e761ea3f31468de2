use crate::auth::AuthGate;
use crate::config::ServerConfig;
use crate::hub::SharedHub;
use crate::keys::KeyManager;
use crate::store::SnapshotStore;

/// Everything a request handler needs, cloned per request by axum.
#[derive(Clone)]
pub struct AppState {
    pub store: SnapshotStore,
    pub gate: AuthGate,
    pub keys: KeyManager,
    pub hub: SharedHub,
}

impl AppState {
    pub fn new(store: SnapshotStore, hub: SharedHub, cfg: &ServerConfig) -> Self {
        Self {
            gate: AuthGate::new(store.clone(), cfg.onboarding_key.clone()),
            keys: KeyManager::new(store.clone(), cfg.admin_key.clone()),
            store,
            hub,
        }
    }
}
