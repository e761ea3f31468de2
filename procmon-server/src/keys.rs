//! Per-host API key rotation, guarded by the admin secret.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use tracing::{info, warn};

use crate::auth::secrets_match;
use crate::error::ApiError;
use crate::store::SnapshotStore;

/// Random bytes per generated key (128 bits, 32 hex chars).
const KEY_BYTES: usize = 16;

#[derive(Debug, Serialize)]
pub struct RotatedKey {
    pub hostname: String,
    pub new_api_key: String,
}

#[derive(Clone)]
pub struct KeyManager {
    store: SnapshotStore,
    admin_key: Option<String>,
}

impl KeyManager {
    pub fn new(store: SnapshotStore, admin_key: Option<String>) -> Self {
        Self {
            store,
            admin_key: admin_key.filter(|k| !k.is_empty()),
        }
    }

    /// Fails unless `presented` matches the configured admin secret. With no
    /// admin secret configured every call fails.
    pub fn authorize(&self, presented: Option<&str>) -> Result<(), ApiError> {
        match (self.admin_key.as_deref(), presented) {
            (Some(expected), Some(key)) if secrets_match(key, expected) => Ok(()),
            _ => {
                warn!("Rejected admin request");
                Err(ApiError::Unauthorized("Invalid Admin Key"))
            }
        }
    }

    /// Issues a fresh key for `hostname`, replacing any previous one.
    /// The key is handed out here only; no endpoint reads it back.
    pub async fn rotate(&self, presented_admin: Option<&str>, hostname: &str) -> Result<RotatedKey, ApiError> {
        self.authorize(presented_admin)?;

        let new_api_key = generate_key();
        self.store.set_api_key(hostname, &new_api_key).await?;

        info!(hostname, "Rotated host API key");
        Ok(RotatedKey {
            hostname: hostname.to_string(),
            new_api_key,
        })
    }

    /// Deletes a host and everything it ingested.
    pub async fn delete_host(&self, presented_admin: Option<&str>, hostname: &str) -> Result<(), ApiError> {
        self.authorize(presented_admin)?;
        self.store.delete_host(hostname).await?;
        Ok(())
    }
}

fn generate_key() -> String {
    let mut bytes = [0u8; KEY_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
