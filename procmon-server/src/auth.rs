//! Host identity and ingestion authentication.
//!
//! A host with its own key must present exactly that key. A host without one
//! may ingest with the shared onboarding secret, which never becomes the
//! host's key; only an explicit rotation gives a host its own credential.
//!
//! Resolving an unseen hostname creates the host record even when the request
//! is then rejected.

use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::models::Host;
use crate::store::SnapshotStore;

/// Which credential let a request through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Credential {
    HostKey,
    Onboarding,
}

#[derive(Debug)]
pub struct Admission {
    pub host: Host,
    pub credential: Credential,
}

#[derive(Clone)]
pub struct AuthGate {
    store: SnapshotStore,
    onboarding_key: Option<String>,
}

impl AuthGate {
    pub fn new(store: SnapshotStore, onboarding_key: Option<String>) -> Self {
        Self {
            store,
            onboarding_key: onboarding_key.filter(|k| !k.is_empty()),
        }
    }

    /// Resolves `hostname` (creating it if unseen) and checks `presented`
    /// against the host's current key.
    pub async fn admit(&self, hostname: &str, presented: Option<&str>) -> Result<Admission, ApiError> {
        let host = self.store.resolve_host(hostname).await?;
        let credential = self.check(&host, presented)?;
        debug!(hostname, ?credential, "Ingestion admitted");
        Ok(Admission { host, credential })
    }

    pub fn check(&self, host: &Host, presented: Option<&str>) -> Result<Credential, ApiError> {
        let presented = presented.filter(|k| !k.is_empty());

        match host.api_key.as_deref() {
            Some(expected) => {
                if presented.is_some_and(|key| secrets_match(key, expected)) {
                    Ok(Credential::HostKey)
                } else {
                    warn!(hostname = %host.hostname, "Rejected ingestion: host key mismatch");
                    Err(ApiError::Unauthorized("Invalid host API key"))
                }
            }
            None => match (self.onboarding_key.as_deref(), presented) {
                (Some(onboarding), Some(key)) if secrets_match(key, onboarding) => Ok(Credential::Onboarding),
                _ => {
                    warn!(hostname = %host.hostname, "Rejected ingestion: keyless host without onboarding secret");
                    Err(ApiError::Unauthorized("Host API key required or invalid"))
                }
            },
        }
    }
}

/// Compares credentials in time independent of where they differ.
pub(crate) fn secrets_match(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(api_key: Option<&str>) -> Host {
        Host {
            id: 1,
            hostname: "h1".into(),
            api_key: api_key.map(str::to_string),
        }
    }

    async fn gate(onboarding: Option<&str>) -> AuthGate {
        let store = SnapshotStore::open_in_memory().await.unwrap();
        AuthGate::new(store, onboarding.map(str::to_string))
    }

    #[tokio::test]
    async fn test_keyed_host_requires_exact_key() {
        let gate = gate(Some("onboard")).await;
        let keyed = host(Some("secret"));

        assert_eq!(gate.check(&keyed, Some("secret")).unwrap(), Credential::HostKey);
        assert!(matches!(gate.check(&keyed, Some("Secret")), Err(ApiError::Unauthorized(_))));
        assert!(matches!(gate.check(&keyed, None), Err(ApiError::Unauthorized(_))));
        // the onboarding secret stops working once a host has its own key
        assert!(matches!(gate.check(&keyed, Some("onboard")), Err(ApiError::Unauthorized(_))));
    }

    #[test]
    fn test_secrets_match_is_exact() {
        assert!(secrets_match("0123abcd", "0123abcd"));
        assert!(!secrets_match("0123abce", "0123abcd"));
        assert!(!secrets_match("0123abc", "0123abcd"));
        assert!(!secrets_match("0123abcd0", "0123abcd"));
        assert!(!secrets_match("", "0123abcd"));
    }

    #[tokio::test]
    async fn test_keyed_host_rejects_key_prefix() {
        let gate = gate(None).await;
        let keyed = host(Some("secret"));
        assert!(matches!(gate.check(&keyed, Some("secre")), Err(ApiError::Unauthorized(_))));
        assert!(matches!(gate.check(&keyed, Some("secrets")), Err(ApiError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn test_keyless_host_onboarding() {
        let gate = gate(Some("onboard")).await;
        let keyless = host(None);

        assert_eq!(gate.check(&keyless, Some("onboard")).unwrap(), Credential::Onboarding);
        assert!(matches!(gate.check(&keyless, Some("guess")), Err(ApiError::Unauthorized(_))));
        assert!(matches!(gate.check(&keyless, None), Err(ApiError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn test_no_onboarding_secret_rejects_keyless_hosts() {
        for configured in [None, Some("")] {
            let gate = gate(configured).await;
            assert!(matches!(gate.check(&host(None), Some("")), Err(ApiError::Unauthorized(_))));
            assert!(matches!(gate.check(&host(None), None), Err(ApiError::Unauthorized(_))));
        }
    }

    #[tokio::test]
    async fn test_admit_never_assigns_key() {
        let gate = gate(Some("onboard")).await;

        for _ in 0..3 {
            let admission = gate.admit("fresh", Some("onboard")).await.unwrap();
            assert_eq!(admission.credential, Credential::Onboarding);
            assert_eq!(admission.host.api_key, None);
        }
        let stored = gate.store.find_host("fresh").await.unwrap().unwrap();
        assert_eq!(stored.api_key, None);
    }

    #[tokio::test]
    async fn test_rejected_admit_still_creates_host() {
        let gate = gate(Some("onboard")).await;

        assert!(matches!(gate.admit("probe", Some("wrong")).await, Err(ApiError::Unauthorized(_))));
        assert!(gate.store.find_host("probe").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_admit_reads_current_key() {
        let gate = gate(Some("onboard")).await;
        gate.admit("h1", Some("onboard")).await.unwrap();

        gate.store.set_api_key("h1", "fresh-key").await.unwrap();

        assert!(matches!(gate.admit("h1", Some("onboard")).await, Err(ApiError::Unauthorized(_))));
        assert_eq!(gate.admit("h1", Some("fresh-key")).await.unwrap().credential, Credential::HostKey);
    }
}
