//! Snapshot upload to the ingestion endpoint.

use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use crate::error::AgentError;
use crate::sampler::ProcessSample;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Serialize)]
struct SnapshotPayload<'a> {
    hostname: &'a str,
    processes: &'a [ProcessSample],
}

pub struct Transport {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    timeout: Duration,
}

impl Transport {
    pub fn new(endpoint: &str, api_key: &str) -> Result<Self, AgentError> {
        Self::with_timeout(endpoint, api_key, REQUEST_TIMEOUT)
    }

    pub fn with_timeout(endpoint: &str, api_key: &str, timeout: Duration) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            api_key: api_key.to_string(),
            timeout,
        })
    }

    /// POSTs one snapshot and returns the server's JSON answer. No retries here.
    pub async fn send(&self, hostname: &str, processes: &[ProcessSample]) -> Result<serde_json::Value, AgentError> {
        debug!(endpoint = %self.endpoint, processes = processes.len(), "Uploading snapshot");

        let resp = self
            .client
            .post(&self.endpoint)
            .header("X-API-Key", &self.api_key)
            .json(&SnapshotPayload { hostname, processes })
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| self.classify(e))?;
        if status.as_u16() >= 300 {
            return Err(AgentError::Transport {
                status: status.as_u16(),
                body,
            });
        }
        Ok(serde_json::from_str(&body)?)
    }

    fn classify(&self, e: reqwest::Error) -> AgentError {
        if e.is_timeout() {
            AgentError::Timeout(self.timeout)
        } else {
            AgentError::Http(e)
        }
    }
}
