use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::ApiError;

/// Longest process name kept at persistence, in characters.
pub const MAX_PROCESS_NAME_CHARS: usize = 512;

/// Hostnames longer than this are rejected at validation.
pub const MAX_HOSTNAME_CHARS: usize = 255;

/// A monitored machine. `api_key` stays `None` until the first rotation.
#[derive(Debug, Clone, PartialEq)]
pub struct Host {
    pub id: i64,
    pub hostname: String,
    pub api_key: Option<String>,
}

/// Ingestion payload sent by agents.
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotIn {
    pub hostname: String,
    pub processes: Vec<ProcessIn>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessIn {
    pub pid: i64,
    #[serde(default)]
    pub ppid: Option<i64>,
    pub name: String,
    #[serde(default)]
    pub cpu_percent: Option<f64>,
    #[serde(default)]
    pub memory_mb: Option<f64>,
}

/// A persisted snapshot, as served by the API and pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: i64,
    pub hostname: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub processes: Vec<ProcessRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRow {
    pub pid: i64,
    pub ppid: Option<i64>,
    pub name: String,
    pub cpu_percent: Option<f64>,
    pub memory_mb: Option<f64>,
}

impl SnapshotIn {
    /// Parses and validates a raw request body. Nothing here touches the store.
    pub fn parse(body: &[u8]) -> Result<Self, ApiError> {
        let payload: SnapshotIn = serde_json::from_slice(body)
            .map_err(|e| ApiError::Validation(format!("invalid snapshot payload: {e}")))?;
        payload.validate()?;
        Ok(payload)
    }

    fn validate(&self) -> Result<(), ApiError> {
        if self.hostname.trim().is_empty() {
            return Err(ApiError::Validation("hostname may not be blank".into()));
        }
        if self.hostname.chars().count() > MAX_HOSTNAME_CHARS {
            return Err(ApiError::Validation(format!(
                "hostname longer than {MAX_HOSTNAME_CHARS} characters"
            )));
        }
        if let Some(idx) = self.processes.iter().position(|p| p.name.trim().is_empty()) {
            return Err(ApiError::Validation(format!("processes[{idx}].name may not be blank")));
        }
        Ok(())
    }
}

impl ProcessIn {
    /// Row as it will be stored: the name is cut to [`MAX_PROCESS_NAME_CHARS`].
    pub fn to_row(&self) -> ProcessRow {
        ProcessRow {
            pid: self.pid,
            ppid: self.ppid,
            name: truncate_name(&self.name),
            cpu_percent: self.cpu_percent,
            memory_mb: self.memory_mb,
        }
    }
}

pub fn truncate_name(name: &str) -> String {
    match name.char_indices().nth(MAX_PROCESS_NAME_CHARS) {
        Some((cut, _)) => name[..cut].to_string(),
        None => name.to_string(),
    }
}
