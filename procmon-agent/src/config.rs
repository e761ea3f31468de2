//! Agent configuration
//!
//! Read once at startup from a TOML file, then overridden by environment
//! variables. `endpoint` and `api_key` are mandatory.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::AgentError;

/// On-disk shape; every key is optional so env can fill the gaps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileConfig {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub interval_secs: Option<u64>,
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    pub endpoint: String,
    pub api_key: String,
    /// `None` means collect and upload once, then exit.
    pub interval: Option<Duration>,
    pub hostname: String,
}

impl AgentConfig {
    /// Load config from `$PROCMON_AGENT_CONFIG` or the OS config dir, then the environment.
    pub async fn load() -> Result<Self, AgentError> {
        let path = match std::env::var_os("PROCMON_AGENT_CONFIG") {
            Some(p) => PathBuf::from(p),
            None => Self::config_file_path()?,
        };
        let file = Self::read_file(&path).await?;
        Self::resolve(file, |var| std::env::var(var).ok())
    }

    /// Get OS-specific config file path
    pub fn config_file_path() -> Result<PathBuf, AgentError> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| AgentError::Config("could not find config directory".into()))?;

        path.push("procmon-agent");
        path.push("config.toml");
        Ok(path)
    }

    /// A missing file is not an error; the environment may carry everything.
    pub async fn read_file(path: &Path) -> Result<FileConfig, AgentError> {
        if !path.exists() {
            debug!(path = %path.display(), "No agent config file");
            return Ok(FileConfig::default());
        }
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| AgentError::Config(format!("cannot read {}: {e}", path.display())))?;
        let file = toml::from_str(&content)
            .map_err(|e| AgentError::Config(format!("invalid {}: {e}", path.display())))?;
        info!(path = %path.display(), "Loaded agent config");
        Ok(file)
    }

    /// Merge file values with the environment (env wins) and validate.
    pub fn resolve(file: FileConfig, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AgentError> {
        let pick = |var: &str, from_file: Option<String>| lookup(var).or(from_file).filter(|v| !v.trim().is_empty());

        let endpoint = pick("PROC_ENDPOINT", file.endpoint)
            .ok_or_else(|| AgentError::Config("missing endpoint (config file or PROC_ENDPOINT)".into()))?;
        let api_key = pick("PROC_API_KEY", file.api_key)
            .ok_or_else(|| AgentError::Config("missing api_key (config file or PROC_API_KEY)".into()))?;

        let interval_secs = match lookup("PROC_INTERVAL_SECS") {
            Some(raw) => Some(
                raw.trim()
                    .parse::<u64>()
                    .map_err(|_| AgentError::Config(format!("PROC_INTERVAL_SECS is not a number: {raw}")))?,
            ),
            None => file.interval_secs,
        };
        if interval_secs == Some(0) {
            return Err(AgentError::Config("interval_secs must be positive".into()));
        }

        let hostname = match pick("PROC_HOSTNAME", file.hostname) {
            Some(h) => h,
            None => hostname::get()
                .map_err(|e| AgentError::Config(format!("cannot read OS hostname: {e}")))?
                .to_string_lossy()
                .into_owned(),
        };

        Ok(Self {
            endpoint,
            api_key,
            interval: interval_secs.map(Duration::from_secs),
            hostname,
        })
    }
}
