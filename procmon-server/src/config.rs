use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub database: PathBuf,
    /// Shared secret letting keyless hosts ingest.
    pub onboarding_key: Option<String>,
    /// Secret required for key rotation and host deletion.
    pub admin_key: Option<String>,
    pub hub: HubConf,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum HubConf {
    Local,
    Mqtt(MqttConf),
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MqttConf {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
}

fn default_mqtt_port() -> u16 {
    1883
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            database: PathBuf::from("./data/procmon.db"),
            onboarding_key: None,
            admin_key: None,
            hub: HubConf::Local,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid value for {var}: {value}")]
    Env { var: &'static str, value: String },
}

impl ServerConfig {
    /// File from `$PROCMON_SERVER_CONFIG` (or `procmon.yaml`), then environment overrides.
    pub async fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("PROCMON_SERVER_CONFIG").unwrap_or_else(|_| "procmon.yaml".into());
        let mut cfg = Self::from_file(Path::new(&path)).await?;
        cfg.apply_env(|var| std::env::var(var).ok())?;
        Ok(cfg)
    }

    pub async fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            warn!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let txt = fs::read_to_string(path).await.map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        let cfg = serde_yaml::from_str(&txt).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), "Loaded config file");
        Ok(cfg)
    }

    /// Environment wins over the file. `lookup` is `std::env::var` outside tests.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(key) = lookup("PROC_MONITOR_API_KEY") {
            self.onboarding_key = Some(key);
        }
        if let Some(key) = lookup("SUPER_ADMIN_KEY") {
            self.admin_key = Some(key);
        }
        if let Some(bind) = lookup("PROCMON_BIND") {
            self.bind = bind
                .parse()
                .map_err(|_| ConfigError::Env { var: "PROCMON_BIND", value: bind })?;
        }
        if let Some(db) = lookup("PROCMON_DATABASE") {
            self.database = PathBuf::from(db);
        }
        if let Some(host) = lookup("PROCMON_MQTT_HOST") {
            let port = match lookup("PROCMON_MQTT_PORT") {
                Some(p) => p
                    .parse()
                    .map_err(|_| ConfigError::Env { var: "PROCMON_MQTT_PORT", value: p })?,
                None => match &self.hub {
                    HubConf::Mqtt(existing) => existing.port,
                    HubConf::Local => default_mqtt_port(),
                },
            };
            self.hub = HubConf::Mqtt(MqttConf { host, port });
        }
        Ok(())
    }
}
