use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("configuration: {0}")]
    Config(String),

    #[error("server answered {status}: {body}")]
    Transport { status: u16, body: String },

    #[error("no response from server within {0:?}")]
    Timeout(std::time::Duration),

    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("undecodable server response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Why a single process was left out of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SampleError {
    #[error("process exited during sampling")]
    Vanished,
    #[error("zombie process")]
    Zombie,
}
