use crate::miner::MinerId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StratumError {
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unknown method {0}")]
    UnknownMethod(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("miner {0} not found")]
    MinerNotFound(MinerId),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("session is already listening")]
    AlreadyListening,

    #[error("timed out waiting for a response")]
    Timeout,

    #[error("request dropped before a response arrived")]
    ResponseDropped,

    #[error("job not found")]
    JobNotFound,

    #[error("unauthorized worker")]
    UnauthorizedWorker,

    #[error("not subscribed")]
    NotSubscribed,
}

impl StratumError {
    /// Stratum error code sent back to a miner.
    pub fn code(&self) -> i32 {
        match self {
            StratumError::JobNotFound => 21,
            StratumError::UnauthorizedWorker => 24,
            StratumError::NotSubscribed => 25,
            _ => 20,
        }
    }
}

pub type StratumResult<T> = std::result::Result<T, StratumError>;
