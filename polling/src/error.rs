use thiserror::Error;

#[derive(Debug, Error)]
pub enum PollingError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{data_source} failed after {attempts} attempts: {message}")]
    Fetch { data_source: &'static str, attempts: u32, message: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected response: {0}")]
    Parse(String),

    #[error("unknown data source {0}")]
    UnknownSource(String),

    #[error("peg {0} not found")]
    PegNotFound(String),
}

impl From<serde_json::Error> for PollingError {
    fn from(err: serde_json::Error) -> Self {
        PollingError::Parse(err.to_string())
    }
}

pub type PollingResult<T> = std::result::Result<T, PollingError>;
