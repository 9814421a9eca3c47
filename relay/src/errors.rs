use crate::config::ConfigError;
use http::StatusCode;
use thiserror::Error;

/// Errors that stop the relay from starting or serving
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Invalid upstream url: {0}")]
    InvalidUpstreamUrl(#[from] url::ParseError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Outcome of forwarding a single request upstream
#[derive(Error, Debug)]
pub enum ForwardError {
    /// The caller did not supply the required input; nothing was sent upstream
    #[error("{0}")]
    InvalidRequest(&'static str),

    /// The request body could not be read, e.g. it was over the size limit
    #[error("{message}")]
    Rejected { status: StatusCode, message: String },

    /// The upstream answered with a non-2xx status
    #[error("Upstream responded with {status}")]
    Upstream { status: StatusCode, body: String },

    /// The call itself failed: connect, timeout, body read or malformed JSON
    #[error("{0}")]
    Transport(String),
}

impl ForwardError {
    pub fn kind(&self) -> &'static str {
        match self {
            ForwardError::InvalidRequest(_) | ForwardError::Rejected { .. } => "invalid_request",
            ForwardError::Upstream { .. } => "upstream",
            ForwardError::Transport(_) => "transport",
        }
    }
}

impl From<reqwest::Error> for ForwardError {
    fn from(e: reqwest::Error) -> Self {
        ForwardError::Transport(e.to_string())
    }
}
