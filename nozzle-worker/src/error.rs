use std::time;

use thiserror::Error;

/// Enumeration of errors raised by a firehose client while subscribing or streaming.
#[derive(Error, Debug)]
pub enum FirehoseError {
    #[error("failed to connect to the firehose: {0}")]
    ConnectionError(String),
    #[error("firehose rejected subscription with status {status}")]
    SubscriptionRejected { status: u16 },
    #[error("firehose stream interrupted: {0}")]
    StreamError(String),
    #[error("failed to decode firehose envelope: {0}")]
    DecodeError(#[from] serde_json::Error),
}

impl From<reqwest::Error> for FirehoseError {
    fn from(error: reqwest::Error) -> Self {
        FirehoseError::ConnectionError(error.to_string())
    }
}

/// Enumeration of errors related to fetching application metadata from the directory service.
#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("error building directory request url")]
    ParseUrlError(#[from] url::ParseError),
    #[error("directory request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("directory lookup timed out after {0:?}")]
    Timeout(time::Duration),
    #[error("invalid directory token")]
    InvalidToken,
}

/// Enumeration of errors related to talking to the metrics proxy.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("metrics proxy connection failed: {0}")]
    IoError(#[from] std::io::Error),
}

/// Enumeration of errors returned when a point or an event could not be forwarded.
#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("metrics proxy did not accept points: {0}")]
    ProxyError(#[from] ProxyError),
    #[error("timed out after {0:?} while forwarding to the metrics proxy")]
    Timeout(time::Duration),
}

/// Enumeration of errors surfaced to the caller of `FirehoseConnector::connect`.
#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("connector has already been stopped and cannot be restarted")]
    AlreadyStopped,
    #[error("invalid connector configuration: {0}")]
    InvalidConfiguration(String),
    #[error("gave up reconnecting to the firehose after {attempts} attempts: {last_error}")]
    ReconnectBudgetExhausted {
        attempts: u32,
        last_error: FirehoseError,
    },
    #[error("connector task failed")]
    TaskFailed(#[from] tokio::task::JoinError),
    #[error("failed to set up {0}")]
    SetupError(String),
}

/// Enumeration of configuration validation errors, surfaced at startup.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    MustBePositive(&'static str),
    #[error("{name} is not a valid url: {value}")]
    InvalidUrl { name: &'static str, value: String },
    #[error("RECONNECT_MAXIMUM_INTERVAL must not be below RECONNECT_INITIAL_INTERVAL")]
    MaximumBelowInitial,
}

impl From<ConfigError> for ConnectorError {
    fn from(error: ConfigError) -> Self {
        ConnectorError::InvalidConfiguration(error.to_string())
    }
}
