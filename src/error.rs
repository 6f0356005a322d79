use thiserror::Error;

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("HTTP transport error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("URL parsing error: {0}")]
    UrlError(#[from] url::ParseError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Unexpected HTTP status {status} from {endpoint}")]
    UnexpectedStatus { status: u16, endpoint: String },

    #[error("Request timed out")]
    Timeout,

    #[error("Event stream closed by server")]
    StreamClosed,

    #[error("Push channel unavailable: {reason}")]
    PushUnavailable { reason: String },

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("Metrics server error: {0}")]
    MetricsError(String),
}

pub type FeedResult<T> = Result<T, FeedError>;
