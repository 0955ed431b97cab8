//! Error taxonomy for log store requests, streaming and persistence.
//!
//! Errors are `Clone` so one in-flight page request can hand the same
//! outcome to every caller that joined it.

use reqwest::StatusCode;

/// Server message returned by log stores that shed load without a 429.
pub const TOO_MANY_OUTSTANDING: &str = "too many outstanding requests";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("log store returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("log store is overloaded: {0}")]
    TooManyOutstanding(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("failed to decode log store response: {0}")]
    Decode(String),
    #[error("invalid log store URL '{0}'")]
    InvalidUrl(String),
    #[error("state persistence failed: {0}")]
    Persistence(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Classify a non-success HTTP response.
    pub fn from_response(status: StatusCode, body: String) -> Self {
        if status != StatusCode::TOO_MANY_REQUESTS && body.contains(TOO_MANY_OUTSTANDING) {
            return Error::TooManyOutstanding(body);
        }
        Error::Status {
            status: status.as_u16(),
            body,
        }
    }

    /// HTTP status code carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Error::Status {
                status: status.as_u16(),
                body: err.to_string(),
            };
        }
        if err.is_decode() {
            return Error::Decode(err.to_string());
        }
        let message = err.to_string();
        if message.contains(TOO_MANY_OUTSTANDING) {
            return Error::TooManyOutstanding(message);
        }
        Error::Transport(message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Persistence(err.to_string())
    }
}
