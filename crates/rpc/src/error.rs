use crate::types::{ErrorKind, ErrorResponse};

/// Client-side failures of file service calls.
#[derive(thiserror::Error, Debug)]
pub enum RpcError {
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("{0}")]
    NotFound(String),
    #[error("invalid request: {0}")]
    InvalidArgument(String),
    #[error("node {address} is unreachable: {reason}")]
    Unreachable { address: String, reason: String },
    #[error("{operation} on {address} timed out")]
    Timeout {
        address: String,
        operation: &'static str,
    },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("remote error: {0}")]
    Remote(String),
    #[error("transfer interrupted: {0}")]
    Stream(String),
}

impl RpcError {
    pub(crate) fn from_http(address: &str, operation: &'static str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                address: address.to_string(),
                operation,
            }
        } else if err.is_connect() {
            Self::Unreachable {
                address: address.to_string(),
                reason: err.to_string(),
            }
        } else if err.is_decode() {
            Self::Protocol(err.to_string())
        } else if err.is_body() {
            Self::Stream(err.to_string())
        } else {
            Self::Unreachable {
                address: address.to_string(),
                reason: err.to_string(),
            }
        }
    }

    /// Maps an error response back into the taxonomy. `body` is used when the
    /// server sent something other than an [`ErrorResponse`].
    pub(crate) fn from_response(status: reqwest::StatusCode, body: &str) -> Self {
        match serde_json::from_str::<ErrorResponse>(body) {
            Ok(ErrorResponse { error, kind }) => match kind {
                ErrorKind::AccessDenied => Self::AccessDenied(error),
                ErrorKind::NotFound => Self::NotFound(error),
                ErrorKind::InvalidArgument => Self::InvalidArgument(error),
                ErrorKind::Internal => Self::Remote(error),
            },
            Err(_) => {
                let text = if body.trim().is_empty() {
                    status.to_string()
                } else {
                    body.trim().to_string()
                };
                match status.as_u16() {
                    403 => Self::AccessDenied(text),
                    404 => Self::NotFound(text),
                    400 | 415 | 422 => Self::InvalidArgument(text),
                    code if code >= 500 => Self::Remote(text),
                    _ => Self::Protocol(format!("unexpected status {status}: {text}")),
                }
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type Result<T, E = RpcError> = std::result::Result<T, E>;
