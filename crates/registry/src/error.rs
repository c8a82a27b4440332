/// Errors raised while talking to the coordination store.
#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("coordination store {endpoint} is unreachable: {reason}")]
    Unreachable { endpoint: String, reason: String },
    #[error("coordination store request timed out: {0}")]
    Timeout(String),
    /// The store answered with an error status (`code` is the gRPC code).
    #[error("coordination store rejected request ({code}): {message}")]
    Rejected { code: i32, message: String },
    #[error("malformed coordination store response: {0}")]
    Protocol(String),
    /// The watch start revision is older than the retained history.
    #[error("revision {requested} has been compacted (compacted up to {compacted})")]
    Compacted { requested: i64, compacted: i64 },
    #[error("coordination store client is closed")]
    Closed,
    #[error("invalid registration: {0}")]
    InvalidConfig(String),
}

impl RegistryError {
    pub(crate) fn from_http(endpoint: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(endpoint.to_string())
        } else if err.is_connect() {
            Self::Unreachable {
                endpoint: endpoint.to_string(),
                reason: err.to_string(),
            }
        } else if err.is_decode() {
            Self::Protocol(err.to_string())
        } else {
            Self::Unreachable {
                endpoint: endpoint.to_string(),
                reason: err.to_string(),
            }
        }
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable { .. } | Self::Timeout(_))
    }
}

pub type Result<T, E = RegistryError> = std::result::Result<T, E>;
