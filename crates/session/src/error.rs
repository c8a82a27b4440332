use filemesh_rpc::RpcError;

/// Failures of session commands. Rendered to the user as `Error: <message>`.
#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("{0}")]
    Input(String),
    #[error("unknown node: {0}")]
    UnknownNode(String),
    #[error("no node selected, use cd <node> first")]
    NotConnected,
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("local I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    pub(crate) fn input<S: Into<String>>(message: S) -> Self {
        Self::Input(message.into())
    }

    /// The line shown to the user.
    pub fn render(&self) -> String {
        format!("Error: {self}")
    }
}

pub type Result<T, E = SessionError> = std::result::Result<T, E>;
