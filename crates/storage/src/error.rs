use std::io;

/// Storage errors
///
/// Messages only ever echo the path the caller supplied; backend roots and
/// object keys stay internal.
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("access denied: {0} is outside the storage root")]
    AccessDenied(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("{0} is a directory")]
    IsDirectory(String),
    #[error("invalid storage configuration: {0}")]
    InvalidConfig(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("object store request for {0} failed")]
    ObjectStore(String),
}

impl StorageError {
    /// Maps a raw I/O failure on `path` into the storage taxonomy.
    pub(crate) fn from_io(path: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(path.to_string()),
            io::ErrorKind::PermissionDenied => Self::AccessDenied(path.to_string()),
            _ => Self::Io(err),
        }
    }

    /// Maps an object store failure on `path` into the storage taxonomy.
    pub(crate) fn from_object_store(path: &str, err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { .. } => Self::NotFound(path.to_string()),
            other => {
                // the raw error names the full object key, keep it in the logs
                tracing::warn!(path, error = %other, "object store request failed");
                Self::ObjectStore(path.to_string())
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_access_denied(&self) -> bool {
        matches!(self, Self::AccessDenied(_))
    }
}

pub type Result<T, E = StorageError> = std::result::Result<T, E>;
