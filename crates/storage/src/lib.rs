//! filemesh storage layer
//!
//! A node exposes exactly one storage backend through the file service. Every
//! backend offers the same capability set (list, download, upload, delete,
//! path check, root) and refuses any request that resolves outside its
//! configured root.
//!
//! ## Modules
//! - `path_guard`: lexical containment checks
//! - `local`: filesystem backend rooted at a directory
//! - `object`: object-store backend rooted at a bucket/prefix
//! - `factory`: builds the configured backend

pub mod error;
pub mod factory;
pub mod local;
pub mod object;
pub mod path_guard;

pub use error::{Result, StorageError};
pub use factory::{build_backend, LocalConfig, S3Config, StorageConfig};
pub use local::LocalStorage;
pub use object::ObjectStoreStorage;

use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Lazily-read, finite, single-pass byte stream produced by a download.
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// One directory listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub is_directory: bool,
    pub size: u64,
}

impl FileInfo {
    pub fn file<S: Into<String>>(name: S, size: u64) -> Self {
        Self {
            name: name.into(),
            is_directory: false,
            size,
        }
    }

    pub fn directory<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            is_directory: true,
            size: 0,
        }
    }
}

/// The storage backend a node serves from.
pub enum StorageBackend {
    Local(LocalStorage),
    ObjectStore(ObjectStoreStorage),
}

impl StorageBackend {
    /// Lists `path`. A missing local directory yields an empty listing.
    pub async fn list_directory(&self, path: &str) -> Result<Vec<FileInfo>> {
        match self {
            Self::Local(storage) => storage.list_directory(path).await,
            Self::ObjectStore(storage) => storage.list_directory(path).await,
        }
    }

    /// Opens `path` for streaming.
    pub async fn download_file(&self, path: &str) -> Result<ByteStream> {
        match self {
            Self::Local(storage) => storage.download_file(path).await,
            Self::ObjectStore(storage) => storage.download_file(path).await,
        }
    }

    /// Writes the full contents of `data` to `path`, replacing any previous file.
    pub async fn upload_file(&self, path: &str, data: ByteStream) -> Result<()> {
        match self {
            Self::Local(storage) => storage.upload_file(path, data).await,
            Self::ObjectStore(storage) => storage.upload_file(path, data).await,
        }
    }

    pub async fn delete_file(&self, path: &str) -> Result<()> {
        match self {
            Self::Local(storage) => storage.delete_file(path).await,
            Self::ObjectStore(storage) => storage.delete_file(path).await,
        }
    }

    pub fn is_path_allowed(&self, path: &str) -> bool {
        match self {
            Self::Local(storage) => storage.is_path_allowed(path),
            Self::ObjectStore(storage) => storage.is_path_allowed(path),
        }
    }

    /// Absolute root path, or `s3://bucket/prefix` for object stores.
    pub fn get_root(&self) -> String {
        match self {
            Self::Local(storage) => storage.get_root(),
            Self::ObjectStore(storage) => storage.get_root(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
            Self::ObjectStore(_) => "object_store",
        }
    }
}

impl From<LocalStorage> for StorageBackend {
    fn from(storage: LocalStorage) -> Self {
        Self::Local(storage)
    }
}

impl From<ObjectStoreStorage> for StorageBackend {
    fn from(storage: ObjectStoreStorage) -> Self {
        Self::ObjectStore(storage)
    }
}
