//! Object-store backend rooted at a bucket and key prefix.
//!
//! Keys form a flat namespace, so "directories" are emulated with a `/`
//! delimiter. Containment is structural: request paths containing `..` are
//! refused and every key is built under the configured prefix.

use std::sync::Arc;

use futures::{StreamExt, TryStreamExt};
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use tokio::io::AsyncReadExt;
use tokio_util::io::StreamReader;
use tracing::debug;

use crate::error::{Result, StorageError};
use crate::path_guard;
use crate::{ByteStream, FileInfo};

pub struct ObjectStoreStorage {
    store: Arc<dyn ObjectStore>,
    scheme: String,
    bucket: String,
    /// Always empty or `/`-terminated.
    prefix: String,
}

impl ObjectStoreStorage {
    pub fn new<S, B, P>(store: Arc<dyn ObjectStore>, scheme: S, bucket: B, prefix: P) -> Self
    where
        S: Into<String>,
        B: Into<String>,
        P: AsRef<str>,
    {
        Self {
            store,
            scheme: scheme.into(),
            bucket: bucket.into(),
            prefix: normalize_prefix(prefix.as_ref()),
        }
    }

    pub fn get_root(&self) -> String {
        format!("{}://{}/{}", self.scheme, self.bucket, self.prefix)
    }

    /// Only traversal segments are rejected; the key builder keeps every
    /// accepted path under the prefix.
    pub fn is_path_allowed(&self, path: &str) -> bool {
        !path_guard::has_parent_segment(path)
    }

    fn guard(&self, path: &str) -> Result<()> {
        if !self.is_path_allowed(path) {
            return Err(StorageError::AccessDenied(path.to_string()));
        }
        Ok(())
    }

    /// Builds the full object key for a request path.
    pub fn build_key(&self, path: &str) -> String {
        let relative = clean_segments(path).join("/");
        format!("{}{}", self.prefix, relative)
    }

    fn object_path(&self, path: &str) -> ObjectPath {
        ObjectPath::from_iter(
            self.prefix
                .split('/')
                .chain(clean_segments(path))
                .filter(|segment| !segment.is_empty()),
        )
    }

    pub async fn list_directory(&self, path: &str) -> Result<Vec<FileInfo>> {
        self.guard(path)?;
        let location = self.object_path(path);
        let listing = if location.as_ref().is_empty() {
            self.store.list_with_delimiter(None).await
        } else {
            self.store.list_with_delimiter(Some(&location)).await
        }
        .map_err(|err| StorageError::from_object_store(path, err))?;

        let mut entries = Vec::with_capacity(listing.common_prefixes.len() + listing.objects.len());
        for prefix in listing.common_prefixes {
            if let Some(name) = prefix.filename() {
                entries.push(FileInfo::directory(name));
            }
        }
        for object in listing.objects {
            if object.location.as_ref().ends_with('/') {
                continue;
            }
            if let Some(name) = object.location.filename() {
                entries.push(FileInfo::file(name, object.size as u64));
            }
        }

        debug!(path, entries = entries.len(), "listed object prefix");
        Ok(entries)
    }

    pub async fn download_file(&self, path: &str) -> Result<ByteStream> {
        self.guard(path)?;
        let location = self.object_path(path);
        let result = self
            .store
            .get(&location)
            .await
            .map_err(|err| StorageError::from_object_store(path, err))?;

        Ok(result
            .into_stream()
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))
            .boxed())
    }

    /// Buffers the stream and writes it with a single put.
    pub async fn upload_file(&self, path: &str, data: ByteStream) -> Result<()> {
        self.guard(path)?;
        let location = self.object_path(path);

        let mut buffer = Vec::new();
        StreamReader::new(data).read_to_end(&mut buffer).await?;

        self.store
            .put(&location, PutPayload::from(buffer))
            .await
            .map_err(|err| StorageError::from_object_store(path, err))?;
        Ok(())
    }

    /// Deleting a missing key is reported as `NotFound`, which S3 itself
    /// would silently accept.
    pub async fn delete_file(&self, path: &str) -> Result<()> {
        self.guard(path)?;
        let location = self.object_path(path);

        self.store
            .head(&location)
            .await
            .map_err(|err| StorageError::from_object_store(path, err))?;
        self.store
            .delete(&location)
            .await
            .map_err(|err| StorageError::from_object_store(path, err))
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let segments = clean_segments(prefix.trim());
    if segments.is_empty() {
        String::new()
    } else {
        format!("{}/", segments.join("/"))
    }
}

/// Splits on either separator, dropping empty and `.` segments.
fn clean_segments(path: &str) -> Vec<&str> {
    path.split(['/', '\\'])
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect()
}
