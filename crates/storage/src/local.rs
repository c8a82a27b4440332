//! Filesystem backend rooted at a single directory.

use std::path::{Path, PathBuf};

use futures::StreamExt;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::debug;

use crate::error::{Result, StorageError};
use crate::path_guard;
use crate::{ByteStream, FileInfo};

/// Read buffer used for download streams.
const READ_BUFFER_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    /// Opens (and creates if needed) a sandbox rooted at `root`.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)?;
        let root = path_guard::absolute(root).ok_or_else(|| {
            StorageError::InvalidConfig("cannot resolve local storage root".to_string())
        })?;
        debug!(root = %root.display(), "local storage ready");
        Ok(Self { root })
    }

    pub fn get_root(&self) -> String {
        self.root.display().to_string()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_path_allowed(&self, path: &str) -> bool {
        path_guard::is_contained(&self.root, &self.resolve(path))
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path_guard::relative_request(path))
    }

    fn guarded(&self, path: &str) -> Result<PathBuf> {
        if !self.is_path_allowed(path) {
            return Err(StorageError::AccessDenied(path.to_string()));
        }
        Ok(self.resolve(path))
    }

    pub async fn list_directory(&self, path: &str) -> Result<Vec<FileInfo>> {
        let full_path = self.guarded(path)?;

        let mut dir = match fs::read_dir(&full_path).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StorageError::from_io(path, err)),
        };

        let mut entries = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|err| StorageError::from_io(path, err))?
        {
            // entries that vanish between readdir and stat are skipped
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            entries.push(FileInfo {
                name,
                is_directory: metadata.is_dir(),
                size: metadata.len(),
            });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    pub async fn download_file(&self, path: &str) -> Result<ByteStream> {
        let full_path = self.guarded(path)?;

        let metadata = fs::metadata(&full_path)
            .await
            .map_err(|err| StorageError::from_io(path, err))?;
        if metadata.is_dir() {
            return Err(StorageError::IsDirectory(path.to_string()));
        }

        let file = fs::File::open(&full_path)
            .await
            .map_err(|err| StorageError::from_io(path, err))?;
        Ok(ReaderStream::with_capacity(file, READ_BUFFER_BYTES).boxed())
    }

    pub async fn upload_file(&self, path: &str, data: ByteStream) -> Result<()> {
        let full_path = self.guarded(path)?;

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| StorageError::from_io(path, err))?;
        }

        let mut file = fs::File::create(&full_path)
            .await
            .map_err(|err| StorageError::from_io(path, err))?;
        let mut reader = StreamReader::new(data);

        let copied = async {
            tokio::io::copy(&mut reader, &mut file).await?;
            file.flush().await
        }
        .await;

        if let Err(err) = copied {
            drop(file);
            let _ = fs::remove_file(&full_path).await;
            return Err(StorageError::Io(err));
        }
        Ok(())
    }

    pub async fn delete_file(&self, path: &str) -> Result<()> {
        let full_path = self.guarded(path)?;
        fs::remove_file(&full_path)
            .await
            .map_err(|err| StorageError::from_io(path, err))
    }
}
