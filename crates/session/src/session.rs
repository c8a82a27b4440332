use std::path::{Path, PathBuf};
use std::sync::Arc;

use filemesh_registry::NodeDirectory;
use filemesh_rpc::{ClientTimeouts, FileEntry, FileServiceClient};
use futures::TryStreamExt;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// First component of the prompt.
    pub label: String,
    /// Downloads land in `<data_root>/<node>/`.
    pub data_root: PathBuf,
    pub timeouts: ClientTimeouts,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            label: "root".to_string(),
            data_root: PathBuf::from("./data"),
            timeouts: ClientTimeouts::default(),
        }
    }
}

/// Result of a completed `get`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
    pub local_path: PathBuf,
    pub bytes: u64,
}

struct Connection {
    node: String,
    client: FileServiceClient,
}

/// Navigation state of one interactive client.
///
/// `path[0]` is the selected node and the rest is a directory inside its
/// storage root. A connection is open exactly when `path` is non-empty.
pub struct SessionManager {
    nodes: Arc<dyn NodeDirectory>,
    config: SessionConfig,
    path: Vec<String>,
    connection: Option<Connection>,
}

impl SessionManager {
    pub fn new(nodes: Arc<dyn NodeDirectory>, config: SessionConfig) -> Self {
        Self {
            nodes,
            config,
            path: Vec::new(),
            connection: None,
        }
    }

    pub fn prompt(&self) -> String {
        let mut prompt = self.config.label.clone();
        for segment in &self.path {
            prompt.push('/');
            prompt.push_str(segment);
        }
        prompt.push_str("> ");
        prompt
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    pub fn current_node(&self) -> Option<&str> {
        self.connection.as_ref().map(|conn| conn.node.as_str())
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Known nodes, sorted by name.
    pub fn show(&self) -> Vec<(String, String)> {
        self.nodes.list()
    }

    /// Applies a `/`-separated path expression. `..` pops a segment, `~`
    /// returns to the root, empty and `.` tokens are skipped.
    pub fn cd(&mut self, expression: &str) -> Result<()> {
        for token in expression.split('/') {
            match token {
                "" | "." => {}
                ".." => {
                    self.path.pop();
                }
                "~" => self.path.clear(),
                segment => self.path.push(segment.to_string()),
            }
        }

        if let Err(err) = self.update_connection() {
            self.path.pop();
            if !self.path.is_empty() && self.connection.is_none() {
                self.path.clear();
            }
            return Err(err);
        }
        Ok(())
    }

    fn update_connection(&mut self) -> Result<()> {
        let Some(node) = self.path.first().cloned() else {
            self.disconnect();
            return Ok(());
        };
        if self.current_node() == Some(node.as_str()) {
            return Ok(());
        }

        self.disconnect();
        let address = self
            .nodes
            .get(&node)
            .ok_or_else(|| SessionError::UnknownNode(node.clone()))?;
        let client = FileServiceClient::with_timeouts(&address, self.config.timeouts)?;
        info!(node = %node, address = %address, "connected to node");
        self.connection = Some(Connection { node, client });
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(conn) = self.connection.take() {
            debug!(node = %conn.node, "disconnecting from node");
            conn.client.close();
        }
    }

    fn connection(&self) -> Result<&Connection> {
        self.connection.as_ref().ok_or(SessionError::NotConnected)
    }

    /// Path inside the selected node's storage, optionally extended by `file`.
    fn remote_path(&self, file: Option<&str>) -> String {
        let mut segments: Vec<&str> = self.path.iter().skip(1).map(String::as_str).collect();
        segments.extend(file);
        segments.join("/")
    }

    pub async fn ls(&self) -> Result<Vec<FileEntry>> {
        let conn = self.connection()?;
        let remote = self.remote_path(None);
        Ok(conn.client.list_directory(&remote).await?)
    }

    /// Downloads `file_name` from the current remote directory. Partial
    /// output is removed when the transfer fails.
    pub async fn get(&self, file_name: &str) -> Result<Download> {
        let conn = self.connection()?;
        validate_file_name(file_name)?;

        let remote = self.remote_path(Some(file_name));
        let local_path = self.config.data_root.join(&conn.node).join(file_name);
        let mut stream = conn.client.download_file(&remote).await?;

        if let Some(parent) = local_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut partial = PartialDownload::new(&local_path);
        let mut file = fs::File::create(&local_path).await?;
        let mut bytes = 0u64;
        while let Some(chunk) = stream.try_next().await? {
            file.write_all(&chunk).await?;
            bytes += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);
        partial.keep();

        info!(node = %conn.node, remote = %remote, bytes, "download complete");
        Ok(Download { local_path, bytes })
    }

    /// Closes the connection and returns to the root.
    pub fn close(&mut self) {
        self.disconnect();
        self.path.clear();
    }
}

fn validate_file_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(SessionError::input("file name must not be empty"));
    }
    if name.starts_with(['/', '\\']) || Path::new(name).is_absolute() {
        return Err(SessionError::input(format!(
            "file name must be relative: {name}"
        )));
    }
    if name.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(SessionError::input(format!(
            "file name must not contain '..': {name}"
        )));
    }
    Ok(())
}

/// Removes the file on drop unless the download completed.
struct PartialDownload {
    path: PathBuf,
    keep: bool,
}

impl PartialDownload {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            keep: false,
        }
    }

    fn keep(&mut self) {
        self.keep = true;
    }
}

impl Drop for PartialDownload {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => warn!(path = %self.path.display(), "removed partial download"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %self.path.display(), error = %err, "failed to remove partial download"),
        }
    }
}
