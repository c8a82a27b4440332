use std::time::Duration;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use serde::Serialize;
use tracing::debug;
use url::Url;

use crate::error::{Result, RpcError};
use crate::types::{
    DownloadFileRequest, FileEntry, ListDirectoryRequest, ListDirectoryResponse,
    DOWNLOAD_FILE_ROUTE, LIST_DIRECTORY_ROUTE,
};

/// Chunks of a remote file, in order. Ends when the transfer completes.
pub type DownloadStream = BoxStream<'static, Result<Bytes>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientTimeouts {
    pub list: Duration,
    /// Covers the whole transfer, body included.
    pub download: Duration,
}

impl Default for ClientTimeouts {
    fn default() -> Self {
        Self {
            list: Duration::from_secs(5),
            download: Duration::from_secs(30),
        }
    }
}

/// Connection to one node's file service.
///
/// Connecting is lazy: the first call opens the underlying transport.
#[derive(Debug, Clone)]
pub struct FileServiceClient {
    http: reqwest::Client,
    base: Url,
    address: String,
    timeouts: ClientTimeouts,
}

impl FileServiceClient {
    pub fn connect(address: &str) -> Result<Self> {
        Self::with_timeouts(address, ClientTimeouts::default())
    }

    pub fn with_timeouts(address: &str, timeouts: ClientTimeouts) -> Result<Self> {
        let normalized = if address.contains("://") {
            address.to_string()
        } else {
            format!("http://{address}")
        };
        let base = Url::parse(&normalized)
            .map_err(|err| RpcError::InvalidArgument(format!("invalid node address {address}: {err}")))?;
        let http = reqwest::Client::builder()
            .connect_timeout(timeouts.list)
            .build()
            .map_err(|err| RpcError::from_http(address, "connect", err))?;
        debug!(address, "file service client created");
        Ok(Self {
            http,
            base,
            address: address.to_string(),
            timeouts,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn timeouts(&self) -> ClientTimeouts {
        self.timeouts
    }

    async fn post<B: Serialize>(
        &self,
        route: &str,
        body: &B,
        timeout: Duration,
        operation: &'static str,
    ) -> Result<reqwest::Response> {
        let url = self
            .base
            .join(route)
            .map_err(|err| RpcError::Protocol(format!("invalid route {route}: {err}")))?;
        let response = self
            .http
            .post(url)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|err| RpcError::from_http(&self.address, operation, err))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        Err(RpcError::from_response(status, &text))
    }

    pub async fn list_directory(&self, directory_path: &str) -> Result<Vec<FileEntry>> {
        let request = ListDirectoryRequest {
            directory_path: directory_path.to_string(),
        };
        let response = self
            .post(LIST_DIRECTORY_ROUTE, &request, self.timeouts.list, "list directory")
            .await?
            .json::<ListDirectoryResponse>()
            .await
            .map_err(|err| RpcError::from_http(&self.address, "list directory", err))?;
        Ok(response.entries)
    }

    /// Starts a download. Failures while the body streams surface as stream
    /// items; a timeout mid-transfer ends the stream with `Timeout`.
    pub async fn download_file(&self, file_path: &str) -> Result<DownloadStream> {
        let request = DownloadFileRequest {
            file_path: file_path.to_string(),
        };
        let response = self
            .post(DOWNLOAD_FILE_ROUTE, &request, self.timeouts.download, "download")
            .await?;
        let address = self.address.clone();
        Ok(response
            .bytes_stream()
            .map_err(move |err| RpcError::from_http(&address, "download", err))
            .boxed())
    }

    /// Drops the connection pool.
    pub fn close(self) {
        debug!(address = %self.address, "file service client closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_addresses_default_to_http() {
        let client = FileServiceClient::connect("10.0.0.1:9000").unwrap();
        assert_eq!(client.base.as_str(), "http://10.0.0.1:9000/");
        assert_eq!(client.address(), "10.0.0.1:9000");
        assert_eq!(client.timeouts(), ClientTimeouts::default());
    }

    #[test]
    fn explicit_scheme_is_kept() {
        let client = FileServiceClient::connect("https://files.example:8443").unwrap();
        assert_eq!(client.base.scheme(), "https");
    }

    #[test]
    fn garbage_address_is_rejected() {
        assert!(matches!(
            FileServiceClient::connect("http://"),
            Err(RpcError::InvalidArgument(_))
        ));
    }
}
