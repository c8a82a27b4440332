use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use filemesh_storage::{StorageBackend, StorageError};
use bytes::BytesMut;
use filemesh_storage::ByteStream;
use futures::{StreamExt, TryStreamExt};
use metrics::counter;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::types::{
    DownloadFileRequest, ErrorKind, ErrorResponse, FileEntry, ListDirectoryRequest,
    ListDirectoryResponse, DOWNLOAD_FILE_ROUTE, LIST_DIRECTORY_ROUTE,
};

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
pub const MIN_CHUNK_SIZE: usize = 1024;
pub const MAX_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Serves one storage backend over the file service routes.
pub struct FileAccessService {
    storage: StorageBackend,
    chunk_size: usize,
}

type SharedService = Arc<FileAccessService>;

impl FileAccessService {
    pub fn new(storage: StorageBackend) -> Self {
        Self {
            storage,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Sets the relay frame size, clamped to 1 KiB..=4 MiB.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn storage(&self) -> &StorageBackend {
        &self.storage
    }

    pub async fn list_directory(
        &self,
        request: ListDirectoryRequest,
    ) -> Result<ListDirectoryResponse, ApiError> {
        counter!("filemesh_rpc_list_requests_total").increment(1);
        debug!(path = %request.directory_path, "list directory");
        let entries = self
            .storage
            .list_directory(&request.directory_path)
            .await?
            .into_iter()
            .map(FileEntry::from)
            .collect();
        Ok(ListDirectoryResponse { entries })
    }

    /// Opens the file and re-frames the backend stream into frames of
    /// exactly `chunk_size` bytes; only the last one may be shorter. Errors
    /// after this returns abort the response body.
    pub async fn download_file(
        &self,
        request: DownloadFileRequest,
    ) -> Result<ByteStream, ApiError> {
        counter!("filemesh_rpc_download_requests_total").increment(1);
        if request.file_path.trim().is_empty() {
            return Err(ApiError::new(
                StatusCode::BAD_REQUEST,
                ErrorKind::InvalidArgument,
                "file_path must not be empty",
            ));
        }
        debug!(path = %request.file_path, "download file");

        let source = self.storage.download_file(&request.file_path).await?;
        let path = request.file_path;
        let framed = fixed_frames(source, self.chunk_size)
            .inspect_ok(|chunk| {
                counter!("filemesh_rpc_download_bytes_total").increment(chunk.len() as u64);
            })
            .inspect_err(move |err| {
                warn!(path = %path, error = %err, "download stream failed");
            });
        Ok(framed.boxed())
    }

    pub fn router(self) -> Router {
        build_router(Arc::new(self))
    }
}

fn fixed_frames(source: ByteStream, chunk_size: usize) -> ByteStream {
    futures::stream::try_unfold(StreamReader::new(source), move |mut reader| async move {
        let mut frame = BytesMut::with_capacity(chunk_size);
        while frame.len() < chunk_size {
            let wanted = (chunk_size - frame.len()) as u64;
            if (&mut reader).take(wanted).read_buf(&mut frame).await? == 0 {
                break;
            }
        }
        if frame.is_empty() {
            return Ok::<_, std::io::Error>(None);
        }
        Ok(Some((frame.freeze(), reader)))
    })
    .boxed()
}

fn build_router(service: SharedService) -> Router {
    Router::new()
        .route(LIST_DIRECTORY_ROUTE, post(handle_list_directory))
        .route(DOWNLOAD_FILE_ROUTE, post(handle_download_file))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

async fn handle_list_directory(
    State(service): State<SharedService>,
    Json(request): Json<ListDirectoryRequest>,
) -> Result<Json<ListDirectoryResponse>, ApiError> {
    service.list_directory(request).await.map(Json)
}

async fn handle_download_file(
    State(service): State<SharedService>,
    Json(request): Json<DownloadFileRequest>,
) -> Result<Response, ApiError> {
    let stream = service.download_file(request).await?;
    let mut response = Body::from_stream(stream).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    Ok(response)
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: ErrorKind,
    message: String,
}

impl ApiError {
    fn new<S: Into<String>>(status: StatusCode, kind: ErrorKind, message: S) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::AccessDenied(_) => {
                Self::new(StatusCode::FORBIDDEN, ErrorKind::AccessDenied, err.to_string())
            }
            StorageError::NotFound(_) => {
                Self::new(StatusCode::NOT_FOUND, ErrorKind::NotFound, err.to_string())
            }
            StorageError::IsDirectory(_) => Self::new(
                StatusCode::BAD_REQUEST,
                ErrorKind::InvalidArgument,
                err.to_string(),
            ),
            StorageError::Io(io) => {
                warn!(error = %io, "storage I/O failure");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorKind::Internal,
                    "storage I/O failure",
                )
            }
            other => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorKind::Internal,
                other.to_string(),
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let payload = Json(ErrorResponse {
            error: self.message,
            kind: self.kind,
        });
        (self.status, payload).into_response()
    }
}

pub async fn bind_listener(addr: &str) -> Result<TcpListener> {
    if let Ok(socket_addr) = addr.parse::<SocketAddr>() {
        TcpListener::bind(socket_addr)
            .await
            .with_context(|| format!("failed to bind file service on {socket_addr}"))
    } else {
        TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind file service on {addr}"))
    }
}

/// Serves `service` on `addr` until `shutdown` fires.
pub async fn serve(service: FileAccessService, addr: &str, shutdown: CancellationToken) -> Result<()> {
    let listener = bind_listener(addr).await?;
    serve_listener(listener, service, shutdown).await
}

pub async fn serve_listener(
    listener: TcpListener,
    service: FileAccessService,
    shutdown: CancellationToken,
) -> Result<()> {
    let local_addr = listener.local_addr().context("file service listener has no address")?;
    info!(
        addr = %local_addr,
        backend = service.storage.kind(),
        root = %service.storage.get_root(),
        chunk_size = service.chunk_size,
        "file service listening"
    );
    axum::serve(listener, service.router())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("file service terminated unexpectedly")?;
    info!(addr = %local_addr, "file service stopped");
    Ok(())
}
