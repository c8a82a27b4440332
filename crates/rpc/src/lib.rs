//! filemesh file service
//!
//! Two calls over HTTP/1.1: `ListDirectory` answers with a JSON listing and
//! `DownloadFile` streams the file as an `application/octet-stream` body.
//! Errors before streaming use status codes plus an [`types::ErrorResponse`]
//! body; errors while streaming abort the body.

pub mod client;
pub mod error;
pub mod server;
pub mod types;

pub use client::{ClientTimeouts, DownloadStream, FileServiceClient};
pub use error::{Result, RpcError};
pub use server::{
    bind_listener, serve, serve_listener, ApiError, FileAccessService, DEFAULT_CHUNK_SIZE,
    MAX_CHUNK_SIZE, MIN_CHUNK_SIZE,
};
pub use types::{
    DownloadFileRequest, ErrorKind, ErrorResponse, FileEntry, ListDirectoryRequest,
    ListDirectoryResponse,
};
