//! Client and server over a real socket.

use std::net::SocketAddr;
use std::time::Duration;

use axum::routing::post;
use axum::Router;
use bytes::Bytes;
use filemesh_rpc::{
    bind_listener, serve_listener, ClientTimeouts, FileAccessService, FileServiceClient, RpcError,
};
use filemesh_storage::LocalStorage;
use futures::TryStreamExt;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct Node {
    dir: TempDir,
    addr: SocketAddr,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<anyhow::Result<()>>,
}

async fn start_node(chunk_size: usize) -> Node {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("reports/2024")).unwrap();
    std::fs::write(dir.path().join("reports/summary.txt"), b"all good").unwrap();

    let storage = LocalStorage::new(dir.path()).unwrap();
    let service = FileAccessService::new(storage.into()).with_chunk_size(chunk_size);
    let listener = bind_listener("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(serve_listener(listener, service, shutdown.clone()));
    Node {
        dir,
        addr,
        shutdown,
        server,
    }
}

#[tokio::test]
async fn list_directory_over_the_wire() {
    let node = start_node(1024).await;
    let client = FileServiceClient::connect(&node.addr.to_string()).unwrap();

    let entries = client.list_directory("reports").await.unwrap();
    let names: Vec<_> = entries.iter().map(|e| (e.name.as_str(), e.is_directory)).collect();
    assert_eq!(names, vec![("2024", true), ("summary.txt", false)]);
    assert_eq!(entries[1].size, 8);

    assert!(client.list_directory("nowhere").await.unwrap().is_empty());

    client.close();
    node.shutdown.cancel();
    node.server.await.unwrap().unwrap();
}

#[tokio::test]
async fn download_arrives_in_chunks() {
    let node = start_node(4096).await;
    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 253) as u8).collect();
    std::fs::write(node.dir.path().join("blob.bin"), &payload).unwrap();

    let client = FileServiceClient::connect(&node.addr.to_string()).unwrap();
    let chunks: Vec<Bytes> = client
        .download_file("/blob.bin")
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert!(!chunks.is_empty());
    assert_eq!(chunks.concat(), payload);
    node.shutdown.cancel();
}

#[tokio::test]
async fn remote_errors_keep_their_kind() {
    let node = start_node(1024).await;
    let client = FileServiceClient::connect(&node.addr.to_string()).unwrap();

    let err = client.download_file("missing.txt").await.err().unwrap();
    assert!(err.is_not_found(), "{err}");
    assert_eq!(err.to_string(), "not found: missing.txt");

    let err = client.download_file("../../etc/passwd").await.err().unwrap();
    assert!(matches!(err, RpcError::AccessDenied(_)), "{err}");

    let err = client.list_directory("../").await.unwrap_err();
    assert!(matches!(err, RpcError::AccessDenied(_)), "{err}");

    let err = client.download_file("reports").await.err().unwrap();
    assert!(matches!(err, RpcError::InvalidArgument(_)), "{err}");
    node.shutdown.cancel();
}

#[tokio::test]
async fn stopped_node_is_unreachable() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = FileServiceClient::connect(&addr.to_string()).unwrap();
    let err = client.list_directory("").await.unwrap_err();
    assert!(matches!(err, RpcError::Unreachable { .. }), "{err}");
}

#[tokio::test]
async fn slow_listing_times_out() {
    let router = Router::new().route(
        "/filemesh.FileService/ListDirectory",
        post(|| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            "{}"
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, router).await });

    let timeouts = ClientTimeouts {
        list: Duration::from_millis(200),
        download: Duration::from_secs(1),
    };
    let client = FileServiceClient::with_timeouts(&addr.to_string(), timeouts).unwrap();
    let err = client.list_directory("").await.unwrap_err();
    assert!(matches!(err, RpcError::Timeout { .. }), "{err}");
}
