//! Sessions against real file service nodes discovered through the registry.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::routing::post;
use axum::Router;
use bytes::Bytes;
use filemesh_registry::{
    Discovery, MemoryCoordinationStore, NodeDirectory, NodeMap, RegistrationConfig, Registry,
};
use filemesh_rpc::types::DOWNLOAD_FILE_ROUTE;
use filemesh_rpc::{bind_listener, serve_listener, FileAccessService};
use filemesh_session::{CommandInterpreter, SessionConfig, SessionManager};
use filemesh_storage::LocalStorage;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct FileNode {
    root: TempDir,
    addr: SocketAddr,
    shutdown: CancellationToken,
}

impl Drop for FileNode {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn start_file_node() -> FileNode {
    let root = TempDir::new().unwrap();
    std::fs::write(root.path().join("report.txt"), b"quarterly numbers\n").unwrap();
    std::fs::create_dir_all(root.path().join("logs/2024")).unwrap();
    std::fs::write(root.path().join("logs/app.log"), vec![b'x'; 2048]).unwrap();

    let storage = LocalStorage::new(root.path()).unwrap();
    let listener = bind_listener("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(serve_listener(
        listener,
        FileAccessService::new(storage.into()).with_chunk_size(1024),
        shutdown.clone(),
    ));
    FileNode {
        root,
        addr,
        shutdown,
    }
}

fn interpreter(nodes: Arc<NodeMap>, data_root: &TempDir) -> CommandInterpreter {
    let config = SessionConfig {
        data_root: data_root.path().to_path_buf(),
        ..SessionConfig::default()
    };
    CommandInterpreter::new(SessionManager::new(nodes, config))
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn registered_node_can_be_browsed_and_downloaded() {
    let node = start_file_node().await;
    let store = Arc::new(MemoryCoordinationStore::new());
    let registration = Registry::new(store.clone())
        .register(
            RegistrationConfig::new("n1", node.addr.to_string(), Duration::from_secs(10))
                .with_key_prefix("nodes/"),
        )
        .await
        .unwrap();

    let nodes = NodeMap::shared();
    let cancel = CancellationToken::new();
    let discovery = Discovery::new(store.clone(), nodes.clone()).with_prefix("nodes/");
    let discovery_task = tokio::spawn({
        let cancel = cancel.clone();
        async move { discovery.run(cancel).await }
    });
    wait_for(|| nodes.contains("n1")).await;

    let data = TempDir::new().unwrap();
    let mut shell = interpreter(nodes.clone(), &data);
    assert_eq!(
        shell.interpret("show").await,
        format!("n1: {}", node.addr)
    );

    assert_eq!(shell.interpret("cd n1").await, "");
    assert_eq!(shell.prompt(), "root/n1> ");
    let listing = shell.interpret("ls").await;
    assert!(listing.contains("d  logs"), "{listing}");
    assert!(listing.contains("-  report.txt 18B"), "{listing}");

    assert_eq!(
        shell.interpret("get report.txt").await,
        "Downloaded report.txt (18B)"
    );
    let local = data.path().join("n1/report.txt");
    assert_eq!(
        std::fs::read(&local).unwrap(),
        std::fs::read(node.root.path().join("report.txt")).unwrap()
    );

    assert_eq!(shell.interpret("cd logs").await, "");
    let listing = shell.interpret("ls").await;
    assert_eq!(listing.lines().count(), 2, "{listing}");
    assert!(listing.contains("-  app.log 2.00KB"), "{listing}");
    assert_eq!(
        shell.interpret("get app.log").await,
        "Downloaded app.log (2.00KB)"
    );
    assert_eq!(std::fs::read(data.path().join("n1/app.log")).unwrap().len(), 2048);

    registration.deregister().await;
    wait_for(|| nodes.is_empty()).await;
    assert_eq!(shell.interpret("show").await, "");

    cancel.cancel();
    discovery_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn cd_navigation_rules() {
    let node = start_file_node().await;
    let nodes = NodeMap::shared();
    nodes.upsert("n1", &node.addr.to_string());
    let data = TempDir::new().unwrap();
    let mut shell = interpreter(nodes, &data);

    shell.interpret("cd n1/logs/2024").await;
    shell.interpret("cd ..").await;
    assert_eq!(shell.session().path(), ["n1", "logs"]);

    shell.interpret("cd ~").await;
    assert!(shell.session().path().is_empty());
    assert!(!shell.session().is_connected());

    assert_eq!(shell.interpret("cd ghost").await, "Error: unknown node: ghost");
    assert_eq!(shell.prompt(), "root> ");

    shell.interpret("cd n1").await;
    assert_eq!(
        shell.interpret("cd ../ghost").await,
        "Error: unknown node: ghost"
    );
    assert!(shell.session().path().is_empty());
    assert!(!shell.session().is_connected());
}

#[tokio::test]
async fn failed_downloads_leave_nothing_behind() {
    let node = start_file_node().await;
    let nodes = NodeMap::shared();
    nodes.upsert("n1", &node.addr.to_string());
    let data = TempDir::new().unwrap();
    let mut shell = interpreter(nodes, &data);
    shell.interpret("cd n1").await;

    let output = shell.interpret("get missing.txt").await;
    assert!(output.starts_with("Error: "), "{output}");
    assert!(output.contains("missing.txt"), "{output}");
    assert!(!data.path().join("n1/missing.txt").exists());

    let output = shell.interpret("get ../secret").await;
    assert!(output.starts_with("Error: file name must not contain"), "{output}");
}

/// Serves a download that breaks after the first chunk.
async fn start_broken_node() -> (SocketAddr, CancellationToken) {
    let app = Router::new().route(
        DOWNLOAD_FILE_ROUTE,
        post(|| async {
            let chunks = futures::stream::iter(vec![
                Ok(Bytes::from_static(b"first half of the file")),
                Err(std::io::Error::new(std::io::ErrorKind::Other, "disk gone")),
            ]);
            Body::from_stream(chunks)
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .await
    });
    (addr, shutdown)
}

#[tokio::test]
async fn interrupted_transfer_removes_partial_file() {
    let (addr, shutdown) = start_broken_node().await;
    let nodes = NodeMap::shared();
    nodes.upsert("flaky", &addr.to_string());
    let data = TempDir::new().unwrap();
    let mut shell = interpreter(nodes, &data);

    shell.interpret("cd flaky").await;
    let output = shell.interpret("get big.bin").await;
    assert!(output.starts_with("Error: "), "{output}");
    assert!(!data.path().join("flaky/big.bin").exists());

    shutdown.cancel();
}
