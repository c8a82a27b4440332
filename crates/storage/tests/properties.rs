//! Sandbox and round-trip properties checked through `StorageBackend`.

use std::sync::Arc;

use bytes::Bytes;
use filemesh_storage::{
    ByteStream, LocalStorage, ObjectStoreStorage, StorageBackend, StorageError,
};
use futures::{StreamExt, TryStreamExt};
use object_store::memory::InMemory;
use proptest::prelude::*;
use tempfile::TempDir;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn segment() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("..".to_string()),
        Just(".".to_string()),
        Just(String::new()),
        "[a-m]{1,6}",
    ]
}

/// True when walking `segments` from the root ever climbs above it. Names
/// come from a-m, so a walk that left the root cannot re-enter it.
fn escapes(segments: &[String]) -> bool {
    let mut depth: i64 = 0;
    for segment in segments {
        match segment.as_str() {
            "" | "." => {}
            ".." => depth -= 1,
            _ => depth += 1,
        }
        if depth < 0 {
            return true;
        }
    }
    false
}

fn request_path(segments: &[String], leading_slash: bool) -> String {
    let joined = segments.join("/");
    if leading_slash {
        format!("/{joined}")
    } else {
        joined
    }
}

fn stream_of(data: &[u8], piece: usize) -> ByteStream {
    let chunks: Vec<std::io::Result<Bytes>> = data
        .chunks(piece)
        .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
        .collect();
    futures::stream::iter(chunks).boxed()
}

async fn read_all(backend: &StorageBackend, path: &str) -> Vec<u8> {
    let chunks: Vec<Bytes> = backend
        .download_file(path)
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    chunks.concat()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn local_backend_refuses_every_escaping_path(
        segments in prop::collection::vec(segment(), 0..8),
        leading_slash in any::<bool>(),
    ) {
        let dir = TempDir::new().unwrap();
        let backend: StorageBackend = LocalStorage::new(dir.path().join("root")).unwrap().into();
        let path = request_path(&segments, leading_slash);
        let escaped = escapes(&segments);

        prop_assert_eq!(backend.is_path_allowed(&path), !escaped, "{}", path);
        if escaped {
            let err = runtime().block_on(backend.download_file(&path)).err().unwrap();
            prop_assert!(matches!(err, StorageError::AccessDenied(_)), "{}", path);
        }
    }

    #[test]
    fn object_backend_refuses_parent_segments(
        segments in prop::collection::vec(segment(), 0..8),
        leading_slash in any::<bool>(),
    ) {
        let backend: StorageBackend =
            ObjectStoreStorage::new(Arc::new(InMemory::new()), "memory", "bucket", "root").into();
        let path = request_path(&segments, leading_slash);
        let has_parent = segments.iter().any(|segment| segment == "..");

        prop_assert_eq!(backend.is_path_allowed(&path), !has_parent, "{}", path);
        if escapes(&segments) {
            prop_assert!(!backend.is_path_allowed(&path), "{}", path);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn uploaded_bytes_come_back_unchanged(
        data in prop::collection::vec(any::<u8>(), 0..20_000),
        piece in 1usize..4096,
    ) {
        let dir = TempDir::new().unwrap();
        let backends: Vec<StorageBackend> = vec![
            LocalStorage::new(dir.path().join("root")).unwrap().into(),
            ObjectStoreStorage::new(Arc::new(InMemory::new()), "memory", "bucket", "root").into(),
        ];

        let rt = runtime();
        for backend in &backends {
            let read = rt.block_on(async {
                backend
                    .upload_file("blobs/data.bin", stream_of(&data, piece))
                    .await
                    .unwrap();
                read_all(backend, "blobs/data.bin").await
            });
            prop_assert_eq!(&read, &data, "{}", backend.kind());
        }
    }
}
