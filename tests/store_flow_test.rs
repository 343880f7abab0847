//! End-to-end flows through the public API: upload, offload, download,
//! backup and cold-start restore against the directory-backed remote.

use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tstore::metadata::{FileState, JsonStore, MetadataStore};
use tstore::transport::{LocalDirTransport, MemoryTransport, RemoteTransport};
use tstore::{App, Config};

fn config(root: &TempDir, chunk_size: usize) -> Config {
    let sync = root.path().join("sync");
    fs::create_dir_all(&sync).unwrap();
    Config {
        sync_folder: sync,
        destination: "me".to_string(),
        chunk_size,
        backup_debounce_secs: 3600,
        stability_delay_ms: 100,
        remote_dir: root.path().join("remote"),
        metadata_path: Some(root.path().join("index").join("metadata.json")),
    }
}

fn sample(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

// =============================================================================
// Directory-backed remote
// =============================================================================

#[tokio::test]
async fn test_roundtrip_through_local_remote() {
    let root = TempDir::new().unwrap();
    let app = App::open(config(&root, 1000)).await.unwrap();

    let content = sample(4321);
    let src = root.path().join("photo.raw");
    fs::write(&src, &content).unwrap();

    let uploaded = app
        .engine()
        .upload(&src, |_| {}, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(uploaded.chunk_ids.len(), 5);
    assert_eq!(uploaded.size, 4321);

    app.engine().offload("photo.raw").await.unwrap();
    let local = root.path().join("sync").join("photo.raw");
    assert!(!local.exists());

    let downloaded = app
        .engine()
        .download("photo.raw", |_| {}, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(downloaded.state, FileState::Local);
    assert_eq!(fs::read(&local).unwrap(), content);
    assert_eq!(
        blake3::hash(&content).to_hex().to_string(),
        downloaded.checksum
    );

    // Chunks are content-addressed on disk
    for id in &uploaded.chunk_ids {
        assert!(root.path().join("remote").join("objects").join(id).exists());
    }
}

#[tokio::test]
async fn test_cold_start_restores_pinned_index() {
    let root = TempDir::new().unwrap();
    let cfg = config(&root, 64);

    {
        let app = App::open(cfg.clone()).await.unwrap();
        for name in ["a.txt", "b.txt", "c.txt"] {
            let src = root.path().join(name);
            fs::write(&src, name.repeat(50)).unwrap();
            app.engine()
                .upload(&src, |_| {}, &CancellationToken::new())
                .await
                .unwrap();
        }
        app.engine().offload("b.txt").await.unwrap();
        app.update_description("c.txt", "third").await.unwrap();
        app.shutdown().await.unwrap();
    }

    // Lose the local index entirely
    fs::remove_dir_all(root.path().join("index")).unwrap();

    let app = App::open(cfg).await.unwrap();
    assert!(app.engine().list().await.unwrap().is_empty());
    app.bootstrap().await.unwrap();

    let records = app.engine().list().await.unwrap();
    let names: Vec<&str> = records.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["a.txt", "b.txt", "c.txt"]);
    assert_eq!(records[1].state, FileState::Cloud);
    assert_eq!(records[2].description, "third");

    // The restored b.txt can be fetched back
    app.engine()
        .download("b.txt", |_| {}, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        fs::read_to_string(root.path().join("sync").join("b.txt")).unwrap(),
        "b.txt".repeat(50)
    );
}

#[tokio::test]
async fn test_only_latest_backup_stays_pinned() {
    let root = TempDir::new().unwrap();
    let transport = LocalDirTransport::open(root.path().join("remote"))
        .await
        .unwrap();
    let index = root.path().join("metadata.json");
    fs::write(&index, b"[]").unwrap();

    let (first, _) = transport.send_file("me", &index, "one").await.unwrap();
    transport.pin("me", first).await.unwrap();
    let (second, second_id) = transport.send_file("me", &index, "two").await.unwrap();
    transport.pin("me", second).await.unwrap();
    transport.unpin("me", first).await.unwrap();

    assert_eq!(transport.pinned_chunk_id("me").await.unwrap(), second_id);
    assert!(transport.unpin("me", first).await.is_err());
}

// =============================================================================
// In-memory remote
// =============================================================================

fn memory_app(root: &TempDir, chunk_size: usize) -> (App, Arc<MemoryTransport>) {
    let cfg = config(root, chunk_size);
    let transport = Arc::new(MemoryTransport::new());
    let store = Arc::new(JsonStore::open(cfg.metadata_path.clone().unwrap()).unwrap());
    (App::with_parts(cfg, transport.clone(), store), transport)
}

#[tokio::test]
async fn test_progress_is_monotone_and_ends_at_100() {
    let root = TempDir::new().unwrap();
    let (app, _) = memory_app(&root, 100);
    let src = root.path().join("big.bin");
    fs::write(&src, sample(1050)).unwrap();

    let mut up = Vec::new();
    app.engine()
        .upload(&src, |p| up.push(p), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(up.len(), 11);
    assert!(up.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(up.last().copied(), Some(100.0));

    fs::remove_file(root.path().join("sync").join("big.bin")).unwrap();
    let mut down = Vec::new();
    app.engine()
        .download("big.bin", |p| down.push(p), &CancellationToken::new())
        .await
        .unwrap();
    assert!(down.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(down.last().copied(), Some(100.0));
}

#[tokio::test]
async fn test_cancel_midway_leaves_no_record() {
    let root = TempDir::new().unwrap();
    let (app, transport) = memory_app(&root, 10);
    let src = root.path().join("slow.bin");
    fs::write(&src, sample(100)).unwrap();

    let cancel = CancellationToken::new();
    let mut calls = 0;
    let err = app
        .engine()
        .upload(
            &src,
            |_| {
                calls += 1;
                if calls == 3 {
                    cancel.cancel();
                }
            },
            &cancel,
        )
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(transport.chunk_sends(), 3);
    assert!(app.engine().list().await.unwrap().is_empty());
    assert!(src.exists());
}

#[tokio::test]
async fn test_mutation_burst_backs_up_once() {
    let root = TempDir::new().unwrap();
    let mut cfg = config(&root, 16);
    cfg.backup_debounce_secs = 1;
    let transport = Arc::new(MemoryTransport::new());
    let store: Arc<dyn MetadataStore> =
        Arc::new(JsonStore::open(cfg.metadata_path.clone().unwrap()).unwrap());
    let app = App::with_parts(cfg, transport.clone(), store);

    let src = root.path().join("x.txt");
    fs::write(&src, b"some bytes").unwrap();
    app.engine()
        .upload(&src, |_| {}, &CancellationToken::new())
        .await
        .unwrap();
    for text in ["one", "two", "three"] {
        app.update_description("x.txt", text).await.unwrap();
    }
    assert_eq!(transport.file_sends(), 0);

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(transport.file_sends(), 1);
    assert_eq!(transport.pinned("me").len(), 1);
}
