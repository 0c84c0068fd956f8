//! Workspaces stored in redb survive closing and reopening.

use colab_sync::agent::{Agent, ChannelAgent};
use colab_sync::buffer::Encoding;
use colab_sync::config::SyncSettings;
use colab_sync::fingerprint::Fingerprint;
use colab_sync::patch::Patch;
use colab_sync::room::RoomManager;
use colab_sync::storage::{
    BufferRecord, RedbStore, RedbStoreOpener, StorePool, WorkspaceStore,
};
use std::sync::Arc;

fn manager(dir: &std::path::Path) -> RoomManager {
    let pool = StorePool::new(Arc::new(RedbStoreOpener::new(dir)), 4);
    RoomManager::new(pool, Arc::new(SyncSettings::default()))
}

#[tokio::test]
async fn test_store_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ws.redb");
    let store = RedbStore::open(&path).unwrap();

    let record = BufferRecord {
        id: 1,
        path: "notes/todo.txt".into(),
        deleted: false,
        md5: Fingerprint::of(b"milk\n"),
        encoding: Encoding::Utf8,
    };
    store.save(&record, Some(b"milk\n")).await.unwrap();
    store.put_meta("version", "7").await.unwrap();
    assert_eq!(store.load(1).await.unwrap(), b"milk\n");

    // Empty content drops the content key.
    store.save(&record, Some(b"")).await.unwrap();
    assert!(store.load(1).await.unwrap_err().is_not_found());

    store.save(&record, Some(b"eggs\n")).await.unwrap();
    store.delete(1).await.unwrap();
    assert!(store.records().await.unwrap().is_empty());
    assert!(store.load(1).await.unwrap_err().is_not_found());
    drop(store);

    let store = RedbStore::open(&path).unwrap();
    assert_eq!(store.get_meta("version").await.unwrap().as_deref(), Some("7"));
    assert_eq!(store.get_meta("missing").await.unwrap(), None);
}

#[tokio::test]
async fn test_workspace_reopens_from_disk() {
    let dir = tempfile::tempdir().unwrap();

    let version = {
        let manager = manager(dir.path());
        let room = manager.get_or_create_room(5).await.unwrap();
        let (alice, _rx) = ChannelAgent::new("alice", 64);
        let alice: Arc<dyn Agent> = alice;
        room.join(alice.clone()).await.unwrap();

        let buffer = room
            .create_buffer(Some(alice.id()), "src/lib.rs", Encoding::Utf8, b"fn main() {}\n".to_vec())
            .await
            .unwrap();
        room.create_buffer(Some(alice.id()), "logo.png", Encoding::Binary, vec![0x89, b'P', 0, 1])
            .await
            .unwrap();
        let patch = Patch::diff(b"fn main() {}\n", b"fn main() { run() }\n").to_text();
        room.patch(
            alice.id(),
            buffer.id(),
            &patch,
            &Fingerprint::of(b"fn main() {}\n"),
            &Fingerprint::of(b"fn main() { run() }\n"),
        )
        .await
        .unwrap();
        room.msg(alice.id(), "saving soon").await.unwrap();
        room.part(alice.id()).await.unwrap();

        assert_eq!(manager.cleanup_empty_rooms().await, vec![5]);
        room.version().await
    };

    let manager = manager(dir.path());
    let room = manager.get_or_create_room(5).await.unwrap();
    assert_eq!(room.version().await, version);
    assert_eq!(room.backlog().await.len(), 3);

    let paths: Vec<String> = room.paths().await.into_iter().map(|(p, _)| p).collect();
    assert_eq!(paths, vec!["logo.png".to_string(), "src/lib.rs".to_string()]);

    let source = room.buffer_by_path("src/lib.rs").await.unwrap();
    assert!(!source.is_loaded().await);
    assert_eq!(source.state().await.unwrap(), b"fn main() { run() }\n");
    assert_eq!(source.fingerprint().await, Fingerprint::of(b"fn main() { run() }\n"));

    let logo = room.buffer_by_path("logo.png").await.unwrap();
    assert_eq!(logo.encoding().await, Encoding::Binary);
    assert_eq!(logo.state().await.unwrap(), vec![0x89, b'P', 0, 1]);
}
