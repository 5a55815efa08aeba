//! End-to-end tests of the coordinator over an in-memory transport.
//!
//! Run with: `cargo test --test coordinator_integration`

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use shardfetch::import::sha256_hex;
use shardfetch::{
    ArchiveImporter, ByteChunks, CoordinatorEvent, DirectoryImporter, DownloaderConfig,
    MemoryResource, MemoryTransport, RetryPolicy, Task, TaskCoordinator, TaskId, ValidationError,
};

// ============================================================================
// Helpers
// ============================================================================

fn url(id: u32) -> String {
    format!("https://example.com/{}.tar.lz4", id)
}

fn archive(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 29 % 251) as u8).collect()
}

fn config(dir: &Path) -> DownloaderConfig {
    DownloaderConfig::new(dir)
        .with_chunk_limit(24)
        .with_retry(RetryPolicy::fixed(4, Duration::from_millis(1)))
}

#[derive(Default)]
struct Recorder {
    imported: Mutex<Vec<(TaskId, Vec<u8>)>>,
}

impl ArchiveImporter for Recorder {
    fn validate_and_import(&self, task: &Task, content: ByteChunks) -> Result<(), ValidationError> {
        let data = shardfetch::store::read_all(content)?;
        self.imported.lock().unwrap().push((task.id, data));
        Ok(())
    }
}

fn drain(events: &mut tokio::sync::broadcast::Receiver<CoordinatorEvent>) -> Vec<CoordinatorEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_pause_and_resume_through_coordinator() {
    let dir = tempfile::tempdir().unwrap();
    let data = archive(120);
    let transport = Arc::new(MemoryTransport::new());
    transport.insert(
        &url(1),
        MemoryResource::new(data.clone())
            .with_piece_size(10)
            .with_read_delay(Duration::from_millis(5)),
    );
    let recorder = Arc::new(Recorder::default());
    let coordinator = TaskCoordinator::open(config(dir.path()), transport.clone(), recorder.clone()).unwrap();
    let mut events = coordinator.subscribe();

    assert!(!coordinator.pause());
    assert!(coordinator.add(1, &url(1)));
    assert!(coordinator.start());

    let mut progress = coordinator.progress();
    progress
        .wait_for(|state| state.as_ref().map_or(false, |s| s.downloaded_size >= 30))
        .await
        .unwrap();

    assert!(coordinator.pause());
    assert!(!coordinator.pause());
    assert!(coordinator.is_paused());
    assert!(!coordinator.add(2, &url(2)));

    progress
        .wait_for(|state| state.as_ref().map_or(false, |s| s.paused))
        .await
        .unwrap();
    assert!(coordinator.resume());
    assert!(!coordinator.resume());
    coordinator.wait_idle().await;

    assert_eq!(recorder.imported.lock().unwrap().clone(), vec![(TaskId::new(1), data)]);
    assert_eq!(transport.get_offsets(&url(1)).len(), 2);

    let events = drain(&mut events);
    assert!(events.contains(&CoordinatorEvent::Paused));
    assert!(events.contains(&CoordinatorEvent::Resumed));
    assert_eq!(events.last(), Some(&CoordinatorEvent::Idle));
}

#[tokio::test]
async fn test_ignored_range_restarts_archive() {
    let dir = tempfile::tempdir().unwrap();
    let data = archive(90);
    let transport = Arc::new(MemoryTransport::new());
    transport.insert(
        &url(4),
        MemoryResource::new(data.clone())
            .ignoring_range()
            .with_piece_size(10)
            .with_disconnects(35, 1),
    );
    let recorder = Arc::new(Recorder::default());
    let coordinator = TaskCoordinator::open(config(dir.path()), transport.clone(), recorder.clone()).unwrap();

    assert!(coordinator.add(4, &url(4)));
    assert!(coordinator.start());
    coordinator.wait_idle().await;

    // The reconnect asks for byte 35 but receives the whole archive again.
    assert_eq!(transport.get_offsets(&url(4)), vec![0, 35]);
    assert_eq!(recorder.imported.lock().unwrap().clone(), vec![(TaskId::new(4), data)]);
}

#[tokio::test]
async fn test_flaky_server_completes_with_each_range_requested_once() {
    let dir = tempfile::tempdir().unwrap();
    let data = archive(200);
    let transport = Arc::new(MemoryTransport::new());
    transport.insert(
        &url(8),
        MemoryResource::new(data.clone())
            .with_piece_size(7)
            .with_disconnects(30, 5),
    );
    let recorder = Arc::new(Recorder::default());
    let coordinator = TaskCoordinator::open(config(dir.path()), transport.clone(), recorder.clone()).unwrap();

    assert!(coordinator.add(8, &url(8)));
    assert!(coordinator.start());
    coordinator.wait_idle().await;

    assert_eq!(
        transport.get_offsets(&url(8)),
        vec![0, 30, 60, 90, 120, 150]
    );
    assert_eq!(recorder.imported.lock().unwrap().clone(), vec![(TaskId::new(8), data)]);
}

#[tokio::test]
async fn test_concurrent_add_while_active_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(MemoryTransport::new());
    transport.insert(
        &url(1),
        MemoryResource::new(archive(80))
            .with_piece_size(8)
            .with_read_delay(Duration::from_millis(5)),
    );
    let coordinator =
        TaskCoordinator::open(config(dir.path()), transport, Arc::new(Recorder::default())).unwrap();
    assert!(coordinator.add(1, &url(1)));
    assert!(coordinator.start());

    let handles: Vec<_> = (100..116)
        .map(|id| {
            let coordinator = coordinator.clone();
            std::thread::spawn(move || coordinator.add(id, &url(id)))
        })
        .collect();
    for handle in handles {
        assert!(!handle.join().unwrap());
    }

    coordinator.wait_idle().await;
    assert!(coordinator.pending().is_empty());
}

#[tokio::test]
async fn test_directory_importer_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let good = archive(64);
    let bad = archive(48);
    let transport = Arc::new(MemoryTransport::new());
    transport.insert(&url(1), MemoryResource::new(good.clone()));
    transport.insert(&url(2), MemoryResource::new(bad));

    let shards = dir.path().join("shards");
    let importer = DirectoryImporter::new(&shards)
        .with_expected_digest(TaskId::new(1), sha256_hex(&good))
        .with_expected_digest(TaskId::new(2), sha256_hex(b"something else"));
    let coordinator =
        TaskCoordinator::open(config(&dir.path().join("state")), transport.clone(), Arc::new(importer.clone()))
            .unwrap();
    let mut events = coordinator.subscribe();

    assert!(coordinator.add(1, &url(1)));
    assert!(coordinator.add(2, &url(2)));
    assert!(coordinator.start());
    coordinator.wait_idle().await;

    assert_eq!(std::fs::read(importer.archive_path(TaskId::new(1))).unwrap(), good);
    assert!(!importer.archive_path(TaskId::new(2)).exists());

    // Shard 2 is downloaded twice, then dropped.
    assert_eq!(transport.get_offsets(&url(2)), vec![0, 0]);
    let failed: Vec<TaskId> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            CoordinatorEvent::TaskFailed { task, .. } => Some(task),
            _ => None,
        })
        .collect();
    assert_eq!(failed, vec![TaskId::new(2)]);
    assert!(coordinator.pending().is_empty());
}

#[tokio::test]
async fn test_unreachable_head_task_does_not_starve_queue() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(MemoryTransport::new());
    transport.insert(
        &url(1),
        MemoryResource::new(archive(40)).with_refused_connections(u32::MAX),
    );
    transport.insert(&url(2), MemoryResource::new(archive(60)).with_piece_size(7));
    let recorder = Arc::new(Recorder::default());

    let coordinator =
        TaskCoordinator::open(config(dir.path()), transport.clone(), recorder.clone()).unwrap();
    let mut events = coordinator.subscribe();
    assert!(coordinator.add(1, &url(1)));
    assert!(coordinator.add(2, &url(2)));
    assert!(coordinator.start());
    coordinator.wait_idle().await;

    assert_eq!(
        *recorder.imported.lock().unwrap(),
        vec![(TaskId::new(2), archive(60))]
    );
    let pending: Vec<u32> = coordinator.pending().iter().map(|task| task.id.value()).collect();
    assert_eq!(pending, vec![1]);

    let events = drain(&mut events);
    assert!(events.iter().any(|event| matches!(
        event,
        CoordinatorEvent::TaskDeferred { task, .. } if *task == TaskId::new(1)
    )));
    assert!(!events
        .iter()
        .any(|event| matches!(event, CoordinatorEvent::TaskFailed { .. })));
    assert!(matches!(
        events.iter().rev().nth(1),
        Some(CoordinatorEvent::Halted { task, .. }) if *task == TaskId::new(1)
    ));
    assert_eq!(events.last(), Some(&CoordinatorEvent::Idle));
}
