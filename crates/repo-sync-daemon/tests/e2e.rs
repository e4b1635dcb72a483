//! End-to-end tests for repo-sync-daemon.
//!
//! Drives the coordinator against a real vault directory, with the in-memory
//! store standing in for GitHub.

use std::sync::Arc;
use std::time::Duration;

use repo_sync_core::remote::RemoteCall;
use repo_sync_core::{ChangeKind, InMemoryRemote, Settings, SyncCoordinator};
use repo_sync_daemon::{FileEventKind, FileWatcher, NativeFs, StateStorage};
use tempfile::TempDir;
use tokio::time::timeout;

fn settings() -> Settings {
    Settings {
        owner: "octo".into(),
        repo: "notes".into(),
        branch: "main".into(),
        credential_material: "token".into(),
    }
}

fn coordinator(
    vault: &TempDir,
    remote: &Arc<InMemoryRemote>,
) -> SyncCoordinator<NativeFs, Arc<InMemoryRemote>> {
    SyncCoordinator::new(
        settings(),
        NativeFs::new(vault.path().to_path_buf()),
        Arc::clone(remote),
    )
    .expect("valid settings")
}

// ============================================================================
// Coordinator over a real vault
// ============================================================================

#[tokio::test]
async fn test_pull_materializes_remote_tree() {
    let vault = TempDir::new().expect("Failed to create temp dir");
    let remote = Arc::new(InMemoryRemote::new());
    remote.commit_files(
        &[("README.md", Some("# Notes\n")), ("daily/2024-01-01.md", Some("today"))],
        "seed",
    );

    let coordinator = coordinator(&vault, &remote);
    let report = coordinator.pull().await.expect("pull");

    assert_eq!(report.written, 2);
    assert_eq!(
        std::fs::read_to_string(vault.path().join("daily/2024-01-01.md")).unwrap(),
        "today"
    );

    // Removed upstream, removed locally
    remote.commit_files(&[("README.md", None)], "drop readme");
    let report = coordinator.pull().await.expect("second pull");
    assert_eq!(report.deleted, 1);
    assert!(!vault.path().join("README.md").exists());
}

#[tokio::test]
async fn test_pull_replaces_file_with_directory() {
    let vault = TempDir::new().expect("Failed to create temp dir");
    let remote = Arc::new(InMemoryRemote::new());
    remote.commit_files(&[("a", Some("plain file"))], "seed");

    let coordinator = coordinator(&vault, &remote);
    coordinator.pull().await.expect("pull");
    assert!(vault.path().join("a").is_file());

    remote.commit_files(&[("a", None), ("a/b.md", Some("nested"))], "file to dir");
    let report = coordinator.pull().await.expect("second pull");

    assert!(report.failed.is_empty(), "failed: {:?}", report.failed);
    assert_eq!((report.written, report.deleted), (1, 1));
    assert_eq!(
        std::fs::read_to_string(vault.path().join("a/b.md")).unwrap(),
        "nested"
    );
}

#[tokio::test]
async fn test_pull_replaces_directory_with_file() {
    let vault = TempDir::new().expect("Failed to create temp dir");
    let remote = Arc::new(InMemoryRemote::new());
    remote.commit_files(&[("a/b.md", Some("nested"))], "seed");

    let coordinator = coordinator(&vault, &remote);
    coordinator.pull().await.expect("pull");
    assert!(vault.path().join("a").is_dir());

    remote.commit_files(&[("a/b.md", None), ("a", Some("plain file"))], "dir to file");
    let report = coordinator.pull().await.expect("second pull");

    assert!(report.failed.is_empty(), "failed: {:?}", report.failed);
    assert_eq!((report.written, report.deleted), (1, 1));
    assert_eq!(
        std::fs::read_to_string(vault.path().join("a")).unwrap(),
        "plain file"
    );
}

#[tokio::test]
async fn test_local_edits_round_trip_to_remote() {
    let vault = TempDir::new().expect("Failed to create temp dir");
    let remote = Arc::new(InMemoryRemote::new());
    remote.commit_files(&[("a.md", Some("v1"))], "seed");

    let coordinator = coordinator(&vault, &remote);
    coordinator.pull().await.expect("pull");

    std::fs::write(vault.path().join("a.md"), "v2").unwrap();
    std::fs::write(vault.path().join("b.md"), "new").unwrap();
    coordinator.record_change("a.md", ChangeKind::Update);
    coordinator.record_change("b.md", ChangeKind::Create);

    let outcome = coordinator.push().await.expect("push");

    assert_eq!(outcome.paths, vec!["a.md", "b.md"]);
    assert_eq!(remote.file("a.md").unwrap(), b"v2");
    assert_eq!(remote.file("b.md").unwrap(), b"new");
    assert_eq!(
        remote.message_of(&remote.head()).unwrap(),
        "updated a.md, b.md"
    );
}

#[tokio::test]
async fn test_pulled_files_do_not_echo_back() {
    let vault = TempDir::new().expect("Failed to create temp dir");
    let remote = Arc::new(InMemoryRemote::new());
    remote.commit_files(&[("a.md", Some("remote"))], "seed");

    let coordinator = coordinator(&vault, &remote);
    coordinator.pull().await.expect("pull");
    remote.clear_calls();

    // The watcher would report the file the pull just wrote
    coordinator.record_change("a.md", ChangeKind::Update);
    let outcome = coordinator.push().await.expect("push");

    assert!(outcome.commit.is_none());
    assert_eq!(remote.mutation_count(), 0);
}

#[tokio::test]
async fn test_restart_resumes_from_saved_state() {
    let vault = TempDir::new().expect("Failed to create temp dir");
    let remote = Arc::new(InMemoryRemote::new());
    remote.commit_files(&[("a.md", Some("a"))], "seed");
    let storage = StateStorage::in_vault(vault.path());

    {
        let coordinator = coordinator(&vault, &remote);
        coordinator.pull().await.expect("pull");
        storage.save(&coordinator.to_state().await).unwrap();
    }

    let state = storage.load().unwrap();
    assert!(state.initialised);
    let resumed = SyncCoordinator::from_state(
        state,
        NativeFs::new(vault.path().to_path_buf()),
        Arc::clone(&remote),
    )
    .expect("valid state");
    remote.clear_calls();

    // Nothing moved while we were away: only the reference is checked
    resumed.pull().await.expect("pull after restart");
    assert_eq!(remote.calls(), vec![RemoteCall::GetReference]);
}

// ============================================================================
// File Watcher Tests
// ============================================================================

/// Test file watcher reports edits to any non-hidden file.
#[tokio::test]
async fn test_file_watcher_detects_changes() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let vault_path = temp_dir.path().to_path_buf();

    let sync_dir = vault_path.join(".sync");
    std::fs::create_dir_all(&sync_dir).expect("Failed to create .sync dir");

    let mut watcher = FileWatcher::new(vault_path.clone()).expect("Failed to create watcher");

    // Give watcher time to fully initialize - FSEvents on macOS needs time
    tokio::time::sleep(Duration::from_millis(500)).await;

    // State file writes must not be reported
    std::fs::write(sync_dir.join("state.json"), "{}").expect("Failed to write state file");

    tokio::time::sleep(Duration::from_millis(200)).await;
    let test_file = vault_path.join("image.png");
    std::fs::write(&test_file, [0u8, 1, 2]).expect("Failed to write file");

    // Force a second modification to trigger FSEvents reliably
    tokio::time::sleep(Duration::from_millis(100)).await;
    std::fs::write(&test_file, [3u8, 4, 5]).expect("Failed to modify file");

    // Wait for event - FSEvents + debounce can take several seconds
    let event = timeout(Duration::from_secs(10), watcher.event_rx().recv())
        .await
        .expect("Timeout waiting for file event")
        .expect("No event received");

    assert_eq!(event.path, "image.png", "Should detect image.png, not .sync file");
    assert_eq!(event.kind, FileEventKind::Modified);
}

/// Test renaming a folder reports the files it carried, at both locations.
#[tokio::test]
async fn test_file_watcher_expands_renamed_directory() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let vault_path = temp_dir.path().to_path_buf();
    std::fs::create_dir_all(vault_path.join("drafts/ideas")).unwrap();
    std::fs::write(vault_path.join("drafts/a.md"), "a").unwrap();
    std::fs::write(vault_path.join("drafts/ideas/b.md"), "b").unwrap();

    let mut watcher = FileWatcher::new(vault_path.clone()).expect("Failed to create watcher");
    tokio::time::sleep(Duration::from_millis(500)).await;

    std::fs::rename(vault_path.join("drafts"), vault_path.join("published"))
        .expect("Failed to rename folder");

    let expected = [
        ("drafts/a.md", FileEventKind::Deleted),
        ("drafts/ideas/b.md", FileEventKind::Deleted),
        ("published/a.md", FileEventKind::Modified),
        ("published/ideas/b.md", FileEventKind::Modified),
    ];
    let mut seen = Vec::new();
    let collected = timeout(Duration::from_secs(10), async {
        while !expected
            .iter()
            .all(|(path, kind)| seen.iter().any(|(p, k)| p == path && k == kind))
        {
            match watcher.event_rx().recv().await {
                Some(event) => seen.push((event.path, event.kind)),
                None => break,
            }
        }
    })
    .await;

    assert!(collected.is_ok(), "missing events, saw {:?}", seen);
}
