//! 工作区监听集成测试

#[cfg(feature = "agent")]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::time::Duration;

    use ai_cli_task_stream::agent::{ChangeCallback, ChangeKind, FilesCallback, WatchOptions, WorkspaceWatcher};
    use ai_cli_task_stream::CanonicalEvent;
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use tokio::time::{sleep, timeout};

    struct Harness {
        watcher: WorkspaceWatcher,
        changes: mpsc::UnboundedReceiver<(ChangeKind, String)>,
        files: mpsc::UnboundedReceiver<CanonicalEvent>,
    }

    fn start(tmp: &TempDir, poll: Duration, processing: bool) -> Harness {
        let (change_tx, changes) = mpsc::unbounded_channel();
        let (files_tx, files) = mpsc::unbounded_channel();

        let on_change: ChangeCallback = Arc::new(move |kind: ChangeKind, path: String| {
            let _ = change_tx.send((kind, path));
        });
        let on_files: FilesCallback = Arc::new(move |event: CanonicalEvent| {
            let _ = files_tx.send(event);
        });

        let options = WatchOptions {
            poll_interval: poll,
            ..Default::default()
        };
        let watcher = WorkspaceWatcher::start(
            tmp.path(),
            options,
            Arc::new(AtomicBool::new(processing)),
            on_change,
            on_files,
        )
        .unwrap();

        Harness {
            watcher,
            changes,
            files,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<CanonicalEvent>) -> Vec<CanonicalEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_burst_is_coalesced() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("existing.txt"), "x").unwrap();
        // 轮询间隔远大于测试时长：整个突发落在同一个窗口里
        let mut h = start(&tmp, Duration::from_secs(60), true);

        for i in 0..20 {
            std::fs::write(tmp.path().join(format!("file-{:02}.txt", i)), "data").unwrap();
        }
        h.watcher.stop().await;

        let events = drain(&mut h.files);
        match events.as_slice() {
            [CanonicalEvent::FilesUpdated { files, new_paths }] => {
                let expected: Vec<String> = (0..20).map(|i| format!("file-{:02}.txt", i)).collect();
                assert_eq!(new_paths, &expected);
                assert_eq!(files.len(), 21);
            }
            other => panic!("Expected one files_updated, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_burst_across_windows_reports_every_path_once() {
        let tmp = TempDir::new().unwrap();
        let mut h = start(&tmp, Duration::from_millis(100), true);

        for i in 0..20 {
            std::fs::write(tmp.path().join(format!("file-{:02}.txt", i)), "data").unwrap();
        }
        sleep(Duration::from_millis(400)).await;
        h.watcher.stop().await;

        let mut seen = BTreeSet::new();
        for event in drain(&mut h.files) {
            match event {
                CanonicalEvent::FilesUpdated { new_paths, .. } => {
                    for path in new_paths {
                        assert!(seen.insert(path.clone()), "{} reported twice", path);
                    }
                }
                other => panic!("Unexpected event {:?}", other),
            }
        }
        assert_eq!(seen.len(), 20);
    }

    #[tokio::test]
    async fn test_idle_session_reports_nothing() {
        let tmp = TempDir::new().unwrap();
        let mut h = start(&tmp, Duration::from_millis(50), false);

        std::fs::write(tmp.path().join("quiet.txt"), "x").unwrap();
        sleep(Duration::from_millis(300)).await;
        h.watcher.stop().await;

        assert!(drain(&mut h.files).is_empty());
    }

    #[tokio::test]
    async fn test_stop_flushes_pending_change() {
        let tmp = TempDir::new().unwrap();
        let mut h = start(&tmp, Duration::from_secs(60), true);

        std::fs::create_dir_all(tmp.path().join("src")).unwrap();
        std::fs::write(tmp.path().join("src/main.rs"), "fn main() {}").unwrap();
        h.watcher.stop().await;

        let events = drain(&mut h.files);
        match events.as_slice() {
            [CanonicalEvent::FilesUpdated { files, new_paths }] => {
                assert_eq!(new_paths, &vec!["src/main.rs".to_string()]);
                assert!(files.iter().any(|f| f.path == "src/main.rs"));
            }
            other => panic!("Expected one files_updated, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_noise_files_are_ignored() {
        let tmp = TempDir::new().unwrap();
        let mut h = start(&tmp, Duration::from_secs(60), true);

        std::fs::create_dir_all(tmp.path().join(".git")).unwrap();
        std::fs::write(tmp.path().join(".git/HEAD"), "ref").unwrap();
        std::fs::write(tmp.path().join(".DS_Store"), "").unwrap();
        h.watcher.stop().await;

        assert!(drain(&mut h.files).is_empty());
    }

    #[tokio::test]
    async fn test_os_events_reach_change_callback() {
        let tmp = TempDir::new().unwrap();
        let mut h = start(&tmp, Duration::from_secs(60), true);

        std::fs::write(tmp.path().join("note.txt"), "hello").unwrap();

        let seen = timeout(Duration::from_secs(3), async {
            while let Some((kind, path)) = h.changes.recv().await {
                if path == "note.txt" {
                    return Some(kind);
                }
            }
            None
        })
        .await
        .unwrap();
        assert!(matches!(seen, Some(ChangeKind::Created) | Some(ChangeKind::Modified)));

        h.watcher.stop().await;
    }
}
