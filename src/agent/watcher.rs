//! 工作区文件监听
//!
//! 两条路径并行：
//! - OS 事件：notify 回调线程只把原始事件塞进有界通道，由运行时上的单个消费任务
//!   过滤后调用 `on_change`
//! - 快照轮询：每个间隔检查一次脏标志，上一个间隔内有 OS 事件才做完整快照，
//!   展示路径集合变化时发出一条 `FilesUpdated`（仅在 processing 标志置位时）
//!
//! OS 监听不可用或事件通道溢出时，每个间隔都做快照。

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::event::CanonicalEvent;
use crate::types::FileInfo;
use crate::workspace::{display_path, is_noise_path, relative_string, resolve_existing_prefix, snapshot};

/// 文件变化类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
    Other,
}

impl From<&EventKind> for ChangeKind {
    fn from(kind: &EventKind) -> Self {
        match kind {
            EventKind::Create(_) => ChangeKind::Created,
            EventKind::Modify(_) => ChangeKind::Modified,
            EventKind::Remove(_) => ChangeKind::Removed,
            _ => ChangeKind::Other,
        }
    }
}

/// 单个 OS 事件回调：(变化类型, 相对展示路径)
pub type ChangeCallback = Arc<dyn Fn(ChangeKind, String) + Send + Sync>;

/// 快照变化回调（收到 `FilesUpdated`）
pub type FilesCallback = Arc<dyn Fn(CanonicalEvent) + Send + Sync>;

/// 监听参数
#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub poll_interval: Duration,
    /// OS 事件通道容量，满了直接丢（快照轮询兜底）
    pub event_capacity: usize,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            event_capacity: 256,
        }
    }
}

/// 对比快照与基线，展示路径集合变化时返回 `FilesUpdated` 并替换基线
pub fn diff_snapshot(baseline: &mut BTreeSet<String>, files: Vec<FileInfo>) -> Option<CanonicalEvent> {
    let current: BTreeSet<String> = files.iter().map(|f| display_path(&f.path)).collect();
    if current == *baseline {
        return None;
    }

    let new_paths: Vec<String> = current.difference(baseline).cloned().collect();
    *baseline = current;
    Some(CanonicalEvent::FilesUpdated { files, new_paths })
}

/// OS 事件路径过滤：目录、噪音、越出工作区的路径返回 None
pub fn qualify_path(root: &Path, path: &Path) -> Option<String> {
    if path.is_dir() {
        return None;
    }

    let resolved = resolve_existing_prefix(path).ok()?;
    let relative = resolved.strip_prefix(root).ok()?;
    if relative.as_os_str().is_empty() || is_noise_path(relative) {
        return None;
    }

    Some(display_path(&relative_string(relative)))
}

/// 快照对比状态（轮询任务与 stop 共用）
struct Snapshotter {
    root: PathBuf,
    processing: Arc<AtomicBool>,
    /// 上次快照之后收到过 OS 事件
    dirty: Arc<AtomicBool>,
    /// OS 监听已生效；否则脏标志不可信，每次都遍历
    gated: bool,
    baseline: Mutex<BTreeSet<String>>,
    on_files: FilesCallback,
}

impl Snapshotter {
    /// 做一次快照对比并上报；`force` 忽略脏标志
    async fn scan(&self, force: bool) -> bool {
        if !self.processing.load(Ordering::SeqCst) {
            return false;
        }
        // 先清标志再遍历，遍历期间的新事件留给下一次
        let dirty = self.dirty.swap(false, Ordering::SeqCst);
        if self.gated && !force && !dirty {
            return false;
        }

        let walk_root = self.root.clone();
        let files = match tokio::task::spawn_blocking(move || snapshot(&walk_root)).await {
            Ok(files) => files,
            Err(e) => {
                tracing::warn!("⚠️ Snapshot task failed: {}", e);
                return false;
            }
        };
        let event = diff_snapshot(&mut self.baseline.lock(), files);
        match event {
            Some(event) => {
                tracing::debug!("📂 Workspace changed: {:?}", self.root);
                (self.on_files)(event);
                true
            }
            None => false,
        }
    }
}

/// 工作区监听器（每次执行一个）
pub struct WorkspaceWatcher {
    snapshots: Arc<Snapshotter>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    _os_watcher: Option<RecommendedWatcher>,
}

impl WorkspaceWatcher {
    /// 启动监听；OS 监听失败时只保留快照轮询
    pub fn start(
        root: &Path,
        options: WatchOptions,
        processing: Arc<AtomicBool>,
        on_change: ChangeCallback,
        on_files: FilesCallback,
    ) -> Result<Self> {
        let root = root.canonicalize()?;
        let cancel = CancellationToken::new();
        let dirty = Arc::new(AtomicBool::new(false));

        let initial: BTreeSet<String> = snapshot(&root)
            .iter()
            .map(|f| display_path(&f.path))
            .collect();

        let (tx, rx) = mpsc::channel::<notify::Event>(options.event_capacity.max(1));
        let os_watcher = match arm_os_watcher(&root, tx, dirty.clone()) {
            Ok(w) => Some(w),
            Err(e) => {
                tracing::warn!("⚠️ OS watch unavailable for {:?}, polling only: {}", root, e);
                None
            }
        };

        let snapshots = Arc::new(Snapshotter {
            root: root.clone(),
            processing,
            dirty: dirty.clone(),
            gated: os_watcher.is_some(),
            baseline: Mutex::new(initial),
            on_files,
        });

        let tasks = vec![
            tokio::spawn(consume_os_events(root.clone(), rx, on_change, dirty, cancel.clone())),
            tokio::spawn(poll_snapshots(snapshots.clone(), options.poll_interval, cancel.clone())),
        ];

        tracing::debug!("👁️ Watching workspace {:?}", root);

        Ok(Self {
            snapshots,
            cancel,
            tasks,
            _os_watcher: os_watcher,
        })
    }

    /// 立即做一次快照对比，不看脏标志（processing 置位时才上报）
    pub async fn flush(&self) {
        self.snapshots.scan(true).await;
    }

    /// 停止监听：先结束后台任务，再做最后一次快照对比
    pub async fn stop(mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        self.flush().await;
        tracing::debug!("👁️ Stopped watching {:?}", self.snapshots.root);
    }
}

impl Drop for WorkspaceWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn arm_os_watcher(
    root: &Path,
    tx: mpsc::Sender<notify::Event>,
    dirty: Arc<AtomicBool>,
) -> notify::Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
        Ok(event) => {
            // 回调线程不阻塞：满了就丢，由下一次快照兜底
            if tx.try_send(event).is_err() {
                dirty.store(true, Ordering::SeqCst);
                tracing::trace!("Watch channel full or closed, dropping event");
            }
        }
        Err(e) => {
            dirty.store(true, Ordering::SeqCst);
            tracing::warn!("⚠️ Watch error: {}", e);
        }
    })?;
    watcher.watch(root, RecursiveMode::Recursive)?;
    Ok(watcher)
}

async fn consume_os_events(
    root: PathBuf,
    mut rx: mpsc::Receiver<notify::Event>,
    on_change: ChangeCallback,
    dirty: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let kind = ChangeKind::from(&event.kind);
        if kind == ChangeKind::Other {
            continue;
        }
        // 目录删除不会留下可过滤的文件路径
        if kind == ChangeKind::Removed {
            dirty.store(true, Ordering::SeqCst);
        }
        for path in &event.paths {
            if let Some(relative) = qualify_path(&root, path) {
                dirty.store(true, Ordering::SeqCst);
                on_change(kind, relative);
            }
        }
    }
}

async fn poll_snapshots(snapshots: Arc<Snapshotter>, poll_interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // 第一次 tick 立即返回，跳过
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        snapshots.scan(false).await;
    }
}
