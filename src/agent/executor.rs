//! 任务执行
//!
//! 开始执行 → 启动文件监听 → 驱动适配器（含回退）→ 事件推送到广播中心，
//! 任何退出路径上都释放执行守卫并停止监听。
//!
//! 积压只属于产生它的那次执行：终止事件没有送达任何订阅者时，整段积压随之丢弃。

use std::sync::Arc;

use futures::StreamExt;

use super::registry::{CancelReason, ExecutionGuard, SessionRegistry};
use super::watcher::{ChangeCallback, ChangeKind, FilesCallback, WatchOptions, WorkspaceWatcher};
use crate::error::Result;
use crate::event::CanonicalEvent;
use crate::stream::TaskRequest;
use crate::workspace::compose_prompt;

/// 任务执行器
pub struct Executor {
    registry: Arc<SessionRegistry>,
}

impl Executor {
    pub fn new(registry: Arc<SessionRegistry>) -> Arc<Self> {
        Arc::new(Self { registry })
    }

    /// 提交任务：会话忙时立即返回 busy，否则在后台执行并返回执行 ID
    pub fn submit(&self, session_id: &str, prompt: &str) -> Result<u64> {
        let guard = self.registry.begin_execution(session_id)?;
        let execution_id = guard.execution_id();
        let registry = self.registry.clone();
        let prompt = prompt.to_string();

        tokio::spawn(async move {
            run_execution(registry, guard, prompt).await;
        });

        Ok(execution_id)
    }

    /// 提交任务并等待其结束，返回终止事件（取消且会话被清理时为 None）
    pub async fn run_to_completion(&self, session_id: &str, prompt: &str) -> Result<Option<CanonicalEvent>> {
        let guard = self.registry.begin_execution(session_id)?;
        Ok(run_execution(self.registry.clone(), guard, prompt.to_string()).await)
    }
}

async fn run_execution(
    registry: Arc<SessionRegistry>,
    guard: ExecutionGuard,
    prompt: String,
) -> Option<CanonicalEvent> {
    let state = guard.state().clone();
    let session_id = state.session_id().to_string();
    let config = registry.config().clone();
    let cancel = guard.cancel_token();

    tracing::info!("🚀 Execution {} started: session={}", guard.execution_id(), session_id);

    let workspace = state.workspace().clone();
    let include_context = config.include_file_context;
    let raw_prompt = prompt.clone();
    let composed = tokio::task::spawn_blocking(move || compose_prompt(&workspace, &raw_prompt, include_context))
        .await
        .unwrap_or(prompt);

    let task = TaskRequest::new(composed, state.workspace().clone())
        .with_permission_mode(state.permission_mode())
        .with_resume(state.resume_id());

    state.set_processing(true);
    let watcher = start_watcher(&registry, &session_id, state.workspace(), state.processing_flag(), &config);

    let mut events = state.adapter().run(task);
    let terminal = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break None,
            next = events.next() => match next {
                Some(event) if event.is_terminal() => break Some(event),
                Some(event) => {
                    registry.publish(&session_id, event);
                }
                None => break Some(CanonicalEvent::error("Agent stream ended without a result", None)),
            },
        }
    };
    // 丢弃序列即终止 Agent 进程
    drop(events);

    let reason = guard.cancel_reason();
    if terminal.is_none() {
        // 被取消：不再上报文件变化
        state.set_processing(false);
    }
    if let Some(watcher) = watcher {
        watcher.stop().await;
    }

    let terminal = match terminal {
        Some(event) => Some(event),
        None if reason == Some(CancelReason::Cleared) => None,
        None => Some(CanonicalEvent::error(
            "Execution cancelled",
            reason.map(|r| r.to_string()),
        )),
    };

    if let Some(event) = &terminal {
        state.record_outcome(event);
    }

    let execution_id = guard.execution_id();
    // 先释放执行状态，收到终止事件的客户端可以立即提交下一个任务
    drop(guard);

    match &terminal {
        Some(event) => {
            tracing::info!(
                "🏁 Execution {} finished with {}: session={}",
                execution_id,
                event.event_name(),
                session_id
            );
            registry.publish(&session_id, event.clone());
        }
        None => tracing::info!("🏁 Execution {} dropped with cleared session {}", execution_id, session_id),
    }

    terminal
}

fn start_watcher(
    registry: &Arc<SessionRegistry>,
    session_id: &str,
    workspace: &std::path::Path,
    processing: Arc<std::sync::atomic::AtomicBool>,
    config: &crate::config::StreamConfig,
) -> Option<WorkspaceWatcher> {
    let change_session = session_id.to_string();
    let on_change: ChangeCallback = Arc::new(move |kind: ChangeKind, path: String| {
        tracing::trace!("📝 {:?} {} (session={})", kind, path, change_session);
    });

    let files_registry = registry.clone();
    let files_session = session_id.to_string();
    let on_files: FilesCallback = Arc::new(move |event: CanonicalEvent| {
        files_registry.publish(&files_session, event);
    });

    let options = WatchOptions {
        poll_interval: config.poll_interval,
        ..Default::default()
    };

    match WorkspaceWatcher::start(workspace, options, processing, on_change, on_files) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            tracing::warn!("⚠️ Workspace watcher failed to start for {}: {}", session_id, e);
            None
        }
    }
}
