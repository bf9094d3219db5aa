//! 会话注册表
//!
//! 会话生命周期、每会话至多一个执行中的任务、取消与清理。
//! 执行状态的转换只在这里发生；订阅者集合归 [`EventHub`] 所有。

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use super::broadcaster::{EventHub, SubscriberId, Subscription};
use crate::config::StreamConfig;
use crate::error::{Error, Result};
use crate::event::CanonicalEvent;
use crate::stream::FallbackCoordinator;
use crate::types::{PermissionMode, SessionSummary};
use crate::workspace::validate_session_id;

/// 取消原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// 所有订阅者都断开
    Disconnected,
    /// 会话被清理
    Cleared,
    /// 客户端显式取消
    Requested,
    /// 守护进程退出
    Shutdown,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Disconnected => write!(f, "all subscribers disconnected"),
            CancelReason::Cleared => write!(f, "session cleared"),
            CancelReason::Requested => write!(f, "cancelled by request"),
            CancelReason::Shutdown => write!(f, "agent shutting down"),
        }
    }
}

struct ActiveExecution {
    id: u64,
    cancel: CancellationToken,
    reason: Option<CancelReason>,
}

/// 会话状态
pub struct SessionState {
    session_id: String,
    workspace: PathBuf,
    created_at: DateTime<Utc>,
    permission_mode: RwLock<PermissionMode>,
    execution: Mutex<Option<ActiveExecution>>,
    /// 执行进行中（文件监听据此决定是否上报）
    processing: Arc<AtomicBool>,
    /// 上一次成功执行的 Agent 会话 ID
    resume_id: Mutex<Option<String>>,
    last_activity: Mutex<Instant>,
    adapter: FallbackCoordinator,
}

impl SessionState {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// 工作区根目录（创建后不变）
    pub fn workspace(&self) -> &PathBuf {
        &self.workspace
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn permission_mode(&self) -> PermissionMode {
        *self.permission_mode.read()
    }

    pub fn is_executing(&self) -> bool {
        self.execution.lock().is_some()
    }

    pub fn processing_flag(&self) -> Arc<AtomicBool> {
        self.processing.clone()
    }

    pub fn set_processing(&self, active: bool) {
        self.processing.store(active, Ordering::SeqCst);
    }

    pub fn resume_id(&self) -> Option<String> {
        self.resume_id.lock().clone()
    }

    /// 根据终止事件更新续接 ID：带 Agent 会话 ID 的 Success 记下，任何 Error 清除
    pub fn record_outcome(&self, terminal: &CanonicalEvent) {
        let mut resume = self.resume_id.lock();
        match terminal {
            CanonicalEvent::Success { metadata, .. } => {
                if let Some(id) = &metadata.session_id {
                    *resume = Some(id.clone());
                }
            }
            CanonicalEvent::Error { .. } => *resume = None,
            _ => {}
        }
    }

    pub fn adapter(&self) -> &FallbackCoordinator {
        &self.adapter
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn begin(&self, id: u64) -> Result<CancellationToken> {
        let mut slot = self.execution.lock();
        if slot.is_some() {
            return Err(Error::SessionBusy(self.session_id.clone()));
        }
        let cancel = CancellationToken::new();
        *slot = Some(ActiveExecution {
            id,
            cancel: cancel.clone(),
            reason: None,
        });
        drop(slot);
        self.touch();
        Ok(cancel)
    }

    fn end(&self, id: u64) -> bool {
        let mut slot = self.execution.lock();
        match slot.as_ref() {
            Some(active) if active.id == id => {
                *slot = None;
                drop(slot);
                self.set_processing(false);
                self.touch();
                true
            }
            _ => false,
        }
    }

    fn cancel(&self, reason: CancelReason) -> bool {
        let mut slot = self.execution.lock();
        match slot.as_mut() {
            Some(active) => {
                if active.reason.is_none() {
                    active.reason = Some(reason);
                }
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    fn cancel_reason(&self, id: u64) -> Option<CancelReason> {
        self.execution
            .lock()
            .as_ref()
            .filter(|a| a.id == id)
            .and_then(|a| a.reason)
    }
}

/// 执行守卫：drop 时结束执行（包括取消和 panic 路径）
pub struct ExecutionGuard {
    state: Arc<SessionState>,
    execution_id: u64,
    cancel: CancellationToken,
}

impl ExecutionGuard {
    pub fn execution_id(&self) -> u64 {
        self.execution_id
    }

    pub fn state(&self) -> &Arc<SessionState> {
        &self.state
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel_reason(&self) -> Option<CancelReason> {
        self.state.cancel_reason(self.execution_id)
    }
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        if self.state.end(self.execution_id) {
            tracing::debug!(
                "🏁 Execution {} ended: session={}",
                self.execution_id,
                self.state.session_id
            );
        }
    }
}

/// 会话注册表
pub struct SessionRegistry {
    config: Arc<StreamConfig>,
    hub: Arc<EventHub>,
    sessions: RwLock<HashMap<String, Arc<SessionState>>>,
    next_execution_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new(config: Arc<StreamConfig>, hub: Arc<EventHub>) -> Arc<Self> {
        Arc::new(Self {
            config,
            hub,
            sessions: RwLock::new(HashMap::new()),
            next_execution_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &Arc<StreamConfig> {
        &self.config
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    /// 获取或创建会话；已存在时只更新权限模式
    pub fn start(&self, session_id: &str, permission_mode: PermissionMode) -> Result<Arc<SessionState>> {
        validate_session_id(session_id)?;

        if let Some(state) = self.sessions.read().get(session_id) {
            *state.permission_mode.write() = permission_mode;
            state.touch();
            return Ok(state.clone());
        }

        let mut sessions = self.sessions.write();
        if let Some(state) = sessions.get(session_id) {
            *state.permission_mode.write() = permission_mode;
            state.touch();
            return Ok(state.clone());
        }

        let workspace = self.config.workspace_base.join(session_id);
        std::fs::create_dir_all(&workspace)?;

        let state = Arc::new(SessionState {
            session_id: session_id.to_string(),
            workspace,
            created_at: Utc::now(),
            permission_mode: RwLock::new(permission_mode),
            execution: Mutex::new(None),
            processing: Arc::new(AtomicBool::new(false)),
            resume_id: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
            adapter: FallbackCoordinator::from_config(self.config.clone()),
        });
        sessions.insert(session_id.to_string(), state.clone());
        self.hub.open_session(session_id);

        tracing::info!("🆕 Session started: {} ({:?})", session_id, state.workspace);
        Ok(state)
    }

    /// 用新的 UUID 创建会话
    pub fn create(&self, permission_mode: PermissionMode) -> Result<Arc<SessionState>> {
        let session_id = uuid::Uuid::new_v4().to_string();
        self.start(&session_id, permission_mode)
    }

    pub fn get(&self, session_id: &str) -> Result<Arc<SessionState>> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .read()
            .values()
            .map(|state| SessionSummary {
                session_id: state.session_id.clone(),
                workspace: state.workspace.display().to_string(),
                permission_mode: state.permission_mode(),
                created_at: state.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
                executing: state.is_executing(),
                subscribers: self.hub.subscriber_count(&state.session_id),
            })
            .collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.session_id.cmp(&b.session_id)));
        summaries
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// 开始执行；已有执行中的任务时立即返回 busy，不排队
    pub fn begin_execution(&self, session_id: &str) -> Result<ExecutionGuard> {
        let state = self.get(session_id)?;
        let execution_id = self.next_execution_id.fetch_add(1, Ordering::Relaxed);
        let cancel = state.begin(execution_id)?;

        tracing::debug!("▶️ Execution {} begins: session={}", execution_id, session_id);
        Ok(ExecutionGuard {
            state,
            execution_id,
            cancel,
        })
    }

    /// 强制结束会话的执行状态（正常情况下由守卫完成）
    pub fn end_execution(&self, session_id: &str) -> bool {
        let Ok(state) = self.get(session_id) else {
            return false;
        };
        let id = state.execution.lock().as_ref().map(|a| a.id);
        match id {
            Some(id) => state.end(id),
            None => false,
        }
    }

    /// 取消执行中的任务
    pub fn cancel_execution(&self, session_id: &str, reason: CancelReason) -> bool {
        match self.get(session_id) {
            Ok(state) => {
                let cancelled = state.cancel(reason);
                if cancelled {
                    tracing::info!("⏹️ Cancelling execution: session={}, reason={}", session_id, reason);
                }
                cancelled
            }
            Err(_) => false,
        }
    }

    /// 订阅会话事件
    pub fn attach(&self, session_id: &str) -> Result<Subscription> {
        let state = self.get(session_id)?;
        state.touch();
        Ok(self.hub.attach(session_id))
    }

    /// 取消订阅；最后一个订阅者离开且有执行中的任务时取消它
    pub fn detach(&self, session_id: &str, subscriber: SubscriberId) -> bool {
        match self.hub.detach(session_id, subscriber) {
            Some(0) => {
                if let Ok(state) = self.get(session_id) {
                    state.touch();
                }
                self.cancel_execution(session_id, CancelReason::Disconnected);
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    /// 推送事件（终止事件见 [`EventHub::publish_terminal`]）；订阅者的队列全部已关闭（隐式断开）时按断开处理，取消执行
    pub fn publish(&self, session_id: &str, event: CanonicalEvent) -> usize {
        let published = if event.is_terminal() {
            self.hub.publish_terminal(session_id, event)
        } else {
            self.hub.publish(session_id, event)
        };
        if published.emptied {
            tracing::debug!("📡 All subscriber queues closed: session={}", session_id);
            self.cancel_execution(session_id, CancelReason::Disconnected);
        }
        published.delivered
    }

    /// 清理会话：取消执行、断开订阅者、释放 Agent 连接、删除工作区
    pub async fn clear(&self, session_id: &str) -> Result<()> {
        let state = self
            .sessions
            .write()
            .remove(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;

        state.cancel(CancelReason::Cleared);
        state.set_processing(false);
        self.hub.close_session(session_id);
        state.adapter.shutdown().await;

        let workspace = state.workspace.clone();
        let removed = tokio::task::spawn_blocking(move || {
            if workspace.exists() {
                std::fs::remove_dir_all(&workspace)
            } else {
                Ok(())
            }
        })
        .await
        .map_err(|e| Error::Other(anyhow::anyhow!("workspace cleanup task failed: {}", e)))?;
        removed?;

        tracing::info!("🧹 Session cleared: {}", session_id);
        Ok(())
    }

    /// 清理空闲会话（无执行、无订阅者、空闲超过 `max_idle`），返回被清理的会话
    pub async fn sweep_idle(&self, max_idle: Duration) -> Vec<String> {
        let idle: Vec<String> = self
            .sessions
            .read()
            .values()
            .filter(|s| {
                !s.is_executing()
                    && self.hub.subscriber_count(&s.session_id) == 0
                    && s.idle_for() >= max_idle
            })
            .map(|s| s.session_id.clone())
            .collect();

        let mut cleared = Vec::new();
        for session_id in idle {
            match self.clear(&session_id).await {
                Ok(()) => cleared.push(session_id),
                Err(e) => tracing::warn!("⚠️ Failed to sweep session {}: {}", session_id, e),
            }
        }
        if !cleared.is_empty() {
            tracing::info!("⏰ Swept {} idle session(s)", cleared.len());
        }
        cleared
    }

    /// 是否有会话正在执行
    pub fn has_active_executions(&self) -> bool {
        self.sessions.read().values().any(|s| s.is_executing())
    }

    /// 取消所有执行（守护进程退出时）
    pub fn cancel_all(&self, reason: CancelReason) {
        for state in self.sessions.read().values() {
            state.cancel(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExecutionMetadata;
    use tempfile::TempDir;

    fn registry() -> (Arc<SessionRegistry>, TempDir) {
        let tmp = TempDir::new().unwrap();
        let config = StreamConfig {
            workspace_base: tmp.path().to_path_buf(),
            ..Default::default()
        };
        let hub = EventHub::new(16, Duration::from_secs(30));
        (SessionRegistry::new(Arc::new(config), hub), tmp)
    }

    #[test]
    fn test_start_creates_workspace_and_updates_mode() {
        let (registry, tmp) = registry();
        let state = registry.start("s1", PermissionMode::Default).unwrap();
        assert!(tmp.path().join("s1").is_dir());
        assert_eq!(state.workspace(), &tmp.path().join("s1"));

        let again = registry.start("s1", PermissionMode::Plan).unwrap();
        assert!(Arc::ptr_eq(&state, &again));
        assert_eq!(state.permission_mode(), PermissionMode::Plan);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_invalid_session_id_rejected() {
        let (registry, _tmp) = registry();
        assert!(matches!(
            registry.start("../escape", PermissionMode::Default),
            Err(Error::AccessDenied(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_second_execution_is_busy() {
        let (registry, _tmp) = registry();
        let created = registry.create(PermissionMode::default()).unwrap();
        let id = created.session_id().to_string();

        let guard = registry.begin_execution(&id).unwrap();
        assert!(matches!(registry.begin_execution(&id), Err(Error::SessionBusy(_))));
        assert!(created.is_executing());

        drop(guard);
        assert!(!created.is_executing());
        assert!(registry.begin_execution(&id).is_ok());
    }

    #[test]
    fn test_last_detach_cancels_execution() {
        let (registry, _tmp) = registry();
        registry.start("s1", PermissionMode::Default).unwrap();
        let a = registry.attach("s1").unwrap();
        let b = registry.attach("s1").unwrap();
        let guard = registry.begin_execution("s1").unwrap();
        let token = guard.cancel_token();

        assert!(registry.detach("s1", a.id()));
        assert!(!token.is_cancelled());
        assert!(registry.detach("s1", b.id()));
        assert!(token.is_cancelled());
        assert_eq!(guard.cancel_reason(), Some(CancelReason::Disconnected));
    }

    #[test]
    fn test_dropped_subscription_cancels_on_next_publish() {
        let (registry, _tmp) = registry();
        registry.start("s1", PermissionMode::Default).unwrap();
        let sub = registry.attach("s1").unwrap();
        let guard = registry.begin_execution("s1").unwrap();

        // 传输失败：订阅被丢弃，没有走 detach
        drop(sub);
        assert!(!guard.cancel_token().is_cancelled());

        assert_eq!(registry.publish("s1", CanonicalEvent::error("x", None)), 0);
        assert!(guard.cancel_token().is_cancelled());
        assert_eq!(guard.cancel_reason(), Some(CancelReason::Disconnected));
        assert_eq!(registry.hub().subscriber_count("s1"), 0);
    }

    #[test]
    fn test_resume_policy() {
        let (registry, _tmp) = registry();
        let state = registry.start("s1", PermissionMode::Default).unwrap();

        state.record_outcome(&CanonicalEvent::Success {
            result: "ok".to_string(),
            metadata: ExecutionMetadata::new(None, None, None, Some("agent-7".to_string())),
        });
        assert_eq!(state.resume_id().as_deref(), Some("agent-7"));

        state.record_outcome(&CanonicalEvent::error("boom", None));
        assert!(state.resume_id().is_none());
    }

    #[tokio::test]
    async fn test_clear_removes_workspace_and_cancels() {
        let (registry, tmp) = registry();
        registry.start("s1", PermissionMode::Default).unwrap();
        std::fs::write(tmp.path().join("s1/file.txt"), "x").unwrap();
        let mut sub = registry.attach("s1").unwrap();
        let guard = registry.begin_execution("s1").unwrap();

        registry.clear("s1").await.unwrap();
        assert!(guard.cancel_token().is_cancelled());
        assert_eq!(guard.cancel_reason(), Some(CancelReason::Cleared));
        assert!(!tmp.path().join("s1").exists());
        assert!(sub.try_recv().is_none());
        assert!(matches!(registry.get("s1"), Err(Error::SessionNotFound(_))));
        assert!(matches!(registry.clear("s1").await, Err(Error::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_sweep_idle_skips_busy_and_attached() {
        let (registry, _tmp) = registry();
        registry.start("idle", PermissionMode::Default).unwrap();
        registry.start("busy", PermissionMode::Default).unwrap();
        registry.start("watched", PermissionMode::Default).unwrap();
        let _guard = registry.begin_execution("busy").unwrap();
        let _sub = registry.attach("watched").unwrap();

        let swept = registry.sweep_idle(Duration::ZERO).await;
        assert_eq!(swept, vec!["idle".to_string()]);
        assert_eq!(registry.len(), 2);
    }
}
