//! 请求处理器
//!
//! 处理来自客户端的各类请求

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::broadcaster::{Delivery, SubscriberId};
use super::executor::Executor;
use super::registry::{CancelReason, SessionRegistry};
use crate::error::{Error, Result};
use crate::protocol::{connected_push, event_push, ping_push, QueryType, Request, Response};
use crate::workspace;

/// Agent 版本号（跟随 crate 版本）
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// 连接 ID
pub type ConnId = u64;

/// 连接的出站通道（响应和推送共用）
pub type MessageSender = mpsc::Sender<String>;

/// 连接持有的订阅：会话 → (订阅者, 转发任务)
type ConnSubscriptions = HashMap<String, (SubscriberId, JoinHandle<()>)>;

/// 请求处理器
pub struct Handler {
    registry: Arc<SessionRegistry>,
    executor: Arc<Executor>,
    connections: Mutex<HashMap<ConnId, ConnSubscriptions>>,
    connection_count: AtomicUsize,
}

impl Handler {
    /// 创建处理器
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        let executor = Executor::new(registry.clone());
        Self {
            registry,
            executor,
            connections: Mutex::new(HashMap::new()),
            connection_count: AtomicUsize::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// 注册连接
    pub fn connect(&self, conn_id: ConnId) {
        self.connections.lock().insert(conn_id, HashMap::new());
        self.connection_count.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("📡 Connection registered: conn_id={}", conn_id);
    }

    /// 注销连接：取消该连接持有的所有订阅
    pub fn disconnect(&self, conn_id: ConnId) {
        let subscriptions = self.connections.lock().remove(&conn_id);
        if let Some(subscriptions) = subscriptions {
            self.connection_count.fetch_sub(1, Ordering::Relaxed);
            for (session_id, (subscriber, forwarder)) in subscriptions {
                forwarder.abort();
                self.registry.detach(&session_id, subscriber);
            }
        }
        tracing::debug!("📡 Connection unregistered: conn_id={}", conn_id);
    }

    /// 当前连接数
    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::Relaxed)
    }

    /// 处理请求
    pub async fn handle(&self, conn_id: ConnId, sender: &MessageSender, request: Request) -> Response {
        match self.dispatch(conn_id, sender, request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!("Request failed: conn_id={}, error={}", conn_id, e);
                Response::from(&e)
            }
        }
    }

    async fn dispatch(&self, conn_id: ConnId, sender: &MessageSender, request: Request) -> Result<Response> {
        match request {
            Request::Handshake { component, version } => {
                tracing::info!(
                    "🤝 Handshake: conn_id={}, component={}, version={}",
                    conn_id,
                    component,
                    version
                );
                Ok(Response::HandshakeOk {
                    agent_version: AGENT_VERSION.to_string(),
                })
            }

            Request::CreateSession { permission_mode } => {
                let state = self.registry.create(permission_mode.unwrap_or_default())?;
                Ok(Response::SessionCreated {
                    session_id: state.session_id().to_string(),
                    workspace: state.workspace().display().to_string(),
                })
            }

            Request::StartSession {
                session_id,
                permission_mode,
            } => {
                let state = self
                    .registry
                    .start(&session_id, permission_mode.unwrap_or_default())?;
                Ok(Response::SessionCreated {
                    session_id,
                    workspace: state.workspace().display().to_string(),
                })
            }

            Request::SubmitTask {
                session_id,
                prompt,
                permission_mode,
            } => {
                if prompt.trim().is_empty() {
                    return Err(Error::Config("prompt must not be empty".to_string()));
                }
                // 首个任务创建会话；未指定模式时保留已有会话的模式
                let mode = match permission_mode {
                    Some(mode) => mode,
                    None => self
                        .registry
                        .get(&session_id)
                        .map(|state| state.permission_mode())
                        .unwrap_or_default(),
                };
                self.registry.start(&session_id, mode)?;
                let execution_id = self.executor.submit(&session_id, &prompt)?;
                Ok(Response::TaskAccepted {
                    session_id,
                    execution_id,
                })
            }

            Request::CancelTask { session_id } => {
                self.registry.get(&session_id)?;
                self.registry
                    .cancel_execution(&session_id, CancelReason::Requested);
                Ok(Response::Ok)
            }

            Request::Attach { session_id } => self.attach(conn_id, sender, session_id),

            Request::Detach { session_id } => {
                let entry = self
                    .connections
                    .lock()
                    .get_mut(&conn_id)
                    .and_then(|subs| subs.remove(&session_id));
                match entry {
                    Some((subscriber, forwarder)) => {
                        forwarder.abort();
                        self.registry.detach(&session_id, subscriber);
                        Ok(Response::Ok)
                    }
                    None => Err(Error::NotFound(format!("no subscription to {}", session_id))),
                }
            }

            Request::ListFiles { session_id } => {
                let root = self.workspace_of(&session_id)?;
                let files = blocking(move || Ok(workspace::snapshot(&root))).await?;
                Ok(Response::Files { files })
            }

            Request::FileTree { session_id } => {
                let root = self.workspace_of(&session_id)?;
                let name = session_id.clone();
                let structure = blocking(move || Ok(workspace::directory_structure(&root, &name))).await?;
                Ok(Response::Tree { structure })
            }

            Request::ReadFile { session_id, path } => {
                let root = self.workspace_of(&session_id)?;
                let file = blocking(move || workspace::read_file(&root, &path)).await?;
                Ok(Response::FileContent { file })
            }

            Request::WriteFile {
                session_id,
                path,
                content,
            } => {
                let root = self.workspace_of(&session_id)?;
                let info = blocking(move || workspace::write_file(&root, &path, content.as_bytes())).await?;
                tracing::debug!("📝 File written: session={}, path={}", session_id, info.path);
                Ok(Response::Ok)
            }

            Request::DeleteFile { session_id, path } => {
                let root = self.workspace_of(&session_id)?;
                blocking(move || workspace::delete_file(&root, &path)).await?;
                Ok(Response::Ok)
            }

            Request::ClearSession { session_id } => {
                self.forget_subscriptions(&session_id);
                self.registry.clear(&session_id).await?;
                Ok(Response::Ok)
            }

            Request::Heartbeat => Ok(Response::Ok),

            Request::Query { query_type } => Ok(self.handle_query(query_type)),
        }
    }

    /// 订阅会话：启动转发任务，把事件和保活写到连接的出站通道
    fn attach(&self, conn_id: ConnId, sender: &MessageSender, session_id: String) -> Result<Response> {
        let mut connections = self.connections.lock();
        let subscriptions = connections
            .get_mut(&conn_id)
            .ok_or_else(|| Error::Connection(format!("unknown connection {}", conn_id)))?;

        if let Some((subscriber, _)) = subscriptions.get(&session_id) {
            return Ok(Response::Attached {
                session_id,
                subscriber_id: *subscriber,
            });
        }

        let mut subscription = self.registry.attach(&session_id)?;
        let subscriber_id = subscription.id();
        let tx = sender.clone();
        let push_session = session_id.clone();

        let forwarder = tokio::spawn(async move {
            if tx.send(connected_push(&push_session)).await.is_err() {
                return;
            }
            while let Some(delivery) = subscription.recv().await {
                let line = match delivery {
                    Delivery::Event(event) => event_push(&push_session, &event),
                    Delivery::Ping => ping_push(&push_session),
                };
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });

        subscriptions.insert(session_id.clone(), (subscriber_id, forwarder));
        tracing::debug!(
            "📡 Attached: conn_id={}, session={}, subscriber={}",
            conn_id,
            session_id,
            subscriber_id
        );

        Ok(Response::Attached {
            session_id,
            subscriber_id,
        })
    }

    /// 会话被清理前移除所有连接上的订阅记录（hub 会关闭它们的队列）
    fn forget_subscriptions(&self, session_id: &str) {
        let mut connections = self.connections.lock();
        for subscriptions in connections.values_mut() {
            subscriptions.remove(session_id);
        }
    }

    fn workspace_of(&self, session_id: &str) -> Result<PathBuf> {
        let state = self.registry.get(session_id)?;
        state.touch();
        Ok(state.workspace().clone())
    }

    /// 处理查询
    fn handle_query(&self, query_type: QueryType) -> Response {
        match query_type {
            QueryType::Status => {
                let status = serde_json::json!({
                    "agent_version": AGENT_VERSION,
                    "version_full": crate::VERSION_FULL,
                    "connections": self.connection_count(),
                    "sessions": self.registry.len(),
                    "subscribers": self.registry.hub().total_subscribers(),
                });
                Response::QueryResult { data: status }
            }
            QueryType::Sessions => Response::QueryResult {
                data: serde_json::to_value(self.registry.list()).unwrap_or_default(),
            },
        }
    }
}

/// 在阻塞线程池上执行文件操作
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Other(anyhow::anyhow!("blocking task failed: {}", e)))?
}
