//! Agent 模块 - 会话注册表 + 任务执行 + 文件监听 + 事件推送
//!
//! Agent 是会话和 AI CLI 进程的唯一持有者，负责：
//! - 管理会话生命周期（每会话至多一个执行中的任务）
//! - 驱动 Agent 适配器（流式子进程 / 常驻会话，失败时一次性回退）
//! - 执行期间监听工作区，发出文件变化事件
//! - 把事件扇出给订阅者（Unix Socket 推送）

mod broadcaster;
mod executor;
mod handler;
mod registry;
mod server;
mod watcher;

// Re-export protocol types from crate root
pub use crate::protocol::{QueryType, Request, Response};
pub use broadcaster::{Delivery, EventHub, Published, SubscriberId, Subscription};
pub use executor::Executor;
pub use handler::{ConnId, Handler, MessageSender, AGENT_VERSION};
pub use registry::{CancelReason, ExecutionGuard, SessionRegistry, SessionState};
pub use server::{cleanup_stale_agent, is_agent_running, Agent, AgentConfig};
pub use watcher::{
    diff_snapshot, qualify_path, ChangeCallback, ChangeKind, FilesCallback, WatchOptions, WorkspaceWatcher,
};
