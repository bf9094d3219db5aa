//! ai-cli-task-stream - AI CLI 任务实时遥测
//!
//! 驱动 AI 编码 Agent（Claude CLI）执行任务，把它的流式输出规范化为统一事件，
//! 并在执行期间监听会话工作区，把事件推送给订阅者。
//!
//! # 核心功能
//!
//! - **流解析**: Agent 的 stream-json 输出 → [`CanonicalEvent`]
//! - **执行策略**: 每任务一个子进程，或每会话一个常驻双向会话
//! - **自动回退**: 流式传输失败时改用一次性 JSON 调用
//! - **工作区**: 沙箱内文件列表 / 树 / 读写删除，执行期间的文件变化事件
//! - **Agent 模式**: 会话注册表 + 事件扇出 + Unix Socket 服务
//!
//! # Feature Flags
//!
//! - `agent`: Agent 模式（会话注册表 + 文件监听 + 事件推送 + Unix Socket 服务）
//! - `client`: Agent Client（供组件使用）
//!
//! # 架构
//!
//! 所有 Agent 进程由 vimo-task-agent 持有，其他组件使用 AgentClient 通过
//! Unix Socket 提交任务并订阅事件。

pub mod config;
pub mod error;
pub mod event;
pub mod protocol;
pub mod stream;
pub mod types;
pub mod workspace;

#[cfg(feature = "agent")]
pub mod agent;

#[cfg(feature = "client")]
pub mod client;

// Re-exports
pub use config::{StrategyKind, StreamConfig};
pub use error::{Error, Result};
pub use event::{CanonicalEvent, EngineInfo, Frame};
pub use stream::{
    AgentStrategy, ClientSessionStrategy, FallbackCoordinator, LineParser, StreamItem, SubprocessStrategy,
    TaskRequest,
};
pub use types::*;

// Protocol types (always available)
pub use protocol::{Incoming, QueryType, Request, Response};

#[cfg(feature = "agent")]
pub use agent::{cleanup_stale_agent, is_agent_running, Agent, AgentConfig, EventHub, SessionRegistry};

#[cfg(feature = "client")]
pub use client::{connect_or_start_agent, AgentClient, ClientConfig};

/// 编译时间戳（用于版本一致性检查）
///
/// Agent 和 Client 共享此常量。如果 CI 一起编译，时间戳相同。
/// 格式：Unix 时间戳（秒）
pub const BUILD_TIMESTAMP: u64 = {
    // const 中不能直接用 parse()，需要手动解析
    const BYTES: &[u8] = env!("BUILD_TIMESTAMP").as_bytes();
    const fn parse_u64(bytes: &[u8]) -> u64 {
        let mut result = 0u64;
        let mut i = 0;
        while i < bytes.len() {
            result = result * 10 + (bytes[i] - b'0') as u64;
            i += 1;
        }
        result
    }
    parse_u64(BYTES)
};

/// 完整版本号（语义版本 + 编译时间戳）
///
/// 格式：`{CARGO_PKG_VERSION}-{BUILD_TIMESTAMP}`
pub const VERSION_FULL: &str = concat!(env!("CARGO_PKG_VERSION"), "-", env!("BUILD_TIMESTAMP"));
