//! Agent Client 模块
//!
//! 提供连接 Agent 的客户端功能

mod connect;

pub use connect::{connect, connect_or_start_agent, AgentClient, ClientConfig, PushMessage};
