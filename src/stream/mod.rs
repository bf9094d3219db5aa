//! 流式协议适配
//!
//! 把外部 Agent 的输出（子进程 stdout 或长连接客户端）解析为规范化事件序列，
//! 传输故障时透明回退到非流式整体调用。

mod adapter;
mod client;
mod fallback;
mod parser;
mod record;
mod subprocess;
mod tool_format;

pub use adapter::{
    client_session_args, one_shot_args, strategy_for, streaming_args, AgentStrategy,
    CanonicalStream, EventStream, StreamItem, TaskRequest,
};
pub use client::ClientSessionStrategy;
pub use fallback::{CliOneShotRunner, FallbackCoordinator, OneShotRunner};
pub use parser::{is_transport_failure, LineParser};
pub use record::{ContentBlock, OutputRecord, ResultRecord};
pub use subprocess::SubprocessStrategy;
pub use tool_format::{describe_tool_use, ToolKind};
