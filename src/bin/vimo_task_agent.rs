//! vimo-task-agent - AI CLI 任务流 Agent
//!
//! 负责：
//! - 会话注册表与工作区
//! - 驱动 AI CLI 执行任务（流式 + 回退）
//! - 执行期间的文件监听
//! - 事件推送

use std::sync::Arc;

use ai_cli_task_stream::agent::{cleanup_stale_agent, is_agent_running, Agent, AgentConfig};
use anyhow::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("ai_cli_task_stream=debug".parse()?))
        .init();

    tracing::info!("🚀 vimo-task-agent v{}", ai_cli_task_stream::VERSION_FULL);

    let config = AgentConfig::from_env();
    tracing::debug!(
        "⚙️ strategy={:?}, agent_binary={:?}, workspace_base={:?}",
        config.stream.strategy,
        config.stream.agent_binary,
        config.stream.workspace_base
    );

    // 检查是否已有 Agent 运行
    if is_agent_running(&config) {
        tracing::error!("❌ Agent is already running, exiting");
        std::process::exit(1);
    }

    // 清理残留状态
    if let Err(e) = cleanup_stale_agent(&config) {
        tracing::warn!("Failed to cleanup stale state: {}", e);
    }

    let agent = Arc::new(Agent::new(config)?);
    agent.run().await?;

    tracing::info!("👋 vimo-task-agent exiting");
    Ok(())
}
