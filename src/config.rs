//! 流水线配置
//!
//! 默认值 + 环境变量覆盖（`VIMO_TASK_*`）。

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// 默认允许的工具
pub const DEFAULT_ALLOWED_TOOLS: &[&str] = &[
    "Read", "Write", "Edit", "Bash", "LS", "Grep", "Glob", "WebFetch", "WebSearch", "TodoWrite",
];

/// 执行策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrategyKind {
    /// 每次执行启动一个子进程，逐行读取 stream-json 输出
    #[default]
    Subprocess,
    /// 每个会话一个长连接客户端进程，通过 stdin 发送查询
    ClientSession,
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "subprocess" | "cli" => Ok(StrategyKind::Subprocess),
            "client" | "client-session" | "sdk" => Ok(StrategyKind::ClientSession),
            _ => Err(format!("Invalid strategy: {}", s)),
        }
    }
}

/// 流水线配置
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Agent 可执行文件
    pub agent_binary: PathBuf,
    /// 执行策略
    pub strategy: StrategyKind,
    /// 会话工作区的父目录，每个会话一个子目录
    pub workspace_base: PathBuf,
    /// 允许的工具列表（`--allowedTools`）
    pub allowed_tools: Vec<String>,
    /// 外部集成（MCP）配置文件，存在时才传给 Agent
    pub mcp_config: Option<PathBuf>,
    /// 追加的系统提示词
    pub append_system_prompt: Option<String>,
    /// 单行输出上限，超过视为传输/帧大小故障并触发回退
    pub max_line_bytes: usize,
    /// 工作区快照轮询间隔
    pub poll_interval: Duration,
    /// 订阅者接收保活窗口
    pub keepalive: Duration,
    /// 每个订阅者的队列容量
    pub queue_capacity: usize,
    /// 会话空闲超时
    pub session_idle_timeout: Duration,
    /// 工具调用时额外发出 ToolUse 事件
    pub emit_tool_use_events: bool,
    /// 提示词前附加工作区文件清单
    pub include_file_context: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        let workspace_base = dirs::home_dir()
            .map(|h| h.join(".vimo").join("task-workspaces"))
            .unwrap_or_else(|| PathBuf::from("task-workspaces"));

        Self {
            agent_binary: PathBuf::from("claude"),
            strategy: StrategyKind::default(),
            workspace_base,
            allowed_tools: DEFAULT_ALLOWED_TOOLS.iter().map(|t| t.to_string()).collect(),
            mcp_config: None,
            append_system_prompt: None,
            max_line_bytes: 8 * 1024 * 1024,
            poll_interval: Duration::from_millis(500),
            keepalive: Duration::from_secs(30),
            queue_capacity: 1024,
            session_idle_timeout: Duration::from_secs(60 * 60),
            emit_tool_use_events: false,
            include_file_context: true,
        }
    }
}

impl StreamConfig {
    /// 从环境变量创建配置，未设置的项使用默认值
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 从任意键值来源创建配置（便于测试）
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(bin) = lookup("VIMO_TASK_AGENT_BIN") {
            config.agent_binary = PathBuf::from(bin);
        }
        if let Some(strategy) = lookup("VIMO_TASK_STRATEGY") {
            match strategy.parse() {
                Ok(kind) => config.strategy = kind,
                Err(e) => tracing::warn!("⚠️ {}, using {:?}", e, config.strategy),
            }
        }
        if let Some(dir) = lookup("VIMO_TASK_WORKSPACE_DIR") {
            config.workspace_base = PathBuf::from(dir);
        }
        if let Some(path) = lookup("VIMO_TASK_MCP_CONFIG") {
            config.mcp_config = Some(PathBuf::from(path));
        }
        if let Some(prompt) = lookup("VIMO_TASK_SYSTEM_PROMPT") {
            config.append_system_prompt = Some(prompt).filter(|p| !p.trim().is_empty());
        }
        if let Some(tools) = lookup("VIMO_TASK_ALLOWED_TOOLS") {
            config.allowed_tools = tools
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();
        }
        if let Some(v) = parse_number(&lookup, "VIMO_TASK_MAX_LINE_BYTES") {
            config.max_line_bytes = v as usize;
        }
        if let Some(v) = parse_number(&lookup, "VIMO_TASK_POLL_MS") {
            config.poll_interval = Duration::from_millis(v);
        }
        if let Some(v) = parse_number(&lookup, "VIMO_TASK_KEEPALIVE_SECS") {
            config.keepalive = Duration::from_secs(v);
        }
        if let Some(v) = parse_number(&lookup, "VIMO_TASK_QUEUE_CAPACITY") {
            config.queue_capacity = v as usize;
        }
        if let Some(v) = parse_number(&lookup, "VIMO_TASK_SESSION_IDLE_SECS") {
            config.session_idle_timeout = Duration::from_secs(v);
        }
        if let Some(v) = lookup("VIMO_TASK_EMIT_TOOL_USE") {
            config.emit_tool_use_events = matches!(v.as_str(), "1" | "true" | "yes");
        }

        config
    }

    /// 实际生效的 MCP 配置文件（文件存在时）
    pub fn effective_mcp_config(&self) -> Option<&PathBuf> {
        self.mcp_config.as_ref().filter(|p| p.is_file())
    }
}

fn parse_number<F>(lookup: &F, key: &str) -> Option<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(v) if v > 0 => Some(v),
        _ => {
            tracing::warn!("⚠️ Ignoring invalid {}={}", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = StreamConfig::default();
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.keepalive, Duration::from_secs(30));
        assert_eq!(config.strategy, StrategyKind::Subprocess);
        assert!(config.allowed_tools.iter().any(|t| t == "Bash"));
    }

    #[test]
    fn test_from_lookup_overrides() {
        let vars: HashMap<&str, &str> = [
            ("VIMO_TASK_AGENT_BIN", "/opt/agent"),
            ("VIMO_TASK_STRATEGY", "client"),
            ("VIMO_TASK_ALLOWED_TOOLS", "Read, Write,,mcp__github"),
            ("VIMO_TASK_POLL_MS", "250"),
            ("VIMO_TASK_KEEPALIVE_SECS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let config = StreamConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.agent_binary, PathBuf::from("/opt/agent"));
        assert_eq!(config.strategy, StrategyKind::ClientSession);
        assert_eq!(config.allowed_tools, vec!["Read", "Write", "mcp__github"]);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        // 非法值回退默认
        assert_eq!(config.keepalive, Duration::from_secs(30));
    }

    #[test]
    fn test_missing_mcp_config_not_effective() {
        let config = StreamConfig {
            mcp_config: Some(PathBuf::from("/definitely/not/here/mcp.json")),
            ..Default::default()
        };
        assert!(config.effective_mcp_config().is_none());
    }
}
