//! 流式协议适配器：任务请求、策略接口与 Agent 调用参数

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::config::{StrategyKind, StreamConfig};
use crate::event::CanonicalEvent;
use crate::types::PermissionMode;

/// 一次执行的输入
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRequest {
    pub prompt: String,
    /// 工作区根目录（Agent 的 cwd）
    pub workspace: PathBuf,
    pub permission_mode: PermissionMode,
    /// 续接的 Agent 会话 ID
    pub resume_session_id: Option<String>,
}

impl TaskRequest {
    pub fn new(prompt: impl Into<String>, workspace: impl Into<PathBuf>) -> Self {
        Self {
            prompt: prompt.into(),
            workspace: workspace.into(),
            permission_mode: PermissionMode::default(),
            resume_session_id: None,
        }
    }

    pub fn with_permission_mode(mut self, mode: PermissionMode) -> Self {
        self.permission_mode = mode;
        self
    }

    pub fn with_resume(mut self, session_id: Option<String>) -> Self {
        self.resume_session_id = session_id;
        self
    }
}

/// 策略产出的条目
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Event(CanonicalEvent),
    /// 流式通道出现传输/帧大小故障，需要非流式重跑
    FallbackRequired { reason: String },
}

/// 策略产出的惰性序列
pub type EventStream = Pin<Box<dyn Stream<Item = StreamItem> + Send>>;

/// 调用方看到的规范化事件序列
pub type CanonicalStream = Pin<Box<dyn Stream<Item = CanonicalEvent> + Send>>;

/// 流式执行策略
///
/// `stream` 返回的序列是有限的、不可重启的；丢弃序列即取消执行。
#[async_trait]
pub trait AgentStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    fn stream(&self, task: TaskRequest) -> EventStream;

    /// 释放策略持有的长期资源（会话清理时调用）
    async fn shutdown(&self) {}
}

/// 按配置选择策略
pub fn strategy_for(config: Arc<StreamConfig>) -> Arc<dyn AgentStrategy> {
    match config.strategy {
        StrategyKind::Subprocess => Arc::new(super::subprocess::SubprocessStrategy::new(config)),
        StrategyKind::ClientSession => {
            Arc::new(super::client::ClientSessionStrategy::new(config))
        }
    }
}

/// 所有调用共享的参数（权限、工具、集成、系统提示词、续接）
fn common_args(config: &StreamConfig, task: &TaskRequest) -> Vec<String> {
    let mut args = vec![
        "--permission-mode".to_string(),
        task.permission_mode.as_str().to_string(),
    ];

    if !config.allowed_tools.is_empty() {
        args.push("--allowedTools".to_string());
        args.push(config.allowed_tools.join(","));
    }
    if let Some(mcp) = config.effective_mcp_config() {
        args.push("--mcp-config".to_string());
        args.push(mcp.to_string_lossy().to_string());
    }
    if let Some(prompt) = &config.append_system_prompt {
        args.push("--append-system-prompt".to_string());
        args.push(prompt.clone());
    }
    if let Some(resume) = &task.resume_session_id {
        args.push("--resume".to_string());
        args.push(resume.clone());
    }

    args
}

/// 子进程策略：`--print --output-format stream-json --verbose ... -- <prompt>`
pub fn streaming_args(config: &StreamConfig, task: &TaskRequest, prompt: &str) -> Vec<String> {
    let mut args: Vec<String> = ["--print", "--output-format", "stream-json", "--verbose"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    args.extend(common_args(config, task));
    args.push("--".to_string());
    args.push(prompt.to_string());
    args
}

/// 长连接客户端策略：结构化 stdin/stdout，不带提示词
pub fn client_session_args(config: &StreamConfig, task: &TaskRequest) -> Vec<String> {
    let mut args: Vec<String> = [
        "--input-format",
        "stream-json",
        "--output-format",
        "stream-json",
        "--verbose",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.extend(common_args(config, task));
    args
}

/// 非流式回退：`--print --output-format json ... -- <prompt>`
pub fn one_shot_args(config: &StreamConfig, task: &TaskRequest, prompt: &str) -> Vec<String> {
    let mut args: Vec<String> = ["--print", "--output-format", "json"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    args.extend(common_args(config, task));
    args.push("--".to_string());
    args.push(prompt.to_string());
    args
}

/// 有界读取一行的结果
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum LineRead {
    Line(String),
    /// 行超过上限（字节数为已读取部分）
    TooLong(usize),
    Eof,
}

/// 读取一行，最多 `max` 字节（不含换行符）
pub(crate) async fn read_bounded_line<R>(reader: &mut R, max: usize) -> std::io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let read = (&mut *reader)
        .take(max as u64 + 1)
        .read_until(b'\n', &mut buf)
        .await?;

    if read == 0 {
        return Ok(LineRead::Eof);
    }
    if buf.last() != Some(&b'\n') && buf.len() > max {
        return Ok(LineRead::TooLong(buf.len()));
    }

    let line = String::from_utf8_lossy(&buf);
    Ok(LineRead::Line(line.trim_end_matches(['\n', '\r']).to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn config() -> StreamConfig {
        StreamConfig {
            allowed_tools: vec!["Read".to_string(), "LS".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_streaming_args_end_with_prompt() {
        let task = TaskRequest::new("--help me", "/tmp/ws")
            .with_permission_mode(PermissionMode::Plan)
            .with_resume(Some("agent-1".to_string()));
        let args = streaming_args(&config(), &task, &task.prompt);

        assert_eq!(&args[..4], ["--print", "--output-format", "stream-json", "--verbose"]);
        let mode = args.iter().position(|a| a == "--permission-mode").unwrap();
        assert_eq!(args[mode + 1], "plan");
        let tools = args.iter().position(|a| a == "--allowedTools").unwrap();
        assert_eq!(args[tools + 1], "Read,LS");
        let resume = args.iter().position(|a| a == "--resume").unwrap();
        assert_eq!(args[resume + 1], "agent-1");
        // 提示词在 `--` 之后，不会被当作参数
        assert_eq!(&args[args.len() - 2..], ["--", "--help me"]);
        assert!(!args.iter().any(|a| a == "--mcp-config"));
    }

    #[test]
    fn test_mcp_config_only_when_file_exists() {
        let dir = tempfile::tempdir().unwrap();
        let mcp = dir.path().join("mcp.json");
        std::fs::write(&mcp, "{}").unwrap();

        let config = StreamConfig {
            mcp_config: Some(mcp.clone()),
            ..config()
        };
        let task = TaskRequest::new("hi", Path::new("/tmp/ws"));
        let args = one_shot_args(&config, &task, "hi");
        let idx = args.iter().position(|a| a == "--mcp-config").unwrap();
        assert_eq!(args[idx + 1], mcp.to_string_lossy());
        assert_eq!(args[2], "json");
    }

    #[test]
    fn test_client_session_args_have_no_prompt() {
        let task = TaskRequest::new("hello", "/tmp/ws");
        let args = client_session_args(&config(), &task);
        assert!(args.contains(&"--input-format".to_string()));
        assert!(!args.contains(&"--".to_string()));
        assert!(!args.contains(&"hello".to_string()));
    }

    #[tokio::test]
    async fn test_read_bounded_line() {
        let data = b"short\r\nexactly-ten\n0123456789ABCDEF\nlast".to_vec();
        let mut reader = tokio::io::BufReader::new(&data[..]);

        assert_eq!(
            read_bounded_line(&mut reader, 11).await.unwrap(),
            LineRead::Line("short".to_string())
        );
        assert_eq!(
            read_bounded_line(&mut reader, 11).await.unwrap(),
            LineRead::Line("exactly-ten".to_string())
        );
        assert!(matches!(
            read_bounded_line(&mut reader, 11).await.unwrap(),
            LineRead::TooLong(12)
        ));
    }

    #[tokio::test]
    async fn test_read_bounded_line_eof_without_newline() {
        let data = b"last".to_vec();
        let mut reader = tokio::io::BufReader::new(&data[..]);
        assert_eq!(
            read_bounded_line(&mut reader, 64).await.unwrap(),
            LineRead::Line("last".to_string())
        );
        assert_eq!(read_bounded_line(&mut reader, 64).await.unwrap(), LineRead::Eof);
    }
}
