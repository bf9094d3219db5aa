//! 长连接客户端策略：每个会话一个 Agent 进程，复用以保持对话连续性
//!
//! 每轮查询向 stdin 写一条 JSON 用户消息，读取 stdout 直到 `result` 记录。
//! 一轮未正常结束（取消、I/O 故障、超长行）时连接被丢弃，进程随之被杀。

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_stream::stream;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{StrategyKind, StreamConfig};
use crate::event::CanonicalEvent;
use crate::types::PermissionMode;

use super::adapter::{
    client_session_args, read_bounded_line, AgentStrategy, EventStream, LineRead, StreamItem,
    TaskRequest,
};
use super::parser::{is_transport_failure, LineParser};
use super::subprocess::{exit_failure, spawn_stderr_collector, EXIT_GRACE};

/// 已连接的 Agent 进程
struct LiveClient {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    stderr: Option<JoinHandle<String>>,
    workspace: PathBuf,
    permission_mode: PermissionMode,
}

impl LiveClient {
    fn connect(config: &StreamConfig, task: &TaskRequest) -> std::io::Result<Self> {
        let args = client_session_args(config, task);
        let mut child = Command::new(&config.agent_binary)
            .args(&args)
            .current_dir(&task.workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("agent stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("agent stdout unavailable"))?;
        let stderr = child.stderr.take().map(spawn_stderr_collector);

        info!("🔌 Agent client connected (pid {:?})", child.id());
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            stderr,
            workspace: task.workspace.clone(),
            permission_mode: task.permission_mode,
        })
    }

    /// 连接参数与本次任务一致时才可复用
    fn serves(&self, task: &TaskRequest) -> bool {
        self.workspace == task.workspace && self.permission_mode == task.permission_mode
    }

    async fn send_query(&mut self, prompt: &str) -> std::io::Result<()> {
        let message = serde_json::json!({
            "type": "user",
            "message": { "role": "user", "content": prompt },
        });
        let mut line = message.to_string();
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await
    }

    /// 进程已结束输出：回收退出状态和 stderr
    async fn finish(mut self) -> StreamItem {
        drop(self.stdin);
        let status = self.child.wait().await;
        let stderr = match self.stderr.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };
        exit_failure(status, stderr)
    }

    /// 关闭 stdin 让进程自行退出，超时则强杀
    async fn close(mut self) {
        drop(self.stdin);
        if tokio::time::timeout(EXIT_GRACE, self.child.wait()).await.is_err() {
            let _ = self.child.kill().await;
        }
        debug!("🔌 Agent client closed");
    }
}

/// 一轮查询的守卫：未标记完成就被丢弃时，连接一并丢弃
struct TurnGuard {
    slot: OwnedMutexGuard<Option<LiveClient>>,
    completed: bool,
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        if !self.completed && self.slot.take().is_some() {
            debug!("✂️ Turn abandoned, dropping agent client");
        }
    }
}

pub struct ClientSessionStrategy {
    config: Arc<StreamConfig>,
    parser: LineParser,
    live: Arc<Mutex<Option<LiveClient>>>,
}

impl ClientSessionStrategy {
    pub fn new(config: Arc<StreamConfig>) -> Self {
        let parser = LineParser::new(config.emit_tool_use_events);
        Self {
            config,
            parser,
            live: Arc::new(Mutex::new(None)),
        }
    }

    /// 当前是否有存活的连接
    pub async fn is_connected(&self) -> bool {
        self.live.lock().await.is_some()
    }
}

#[async_trait::async_trait]
impl AgentStrategy for ClientSessionStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::ClientSession
    }

    fn stream(&self, task: TaskRequest) -> EventStream {
        let config = self.config.clone();
        let parser = self.parser;
        let live = self.live.clone();

        Box::pin(stream! {
            let slot = live.lock_owned().await;
            let mut turn = TurnGuard { slot, completed: false };

            let reusable = turn.slot.as_ref().map(|c| c.serves(&task)).unwrap_or(false);
            if !reusable {
                if let Some(previous) = turn.slot.take() {
                    previous.close().await;
                }
                match LiveClient::connect(&config, &task) {
                    Ok(client) => *turn.slot = Some(client),
                    Err(e) => {
                        warn!("❌ Failed to start agent client: {}", e);
                        yield StreamItem::Event(CanonicalEvent::error(
                            format!("Failed to start agent process: {}", e),
                            Some(config.agent_binary.display().to_string()),
                        ));
                        return;
                    }
                }
            }

            let sent = match turn.slot.as_mut() {
                Some(client) => client.send_query(&task.prompt).await,
                None => Err(std::io::Error::other("agent client not connected")),
            };
            if let Err(e) = sent {
                // 写失败通常意味着进程已退出，以退出状态为准
                debug!("Agent stdin write failed: {}", e);
                let item = match turn.slot.take() {
                    Some(client) => client.finish().await,
                    None => StreamItem::Event(CanonicalEvent::error(
                        "Failed to send query to agent",
                        Some(e.to_string()),
                    )),
                };
                yield item;
                return;
            }

            loop {
                let read = match turn.slot.as_mut() {
                    Some(client) => read_bounded_line(&mut client.stdout, config.max_line_bytes).await,
                    None => break,
                };

                match read {
                    Ok(LineRead::Line(line)) => {
                        for event in parser.parse_line(&line) {
                            let terminal = event.is_terminal();
                            // 消费方拿到终止事件后会直接丢弃序列，先标记完成
                            turn.completed = terminal;
                            yield StreamItem::Event(event);
                            if terminal {
                                return;
                            }
                        }
                    }
                    Ok(LineRead::TooLong(len)) => {
                        warn!("⚠️ Agent output line exceeded {} bytes", config.max_line_bytes);
                        yield StreamItem::FallbackRequired {
                            reason: format!(
                                "line too long: {} bytes exceeds limit of {}",
                                len, config.max_line_bytes
                            ),
                        };
                        return;
                    }
                    Ok(LineRead::Eof) => break,
                    Err(e) => {
                        let message = e.to_string();
                        if is_transport_failure(&message) {
                            yield StreamItem::FallbackRequired { reason: message };
                        } else {
                            yield StreamItem::Event(CanonicalEvent::error(
                                "Failed to read agent output",
                                Some(message),
                            ));
                        }
                        return;
                    }
                }
            }

            // 进程在一轮中途退出
            let item = match turn.slot.take() {
                Some(client) => client.finish().await,
                None => StreamItem::Event(CanonicalEvent::error(
                    "Agent stream ended without a result",
                    None,
                )),
            };
            yield item;
        })
    }

    async fn shutdown(&self) {
        let client = self.live.lock().await.take();
        if let Some(client) = client {
            client.close().await;
        }
    }
}
