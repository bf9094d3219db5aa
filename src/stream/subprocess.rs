//! 子进程策略：每次执行启动一个 Agent 进程，逐行读取 stdout

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use async_stream::stream;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{StrategyKind, StreamConfig};
use crate::event::CanonicalEvent;

use super::adapter::{
    read_bounded_line, streaming_args, AgentStrategy, EventStream, LineRead, StreamItem,
    TaskRequest,
};
use super::parser::{is_transport_failure, LineParser};

/// stderr 保留的最大字节数（保留尾部）
const STDERR_TAIL_BYTES: usize = 64 * 1024;

/// 进程退出后等待的宽限时间
pub(crate) const EXIT_GRACE: std::time::Duration = std::time::Duration::from_secs(2);

pub struct SubprocessStrategy {
    config: Arc<StreamConfig>,
    parser: LineParser,
}

impl SubprocessStrategy {
    pub fn new(config: Arc<StreamConfig>) -> Self {
        let parser = LineParser::new(config.emit_tool_use_events);
        Self { config, parser }
    }
}

#[async_trait::async_trait]
impl AgentStrategy for SubprocessStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Subprocess
    }

    fn stream(&self, task: TaskRequest) -> EventStream {
        let config = self.config.clone();
        let parser = self.parser;

        Box::pin(stream! {
            let args = streaming_args(&config, &task, &task.prompt);
            debug!("🚀 Spawning {:?} in {:?}", config.agent_binary, task.workspace);

            let mut child = match Command::new(&config.agent_binary)
                .args(&args)
                .current_dir(&task.workspace)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
            {
                Ok(child) => child,
                Err(e) => {
                    warn!("❌ Failed to spawn agent: {}", e);
                    yield StreamItem::Event(CanonicalEvent::error(
                        format!("Failed to start agent process: {}", e),
                        Some(config.agent_binary.display().to_string()),
                    ));
                    return;
                }
            };

            let stderr_task = child.stderr.take().map(spawn_stderr_collector);
            let stdout = match child.stdout.take() {
                Some(stdout) => stdout,
                None => {
                    yield StreamItem::Event(CanonicalEvent::error("Agent stdout unavailable", None));
                    return;
                }
            };
            let mut reader = BufReader::new(stdout);

            loop {
                match read_bounded_line(&mut reader, config.max_line_bytes).await {
                    Ok(LineRead::Line(line)) => {
                        for event in parser.parse_line(&line) {
                            let terminal = event.is_terminal();
                            yield StreamItem::Event(event);
                            if terminal {
                                // 终止事件之后不再读取；给进程一点时间正常退出
                                let _ = tokio::time::timeout(EXIT_GRACE, child.wait()).await;
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

            // stdout 结束但没有终止记录：根据退出状态和 stderr 判断
            let status = child.wait().await;
            let stderr = match stderr_task {
                Some(handle) => handle.await.unwrap_or_default(),
                None => String::new(),
            };

            yield exit_failure(status, stderr);
        })
    }
}

/// stdout 结束但没有终止记录时的结果：传输故障走回退，其余为进程失败
pub(crate) fn exit_failure(status: std::io::Result<ExitStatus>, stderr: String) -> StreamItem {
    let stderr = stderr.trim().to_string();
    match status {
        Ok(status) if !status.success() => {
            if is_transport_failure(&stderr) {
                return StreamItem::FallbackRequired { reason: stderr };
            }
            let code = status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            info!("💥 Agent exited with status {}", code);
            StreamItem::Event(CanonicalEvent::error(
                format!("Agent process exited with status {}", code),
                Some(stderr).filter(|s| !s.is_empty()),
            ))
        }
        Ok(_) => StreamItem::Event(CanonicalEvent::error(
            "Agent stream ended without a result",
            Some(stderr).filter(|s| !s.is_empty()),
        )),
        Err(e) => StreamItem::Event(CanonicalEvent::error(
            "Failed to wait for agent process",
            Some(e.to_string()),
        )),
    }
}

/// 在后台收集 stderr（只用于诊断），保留尾部
pub(crate) fn spawn_stderr_collector<R>(stderr: R) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = stderr;
        let mut tail: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    tail.extend_from_slice(&chunk[..n]);
                    if tail.len() > STDERR_TAIL_BYTES {
                        let excess = tail.len() - STDERR_TAIL_BYTES;
                        tail.drain(..excess);
                    }
                }
                Err(e) => {
                    debug!("stderr read failed: {}", e);
                    break;
                }
            }
        }
        String::from_utf8_lossy(&tail).to_string()
    })
}
