//! 回退协调：流式通道故障时改用非流式整体调用
//!
//! 调用方只看到规范化事件，永远看不到 `FallbackRequired`；
//! 每次执行恰好以一个 Success / Error 结束。

use std::process::Stdio;
use std::sync::Arc;

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::StreamConfig;
use crate::error::{Error, Result};
use crate::event::CanonicalEvent;

use super::adapter::{
    one_shot_args, strategy_for, AgentStrategy, CanonicalStream, StreamItem, TaskRequest,
};
use super::parser::result_event;
use super::record::{OutputRecord, ResultRecord};

/// 非流式整体调用
#[async_trait]
pub trait OneShotRunner: Send + Sync {
    /// 运行一次，返回终止事件（Success / Error）
    async fn run_once(&self, task: &TaskRequest) -> Result<CanonicalEvent>;
}

/// 通过 `--output-format json` 调用 Agent
pub struct CliOneShotRunner {
    config: Arc<StreamConfig>,
}

impl CliOneShotRunner {
    pub fn new(config: Arc<StreamConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl OneShotRunner for CliOneShotRunner {
    async fn run_once(&self, task: &TaskRequest) -> Result<CanonicalEvent> {
        let args = one_shot_args(&self.config, task, &task.prompt);
        let output = Command::new(&self.config.agent_binary)
            .args(&args)
            .current_dir(&task.workspace)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        match parse_one_shot_output(&stdout) {
            Some(record) => Ok(result_event(record)),
            None if !output.status.success() => Err(Error::Agent(format!(
                "exited with status {}: {}",
                output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
            None => Err(Error::Agent("no result in agent output".to_string())),
        }
    }
}

/// 从整体输出中找结果记录：单个 JSON 对象，或多行中最后一个 result 记录
fn parse_one_shot_output(stdout: &str) -> Option<ResultRecord> {
    let trimmed = stdout.trim();
    if let Some(record) = parse_result_value(trimmed) {
        return Some(record);
    }
    trimmed.lines().rev().find_map(|line| parse_result_value(line.trim()))
}

fn parse_result_value(text: &str) -> Option<ResultRecord> {
    if text.is_empty() {
        return None;
    }
    match OutputRecord::parse(text) {
        Some(OutputRecord::Result(record)) => Some(record),
        Some(_) => None,
        // 部分版本的 JSON 输出没有 type 字段，但带 `result`
        None => {
            let value: serde_json::Value = serde_json::from_str(text).ok()?;
            if value.get("result").is_none() && value.get("is_error").is_none() {
                return None;
            }
            serde_json::from_value(value).ok()
        }
    }
}

/// 流式策略 + 非流式回退的组合接口
pub struct FallbackCoordinator {
    strategy: Arc<dyn AgentStrategy>,
    fallback: Arc<dyn OneShotRunner>,
}

impl FallbackCoordinator {
    pub fn new(strategy: Arc<dyn AgentStrategy>, fallback: Arc<dyn OneShotRunner>) -> Self {
        Self { strategy, fallback }
    }

    /// 按配置选择策略，回退使用 CLI 整体调用
    pub fn from_config(config: Arc<StreamConfig>) -> Self {
        Self::new(
            strategy_for(config.clone()),
            Arc::new(CliOneShotRunner::new(config)),
        )
    }

    pub fn strategy(&self) -> &Arc<dyn AgentStrategy> {
        &self.strategy
    }

    /// 运行一次执行
    ///
    /// 返回的序列恰好以一个终止事件结束；终止事件之后内部序列立即被丢弃。
    pub fn run(&self, task: TaskRequest) -> CanonicalStream {
        let inner = self.strategy.stream(task.clone());
        let fallback = self.fallback.clone();

        Box::pin(stream! {
            let mut inner = inner;
            let mut fallback_reason = None;

            while let Some(item) = inner.next().await {
                match item {
                    StreamItem::Event(event) => {
                        let terminal = event.is_terminal();
                        yield event;
                        if terminal {
                            return;
                        }
                    }
                    StreamItem::FallbackRequired { reason } => {
                        fallback_reason = Some(reason);
                        break;
                    }
                }
            }
            drop(inner);

            let reason = match fallback_reason {
                Some(reason) => reason,
                None => {
                    yield CanonicalEvent::error("Agent stream ended without a result", None);
                    return;
                }
            };

            warn!("🔁 Streaming failed ({}), retrying without streaming", reason);
            let event = match fallback.run_once(&task).await {
                Ok(event) if event.is_terminal() => event,
                Ok(other) => CanonicalEvent::error(
                    format!("Fallback execution failed: unexpected {} event", other.event_name()),
                    None,
                ),
                Err(e) => CanonicalEvent::error(format!("Fallback execution failed: {}", e), None),
            };
            info!("🔁 Fallback finished with {}", event.event_name());
            yield event;
        })
    }

    pub async fn shutdown(&self) {
        self.strategy.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StrategyKind;
    use crate::stream::EventStream;
    use crate::types::ExecutionMetadata;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 回放固定条目的策略
    struct ScriptedStrategy {
        items: Vec<StreamItem>,
    }

    impl AgentStrategy for ScriptedStrategy {
        fn kind(&self) -> StrategyKind {
            StrategyKind::Subprocess
        }

        fn stream(&self, _task: TaskRequest) -> EventStream {
            Box::pin(futures::stream::iter(self.items.clone()))
        }
    }

    struct FixedRunner {
        result: std::result::Result<CanonicalEvent, String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl OneShotRunner for FixedRunner {
        async fn run_once(&self, _task: &TaskRequest) -> Result<CanonicalEvent> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone().map_err(Error::Agent)
        }
    }

    fn success(result: &str) -> CanonicalEvent {
        CanonicalEvent::Success {
            result: result.to_string(),
            metadata: ExecutionMetadata::default(),
        }
    }

    fn coordinator(
        items: Vec<StreamItem>,
        result: std::result::Result<CanonicalEvent, String>,
    ) -> (FallbackCoordinator, Arc<FixedRunner>) {
        let runner = Arc::new(FixedRunner {
            result,
            calls: AtomicUsize::new(0),
        });
        let coordinator =
            FallbackCoordinator::new(Arc::new(ScriptedStrategy { items }), runner.clone());
        (coordinator, runner)
    }

    async fn collect(coordinator: &FallbackCoordinator) -> Vec<CanonicalEvent> {
        coordinator
            .run(TaskRequest::new("hi", "/tmp"))
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_fallback_replaces_transport_failure() {
        let (coordinator, runner) = coordinator(
            vec![
                StreamItem::Event(CanonicalEvent::verbose("user_input", "x")),
                StreamItem::FallbackRequired {
                    reason: "line too long".to_string(),
                },
                StreamItem::Event(CanonicalEvent::verbose("output", "never seen")),
            ],
            Ok(success("ok")),
        );

        let events = collect(&coordinator).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], success("ok"));
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fallback_failure_becomes_error() {
        let (coordinator, _) = coordinator(
            vec![StreamItem::FallbackRequired {
                reason: "frame size".to_string(),
            }],
            Err("boom".to_string()),
        );

        let events = collect(&coordinator).await;
        match &events[..] {
            [CanonicalEvent::Error { message, .. }] => {
                assert!(message.starts_with("Fallback execution failed:"));
                assert!(message.contains("boom"));
            }
            other => panic!("Expected single error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_nothing_after_terminal() {
        let (coordinator, runner) = coordinator(
            vec![
                StreamItem::Event(success("first")),
                StreamItem::Event(CanonicalEvent::Text {
                    content: "late".to_string(),
                }),
                StreamItem::FallbackRequired {
                    reason: "late".to_string(),
                },
            ],
            Ok(success("unused")),
        );

        let events = collect(&coordinator).await;
        assert_eq!(events, vec![success("first")]);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_terminal_is_synthesized() {
        let (coordinator, _) = coordinator(
            vec![StreamItem::Event(CanonicalEvent::Text {
                content: "partial".to_string(),
            })],
            Ok(success("unused")),
        );

        let events = collect(&coordinator).await;
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1],
            CanonicalEvent::error("Agent stream ended without a result", None)
        );
    }

    #[test]
    fn test_parse_one_shot_output_forms() {
        let single = r#"{"type":"result","subtype":"success","result":"ok","num_turns":1}"#;
        assert_eq!(
            parse_one_shot_output(single).and_then(|r| r.result),
            Some("ok".to_string())
        );

        let untyped = r#"{"result":"plain","is_error":false}"#;
        assert_eq!(
            parse_one_shot_output(untyped).and_then(|r| r.result),
            Some("plain".to_string())
        );

        let multi = "{\"type\":\"system\",\"subtype\":\"init\"}\n{\"type\":\"result\",\"result\":\"last\"}\n";
        assert_eq!(
            parse_one_shot_output(multi).and_then(|r| r.result),
            Some("last".to_string())
        );

        assert!(parse_one_shot_output("").is_none());
        assert!(parse_one_shot_output("{\"type\":\"assistant\"}").is_none());
    }
}
