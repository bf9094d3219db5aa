//! 输出行 → 规范化事件
//!
//! 纯函数：同一行总是得到同一组事件，不持有跨行状态。

use crate::event::{CanonicalEvent, EngineInfo};
use crate::types::ExecutionMetadata;

use super::record::{ContentBlock, OutputRecord, ResultRecord, SystemRecord};
use super::tool_format::describe_tool_use;

/// 传输/帧大小故障特征（出现在读错误或 stderr 中）
const TRANSPORT_FAILURE_PATTERNS: &[&str] = &[
    "chunk is longer than limit",
    "separator is found",
    "separator is not found",
    "line too long",
    "max line length",
    "frame size",
    "message too large",
    "buffer size exceeded",
];

/// 判断错误信息是否属于传输/帧大小故障（需要回退到非流式调用）
pub fn is_transport_failure(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSPORT_FAILURE_PATTERNS.iter().any(|p| lower.contains(p))
}

/// 行解析器
#[derive(Debug, Clone, Copy, Default)]
pub struct LineParser {
    /// 工具调用时额外发出 ToolUse 事件
    pub emit_tool_use: bool,
}

impl LineParser {
    pub fn new(emit_tool_use: bool) -> Self {
        Self { emit_tool_use }
    }

    /// 解析一行输出
    ///
    /// 空行不产生事件；无法识别的行降级为 `Verbose{subtype:"output"}`。
    /// 终止事件（Success / Error）总是最后一个。
    pub fn parse_line(&self, line: &str) -> Vec<CanonicalEvent> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }

        match OutputRecord::parse(trimmed) {
            Some(OutputRecord::System(record)) => vec![system_event(record)],
            Some(OutputRecord::User(_)) => {
                vec![CanonicalEvent::verbose("user_input", "Processing tool results")]
            }
            Some(OutputRecord::Assistant(record)) => {
                let mut events = Vec::new();
                for block in record.message.content {
                    match block {
                        ContentBlock::Text { text } => {
                            let text = text.trim();
                            if !text.is_empty() {
                                events.push(CanonicalEvent::Text {
                                    content: text.to_string(),
                                });
                            }
                        }
                        ContentBlock::ToolUse { name, input } => {
                            events.push(CanonicalEvent::Verbose {
                                subtype: "tool_start".to_string(),
                                message: describe_tool_use(&name, &input),
                                tool_name: Some(name.clone()),
                                tool_input: Some(input.clone()),
                            });
                            if self.emit_tool_use {
                                events.push(CanonicalEvent::ToolUse {
                                    tool_name: name,
                                    tool_input: input,
                                });
                            }
                        }
                        ContentBlock::Other => {}
                    }
                }
                events
            }
            Some(OutputRecord::Result(record)) => vec![result_event(record)],
            Some(OutputRecord::Error(record)) => {
                vec![CanonicalEvent::error(record.message(), record.detail())]
            }
            None => vec![CanonicalEvent::verbose("output", trimmed)],
        }
    }
}

fn system_event(record: SystemRecord) -> CanonicalEvent {
    if record.subtype != "init" {
        let message = record
            .message
            .unwrap_or_else(|| format!("System: {}", record.subtype));
        return CanonicalEvent::verbose(record.subtype, message);
    }

    let model = record.model.filter(|m| !m.is_empty());
    let tool_count = record.tools.len();
    let message = format!(
        "Session initialized - Model: {}, Tools: {}",
        model.as_deref().unwrap_or("unknown"),
        tool_count
    );

    CanonicalEvent::Init {
        engine_info: EngineInfo {
            model,
            tool_count,
            session_id: record.session_id,
            message,
        },
    }
}

/// 结果记录 → 终止事件
pub(crate) fn result_event(record: ResultRecord) -> CanonicalEvent {
    if record.is_failure() {
        let message = record
            .result
            .clone()
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| format!("Agent reported an error ({})", record.subtype));
        return CanonicalEvent::error(message, record.error_detail());
    }

    CanonicalEvent::Success {
        result: record.result.unwrap_or_default(),
        metadata: ExecutionMetadata::new(
            record.duration_ms,
            record.num_turns,
            record.total_cost_usd,
            record.session_id,
        ),
    }
}
