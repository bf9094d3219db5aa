//! 规范化事件模型与出站编码
//!
//! 所有组件（流适配器、文件监听、广播器）都只说 `CanonicalEvent`。
//! 出站时有两种编码：SSE 文本帧和 JSON 信封（`{type, ...payload, timestamp}`），
//! 两者携带同一套事件词汇。

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ExecutionMetadata, FileInfo};

/// SSE 连接建立事件名
pub const CONNECTED_EVENT: &str = "connected";
/// SSE 保活事件名
pub const PING_EVENT: &str = "ping";

/// 引擎信息（Init 事件载荷）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub tool_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub message: String,
}

/// 规范化事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CanonicalEvent {
    Init {
        engine_info: EngineInfo,
    },
    Verbose {
        subtype: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_input: Option<serde_json::Value>,
    },
    Text {
        content: String,
    },
    ToolUse {
        tool_name: String,
        tool_input: serde_json::Value,
    },
    FilesUpdated {
        files: Vec<FileInfo>,
        new_paths: Vec<String>,
    },
    Success {
        result: String,
        metadata: ExecutionMetadata,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

impl CanonicalEvent {
    /// 构造 Verbose 事件（无工具信息）
    pub fn verbose(subtype: impl Into<String>, message: impl Into<String>) -> Self {
        CanonicalEvent::Verbose {
            subtype: subtype.into(),
            message: message.into(),
            tool_name: None,
            tool_input: None,
        }
    }

    /// 构造 Error 事件
    pub fn error(message: impl Into<String>, detail: Option<String>) -> Self {
        CanonicalEvent::Error {
            message: message.into(),
            detail,
        }
    }

    /// 事件名（SSE `event:` 字段、JSON 信封的 `type` 字段）
    pub fn event_name(&self) -> &'static str {
        match self {
            CanonicalEvent::Init { .. } => "init",
            CanonicalEvent::Verbose { .. } => "verbose",
            CanonicalEvent::Text { .. } => "text",
            CanonicalEvent::ToolUse { .. } => "tool_use",
            CanonicalEvent::FilesUpdated { .. } => "files_updated",
            CanonicalEvent::Success { .. } => "success",
            CanonicalEvent::Error { .. } => "error",
        }
    }

    /// 是否为终止事件（Success / Error）
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CanonicalEvent::Success { .. } | CanonicalEvent::Error { .. }
        )
    }

    /// 事件载荷（不含 `type` 标签）
    pub fn payload(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(map) = value.as_object_mut() {
            map.remove("type");
        }
        value
    }

    /// 编码为 SSE 帧：`event: <type>\ndata: <json>\n\n`
    pub fn to_sse_frame(&self) -> String {
        sse_frame(self.event_name(), &self.payload())
    }

    /// 编码为 JSON 信封：`{type, ...payload, timestamp}`
    pub fn to_envelope(&self, timestamp: &str) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(map) = value.as_object_mut() {
            map.insert("timestamp".to_string(), serde_json::Value::from(timestamp));
        }
        value
    }
}

/// 当前时间（RFC 3339，毫秒精度）
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// 通用 SSE 帧编码
pub fn sse_frame(event: &str, data: &serde_json::Value) -> String {
    format!("event: {}\ndata: {}\n\n", event, data)
}

/// 订阅建立时的首帧
pub fn connected_sse_frame(session_id: &str) -> String {
    sse_frame(CONNECTED_EVENT, &connected_payload(session_id))
}

/// 保活帧
pub fn ping_sse_frame(timestamp: &str) -> String {
    sse_frame(PING_EVENT, &serde_json::json!({ "timestamp": timestamp }))
}

/// 连接建立信封
pub fn connected_envelope(session_id: &str, timestamp: &str) -> serde_json::Value {
    let mut value = connected_payload(session_id);
    if let Some(map) = value.as_object_mut() {
        map.insert("type".to_string(), CONNECTED_EVENT.into());
        map.insert("timestamp".to_string(), timestamp.into());
    }
    value
}

/// 保活信封
pub fn ping_envelope(timestamp: &str) -> serde_json::Value {
    serde_json::json!({ "type": PING_EVENT, "timestamp": timestamp })
}

fn connected_payload(session_id: &str) -> serde_json::Value {
    serde_json::json!({ "message": "Stream connected", "session_id": session_id })
}

/// 出站帧（JSON 信封解析结果，Client 使用）
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Connected { session_id: String },
    Ping,
    Event(CanonicalEvent),
}

impl Frame {
    /// 解析 JSON 信封；无法识别时返回 None
    pub fn from_envelope(value: serde_json::Value) -> Option<Self> {
        match value.get("type").and_then(|t| t.as_str()) {
            Some(CONNECTED_EVENT) => Some(Frame::Connected {
                session_id: value
                    .get("session_id")
                    .and_then(|s| s.as_str())
                    .unwrap_or_default()
                    .to_string(),
            }),
            Some(PING_EVENT) => Some(Frame::Ping),
            Some(_) => serde_json::from_value(value).ok().map(Frame::Event),
            None => None,
        }
    }
}
