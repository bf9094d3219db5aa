//! IPC 协议定义
//!
//! 通信方式：Unix Socket + JSONL（每条消息一行 JSON + '\n'）
//!
//! 请求/响应的 `type` 使用 PascalCase（`Handshake`、`TaskAccepted` ...），
//! 推送的事件信封使用 snake_case（`connected`、`text`、`success` ...），
//! 客户端据此区分同一连接上的响应与推送。

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::event::{self, CanonicalEvent, Frame};
use crate::types::{DirectoryStructure, FileContent, FileInfo, PermissionMode};

/// 请求类型（Client → Agent）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    /// 握手
    Handshake {
        /// 组件名称
        component: String,
        /// 组件版本（用于日志和诊断）
        version: String,
    },

    /// 用新的 UUID 创建会话
    CreateSession {
        #[serde(default)]
        permission_mode: Option<PermissionMode>,
    },

    /// 启动（或更新）指定 ID 的会话
    StartSession {
        session_id: String,
        #[serde(default)]
        permission_mode: Option<PermissionMode>,
    },

    /// 提交任务；会话不存在时先创建，忙时返回 409
    SubmitTask {
        session_id: String,
        prompt: String,
        /// 缺省时沿用会话当前的模式
        #[serde(default, skip_serializing_if = "Option::is_none")]
        permission_mode: Option<PermissionMode>,
    },

    /// 取消执行中的任务
    CancelTask { session_id: String },

    /// 订阅会话事件
    Attach { session_id: String },

    /// 取消订阅
    Detach { session_id: String },

    /// 扁平文件列表
    ListFiles { session_id: String },

    /// 文件树
    FileTree { session_id: String },

    /// 读取文件
    ReadFile { session_id: String, path: String },

    /// 写入文件
    WriteFile {
        session_id: String,
        path: String,
        content: String,
    },

    /// 删除文件或目录
    DeleteFile { session_id: String, path: String },

    /// 清理会话（取消执行、断开订阅者、删除工作区）
    ClearSession { session_id: String },

    /// 心跳（保持连接）
    Heartbeat,

    /// 查询
    Query {
        /// 查询类型
        query_type: QueryType,
    },
}

/// 响应类型（Agent → Client）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    /// 成功
    Ok,

    /// 错误
    Error { code: i32, message: String },

    /// 握手成功
    HandshakeOk {
        /// Agent 版本
        agent_version: String,
    },

    /// 会话已创建/启动
    SessionCreated {
        session_id: String,
        workspace: String,
    },

    /// 任务已接受（在后台执行）
    TaskAccepted {
        session_id: String,
        execution_id: u64,
    },

    /// 已订阅
    Attached {
        session_id: String,
        subscriber_id: u64,
    },

    /// 扁平文件列表
    Files { files: Vec<FileInfo> },

    /// 文件树
    Tree { structure: DirectoryStructure },

    /// 文件内容
    FileContent { file: FileContent },

    /// 查询结果
    QueryResult { data: serde_json::Value },
}

impl Response {
    pub fn error(code: i32, message: impl Into<String>) -> Self {
        Response::Error {
            code,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error { .. })
    }
}

impl From<&Error> for Response {
    fn from(err: &Error) -> Self {
        Response::error(err.code(), err.to_string())
    }
}

impl From<Error> for Response {
    fn from(err: Error) -> Self {
        Response::from(&err)
    }
}

/// 查询类型
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "query")]
pub enum QueryType {
    /// 获取 Agent 状态（版本、连接数、会话数）
    Status,
    /// 列出所有会话
    Sessions,
}

/// 推送给订阅者的一行：事件信封 + 顶层 `session_id`
pub fn push_line(session_id: &str, envelope: serde_json::Value) -> String {
    let mut value = envelope;
    if let Some(map) = value.as_object_mut() {
        map.insert("session_id".to_string(), session_id.into());
    }
    format!("{}\n", value)
}

/// 事件推送行
pub fn event_push(session_id: &str, event: &CanonicalEvent) -> String {
    push_line(session_id, event.to_envelope(&event::now_timestamp()))
}

/// 订阅建立推送行
pub fn connected_push(session_id: &str) -> String {
    push_line(session_id, event::connected_envelope(session_id, &event::now_timestamp()))
}

/// 保活推送行
pub fn ping_push(session_id: &str) -> String {
    push_line(session_id, event::ping_envelope(&event::now_timestamp()))
}

/// 连接上收到的一行
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Response(Response),
    Push { session_id: String, frame: Frame },
}

impl Incoming {
    /// 按 `type` 的写法区分响应与推送；无法识别返回 None
    pub fn parse(line: &str) -> Option<Self> {
        let value: serde_json::Value = serde_json::from_str(line.trim()).ok()?;
        let kind = value.get("type")?.as_str()?;

        if kind.starts_with(|c: char| c.is_ascii_uppercase()) {
            return serde_json::from_value(value).ok().map(Incoming::Response);
        }

        let session_id = value
            .get("session_id")
            .and_then(|s| s.as_str())
            .unwrap_or_default()
            .to_string();
        Frame::from_envelope(value).map(|frame| Incoming::Push { session_id, frame })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExecutionMetadata;

    #[test]
    fn test_request_wire_format() {
        let request = Request::SubmitTask {
            session_id: "s1".to_string(),
            prompt: "hi".to_string(),
            permission_mode: None,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(json, r#"{"type":"SubmitTask","session_id":"s1","prompt":"hi"}"#);

        let parsed: Request =
            serde_json::from_str(r#"{"type":"SubmitTask","session_id":"s1","prompt":"hi","permission_mode":"plan"}"#)
                .unwrap();
        assert_eq!(
            parsed,
            Request::SubmitTask {
                session_id: "s1".to_string(),
                prompt: "hi".to_string(),
                permission_mode: Some(PermissionMode::Plan),
            }
        );

        let parsed: Request = serde_json::from_str(r#"{"type":"Heartbeat"}"#).unwrap();
        assert_eq!(parsed, Request::Heartbeat);

        let parsed: Request =
            serde_json::from_str(r#"{"type":"StartSession","session_id":"s1","permission_mode":"plan"}"#).unwrap();
        assert_eq!(
            parsed,
            Request::StartSession {
                session_id: "s1".to_string(),
                permission_mode: Some(PermissionMode::Plan),
            }
        );
    }

    #[test]
    fn test_query_request() {
        let json = r#"{"type":"Query","query_type":{"query":"Sessions"}}"#;
        let parsed: Request = serde_json::from_str(json).unwrap();
        assert_eq!(
            parsed,
            Request::Query {
                query_type: QueryType::Sessions
            }
        );
    }

    #[test]
    fn test_error_response_from_error() {
        let response = Response::from(Error::SessionBusy("s1".to_string()));
        match &response {
            Response::Error { code, message } => {
                assert_eq!(*code, 409);
                assert!(message.contains("s1"));
            }
            other => panic!("Expected error, got {:?}", other),
        }
        assert!(response.is_error());
    }

    #[test]
    fn test_incoming_distinguishes_push_and_response() {
        let line = serde_json::to_string(&Response::TaskAccepted {
            session_id: "s1".to_string(),
            execution_id: 7,
        })
        .unwrap();
        assert!(matches!(
            Incoming::parse(&line),
            Some(Incoming::Response(Response::TaskAccepted { execution_id: 7, .. }))
        ));

        let event = CanonicalEvent::Success {
            result: "done".to_string(),
            metadata: ExecutionMetadata::default(),
        };
        match Incoming::parse(&event_push("s1", &event)) {
            Some(Incoming::Push { session_id, frame }) => {
                assert_eq!(session_id, "s1");
                assert_eq!(frame, Frame::Event(event));
            }
            other => panic!("Expected push, got {:?}", other),
        }

        assert!(matches!(
            Incoming::parse(&ping_push("s1")),
            Some(Incoming::Push { frame: Frame::Ping, .. })
        ));
        assert!(matches!(
            Incoming::parse(&connected_push("s1")),
            Some(Incoming::Push { frame: Frame::Connected { .. }, .. })
        ));
        assert!(Incoming::parse("garbage").is_none());
    }

    #[test]
    fn test_file_content_response_keeps_nested_type() {
        let response = Response::FileContent {
            file: FileContent {
                success: true,
                content: Some("x".to_string()),
                error: None,
                file_type: crate::types::FileType::Text,
                filename: "a.txt".to_string(),
            },
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["type"], "FileContent");
        assert_eq!(json["file"]["type"], "text");
        let back: Response = serde_json::from_value(json).unwrap();
        assert_eq!(back, response);
    }
}
