//! Agent stream-json 输出记录
//!
//! 每行一个自包含的 JSON 记录，外层 `type` 字段决定解释方式。
//! 所有字段都带默认值：Agent 版本升级新增/缺失字段不影响解析。

use serde::Deserialize;

/// 一行输出记录
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputRecord {
    System(SystemRecord),
    User(UserRecord),
    Assistant(AssistantRecord),
    Result(ResultRecord),
    Error(ErrorRecord),
}

impl OutputRecord {
    /// 解析一行；失败返回 None（由调用方降级为透传事件）
    pub fn parse(line: &str) -> Option<Self> {
        serde_json::from_str(line).ok()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SystemRecord {
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub tools: Vec<serde_json::Value>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserRecord {
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AssistantRecord {
    #[serde(default)]
    pub message: AssistantMessage,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

/// 内容块
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        #[serde(default)]
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    /// thinking / tool_result 等不需要转发的块
    #[serde(other)]
    Other,
}

/// 终止记录
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResultRecord {
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<f64>,
    #[serde(default)]
    pub num_turns: Option<f64>,
    #[serde(default, alias = "cost_usd")]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub errors: Vec<serde_json::Value>,
}

impl ResultRecord {
    /// 是否为 Agent 报告的错误
    pub fn is_failure(&self) -> bool {
        self.is_error || self.subtype.starts_with("error")
    }

    /// 错误详情（errors 数组或 subtype）
    pub fn error_detail(&self) -> Option<String> {
        if !self.errors.is_empty() {
            let parts: Vec<String> = self
                .errors
                .iter()
                .map(|e| match e.as_str() {
                    Some(s) => s.to_string(),
                    None => e.to_string(),
                })
                .collect();
            return Some(parts.join("; "));
        }
        Some(self.subtype.clone()).filter(|s| !s.is_empty())
    }
}

/// 显式错误记录：`error` 可以是字符串或 `{message}` 对象
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorRecord {
    #[serde(default)]
    pub error: Option<serde_json::Value>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ErrorRecord {
    pub fn message(&self) -> String {
        let from_error = self.error.as_ref().and_then(|e| match e {
            serde_json::Value::String(s) => Some(s.clone()),
            other => other
                .get("message")
                .and_then(|m| m.as_str())
                .map(|m| m.to_string()),
        });

        from_error
            .or_else(|| self.message.clone())
            .unwrap_or_else(|| "Unknown error occurred".to_string())
    }

    pub fn detail(&self) -> Option<String> {
        self.error.as_ref().filter(|e| e.is_object()).map(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_assistant_blocks() {
        let line = r#"{"type":"assistant","message":{"content":[
            {"type":"thinking","thinking":"hmm"},
            {"type":"text","text":"hi"},
            {"type":"tool_use","id":"t1","name":"LS","input":{"path":"."}}
        ]}}"#;
        match OutputRecord::parse(line) {
            Some(OutputRecord::Assistant(record)) => {
                assert_eq!(record.message.content.len(), 3);
                assert!(matches!(record.message.content[0], ContentBlock::Other));
                assert!(matches!(&record.message.content[2], ContentBlock::ToolUse { name, .. } if name == "LS"));
            }
            other => panic!("Expected assistant record, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_result_cost_alias() {
        let line = r#"{"type":"result","subtype":"success","cost_usd":0.5,"num_turns":2}"#;
        match OutputRecord::parse(line) {
            Some(OutputRecord::Result(r)) => {
                assert_eq!(r.total_cost_usd, Some(0.5));
                assert!(!r.is_failure());
            }
            other => panic!("Expected result record, got {:?}", other),
        }
    }

    #[test]
    fn test_error_record_message_forms() {
        let r: ErrorRecord = serde_json::from_str(r#"{"error":"rate limited"}"#).unwrap();
        assert_eq!(r.message(), "rate limited");
        let r: ErrorRecord = serde_json::from_str(r#"{"error":{"message":"overloaded"}}"#).unwrap();
        assert_eq!(r.message(), "overloaded");
        assert!(r.detail().is_some());
        let r: ErrorRecord = serde_json::from_str("{}").unwrap();
        assert_eq!(r.message(), "Unknown error occurred");
    }

    #[test]
    fn test_unknown_type_is_not_a_record() {
        assert!(OutputRecord::parse(r#"{"type":"stream_event","delta":{}}"#).is_none());
        assert!(OutputRecord::parse("not json").is_none());
        assert!(OutputRecord::parse("[1,2,3]").is_none());
    }
}
