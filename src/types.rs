//! 数据类型定义

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Agent 权限模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PermissionMode {
    #[serde(rename = "default")]
    Default,
    #[default]
    #[serde(rename = "acceptEdits")]
    AcceptEdits,
    #[serde(rename = "bypassPermissions")]
    BypassPermissions,
    #[serde(rename = "plan")]
    Plan,
}

impl PermissionMode {
    /// CLI 参数值
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionMode::Default => "default",
            PermissionMode::AcceptEdits => "acceptEdits",
            PermissionMode::BypassPermissions => "bypassPermissions",
            PermissionMode::Plan => "plan",
        }
    }
}

impl FromStr for PermissionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(PermissionMode::Default),
            "acceptEdits" => Ok(PermissionMode::AcceptEdits),
            "bypassPermissions" => Ok(PermissionMode::BypassPermissions),
            "plan" => Ok(PermissionMode::Plan),
            _ => Err(format!("Invalid permission mode: {}", s)),
        }
    }
}

impl fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一次执行的元数据（附着在终止事件上后不可变）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    pub duration_ms: u64,
    pub num_turns: u64,
    pub total_cost_usd: f64,
    /// Agent 侧的会话 ID，resume 时可能与 Session ID 不同
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl ExecutionMetadata {
    /// 从 Agent 原始数值构建，负数和非有限值归零
    pub fn new(
        duration_ms: Option<f64>,
        num_turns: Option<f64>,
        total_cost_usd: Option<f64>,
        session_id: Option<String>,
    ) -> Self {
        fn non_negative(v: Option<f64>) -> f64 {
            match v {
                Some(v) if v.is_finite() && v > 0.0 => v,
                _ => 0.0,
            }
        }

        Self {
            duration_ms: non_negative(duration_ms) as u64,
            num_turns: non_negative(num_turns) as u64,
            total_cost_usd: non_negative(total_cost_usd),
            session_id: session_id.filter(|s| !s.is_empty()),
        }
    }
}

/// 文件类型（按扩展名分类）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Image,
    Archive,
    Binary,
    Text,
}

impl FileType {
    /// 按文件名扩展名分类，未知扩展名视为文本
    pub fn classify(filename: &str) -> Self {
        let ext = std::path::Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        match ext.as_str() {
            "jpg" | "jpeg" | "png" | "gif" | "bmp" | "svg" | "ico" | "webp" => FileType::Image,
            "zip" | "tar" | "gz" | "rar" | "7z" => FileType::Archive,
            "exe" | "bin" | "dmg" => FileType::Binary,
            _ => FileType::Text,
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileType::Image => write!(f, "image"),
            FileType::Archive => write!(f, "archive"),
            FileType::Binary => write!(f, "binary"),
            FileType::Text => write!(f, "text"),
        }
    }
}

/// 扁平文件列表条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    /// 相对工作区根目录的路径
    pub path: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub file_type: FileType,
    /// RFC 3339 修改时间
    pub modified: String,
}

/// 文件树节点
///
/// 每次查询都完整重新遍历，不做增量维护。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSystemNode {
    pub name: String,
    /// 相对工作区根目录的路径（根节点为空串）
    pub path: String,
    pub is_directory: bool,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub modified: Option<String>,
    #[serde(rename = "type", default)]
    pub file_type: Option<FileType>,
    /// 仅目录有子节点，按名称排序
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<BTreeMap<String, FileSystemNode>>,
}

/// 文件树查询结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryStructure {
    pub tree: FileSystemNode,
    pub files: Vec<FileInfo>,
    pub total_files: usize,
    pub total_size: u64,
}

/// 文件内容查询结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContent {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "type")]
    pub file_type: FileType,
    pub filename: String,
}

/// 会话摘要（状态查询用）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub workspace: String,
    pub permission_mode: PermissionMode,
    pub created_at: String,
    pub executing: bool,
    pub subscribers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_mode_roundtrip() {
        for mode in [
            PermissionMode::Default,
            PermissionMode::AcceptEdits,
            PermissionMode::BypassPermissions,
            PermissionMode::Plan,
        ] {
            assert_eq!(mode.to_string().parse::<PermissionMode>().unwrap(), mode);
        }
        assert!("yolo".parse::<PermissionMode>().is_err());
        assert_eq!(
            serde_json::to_string(&PermissionMode::AcceptEdits).unwrap(),
            "\"acceptEdits\""
        );
    }

    #[test]
    fn test_metadata_clamps_negative_values() {
        let meta = ExecutionMetadata::new(Some(-5.0), None, Some(f64::NAN), Some(String::new()));
        assert_eq!(meta.duration_ms, 0);
        assert_eq!(meta.num_turns, 0);
        assert_eq!(meta.total_cost_usd, 0.0);
        assert!(meta.session_id.is_none());

        let meta = ExecutionMetadata::new(Some(1200.0), Some(3.0), Some(0.02), Some("abc".into()));
        assert_eq!(meta.duration_ms, 1200);
        assert_eq!(meta.num_turns, 3);
        assert_eq!(meta.session_id.as_deref(), Some("abc"));
    }

    #[test]
    fn test_file_type_classify() {
        assert_eq!(FileType::classify("photo.PNG"), FileType::Image);
        assert_eq!(FileType::classify("bundle.tar"), FileType::Archive);
        assert_eq!(FileType::classify("setup.exe"), FileType::Binary);
        assert_eq!(FileType::classify("main.rs"), FileType::Text);
        assert_eq!(FileType::classify("Makefile"), FileType::Text);
    }
}
