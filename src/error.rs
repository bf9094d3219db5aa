//! 错误类型定义

use thiserror::Error;

/// 库错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 连接错误
    #[error("连接错误: {0}")]
    Connection(String),

    /// 会话不存在
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// 会话已有执行中的任务（不排队，直接拒绝）
    #[error("Session {0} is busy: an execution is already in flight")]
    SessionBusy(String),

    /// 路径越出工作区（沙箱违规）
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// 文件不存在
    #[error("File not found: {0}")]
    NotFound(String),

    /// 文件监听错误
    #[cfg(feature = "agent")]
    #[error("文件监听错误: {0}")]
    Watch(#[from] notify::Error),

    /// Agent 进程错误
    #[error("Agent 错误: {0}")]
    Agent(String),

    /// 其他错误
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// 映射到协议错误码
    pub fn code(&self) -> i32 {
        match self {
            Error::Config(_) | Error::Serialization(_) => 400,
            Error::AccessDenied(_) => 403,
            Error::SessionNotFound(_) | Error::NotFound(_) => 404,
            Error::SessionBusy(_) => 409,
            _ => 500,
        }
    }
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::SessionBusy("s".into()).code(), 409);
        assert_eq!(Error::AccessDenied("../x".into()).code(), 403);
        assert_eq!(Error::NotFound("a.txt".into()).code(), 404);
        assert_eq!(Error::Agent("boom".into()).code(), 500);
    }
}
