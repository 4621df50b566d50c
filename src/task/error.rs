//! 任务内核错误类型
//!
//! 环境类错误（IO、数据库、取消）向上传播；模型类错误（坏 JSON、空内容）在各组件内部降级处理，不进入此枚举。

use thiserror::Error;

/// 任务内核统一错误
#[derive(Error, Debug)]
pub enum TaskError {
    /// 读取不存在的任务/阶段/步骤
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("llm error: {0}")]
    Llm(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("cancelled")]
    Cancelled,
}

impl TaskError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TaskError>;
