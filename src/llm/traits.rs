//! LLM 客户端抽象
//!
//! 任务内核的 LLM 交互全部是一问一答：Planner 生成计划、Executor 决策步骤、
//! Summarizer 压缩上下文、子代理委派，没有任何调用方消费 token 流。
//! 因此 trait 只有非流式 complete；流式传输属于外层接口，不在内核建模。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// 消息角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// 对话消息：发送给 LLM 的最小单元
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// LLM 客户端：单轮 chat-completions 调用
///
/// 传输层错误以字符串返回，由调用方决定降级策略（默认计划、合成决策、截断摘要）。
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, messages: &[Message]) -> Result<String, String>;
}
