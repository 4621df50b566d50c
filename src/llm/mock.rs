//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按脚本顺序返回预置响应；脚本耗尽时返回 fallback 或错误，便于模拟 LLM 不可用场景。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, Message};

/// Mock 客户端：按顺序吐出脚本响应
#[derive(Debug, Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<String>>,
    fallback: Option<String>,
}

impl MockLlmClient {
    /// 空脚本、无 fallback：每次调用都返回错误（模拟 LLM 不可用）
    pub fn unavailable() -> Self {
        Self::default()
    }

    /// 按给定顺序返回响应，耗尽后返回错误
    pub fn with_responses<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: Mutex::new(responses.into_iter().map(Into::into).collect()),
            fallback: None,
        }
    }

    /// 每次调用都返回同一响应
    pub fn always(response: impl Into<String>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Some(response.into()),
        }
    }

    /// 脚本耗尽后改用 fallback 响应
    pub fn with_fallback(mut self, response: impl Into<String>) -> Self {
        self.fallback = Some(response.into());
        self
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, _messages: &[Message]) -> Result<String, String> {
        if let Some(next) = self.script.lock().unwrap().pop_front() {
            return Ok(next);
        }
        match &self.fallback {
            Some(f) => Ok(f.clone()),
            None => Err("mock llm: no scripted response".to_string()),
        }
    }
}
