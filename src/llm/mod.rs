//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock）
//!
//! 后端选择与密钥/端点解析都走 config 的 [llm] 段；DeepSeek 即 OpenAI 兼容端点的一个预设。

use std::sync::Arc;

pub mod mock;
pub mod openai;
pub mod traits;

pub use mock::MockLlmClient;
pub use openai::OpenAiClient;
pub use traits::{LlmClient, Message, Role};

use crate::config::LlmSection;

/// 按 [llm] 配置段创建客户端
///
/// - `deepseek`（默认）/ `openai`：OpenAI 兼容客户端，端点与密钥由配置段解析
/// - `mock`：固定返回 complete 决策，便于离线联调
pub fn create_client(cfg: &LlmSection) -> Arc<dyn LlmClient> {
    match cfg.provider.as_str() {
        "mock" => Arc::new(MockLlmClient::always(
            r#"{"action": "complete", "message": "步骤已标记完成"}"#,
        )),
        _ => {
            let base_url = cfg.resolve_base_url();
            let api_key = cfg.resolve_api_key();
            Arc::new(OpenAiClient::new(
                base_url.as_deref(),
                &cfg.model,
                api_key.as_deref(),
            ))
        }
    }
}
