//! OpenAI 兼容 API 客户端
//!
//! 经 async_openai 调用任意 OpenAI 兼容端点（DeepSeek / OpenAI / 自建代理）。
//! 每次调用把 token 用量计入全局 LLM 指标（observability::Metrics），客户端自身无状态。

use async_openai::config::OpenAIConfig;
use async_openai::types::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::llm::{LlmClient, Message, Role};
use crate::observability::Metrics;

/// OpenAI 兼容客户端
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiClient {
    /// api_key 为 None 时使用占位符；密钥解析（配置 / 环境变量）在 config 层完成
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let mut config = OpenAIConfig::new().with_api_key(api_key.unwrap_or("sk-placeholder"));
        if let Some(url) = base_url {
            config = config.with_api_base(url);
        }

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
        }
    }

    fn to_request(&self, messages: &[Message]) -> Result<CreateChatCompletionRequest, String> {
        let converted = messages
            .iter()
            .map(to_chat_message)
            .collect::<Result<Vec<_>, _>>()?;

        CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(converted)
            .build()
            .map_err(|e| e.to_string())
    }
}

fn to_chat_message(m: &Message) -> Result<ChatCompletionRequestMessage, String> {
    let msg = match m.role {
        Role::System => ChatCompletionRequestMessage::System(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(m.content.clone())
                .build()
                .map_err(|e| e.to_string())?,
        ),
        Role::User => ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessageArgs::default()
                .content(m.content.clone())
                .build()
                .map_err(|e| e.to_string())?,
        ),
        Role::Assistant => ChatCompletionRequestMessage::Assistant(
            ChatCompletionRequestAssistantMessageArgs::default()
                .content(m.content.clone())
                .build()
                .map_err(|e| e.to_string())?,
        ),
    };
    Ok(msg)
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let request = self.to_request(messages)?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| e.to_string())?;

        if let Some(usage) = &response.usage {
            Metrics::global()
                .llm
                .record_tokens(usage.prompt_tokens as u64, usage.completion_tokens as u64);
        }

        // 空 content 交给调用方按解析失败降级处理
        Ok(response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }
}
