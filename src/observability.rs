//! 可观测性：tracing 初始化与 LLM 调用指标
//!
//! 指标只覆盖 LLM 调用（次数/延迟/token/错误率），由 Planner 与 Executor 在每次调用后记录。

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with(fmt::layer())
        .init();
}

/// 全局指标收集器
#[derive(Debug, Default)]
pub struct Metrics {
    pub llm: LlmMetrics,
}

impl Metrics {
    /// 获取全局指标实例
    pub fn global() -> &'static Metrics {
        static INSTANCE: std::sync::OnceLock<Metrics> = std::sync::OnceLock::new();
        INSTANCE.get_or_init(Metrics::default)
    }

    /// 导出为 JSON 格式
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "llm": {
                "total_calls": self.llm.total_calls.load(Ordering::Relaxed),
                "successful_calls": self.llm.successful_calls.load(Ordering::Relaxed),
                "failed_calls": self.llm.failed_calls.load(Ordering::Relaxed),
                "total_latency_ms": self.llm.total_latency_ms.load(Ordering::Relaxed),
                "average_latency_ms": self.llm.average_latency_ms(),
                "error_rate": self.llm.error_rate(),
                "total_prompt_tokens": self.llm.total_prompt_tokens.load(Ordering::Relaxed),
                "total_completion_tokens": self.llm.total_completion_tokens.load(Ordering::Relaxed),
            },
        })
    }
}

/// LLM 调用指标
///
/// 调用次数/延迟由各调用方（Planner、Executor、Summarizer、Coordinator）记录，
/// token 用量由 OpenAI 兼容客户端在拿到响应后记录。
#[derive(Debug, Default)]
pub struct LlmMetrics {
    pub total_calls: AtomicU64,
    pub successful_calls: AtomicU64,
    pub failed_calls: AtomicU64,
    pub total_latency_ms: AtomicU64,
    pub total_prompt_tokens: AtomicU64,
    pub total_completion_tokens: AtomicU64,
}

impl LlmMetrics {
    pub fn record_call(&self, success: bool, latency: Duration) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_calls.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_calls.fetch_add(1, Ordering::Relaxed);
        }
        self.total_latency_ms
            .fetch_add(latency.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_tokens(&self, prompt: u64, completion: u64) {
        self.total_prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.total_completion_tokens
            .fetch_add(completion, Ordering::Relaxed);
    }

    pub fn average_latency_ms(&self) -> f64 {
        let total = self.total_latency_ms.load(Ordering::Relaxed);
        let count = self.total_calls.load(Ordering::Relaxed);
        if count == 0 {
            0.0
        } else {
            total as f64 / count as f64
        }
    }

    pub fn error_rate(&self) -> f64 {
        let total = self.total_calls.load(Ordering::Relaxed);
        let failed = self.failed_calls.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            failed as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_llm_metrics() {
        let metrics = LlmMetrics::default();
        metrics.record_call(true, Duration::from_millis(100));
        metrics.record_call(false, Duration::from_millis(200));

        assert_eq!(metrics.total_calls.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.successful_calls.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.failed_calls.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.error_rate(), 0.5);
        assert_eq!(metrics.average_latency_ms(), 150.0);

        metrics.record_tokens(50, 25);
        metrics.record_tokens(30, 0);
        assert_eq!(metrics.total_prompt_tokens.load(Ordering::Relaxed), 80);
        assert_eq!(metrics.total_completion_tokens.load(Ordering::Relaxed), 25);
    }

    #[test]
    fn test_metrics_to_json() {
        let metrics = Metrics::default();
        metrics.llm.record_call(true, Duration::from_millis(100));

        let json = metrics.to_json();
        assert_eq!(json["llm"]["total_calls"].as_u64().unwrap(), 1);
    }
}
