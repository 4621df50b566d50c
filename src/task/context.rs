//! 上下文工程：压缩、摘要、KV 缓存优化、工具掩码、多代理隔离
//!
//! 三种策略：
//! 1. 上下文缩减：压缩旧工具结果（只留引用）、超阈值时 LLM 摘要
//! 2. 上下文隔离：子代理独立系统提示词，不共享父任务的工具历史
//! 3. 上下文卸载：按阶段渐进披露工具，掩码而非移除以保持 token 序列稳定

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::llm::{LlmClient, Message};
use crate::observability::Metrics;
use crate::task::error::{Result, TaskError};
use crate::task::manager::Manager;
use crate::task::planner::clean_json_response;
use crate::task::prompts;
use crate::task::types::{AgentTask, PhaseStatus, TaskContext, ToolCall};

/// 上下文工程配置
#[derive(Debug, Clone)]
pub struct ContextEngineerConfig {
    /// 最大上下文令牌数
    pub max_context_tokens: usize,
    /// N 次工具调用后压缩
    pub compress_after_tool_calls: usize,
    /// 保留最近 N 个工具结果完整
    pub keep_recent_tool_results: usize,
    /// 触发摘要的字符阈值
    pub summarize_threshold: usize,
    /// 摘要最大字符数
    pub summary_max_tokens: usize,
    pub enable_kv_cache_optimization: bool,
    /// 保持提示前缀稳定（字节级一致，供上游前缀缓存复用）
    pub stable_prompt_prefix: bool,
}

impl Default for ContextEngineerConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: 4000,
            compress_after_tool_calls: 5,
            keep_recent_tool_results: 3,
            summarize_threshold: 3000,
            summary_max_tokens: 500,
            enable_kv_cache_optimization: true,
            stable_prompt_prefix: true,
        }
    }
}

/// 优化后的上下文
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizedContext {
    pub system_prompt: String,
    pub task_context: String,
    /// 引用到完整数据的映射（用于恢复被压缩的内容）
    pub references: HashMap<String, String>,
    pub is_summarized: bool,
    pub timestamp: DateTime<Utc>,
}

/// 上下文压缩器（策略 1：缩减）
pub struct ContextCompressor {
    keep_recent: usize,
}

impl ContextCompressor {
    pub fn new(keep_recent: usize) -> Self {
        Self { keep_recent }
    }

    /// 压缩工具调用结果：保留序列长度与最近 N 项字节不变，更旧的结果改写为引用
    pub fn compress_tool_results(&self, tool_calls: &[ToolCall]) -> Vec<ToolCall> {
        if tool_calls.len() <= self.keep_recent {
            return tool_calls.to_vec();
        }

        let cutoff = tool_calls.len() - self.keep_recent;
        tool_calls
            .iter()
            .enumerate()
            .map(|(i, tc)| {
                if i < cutoff {
                    self.compress_tool_call(tc)
                } else {
                    tc.clone()
                }
            })
            .collect()
    }

    fn compress_tool_call(&self, tc: &ToolCall) -> ToolCall {
        let mut compressed = tc.clone();
        compressed.compressed = true;

        let references = extract_references(&tc.result);
        compressed.result = if references.is_empty() {
            format!("[压缩] 工具 {} 执行完成", tc.name)
        } else {
            format!("[压缩] 引用: {}", references.join(", "))
        };

        compressed
    }
}

/// 按行扫描提取引用：绝对路径（/）、相对路径（./）、URL（http/https），最多 5 条
pub fn extract_references(content: &str) -> Vec<String> {
    let mut refs = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.starts_with('/')
            || line.starts_with("./")
            || line.starts_with("http://")
            || line.starts_with("https://")
        {
            refs.push(line.to_string());
        }
        if refs.len() >= 5 {
            break;
        }
    }
    refs
}

/// 上下文摘要器（策略 1：缩减）
pub struct ContextSummarizer {
    llm: Arc<dyn LlmClient>,
    summarize_threshold: usize,
    summary_max_tokens: usize,
}

impl ContextSummarizer {
    pub fn new(llm: Arc<dyn LlmClient>, config: &ContextEngineerConfig) -> Self {
        Self {
            llm,
            summarize_threshold: config.summarize_threshold,
            summary_max_tokens: config.summary_max_tokens,
        }
    }

    /// 摘要任务上下文；低于阈值原样返回，LLM 失败时退化为截断
    pub async fn summarize_context(
        &self,
        task_ctx: &TaskContext,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let content = build_context_projection(task_ctx);
        if content.len() < self.summarize_threshold {
            return Ok(content);
        }

        let summary_prompt = format!(
            r#"请将以下任务上下文压缩为简洁的摘要，保留关键信息：

{}

要求：
1. 保留目标和当前状态
2. 保留关键决策和理由
3. 保留重要错误和解决方案
4. 移除冗余细节
5. 最多 {} 个字符

只输出摘要内容。"#,
            content, self.summary_max_tokens
        );

        let messages = [
            Message::system(prompts::CONTEXT_SUMMARIZER_SYSTEM),
            Message::user(summary_prompt),
        ];

        let start = Instant::now();
        let result = tokio::select! {
            r = self.llm.complete(&messages) => r,
            _ = cancel.cancelled() => return Err(TaskError::Cancelled),
        };
        Metrics::global()
            .llm
            .record_call(result.is_ok(), start.elapsed());

        match result {
            Ok(summary) => Ok(summary.trim().to_string()),
            Err(e) => {
                tracing::warn!(error = %e, "上下文摘要失败，退化为截断");
                Ok(truncate_chars(&content, self.summary_max_tokens))
            }
        }
    }
}

/// 固定文本投影：目标/状态/阶段、阶段清单、决策、错误、发现
fn build_context_projection(ctx: &TaskContext) -> String {
    let task = &ctx.task;
    let mut sb = String::new();

    sb.push_str(&format!("目标: {}\n", task.goal));
    sb.push_str(&format!("状态: {}\n", task.status));
    sb.push_str(&format!("当前阶段: {}\n\n", task.current_phase));

    sb.push_str("阶段进度:\n");
    for phase in &task.phases {
        sb.push_str(&format!("- {}: {}\n", phase.name, phase.status));
    }

    if !task.decisions.is_empty() {
        sb.push_str("\n决策:\n");
        for d in &task.decisions {
            sb.push_str(&format!("- {}: {}\n", d.decision, d.rationale));
        }
    }

    if !task.errors.is_empty() {
        sb.push_str("\n错误:\n");
        for e in &task.errors {
            sb.push_str(&format!("- {} (尝试 {}): {}\n", e.error, e.attempt, e.resolution));
        }
    }

    if !ctx.findings.findings.is_empty() {
        sb.push_str("\n发现:\n");
        for f in &ctx.findings.findings {
            sb.push_str(&format!("- [{}] {}\n", f.category, f.content));
        }
    }

    sb
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    format!("{}...", s.chars().take(max).collect::<String>())
}

/// KV 缓存优化器（原则：围绕 KV 缓存设计）
///
/// 消息总是按「稳定系统前缀 + 动态用户内容」组装，前缀字节级不变以最大化上游前缀缓存命中。
pub struct KVCacheOptimizer;

impl KVCacheOptimizer {
    pub fn stable_prefix() -> &'static str {
        prompts::KV_CACHE_STABLE_PREFIX
    }

    pub fn build_optimized_messages(dynamic_content: &str) -> Vec<Message> {
        vec![
            Message::system(prompts::KV_CACHE_STABLE_PREFIX),
            Message::user(dynamic_content),
        ]
    }
}

/// 工具定义
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// 类别前缀：file_ / browser_ / shell_ 等
    pub category: String,
}

fn tool(name: &str, description: &str, category: &str) -> ToolDefinition {
    ToolDefinition {
        name: name.to_string(),
        description: description.to_string(),
        category: category.to_string(),
    }
}

/// 工具加载器（策略 3：卸载，渐进式披露）
pub struct ToolLoader;

impl ToolLoader {
    /// 按阶段状态返回可用工具：基础读写始终可用，发现期加搜索、执行期加命令、验证期加测试
    pub fn available_tools(phase: PhaseStatus) -> Vec<ToolDefinition> {
        let mut tools = vec![
            tool("read_file", "读取文件内容", "file_"),
            tool("write_file", "写入文件内容", "file_"),
            tool("list_dir", "列出目录内容", "file_"),
        ];

        match phase {
            PhaseStatus::Pending => {
                tools.push(tool("web_search", "搜索网络", "browser_"));
                tools.push(tool("web_fetch", "获取网页内容", "browser_"));
            }
            PhaseStatus::InProgress => {
                tools.push(tool("run_command", "执行命令", "shell_"));
                tools.push(tool("edit_file", "编辑文件", "file_"));
            }
            PhaseStatus::Complete => {
                tools.push(tool("run_test", "运行测试", "shell_"));
                tools.push(tool("verify", "验证结果", "shell_"));
            }
            PhaseStatus::Failed => {}
        }

        tools
    }

    /// 掩码工具：不移除被禁用的条目，只给描述加 [不可用] 前缀，保持工具 token 序列稳定
    pub fn mask_tools(
        all_tools: &[ToolDefinition],
        allowed_categories: &[String],
    ) -> Vec<ToolDefinition> {
        if allowed_categories.is_empty() {
            return all_tools.to_vec();
        }

        all_tools
            .iter()
            .map(|t| {
                let mut masked = t.clone();
                if !allowed_categories.iter().any(|c| c == &t.category) {
                    masked.description = format!("[不可用] {}", t.description);
                }
                masked
            })
            .collect()
    }
}

/// 上下文工程师：综合压缩、摘要与缓存优化
pub struct ContextEngineer {
    config: ContextEngineerConfig,
    compressor: ContextCompressor,
    summarizer: ContextSummarizer,
}

impl ContextEngineer {
    pub fn new(llm: Arc<dyn LlmClient>, config: ContextEngineerConfig) -> Self {
        let compressor = ContextCompressor::new(config.keep_recent_tool_results);
        let summarizer = ContextSummarizer::new(llm, &config);
        Self {
            config,
            compressor,
            summarizer,
        }
    }

    pub fn compressor(&self) -> &ContextCompressor {
        &self.compressor
    }

    pub fn summarizer(&self) -> &ContextSummarizer {
        &self.summarizer
    }

    /// 构建优化上下文：压缩工具调用 → 选系统提示 → 任务投影 → 超阈值则摘要 → 提取引用
    pub async fn build_optimized_context(
        &self,
        task_ctx: &TaskContext,
        tool_calls: &[ToolCall],
        cancel: &CancellationToken,
    ) -> Result<OptimizedContext> {
        let compressed_calls = self.compressor.compress_tool_results(tool_calls);

        let system_prompt = if self.config.stable_prompt_prefix {
            prompts::STABLE_SYSTEM_PREFIX.to_string()
        } else {
            self.build_dynamic_system_prompt(task_ctx)
        };

        let task_context = self.build_task_context(task_ctx, &compressed_calls);

        let (task_context, is_summarized) = if task_context.len() > self.config.summarize_threshold
        {
            match self.summarizer.summarize_context(task_ctx, cancel).await {
                Ok(summary) => (summary, true),
                Err(TaskError::Cancelled) => return Err(TaskError::Cancelled),
                Err(e) => {
                    tracing::warn!(error = %e, "摘要失败，使用完整上下文");
                    (task_context, false)
                }
            }
        } else {
            (task_context, false)
        };

        let references = self.extract_all_references(task_ctx, &compressed_calls);

        Ok(OptimizedContext {
            system_prompt,
            task_context,
            references,
            is_summarized,
            timestamp: Utc::now(),
        })
    }

    /// 动态系统提示（仅在 stable_prompt_prefix=false 时使用）
    fn build_dynamic_system_prompt(&self, ctx: &TaskContext) -> String {
        format!(
            "你是一个智能任务执行助手。\n\n当前任务: {}\n目标: {}\n状态: {}\n\n请根据任务计划执行下一步操作。",
            ctx.task.id, ctx.task.goal, ctx.task.status
        )
    }

    /// 任务上下文正文：状态、进度图标、最近决策/错误、工具调用结果
    fn build_task_context(&self, ctx: &TaskContext, tool_calls: &[ToolCall]) -> String {
        let task = &ctx.task;
        let mut sb = String::new();

        sb.push_str("## 任务状态\n");
        sb.push_str(&format!("目标: {}\n", task.goal));
        sb.push_str(&format!("当前阶段: {}\n", task.current_phase));
        sb.push_str(&format!("状态: {}\n\n", task.status));

        sb.push_str("## 进度\n");
        for phase in &task.phases {
            let icon = match phase.status {
                PhaseStatus::Complete => "✅",
                PhaseStatus::InProgress => "🔄",
                PhaseStatus::Failed => "❌",
                PhaseStatus::Pending => "⬜",
            };
            sb.push_str(&format!("{} {}\n", icon, phase.name));
        }

        if !task.decisions.is_empty() {
            sb.push_str("\n## 关键决策\n");
            let start = task.decisions.len().saturating_sub(3);
            for d in &task.decisions[start..] {
                sb.push_str(&format!("- {}\n", d.decision));
            }
        }

        if !task.errors.is_empty() {
            sb.push_str("\n## 避免的错误\n");
            let start = task.errors.len().saturating_sub(3);
            for e in &task.errors[start..] {
                sb.push_str(&format!("- {}\n", e.error));
            }
        }

        if !tool_calls.is_empty() {
            sb.push_str("\n## 最近操作\n");
            for tc in tool_calls {
                if tc.compressed {
                    sb.push_str(&format!("- {}: {}\n", tc.name, tc.result));
                } else {
                    sb.push_str(&format!("- {}: {}\n", tc.name, truncate_chars(&tc.result, 200)));
                }
            }
        }

        sb
    }

    /// 提取所有引用：资源 + 各未压缩工具调用的引用
    fn extract_all_references(
        &self,
        ctx: &TaskContext,
        tool_calls: &[ToolCall],
    ) -> HashMap<String, String> {
        let mut refs = HashMap::new();

        for (i, r) in ctx.findings.resources.iter().enumerate() {
            refs.insert(format!("resource_{}", i), r.clone());
        }

        for tc in tool_calls {
            if tc.compressed {
                continue;
            }
            for (i, r) in extract_references(&tc.result).into_iter().enumerate() {
                refs.insert(format!("{}_ref_{}", tc.name, i), r);
            }
        }

        refs
    }
}

/// 多代理协调器（策略 2：隔离）
///
/// 子代理是独立 LLM 调用：不同系统提示词、不携带父任务的工具历史，形成有界的独立上下文。
pub struct MultiAgentCoordinator {
    manager: Arc<Manager>,
    llm: Arc<dyn LlmClient>,
}

impl MultiAgentCoordinator {
    pub fn new(manager: Arc<Manager>, llm: Arc<dyn LlmClient>) -> Self {
        Self { manager, llm }
    }

    /// 委派任务给子代理，输出 JSON 解析失败时回落为 {result: 原文}
    pub async fn delegate_task(
        &self,
        parent_task_id: &str,
        mut agent_task: AgentTask,
        cancel: &CancellationToken,
    ) -> Result<AgentTask> {
        let parent_ctx = self
            .manager
            .get_task_context(parent_task_id)?
            .ok_or_else(|| TaskError::not_found("task", parent_task_id))?;

        let prompt = build_agent_prompt(&agent_task, &parent_ctx);
        let messages = [
            Message::system(prompts::agent_prompt(agent_task.role)),
            Message::user(prompt),
        ];

        let start = Instant::now();
        let result = tokio::select! {
            r = self.llm.complete(&messages) => r,
            _ = cancel.cancelled() => return Err(TaskError::Cancelled),
        };
        Metrics::global()
            .llm
            .record_call(result.is_ok(), start.elapsed());
        let output = result.map_err(TaskError::Llm)?;

        let cleaned = clean_json_response(&output);
        agent_task.output = match serde_json::from_str(cleaned) {
            Ok(map) => map,
            Err(_) => {
                let mut map = HashMap::new();
                map.insert("result".to_string(), serde_json::Value::String(output));
                map
            }
        };
        agent_task.status = "completed".to_string();

        Ok(agent_task)
    }
}

fn build_agent_prompt(task: &AgentTask, parent_ctx: &TaskContext) -> String {
    let mut sb = format!("## 任务\n{}\n\n", task.description);

    sb.push_str("## 上下文\n");
    sb.push_str(&format!("父任务目标: {}\n", parent_ctx.task.goal));
    sb.push_str(&format!("当前阶段: {}\n", parent_ctx.task.current_phase));

    if !task.input.is_empty() {
        sb.push_str("\n## 输入\n");
        let mut keys: Vec<_> = task.input.keys().collect();
        keys.sort();
        for k in keys {
            sb.push_str(&format!("- {}: {}\n", k, task.input[k]));
        }
    }

    sb
}
