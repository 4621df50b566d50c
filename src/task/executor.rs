//! 任务执行器
//!
//! 执行原则：
//! 1. 决策前阅读计划（needs_reread 由 ActionTracker 消费）
//! 2. 3 次打击错误协议：同一步骤失败 3 次后升级给用户而非继续重试
//! 3. 永不重复失败：重试时明确要求换一种方法

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::llm::{LlmClient, Message};
use crate::observability::Metrics;
use crate::task::error::{Result, TaskError};
use crate::task::manager::Manager;
use crate::task::planner::clean_json_response;
use crate::task::prompts;
use crate::task::types::{PhaseStatus, TaskContext, TaskPhase, TaskStatus, TaskStep};

/// 执行器配置
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// 最大重试次数（3 次打击规则）
    pub max_retries: u32,
    /// 执行前重读计划
    pub reread_before_action: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            reread_before_action: true,
        }
    }
}

/// 执行结果
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub next_action: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub attempt: u32,
}

/// 一次步骤尝试的上下文
#[derive(Debug, Clone, Copy)]
pub struct StepAttempt {
    /// 从 1 开始
    pub attempt: u32,
    /// 重试时为 true，要求动作换一种方法
    pub try_different_approach: bool,
}

/// 步骤动作：由执行器在 3 次打击循环内调用
#[async_trait]
pub trait StepAction: Send + Sync {
    async fn run(&self, attempt: StepAttempt) -> std::result::Result<ExecutionResult, String>;
}

/// LLM 对单个步骤的决策
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDecision {
    pub action: String,
    pub message: String,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub findings: Vec<DecisionFinding>,
}

/// 决策附带的发现（LLM 可省略 findings 字段）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionFinding {
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub source: String,
}

/// 任务执行器
pub struct Executor {
    llm: Arc<dyn LlmClient>,
    manager: Arc<Manager>,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(llm: Arc<dyn LlmClient>, manager: Arc<Manager>, config: ExecutorConfig) -> Self {
        Self {
            llm,
            manager,
            config,
        }
    }

    /// 执行单个步骤（3 次打击错误协议）
    ///
    /// 动作错误逐次记录；重试时带 try_different_approach 信号；
    /// 打满次数后返回非致命的升级结果而不是错误。
    pub async fn execute_step(
        &self,
        task_id: &str,
        phase_id: &str,
        step_id: &str,
        action: &dyn StepAction,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        self.manager
            .get_task_context(task_id)?
            .ok_or_else(|| TaskError::not_found("task", task_id))?;

        if self.config.reread_before_action {
            tracing::debug!(step_id = %step_id, "执行步骤前重读计划");
        }

        let mut last_result: Option<ExecutionResult> = None;

        for attempt in 1..=self.config.max_retries {
            if cancel.is_cancelled() {
                return Err(TaskError::Cancelled);
            }

            let step_attempt = StepAttempt {
                attempt,
                try_different_approach: attempt > 1,
            };

            match action.run(step_attempt).await {
                Err(msg) => {
                    if let Err(e) = self.manager.record_error(task_id, &msg, attempt, "") {
                        tracing::warn!(error = %e, "记录步骤错误失败");
                    }

                    if attempt < self.config.max_retries {
                        tracing::warn!(
                            step_id = %step_id,
                            attempt,
                            max = self.config.max_retries,
                            error = %msg,
                            "步骤失败，换一种方法重试"
                        );
                        continue;
                    }

                    // 3 次失败后升级给用户
                    return Ok(ExecutionResult {
                        success: false,
                        message: "请提供进一步指导".to_string(),
                        output: None,
                        next_action: String::new(),
                        error: format!("Step failed after {} attempts: {}", attempt, msg),
                        attempt,
                    });
                }
                Ok(result) if result.success => {
                    self.manager
                        .complete_step(task_id, phase_id, step_id, &result.message)?;
                    return Ok(ExecutionResult { attempt, ..result });
                }
                Ok(result) => {
                    if !result.error.is_empty() {
                        if let Err(e) =
                            self.manager.record_error(task_id, &result.error, attempt, "")
                        {
                            tracing::warn!(error = %e, "记录步骤错误失败");
                        }
                    }
                    last_result = Some(result);
                }
            }
        }

        Ok(last_result.unwrap_or(ExecutionResult {
            success: false,
            message: String::new(),
            output: None,
            next_action: String::new(),
            error: "Unknown error".to_string(),
            attempt: self.config.max_retries,
        }))
    }

    /// 执行整个阶段：开始阶段 → 逐步执行未完成步骤 → 阶段置 complete
    pub async fn execute_phase(
        &self,
        task_id: &str,
        phase_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let ctx = self
            .manager
            .get_task_context(task_id)?
            .ok_or_else(|| TaskError::not_found("task", task_id))?;

        self.manager.start_phase(task_id, phase_id)?;

        let phase = ctx
            .task
            .phase(phase_id)
            .ok_or_else(|| TaskError::not_found("phase", phase_id))?
            .clone();

        for step in phase.steps.iter().filter(|s| !s.completed) {
            let action = DecideStep {
                executor: self,
                task_id,
                phase_id,
                step_id: &step.id,
                cancel,
            };
            let result = self
                .execute_step(task_id, phase_id, &step.id, &action, cancel)
                .await?;
            if !result.success {
                return Ok(result);
            }
        }

        self.manager
            .update_phase_status(task_id, phase_id, PhaseStatus::Complete)?;

        Ok(ExecutionResult {
            success: true,
            message: format!("Phase {} completed successfully", phase.name),
            output: None,
            next_action: ctx.task.next_phase_id(phase_id).unwrap_or_default(),
            error: String::new(),
            attempt: 0,
        })
    }

    /// 执行整个任务：逐阶段推进，最后做完成检查
    pub async fn execute_task(
        &self,
        task_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let ctx = self
            .manager
            .get_task_context(task_id)?
            .ok_or_else(|| TaskError::not_found("task", task_id))?;

        self.manager
            .set_task_status(task_id, TaskStatus::InProgress)?;

        for phase in ctx
            .task
            .phases
            .iter()
            .filter(|p| p.status != PhaseStatus::Complete)
        {
            let result = self.execute_phase(task_id, &phase.id, cancel).await?;
            if !result.success {
                return Ok(result);
            }
        }

        let (complete, incomplete) = self.manager.check_completion(task_id)?;
        if !complete {
            return Ok(ExecutionResult {
                success: false,
                message: format!(
                    "Task incomplete. Remaining phases: {}",
                    incomplete.join(", ")
                ),
                ..Default::default()
            });
        }

        Ok(ExecutionResult {
            success: true,
            message: "Task completed successfully".to_string(),
            ..Default::default()
        })
    }

    /// 用 LLM 决定如何执行单个步骤：落库决策与发现，然后标记步骤完成
    ///
    /// 模型输出解析失败时合成 complete 决策继续推进，坏 JSON 永远不会卡住执行。
    async fn decide_and_execute_step(
        &self,
        task_id: &str,
        phase_id: &str,
        step_id: &str,
        cancel: &CancellationToken,
    ) -> std::result::Result<ExecutionResult, String> {
        let ctx = self
            .manager
            .get_task_context(task_id)
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("task not found: {}", task_id))?;
        let phase = ctx
            .task
            .phase(phase_id)
            .ok_or_else(|| format!("phase not found: {}", phase_id))?;
        let step = phase
            .steps
            .iter()
            .find(|s| s.id == step_id)
            .ok_or_else(|| format!("step not found: {}", step_id))?;

        let decision_prompt = build_decision_prompt(&ctx, phase, step);
        let messages = [
            Message::system(prompts::EXECUTOR_SYSTEM),
            Message::user(decision_prompt),
        ];

        let start = Instant::now();
        let result = tokio::select! {
            r = self.llm.complete(&messages) => r,
            _ = cancel.cancelled() => return Err("cancelled".to_string()),
        };
        Metrics::global()
            .llm
            .record_call(result.is_ok(), start.elapsed());
        let output = result?;

        let decision = match parse_decision(&output) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(error = %e, "决策解析失败，按完成处理");
                StepDecision {
                    action: "complete".to_string(),
                    message: "步骤已标记完成".to_string(),
                    rationale: String::new(),
                    findings: Vec::new(),
                }
            }
        };

        if !decision.rationale.is_empty() {
            if let Err(e) = self
                .manager
                .add_decision(task_id, &decision.action, &decision.rationale)
            {
                tracing::warn!(error = %e, "记录决策失败");
            }
        }

        for finding in &decision.findings {
            if let Err(e) = self.manager.add_finding(
                task_id,
                &finding.category,
                &finding.content,
                &finding.source,
            ) {
                tracing::warn!(error = %e, "记录发现失败");
            }
        }

        if let Err(e) = self
            .manager
            .complete_step(task_id, phase_id, step_id, &decision.message)
        {
            tracing::warn!(error = %e, "标记步骤完成失败");
        }

        Ok(ExecutionResult {
            success: true,
            message: decision.message.clone(),
            output: Some(serde_json::json!({
                "action": decision.action,
                "rationale": decision.rationale,
            })),
            next_action: String::new(),
            error: String::new(),
            attempt: 0,
        })
    }
}

/// 默认步骤动作：decide-and-execute-via-LLM
struct DecideStep<'a> {
    executor: &'a Executor,
    task_id: &'a str,
    phase_id: &'a str,
    step_id: &'a str,
    cancel: &'a CancellationToken,
}

#[async_trait]
impl StepAction for DecideStep<'_> {
    async fn run(&self, _attempt: StepAttempt) -> std::result::Result<ExecutionResult, String> {
        self.executor
            .decide_and_execute_step(self.task_id, self.phase_id, self.step_id, self.cancel)
            .await
    }
}

/// 构建决策提示：目标、当前阶段/步骤、已知错误（避免重复）、已做决策、最近 5 条发现
fn build_decision_prompt(ctx: &TaskContext, phase: &TaskPhase, step: &TaskStep) -> String {
    let mut errors_section = String::new();
    if !ctx.task.errors.is_empty() {
        errors_section.push_str("\n\n## 已知错误（避免重复）:\n");
        for e in &ctx.task.errors {
            errors_section.push_str(&format!(
                "- {} (尝试 {} 次): {}\n",
                e.error, e.attempt, e.resolution
            ));
        }
    }

    let mut decisions_section = String::new();
    if !ctx.task.decisions.is_empty() {
        decisions_section.push_str("\n\n## 已做决策:\n");
        for d in &ctx.task.decisions {
            decisions_section.push_str(&format!("- {}: {}\n", d.decision, d.rationale));
        }
    }

    let mut findings_section = String::new();
    if !ctx.findings.findings.is_empty() {
        findings_section.push_str("\n\n## 相关发现:\n");
        let start = ctx.findings.findings.len().saturating_sub(5);
        for f in &ctx.findings.findings[start..] {
            findings_section.push_str(&format!("- [{}] {}\n", f.category, f.content));
        }
    }

    format!(
        "## 任务信息\n\n目标: {}\n当前阶段: {} - {}\n当前步骤: {}\n{}{}{}\n\n请决定如何执行这个步骤，并提供你的发现。",
        ctx.task.goal,
        phase.id,
        phase.name,
        step.description,
        errors_section,
        decisions_section,
        findings_section
    )
}

fn parse_decision(result: &str) -> std::result::Result<StepDecision, String> {
    let cleaned = clean_json_response(result);
    serde_json::from_str(cleaned).map_err(|e| format!("failed to parse decision JSON: {}", e))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use uuid::Uuid;

    use super::*;
    use crate::llm::MockLlmClient;
    use crate::task::storage::FileStorage;
    use crate::task::types::{PlanRequest, TaskManagerConfig};

    struct AlwaysFails;

    #[async_trait]
    impl StepAction for AlwaysFails {
        async fn run(&self, _a: StepAttempt) -> std::result::Result<ExecutionResult, String> {
            Err("模拟失败".to_string())
        }
    }

    struct SucceedsOnRetry {
        calls: AtomicU32,
    }

    #[async_trait]
    impl StepAction for SucceedsOnRetry {
        async fn run(&self, a: StepAttempt) -> std::result::Result<ExecutionResult, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if a.attempt == 1 {
                assert!(!a.try_different_approach);
                Err("第一次失败".to_string())
            } else {
                assert!(a.try_different_approach);
                Ok(ExecutionResult {
                    success: true,
                    message: "换方法成功".to_string(),
                    ..Default::default()
                })
            }
        }
    }

    fn build(llm: Arc<dyn crate::llm::LlmClient>) -> (Executor, Arc<Manager>, std::path::PathBuf) {
        let root = std::env::temp_dir().join(format!("mantis-exec-{}", Uuid::new_v4()));
        let storage = Arc::new(FileStorage::new(&root).unwrap());
        let config = TaskManagerConfig {
            storage_path: root.clone(),
            ..TaskManagerConfig::default()
        };
        let manager = Arc::new(Manager::new(config, storage));
        let executor = Executor::new(llm, manager.clone(), ExecutorConfig::default());
        (executor, manager, root)
    }

    fn plan_request() -> PlanRequest {
        PlanRequest {
            user_id: "u1".into(),
            session_id: "s1".into(),
            goal: "实现一个任务管理系统".into(),
            context: String::new(),
            constraints: vec![],
            preferences: vec![],
        }
    }

    #[tokio::test]
    async fn test_three_strike_escalates_to_user() {
        let (executor, manager, root) = build(Arc::new(MockLlmClient::unavailable()));
        let task = manager.create_task(&plan_request()).unwrap();

        let result = executor
            .execute_step(
                &task.id,
                "phase_1",
                "step_1_1",
                &AlwaysFails,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.attempt, 3);
        assert!(result.message.contains("请提供进一步指导"));

        let t = manager.get_task(&task.id).unwrap().unwrap();
        assert_eq!(t.errors.len(), 3);
        assert_eq!(
            t.errors.iter().map(|e| e.attempt).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn test_retry_signals_different_approach() {
        let (executor, manager, root) = build(Arc::new(MockLlmClient::unavailable()));
        let task = manager.create_task(&plan_request()).unwrap();

        let action = SucceedsOnRetry {
            calls: AtomicU32::new(0),
        };
        let result = executor
            .execute_step(
                &task.id,
                "phase_1",
                "step_1_1",
                &action,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.attempt, 2);
        assert_eq!(action.calls.load(Ordering::SeqCst), 2);

        let t = manager.get_task(&task.id).unwrap().unwrap();
        assert!(t.phase("phase_1").unwrap().steps[0].completed);
        assert_eq!(t.errors.len(), 1);

        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn test_decide_step_parses_findings() {
        let decision = r#"{"action": "research", "message": "查完资料",
            "rationale": "需要先了解现状",
            "findings": [{"category": "research", "content": "已有方案A", "source": "https://a.com"}]}"#;
        let (executor, manager, root) =
            build(Arc::new(MockLlmClient::always(decision)));
        let task = manager.create_task(&plan_request()).unwrap();

        let result = executor
            .execute_phase(&task.id, "phase_1", &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.next_action, "phase_2");

        let ctx = manager.get_task_context(&task.id).unwrap().unwrap();
        assert!(ctx.task.decisions.len() >= 3);
        assert!(ctx.findings.findings.len() >= 3);
        assert_eq!(ctx.task.phase("phase_1").unwrap().status, PhaseStatus::Complete);

        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn test_malformed_decision_degrades_to_complete() {
        let (executor, manager, root) =
            build(Arc::new(MockLlmClient::always("这不是 JSON")));
        let task = manager.create_task(&plan_request()).unwrap();

        let result = executor
            .execute_phase(&task.id, "phase_1", &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.success);

        let t = manager.get_task(&task.id).unwrap().unwrap();
        let phase = t.phase("phase_1").unwrap();
        assert!(phase.steps.iter().all(|s| s.completed));
        assert!(phase.steps.iter().all(|s| s.result == "步骤已标记完成"));

        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn test_execute_task_runs_all_phases() {
        let (executor, manager, root) = build(Arc::new(MockLlmClient::always(
            r#"{"action": "complete", "message": "完成"}"#,
        )));
        let task = manager.create_task(&plan_request()).unwrap();

        let result = executor
            .execute_task(&task.id, &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.message, "Task completed successfully");

        let t = manager.get_task(&task.id).unwrap().unwrap();
        assert_eq!(t.status, TaskStatus::Completed);
        assert!(t.all_phases_complete());

        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn test_llm_transport_failure_hits_three_strike() {
        let (executor, manager, root) = build(Arc::new(MockLlmClient::unavailable()));
        let task = manager.create_task(&plan_request()).unwrap();

        let result = executor
            .execute_phase(&task.id, "phase_1", &CancellationToken::new())
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.message.contains("请提供进一步指导"));

        std::fs::remove_dir_all(&root).ok();
    }
}
