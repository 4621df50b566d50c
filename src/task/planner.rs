//! 任务规划器：用 LLM 将目标分解为阶段/步骤树
//!
//! 规划是降级而非失败：解析失败或空阶段时回落到标准 5 阶段默认计划，从不把解析错误抛给上层。

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::llm::{LlmClient, Message};
use crate::observability::Metrics;
use crate::task::error::{Result, TaskError};
use crate::task::prompts;
use crate::task::types::{PhaseStatus, PlanRequest, TaskContext, TaskPhase, TaskStep};

/// 规划结果（LLM 输出的 JSON 形状）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerResult {
    pub phases: Vec<PlanPhase>,
    #[serde(default)]
    pub key_questions: Vec<String>,
    #[serde(default)]
    pub estimate: String,
    #[serde(default)]
    pub risks: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanPhase {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub steps: Vec<PlanStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub description: String,
}

/// 任务规划器
pub struct Planner {
    llm: Arc<dyn LlmClient>,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// 生成任务计划
    ///
    /// LLM 传输错误向上返回（由调用方决定降级）；解析失败在此处降级为默认计划。
    pub async fn generate_plan(
        &self,
        req: &PlanRequest,
        cancel: &CancellationToken,
    ) -> Result<PlannerResult> {
        let mut user_prompt = format!("请为以下目标创建详细的执行计划：\n\n目标: {}", req.goal);
        if !req.context.is_empty() {
            user_prompt.push_str(&format!("\n\n上下文信息: {}", req.context));
        }
        if !req.constraints.is_empty() {
            user_prompt.push_str(&format!("\n\n约束条件:\n- {}", req.constraints.join("\n- ")));
        }
        if !req.preferences.is_empty() {
            user_prompt.push_str(&format!("\n\n偏好设置:\n- {}", req.preferences.join("\n- ")));
        }

        let messages = [
            Message::system(prompts::PLANNER_SYSTEM),
            Message::user(user_prompt),
        ];

        let result = self.complete(&messages, cancel).await?;

        match parse_plan_result(&result) {
            Ok(plan) => Ok(plan),
            Err(e) => {
                tracing::warn!(error = %e, "规划结果解析失败，使用默认计划");
                Ok(default_plan())
            }
        }
    }

    /// 细化阶段：为指定阶段生成更详细的步骤列表
    pub async fn refine_phase(
        &self,
        task_ctx: &TaskContext,
        phase_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<TaskStep>> {
        let phase = task_ctx
            .task
            .phase(phase_id)
            .ok_or_else(|| TaskError::not_found("phase", phase_id))?;

        let refine_prompt = format!(
            r#"请为以下阶段生成更详细的执行步骤：

任务目标: {}
阶段名称: {}
阶段描述: {}

当前步骤:
{}

请生成更详细、更具体的步骤列表。输出 JSON 格式：
{{
  "steps": [
    {{"id": "step_x_1", "description": "详细步骤描述"}}
  ]
}}
只输出 JSON。"#,
            task_ctx.task.goal,
            phase.name,
            phase.description,
            format_steps(&phase.steps)
        );

        let messages = [
            Message::system(prompts::REFINE_PHASE_SYSTEM),
            Message::user(refine_prompt),
        ];

        let result = self.complete(&messages, cancel).await?;
        let cleaned = clean_json_response(&result);

        #[derive(Deserialize)]
        struct RefineResult {
            steps: Vec<PlanStep>,
        }

        let refined: RefineResult = serde_json::from_str(cleaned)
            .map_err(|e| TaskError::Llm(format!("细化结果解析失败: {}", e)))?;

        Ok(refined
            .steps
            .into_iter()
            .map(|s| TaskStep {
                id: s.id,
                description: s.description,
                completed: false,
                result: String::new(),
            })
            .collect())
    }

    async fn complete(&self, messages: &[Message], cancel: &CancellationToken) -> Result<String> {
        let start = Instant::now();
        let result = tokio::select! {
            r = self.llm.complete(messages) => r,
            _ = cancel.cancelled() => return Err(TaskError::Cancelled),
        };
        Metrics::global()
            .llm
            .record_call(result.is_ok(), start.elapsed());
        result.map_err(TaskError::Llm)
    }
}

/// 将规划结果转换为任务阶段：全部置为 pending / 未完成，order 为位置 + 1
pub fn convert_to_task_phases(plan: &PlannerResult) -> Vec<TaskPhase> {
    plan.phases
        .iter()
        .enumerate()
        .map(|(i, pp)| TaskPhase {
            id: pp.id.clone(),
            name: pp.name.clone(),
            description: pp.description.clone(),
            status: PhaseStatus::Pending,
            steps: pp
                .steps
                .iter()
                .map(|ps| TaskStep {
                    id: ps.id.clone(),
                    description: ps.description.clone(),
                    completed: false,
                    result: String::new(),
                })
                .collect(),
            started_at: None,
            completed_at: None,
            order: (i + 1) as u32,
        })
        .collect()
}

fn parse_plan_result(result: &str) -> std::result::Result<PlannerResult, String> {
    let cleaned = clean_json_response(result);
    let plan: PlannerResult = serde_json::from_str(cleaned).map_err(|e| e.to_string())?;
    if plan.phases.is_empty() {
        // 空阶段按解析失败处理，走默认计划
        return Err("计划不含任何阶段".to_string());
    }
    Ok(plan)
}

/// 清理 LLM 响应中的代码栅栏（```json / ```）与首尾空白
pub fn clean_json_response(response: &str) -> &str {
    let mut s = response.trim();
    if let Some(rest) = s.strip_prefix("```json") {
        s = rest;
    } else if let Some(rest) = s.strip_prefix("```") {
        s = rest;
    }
    if let Some(rest) = s.strip_suffix("```") {
        s = rest;
    }
    s.trim()
}

fn format_steps(steps: &[TaskStep]) -> String {
    steps
        .iter()
        .map(|s| {
            let status = if s.completed { "[x]" } else { "[ ]" };
            format!("- {} {}", status, s.description)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// 标准 5 阶段默认计划，每阶段 3 个默认步骤
pub fn default_plan() -> PlannerResult {
    let phase = |id: &str, name: &str, description: &str, steps: [(&str, &str); 3]| PlanPhase {
        id: id.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        steps: steps
            .iter()
            .map(|(sid, desc)| PlanStep {
                id: sid.to_string(),
                description: desc.to_string(),
            })
            .collect(),
    };

    PlannerResult {
        phases: vec![
            phase(
                "phase_1",
                "需求与发现",
                "理解需求并收集信息",
                [
                    ("step_1_1", "理解用户意图"),
                    ("step_1_2", "识别约束和需求"),
                    ("step_1_3", "记录发现"),
                ],
            ),
            phase(
                "phase_2",
                "规划与设计",
                "确定技术方案",
                [
                    ("step_2_1", "定义技术方案"),
                    ("step_2_2", "创建项目结构"),
                    ("step_2_3", "记录决策"),
                ],
            ),
            phase(
                "phase_3",
                "实现",
                "执行实现",
                [
                    ("step_3_1", "按步骤执行"),
                    ("step_3_2", "编写代码"),
                    ("step_3_3", "增量测试"),
                ],
            ),
            phase(
                "phase_4",
                "测试与验证",
                "测试和验证",
                [
                    ("step_4_1", "验证需求"),
                    ("step_4_2", "记录测试结果"),
                    ("step_4_3", "修复问题"),
                ],
            ),
            phase(
                "phase_5",
                "交付",
                "交付和总结",
                [
                    ("step_5_1", "审查输出"),
                    ("step_5_2", "确保完整"),
                    ("step_5_3", "交付用户"),
                ],
            ),
        ],
        key_questions: Vec::new(),
        estimate: "待评估".to_string(),
        risks: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    fn plan_request(goal: &str) -> PlanRequest {
        PlanRequest {
            user_id: "u1".into(),
            session_id: "s1".into(),
            goal: goal.into(),
            context: String::new(),
            constraints: vec![],
            preferences: vec![],
        }
    }

    #[test]
    fn test_clean_json_response_strips_fences() {
        assert_eq!(clean_json_response("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(clean_json_response("```\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(clean_json_response("  {\"a\":1}  "), "{\"a\":1}");
    }

    #[test]
    fn test_default_plan_shape() {
        let plan = default_plan();
        assert_eq!(plan.phases.len(), 5);
        assert!(plan.phases.iter().all(|p| p.steps.len() == 3));
        assert_eq!(plan.phases[0].id, "phase_1");
        assert_eq!(plan.estimate, "待评估");
    }

    #[test]
    fn test_convert_to_task_phases_resets_state() {
        let phases = convert_to_task_phases(&default_plan());
        assert_eq!(phases.len(), 5);
        for (i, p) in phases.iter().enumerate() {
            assert_eq!(p.order, (i + 1) as u32);
            assert_eq!(p.status, PhaseStatus::Pending);
            assert!(p.steps.iter().all(|s| !s.completed));
        }
    }

    #[tokio::test]
    async fn test_generate_plan_parses_llm_json() {
        let response = r#"```json
{
  "phases": [
    {"id": "phase_1", "name": "调研", "description": "看现状",
     "steps": [{"id": "step_1_1", "description": "查资料"}]}
  ],
  "key_questions": ["范围多大?"],
  "estimate": "2天",
  "risks": ["数据不可用"]
}
```"#;
        let planner = Planner::new(Arc::new(MockLlmClient::with_responses([response])));
        let plan = planner
            .generate_plan(&plan_request("做调研"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(plan.phases.len(), 1);
        assert_eq!(plan.phases[0].name, "调研");
        assert_eq!(plan.key_questions, vec!["范围多大?"]);
        assert_eq!(plan.estimate, "2天");
    }

    #[tokio::test]
    async fn test_generate_plan_falls_back_on_bad_json() {
        let planner = Planner::new(Arc::new(MockLlmClient::with_responses(["不是 JSON"])));
        let plan = planner
            .generate_plan(&plan_request("目标"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(plan.phases.len(), 5);
    }

    #[tokio::test]
    async fn test_generate_plan_falls_back_on_empty_phases() {
        let planner = Planner::new(Arc::new(MockLlmClient::with_responses([
            r#"{"phases": []}"#,
        ])));
        let plan = planner
            .generate_plan(&plan_request("目标"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(plan.phases.len(), 5);
    }

    #[tokio::test]
    async fn test_generate_plan_propagates_transport_error() {
        let planner = Planner::new(Arc::new(MockLlmClient::unavailable()));
        let err = planner
            .generate_plan(&plan_request("目标"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Llm(_)));
    }

    #[tokio::test]
    async fn test_refine_phase_replaces_steps() {
        use crate::task::types::{TaskContext, TaskFindings, TaskProgress};
        use chrono::Utc;

        let now = Utc::now();
        let phases = convert_to_task_phases(&default_plan());
        let ctx = TaskContext {
            task: crate::task::types::Task {
                id: "t1".into(),
                user_id: "u1".into(),
                session_id: "s1".into(),
                goal: "目标".into(),
                current_phase: "phase_1".into(),
                phases,
                key_questions: vec![],
                decisions: vec![],
                errors: vec![],
                status: crate::task::types::TaskStatus::Pending,
                created_at: now,
                updated_at: now,
                completed_at: None,
                tool_call_count: 0,
                needs_reread: false,
            },
            findings: TaskFindings::empty("t1", now),
            progress: TaskProgress::empty("t1", now),
        };

        let response = r#"{"steps": [
            {"id": "step_1_1", "description": "访谈用户"},
            {"id": "step_1_2", "description": "整理需求清单"},
            {"id": "step_1_3", "description": "确认优先级"},
            {"id": "step_1_4", "description": "写入 findings"}
        ]}"#;
        let planner = Planner::new(Arc::new(MockLlmClient::with_responses([response])));
        let steps = planner
            .refine_phase(&ctx, "phase_1", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(steps.len(), 4);
        assert_eq!(steps[0].description, "访谈用户");
        assert!(steps.iter().all(|s| !s.completed));

        // 未知阶段报 NotFound
        assert!(planner
            .refine_phase(&ctx, "phase_x", &CancellationToken::new())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_generate_plan_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let planner = Planner::new(Arc::new(MockLlmClient::always("{}")));
        let err = planner
            .generate_plan(&plan_request("目标"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Cancelled));
    }
}
