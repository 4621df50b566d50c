//! 任务服务：组合根与对外门面
//!
//! 启动时一次性组装 Manager / Planner / Executor / ContextEngineer，之后不可变；
//! HTTP 表层只与 Service 交互。

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::llm::LlmClient;
use crate::task::context::{ContextEngineer, ContextEngineerConfig, OptimizedContext};
use crate::task::db::create_storage;
use crate::task::error::{Result, TaskError};
use crate::task::executor::{ExecutionResult, Executor, ExecutorConfig};
use crate::task::manager::Manager;
use crate::task::planner::{convert_to_task_phases, Planner};
use crate::task::session::Session;
use crate::task::trackers::{CompletionChecker, CompletionStatus};
use crate::task::types::{
    ActionType, AgentTask, ExecuteRequest, ExecuteResponse, PhaseStatus, PlanRequest,
    PlanResponse, Task, TaskContext, TaskManagerConfig, TaskStatus, TaskStep, TaskSummary,
    TestResult, ToolCall,
};

/// 会话信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub task_id: String,
    pub goal: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
}

/// 任务服务
pub struct Service {
    manager: Arc<Manager>,
    llm: Arc<dyn LlmClient>,
    planner: Planner,
    executor: Executor,
    context_engineer: ContextEngineer,
    coordinator: crate::task::context::MultiAgentCoordinator,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl Service {
    /// 按配置创建服务（存储后端由 storage_type 决定）
    pub fn new(config: TaskManagerConfig, llm: Arc<dyn LlmClient>) -> Result<Self> {
        let storage = create_storage(&config)?;
        Ok(Self::with_storage(config, storage, llm))
    }

    pub fn with_storage(
        config: TaskManagerConfig,
        storage: Arc<dyn crate::task::storage::Storage>,
        llm: Arc<dyn LlmClient>,
    ) -> Self {
        let max_retries = config.max_retries;
        let manager = Arc::new(Manager::new(config, storage));
        let planner = Planner::new(llm.clone());
        let executor = Executor::new(
            llm.clone(),
            manager.clone(),
            ExecutorConfig {
                max_retries,
                ..ExecutorConfig::default()
            },
        );
        let context_engineer =
            ContextEngineer::new(llm.clone(), ContextEngineerConfig::default());
        let coordinator =
            crate::task::context::MultiAgentCoordinator::new(manager.clone(), llm.clone());

        Self {
            manager,
            llm,
            planner,
            executor,
            context_engineer,
            coordinator,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    /// 创建任务：先规划（失败降级为默认阶段），再落库
    pub async fn create_task(
        &self,
        req: &PlanRequest,
        cancel: &CancellationToken,
    ) -> Result<PlanResponse> {
        let plan = if self.manager.config().enable_auto_planning {
            match self.planner.generate_plan(req, cancel).await {
                Ok(plan) => Some(plan),
                Err(TaskError::Cancelled) => return Err(TaskError::Cancelled),
                Err(e) => {
                    tracing::warn!(error = %e, "LLM 规划失败，使用默认阶段");
                    None
                }
            }
        } else {
            None
        };

        let mut task = self.manager.create_task(req)?;
        let mut estimate = "待评估".to_string();

        if let Some(plan) = plan {
            let phases = convert_to_task_phases(&plan);
            if !phases.is_empty() {
                task = self
                    .manager
                    .apply_plan(&task.id, phases, plan.key_questions.clone())?;
            }
            if !plan.estimate.is_empty() {
                estimate = plan.estimate;
            }
        }

        Ok(PlanResponse {
            task_id: task.id.clone(),
            goal: task.goal.clone(),
            phases: task.phases,
            estimate,
        })
    }

    pub fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        self.manager.get_task(task_id)
    }

    pub fn get_task_context(&self, task_id: &str) -> Result<Option<TaskContext>> {
        self.manager.get_task_context(task_id)
    }

    pub fn list_tasks(&self, user_id: &str, session_id: &str) -> Result<Vec<Task>> {
        self.manager.list_tasks(user_id, session_id)
    }

    pub fn delete_task(&self, task_id: &str) -> Result<()> {
        self.manager.delete_task(task_id)
    }

    /// 执行任务：指定 phase_id 时只执行该阶段，否则执行整个任务
    pub async fn execute_task(
        &self,
        req: &ExecuteRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecuteResponse> {
        self.manager
            .get_task(&req.task_id)?
            .ok_or_else(|| TaskError::not_found("task", &req.task_id))?;

        let result = if req.phase_id.is_empty() {
            self.executor.execute_task(&req.task_id, cancel).await?
        } else {
            self.executor
                .execute_phase(&req.task_id, &req.phase_id, cancel)
                .await?
        };

        // 执行后刷新任务状态
        let task = self.manager.get_task(&req.task_id)?;
        let (status, current_phase) = task
            .map(|t| (t.status, t.current_phase))
            .unwrap_or((TaskStatus::Pending, String::new()));

        Ok(ExecuteResponse {
            task_id: req.task_id.clone(),
            current_phase,
            status,
            message: result.message,
            next_action: result.next_action,
        })
    }

    pub fn update_phase(&self, task_id: &str, phase_id: &str, status: PhaseStatus) -> Result<()> {
        self.manager.update_phase_status(task_id, phase_id, status)
    }

    pub fn complete_step(
        &self,
        task_id: &str,
        phase_id: &str,
        step_id: &str,
        result: &str,
    ) -> Result<()> {
        self.manager.complete_step(task_id, phase_id, step_id, result)
    }

    pub fn add_finding(
        &self,
        task_id: &str,
        category: &str,
        content: &str,
        source: &str,
    ) -> Result<()> {
        self.manager.add_finding(task_id, category, content, source)
    }

    pub fn add_decision(&self, task_id: &str, decision: &str, rationale: &str) -> Result<()> {
        self.manager.add_decision(task_id, decision, rationale)
    }

    pub fn add_resource(&self, task_id: &str, resource: &str) -> Result<()> {
        self.manager.add_resource(task_id, resource)
    }

    pub fn add_test_result(&self, task_id: &str, result: TestResult) -> Result<()> {
        self.manager.add_test_result(task_id, result)
    }

    pub fn record_error(
        &self,
        task_id: &str,
        error_msg: &str,
        attempt: u32,
        resolution: &str,
    ) -> Result<()> {
        self.manager
            .record_error(task_id, error_msg, attempt, resolution)
    }

    pub fn record_view_action(&self, task_id: &str, action_type: ActionType) -> Result<bool> {
        self.manager.record_view_action(task_id, action_type)
    }

    pub fn check_completion(&self, task_id: &str) -> Result<CompletionStatus> {
        CompletionChecker::new(self.manager.clone()).check(task_id)
    }

    pub fn get_task_summary(&self, task_id: &str) -> Result<TaskSummary> {
        self.manager.get_task_summary(task_id)
    }

    /// 构建优化上下文（压缩 + 摘要 + 稳定前缀）
    pub async fn get_optimized_context(
        &self,
        task_id: &str,
        tool_calls: &[ToolCall],
        cancel: &CancellationToken,
    ) -> Result<OptimizedContext> {
        let ctx = self
            .manager
            .get_task_context(task_id)?
            .ok_or_else(|| TaskError::not_found("task", task_id))?;
        self.context_engineer
            .build_optimized_context(&ctx, tool_calls, cancel)
            .await
    }

    /// 细化指定阶段的步骤列表
    pub async fn refine_phase(
        &self,
        task_id: &str,
        phase_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<TaskStep>> {
        let ctx = self
            .manager
            .get_task_context(task_id)?
            .ok_or_else(|| TaskError::not_found("task", task_id))?;
        self.planner.refine_phase(&ctx, phase_id, cancel).await
    }

    /// 委派子代理任务（上下文隔离）
    pub async fn delegate_task(
        &self,
        parent_task_id: &str,
        agent_task: AgentTask,
        cancel: &CancellationToken,
    ) -> Result<AgentTask> {
        self.coordinator
            .delegate_task(parent_task_id, agent_task, cancel)
            .await
    }

    /// 开始会话：创建任务并注册会话句柄
    pub fn start_session(&self, req: &PlanRequest) -> Result<SessionInfo> {
        let session = Arc::new(Session::new(self.manager.clone(), self.llm.clone()));
        let task = session.start(req)?;

        let info = SessionInfo {
            session_id: session.id.clone(),
            task_id: task.id.clone(),
            goal: task.goal.clone(),
            status: task.status.to_string(),
            started_at: session.started_at,
        };

        self.sessions
            .write()
            .unwrap()
            .insert(session.id.clone(), session);

        Ok(info)
    }

    pub fn get_session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().unwrap().get(session_id).cloned()
    }

    fn require_session(&self, session_id: &str) -> Result<Arc<Session>> {
        self.get_session(session_id)
            .ok_or_else(|| TaskError::not_found("session", session_id))
    }

    pub async fn execute_session(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecuteResponse> {
        let session = self.require_session(session_id)?;
        let result: ExecutionResult = session.execute(cancel).await?;

        let task_id = session.task_id().unwrap_or_default();
        let task = self.manager.get_task(&task_id)?;
        let (status, current_phase) = task
            .map(|t| (t.status, t.current_phase))
            .unwrap_or((TaskStatus::Pending, String::new()));

        Ok(ExecuteResponse {
            task_id,
            current_phase,
            status,
            message: result.message,
            next_action: result.next_action,
        })
    }

    pub fn check_session_stop(&self, session_id: &str) -> Result<CompletionStatus> {
        self.require_session(session_id)?.check_stop()
    }

    pub fn session_pre_action(&self, session_id: &str, action_name: &str) -> Result<()> {
        self.require_session(session_id)?.pre_action(action_name)
    }

    pub fn session_post_action(
        &self,
        session_id: &str,
        action_name: &str,
        action_type: ActionType,
    ) -> Result<bool> {
        self.require_session(session_id)?
            .post_action(action_name, action_type)
    }
}
