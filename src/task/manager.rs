//! 任务管理器：进程内内核
//!
//! 持有活跃任务缓存并串行化所有变更；变更遵循「先改副本、成功落盘、再提交缓存」，
//! 存储失败时内存状态不会被污染。锁覆盖整个变更 + 落盘序列以保持不变量。

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use uuid::Uuid;

use crate::task::error::{Result, TaskError};
use crate::task::storage::Storage;
use crate::task::types::{
    ActionType, Decision, ErrorRecord, Finding, PhaseStatus, PlanRequest, ProgressEntry, Task,
    TaskContext, TaskFindings, TaskManagerConfig, TaskPhase, TaskProgress, TaskStatus, TaskStep,
    TaskSummary, TestResult,
};

#[derive(Default)]
struct ManagerState {
    /// 活跃任务缓存（对存储的写穿透加速器）
    active_tasks: HashMap<String, TaskContext>,
    /// 视图动作计数（2 动作规则，仅存内存）
    view_action_count: HashMap<String, u32>,
}

/// 任务管理器
pub struct Manager {
    config: TaskManagerConfig,
    storage: Arc<dyn Storage>,
    state: RwLock<ManagerState>,
}

impl Manager {
    pub fn new(config: TaskManagerConfig, storage: Arc<dyn Storage>) -> Self {
        Self {
            config,
            storage,
            state: RwLock::new(ManagerState::default()),
        }
    }

    pub fn config(&self) -> &TaskManagerConfig {
        &self.config
    }

    /// 取出可变更副本：缓存命中则克隆，否则从存储加载
    fn load_for_update(&self, state: &ManagerState, task_id: &str) -> Result<TaskContext> {
        if let Some(ctx) = state.active_tasks.get(task_id) {
            return Ok(ctx.clone());
        }
        self.storage
            .load_context(task_id)?
            .ok_or_else(|| TaskError::not_found("task", task_id))
    }

    /// 全量落盘后提交缓存
    fn commit(&self, state: &mut ManagerState, mut ctx: TaskContext) -> Result<()> {
        let now = Utc::now();
        ctx.task.updated_at = now;
        ctx.findings.updated_at = now;
        ctx.progress.updated_at = now;
        self.storage.save_context(&ctx)?;
        state.active_tasks.insert(ctx.task.id.clone(), ctx);
        Ok(())
    }

    /// 只落盘任务本体（发现/进度未变的操作）
    fn commit_task(&self, state: &mut ManagerState, mut ctx: TaskContext) -> Result<()> {
        ctx.task.updated_at = Utc::now();
        self.storage.save_task(&ctx.task)?;
        state.active_tasks.insert(ctx.task.id.clone(), ctx);
        Ok(())
    }

    /// 创建新任务：默认 5 阶段模板 + 空发现/进度
    pub fn create_task(&self, req: &PlanRequest) -> Result<Task> {
        let mut state = self.state.write().unwrap();

        let task_id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let task = Task {
            id: task_id.clone(),
            user_id: req.user_id.clone(),
            session_id: req.session_id.clone(),
            goal: req.goal.clone(),
            current_phase: "phase_1".to_string(),
            phases: default_phases(),
            key_questions: Vec::new(),
            decisions: Vec::new(),
            errors: Vec::new(),
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            completed_at: None,
            tool_call_count: 0,
            needs_reread: false,
        };

        let ctx = TaskContext {
            findings: TaskFindings::empty(&task_id, now),
            progress: TaskProgress::empty(&task_id, now),
            task,
        };

        self.commit(&mut state, ctx)?;
        tracing::info!(task_id = %task_id, goal = %req.goal, "创建任务");

        Ok(state.active_tasks[&task_id].task.clone())
    }

    pub fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        {
            let state = self.state.read().unwrap();
            if let Some(ctx) = state.active_tasks.get(task_id) {
                return Ok(Some(ctx.task.clone()));
            }
        }
        self.storage.load_task(task_id)
    }

    pub fn get_task_context(&self, task_id: &str) -> Result<Option<TaskContext>> {
        {
            let state = self.state.read().unwrap();
            if let Some(ctx) = state.active_tasks.get(task_id) {
                return Ok(Some(ctx.clone()));
            }
        }
        self.storage.load_context(task_id)
    }

    /// 用规划结果替换任务阶段（规划成功后由 Service 调用）
    pub fn apply_plan(
        &self,
        task_id: &str,
        phases: Vec<TaskPhase>,
        key_questions: Vec<String>,
    ) -> Result<Task> {
        let mut state = self.state.write().unwrap();
        let mut ctx = self.load_for_update(&state, task_id)?;

        if let Some(first) = phases.first() {
            ctx.task.current_phase = first.id.clone();
        }
        ctx.task.phases = phases;
        ctx.task.key_questions = key_questions;

        self.commit_task(&mut state, ctx)?;
        Ok(state.active_tasks[task_id].task.clone())
    }

    /// 更新阶段状态
    ///
    /// 状态真正发生迁移时才写时间戳与进度条目，重复同状态调用除 updated_at 外不可观测；
    /// 阶段完成时自动晋升下一阶段，全部完成时任务置为 completed。
    pub fn update_phase_status(
        &self,
        task_id: &str,
        phase_id: &str,
        status: PhaseStatus,
    ) -> Result<()> {
        let mut state = self.state.write().unwrap();
        let mut ctx = self.load_for_update(&state, task_id)?;

        let now = Utc::now();
        let phase = ctx
            .task
            .phase_mut(phase_id)
            .ok_or_else(|| TaskError::not_found("phase", phase_id))?;

        // 时间戳与进度条目只在真正迁移时写；晋升逻辑自身幂等，重复调用无可观测变化
        let transitioned = phase.status != status;
        phase.status = status;

        match status {
            PhaseStatus::InProgress => {
                if phase.started_at.is_none() {
                    phase.started_at = Some(now);
                }
                if ctx.task.status != TaskStatus::Completed {
                    ctx.task.status = TaskStatus::InProgress;
                }
            }
            PhaseStatus::Complete => {
                if transitioned {
                    phase.completed_at = Some(now);
                }

                // 自动晋升：当前阶段完成后，下一阶段进入 in_progress
                if let Some(next_id) = ctx.task.next_phase_id(phase_id) {
                    ctx.task.current_phase = next_id.clone();
                    let next = ctx.task.phase_mut(&next_id).expect("next phase exists");
                    if next.status != PhaseStatus::Complete {
                        next.status = PhaseStatus::InProgress;
                        if next.started_at.is_none() {
                            next.started_at = Some(now);
                        }
                        ctx.task.status = TaskStatus::InProgress;
                    }
                }

                if ctx.task.all_phases_complete() {
                    ctx.task.status = TaskStatus::Completed;
                    if ctx.task.completed_at.is_none() {
                        ctx.task.completed_at = Some(now);
                    }
                }
            }
            _ => {}
        }

        if !transitioned {
            return self.commit(&mut state, ctx);
        }

        ctx.progress.entries.push(ProgressEntry {
            phase_id: phase_id.to_string(),
            action: format!("Phase status updated to {}", status),
            files: Vec::new(),
            timestamp: now,
        });

        self.commit(&mut state, ctx)
    }

    pub fn start_phase(&self, task_id: &str, phase_id: &str) -> Result<()> {
        self.update_phase_status(task_id, phase_id, PhaseStatus::InProgress)
    }

    /// 完成步骤；该阶段所有步骤完成时阶段自动置 complete，但不晋升下一阶段
    pub fn complete_step(
        &self,
        task_id: &str,
        phase_id: &str,
        step_id: &str,
        result: &str,
    ) -> Result<()> {
        let mut state = self.state.write().unwrap();
        let mut ctx = self.load_for_update(&state, task_id)?;

        let now = Utc::now();
        let phase = ctx
            .task
            .phase_mut(phase_id)
            .ok_or_else(|| TaskError::not_found("phase", phase_id))?;
        let step = phase
            .steps
            .iter_mut()
            .find(|s| s.id == step_id)
            .ok_or_else(|| TaskError::not_found("step", step_id))?;

        step.completed = true;
        step.result = result.to_string();

        if phase.steps.iter().all(|s| s.completed) && phase.status != PhaseStatus::Complete {
            phase.status = PhaseStatus::Complete;
            phase.completed_at = Some(now);
        }

        if ctx.task.all_phases_complete() && ctx.task.status != TaskStatus::Completed {
            ctx.task.status = TaskStatus::Completed;
            ctx.task.completed_at = Some(now);
        }

        ctx.progress.entries.push(ProgressEntry {
            phase_id: phase_id.to_string(),
            action: format!("Completed step {}: {}", step_id, result),
            files: Vec::new(),
            timestamp: now,
        });

        self.commit(&mut state, ctx)
    }

    pub fn set_task_status(&self, task_id: &str, status: TaskStatus) -> Result<()> {
        let mut state = self.state.write().unwrap();
        let mut ctx = self.load_for_update(&state, task_id)?;
        ctx.task.status = status;
        if status == TaskStatus::Completed && ctx.task.completed_at.is_none() {
            ctx.task.completed_at = Some(Utc::now());
        }
        self.commit_task(&mut state, ctx)
    }

    /// 记录错误：同一条记录进任务错误表与进度错误日志
    pub fn record_error(
        &self,
        task_id: &str,
        error_msg: &str,
        attempt: u32,
        resolution: &str,
    ) -> Result<()> {
        let mut state = self.state.write().unwrap();
        let mut ctx = self.load_for_update(&state, task_id)?;

        let record = ErrorRecord {
            error: error_msg.to_string(),
            attempt,
            resolution: resolution.to_string(),
            timestamp: Utc::now(),
            phase_id: ctx.task.current_phase.clone(),
        };

        ctx.task.errors.push(record.clone());
        ctx.progress.error_log.push(record);

        tracing::warn!(task_id = %task_id, attempt, error = %error_msg, "记录任务错误");

        self.commit(&mut state, ctx)
    }

    /// 更新最近一条匹配错误的解决方案
    pub fn resolve_error(&self, task_id: &str, error_key: &str, resolution: &str) -> Result<()> {
        let mut state = self.state.write().unwrap();
        let mut ctx = self.load_for_update(&state, task_id)?;

        if let Some(record) = ctx
            .task
            .errors
            .iter_mut()
            .rev()
            .find(|e| e.error.contains(error_key))
        {
            record.resolution = resolution.to_string();
        }
        if let Some(record) = ctx
            .progress
            .error_log
            .iter_mut()
            .rev()
            .find(|e| e.error.contains(error_key))
        {
            record.resolution = resolution.to_string();
        }

        self.commit(&mut state, ctx)
    }

    pub fn add_decision(&self, task_id: &str, decision: &str, rationale: &str) -> Result<()> {
        let mut state = self.state.write().unwrap();
        let mut ctx = self.load_for_update(&state, task_id)?;

        ctx.task.decisions.push(Decision {
            decision: decision.to_string(),
            rationale: rationale.to_string(),
            timestamp: Utc::now(),
            phase_id: ctx.task.current_phase.clone(),
        });

        self.commit(&mut state, ctx)
    }

    pub fn add_finding(
        &self,
        task_id: &str,
        category: &str,
        content: &str,
        source: &str,
    ) -> Result<()> {
        let mut state = self.state.write().unwrap();
        let mut ctx = self.load_for_update(&state, task_id)?;

        ctx.findings.findings.push(Finding {
            category: category.to_string(),
            content: content.to_string(),
            source: source.to_string(),
            timestamp: Utc::now(),
        });

        self.commit(&mut state, ctx)
    }

    pub fn add_requirement(&self, task_id: &str, requirement: &str) -> Result<()> {
        let mut state = self.state.write().unwrap();
        let mut ctx = self.load_for_update(&state, task_id)?;
        ctx.findings.requirements.push(requirement.to_string());
        self.commit(&mut state, ctx)
    }

    pub fn add_key_question(&self, task_id: &str, question: &str) -> Result<()> {
        let mut state = self.state.write().unwrap();
        let mut ctx = self.load_for_update(&state, task_id)?;
        ctx.task.key_questions.push(question.to_string());
        self.commit_task(&mut state, ctx)
    }

    pub fn add_resource(&self, task_id: &str, resource: &str) -> Result<()> {
        let mut state = self.state.write().unwrap();
        let mut ctx = self.load_for_update(&state, task_id)?;
        ctx.findings.resources.push(resource.to_string());
        self.commit(&mut state, ctx)
    }

    pub fn add_test_result(&self, task_id: &str, result: TestResult) -> Result<()> {
        let mut state = self.state.write().unwrap();
        let mut ctx = self.load_for_update(&state, task_id)?;
        ctx.progress.test_results.push(result);
        self.commit(&mut state, ctx)
    }

    /// 记录视图动作（2 动作规则）：每 2 次查看类操作返回一次 needs_save=true
    pub fn record_view_action(&self, task_id: &str, action_type: ActionType) -> Result<bool> {
        if !self.config.two_action_rule_enabled || !action_type.is_view_action() {
            return Ok(false);
        }

        let mut state = self.state.write().unwrap();
        let count = state
            .view_action_count
            .entry(task_id.to_string())
            .or_insert(0);
        *count += 1;

        let needs_save = *count >= 2;
        if needs_save {
            *count = 0;
            tracing::info!(task_id = %task_id, "2 动作规则触发，应保存发现");
        }

        Ok(needs_save)
    }

    /// 增加工具调用计数；达到重读阈值时归零并标记 needs_reread（注意力操纵）
    pub fn increment_tool_call_count(&self, task_id: &str) -> Result<bool> {
        let mut state = self.state.write().unwrap();
        let mut ctx = self.load_for_update(&state, task_id)?;

        ctx.task.tool_call_count += 1;

        let needs_reread = ctx.task.tool_call_count >= self.config.reread_threshold;
        if needs_reread {
            ctx.task.tool_call_count = 0;
            ctx.task.needs_reread = true;
            tracing::info!(task_id = %task_id, "达到重读阈值，应重读计划");
        }

        self.commit_task(&mut state, ctx)?;
        Ok(needs_reread)
    }

    pub fn mark_needs_reread(&self, task_id: &str) -> Result<()> {
        let mut state = self.state.write().unwrap();
        let mut ctx = self.load_for_update(&state, task_id)?;
        ctx.task.needs_reread = true;
        self.commit_task(&mut state, ctx)
    }

    pub fn clear_needs_reread(&self, task_id: &str) -> Result<()> {
        let mut state = self.state.write().unwrap();
        let mut ctx = self.load_for_update(&state, task_id)?;
        ctx.task.needs_reread = false;
        self.commit_task(&mut state, ctx)
    }

    /// 任务摘要：最近 5 条决策、最近 3 条错误、一行概要
    pub fn get_task_summary(&self, task_id: &str) -> Result<TaskSummary> {
        let ctx = self
            .get_task_context(task_id)?
            .ok_or_else(|| TaskError::not_found("task", task_id))?;
        let task = &ctx.task;

        let completed_phases: Vec<String> = task
            .phases
            .iter()
            .filter(|p| p.status == PhaseStatus::Complete)
            .map(|p| p.name.clone())
            .collect();

        let key_decisions: Vec<String> = task
            .decisions
            .iter()
            .rev()
            .take(5)
            .rev()
            .map(|d| d.decision.clone())
            .collect();

        let recent_errors: Vec<String> = task
            .errors
            .iter()
            .rev()
            .take(3)
            .rev()
            .map(|e| e.error.clone())
            .collect();

        let summary = format!(
            "目标: {}\n当前阶段: {}\n已完成: {}/{} 阶段",
            task.goal,
            task.current_phase,
            completed_phases.len(),
            task.phases.len()
        );

        Ok(TaskSummary {
            task_id: task_id.to_string(),
            goal: task.goal.clone(),
            current_phase: task.current_phase.clone(),
            completed_phases,
            key_decisions,
            recent_errors,
            summary,
        })
    }

    /// 检查完成状态：返回（是否全部完成，未完成阶段名列表）
    pub fn check_completion(&self, task_id: &str) -> Result<(bool, Vec<String>)> {
        let ctx = self
            .get_task_context(task_id)?
            .ok_or_else(|| TaskError::not_found("task", task_id))?;

        let incomplete: Vec<String> = ctx
            .task
            .phases
            .iter()
            .filter(|p| p.status != PhaseStatus::Complete)
            .map(|p| p.name.clone())
            .collect();

        Ok((incomplete.is_empty(), incomplete))
    }

    pub fn list_tasks(&self, user_id: &str, session_id: &str) -> Result<Vec<Task>> {
        self.storage.list_tasks(user_id, session_id)
    }

    /// 删除任务：清缓存与计数器，存储级联删除发现与进度
    pub fn delete_task(&self, task_id: &str) -> Result<()> {
        let mut state = self.state.write().unwrap();
        state.active_tasks.remove(task_id);
        state.view_action_count.remove(task_id);
        self.storage.delete_task(task_id)
    }
}

/// 默认 5 阶段模板（Discovery → Planning → Implementation → Testing → Delivery）
fn default_phases() -> Vec<TaskPhase> {
    let phase = |id: &str, name: &str, description: &str, order: u32, steps: Vec<TaskStep>| {
        TaskPhase {
            id: id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            status: PhaseStatus::Pending,
            steps,
            started_at: None,
            completed_at: None,
            order,
        }
    };
    let step = |id: &str, description: &str| TaskStep {
        id: id.to_string(),
        description: description.to_string(),
        completed: false,
        result: String::new(),
    };

    vec![
        phase(
            "phase_1",
            "Requirements & Discovery",
            "理解需求并收集信息",
            1,
            vec![
                step("step_1_1", "理解用户意图"),
                step("step_1_2", "识别约束和需求"),
                step("step_1_3", "记录发现到 findings"),
            ],
        ),
        phase(
            "phase_2",
            "Planning & Structure",
            "规划方案和结构",
            2,
            vec![
                step("step_2_1", "定义技术方案"),
                step("step_2_2", "创建项目结构"),
                step("step_2_3", "记录决策和理由"),
            ],
        ),
        phase(
            "phase_3",
            "Implementation",
            "执行实现",
            3,
            vec![
                step("step_3_1", "按步骤执行计划"),
                step("step_3_2", "先写代码再执行"),
                step("step_3_3", "增量测试"),
            ],
        ),
        phase(
            "phase_4",
            "Testing & Verification",
            "测试和验证",
            4,
            vec![
                step("step_4_1", "验证所有需求已满足"),
                step("step_4_2", "记录测试结果"),
                step("step_4_3", "修复发现的问题"),
            ],
        ),
        phase(
            "phase_5",
            "Delivery",
            "交付和总结",
            5,
            vec![
                step("step_5_1", "审查所有输出文件"),
                step("step_5_2", "确保交付物完整"),
                step("step_5_3", "交付给用户"),
            ],
        ),
    ]
}
