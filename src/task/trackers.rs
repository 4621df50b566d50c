//! 动作/错误追踪与完成检查
//!
//! - ActionTracker：动作前后钩子（重读标记消费 + 工具调用计数 + 2 动作规则）
//! - ErrorTracker：内存中的错误键计数，3 次打击升级；进程重启后计数归零（有意为之）
//! - CompletionChecker：完成检查 + 5 问题重启测试

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::task::error::Result;
use crate::task::manager::Manager;
use crate::task::types::{ActionType, PhaseStatus, TaskContext};

/// 动作追踪器：PreToolUse / PostToolUse 钩子行为
pub struct ActionTracker {
    manager: Arc<Manager>,
}

impl ActionTracker {
    pub fn new(manager: Arc<Manager>) -> Self {
        Self { manager }
    }

    /// 追踪动作，返回是否需要保存发现（2 动作规则）
    pub fn track_action(&self, task_id: &str, action_type: ActionType) -> Result<bool> {
        self.manager.record_view_action(task_id, action_type)
    }

    /// 动作前钩子：消费 needs_reread 标记，并增加工具调用计数
    pub fn pre_action_hook(&self, task_id: &str, action_name: &str) -> Result<()> {
        if let Some(task) = self.manager.get_task(task_id)? {
            if task.needs_reread {
                tracing::info!(task_id = %task_id, action = %action_name, "动作前应重读计划");
                self.manager.clear_needs_reread(task_id)?;
            }
        }

        let needs_reread = self.manager.increment_tool_call_count(task_id)?;
        if needs_reread {
            tracing::info!(task_id = %task_id, "工具调用达到阈值，应重读计划");
        }

        Ok(())
    }

    /// 动作后钩子：检查 2 动作规则
    pub fn post_action_hook(
        &self,
        task_id: &str,
        action_name: &str,
        action_type: ActionType,
    ) -> Result<bool> {
        let needs_save = self.track_action(task_id, action_type)?;
        if needs_save {
            tracing::info!(task_id = %task_id, action = %action_name, "2 动作规则触发，应保存发现");
        }
        Ok(needs_save)
    }
}

/// 错误追踪器：按任务 + 错误键计数，实现 3 次打击规则
pub struct ErrorTracker {
    manager: Arc<Manager>,
    /// task_id -> error_key -> count（仅存内存）
    error_counts: Mutex<HashMap<String, HashMap<String, u32>>>,
}

impl ErrorTracker {
    pub fn new(manager: Arc<Manager>) -> Self {
        Self {
            manager,
            error_counts: Mutex::new(HashMap::new()),
        }
    }

    /// 追踪错误：落库并返回（是否应升级给用户，当前计数）
    pub fn track_error(
        &self,
        task_id: &str,
        error_key: &str,
        error_msg: &str,
    ) -> Result<(bool, u32)> {
        let count = {
            let mut counts = self.error_counts.lock().unwrap();
            let entry = counts
                .entry(task_id.to_string())
                .or_default()
                .entry(error_key.to_string())
                .or_insert(0);
            *entry += 1;
            *entry
        };

        self.manager.record_error(task_id, error_msg, count, "")?;

        let should_escalate = count >= 3;
        if should_escalate {
            tracing::warn!(task_id = %task_id, error_key = %error_key, count, "错误达到 3 次，升级给用户");
        }

        Ok((should_escalate, count))
    }

    /// 解决错误：回写最近一条匹配记录的解决方案并重置计数
    pub fn resolve_error(&self, task_id: &str, error_key: &str, resolution: &str) -> Result<()> {
        self.manager.resolve_error(task_id, error_key, resolution)?;

        let mut counts = self.error_counts.lock().unwrap();
        if let Some(task_counts) = counts.get_mut(task_id) {
            task_counts.remove(error_key);
        }

        Ok(())
    }

    /// 1 < count < 3 时应换一种方法重试
    pub fn should_retry_with_different_approach(&self, task_id: &str, error_key: &str) -> bool {
        let counts = self.error_counts.lock().unwrap();
        let count = counts
            .get(task_id)
            .and_then(|c| c.get(error_key))
            .copied()
            .unwrap_or(0);
        count > 1 && count < 3
    }

    /// 任务删除时清理计数
    pub fn clear_task(&self, task_id: &str) {
        self.error_counts.lock().unwrap().remove(task_id);
    }
}

/// 完成状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionStatus {
    pub complete: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub incomplete_phases: Vec<String>,
    pub reboot_check: RebootCheck,
    pub can_stop: bool,
}

/// 5 问题重启检查：我在哪里 / 要去哪里 / 目标是什么 / 学到了什么 / 做了什么
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RebootCheck {
    pub where_am_i: String,
    pub where_going: String,
    pub what_is_goal: String,
    pub what_learned: String,
    pub what_done: String,
    pub all_answered: bool,
}

/// 完成检查器：Stop 钩子行为
pub struct CompletionChecker {
    manager: Arc<Manager>,
}

impl CompletionChecker {
    pub fn new(manager: Arc<Manager>) -> Self {
        Self { manager }
    }

    pub fn check(&self, task_id: &str) -> Result<CompletionStatus> {
        let (complete, incomplete) = self.manager.check_completion(task_id)?;
        let ctx = self
            .manager
            .get_task_context(task_id)?
            .ok_or_else(|| crate::task::error::TaskError::not_found("task", task_id))?;

        let reboot_check = perform_reboot_check(&ctx);
        let can_stop = complete && reboot_check.all_answered;

        Ok(CompletionStatus {
            complete,
            incomplete_phases: incomplete,
            reboot_check,
            can_stop,
        })
    }
}

fn perform_reboot_check(ctx: &TaskContext) -> RebootCheck {
    let task = &ctx.task;

    // 1. 我在哪里？当前阶段的显示名
    let where_am_i = task
        .phase(&task.current_phase)
        .map(|p| p.name.clone())
        .unwrap_or_else(|| task.current_phase.clone());

    // 2. 我要去哪里？当前阶段之后所有未完成阶段，箭头连接
    let mut remaining = Vec::new();
    let mut found_current = false;
    for p in &task.phases {
        if p.id == task.current_phase {
            found_current = true;
            continue;
        }
        if found_current && p.status != PhaseStatus::Complete {
            remaining.push(p.name.clone());
        }
    }
    let where_going = remaining.join(" → ");

    // 3-5. 目标 / 学到了什么 / 做了什么
    let what_is_goal = task.goal.clone();
    let what_learned = format!("{} 个发现", ctx.findings.findings.len());
    let what_done = format!("{} 个进度条目", ctx.progress.entries.len());

    let all_answered = !where_am_i.is_empty() && !what_is_goal.is_empty();

    RebootCheck {
        where_am_i,
        where_going,
        what_is_goal,
        what_learned,
        what_done,
        all_answered,
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::task::storage::FileStorage;
    use crate::task::types::{PlanRequest, TaskManagerConfig};

    fn build() -> (Arc<Manager>, std::path::PathBuf) {
        let root = std::env::temp_dir().join(format!("mantis-track-{}", Uuid::new_v4()));
        let storage = Arc::new(FileStorage::new(&root).unwrap());
        let config = TaskManagerConfig {
            storage_path: root.clone(),
            reread_threshold: 2,
            ..TaskManagerConfig::default()
        };
        (Arc::new(Manager::new(config, storage)), root)
    }

    fn create_task(manager: &Manager) -> String {
        manager
            .create_task(&PlanRequest {
                user_id: "u1".into(),
                session_id: "s1".into(),
                goal: "目标".into(),
                context: String::new(),
                constraints: vec![],
                preferences: vec![],
            })
            .unwrap()
            .id
    }

    #[test]
    fn test_pre_action_hook_consumes_reread_flag() {
        let (manager, root) = build();
        let task_id = create_task(&manager);
        let tracker = ActionTracker::new(manager.clone());

        manager.mark_needs_reread(&task_id).unwrap();
        tracker.pre_action_hook(&task_id, "read_file").unwrap();
        assert!(!manager.get_task(&task_id).unwrap().unwrap().needs_reread);

        // 阈值为 2：第二次调用把计数打满，重新标记
        tracker.pre_action_hook(&task_id, "read_file").unwrap();
        assert!(manager.get_task(&task_id).unwrap().unwrap().needs_reread);

        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_error_tracker_three_strikes() {
        let (manager, root) = build();
        let task_id = create_task(&manager);
        let tracker = ErrorTracker::new(manager.clone());

        let (esc, n) = tracker.track_error(&task_id, "timeout", "连接超时").unwrap();
        assert!(!esc);
        assert_eq!(n, 1);
        assert!(!tracker.should_retry_with_different_approach(&task_id, "timeout"));

        let (esc, n) = tracker.track_error(&task_id, "timeout", "连接超时").unwrap();
        assert!(!esc);
        assert_eq!(n, 2);
        assert!(tracker.should_retry_with_different_approach(&task_id, "timeout"));

        let (esc, n) = tracker.track_error(&task_id, "timeout", "连接超时").unwrap();
        assert!(esc);
        assert_eq!(n, 3);
        assert!(!tracker.should_retry_with_different_approach(&task_id, "timeout"));

        // 解决后计数归零
        tracker
            .resolve_error(&task_id, "timeout", "增加超时阈值")
            .unwrap();
        let (esc, n) = tracker.track_error(&task_id, "timeout", "连接超时").unwrap();
        assert!(!esc);
        assert_eq!(n, 1);

        let task = manager.get_task(&task_id).unwrap().unwrap();
        assert_eq!(task.errors.len(), 4);
        assert_eq!(task.errors[2].resolution, "增加超时阈值");

        // clear_task 丢弃该任务的所有内存计数
        tracker.clear_task(&task_id);
        let (_, n) = tracker.track_error(&task_id, "timeout", "连接超时").unwrap();
        assert_eq!(n, 1);

        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_completion_checker_reboot_questions() {
        let (manager, root) = build();
        let task_id = create_task(&manager);
        let checker = CompletionChecker::new(manager.clone());

        let status = checker.check(&task_id).unwrap();
        assert!(!status.complete);
        assert_eq!(status.incomplete_phases.len(), 5);
        assert_eq!(status.reboot_check.where_am_i, "Requirements & Discovery");
        assert!(status.reboot_check.where_going.contains(" → "));
        assert_eq!(status.reboot_check.what_is_goal, "目标");
        assert!(status.reboot_check.all_answered);
        assert!(!status.can_stop);

        for i in 1..=5 {
            manager
                .update_phase_status(&task_id, &format!("phase_{}", i), PhaseStatus::Complete)
                .unwrap();
        }

        let status = checker.check(&task_id).unwrap();
        assert!(status.complete);
        assert!(status.incomplete_phases.is_empty());
        assert!(status.can_stop);
        assert!(status.reboot_check.where_going.is_empty());

        std::fs::remove_dir_all(&root).ok();
    }
}
