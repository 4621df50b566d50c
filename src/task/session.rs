//! 会话：绑定一次任务执行的运行时句柄
//!
//! 一个 Session 持有 Manager + Executor + 各追踪器，围绕单个任务提供
//! 启动 / 执行 / 停止检查 / 动作前后钩子。

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::llm::LlmClient;
use crate::task::error::{Result, TaskError};
use crate::task::executor::{ExecutionResult, Executor, ExecutorConfig};
use crate::task::manager::Manager;
use crate::task::trackers::{ActionTracker, CompletionChecker, CompletionStatus, ErrorTracker};
use crate::task::types::{ActionType, PlanRequest, Task};

/// 会话：一次任务执行的运行时句柄
pub struct Session {
    pub id: String,
    pub started_at: DateTime<Utc>,
    task_id: RwLock<Option<String>>,
    manager: Arc<Manager>,
    executor: Executor,
    tracker: ActionTracker,
    err_tracker: ErrorTracker,
    checker: CompletionChecker,
}

impl Session {
    pub fn new(manager: Arc<Manager>, llm: Arc<dyn LlmClient>) -> Self {
        let max_retries = manager.config().max_retries;
        let executor = Executor::new(
            llm,
            manager.clone(),
            ExecutorConfig {
                max_retries,
                ..ExecutorConfig::default()
            },
        );
        Self {
            id: format!("session_{}", Uuid::new_v4().simple()),
            started_at: Utc::now(),
            task_id: RwLock::new(None),
            tracker: ActionTracker::new(manager.clone()),
            err_tracker: ErrorTracker::new(manager.clone()),
            checker: CompletionChecker::new(manager.clone()),
            manager,
            executor,
        }
    }

    pub fn task_id(&self) -> Option<String> {
        self.task_id.read().unwrap().clone()
    }

    fn require_task_id(&self) -> Result<String> {
        self.task_id()
            .ok_or_else(|| TaskError::InvalidInput("no task associated with session".to_string()))
    }

    /// 开始会话：创建任务并绑定其 ID
    pub fn start(&self, req: &PlanRequest) -> Result<Task> {
        let task = self.manager.create_task(req)?;
        *self.task_id.write().unwrap() = Some(task.id.clone());
        tracing::info!(session_id = %self.id, task_id = %task.id, "会话已启动");
        Ok(task)
    }

    /// 执行绑定的任务
    pub async fn execute(&self, cancel: &CancellationToken) -> Result<ExecutionResult> {
        let task_id = self.require_task_id()?;
        self.executor.execute_task(&task_id, cancel).await
    }

    /// 检查是否可以停止（完成检查 + 5 问题重启测试）
    pub fn check_stop(&self) -> Result<CompletionStatus> {
        let task_id = self.require_task_id()?;
        self.checker.check(&task_id)
    }

    /// 动作前钩子
    pub fn pre_action(&self, action_name: &str) -> Result<()> {
        match self.task_id() {
            Some(task_id) => self.tracker.pre_action_hook(&task_id, action_name),
            None => Ok(()),
        }
    }

    /// 动作后钩子，返回是否需要保存发现
    pub fn post_action(&self, action_name: &str, action_type: ActionType) -> Result<bool> {
        match self.task_id() {
            Some(task_id) => self
                .tracker
                .post_action_hook(&task_id, action_name, action_type),
            None => Ok(false),
        }
    }

    /// 记录错误，返回（是否升级给用户，计数）
    pub fn record_error(&self, error_key: &str, error_msg: &str) -> Result<(bool, u32)> {
        match self.task_id() {
            Some(task_id) => self.err_tracker.track_error(&task_id, error_key, error_msg),
            None => Ok((false, 0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::task::storage::FileStorage;
    use crate::task::types::TaskManagerConfig;

    fn build_session() -> (Session, std::path::PathBuf) {
        let root = std::env::temp_dir().join(format!("mantis-session-{}", Uuid::new_v4()));
        let storage = Arc::new(FileStorage::new(&root).unwrap());
        let config = TaskManagerConfig {
            storage_path: root.clone(),
            ..TaskManagerConfig::default()
        };
        let manager = Arc::new(Manager::new(config, storage));
        let llm = Arc::new(MockLlmClient::always(
            r#"{"action": "complete", "message": "完成"}"#,
        ));
        (Session::new(manager, llm), root)
    }

    fn plan_request() -> PlanRequest {
        PlanRequest {
            user_id: "u1".into(),
            session_id: "s1".into(),
            goal: "目标".into(),
            context: String::new(),
            constraints: vec![],
            preferences: vec![],
        }
    }

    #[tokio::test]
    async fn test_session_full_lifecycle() {
        let (session, root) = build_session();

        let task = session.start(&plan_request()).unwrap();
        assert_eq!(session.task_id().as_deref(), Some(task.id.as_str()));

        let result = session.execute(&CancellationToken::new()).await.unwrap();
        assert!(result.success);

        let status = session.check_stop().unwrap();
        assert!(status.complete);
        assert!(status.can_stop);

        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn test_session_hooks_without_task_are_noops() {
        let (session, root) = build_session();

        session.pre_action("read_file").unwrap();
        assert!(!session.post_action("read_file", ActionType::View).unwrap());
        assert_eq!(session.record_error("k", "msg").unwrap(), (false, 0));
        assert!(session.execute(&CancellationToken::new()).await.is_err());

        std::fs::remove_dir_all(&root).ok();
    }
}
