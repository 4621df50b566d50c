//! 任务内核数据模型：任务 / 阶段 / 步骤与配套记录
//!
//! 所有持久化实体派生 Serialize/Deserialize，JSON 为权威格式，Markdown 镜像仅供人读。

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "in_progress" => Some(TaskStatus::InProgress),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 阶段状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    InProgress,
    Complete,
    Failed,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::InProgress => "in_progress",
            PhaseStatus::Complete => "complete",
            PhaseStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PhaseStatus::Pending),
            "in_progress" => Some(PhaseStatus::InProgress),
            "complete" => Some(PhaseStatus::Complete),
            "failed" => Some(PhaseStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 存储类型：file 文件 / db 数据库 / hybrid 混合（数据库权威 + 文件镜像）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    File,
    Db,
    Hybrid,
}

/// 动作类型（用于 2 动作规则）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    View,
    Browser,
    Search,
    Write,
    Execute,
}

impl ActionType {
    /// 是否为查看类动作（仅这些参与 2 动作规则计数）
    pub fn is_view_action(&self) -> bool {
        matches!(self, ActionType::View | ActionType::Browser | ActionType::Search)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "view" => Some(ActionType::View),
            "browser" => Some(ActionType::Browser),
            "search" => Some(ActionType::Search),
            "write" => Some(ActionType::Write),
            "execute" => Some(ActionType::Execute),
            _ => None,
        }
    }
}

/// 任务步骤
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStep {
    pub id: String,
    pub description: String,
    pub completed: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub result: String,
}

/// 任务阶段
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPhase {
    pub id: String,
    pub name: String,
    pub description: String,
    pub status: PhaseStatus,
    pub steps: Vec<TaskStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// 阶段执行顺序（从 1 开始）
    pub order: u32,
}

/// 错误记录：保留用于学习，避免重复失败
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub error: String,
    /// 尝试次数（≥1）
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resolution: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub phase_id: String,
}

/// 决策记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub decision: String,
    pub rationale: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub phase_id: String,
}

/// 发现记录（research/technical/visual/resource）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub category: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

/// 进度条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub phase_id: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// 测试结果（status：✓通过 / ✗失败 / pending 待测试）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub test: String,
    pub input: String,
    pub expected: String,
    pub actual: String,
    pub status: String,
}

/// 任务（对应 task_plan.md）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub user_id: String,
    pub session_id: String,
    pub goal: String,
    /// 当前执行阶段 ID，总是引用 phases 中存在的阶段
    pub current_phase: String,
    pub phases: Vec<TaskPhase>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_questions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub decisions: Vec<Decision>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ErrorRecord>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// 工具调用计数，达到重读阈值时归零并置 needs_reread
    #[serde(default)]
    pub tool_call_count: u32,
    #[serde(default)]
    pub needs_reread: bool,
}

impl Task {
    pub fn phase(&self, phase_id: &str) -> Option<&TaskPhase> {
        self.phases.iter().find(|p| p.id == phase_id)
    }

    pub fn phase_mut(&mut self, phase_id: &str) -> Option<&mut TaskPhase> {
        self.phases.iter_mut().find(|p| p.id == phase_id)
    }

    /// 当前阶段之后的下一个阶段 ID
    pub fn next_phase_id(&self, phase_id: &str) -> Option<String> {
        let idx = self.phases.iter().position(|p| p.id == phase_id)?;
        self.phases.get(idx + 1).map(|p| p.id.clone())
    }

    pub fn all_phases_complete(&self) -> bool {
        self.phases.iter().all(|p| p.status == PhaseStatus::Complete)
    }
}

/// 任务发现（对应 findings.md）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFindings {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requirements: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub findings: Vec<Finding>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl TaskFindings {
    pub fn empty(task_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            task_id: task_id.into(),
            requirements: Vec::new(),
            findings: Vec::new(),
            resources: Vec::new(),
            updated_at: now,
        }
    }
}

/// 任务进度（对应 progress.md）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProgress {
    pub task_id: String,
    /// 会话日期（格式：YYYY-MM-DD）
    pub session_date: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entries: Vec<ProgressEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub test_results: Vec<TestResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_log: Vec<ErrorRecord>,
    pub updated_at: DateTime<Utc>,
}

impl TaskProgress {
    pub fn empty(task_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            task_id: task_id.into(),
            session_date: now.format("%Y-%m-%d").to_string(),
            entries: Vec::new(),
            test_results: Vec::new(),
            error_log: Vec::new(),
            updated_at: now,
        }
    }
}

/// 任务上下文：任务 + 发现 + 进度，加载时三者一起加载
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskContext {
    pub task: Task,
    pub findings: TaskFindings,
    pub progress: TaskProgress,
}

/// 工具调用记录（瞬态，内核不持久化；来自 HTTP 的字段可部分省略）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub args: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub result: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// 是否已被上下文压缩
    #[serde(default)]
    pub compressed: bool,
}

/// 上下文压缩配置（用于 KV 缓存优化）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextCompression {
    /// 上下文中保留的最大工具结果数
    pub max_tool_results_in_context: usize,
    pub compress_older_results: bool,
    /// 只保留引用（文件路径、URL 等），不保留完整内容
    pub keep_references_only: bool,
}

impl Default for ContextCompression {
    fn default() -> Self {
        Self {
            max_tool_results_in_context: DEFAULT_MAX_TOOL_RESULTS_IN_CONTEXT,
            compress_older_results: true,
            keep_references_only: false,
        }
    }
}

/// 默认任务存储路径
pub const DEFAULT_TASK_STORAGE_PATH: &str = ".tasks";
/// 默认重读计划的工具调用阈值（Manus 的 10 次规则）
pub const DEFAULT_REREAD_THRESHOLD: u32 = 10;
/// 默认最大重试次数（3 次打击规则）
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// 上下文中保留的最大工具结果数
pub const DEFAULT_MAX_TOOL_RESULTS_IN_CONTEXT: usize = 5;

/// 任务管理器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskManagerConfig {
    pub storage_type: StorageType,
    pub storage_path: PathBuf,
    /// SQLite 数据库文件（db / hybrid 模式）
    pub db_path: PathBuf,
    /// 混合模式下是否同步到文件系统
    pub enable_file_sync: bool,

    pub reread_threshold: u32,
    pub two_action_rule_enabled: bool,
    pub compression: ContextCompression,
    pub max_retries: u32,
    pub enable_auto_planning: bool,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            storage_type: StorageType::File,
            storage_path: PathBuf::from(DEFAULT_TASK_STORAGE_PATH),
            db_path: PathBuf::from(DEFAULT_TASK_STORAGE_PATH).join("tasks.db"),
            enable_file_sync: true,
            reread_threshold: DEFAULT_REREAD_THRESHOLD,
            two_action_rule_enabled: true,
            compression: ContextCompression::default(),
            max_retries: DEFAULT_MAX_RETRIES,
            enable_auto_planning: true,
        }
    }
}

/// 规划请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRequest {
    pub user_id: String,
    pub session_id: String,
    pub goal: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub context: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preferences: Vec<String>,
}

/// 规划响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanResponse {
    pub task_id: String,
    pub goal: String,
    pub phases: Vec<TaskPhase>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub estimate: String,
}

/// 执行请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub phase_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub step_id: String,
}

/// 执行响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub task_id: String,
    pub current_phase: String,
    pub status: TaskStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub next_action: String,
}

/// 任务摘要（用于上下文压缩）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: String,
    pub goal: String,
    pub current_phase: String,
    pub completed_phases: Vec<String>,
    /// 最近 5 条决策摘要
    pub key_decisions: Vec<String>,
    /// 最近 3 条错误摘要
    pub recent_errors: Vec<String>,
    pub summary: String,
}

/// 代理角色（多代理上下文隔离）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Planner,
    Executor,
    Reviewer,
    Researcher,
}

/// 子代理任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    pub id: String,
    pub role: AgentRole,
    pub description: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub input: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub output: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serde_round_trip() {
        let s = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(s, "\"in_progress\"");
        let back: TaskStatus = serde_json::from_str(&s).unwrap();
        assert_eq!(back, TaskStatus::InProgress);

        let p = serde_json::to_string(&PhaseStatus::Complete).unwrap();
        assert_eq!(p, "\"complete\"");
    }

    #[test]
    fn test_action_type_view_classification() {
        assert!(ActionType::View.is_view_action());
        assert!(ActionType::Browser.is_view_action());
        assert!(ActionType::Search.is_view_action());
        assert!(!ActionType::Write.is_view_action());
        assert!(!ActionType::Execute.is_view_action());
    }

    #[test]
    fn test_default_manager_config() {
        let cfg = TaskManagerConfig::default();
        assert_eq!(cfg.storage_path, PathBuf::from(".tasks"));
        assert_eq!(cfg.reread_threshold, 10);
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.compression.max_tool_results_in_context, 5);
    }
}
