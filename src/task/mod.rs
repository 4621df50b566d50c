//! 任务内核：类似 Manus 的任务规划和执行系统
//!
//! 核心原则：
//! 1. 文件系统作为外部记忆（持久化，无限）
//! 2. 上下文窗口作为工作记忆（易失，有限）
//! 3. 通过复述操纵注意力（重读阈值）
//! 4. 保留错误信息用于学习（3 次打击规则）
//! 5. KV 缓存优化（稳定前缀、掩码而非移除）

pub mod context;
pub mod db;
pub mod error;
pub mod executor;
pub mod manager;
pub mod markdown;
pub mod planner;
pub mod prompts;
pub mod service;
pub mod session;
pub mod storage;
pub mod trackers;
pub mod types;

pub use context::{
    ContextCompressor, ContextEngineer, ContextEngineerConfig, ContextSummarizer,
    KVCacheOptimizer, MultiAgentCoordinator, OptimizedContext, ToolDefinition, ToolLoader,
};
pub use db::{create_storage, SqliteStorage, TaskQueryOptions, TaskStats};
pub use error::{Result, TaskError};
pub use executor::{
    DecisionFinding, ExecutionResult, Executor, ExecutorConfig, StepAction, StepAttempt,
    StepDecision,
};
pub use manager::Manager;
pub use planner::{
    clean_json_response, convert_to_task_phases, default_plan, PlanPhase, PlanStep, Planner,
    PlannerResult,
};
pub use service::{Service, SessionInfo};
pub use session::Session;
pub use storage::{FileStorage, Storage};
pub use trackers::{ActionTracker, CompletionChecker, CompletionStatus, ErrorTracker, RebootCheck};
pub use types::*;
