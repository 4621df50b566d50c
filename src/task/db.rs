//! SQLite 存储后端与混合模式
//!
//! 三张表按任务 ID 关联；写入为单语句 UPSERT，删除在一个事务内级联三张表。
//! 混合模式下数据库为权威，文件镜像在成功写库后由独立线程异步生成，镜像失败只告警。

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::task::error::{Result, TaskError};
use crate::task::storage::{FileStorage, Storage};
use crate::task::types::{
    StorageType, Task, TaskContext, TaskFindings, TaskManagerConfig, TaskProgress, TaskStatus,
};

/// 按配置创建存储后端
pub fn create_storage(config: &TaskManagerConfig) -> Result<Arc<dyn Storage>> {
    match config.storage_type {
        StorageType::File => Ok(Arc::new(FileStorage::new(&config.storage_path)?)),
        StorageType::Db => Ok(Arc::new(SqliteStorage::new(&config.db_path, None)?)),
        StorageType::Hybrid => {
            let mirror = if config.enable_file_sync {
                Some(Arc::new(FileStorage::new(&config.storage_path)?))
            } else {
                None
            };
            Ok(Arc::new(SqliteStorage::new(&config.db_path, mirror)?))
        }
    }
}

/// 任务查询选项（数据库特有的高级查询）
#[derive(Debug, Clone, Default)]
pub struct TaskQueryOptions {
    pub user_id: String,
    pub session_id: String,
    pub status: String,
    pub keyword: String,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub offset: u32,
    pub limit: u32,
    pub order_by: String,
    pub order_desc: bool,
}

/// 按状态统计
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TaskStats {
    pub total: u32,
    pub pending: u32,
    pub in_progress: u32,
    pub completed: u32,
    pub failed: u32,
}

/// SQLite 存储实现，可选文件镜像（混合模式）
pub struct SqliteStorage {
    conn: Mutex<Connection>,
    file_mirror: Option<Arc<FileStorage>>,
}

impl SqliteStorage {
    pub fn new(db_path: impl AsRef<Path>, file_mirror: Option<Arc<FileStorage>>) -> Result<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        let storage = Self {
            conn: Mutex::new(conn),
            file_mirror,
        };
        storage.init_tables()?;
        Ok(storage)
    }

    fn init_tables(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                goal TEXT NOT NULL,
                current_phase TEXT NOT NULL,
                phases_json TEXT NOT NULL,
                questions_json TEXT NOT NULL,
                decisions_json TEXT NOT NULL,
                errors_json TEXT NOT NULL,
                status TEXT NOT NULL,
                tool_call_count INTEGER NOT NULL DEFAULT 0,
                needs_reread INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                completed_at TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS task_findings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL UNIQUE,
                requirements_json TEXT NOT NULL,
                findings_json TEXT NOT NULL,
                resources_json TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS task_progress (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL UNIQUE,
                session_date TEXT NOT NULL,
                entries_json TEXT NOT NULL,
                test_results_json TEXT NOT NULL,
                error_log_json TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tasks_user ON tasks(user_id, session_id)",
            [],
        )?;

        Ok(())
    }

    fn mirror<T, F>(&self, value: &T, write: F)
    where
        T: Clone + Send + 'static,
        F: Fn(&FileStorage, &T) -> Result<()> + Send + 'static,
    {
        if let Some(mirror) = &self.file_mirror {
            let mirror = mirror.clone();
            let value = value.clone();
            std::thread::spawn(move || {
                if let Err(e) = write(&mirror, &value) {
                    tracing::warn!(error = %e, "同步文件镜像失败");
                }
            });
        }
    }

    fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRow> {
        Ok(TaskRow {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            session_id: row.get("session_id")?,
            goal: row.get("goal")?,
            current_phase: row.get("current_phase")?,
            phases_json: row.get("phases_json")?,
            questions_json: row.get("questions_json")?,
            decisions_json: row.get("decisions_json")?,
            errors_json: row.get("errors_json")?,
            status: row.get("status")?,
            tool_call_count: row.get("tool_call_count")?,
            needs_reread: row.get("needs_reread")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            completed_at: row.get("completed_at")?,
        })
    }

    /// 高级查询：过滤 + 分页 + 排序，返回（任务列表，总数）
    pub fn query_tasks(&self, opts: &TaskQueryOptions) -> Result<(Vec<Task>, u32)> {
        let conn = self.conn.lock().unwrap();

        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if !opts.user_id.is_empty() {
            clauses.push("user_id = ?".into());
            args.push(Box::new(opts.user_id.clone()));
        }
        if !opts.session_id.is_empty() {
            clauses.push("session_id = ?".into());
            args.push(Box::new(opts.session_id.clone()));
        }
        if !opts.status.is_empty() {
            clauses.push("status = ?".into());
            args.push(Box::new(opts.status.clone()));
        }
        if !opts.keyword.is_empty() {
            clauses.push("goal LIKE ?".into());
            args.push(Box::new(format!("%{}%", opts.keyword)));
        }
        if let Some(start) = opts.start_date {
            clauses.push("created_at >= ?".into());
            args.push(Box::new(start.to_rfc3339()));
        }
        if let Some(end) = opts.end_date {
            clauses.push("created_at <= ?".into());
            args.push(Box::new(end.to_rfc3339()));
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM tasks{}", where_sql);
        let total: u32 = conn.query_row(
            &count_sql,
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            |row| row.get(0),
        )?;

        // 排序列白名单，防止拼接任意 SQL
        let order_by = match opts.order_by.as_str() {
            "created_at" | "updated_at" | "status" | "goal" => opts.order_by.as_str(),
            _ => "created_at",
        };
        let direction = if opts.order_desc { "DESC" } else { "ASC" };
        let limit = if opts.limit == 0 { 100 } else { opts.limit };
        let sql = format!(
            "SELECT * FROM tasks{} ORDER BY {} {} LIMIT {} OFFSET {}",
            where_sql, order_by, direction, limit, opts.offset
        );

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                Self::row_to_task,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            match row.into_task() {
                Ok(t) => tasks.push(t),
                Err(e) => tracing::warn!(error = %e, "任务记录反序列化失败，跳过"),
            }
        }

        Ok((tasks, total))
    }

    /// 按状态统计某用户的任务
    pub fn task_stats(&self, user_id: &str) -> Result<TaskStats> {
        let conn = self.conn.lock().unwrap();
        let (sql, args): (&str, Vec<String>) = if user_id.is_empty() {
            ("SELECT status, COUNT(*) FROM tasks GROUP BY status", vec![])
        } else {
            (
                "SELECT status, COUNT(*) FROM tasks WHERE user_id = ? GROUP BY status",
                vec![user_id.to_string()],
            )
        };

        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stats = TaskStats::default();
        for (status, count) in rows {
            stats.total += count;
            match TaskStatus::parse(&status) {
                Some(TaskStatus::Pending) => stats.pending = count,
                Some(TaskStatus::InProgress) => stats.in_progress = count,
                Some(TaskStatus::Completed) => stats.completed = count,
                Some(TaskStatus::Failed) => stats.failed = count,
                _ => {}
            }
        }

        Ok(stats)
    }
}

/// tasks 表的一行（嵌套序列以 JSON 文本列存储）
struct TaskRow {
    id: String,
    user_id: String,
    session_id: String,
    goal: String,
    current_phase: String,
    phases_json: String,
    questions_json: String,
    decisions_json: String,
    errors_json: String,
    status: String,
    tool_call_count: u32,
    needs_reread: bool,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| TaskError::InvalidInput(format!("bad timestamp {s}: {e}")))
}

impl TaskRow {
    fn into_task(self) -> Result<Task> {
        Ok(Task {
            phases: serde_json::from_str(&self.phases_json)?,
            key_questions: serde_json::from_str(&self.questions_json)?,
            decisions: serde_json::from_str(&self.decisions_json)?,
            errors: serde_json::from_str(&self.errors_json)?,
            status: TaskStatus::parse(&self.status)
                .ok_or_else(|| TaskError::InvalidInput(format!("bad status {}", self.status)))?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            completed_at: self.completed_at.as_deref().map(parse_ts).transpose()?,
            id: self.id,
            user_id: self.user_id,
            session_id: self.session_id,
            goal: self.goal,
            current_phase: self.current_phase,
            tool_call_count: self.tool_call_count,
            needs_reread: self.needs_reread,
        })
    }
}

impl Storage for SqliteStorage {
    fn save_task(&self, task: &Task) -> Result<()> {
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO tasks (id, user_id, session_id, goal, current_phase, phases_json,
                    questions_json, decisions_json, errors_json, status, tool_call_count,
                    needs_reread, created_at, updated_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                 ON CONFLICT(id) DO UPDATE SET
                    user_id = excluded.user_id,
                    session_id = excluded.session_id,
                    goal = excluded.goal,
                    current_phase = excluded.current_phase,
                    phases_json = excluded.phases_json,
                    questions_json = excluded.questions_json,
                    decisions_json = excluded.decisions_json,
                    errors_json = excluded.errors_json,
                    status = excluded.status,
                    tool_call_count = excluded.tool_call_count,
                    needs_reread = excluded.needs_reread,
                    updated_at = excluded.updated_at,
                    completed_at = excluded.completed_at",
                params![
                    task.id,
                    task.user_id,
                    task.session_id,
                    task.goal,
                    task.current_phase,
                    serde_json::to_string(&task.phases)?,
                    serde_json::to_string(&task.key_questions)?,
                    serde_json::to_string(&task.decisions)?,
                    serde_json::to_string(&task.errors)?,
                    task.status.as_str(),
                    task.tool_call_count,
                    task.needs_reread,
                    task.created_at.to_rfc3339(),
                    task.updated_at.to_rfc3339(),
                    task.completed_at.map(|t| t.to_rfc3339()),
                ],
            )?;
        }

        self.mirror(task, |fs, t| fs.save_task(t));
        Ok(())
    }

    fn load_task(&self, task_id: &str) -> Result<Option<Task>> {
        let row = {
            let conn = self.conn.lock().unwrap();
            conn.query_row(
                "SELECT * FROM tasks WHERE id = ?1",
                [task_id],
                Self::row_to_task,
            )
            .optional()?
        };

        row.map(TaskRow::into_task).transpose()
    }

    fn delete_task(&self, task_id: &str) -> Result<()> {
        {
            let mut conn = self.conn.lock().unwrap();
            // 三张表的删除在同一事务内，任一失败整体回滚
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM tasks WHERE id = ?1", [task_id])?;
            tx.execute("DELETE FROM task_findings WHERE task_id = ?1", [task_id])?;
            tx.execute("DELETE FROM task_progress WHERE task_id = ?1", [task_id])?;
            tx.commit()?;
        }

        if let Some(mirror) = &self.file_mirror {
            let mirror = mirror.clone();
            let task_id = task_id.to_string();
            std::thread::spawn(move || {
                if let Err(e) = mirror.delete_task(&task_id) {
                    tracing::warn!(error = %e, "删除文件镜像失败");
                }
            });
        }

        Ok(())
    }

    fn list_tasks(&self, user_id: &str, session_id: &str) -> Result<Vec<Task>> {
        let opts = TaskQueryOptions {
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            ..Default::default()
        };
        Ok(self.query_tasks(&opts)?.0)
    }

    fn save_findings(&self, findings: &TaskFindings) -> Result<()> {
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO task_findings (task_id, requirements_json, findings_json,
                    resources_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(task_id) DO UPDATE SET
                    requirements_json = excluded.requirements_json,
                    findings_json = excluded.findings_json,
                    resources_json = excluded.resources_json,
                    updated_at = excluded.updated_at",
                params![
                    findings.task_id,
                    serde_json::to_string(&findings.requirements)?,
                    serde_json::to_string(&findings.findings)?,
                    serde_json::to_string(&findings.resources)?,
                    findings.updated_at.to_rfc3339(),
                ],
            )?;
        }

        self.mirror(findings, |fs, f| fs.save_findings(f));
        Ok(())
    }

    fn load_findings(&self, task_id: &str) -> Result<Option<TaskFindings>> {
        let row = {
            let conn = self.conn.lock().unwrap();
            conn.query_row(
                "SELECT task_id, requirements_json, findings_json, resources_json, updated_at
                 FROM task_findings WHERE task_id = ?1",
                [task_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?
        };

        let Some((task_id, requirements, findings, resources, updated_at)) = row else {
            return Ok(None);
        };
        Ok(Some(TaskFindings {
            task_id,
            requirements: serde_json::from_str(&requirements)?,
            findings: serde_json::from_str(&findings)?,
            resources: serde_json::from_str(&resources)?,
            updated_at: parse_ts(&updated_at)?,
        }))
    }

    fn save_progress(&self, progress: &TaskProgress) -> Result<()> {
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO task_progress (task_id, session_date, entries_json,
                    test_results_json, error_log_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(task_id) DO UPDATE SET
                    session_date = excluded.session_date,
                    entries_json = excluded.entries_json,
                    test_results_json = excluded.test_results_json,
                    error_log_json = excluded.error_log_json,
                    updated_at = excluded.updated_at",
                params![
                    progress.task_id,
                    progress.session_date,
                    serde_json::to_string(&progress.entries)?,
                    serde_json::to_string(&progress.test_results)?,
                    serde_json::to_string(&progress.error_log)?,
                    progress.updated_at.to_rfc3339(),
                ],
            )?;
        }

        self.mirror(progress, |fs, p| fs.save_progress(p));
        Ok(())
    }

    fn load_progress(&self, task_id: &str) -> Result<Option<TaskProgress>> {
        let row = {
            let conn = self.conn.lock().unwrap();
            conn.query_row(
                "SELECT task_id, session_date, entries_json, test_results_json,
                    error_log_json, updated_at
                 FROM task_progress WHERE task_id = ?1",
                [task_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?
        };

        let Some((task_id, session_date, entries, test_results, error_log, updated_at)) = row
        else {
            return Ok(None);
        };
        Ok(Some(TaskProgress {
            task_id,
            session_date,
            entries: serde_json::from_str(&entries)?,
            test_results: serde_json::from_str(&test_results)?,
            error_log: serde_json::from_str(&error_log)?,
            updated_at: parse_ts(&updated_at)?,
        }))
    }

    fn save_context(&self, ctx: &TaskContext) -> Result<()> {
        self.save_task(&ctx.task)?;
        self.save_findings(&ctx.findings)?;
        self.save_progress(&ctx.progress)
    }

    fn load_context(&self, task_id: &str) -> Result<Option<TaskContext>> {
        let task = match self.load_task(task_id)? {
            Some(t) => t,
            None => return Ok(None),
        };
        let findings = self
            .load_findings(task_id)?
            .unwrap_or_else(|| TaskFindings::empty(task_id, task.updated_at));
        let progress = self
            .load_progress(task_id)?
            .unwrap_or_else(|| TaskProgress::empty(task_id, task.updated_at));

        Ok(Some(TaskContext {
            task,
            findings,
            progress,
        }))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::task::types::{PhaseStatus, TaskPhase, TaskStep};

    fn temp_db() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("mantis-db-{}.sqlite", Uuid::new_v4()))
    }

    fn sample_context(task_id: &str, user_id: &str, status: TaskStatus) -> TaskContext {
        let now = Utc::now();
        TaskContext {
            task: Task {
                id: task_id.to_string(),
                user_id: user_id.to_string(),
                session_id: "s1".into(),
                goal: "实现一个任务管理系统".into(),
                current_phase: "phase_1".into(),
                phases: vec![TaskPhase {
                    id: "phase_1".into(),
                    name: "需求与发现".into(),
                    description: "理解需求".into(),
                    status: PhaseStatus::Pending,
                    steps: vec![TaskStep {
                        id: "step_1_1".into(),
                        description: "理解用户意图".into(),
                        completed: false,
                        result: String::new(),
                    }],
                    started_at: None,
                    completed_at: None,
                    order: 1,
                }],
                key_questions: vec![],
                decisions: vec![],
                errors: vec![],
                status,
                created_at: now,
                updated_at: now,
                completed_at: None,
                tool_call_count: 0,
                needs_reread: false,
            },
            findings: TaskFindings::empty(task_id, now),
            progress: TaskProgress::empty(task_id, now),
        }
    }

    #[test]
    fn test_sqlite_round_trip() {
        let db = temp_db();
        let storage = SqliteStorage::new(&db, None).unwrap();
        let ctx = sample_context("t1", "u1", TaskStatus::Pending);

        storage.save_context(&ctx).unwrap();
        let loaded = storage.load_context("t1").unwrap().unwrap();
        assert_eq!(loaded.task.goal, ctx.task.goal);
        assert_eq!(loaded.task.phases.len(), 1);
        assert_eq!(loaded.task.phases[0].steps[0].id, "step_1_1");
        assert_eq!(loaded.findings.task_id, "t1");

        std::fs::remove_file(&db).ok();
    }

    #[test]
    fn test_sqlite_delete_cascades_all_tables() {
        let db = temp_db();
        let storage = SqliteStorage::new(&db, None).unwrap();
        storage
            .save_context(&sample_context("t2", "u1", TaskStatus::Pending))
            .unwrap();

        storage.delete_task("t2").unwrap();
        assert!(storage.load_task("t2").unwrap().is_none());
        assert!(storage.load_findings("t2").unwrap().is_none());
        assert!(storage.load_progress("t2").unwrap().is_none());

        std::fs::remove_file(&db).ok();
    }

    #[test]
    fn test_sqlite_stats_and_query() {
        let db = temp_db();
        let storage = SqliteStorage::new(&db, None).unwrap();
        storage
            .save_context(&sample_context("t3", "u1", TaskStatus::Pending))
            .unwrap();
        storage
            .save_context(&sample_context("t4", "u1", TaskStatus::Completed))
            .unwrap();
        storage
            .save_context(&sample_context("t5", "u2", TaskStatus::Pending))
            .unwrap();

        let stats = storage.task_stats("u1").unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.completed, 1);

        let (tasks, total) = storage
            .query_tasks(&TaskQueryOptions {
                keyword: "任务管理".into(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(total, 3);
        assert_eq!(tasks.len(), 3);

        let u2 = storage.list_tasks("u2", "").unwrap();
        assert_eq!(u2.len(), 1);
        assert_eq!(u2[0].id, "t5");

        std::fs::remove_file(&db).ok();
    }

    #[test]
    fn test_hybrid_mirror_writes_files() {
        let db = temp_db();
        let root = std::env::temp_dir().join(format!("mantis-hybrid-{}", Uuid::new_v4()));
        let mirror = Arc::new(FileStorage::new(&root).unwrap());
        let storage = SqliteStorage::new(&db, Some(mirror)).unwrap();

        storage
            .save_context(&sample_context("t6", "u1", TaskStatus::Pending))
            .unwrap();

        // 镜像线程异步写入，轮询等待
        let plan = root.join("t6").join("task_plan.md");
        for _ in 0..50 {
            if plan.exists() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert!(plan.exists());

        std::fs::remove_file(&db).ok();
        std::fs::remove_dir_all(&root).ok();
    }
}
