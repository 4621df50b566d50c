//! 任务存储：统一接口与文件后端
//!
//! 文件后端遵循「文件系统作为外部记忆」：每个任务一个目录，JSON 为权威记录，
//! Markdown 镜像每次保存时重新生成（只写不读，写失败只告警）。

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::task::error::{Result, TaskError};
use crate::task::markdown;
use crate::task::types::{Task, TaskContext, TaskFindings, TaskProgress};

/// 任务存储接口；Load 类操作在实体不存在时返回 None 而非错误
pub trait Storage: Send + Sync {
    fn save_task(&self, task: &Task) -> Result<()>;
    fn load_task(&self, task_id: &str) -> Result<Option<Task>>;
    fn delete_task(&self, task_id: &str) -> Result<()>;
    fn list_tasks(&self, user_id: &str, session_id: &str) -> Result<Vec<Task>>;

    fn save_findings(&self, findings: &TaskFindings) -> Result<()>;
    fn load_findings(&self, task_id: &str) -> Result<Option<TaskFindings>>;

    fn save_progress(&self, progress: &TaskProgress) -> Result<()>;
    fn load_progress(&self, task_id: &str) -> Result<Option<TaskProgress>>;

    /// 逐文件持久化 Task + Findings + Progress（文件后端不做跨实体事务）
    fn save_context(&self, ctx: &TaskContext) -> Result<()>;
    fn load_context(&self, task_id: &str) -> Result<Option<TaskContext>>;
}

/// 基于文件的任务存储实现
///
/// 进程级读写锁覆盖整个存储根，防止并发写撕裂；单文件写入采用先写临时文件再
/// rename 的替换语义。
pub struct FileStorage {
    base_path: PathBuf,
    lock: RwLock<()>,
}

impl FileStorage {
    pub fn new(base_path: impl AsRef<Path>) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;
        Ok(Self {
            base_path,
            lock: RwLock::new(()),
        })
    }

    fn task_dir(&self, task_id: &str) -> PathBuf {
        self.base_path.join(task_id)
    }

    fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, path)
    }

    fn write_json<T: serde::Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let data = serde_json::to_vec_pretty(value)?;
        Self::write_atomic(path, &data)?;
        Ok(())
    }

    fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        let data = match fs::read(path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(TaskError::Io(e)),
        };
        Ok(Some(serde_json::from_slice(&data)?))
    }

    /// 镜像写失败只告警，不影响权威 JSON 写入的结果
    fn write_mirror(path: &Path, content: &str) {
        if let Err(e) = Self::write_atomic(path, content.as_bytes()) {
            tracing::warn!(path = %path.display(), error = %e, "写入 Markdown 镜像失败");
        }
    }

    fn save_task_inner(&self, task: &Task) -> Result<()> {
        let dir = self.task_dir(&task.id);
        fs::create_dir_all(&dir)?;

        self.write_json(&dir.join("task.json"), task)?;
        Self::write_mirror(&dir.join("task_plan.md"), &markdown::task_plan(task));
        Ok(())
    }

    fn load_task_inner(&self, task_id: &str) -> Result<Option<Task>> {
        Self::read_json(&self.task_dir(task_id).join("task.json"))
    }

    fn save_findings_inner(&self, findings: &TaskFindings) -> Result<()> {
        let dir = self.task_dir(&findings.task_id);
        fs::create_dir_all(&dir)?;

        self.write_json(&dir.join("findings.json"), findings)?;
        Self::write_mirror(&dir.join("findings.md"), &markdown::findings(findings));
        Ok(())
    }

    fn save_progress_inner(&self, progress: &TaskProgress) -> Result<()> {
        let dir = self.task_dir(&progress.task_id);
        fs::create_dir_all(&dir)?;

        self.write_json(&dir.join("progress.json"), progress)?;
        Self::write_mirror(&dir.join("progress.md"), &markdown::progress(progress));
        Ok(())
    }
}

impl Storage for FileStorage {
    fn save_task(&self, task: &Task) -> Result<()> {
        let _guard = self.lock.write().unwrap();
        self.save_task_inner(task)
    }

    fn load_task(&self, task_id: &str) -> Result<Option<Task>> {
        let _guard = self.lock.read().unwrap();
        self.load_task_inner(task_id)
    }

    fn delete_task(&self, task_id: &str) -> Result<()> {
        let _guard = self.lock.write().unwrap();
        let dir = self.task_dir(task_id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TaskError::Io(e)),
        }
    }

    fn list_tasks(&self, user_id: &str, session_id: &str) -> Result<Vec<Task>> {
        let _guard = self.lock.read().unwrap();

        let entries = match fs::read_dir(&self.base_path) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(TaskError::Io(e)),
        };

        let mut tasks = Vec::new();
        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            // 单个目录加载失败只跳过，不中断整个列表
            let task = match self.load_task_inner(&name) {
                Ok(Some(t)) => t,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(task_id = %name, error = %e, "加载任务失败，跳过");
                    continue;
                }
            };

            if !user_id.is_empty() && task.user_id != user_id {
                continue;
            }
            if !session_id.is_empty() && task.session_id != session_id {
                continue;
            }
            tasks.push(task);
        }

        Ok(tasks)
    }

    fn save_findings(&self, findings: &TaskFindings) -> Result<()> {
        let _guard = self.lock.write().unwrap();
        self.save_findings_inner(findings)
    }

    fn load_findings(&self, task_id: &str) -> Result<Option<TaskFindings>> {
        let _guard = self.lock.read().unwrap();
        Self::read_json(&self.task_dir(task_id).join("findings.json"))
    }

    fn save_progress(&self, progress: &TaskProgress) -> Result<()> {
        let _guard = self.lock.write().unwrap();
        self.save_progress_inner(progress)
    }

    fn load_progress(&self, task_id: &str) -> Result<Option<TaskProgress>> {
        let _guard = self.lock.read().unwrap();
        Self::read_json(&self.task_dir(task_id).join("progress.json"))
    }

    fn save_context(&self, ctx: &TaskContext) -> Result<()> {
        let _guard = self.lock.write().unwrap();
        self.save_task_inner(&ctx.task)?;
        self.save_findings_inner(&ctx.findings)?;
        self.save_progress_inner(&ctx.progress)
    }

    fn load_context(&self, task_id: &str) -> Result<Option<TaskContext>> {
        let _guard = self.lock.read().unwrap();

        let task = match self.load_task_inner(task_id)? {
            Some(t) => t,
            None => return Ok(None),
        };
        let findings = Self::read_json(&self.task_dir(task_id).join("findings.json"))?
            .unwrap_or_else(|| TaskFindings::empty(task_id, task.updated_at));
        let progress = Self::read_json(&self.task_dir(task_id).join("progress.json"))?
            .unwrap_or_else(|| TaskProgress::empty(task_id, task.updated_at));

        Ok(Some(TaskContext {
            task,
            findings,
            progress,
        }))
    }
}
