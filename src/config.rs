//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `MANTIS__*` 覆盖（双下划线表示嵌套，如 `MANTIS__TASK__REREAD_THRESHOLD=5`）。
//! 环境变量 `CONFIG_PATH` 可指定额外的配置文件（覆盖默认键）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::task::{StorageType, TaskManagerConfig};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub task: TaskSection,
}

/// [app] 段：应用名、监听地址
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            host: default_host(),
            port: default_port(),
        }
    }
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize, Default)]
pub struct LlmSection {
    /// 后端：deepseek / openai / mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

fn default_provider() -> String {
    "deepseek".to_string()
}

fn default_model() -> String {
    "deepseek-chat".to_string()
}

/// DeepSeek 官方端点（OpenAI 兼容），provider=deepseek 且未配置 base_url 时使用
pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";

impl LlmSection {
    /// 解析端点：显式配置优先；deepseek 回落到官方端点，openai 回落到 SDK 默认
    pub fn resolve_base_url(&self) -> Option<String> {
        if self.base_url.is_some() {
            return self.base_url.clone();
        }
        match self.provider.as_str() {
            "deepseek" => Some(DEEPSEEK_BASE_URL.to_string()),
            _ => None,
        }
    }

    /// 解析 API Key：配置键（含 MANTIS__LLM__API_KEY 环境覆盖）优先，
    /// 其次按 provider 取约定环境变量
    pub fn resolve_api_key(&self) -> Option<String> {
        if self.api_key.is_some() {
            return self.api_key.clone();
        }
        match self.provider.as_str() {
            "deepseek" => std::env::var("DEEPSEEK_API_KEY")
                .or_else(|_| std::env::var("OPENAI_API_KEY"))
                .ok(),
            _ => std::env::var("OPENAI_API_KEY").ok(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LlmTimeoutsSection {
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

fn default_request_timeout() -> u64 {
    60
}

/// [task] 段：任务内核配置（存储、重读阈值、重试次数）
#[derive(Debug, Clone, Deserialize)]
pub struct TaskSection {
    /// 存储类型：file / db / hybrid
    #[serde(default)]
    pub storage_type: StorageType,
    /// 文件存储根目录
    pub storage_path: Option<PathBuf>,
    /// SQLite 数据库文件（db / hybrid 模式）
    pub db_path: Option<PathBuf>,
    /// 混合模式下是否同步文件镜像
    #[serde(default = "default_enable_file_sync")]
    pub enable_file_sync: bool,
    /// 重读计划的工具调用阈值（注意力操纵的 10 次规则）
    #[serde(default = "default_reread_threshold")]
    pub reread_threshold: u32,
    /// 是否启用 2 动作规则
    #[serde(default = "default_two_action_rule")]
    pub two_action_rule: bool,
    /// 最大重试次数（3 次打击规则）
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 是否启用 LLM 自动规划
    #[serde(default = "default_enable_auto_planning")]
    pub enable_auto_planning: bool,
}

fn default_enable_file_sync() -> bool {
    true
}

fn default_reread_threshold() -> u32 {
    10
}

fn default_two_action_rule() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_enable_auto_planning() -> bool {
    true
}

impl Default for TaskSection {
    fn default() -> Self {
        Self {
            storage_type: StorageType::default(),
            storage_path: None,
            db_path: None,
            enable_file_sync: default_enable_file_sync(),
            reread_threshold: default_reread_threshold(),
            two_action_rule: default_two_action_rule(),
            max_retries: default_max_retries(),
            enable_auto_planning: default_enable_auto_planning(),
        }
    }
}

impl TaskSection {
    /// 转换为任务管理器配置，未设置的键取内核默认值
    pub fn to_manager_config(&self) -> TaskManagerConfig {
        let defaults = TaskManagerConfig::default();
        TaskManagerConfig {
            storage_type: self.storage_type,
            storage_path: self
                .storage_path
                .clone()
                .unwrap_or(defaults.storage_path),
            db_path: self.db_path.clone().unwrap_or(defaults.db_path),
            enable_file_sync: self.enable_file_sync,
            reread_threshold: self.reread_threshold,
            two_action_rule_enabled: self.two_action_rule,
            max_retries: self.max_retries,
            enable_auto_planning: self.enable_auto_planning,
            compression: defaults.compression,
        }
    }
}

/// 从 config 目录加载配置，环境变量 MANTIS__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 MANTIS__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("MANTIS")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_app_config() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.app.port, 8080);
        assert_eq!(cfg.llm.provider, "deepseek");
        assert_eq!(cfg.task.reread_threshold, 10);
        assert_eq!(cfg.task.max_retries, 3);
    }

    #[test]
    fn test_task_section_to_manager_config() {
        let section = TaskSection::default();
        let cfg = section.to_manager_config();
        assert_eq!(cfg.storage_path, PathBuf::from(".tasks"));
        assert!(cfg.two_action_rule_enabled);
    }

    #[test]
    fn test_llm_section_resolution() {
        let section = LlmSection::default();
        // Default::default() 的 provider 为空串，显式设置后再断言
        let section = LlmSection {
            provider: "deepseek".into(),
            ..section
        };
        assert_eq!(
            section.resolve_base_url().as_deref(),
            Some(DEEPSEEK_BASE_URL)
        );

        let custom = LlmSection {
            provider: "openai".into(),
            base_url: Some("http://127.0.0.1:8000/v1".into()),
            api_key: Some("sk-test".into()),
            ..LlmSection::default()
        };
        assert_eq!(
            custom.resolve_base_url().as_deref(),
            Some("http://127.0.0.1:8000/v1")
        );
        assert_eq!(custom.resolve_api_key().as_deref(), Some("sk-test"));
    }
}
