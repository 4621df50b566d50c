//! Mantis - LLM 驱动的任务规划与执行引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）
//! - **observability**: tracing 初始化与 LLM 调用指标
//! - **task**: 任务内核（规划、管理、执行、上下文工程、文件/数据库存储）
//! - **web**: HTTP 表层（axum，薄壳转发到 task::Service）

pub mod config;
pub mod llm;
pub mod observability;
pub mod task;
pub mod web;
