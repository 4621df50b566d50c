//! Mantis 服务入口
//!
//! 启动流程：加载配置 → 初始化 tracing → 组装 LLM 客户端与任务服务 → 启动 HTTP 服务。
//! 组合根在此一次性创建，所有组件通过构造函数传递，无进程级单例。

use std::path::PathBuf;
use std::sync::Arc;

use mantis::config::load_config;
use mantis::task::Service;
use mantis::{llm, observability, web};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::var("CONFIG_PATH").ok().map(PathBuf::from);
    let config = load_config(config_path)?;

    let llm_client = llm::create_client(&config.llm);
    let service = Arc::new(Service::new(config.task.to_manager_config(), llm_client)?);

    let app = web::router(service);
    let addr = format!("{}:{}", config.app.host, config.app.port);
    tracing::info!(addr = %addr, "Mantis 任务引擎已启动");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("收到退出信号，正在关闭");
        })
        .await?;

    Ok(())
}
