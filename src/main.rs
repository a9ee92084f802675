//! Taskmate HTTP 服务入口
//!
//! 初始化日志、加载配置、打开数据库、装配组件并启动 HTTP 服务；Ctrl-C 优雅退出。

use std::path::PathBuf;

use anyhow::Context;
use taskmate::config::load_config;
use taskmate::{gateway, observability, AgentBuilder, Database};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    // 可选：第一个参数为额外的配置文件路径
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;

    let db = Database::connect(&cfg.storage.database_path, cfg.storage.max_connections)
        .await
        .with_context(|| {
            format!(
                "Failed to open database at {}",
                cfg.storage.database_path.display()
            )
        })?;

    let bind = cfg.server.bind.clone();
    let components = AgentBuilder::new(cfg, db).build();

    gateway::serve(components, &bind, async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutdown signal received");
    })
    .await
    .with_context(|| format!("HTTP server on {} failed", bind))?;

    Ok(())
}
