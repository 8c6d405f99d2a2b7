//! HisLink 连接器服务主程序

mod routes;

use anyhow::{Context, Result};
use clap::Parser;
use hislink_admin::{AppConfig, MetricsCollector};
use hislink_integration::{
    ConnectorDefaults, ConnectorRegistry, DefaultConnectorFactory, RegistrySupervisor,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// 命令行参数
#[derive(Parser, Debug)]
#[command(name = "hislink-server")]
#[command(about = "HIS 集成连接器服务")]
struct Args {
    /// 配置文件路径
    #[arg(short, long)]
    config: Option<String>,

    /// 运维HTTP端口，覆盖配置文件
    #[arg(short, long)]
    port: Option<u16>,

    /// 日志级别，覆盖配置文件
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    // 日志级别来自配置文件，订阅器只能在加载之后安装
    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.server.port = port;
    }

    // 初始化日志，RUST_LOG 优先
    let level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        path = args.config.as_deref().unwrap_or("<none>"),
        connectors = config.connectors.len(),
        "Configuration loaded"
    );
    info!("Starting HisLink server...");
    info!("  HTTP: {}:{}", config.server.host, config.server.port);

    let metrics = MetricsCollector::new()?;
    let factory = DefaultConnectorFactory::new(ConnectorDefaults::from(&config));
    let registry = Arc::new(ConnectorRegistry::new(Arc::new(factory)).with_metrics(metrics.clone()));

    for connector_config in &config.connectors {
        if let Err(e) = registry.get_connector(connector_config).await {
            // 单个连接器配置错误不影响其他连接器
            error!(
                connector = %connector_config.key(),
                "Failed to register connector: {}", e
            );
        }
    }

    let supervisor = RegistrySupervisor::from_config(registry.clone(), &config.supervisor);
    let supervisor_handles = supervisor.start();

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server address")?;
    let app = routes::create_app(routes::AppState {
        registry: registry.clone(),
        metrics,
    });

    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    info!("Shutting down...");
    supervisor.shutdown();
    for handle in supervisor_handles {
        if let Err(e) = handle.await {
            warn!("Supervisor task ended abnormally: {}", e);
        }
    }
    registry.clear().await;
    info!("HisLink server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
}
