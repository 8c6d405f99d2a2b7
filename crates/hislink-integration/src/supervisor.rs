//! 注册表后台巡检
//!
//! 定时执行全量健康检查和重连，收到关闭信号后退出。

use crate::registry::ConnectorRegistry;
use hislink_admin::SupervisorConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub struct RegistrySupervisor {
    registry: Arc<ConnectorRegistry>,
    health_check_interval: Duration,
    reconnect_interval: Duration,
    shutdown: watch::Sender<bool>,
}

impl RegistrySupervisor {
    pub fn new(
        registry: Arc<ConnectorRegistry>,
        health_check_interval: Duration,
        reconnect_interval: Duration,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            registry,
            health_check_interval,
            reconnect_interval,
            shutdown,
        }
    }

    pub fn from_config(registry: Arc<ConnectorRegistry>, config: &SupervisorConfig) -> Self {
        Self::new(registry, config.health_check_interval(), config.reconnect_interval())
    }

    /// 启动健康检查和重连两个循环
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        info!(
            health_check_interval_secs = self.health_check_interval.as_secs_f64(),
            reconnect_interval_secs = self.reconnect_interval.as_secs_f64(),
            "Starting registry supervisor"
        );
        vec![self.start_health_checks(), self.start_reconnects()]
    }

    /// 通知所有循环退出
    pub fn shutdown(&self) {
        // 没有接收方时发送失败，无需处理
        let _ = self.shutdown.send(true);
    }

    fn start_health_checks(&self) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let mut shutdown = self.shutdown.subscribe();
        let period = self.health_check_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let aggregate = registry.health_check_all().await;
                        if aggregate.unhealthy_connectors > 0 {
                            let unhealthy: Vec<&String> = aggregate
                                .connectors
                                .iter()
                                .filter(|(_, health)| !health.healthy)
                                .map(|(key, _)| key)
                                .collect();
                            warn!(
                                total = aggregate.total_connectors,
                                unhealthy = ?unhealthy,
                                "Unhealthy connectors detected"
                            );
                        } else {
                            debug!(total = aggregate.total_connectors, "All connectors healthy");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            info!("Health check loop stopped");
        })
    }

    fn start_reconnects(&self) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let mut shutdown = self.shutdown.subscribe();
        let period = self.reconnect_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // 第一次 tick 立即返回，启动时已经连接过
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let report = registry.reconnect_all().await;
                        if !report.failed.is_empty() {
                            warn!(failed = ?report.failed, "Some connectors are still unreachable");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            info!("Reconnect loop stopped");
        })
    }
}

impl Drop for RegistrySupervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
