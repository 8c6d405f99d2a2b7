//! 连接器注册表
//!
//! 按 `{org_id}:{type}:{name}` 管理连接器实例的生命周期：创建、健康检查、
//! 重连和销毁。同一个键任何时刻最多只有一个存活实例。
//!
//! 每个键对应一个 [`OnceCell`] 槽位，映射表的锁只在取槽位时短暂持有，
//! 同一个键的并发 `get_connector` 共享同一次构造。

use crate::circuit_breaker::CircuitStateChange;
use crate::connector::{Connector, ConnectorEvent};
use crate::connectors::ConnectorFactory;
use chrono::{DateTime, Utc};
use hislink_admin::{MetricLabels, MetricsCollector};
use hislink_core::{
    AggregateHealth, ConnectorConfig, ConnectorError, ConnectorHealth, ConnectorStatus,
    ConnectorType, RegistryStats, Result,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 注册表持有的连接器实例
pub struct ConnectorInstance {
    pub id: Uuid,
    pub connector: Arc<dyn Connector>,
    pub config: ConnectorConfig,
    pub created_at: DateTime<Utc>,
    last_health_check: Mutex<Option<DateTime<Utc>>>,
}

impl ConnectorInstance {
    fn new(connector: Arc<dyn Connector>, config: ConnectorConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            connector,
            config,
            created_at: Utc::now(),
            last_health_check: Mutex::new(None),
        }
    }

    pub fn last_health_check(&self) -> Option<DateTime<Utc>> {
        *self.last_health_check.lock()
    }

    fn summary(&self, key: &str) -> ConnectorSummary {
        ConnectorSummary {
            key: key.to_string(),
            instance_id: self.id,
            org_id: self.config.org_id.clone(),
            connector_type: self.config.connector_type.clone(),
            name: self.config.name.clone(),
            enabled: self.config.enabled,
            status: self.connector.status(),
            created_at: self.created_at,
            last_health_check: self.last_health_check(),
        }
    }
}

/// 实例概要，用于运维接口
#[derive(Debug, Clone, Serialize)]
pub struct ConnectorSummary {
    pub key: String,
    pub instance_id: Uuid,
    pub org_id: String,
    pub connector_type: ConnectorType,
    pub name: String,
    pub enabled: bool,
    pub status: ConnectorStatus,
    pub created_at: DateTime<Utc>,
    pub last_health_check: Option<DateTime<Utc>>,
}

/// 批量操作结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkReport {
    pub attempted: usize,
    pub succeeded: usize,
    /// 失败的注册表键
    pub failed: Vec<String>,
}

impl BulkReport {
    fn record(&mut self, key: String, ok: bool) {
        self.attempted += 1;
        if ok {
            self.succeeded += 1;
        } else {
            self.failed.push(key);
        }
    }
}

type Slot = Arc<OnceCell<Arc<ConnectorInstance>>>;

/// 连接器注册表
pub struct ConnectorRegistry {
    factory: Arc<dyn ConnectorFactory>,
    metrics: Option<MetricsCollector>,
    instances: Mutex<HashMap<String, Slot>>,
}

impl ConnectorRegistry {
    pub fn new(factory: Arc<dyn ConnectorFactory>) -> Self {
        Self {
            factory,
            metrics: None,
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// 将连接器事件桥接到指标收集器
    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn metrics(&self) -> Option<&MetricsCollector> {
        self.metrics.as_ref()
    }

    /// 获取或创建连接器
    ///
    /// 新建且启用的连接器会尝试连接；连接失败只记录日志，仍返回该实例，
    /// 由 `reconnect_all` 之后重试。未知类型和配置错误直接返回错误。
    ///
    /// 构造期间键被移除或替换时，新实例会被销毁：被替换时返回新槽位的实例，
    /// 被移除时返回配置错误。
    pub async fn get_connector(&self, config: &ConnectorConfig) -> Result<Arc<dyn Connector>> {
        let key = config.key();
        let mut slot = self.instances.lock().entry(key.clone()).or_default().clone();

        loop {
            let mut created = false;
            let init = slot
                .get_or_try_init(|| {
                    created = true;
                    self.create_instance(config)
                })
                .await;

            let instance = match init {
                Ok(instance) => instance.clone(),
                Err(err) => {
                    let mut instances = self.instances.lock();
                    let unused = instances
                        .get(&key)
                        .map(|current| Arc::ptr_eq(current, &slot) && current.get().is_none())
                        .unwrap_or(false);
                    if unused {
                        instances.remove(&key);
                    }
                    error!(connector = %key, code = err.code(), error = %err, "Failed to create connector");
                    return Err(err);
                }
            };

            let current = self.instances.lock().get(&key).cloned();
            match current {
                Some(current) if Arc::ptr_eq(&current, &slot) => return Ok(instance.connector.clone()),
                current => {
                    // 只有构造者负责销毁，其他等待者直接跟随当前槽位
                    if created {
                        warn!(
                            connector = %key,
                            instance_id = %instance.id,
                            "Connector removed during creation, destroying new instance"
                        );
                        Self::destroy_instance(&key, &instance).await;
                    }
                    match current {
                        Some(newer) => slot = newer,
                        None => {
                            return Err(ConnectorError::Config(format!(
                                "connector {} was removed during creation",
                                key
                            )))
                        }
                    }
                }
            }
        }
    }

    /// 获取已存在的连接器，不创建
    pub fn get_existing(&self, config: &ConnectorConfig) -> Option<Arc<dyn Connector>> {
        self.instances
            .lock()
            .get(&config.key())
            .and_then(|slot| slot.get())
            .map(|instance| instance.connector.clone())
    }

    async fn create_instance(&self, config: &ConnectorConfig) -> Result<Arc<ConnectorInstance>> {
        let connector = self.factory.create(config)?;
        self.attach_metrics(connector.as_ref(), config);

        let instance = Arc::new(ConnectorInstance::new(connector.clone(), config.clone()));
        info!(
            org_id = %config.org_id,
            connector_type = %config.connector_type,
            connector = %config.name,
            instance_id = %instance.id,
            "Connector created"
        );

        if config.enabled {
            if let Err(err) = connector.connect().await {
                warn!(
                    connector = %config.key(),
                    code = err.code(),
                    error = %err,
                    "Initial connect failed, connector kept for later reconnect"
                );
            }
        } else {
            debug!(connector = %config.key(), "Connector disabled, skipping connect");
        }
        Ok(instance)
    }

    fn attach_metrics(&self, connector: &dyn Connector, config: &ConnectorConfig) {
        let Some(metrics) = self.metrics.clone() else {
            return;
        };
        let labels = MetricLabels::from(config);

        let collector = metrics.clone();
        let event_labels = labels.clone();
        connector.kit().subscribe(Arc::new(move |event: &ConnectorEvent| match event {
            ConnectorEvent::StatusChanged { from, to, .. } => {
                if *to == ConnectorStatus::Connected && *from != ConnectorStatus::Connected {
                    collector.record_connection_opened(&event_labels);
                } else if *from == ConnectorStatus::Connected && *to != ConnectorStatus::Connected {
                    collector.record_connection_closed(&event_labels);
                    collector.update_uptime(&event_labels, 0.0);
                }
            }
            ConnectorEvent::MessageSent { size_bytes } => {
                collector.record_message_sent(&event_labels);
                collector.record_message_size(&event_labels, *size_bytes);
            }
            ConnectorEvent::MessageReceived { .. } => collector.record_message_received(&event_labels),
            ConnectorEvent::MessageFailed { code } => {
                collector.record_message_failed(&event_labels, code)
            }
            ConnectorEvent::Error { code, .. } => collector.record_error(&event_labels, code),
            ConnectorEvent::Latency { millis } => {
                collector.record_latency(&event_labels, millis / 1000.0)
            }
        }));

        if let Some(breaker) = connector.circuit_breaker() {
            metrics.update_circuit_breaker_state(&labels, breaker.name(), breaker.state().as_str());
            breaker.on_state_change(Arc::new(move |change: &CircuitStateChange| {
                metrics.update_circuit_breaker_state(&labels, &change.name, change.to.as_str());
            }));
        }
    }

    /// 销毁并移除连接器，返回是否存在
    pub async fn remove_connector(&self, config: &ConnectorConfig) -> bool {
        let key = config.key();
        let slot = self.instances.lock().remove(&key);
        match slot {
            Some(slot) => {
                Self::destroy_slot(&key, slot).await;
                true
            }
            None => false,
        }
    }

    /// 移除某个组织的全部连接器，返回移除数量
    pub async fn remove_org_connectors(&self, org_id: &str) -> usize {
        let removed: Vec<(String, Slot)> = {
            let mut instances = self.instances.lock();
            let keys: Vec<String> = instances
                .iter()
                .filter(|(_, slot)| {
                    slot.get()
                        .map(|instance| instance.config.org_id == org_id)
                        .unwrap_or(false)
                })
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| instances.remove(&key).map(|slot| (key, slot)))
                .collect()
        };

        let count = removed.len();
        for (key, slot) in removed {
            Self::destroy_slot(&key, slot).await;
        }
        info!(org_id, removed = count, "Organization connectors removed");
        count
    }

    /// 销毁并移除全部连接器
    pub async fn clear(&self) {
        let removed: Vec<(String, Slot)> = self.instances.lock().drain().collect();
        let count = removed.len();
        for (key, slot) in removed {
            Self::destroy_slot(&key, slot).await;
        }
        info!(removed = count, "Connector registry cleared");
    }

    async fn destroy_slot(key: &str, slot: Slot) {
        // 尚在构造的槽位由 get_connector 在构造完成后自行销毁
        if let Some(instance) = slot.get() {
            Self::destroy_instance(key, instance).await;
        }
    }

    async fn destroy_instance(key: &str, instance: &ConnectorInstance) {
        match instance.connector.destroy().await {
            Ok(()) => info!(connector = %key, "Connector removed"),
            // 移除总是成功，销毁失败只记录
            Err(err) => error!(connector = %key, error = %err, "Connector destroy failed, evicted anyway"),
        }
    }

    /// 用新配置重建连接器
    pub async fn update_connector_config(&self, config: &ConnectorConfig) -> Result<Arc<dyn Connector>> {
        self.remove_connector(config).await;
        self.get_connector(config).await
    }

    /// 并发检查所有连接器
    pub async fn health_check_all(&self) -> AggregateHealth {
        self.check_health(self.live_instances(|_| true)).await
    }

    /// 并发检查某个组织的连接器
    pub async fn health_check_org(&self, org_id: &str) -> AggregateHealth {
        self.check_health(self.live_instances(|instance| instance.config.org_id == org_id))
            .await
    }

    async fn check_health(&self, instances: Vec<(String, Arc<ConnectorInstance>)>) -> AggregateHealth {
        let results = run_concurrently(instances, |instance| async move {
            let result = instance.connector.health_check().await;
            *instance.last_health_check.lock() = Some(Utc::now());
            (instance, result)
        })
        .await;

        let mut connectors = HashMap::with_capacity(results.len());
        for (key, outcome) in results {
            let health = match outcome {
                Ok((instance, Ok(health))) => {
                    if let Some(metrics) = &self.metrics {
                        if health.status == ConnectorStatus::Connected {
                            metrics.update_uptime(
                                &MetricLabels::from(&instance.config),
                                health.metrics.uptime_ms as f64 / 1000.0,
                            );
                        }
                    }
                    health
                }
                Ok((_, Err(err))) => {
                    warn!(connector = %key, error = %err, "Health check failed");
                    ConnectorHealth::failed(err.to_string())
                }
                Err(join_err) => {
                    error!(connector = %key, error = %join_err, "Health check task aborted");
                    ConnectorHealth::failed(join_err)
                }
            };
            connectors.insert(key, health);
        }

        AggregateHealth::from_results(connectors)
    }

    /// 并发重连所有启用但未连接的连接器
    pub async fn reconnect_all(&self) -> BulkReport {
        let pending: Vec<_> = self
            .live_instances(|_| true)
            .into_iter()
            .filter(|(_, instance)| {
                instance.config.enabled && instance.connector.status() != ConnectorStatus::Connected
            })
            .collect();

        let results = run_concurrently(pending, |instance| async move {
            instance.connector.connect().await
        })
        .await;

        let report = Self::summarize("reconnect", results);
        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                succeeded = report.succeeded,
                failed = report.failed.len(),
                "Reconnect pass finished"
            );
        }
        report
    }

    /// 并发断开所有连接器，实例保留在注册表中
    pub async fn disconnect_all(&self) -> BulkReport {
        let results = run_concurrently(self.live_instances(|_| true), |instance| async move {
            instance.connector.disconnect().await
        })
        .await;

        let report = Self::summarize("disconnect", results);
        info!(
            attempted = report.attempted,
            failed = report.failed.len(),
            "All connectors disconnected"
        );
        report
    }

    fn summarize(
        operation: &str,
        results: Vec<(String, std::result::Result<Result<()>, String>)>,
    ) -> BulkReport {
        let mut report = BulkReport::default();
        for (key, outcome) in results {
            let ok = match outcome {
                Ok(Ok(())) => true,
                Ok(Err(err)) => {
                    warn!(connector = %key, operation, code = err.code(), error = %err, "Bulk operation failed");
                    false
                }
                Err(join_err) => {
                    error!(connector = %key, operation, error = %join_err, "Bulk operation task aborted");
                    false
                }
            };
            report.record(key, ok);
        }
        report
    }

    /// 按类型和组织统计
    pub fn get_stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for (_, instance) in self.live_instances(|_| true) {
            stats.total_connectors += 1;
            *stats
                .by_type
                .entry(instance.config.connector_type.to_string())
                .or_insert(0) += 1;
            *stats.by_org.entry(instance.config.org_id.clone()).or_insert(0) += 1;
        }
        stats
    }

    /// 列出所有存活实例
    pub fn list_connectors(&self) -> Vec<ConnectorSummary> {
        let mut summaries: Vec<ConnectorSummary> = self
            .live_instances(|_| true)
            .iter()
            .map(|(key, instance)| instance.summary(key))
            .collect();
        summaries.sort_by(|a, b| a.key.cmp(&b.key));
        summaries
    }

    /// 某个组织的连接器
    pub fn get_org_connectors(&self, org_id: &str) -> Vec<Arc<dyn Connector>> {
        self.live_instances(|instance| instance.config.org_id == org_id)
            .into_iter()
            .map(|(_, instance)| instance.connector.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.live_instances(|_| true).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 已完成构造的实例快照，构造中的槽位不计入
    fn live_instances(
        &self,
        filter: impl Fn(&ConnectorInstance) -> bool,
    ) -> Vec<(String, Arc<ConnectorInstance>)> {
        self.instances
            .lock()
            .iter()
            .filter_map(|(key, slot)| slot.get().map(|instance| (key, instance)))
            .filter(|(_, instance)| filter(instance))
            .map(|(key, instance)| (key.clone(), instance.clone()))
            .collect()
    }
}

/// 为每个实例启动一个任务并等待全部完成，单个任务的失败不影响其他任务
async fn run_concurrently<T, F, Fut>(
    instances: Vec<(String, Arc<ConnectorInstance>)>,
    operation: F,
) -> Vec<(String, std::result::Result<T, String>)>
where
    F: Fn(Arc<ConnectorInstance>) -> Fut,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let handles: Vec<_> = instances
        .into_iter()
        .map(|(key, instance)| (key, tokio::spawn(operation(instance))))
        .collect();

    let mut results = Vec::with_capacity(handles.len());
    for (key, handle) in handles {
        results.push((key, handle.await.map_err(|e| e.to_string())));
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::{ConnectorDefaults, DefaultConnectorFactory};
    use crate::testing::MockFactory;
    use axum::{
        routing::{get, post},
        Json, Router,
    };
    use hislink_core::{RetryConfig, StructuredMessage};
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn registry() -> (ConnectorRegistry, Arc<MockFactory>) {
        let factory = Arc::new(MockFactory::default());
        (ConnectorRegistry::new(factory.clone()), factory)
    }

    fn config(org: &str, kind: &str, name: &str) -> ConnectorConfig {
        ConnectorConfig::new(org, kind, name)
    }

    #[tokio::test]
    async fn test_get_connector_connects_enabled_instance() {
        let (registry, factory) = registry();
        let connector = registry.get_connector(&config("h1", "hl7", "lab")).await.unwrap();

        assert_eq!(connector.status(), ConnectorStatus::Connected);
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);

        let again = registry.get_connector(&config("h1", "hl7", "lab")).await.unwrap();
        assert!(Arc::ptr_eq(&connector, &again));
        assert_eq!(factory.connector("h1:hl7:lab").connect_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disabled_connector_is_not_connected() {
        let (registry, factory) = registry();
        let connector = registry
            .get_connector(&config("h1", "rest", "billing").disabled())
            .await
            .unwrap();

        assert_eq!(connector.status(), ConnectorStatus::Disconnected);
        assert_eq!(factory.connector("h1:rest:billing").connect_calls.load(Ordering::SeqCst), 0);

        // 禁用的连接器也不参与重连
        let report = registry.reconnect_all().await;
        assert_eq!(report.attempted, 0);
    }

    #[tokio::test]
    async fn test_concurrent_get_creates_single_instance() {
        let (registry, factory) = registry();
        *factory.connect_delay.lock() = Duration::from_millis(20);
        let registry = Arc::new(registry);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.get_connector(&config("h1", "tasy", "prod")).await })
            })
            .collect();

        let mut connectors = Vec::new();
        for handle in handles {
            connectors.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        assert!(connectors.iter().all(|c| Arc::ptr_eq(c, &connectors[0])));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_still_returns_instance() {
        let (registry, factory) = registry();
        factory.fail_connect.store(true, Ordering::SeqCst);

        let connector = registry.get_connector(&config("h1", "mv", "adt")).await.unwrap();
        assert_eq!(connector.status(), ConnectorStatus::Error);
        assert!(registry.get_existing(&config("h1", "mv", "adt")).is_some());

        let mock = factory.connector("h1:mv:adt");
        mock.fail_connect.store(false, Ordering::SeqCst);
        let report = registry.reconnect_all().await;
        assert_eq!(report, BulkReport { attempted: 1, succeeded: 1, failed: vec![] });
        assert_eq!(connector.status(), ConnectorStatus::Connected);
    }

    #[tokio::test]
    async fn test_unknown_type_fails_and_leaves_no_slot() {
        let (registry, factory) = registry();
        let err = registry
            .get_connector(&config("h1", "soap", "legacy"))
            .await
            .err()
            .unwrap();

        assert_eq!(err, ConnectorError::UnknownConnectorType("soap".into()));
        assert!(!err.retryable());
        assert!(registry.is_empty());
        assert_eq!(factory.created.load(Ordering::SeqCst), 0);
        assert!(registry.instances.lock().is_empty());
    }

    #[tokio::test]
    async fn test_health_check_isolates_failing_connector() {
        let (registry, factory) = registry();
        registry.get_connector(&config("h1", "tasy", "prod")).await.unwrap();
        registry.get_connector(&config("h1", "hl7", "lab")).await.unwrap();
        registry.get_connector(&config("h2", "mv", "adt")).await.unwrap();
        factory.connector("h1:hl7:lab").fail_health.store(true, Ordering::SeqCst);

        let aggregate = registry.health_check_all().await;
        assert!(!aggregate.healthy);
        assert_eq!(aggregate.total_connectors, 3);
        assert_eq!(aggregate.healthy_connectors, 2);
        assert_eq!(aggregate.unhealthy_connectors, 1);

        let failed = &aggregate.connectors["h1:hl7:lab"];
        assert_eq!(failed.status, ConnectorStatus::Error);
        assert_eq!(failed.metrics.messages_sent, 0);
        assert!(failed.message.contains("health probe crashed"));
        assert!(aggregate.connectors["h1:tasy:prod"].healthy);
        assert!(aggregate.connectors["h2:mv:adt"].healthy);

        let org = registry.health_check_org("h2").await;
        assert!(org.healthy);
        assert_eq!(org.total_connectors, 1);

        assert!(registry
            .list_connectors()
            .iter()
            .all(|summary| summary.last_health_check.is_some()));
    }

    #[tokio::test]
    async fn test_empty_registry_is_unhealthy() {
        let (registry, _) = registry();
        let aggregate = registry.health_check_all().await;
        assert!(!aggregate.healthy);
        assert_eq!(aggregate.total_connectors, 0);
    }

    #[tokio::test]
    async fn test_remove_org_connectors_only_touches_that_org() {
        let (registry, factory) = registry();
        registry.get_connector(&config("hosp-1", "tasy", "prod")).await.unwrap();
        registry.get_connector(&config("hosp-1", "hl7", "lab")).await.unwrap();
        registry.get_connector(&config("hosp-10", "hl7", "lab")).await.unwrap();
        registry.get_connector(&config("hosp-2", "mv", "adt")).await.unwrap();

        let removed = registry.remove_org_connectors("hosp-1").await;
        assert_eq!(removed, 2);
        assert_eq!(factory.connector("hosp-1:tasy:prod").disconnect_calls.load(Ordering::SeqCst), 1);

        let keys: Vec<String> = registry.list_connectors().into_iter().map(|s| s.key).collect();
        assert_eq!(keys, vec!["hosp-10:hl7:lab".to_string(), "hosp-2:mv:adt".to_string()]);
        assert!(registry.get_org_connectors("hosp-1").is_empty());
        assert_eq!(registry.get_org_connectors("hosp-2").len(), 1);
    }

    #[tokio::test]
    async fn test_remove_org_matches_org_id_exactly() {
        let (registry, _) = registry();
        registry.get_connector(&config("a", "hl7", "lab")).await.unwrap();
        registry.get_connector(&config("a-b", "hl7", "lab")).await.unwrap();
        registry.get_connector(&config("ab", "rest", "lab")).await.unwrap();

        assert_eq!(registry.health_check_org("a").await.total_connectors, 1);
        assert_eq!(registry.get_org_connectors("a").len(), 1);
        assert_eq!(registry.remove_org_connectors("a").await, 1);
        assert_eq!(registry.remove_org_connectors("a:").await, 0);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_separator_in_identity_is_rejected() {
        let (registry, factory) = registry();
        let err = registry
            .get_connector(&config("a:b", "hl7", "lab"))
            .await
            .err()
            .unwrap();

        assert_eq!(err.code(), "CONFIG_ERROR");
        assert!(registry.instances.lock().is_empty());
        assert_eq!(factory.created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_remove_during_creation_destroys_new_instance() {
        let (registry, factory) = registry();
        *factory.connect_delay.lock() = Duration::from_millis(100);
        let registry = Arc::new(registry);
        let lab = config("h1", "hl7", "lab");

        let pending = {
            let registry = registry.clone();
            let lab = lab.clone();
            tokio::spawn(async move { registry.get_connector(&lab).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(registry.remove_connector(&lab).await);

        let err = pending.await.unwrap().err().unwrap();
        assert_eq!(err.code(), "CONFIG_ERROR");
        assert!(registry.is_empty());
        assert!(registry.instances.lock().is_empty());

        let created = factory.history();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].kit().status(), ConnectorStatus::Disconnected);
        assert_eq!(created[0].disconnect_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_replace_during_creation_keeps_single_live_instance() {
        let (registry, factory) = registry();
        *factory.connect_delay.lock() = Duration::from_millis(100);
        let registry = Arc::new(registry);
        let lab = config("h1", "hl7", "lab");

        let spawn_get = |registry: Arc<ConnectorRegistry>, lab: ConnectorConfig| {
            tokio::spawn(async move { registry.get_connector(&lab).await })
        };
        let first = spawn_get(registry.clone(), lab.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(registry.remove_connector(&lab).await);
        let second = spawn_get(registry.clone(), lab.clone());

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.status(), ConnectorStatus::Connected);
        assert_eq!(registry.len(), 1);

        let created = factory.history();
        assert_eq!(created.len(), 2);
        assert_eq!(created[0].kit().status(), ConnectorStatus::Disconnected);
        let live = created
            .iter()
            .filter(|c| c.kit().status() == ConnectorStatus::Connected)
            .count();
        assert_eq!(live, 1);

        registry.clear().await;
        assert!(created
            .iter()
            .all(|c| c.kit().status() == ConnectorStatus::Disconnected));
    }

    #[tokio::test]
    async fn test_destroy_failure_still_evicts() {
        let (registry, factory) = registry();
        let lab = config("h1", "hl7", "lab");
        registry.get_connector(&lab).await.unwrap();
        factory.connector("h1:hl7:lab").fail_disconnect.store(true, Ordering::SeqCst);

        assert!(registry.remove_connector(&lab).await);
        assert!(registry.get_existing(&lab).is_none());
        assert!(!registry.remove_connector(&lab).await);
    }

    #[tokio::test]
    async fn test_disconnect_all_reports_failures() {
        let (registry, factory) = registry();
        registry.get_connector(&config("h1", "tasy", "prod")).await.unwrap();
        registry.get_connector(&config("h1", "hl7", "lab")).await.unwrap();
        factory.connector("h1:hl7:lab").fail_disconnect.store(true, Ordering::SeqCst);

        let report = registry.disconnect_all().await;
        assert_eq!(report.attempted, 2);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, vec!["h1:hl7:lab".to_string()]);
        assert_eq!(registry.len(), 2);
        assert_eq!(
            factory.connector("h1:tasy:prod").kit().status(),
            ConnectorStatus::Disconnected
        );
    }

    #[tokio::test]
    async fn test_update_config_recreates_instance() {
        let (registry, factory) = registry();
        let original = registry.get_connector(&config("h1", "rest", "lab")).await.unwrap();

        let updated_config = config("h1", "rest", "lab").with_settings(json!({ "base_url": "http://new" }));
        let updated = registry.update_connector_config(&updated_config).await.unwrap();

        assert!(!Arc::ptr_eq(&original, &updated));
        assert_eq!(original.status(), ConnectorStatus::Disconnected);
        assert_eq!(updated.config().setting_str("base_url"), Some("http://new"));
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_stats_group_by_type_and_org() {
        let (registry, _) = registry();
        registry.get_connector(&config("h1", "tasy", "prod")).await.unwrap();
        registry.get_connector(&config("h1", "hl7", "lab")).await.unwrap();
        registry.get_connector(&config("h2", "hl7", "lab")).await.unwrap();

        let stats = registry.get_stats();
        assert_eq!(stats.total_connectors, 3);
        assert_eq!(stats.by_type["hl7"], 2);
        assert_eq!(stats.by_type["tasy"], 1);
        assert_eq!(stats.by_org["h1"], 2);
        assert_eq!(stats.by_org["h2"], 1);

        registry.clear().await;
        assert_eq!(registry.get_stats().total_connectors, 0);
    }

    #[tokio::test]
    async fn test_metrics_bridge_tracks_connections() {
        let factory = Arc::new(MockFactory::default());
        let metrics = MetricsCollector::new().unwrap();
        let registry = ConnectorRegistry::new(factory.clone()).with_metrics(metrics.clone());

        let connector = registry.get_connector(&config("h1", "hl7", "lab")).await.unwrap();
        connector
            .send(&StructuredMessage::new("ADT^A01", json!({ "raw": "MSH|" })))
            .await
            .unwrap();

        let output = metrics.export().unwrap();
        assert!(output.contains("hislink_active_connections"));
        assert!(output.contains("hislink_messages_sent_total{connector_type=\"hl7\",organization=\"h1\",protocol=\"hl7-mllp\"} 1"));

        registry.clear().await;
        let output = metrics.export().unwrap();
        assert!(output.contains("hislink_active_connections{connector_type=\"hl7\",organization=\"h1\",protocol=\"hl7-mllp\"} 0"));
    }

    #[tokio::test]
    async fn test_tasy_scenario_through_default_factory() {
        let app = Router::new()
            .route("/api/health", get(|| async { "ok" }))
            .route(
                "/api/integration/messages",
                post(|| async { Json(json!({ "accepted": true })) }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let defaults = ConnectorDefaults {
            retry: RetryConfig {
                max_retries: 0,
                ..RetryConfig::default()
            },
            ..ConnectorDefaults::default()
        };
        let metrics = MetricsCollector::new().unwrap();
        let registry = ConnectorRegistry::new(Arc::new(DefaultConnectorFactory::new(defaults)))
            .with_metrics(metrics.clone());

        let tasy = config("h1", "tasy", "prod").with_settings(json!({ "base_url": format!("http://{}", addr) }));
        let connector = registry.get_connector(&tasy).await.unwrap();
        assert_eq!(connector.status(), ConnectorStatus::Connected);
        assert_eq!(connector.kit().metrics().messages_sent, 0);

        connector
            .send(&StructuredMessage::new("ADT^A01", json!({ "patient_id": "12345" })))
            .await
            .unwrap();
        let health = connector.health_check().await.unwrap();
        assert_eq!(health.metrics.messages_sent, 1);
        assert!(health.metrics.last_message_at.is_some());

        let output = metrics.export().unwrap();
        assert!(output.contains("hislink_circuit_breaker_state"));
        assert!(output.contains("circuit=\"h1:tasy:prod\""));

        registry.clear().await;
    }
}
