//! 连接器接口与共享的韧性组件
//!
//! 具体连接器实现 [`Connector`] 的 connect/send/disconnect，并通过组合持有一个
//! [`ResilienceKit`]，由它负责状态跟踪、指标记录、重试和事件通知。

use crate::circuit_breaker::CircuitBreaker;
use crate::retry::execute_with_retry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hislink_core::{
    ConnectorConfig, ConnectorError, ConnectorHealth, ConnectorMetrics, ConnectorStatus,
    ConnectorType, Result, RetryConfig, StructuredMessage,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 连接器事件
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ConnectorEvent {
    StatusChanged {
        from: ConnectorStatus,
        to: ConnectorStatus,
        timestamp: DateTime<Utc>,
    },
    MessageSent {
        size_bytes: usize,
    },
    MessageReceived {
        size_bytes: usize,
    },
    MessageFailed {
        code: &'static str,
    },
    Error {
        code: &'static str,
        message: String,
        retryable: bool,
    },
    Latency {
        millis: f64,
    },
}

pub type EventListener = Arc<dyn Fn(&ConnectorEvent) + Send + Sync>;

/// 连接器接口
#[async_trait]
pub trait Connector: Send + Sync {
    /// 构造该连接器的配置
    fn config(&self) -> &ConnectorConfig;

    /// 共享的状态、指标与重试组件
    fn kit(&self) -> &ResilienceKit;

    /// 建立远端会话
    ///
    /// 不保证幂等，调用方应先检查当前状态。
    async fn connect(&self) -> Result<()>;

    /// 发送一条结构化消息，返回远端的应答（如有）
    async fn send(&self, message: &StructuredMessage) -> Result<Option<StructuredMessage>>;

    /// 关闭远端会话；未连接时调用也必须安全
    async fn disconnect(&self) -> Result<()>;

    fn status(&self) -> ConnectorStatus {
        self.kit().status()
    }

    /// 保护远端调用的熔断器，没有则返回 None
    fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        None
    }

    /// 健康检查
    async fn health_check(&self) -> Result<ConnectorHealth> {
        Ok(self.kit().health_check())
    }

    fn validate_config(&self) -> Result<()> {
        self.config().validate_identity()
    }

    /// 断开连接并移除所有观察者
    ///
    /// 断开失败会向调用方传播：连接器可能仍持有资源。
    async fn destroy(&self) -> Result<()> {
        let result = self.disconnect().await;
        self.kit().detach_observers();
        if let Err(err) = &result {
            warn!(connector = %self.kit().key(), error = %err, "connector destroy failed");
        }
        result
    }
}

#[derive(Debug)]
struct KitState {
    status: ConnectorStatus,
    connected_at: Option<DateTime<Utc>>,
    metrics: ConnectorMetrics,
}

/// 连接器共享的韧性组件
pub struct ResilienceKit {
    org_id: String,
    connector_type: ConnectorType,
    name: String,
    retry_config: RetryConfig,
    state: Mutex<KitState>,
    listeners: RwLock<Vec<EventListener>>,
}

impl std::fmt::Debug for ResilienceKit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceKit")
            .field("key", &self.key())
            .field("retry_config", &self.retry_config)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl ResilienceKit {
    pub fn new(config: &ConnectorConfig, default_retry: &RetryConfig) -> Self {
        Self {
            org_id: config.org_id.clone(),
            connector_type: config.connector_type.clone(),
            name: config.name.clone(),
            retry_config: config.retry_or(default_retry),
            state: Mutex::new(KitState {
                status: ConnectorStatus::Disconnected,
                connected_at: None,
                metrics: ConnectorMetrics::default(),
            }),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn key(&self) -> String {
        hislink_core::utils::connector_key(&self.org_id, &self.connector_type, &self.name)
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry_config
    }

    pub fn status(&self) -> ConnectorStatus {
        self.state.lock().status
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().connected_at
    }

    /// 状态转换
    ///
    /// 进入 connected 时记录连接时间，进入 disconnected 时清除；
    /// 每次调用都会通知观察者。
    pub fn set_status(&self, status: ConnectorStatus) {
        let previous = {
            let mut state = self.state.lock();
            let previous = state.status;
            if status == ConnectorStatus::Connected && previous != ConnectorStatus::Connected {
                state.connected_at = Some(Utc::now());
            } else if status == ConnectorStatus::Disconnected {
                state.connected_at = None;
                state.metrics.uptime_ms = 0;
            }
            state.status = status;
            previous
        };

        info!(
            org_id = %self.org_id,
            connector_type = %self.connector_type,
            connector = %self.name,
            from = %previous,
            to = %status,
            "connector status changed"
        );
        self.emit(ConnectorEvent::StatusChanged {
            from: previous,
            to: status,
            timestamp: Utc::now(),
        });
    }

    pub fn record_message_sent(&self, size_bytes: usize) {
        {
            let mut state = self.state.lock();
            state.metrics.messages_sent += 1;
            state.metrics.last_message_at = Some(Utc::now());
        }
        self.emit(ConnectorEvent::MessageSent { size_bytes });
    }

    pub fn record_message_received(&self, size_bytes: usize) {
        {
            let mut state = self.state.lock();
            state.metrics.messages_received += 1;
            state.metrics.last_message_at = Some(Utc::now());
        }
        self.emit(ConnectorEvent::MessageReceived { size_bytes });
    }

    pub fn record_error(&self, error: &ConnectorError) {
        {
            let mut state = self.state.lock();
            state.metrics.error_count += 1;
            state.metrics.last_error_at = Some(Utc::now());
            state.metrics.last_error = Some(error.to_string());
        }
        debug!(connector = %self.key(), code = error.code(), error = %error, "connector error");
        self.emit(ConnectorEvent::Error {
            code: error.code(),
            message: error.to_string(),
            retryable: error.retryable(),
        });
    }

    /// 一次发送最终失败；错误本身由 `record_error` 或 `retry` 记录
    pub fn record_message_failed(&self, error: &ConnectorError) {
        self.emit(ConnectorEvent::MessageFailed { code: error.code() });
    }

    pub fn record_latency(&self, millis: f64) {
        self.state.lock().metrics.observe_latency(millis);
        self.emit(ConnectorEvent::Latency { millis });
    }

    /// 指标快照，连接中时重新计算运行时长
    pub fn metrics(&self) -> ConnectorMetrics {
        let mut state = self.state.lock();
        if state.status == ConnectorStatus::Connected {
            if let Some(connected_at) = state.connected_at {
                state.metrics.uptime_ms = (Utc::now() - connected_at).num_milliseconds().max(0) as u64;
            }
        }
        state.metrics.clone()
    }

    pub fn health_check(&self) -> ConnectorHealth {
        let metrics = self.metrics();
        let status = self.status();
        let message = match status {
            ConnectorStatus::Connected => "Connector is connected".to_string(),
            ConnectorStatus::Connecting => "Connector is connecting".to_string(),
            ConnectorStatus::Disconnected => "Connector is disconnected".to_string(),
            ConnectorStatus::Error => match &metrics.last_error {
                Some(last_error) => format!("Connector is in error state: {}", last_error),
                None => "Connector is in error state".to_string(),
            },
        };

        ConnectorHealth {
            healthy: status == ConnectorStatus::Connected,
            status,
            message,
            metrics,
            timestamp: Utc::now(),
        }
    }

    /// 按连接器的重试策略执行操作，耗尽时记录最终错误
    pub async fn retry<T, F, Fut>(&self, context: &str, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let context = format!("{}:{}", self.key(), context);
        let result = execute_with_retry(&self.retry_config, &context, operation).await;
        if let Err(err) = &result {
            // 可重试错误只在耗尽后返回
            if err.retryable() {
                self.record_error(err);
            }
        }
        result
    }

    /// 注册观察者
    pub fn subscribe(&self, listener: EventListener) {
        self.listeners.write().push(listener);
    }

    pub fn detach_observers(&self) {
        self.listeners.write().clear();
    }

    pub fn observer_count(&self) -> usize {
        self.listeners.read().len()
    }

    fn emit(&self, event: ConnectorEvent) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener(&event);
        }
    }
}
