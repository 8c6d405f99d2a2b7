//! 测试用的可控连接器与工厂

use crate::connector::{Connector, ResilienceKit};
use crate::connectors::ConnectorFactory;
use async_trait::async_trait;
use hislink_core::{
    ConnectorConfig, ConnectorError, ConnectorHealth, ConnectorStatus, ConnectorType, Result,
    RetryConfig, StructuredMessage,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub(crate) struct MockConnector {
    config: ConnectorConfig,
    kit: ResilienceKit,
    connect_delay: Duration,
    pub fail_connect: AtomicBool,
    pub fail_health: AtomicBool,
    pub fail_disconnect: AtomicBool,
    pub connect_calls: AtomicU32,
    pub disconnect_calls: AtomicU32,
}

impl MockConnector {
    pub fn new(config: ConnectorConfig, fail_connect: bool, connect_delay: Duration) -> Self {
        let retry = RetryConfig {
            max_retries: 0,
            ..RetryConfig::default()
        };
        Self {
            kit: ResilienceKit::new(&config, &retry),
            config,
            connect_delay,
            fail_connect: AtomicBool::new(fail_connect),
            fail_health: AtomicBool::new(false),
            fail_disconnect: AtomicBool::new(false),
            connect_calls: AtomicU32::new(0),
            disconnect_calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Connector for MockConnector {
    fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    fn kit(&self) -> &ResilienceKit {
        &self.kit
    }

    async fn connect(&self) -> Result<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        self.kit.set_status(ConnectorStatus::Connecting);
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        if self.fail_connect.load(Ordering::SeqCst) {
            let err = ConnectorError::transport("connection refused");
            self.kit.record_error(&err);
            self.kit.set_status(ConnectorStatus::Error);
            return Err(err);
        }
        self.kit.set_status(ConnectorStatus::Connected);
        Ok(())
    }

    async fn send(&self, message: &StructuredMessage) -> Result<Option<StructuredMessage>> {
        if self.kit.status() != ConnectorStatus::Connected {
            return Err(ConnectorError::NotConnected(self.kit.key()));
        }
        self.kit.record_message_sent(message.payload.to_string().len());
        Ok(None)
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.kit.set_status(ConnectorStatus::Disconnected);
        if self.fail_disconnect.load(Ordering::SeqCst) {
            return Err(ConnectorError::transport("socket close failed"));
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<ConnectorHealth> {
        if self.fail_health.load(Ordering::SeqCst) {
            return Err(ConnectorError::transport("health probe crashed"));
        }
        Ok(self.kit.health_check())
    }
}

/// 记录每个键最近创建的连接器
#[derive(Default)]
pub(crate) struct MockFactory {
    pub created: AtomicU32,
    pub fail_connect: AtomicBool,
    pub connect_delay: Mutex<Duration>,
    connectors: Mutex<HashMap<String, Arc<MockConnector>>>,
    history: Mutex<Vec<Arc<MockConnector>>>,
}

impl MockFactory {
    pub fn connector(&self, key: &str) -> Arc<MockConnector> {
        self.connectors.lock()[key].clone()
    }

    /// 按创建顺序返回全部连接器，包括已被替换的
    pub fn history(&self) -> Vec<Arc<MockConnector>> {
        self.history.lock().clone()
    }
}

impl ConnectorFactory for MockFactory {
    fn create(&self, config: &ConnectorConfig) -> Result<Arc<dyn Connector>> {
        if let ConnectorType::Custom(name) = &config.connector_type {
            return Err(ConnectorError::UnknownConnectorType(name.clone()));
        }
        config.validate_identity()?;

        self.created.fetch_add(1, Ordering::SeqCst);
        let connector = Arc::new(MockConnector::new(
            config.clone(),
            self.fail_connect.load(Ordering::SeqCst),
            *self.connect_delay.lock(),
        ));
        self.connectors.lock().insert(config.key(), connector.clone());
        self.history.lock().push(connector.clone());
        Ok(connector)
    }
}
