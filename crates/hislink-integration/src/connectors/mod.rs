//! 具体连接器与工厂

pub mod mllp;
pub mod rest;

pub use mllp::MllpConnector;
pub use rest::{AuthenticationConfig, RestConnector, RestProfile};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::codec::{Hl7PipeCodec, MessageCodec};
use crate::connector::Connector;
use hislink_admin::AppConfig;
use hislink_core::{ConnectorConfig, ConnectorError, ConnectorType, Result, RetryConfig};
use std::sync::Arc;

/// 连接器未单独配置时使用的默认策略
#[derive(Debug, Clone, Default)]
pub struct ConnectorDefaults {
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl From<&AppConfig> for ConnectorDefaults {
    fn from(config: &AppConfig) -> Self {
        Self {
            retry: config.retry.clone(),
            circuit_breaker: CircuitBreakerConfig::from(&config.circuit_breaker),
        }
    }
}

/// 按配置创建连接器
pub trait ConnectorFactory: Send + Sync {
    fn create(&self, config: &ConnectorConfig) -> Result<Arc<dyn Connector>>;
}

/// 内置类型的工厂
///
/// tasy/rest 使用 [`RestConnector`]，mv/hl7 使用 [`MllpConnector`]。
pub struct DefaultConnectorFactory {
    defaults: ConnectorDefaults,
    hl7_codec: Arc<dyn MessageCodec>,
}

impl DefaultConnectorFactory {
    pub fn new(defaults: ConnectorDefaults) -> Self {
        Self {
            defaults,
            hl7_codec: Arc::new(Hl7PipeCodec::new()),
        }
    }

    /// 替换 HL7 编解码器
    pub fn with_hl7_codec(mut self, codec: Arc<dyn MessageCodec>) -> Self {
        self.hl7_codec = codec;
        self
    }
}

impl Default for DefaultConnectorFactory {
    fn default() -> Self {
        Self::new(ConnectorDefaults::default())
    }
}

impl ConnectorFactory for DefaultConnectorFactory {
    fn create(&self, config: &ConnectorConfig) -> Result<Arc<dyn Connector>> {
        let connector: Arc<dyn Connector> = match &config.connector_type {
            ConnectorType::Tasy | ConnectorType::Rest => {
                Arc::new(RestConnector::new(config.clone(), &self.defaults)?)
            }
            ConnectorType::Mv | ConnectorType::Hl7 => Arc::new(MllpConnector::with_codec(
                config.clone(),
                &self.defaults,
                self.hl7_codec.clone(),
            )?),
            ConnectorType::Custom(name) => {
                return Err(ConnectorError::UnknownConnectorType(name.clone()))
            }
        };
        connector.validate_config()?;
        Ok(connector)
    }
}
