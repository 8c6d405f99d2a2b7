//! HIS 连接器集成模块
//!
//! 提供连接器接口、重试与熔断、具体的 REST/MLLP 连接器以及连接器注册表。

pub mod circuit_breaker;
pub mod codec;
pub mod connector;
pub mod connectors;
pub mod registry;
pub mod retry;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testing;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitListener, CircuitState,
    CircuitStateChange,
};
pub use codec::{Hl7PipeCodec, MessageCodec, MessageTransformer};
pub use connector::{Connector, ConnectorEvent, EventListener, ResilienceKit};
pub use connectors::{
    AuthenticationConfig, ConnectorDefaults, ConnectorFactory, DefaultConnectorFactory,
    MllpConnector, RestConnector,
};
pub use registry::{BulkReport, ConnectorInstance, ConnectorRegistry, ConnectorSummary};
pub use retry::execute_with_retry;
pub use supervisor::RegistrySupervisor;
