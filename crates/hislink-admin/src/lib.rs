//! # HisLink管理模块
//!
//! 提供连接器指标收集和系统配置加载

pub mod config;
pub mod metrics;

pub use config::{AppConfig, CircuitBreakerSettings, LoggingConfig, ServerConfig, SupervisorConfig};
pub use metrics::{circuit_state_to_metric, MetricLabels, MetricsCollector};
