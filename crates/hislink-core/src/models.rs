//! 核心数据模型定义

use crate::error::{ConnectorError, Result};
use crate::utils;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// 平均延迟的指数滑动平均系数
pub const LATENCY_SMOOTHING: f64 = 0.2;

/// 连接器类型
///
/// 未识别的类型名保留为 `Custom`，由工厂决定是否支持。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ConnectorType {
    /// Philips Tasy HIS (REST/JSON)
    Tasy,
    /// MV Soul HIS (HL7 v2 over MLLP)
    Mv,
    /// 通用 HL7 v2 / MLLP 端点
    Hl7,
    /// 通用 REST 端点
    Rest,
    Custom(String),
}

impl ConnectorType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Tasy => "tasy",
            Self::Mv => "mv",
            Self::Hl7 => "hl7",
            Self::Rest => "rest",
            Self::Custom(name) => name,
        }
    }

    /// 连接器使用的传输协议，作为指标标签
    pub fn protocol(&self) -> &'static str {
        match self {
            Self::Tasy | Self::Rest => "rest",
            Self::Mv | Self::Hl7 => "hl7-mllp",
            Self::Custom(_) => "custom",
        }
    }
}

impl From<String> for ConnectorType {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "tasy" => Self::Tasy,
            "mv" => Self::Mv,
            "hl7" => Self::Hl7,
            "rest" => Self::Rest,
            _ => Self::Custom(value),
        }
    }
}

impl From<&str> for ConnectorType {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<ConnectorType> for String {
    fn from(value: ConnectorType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for ConnectorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 重试策略
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// 所有重试耗尽时的最长累计等待时间（毫秒）
    pub fn worst_case_delay_ms(&self) -> u64 {
        let mut delay = self.initial_delay_ms.min(self.max_delay_ms) as f64;
        let mut total = 0.0;
        for _ in 0..self.max_retries {
            total += delay;
            delay = (delay * self.backoff_multiplier).min(self.max_delay_ms as f64);
        }
        total as u64
    }
}

/// 连接器配置
///
/// 构造连接器后不可变；修改配置需要移除并重建连接器实例。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    pub org_id: String,
    #[serde(rename = "type")]
    pub connector_type: ConnectorType,
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 协议相关配置
    #[serde(default)]
    pub settings: serde_json::Value,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

fn default_enabled() -> bool {
    true
}

impl ConnectorConfig {
    pub fn new(
        org_id: impl Into<String>,
        connector_type: impl Into<ConnectorType>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            org_id: org_id.into(),
            connector_type: connector_type.into(),
            name: name.into(),
            enabled: true,
            settings: serde_json::Value::Null,
            retry: None,
        }
    }

    pub fn with_settings(mut self, settings: serde_json::Value) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// 注册表键 `{org_id}:{type}:{name}`
    pub fn key(&self) -> String {
        utils::connector_key(&self.org_id, &self.connector_type, &self.name)
    }

    /// 生效的重试策略：连接器覆盖优先
    pub fn retry_or(&self, fallback: &RetryConfig) -> RetryConfig {
        self.retry.clone().unwrap_or_else(|| fallback.clone())
    }

    /// 校验身份字段
    pub fn validate_identity(&self) -> Result<()> {
        if self.org_id.trim().is_empty() {
            return Err(ConnectorError::Config("organization id is required".to_string()));
        }
        if self.name.trim().is_empty() {
            return Err(ConnectorError::Config("connector name is required".to_string()));
        }
        // 分隔符出现在身份字段中会让不同的三元组得到同一个键
        for (field, value) in [
            ("organization id", self.org_id.as_str()),
            ("connector type", self.connector_type.as_str()),
            ("connector name", self.name.as_str()),
        ] {
            if value.contains(utils::KEY_SEPARATOR) {
                return Err(ConnectorError::Config(format!(
                    "{} must not contain '{}': {}",
                    field,
                    utils::KEY_SEPARATOR,
                    value
                )));
            }
        }
        Ok(())
    }

    /// 读取协议配置中的字符串字段
    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(|v| v.as_str())
    }

    /// 读取协议配置中的整数字段
    pub fn setting_u64(&self, key: &str) -> Option<u64> {
        self.settings.get(key).and_then(|v| v.as_u64())
    }
}

/// 连接器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ConnectorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 连接器运行指标
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectorMetrics {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub error_count: u64,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub average_latency_ms: f64,
    pub uptime_ms: u64,
}

impl ConnectorMetrics {
    /// 以指数滑动平均更新平均延迟
    pub fn observe_latency(&mut self, millis: f64) {
        self.average_latency_ms =
            LATENCY_SMOOTHING * millis + (1.0 - LATENCY_SMOOTHING) * self.average_latency_ms;
    }
}

/// 结构化消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredMessage {
    pub message_type: String,
    pub control_id: String,
    pub payload: serde_json::Value,
}

impl StructuredMessage {
    pub fn new(message_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            message_type: message_type.into(),
            control_id: utils::generate_control_id(),
            payload,
        }
    }

    pub fn with_control_id(mut self, control_id: impl Into<String>) -> Self {
        self.control_id = control_id.into();
        self
    }
}

/// 单个连接器健康检查结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorHealth {
    pub healthy: bool,
    pub status: ConnectorStatus,
    pub message: String,
    pub metrics: ConnectorMetrics,
    pub timestamp: DateTime<Utc>,
}

impl ConnectorHealth {
    /// 健康检查本身失败时的合成结果
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            status: ConnectorStatus::Error,
            message: message.into(),
            metrics: ConnectorMetrics::default(),
            timestamp: Utc::now(),
        }
    }
}

/// 聚合健康状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateHealth {
    pub healthy: bool,
    pub total_connectors: usize,
    pub healthy_connectors: usize,
    pub unhealthy_connectors: usize,
    pub connectors: HashMap<String, ConnectorHealth>,
    pub timestamp: DateTime<Utc>,
}

impl AggregateHealth {
    pub fn from_results(connectors: HashMap<String, ConnectorHealth>) -> Self {
        let healthy_connectors = connectors.values().filter(|h| h.healthy).count();
        let unhealthy_connectors = connectors.len() - healthy_connectors;

        Self {
            // 空集合不视为健康
            healthy: unhealthy_connectors == 0 && healthy_connectors > 0,
            total_connectors: connectors.len(),
            healthy_connectors,
            unhealthy_connectors,
            connectors,
            timestamp: Utc::now(),
        }
    }
}

/// 注册表统计
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_connectors: usize,
    pub by_type: HashMap<String, usize>,
    pub by_org: HashMap<String, usize>,
}
