//! 错误定义模块
//!
//! 所有连接器错误都携带明确的可重试标记和错误码，重试引擎只依据
//! `retryable()` 决定是否继续，不关心具体协议。

use std::time::Duration;
use thiserror::Error;

/// 连接器统一错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectorError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("未知连接器类型: {0}")]
    UnknownConnectorType(String),

    #[error("传输错误: {message}")]
    Transport { message: String, retryable: bool },

    #[error("请求超时: {0}")]
    Timeout(String),

    #[error("远端返回错误状态 {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("协议错误: {0}")]
    Protocol(String),

    #[error("验证错误: {0}")]
    Validation(String),

    #[error("熔断器 {name} 已开启, {}秒后重试", .retry_after.as_secs_f64().ceil())]
    CircuitOpen { name: String, retry_after: Duration },

    #[error("连接器未连接: {0}")]
    NotConnected(String),
}

impl ConnectorError {
    /// 可重试的传输错误
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// 不可重试的传输错误
    pub fn fatal_transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// 是否允许重试引擎继续尝试
    pub fn retryable(&self) -> bool {
        match self {
            Self::Config(_) | Self::UnknownConnectorType(_) => false,
            Self::Transport { retryable, .. } => *retryable,
            Self::Timeout(_) => true,
            Self::Remote { status, .. } => *status >= 500 || *status == 429,
            Self::Protocol(_) | Self::Validation(_) => false,
            Self::CircuitOpen { .. } => false,
            Self::NotConnected(_) => true,
        }
    }

    /// 稳定的错误码，用于指标标签和告警
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::UnknownConnectorType(_) => "UNKNOWN_CONNECTOR_TYPE",
            Self::Transport { .. } => "TRANSPORT_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::Remote { .. } => "REMOTE_ERROR",
            Self::Protocol(_) => "PROTOCOL_ERROR",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::NotConnected(_) => "NOT_CONNECTED",
        }
    }
}

impl From<std::io::Error> for ConnectorError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::InvalidData | ErrorKind::InvalidInput => Self::Protocol(err.to_string()),
            ErrorKind::TimedOut => Self::Timeout(err.to_string()),
            _ => Self::transport(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ConnectorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

/// 连接器统一结果类型
pub type Result<T> = std::result::Result<T, ConnectorError>;
