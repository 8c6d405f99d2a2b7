//! 配置管理
//!
//! 默认值 < 配置文件 < 环境变量（前缀 `HISLINK`，层级分隔符 `__`）。

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File, FileFormat};
use hislink_core::{ConnectorConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// 系统完整配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// 运维HTTP服务配置
    pub server: ServerConfig,
    /// 日志配置
    pub logging: LoggingConfig,
    /// 连接器未覆盖时使用的重试策略
    pub retry: RetryConfig,
    /// 熔断器配置
    pub circuit_breaker: CircuitBreakerSettings,
    /// 后台巡检配置
    pub supervisor: SupervisorConfig,
    /// 连接器列表
    pub connectors: Vec<ConnectorConfig>,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8088,
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// 熔断器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout_ms: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout_ms: 30000,
        }
    }
}

/// 后台巡检配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub health_check_interval_secs: u64,
    pub reconnect_interval_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: 30,
            reconnect_interval_secs: 60,
        }
    }
}

impl SupervisorConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }
}

impl AppConfig {
    /// 从可选的配置文件和环境变量加载配置
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path));
        }
        let settings = builder
            .add_source(Self::environment())
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        app_config.validate()?;
        Ok(app_config)
    }

    /// 从TOML字符串加载配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()
            .context("Failed to parse configuration")?;

        let app_config: AppConfig = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        app_config.validate()?;
        Ok(app_config)
    }

    fn environment() -> Environment {
        Environment::with_prefix("HISLINK")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            bail!("server.port must be non-zero");
        }
        validate_retry(&self.retry).context("Invalid retry policy")?;
        if self.circuit_breaker.failure_threshold == 0 || self.circuit_breaker.success_threshold == 0 {
            bail!("circuit_breaker thresholds must be non-zero");
        }
        if self.supervisor.health_check_interval_secs == 0 || self.supervisor.reconnect_interval_secs == 0 {
            bail!("supervisor intervals must be non-zero");
        }

        let mut keys = HashSet::new();
        for connector in &self.connectors {
            connector
                .validate_identity()
                .with_context(|| format!("Invalid connector '{}'", connector.name))?;
            if let Some(retry) = &connector.retry {
                validate_retry(retry)
                    .with_context(|| format!("Invalid retry override for connector {}", connector.key()))?;
            }
            if !keys.insert(connector.key()) {
                bail!("Duplicate connector: {}", connector.key());
            }
        }
        Ok(())
    }
}

fn validate_retry(retry: &RetryConfig) -> Result<()> {
    if retry.backoff_multiplier < 1.0 {
        bail!("backoff_multiplier must be >= 1");
    }
    if retry.initial_delay_ms > retry.max_delay_ms {
        bail!("initial_delay_ms must not exceed max_delay_ms");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hislink_core::ConnectorType;

    const SAMPLE: &str = r#"
        [server]
        port = 9090

        [retry]
        max_retries = 5
        initial_delay_ms = 500

        [[connectors]]
        org_id = "h1"
        type = "tasy"
        name = "prod"
        settings = { base_url = "http://tasy.h1.local" }

        [[connectors]]
        org_id = "h2"
        type = "hl7"
        name = "lab"
        enabled = false
        settings = { host = "10.0.0.5", port = 2575 }
    "#;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8088);
        assert_eq!(config.retry, RetryConfig::default());
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_toml() {
        let config = AppConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.max_delay_ms, 30000);
        assert_eq!(config.connectors.len(), 2);
        assert_eq!(config.connectors[0].connector_type, ConnectorType::Tasy);
        assert!(!config.connectors[1].enabled);
        assert_eq!(config.connectors[1].setting_u64("port"), Some(2575));
    }

    #[test]
    fn test_duplicate_connectors_rejected() {
        let content = r#"
            [[connectors]]
            org_id = "h1"
            type = "tasy"
            name = "prod"

            [[connectors]]
            org_id = "h1"
            type = "tasy"
            name = "prod"
        "#;
        let err = AppConfig::from_toml_str(content).unwrap_err();
        assert!(err.to_string().contains("Duplicate connector"));
    }

    #[test]
    fn test_invalid_retry_rejected() {
        let mut config = AppConfig::default();
        config.retry.initial_delay_ms = 60000;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.retry.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_connector_retry_override_rejected() {
        let mut config = AppConfig::default();
        config.connectors.push(ConnectorConfig::new("h1", "hl7", "lab").with_retry(RetryConfig {
            backoff_multiplier: 0.5,
            ..RetryConfig::default()
        }));
        let err = config.validate().unwrap_err();
        assert!(format!("{:#}", err).contains("h1:hl7:lab"));

        config.connectors[0].retry = Some(RetryConfig {
            initial_delay_ms: 5000,
            max_delay_ms: 1000,
            ..RetryConfig::default()
        });
        assert!(config.validate().is_err());

        config.connectors[0].retry = Some(RetryConfig::default());
        assert!(config.validate().is_ok());
    }
}
