//! REST/JSON 厂商接口连接器
//!
//! 用于 Tasy 等提供 HTTP API 的 HIS，以及通用 REST 端点。

use crate::circuit_breaker::CircuitBreaker;
use crate::connector::{Connector, ResilienceKit};
use crate::connectors::ConnectorDefaults;
use async_trait::async_trait;
use hislink_core::{
    ConnectorConfig, ConnectorError, ConnectorHealth, ConnectorStatus, ConnectorType, Result,
    StructuredMessage,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const DEFAULT_TIMEOUT_MS: u64 = 30000;

/// 认证配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthenticationConfig {
    #[default]
    None,
    Basic { username: String, password: String },
    ApiKey { key: String, header: Option<String> },
    Bearer { token: String },
}

/// 厂商接口路径与超时
#[derive(Debug, Clone, PartialEq)]
pub struct RestProfile {
    pub base_url: String,
    pub health_path: String,
    pub messages_path: String,
    pub timeout: Duration,
}

impl RestProfile {
    /// 按连接器类型取默认路径，协议配置中的字段优先
    pub fn from_config(config: &ConnectorConfig) -> Result<Self> {
        let (health_path, messages_path) = match config.connector_type {
            ConnectorType::Tasy => ("/api/health", "/api/integration/messages"),
            _ => ("/health", "/messages"),
        };

        let base_url = config
            .setting_str("base_url")
            .filter(|url| !url.is_empty())
            .ok_or_else(|| ConnectorError::Config(format!("{}: base_url is required", config.key())))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            health_path: config.setting_str("health_path").unwrap_or(health_path).to_string(),
            messages_path: config.setting_str("messages_path").unwrap_or(messages_path).to_string(),
            timeout: Duration::from_millis(config.setting_u64("timeout_ms").unwrap_or(DEFAULT_TIMEOUT_MS)),
        })
    }

    pub fn health_url(&self) -> String {
        format!("{}{}", self.base_url, self.health_path)
    }

    pub fn messages_url(&self) -> String {
        format!("{}{}", self.base_url, self.messages_path)
    }
}

/// 将 reqwest 错误归类为可重试或不可重试
pub fn map_reqwest_error(err: reqwest::Error) -> ConnectorError {
    if err.is_timeout() {
        ConnectorError::Timeout(err.to_string())
    } else if let Some(status) = err.status() {
        ConnectorError::Remote {
            status: status.as_u16(),
            message: err.to_string(),
        }
    } else if err.is_connect() || err.is_request() {
        ConnectorError::transport(err.to_string())
    } else if err.is_decode() || err.is_body() {
        ConnectorError::Protocol(err.to_string())
    } else if err.is_builder() {
        ConnectorError::Config(err.to_string())
    } else {
        ConnectorError::transport(err.to_string())
    }
}

/// REST 连接器
pub struct RestConnector {
    config: ConnectorConfig,
    kit: ResilienceKit,
    breaker: CircuitBreaker,
    profile: RestProfile,
    auth: AuthenticationConfig,
    client: RwLock<Option<reqwest::Client>>,
}

impl RestConnector {
    pub fn new(config: ConnectorConfig, defaults: &ConnectorDefaults) -> Result<Self> {
        let profile = RestProfile::from_config(&config)?;
        let auth = match config.settings.get("auth") {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| ConnectorError::Config(format!("{}: invalid auth settings: {}", config.key(), e)))?,
            None => AuthenticationConfig::None,
        };

        Ok(Self {
            kit: ResilienceKit::new(&config, &defaults.retry),
            breaker: CircuitBreaker::new(config.key(), defaults.circuit_breaker.clone()),
            profile,
            auth,
            client: RwLock::new(None),
            config,
        })
    }

    pub fn profile(&self) -> &RestProfile {
        &self.profile
    }

    /// 添加认证头
    fn add_auth_headers(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth {
            AuthenticationConfig::None => request,
            AuthenticationConfig::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
            AuthenticationConfig::ApiKey { key, header } => {
                let header_name = header.as_deref().unwrap_or("X-API-Key");
                request.header(header_name, key)
            }
            AuthenticationConfig::Bearer { token } => request.bearer_auth(token),
        }
    }

    fn current_client(&self) -> Result<reqwest::Client> {
        self.client
            .read()
            .clone()
            .ok_or_else(|| ConnectorError::NotConnected(self.kit.key()))
    }

    async fn probe(&self, client: &reqwest::Client) -> Result<()> {
        let url = self.profile.health_url();
        let response = self
            .add_auth_headers(client.get(&url))
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ConnectorError::Remote {
                status: status.as_u16(),
                message: format!("health probe {} failed", url),
            })
        }
    }

    async fn post_message(
        &self,
        client: &reqwest::Client,
        message: &StructuredMessage,
    ) -> Result<(Option<StructuredMessage>, usize)> {
        let response = self
            .add_auth_headers(client.post(self.profile.messages_url()).json(message))
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ConnectorError::Remote {
                status: status.as_u16(),
                message: body,
            });
        }

        let body = response.bytes().await.map_err(map_reqwest_error)?;
        if body.is_empty() {
            return Ok((None, 0));
        }

        let payload = serde_json::from_slice(&body)
            .unwrap_or_else(|_| serde_json::json!({ "text": String::from_utf8_lossy(&body) }));
        let reply = StructuredMessage {
            message_type: "response".to_string(),
            control_id: message.control_id.clone(),
            payload,
        };
        Ok((Some(reply), body.len()))
    }
}

#[async_trait]
impl Connector for RestConnector {
    fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    fn kit(&self) -> &ResilienceKit {
        &self.kit
    }

    fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        Some(&self.breaker)
    }

    async fn connect(&self) -> Result<()> {
        info!(connector = %self.kit.key(), url = %self.profile.base_url, "Connecting REST connector");
        self.kit.set_status(ConnectorStatus::Connecting);

        let client = reqwest::Client::builder()
            .timeout(self.profile.timeout)
            .build()
            .map_err(map_reqwest_error);
        let client = match client {
            Ok(client) => client,
            Err(err) => {
                self.kit.record_error(&err);
                self.kit.set_status(ConnectorStatus::Error);
                return Err(err);
            }
        };

        let client_ref = &client;
        let result = self
            .kit
            .retry("connect", || async move {
                self.breaker.execute(|| self.probe(client_ref)).await
            })
            .await;

        match result {
            Ok(()) => {
                *self.client.write() = Some(client);
                self.kit.set_status(ConnectorStatus::Connected);
                Ok(())
            }
            Err(err) => {
                if !err.retryable() {
                    self.kit.record_error(&err);
                }
                self.kit.set_status(ConnectorStatus::Error);
                Err(err)
            }
        }
    }

    async fn send(&self, message: &StructuredMessage) -> Result<Option<StructuredMessage>> {
        let client = self.current_client()?;
        let size = serde_json::to_vec(message)?.len();
        let started = Instant::now();

        let client_ref = &client;
        let result = self
            .kit
            .retry("send", || async move {
                self.breaker
                    .execute(|| self.post_message(client_ref, message))
                    .await
            })
            .await;

        match result {
            Ok((reply, reply_size)) => {
                if self.kit.status() == ConnectorStatus::Error {
                    info!(connector = %self.kit.key(), "REST delivery succeeded, connector recovered");
                    self.kit.set_status(ConnectorStatus::Connected);
                }
                self.kit.record_latency(started.elapsed().as_secs_f64() * 1000.0);
                self.kit.record_message_sent(size);
                if reply.is_some() {
                    self.kit.record_message_received(reply_size);
                }
                debug!(connector = %self.kit.key(), control_id = %message.control_id, "message delivered");
                Ok(reply)
            }
            Err(err) => {
                if !err.retryable() {
                    self.kit.record_error(&err);
                }
                self.kit.record_message_failed(&err);
                if err.retryable() || matches!(err, ConnectorError::CircuitOpen { .. }) {
                    self.kit.set_status(ConnectorStatus::Error);
                }
                Err(err)
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        let had_client = self.client.write().take().is_some();
        if had_client || self.kit.status() != ConnectorStatus::Disconnected {
            info!(connector = %self.kit.key(), "Disconnecting REST connector");
            self.kit.set_status(ConnectorStatus::Disconnected);
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<ConnectorHealth> {
        let mut health = self.kit.health_check();
        if self.breaker.state() != crate::circuit_breaker::CircuitState::Closed {
            health.message = format!("{} (circuit {})", health.message, self.breaker.state());
        }
        Ok(health)
    }

    fn validate_config(&self) -> Result<()> {
        self.config.validate_identity()?;
        if !self.profile.base_url.starts_with("http://") && !self.profile.base_url.starts_with("https://") {
            warn!(connector = %self.kit.key(), url = %self.profile.base_url, "base_url has no http scheme");
            return Err(ConnectorError::Config(format!(
                "{}: base_url must start with http:// or https://",
                self.kit.key()
            )));
        }
        Ok(())
    }
}
