//! HL7 v2 over MLLP 连接器
//!
//! 用于 MV 等通过 TCP 交换 HL7 消息的 HIS。每条消息发送后同步等待 ACK。

use crate::circuit_breaker::CircuitBreaker;
use crate::codec::{is_negative_ack, mllp, Hl7PipeCodec, MessageCodec};
use crate::connector::{Connector, ResilienceKit};
use crate::connectors::ConnectorDefaults;
use async_trait::async_trait;
use hislink_core::{ConnectorConfig, ConnectorError, ConnectorStatus, Result, StructuredMessage};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const DEFAULT_TIMEOUT_MS: u64 = 30000;
const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;
const READ_CHUNK: usize = 4096;

/// MLLP 连接器
pub struct MllpConnector {
    config: ConnectorConfig,
    kit: ResilienceKit,
    breaker: CircuitBreaker,
    address: String,
    timeout: Duration,
    /// 应答帧的最大字节数，超出后放弃读取
    max_frame_bytes: usize,
    codec: Arc<dyn MessageCodec>,
    stream: Mutex<Option<TcpStream>>,
}

impl MllpConnector {
    pub fn new(config: ConnectorConfig, defaults: &ConnectorDefaults) -> Result<Self> {
        Self::with_codec(config, defaults, Arc::new(Hl7PipeCodec::new()))
    }

    pub fn with_codec(
        config: ConnectorConfig,
        defaults: &ConnectorDefaults,
        codec: Arc<dyn MessageCodec>,
    ) -> Result<Self> {
        let host = config
            .setting_str("host")
            .filter(|host| !host.is_empty())
            .ok_or_else(|| ConnectorError::Config(format!("{}: host is required", config.key())))?;
        let port = config
            .setting_u64("port")
            .and_then(|port| u16::try_from(port).ok())
            .filter(|port| *port != 0)
            .ok_or_else(|| ConnectorError::Config(format!("{}: a valid port is required", config.key())))?;
        let max_frame_bytes = match config.setting_u64("max_frame_bytes") {
            None => DEFAULT_MAX_FRAME_BYTES,
            Some(limit) => usize::try_from(limit)
                .ok()
                .filter(|limit| *limit > 0)
                .ok_or_else(|| {
                    ConnectorError::Config(format!("{}: max_frame_bytes must be positive", config.key()))
                })?,
        };

        Ok(Self {
            kit: ResilienceKit::new(&config, &defaults.retry),
            breaker: CircuitBreaker::new(config.key(), defaults.circuit_breaker.clone()),
            address: format!("{}:{}", host, port),
            timeout: Duration::from_millis(config.setting_u64("timeout_ms").unwrap_or(DEFAULT_TIMEOUT_MS)),
            max_frame_bytes,
            codec,
            stream: Mutex::new(None),
            config,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn open_stream(&self) -> Result<TcpStream> {
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.address)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(ConnectorError::transport(format!("connect {}: {}", self.address, e))),
            Err(_) => Err(ConnectorError::Timeout(format!("connect {}", self.address))),
        }
    }

    /// 写入一帧并读取应答帧
    ///
    /// 流断开后下一次尝试重新建立 TCP 连接。
    async fn exchange(&self, framed: &[u8]) -> Result<Vec<u8>> {
        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            debug!(connector = %self.kit.key(), address = %self.address, "reopening MLLP stream");
            *guard = Some(self.open_stream().await?);
        }
        let stream = guard
            .as_mut()
            .ok_or_else(|| ConnectorError::NotConnected(self.kit.key()))?;

        let round_trip = Self::round_trip(stream, framed, self.max_frame_bytes);
        let result = match tokio::time::timeout(self.timeout, round_trip).await {
            Ok(result) => result,
            Err(_) => Err(ConnectorError::Timeout(format!("no ACK from {}", self.address))),
        };
        if result.is_err() {
            // 半途失败的流状态未知
            *guard = None;
        }
        result
    }

    async fn round_trip(stream: &mut TcpStream, framed: &[u8], max_frame_bytes: usize) -> Result<Vec<u8>> {
        stream.write_all(framed).await?;
        stream.flush().await?;

        let mut buffer = Vec::with_capacity(READ_CHUNK);
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(ConnectorError::transport("connection closed by peer before ACK"));
            }
            buffer.extend_from_slice(&chunk[..n]);
            if let Some(end) = mllp::frame_end(&buffer) {
                buffer.truncate(end);
                return Ok(buffer);
            }
            if buffer.len() > max_frame_bytes {
                return Err(ConnectorError::Protocol(format!(
                    "ACK frame exceeds {} bytes without end block",
                    max_frame_bytes
                )));
            }
        }
    }

    fn fail_send(&self, err: ConnectorError) -> ConnectorError {
        if !err.retryable() {
            self.kit.record_error(&err);
        }
        self.kit.record_message_failed(&err);
        err
    }
}

#[async_trait]
impl Connector for MllpConnector {
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
        info!(connector = %self.kit.key(), address = %self.address, "Connecting MLLP connector");
        self.kit.set_status(ConnectorStatus::Connecting);

        let result = self
            .kit
            .retry("connect", || async move {
                self.breaker.execute(|| self.open_stream()).await
            })
            .await;

        match result {
            Ok(stream) => {
                *self.stream.lock().await = Some(stream);
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

    /// 发送一条消息并等待 ACK
    ///
    /// `error` 状态下仍允许发送，`exchange` 会重新建立连接；成功后恢复为 `connected`。
    async fn send(&self, message: &StructuredMessage) -> Result<Option<StructuredMessage>> {
        if matches!(
            self.kit.status(),
            ConnectorStatus::Disconnected | ConnectorStatus::Connecting
        ) {
            return Err(ConnectorError::NotConnected(self.kit.key()));
        }

        let encoded = match self.codec.encode(message) {
            Ok(encoded) => encoded,
            Err(err) => return Err(self.fail_send(err)),
        };
        let framed = mllp::frame(&encoded);
        let started = Instant::now();

        let framed_ref = framed.as_slice();
        let result = self
            .kit
            .retry("send", || async move {
                self.breaker.execute(|| self.exchange(framed_ref)).await
            })
            .await;

        let reply_frame = match result {
            Ok(reply) => reply,
            Err(err) => {
                if err.retryable() || matches!(err, ConnectorError::CircuitOpen { .. }) {
                    self.kit.set_status(ConnectorStatus::Error);
                }
                return Err(self.fail_send(err));
            }
        };

        if self.kit.status() == ConnectorStatus::Error {
            info!(connector = %self.kit.key(), "MLLP exchange succeeded, connector recovered");
            self.kit.set_status(ConnectorStatus::Connected);
        }
        self.kit.record_latency(started.elapsed().as_secs_f64() * 1000.0);
        self.kit.record_message_sent(framed.len());

        let reply = match mllp::unframe(&reply_frame).and_then(|body| self.codec.decode(body)) {
            Ok(reply) => reply,
            Err(err) => return Err(self.fail_send(err)),
        };
        self.kit.record_message_received(reply_frame.len());

        if is_negative_ack(&reply) {
            let ack_code = reply.payload["ack_code"].as_str().unwrap_or_default().to_string();
            warn!(
                connector = %self.kit.key(),
                control_id = %message.control_id,
                ack_code = %ack_code,
                "message rejected by remote"
            );
            return Err(self.fail_send(ConnectorError::Protocol(format!(
                "message {} rejected with {}",
                message.control_id, ack_code
            ))));
        }

        debug!(connector = %self.kit.key(), control_id = %message.control_id, "message acknowledged");
        Ok(Some(reply))
    }

    async fn disconnect(&self) -> Result<()> {
        let stream = self.stream.lock().await.take();
        let result = match stream {
            Some(mut stream) => {
                info!(connector = %self.kit.key(), "Disconnecting MLLP connector");
                stream.shutdown().await.map_err(ConnectorError::from)
            }
            None => Ok(()),
        };
        if self.kit.status() != ConnectorStatus::Disconnected {
            self.kit.set_status(ConnectorStatus::Disconnected);
        }
        result
    }
}
