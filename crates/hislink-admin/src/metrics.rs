//! 连接器指标收集
//!
//! 以 (connector_type, organization, protocol) 为标签记录计数器、仪表和直方图，
//! 并导出 Prometheus 文本格式。

use anyhow::Result;
use hislink_core::ConnectorConfig;
use prometheus::{
    GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
};
use tracing::debug;

const BASE_LABELS: [&str; 3] = ["connector_type", "organization", "protocol"];

/// 指标标签
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricLabels {
    pub connector_type: String,
    pub organization: String,
    pub protocol: String,
}

impl MetricLabels {
    pub fn new(
        connector_type: impl Into<String>,
        organization: impl Into<String>,
        protocol: impl Into<String>,
    ) -> Self {
        Self {
            connector_type: connector_type.into(),
            organization: organization.into(),
            protocol: protocol.into(),
        }
    }

    fn values(&self) -> [&str; 3] {
        [&self.connector_type, &self.organization, &self.protocol]
    }
}

impl From<&ConnectorConfig> for MetricLabels {
    fn from(config: &ConnectorConfig) -> Self {
        Self::new(
            config.connector_type.as_str(),
            config.org_id.as_str(),
            config.connector_type.protocol(),
        )
    }
}

/// 将熔断器状态映射为数值，便于告警阈值比较
pub fn circuit_state_to_metric(state: &str) -> i64 {
    match state.to_ascii_uppercase().as_str() {
        "CLOSED" => 0,
        "HALF_OPEN" => 1,
        "OPEN" => 2,
        _ => -1,
    }
}

/// 连接器指标收集器
#[derive(Clone)]
pub struct MetricsCollector {
    registry: Registry,
    messages_sent: IntCounterVec,
    messages_received: IntCounterVec,
    messages_failed: IntCounterVec,
    connection_errors: IntCounterVec,
    active_connections: IntGaugeVec,
    connection_uptime: GaugeVec,
    circuit_breaker_state: IntGaugeVec,
    message_latency: HistogramVec,
    message_size: HistogramVec,
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector").finish_non_exhaustive()
    }
}

impl MetricsCollector {
    /// 创建新的指标收集器
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let messages_sent = IntCounterVec::new(
            Opts::new("hislink_messages_sent_total", "Total number of messages sent"),
            &BASE_LABELS,
        )?;

        let messages_received = IntCounterVec::new(
            Opts::new("hislink_messages_received_total", "Total number of messages received"),
            &BASE_LABELS,
        )?;

        let messages_failed = IntCounterVec::new(
            Opts::new("hislink_messages_failed_total", "Total number of failed messages"),
            &["connector_type", "organization", "protocol", "error_code"],
        )?;

        let connection_errors = IntCounterVec::new(
            Opts::new("hislink_connector_errors_total", "Total number of connector errors"),
            &["connector_type", "organization", "protocol", "error_code"],
        )?;

        let active_connections = IntGaugeVec::new(
            Opts::new("hislink_active_connections", "Number of active connector connections"),
            &BASE_LABELS,
        )?;

        let connection_uptime = GaugeVec::new(
            Opts::new("hislink_connection_uptime_seconds", "Connector connection uptime in seconds"),
            &BASE_LABELS,
        )?;

        let circuit_breaker_state = IntGaugeVec::new(
            Opts::new(
                "hislink_circuit_breaker_state",
                "Circuit breaker state (0=closed, 1=half-open, 2=open)",
            ),
            &["connector_type", "organization", "protocol", "circuit"],
        )?;

        let message_latency = HistogramVec::new(
            HistogramOpts::new("hislink_message_latency_seconds", "Message round-trip latency in seconds")
                .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &BASE_LABELS,
        )?;

        let message_size = HistogramVec::new(
            HistogramOpts::new("hislink_message_size_bytes", "Message size in bytes")
                .buckets(prometheus::exponential_buckets(128.0, 4.0, 8)?),
            &BASE_LABELS,
        )?;

        registry.register(Box::new(messages_sent.clone()))?;
        registry.register(Box::new(messages_received.clone()))?;
        registry.register(Box::new(messages_failed.clone()))?;
        registry.register(Box::new(connection_errors.clone()))?;
        registry.register(Box::new(active_connections.clone()))?;
        registry.register(Box::new(connection_uptime.clone()))?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;
        registry.register(Box::new(message_latency.clone()))?;
        registry.register(Box::new(message_size.clone()))?;

        Ok(Self {
            registry,
            messages_sent,
            messages_received,
            messages_failed,
            connection_errors,
            active_connections,
            connection_uptime,
            circuit_breaker_state,
            message_latency,
            message_size,
        })
    }

    pub fn record_message_sent(&self, labels: &MetricLabels) {
        self.messages_sent.with_label_values(&labels.values()).inc();
    }

    pub fn record_message_received(&self, labels: &MetricLabels) {
        self.messages_received.with_label_values(&labels.values()).inc();
    }

    pub fn record_message_failed(&self, labels: &MetricLabels, error_code: &str) {
        let [connector_type, organization, protocol] = labels.values();
        self.messages_failed
            .with_label_values(&[connector_type, organization, protocol, error_code])
            .inc();
    }

    pub fn record_connection_opened(&self, labels: &MetricLabels) {
        self.active_connections.with_label_values(&labels.values()).inc();
    }

    pub fn record_connection_closed(&self, labels: &MetricLabels) {
        self.active_connections.with_label_values(&labels.values()).dec();
    }

    pub fn record_error(&self, labels: &MetricLabels, error_code: &str) {
        debug!(
            connector_type = %labels.connector_type,
            organization = %labels.organization,
            error_code,
            "connector error recorded"
        );
        let [connector_type, organization, protocol] = labels.values();
        self.connection_errors
            .with_label_values(&[connector_type, organization, protocol, error_code])
            .inc();
    }

    pub fn update_uptime(&self, labels: &MetricLabels, uptime_secs: f64) {
        self.connection_uptime.with_label_values(&labels.values()).set(uptime_secs);
    }

    pub fn update_circuit_breaker_state(&self, labels: &MetricLabels, circuit: &str, state: &str) {
        let [connector_type, organization, protocol] = labels.values();
        self.circuit_breaker_state
            .with_label_values(&[connector_type, organization, protocol, circuit])
            .set(circuit_state_to_metric(state));
    }

    pub fn record_latency(&self, labels: &MetricLabels, latency_secs: f64) {
        self.message_latency.with_label_values(&labels.values()).observe(latency_secs);
    }

    pub fn record_message_size(&self, labels: &MetricLabels, size_bytes: usize) {
        self.message_size
            .with_label_values(&labels.values())
            .observe(size_bytes as f64);
    }

    /// 收集全部指标族
    pub fn snapshot(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// 导出 Prometheus 文本格式
    pub fn export(&self) -> Result<String> {
        use prometheus::Encoder;

        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;

        Ok(String::from_utf8(buffer)?)
    }
}
