//! 协议编解码接口
//!
//! 完整的 HL7 语法、FHIR 转换等由外部协作方提供，这里只定义连接器依赖的接口，
//! 以及 MLLP 帧处理和一个只读取 MSH/MSA 关键字段的最小 HL7 v2 编解码器。

use chrono::Utc;
use hislink_core::{ConnectorError, Result, StructuredMessage};
use serde_json::json;

/// 原始字节与结构化消息之间的编解码
pub trait MessageCodec: Send + Sync {
    /// 解析失败必须返回 `ConnectorError::Protocol`
    fn decode(&self, bytes: &[u8]) -> Result<StructuredMessage>;

    fn encode(&self, message: &StructuredMessage) -> Result<Vec<u8>>;
}

/// 结构化消息到互操作资源（如 FHIR Bundle）的转换
///
/// 转换失败意味着负载本身有问题，不可重试。
pub trait MessageTransformer: Send + Sync {
    fn transform(&self, message: &StructuredMessage) -> Result<serde_json::Value>;
}

/// MLLP 帧
pub mod mllp {
    use hislink_core::{ConnectorError, Result};

    pub const START_BLOCK: u8 = 0x0b;
    pub const END_BLOCK: u8 = 0x1c;
    pub const CARRIAGE_RETURN: u8 = 0x0d;

    /// 用起止字节包装消息
    pub fn frame(payload: &[u8]) -> Vec<u8> {
        let mut framed = Vec::with_capacity(payload.len() + 3);
        framed.push(START_BLOCK);
        framed.extend_from_slice(payload);
        framed.push(END_BLOCK);
        framed.push(CARRIAGE_RETURN);
        framed
    }

    /// 缓冲区中第一帧结束位置（不含），帧未完整时返回 None
    pub fn frame_end(buffer: &[u8]) -> Option<usize> {
        buffer
            .windows(2)
            .position(|w| w[0] == END_BLOCK && w[1] == CARRIAGE_RETURN)
            .map(|pos| pos + 2)
    }

    /// 去掉起止字节
    pub fn unframe(frame: &[u8]) -> Result<&[u8]> {
        let start = frame
            .iter()
            .position(|b| *b == START_BLOCK)
            .ok_or_else(|| ConnectorError::Protocol("MLLP start block missing".to_string()))?;
        let end = frame_end(frame)
            .ok_or_else(|| ConnectorError::Protocol("MLLP end block missing".to_string()))?;
        if end < start + 3 {
            return Err(ConnectorError::Protocol("MLLP frame out of order".to_string()));
        }
        Ok(&frame[start + 1..end - 2])
    }
}

/// 最小 HL7 v2 管道符编解码器
///
/// 结构化消息的 `payload.raw` 保存原始文本；解码时额外提取段名和 MSA 应答码。
#[derive(Debug, Clone, Default)]
pub struct Hl7PipeCodec;

impl Hl7PipeCodec {
    pub fn new() -> Self {
        Self
    }

    fn segments(text: &str) -> Vec<&str> {
        text.split(|c: char| c == '\r' || c == '\n')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// 生成 ACK/NAK 文本
    pub fn build_ack(original_control_id: &str, ack_code: &str, error_text: Option<&str>) -> String {
        let error_text = error_text.unwrap_or("").replace('|', "\\F\\");
        format!(
            "MSH|^~\\&|HISLINK|HISLINK|||{timestamp}||ACK|{control_id}|P|2.5\rMSA|{ack_code}|{original}|{error_text}",
            timestamp = Utc::now().format("%Y%m%d%H%M%S"),
            control_id = hislink_core::utils::generate_control_id(),
            ack_code = ack_code,
            original = original_control_id,
            error_text = error_text,
        )
    }
}

impl MessageCodec for Hl7PipeCodec {
    fn decode(&self, bytes: &[u8]) -> Result<StructuredMessage> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| ConnectorError::Protocol(format!("HL7 message is not valid UTF-8: {}", e)))?;

        let segments = Self::segments(text);
        let msh = segments
            .first()
            .filter(|s| s.starts_with("MSH") && s.len() > 3)
            .ok_or_else(|| ConnectorError::Protocol("Message must start with MSH segment".to_string()))?;

        let separator = msh[3..].chars().next().unwrap_or('|');
        let fields: Vec<&str> = msh.split(separator).collect();

        // fields[n - 1] 对应 MSH-n
        let message_type = fields
            .get(8)
            .filter(|f| !f.is_empty())
            .map(|f| f.split('^').take(2).collect::<Vec<_>>().join("^"))
            .ok_or_else(|| ConnectorError::Protocol("Missing message type (MSH-9)".to_string()))?;
        let control_id = fields
            .get(9)
            .filter(|f| !f.is_empty())
            .ok_or_else(|| ConnectorError::Protocol("Missing control id (MSH-10)".to_string()))?;

        let ack_code = segments
            .iter()
            .find(|s| s.starts_with("MSA"))
            .and_then(|msa| msa.split(separator).nth(1))
            .map(str::to_string);
        let segment_names: Vec<&str> = segments.iter().map(|s| s.get(..3).unwrap_or(*s)).collect();

        let mut payload = json!({
            "raw": segments.join("\r"),
            "segments": segment_names,
        });
        if let Some(ack_code) = ack_code {
            payload["ack_code"] = json!(ack_code);
        }

        Ok(StructuredMessage {
            message_type,
            control_id: control_id.to_string(),
            payload,
        })
    }

    fn encode(&self, message: &StructuredMessage) -> Result<Vec<u8>> {
        let raw = message
            .payload
            .get("raw")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ConnectorError::Validation("HL7 payload requires a 'raw' text field".to_string()))?;

        if !raw.starts_with("MSH") {
            return Err(ConnectorError::Validation("HL7 payload must start with MSH".to_string()));
        }
        Ok(Self::segments(raw).join("\r").into_bytes())
    }
}

/// 应答码是否为拒绝（AE/AR/CE/CR）
pub fn is_negative_ack(message: &StructuredMessage) -> bool {
    matches!(
        message.payload.get("ack_code").and_then(|v| v.as_str()),
        Some("AE") | Some("AR") | Some("CE") | Some("CR")
    )
}
