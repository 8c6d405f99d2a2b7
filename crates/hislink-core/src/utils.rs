//! 通用工具函数

use crate::models::ConnectorType;
use uuid::Uuid;

/// HL7 MSH-10 允许的最大长度
const MAX_CONTROL_ID_LEN: usize = 20;

/// 注册表键的分隔符，身份字段中不允许出现
pub const KEY_SEPARATOR: char = ':';

/// 生成注册表键
pub fn connector_key(org_id: &str, connector_type: &ConnectorType, name: &str) -> String {
    format!(
        "{org_id}{KEY_SEPARATOR}{}{KEY_SEPARATOR}{name}",
        connector_type.as_str()
    )
}

/// 生成消息控制ID
pub fn generate_control_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(MAX_CONTROL_ID_LEN);
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_key() {
        assert_eq!(connector_key("hosp-1", &ConnectorType::Hl7, "lab"), "hosp-1:hl7:lab");
        assert_eq!(
            connector_key("h1", &ConnectorType::Custom("soap".into()), "legacy"),
            "h1:soap:legacy"
        );
    }

    #[test]
    fn test_generate_control_id() {
        let id = generate_control_id();
        assert_eq!(id.len(), MAX_CONTROL_ID_LEN);
        assert_ne!(id, generate_control_id());
    }
}
