pub const DEVICE_NAME: &str = "Q150DewController";

pub const SERVICE_UUID: &str = "ab120000-0000-0000-0000-000000000001";
pub const STATUS_UUID: &str = "ab120000-0000-0000-0000-000000000002";
pub const CONFIG_UUID: &str = "ab120000-0000-0000-0000-00000000C003";
pub const INFO_UUID: &str = "ab120000-0000-0000-0000-000000000004";
pub const CMD_UUID: &str = "ab120000-0000-0000-0000-000000000005";

// Broker topics standing in for the characteristics.
pub const TOPIC_STATUS: &str = "q150dew/status";
pub const TOPIC_CONFIG: &str = "q150dew/config";
pub const TOPIC_CONFIG_SET: &str = "q150dew/config/set";
pub const TOPIC_INFO: &str = "q150dew/info";
pub const TOPIC_CMD: &str = "q150dew/cmd";
/// Retained, read-only copy of the operator log.
pub const TOPIC_LOG: &str = "q150dew/log";
/// Peer presence, `connected` or `disconnected`.
pub const TOPIC_PEER: &str = "q150dew/peer";
pub const TOPIC_ADVERT: &str = "q150dew/advert";

pub const PEER_CONNECTED: &str = "connected";
pub const PEER_DISCONNECTED: &str = "disconnected";

pub fn advertisement() -> String {
    format!(r#"{{"name":"{DEVICE_NAME}","service":"{SERVICE_UUID}"}}"#)
}
