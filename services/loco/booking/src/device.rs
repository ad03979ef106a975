//! Client identity sent with directory requests.

use serde::{Deserialize, Serialize};

/// Network type code for Wi-Fi
pub const NETWORK_WIFI: i32 = 0;

/// Network type code for cellular
pub const NETWORK_CELLULAR: i32 = 3;

/// Identity, device and network fields carried by GETCONF and CHECKIN
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceInfo {
    /// Account id
    pub user_id: i64,
    /// Client platform
    pub os: String,
    /// Device model, empty for desktop clients
    pub model: String,
    /// Network type (0 = Wi-Fi)
    pub network_type: i32,
    /// Client version
    pub app_version: String,
    /// Interface language
    pub language: String,
    /// Mobile country and network code
    pub mccmnc: Option<String>,
    /// Whether this is a sub-device login
    pub use_sub: Option<bool>,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            user_id: 0,
            os: "win32".to_string(),
            model: String::new(),
            network_type: NETWORK_WIFI,
            app_version: "3.2.8".to_string(),
            language: "ko".to_string(),
            mccmnc: Some("999".to_string()),
            use_sub: Some(true),
        }
    }
}

impl DeviceInfo {
    /// Whether the preferred network is Wi-Fi
    pub fn prefers_wifi(&self) -> bool {
        self.network_type == NETWORK_WIFI
    }
}
