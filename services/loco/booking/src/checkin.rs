//! CHECKIN request and reply.

use std::time::Duration;

use loco_session::{Connector, Endpoint};
use loco_wire::bson::{doc, Document};
use loco_wire::{get_int, get_nonempty_str};
use tracing::info;

use crate::device::DeviceInfo;
use crate::directory::plain_call;
use crate::error::CheckinError;

/// Endpoint lookup request method
pub const CHECKIN_METHOD: &str = "CHECKIN";

/// LOCO endpoint assigned by checkin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckinResult {
    /// Session host
    pub host: String,
    /// IPv6 session host, when announced
    pub host6: Option<String>,
    /// Session port
    pub port: u16,
    /// Seconds the assignment may be reused
    pub cache_expire: u32,
}

impl CheckinResult {
    /// Parse a CHECKIN reply body; `host` and `port` are required
    pub fn from_doc(doc: &Document) -> Result<Self, CheckinError> {
        let missing = |field| CheckinError::MissingField {
            method: CHECKIN_METHOD.to_string(),
            field,
        };
        let host = get_nonempty_str(doc, "host").ok_or_else(|| missing("host"))?;
        let port = get_int(doc, "port")
            .and_then(|p| u16::try_from(p).ok())
            .filter(|p| *p != 0)
            .ok_or_else(|| missing("port"))?;

        Ok(Self {
            host: host.to_string(),
            host6: get_nonempty_str(doc, "host6").map(str::to_string),
            port,
            cache_expire: get_int(doc, "cacheExpire")
                .and_then(|s| u32::try_from(s).ok())
                .unwrap_or(0),
        })
    }

    /// Endpoint for the main session
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }

    /// How long the result may be cached
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(u64::from(self.cache_expire))
    }
}

/// CHECKIN request body
pub fn checkin_request(device: &DeviceInfo) -> Document {
    let mut request = doc! {
        "userId": device.user_id,
        "os": device.os.as_str(),
        "ntype": device.network_type,
        "appVer": device.app_version.as_str(),
        "lang": device.language.as_str(),
    };
    if let Some(use_sub) = device.use_sub {
        request.insert("useSub", use_sub);
    }
    if let Some(mccmnc) = &device.mccmnc {
        request.insert("MCCMNC", mccmnc.as_str());
    }
    request
}

/// Check in against the directory host over plaintext TLS
pub async fn directory_checkin(
    connector: &dyn Connector,
    endpoint: &Endpoint,
    device: &DeviceInfo,
    timeout: Duration,
) -> Result<CheckinResult, CheckinError> {
    let reply = plain_call(
        connector,
        endpoint,
        CHECKIN_METHOD,
        &checkin_request(device),
        timeout,
    )
    .await?;
    let result = CheckinResult::from_doc(&reply)?;
    info!(
        "Directory checkin assigned {}:{} (cache {}s)",
        result.host, result.port, result.cache_expire
    );
    Ok(result)
}
