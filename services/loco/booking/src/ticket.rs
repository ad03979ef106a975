//! Ticket checkin over encrypted sessions.
//!
//! GETCONF announces ticket hosts and per-network port lists. Each
//! `(host, port)` pair is tried in host-major order with a full V2SL session
//! and a CHECKIN request; the first reply carrying both `host` and `port`
//! wins. Every ticket session is closed before moving on.

use loco_session::{Connector, Endpoint, Session, SessionConfig};
use tracing::{debug, info, warn};

use crate::checkin::{checkin_request, CheckinResult, CHECKIN_METHOD};
use crate::device::DeviceInfo;
use crate::error::CheckinError;
use crate::getconf::GetConfResult;

/// Port tried when hosts are known but no ports were announced
pub const FALLBACK_PORT: u16 = 443;

fn push_unique<T: PartialEq + Clone>(out: &mut Vec<T>, items: &[T]) {
    for item in items {
        if !out.contains(item) {
            out.push(item.clone());
        }
    }
}

/// Ticket hosts without duplicates, in announced order
pub fn candidate_hosts(conf: &GetConfResult) -> Vec<String> {
    let mut hosts = Vec::new();
    push_unique(&mut hosts, &conf.ticket_hosts);
    hosts
}

/// Ports without duplicates: the preferred network's first, then the
/// other's, then [`FALLBACK_PORT`] if hosts exist but no ports do
pub fn candidate_ports(conf: &GetConfResult, prefer_wifi: bool) -> Vec<u16> {
    let (first, second) = if prefer_wifi {
        (&conf.wifi_ports, &conf.cell_ports)
    } else {
        (&conf.cell_ports, &conf.wifi_ports)
    };

    let mut ports = Vec::new();
    push_unique(&mut ports, first);
    push_unique(&mut ports, second);
    if ports.is_empty() && !conf.ticket_hosts.is_empty() {
        ports.push(FALLBACK_PORT);
    }
    ports
}

/// Every `(host, port)` pair in trial order
pub fn candidate_endpoints(hosts: &[String], ports: &[u16]) -> Vec<Endpoint> {
    hosts
        .iter()
        .flat_map(|host| ports.iter().map(move |port| Endpoint::new(host.clone(), *port)))
        .collect()
}

/// Check in against one ticket endpoint
pub async fn checkin_at(
    connector: &dyn Connector,
    endpoint: &Endpoint,
    config: &SessionConfig,
    device: &DeviceInfo,
) -> Result<CheckinResult, CheckinError> {
    let (session, _events) = Session::connect(endpoint, config.clone(), connector).await?;
    let reply = session.call(CHECKIN_METHOD, &checkin_request(device)).await;
    session.close().await;
    CheckinResult::from_doc(&reply?)
}

/// Try every candidate pair until one yields an endpoint
pub async fn ticket_checkin(
    connector: &dyn Connector,
    conf: &GetConfResult,
    config: &SessionConfig,
    device: &DeviceInfo,
) -> Result<CheckinResult, CheckinError> {
    let hosts = candidate_hosts(conf);
    if hosts.is_empty() {
        return Err(CheckinError::NoCandidates);
    }
    let ports = candidate_ports(conf, device.prefers_wifi());
    let candidates = candidate_endpoints(&hosts, &ports);
    debug!("Ticket checkin over {} candidates", candidates.len());

    for (attempt, endpoint) in candidates.iter().enumerate() {
        match checkin_at(connector, endpoint, config, device).await {
            Ok(result) => {
                info!(
                    "Ticket checkin via {} assigned {}:{}",
                    endpoint, result.host, result.port
                );
                return Ok(result);
            }
            Err(e) => {
                warn!(
                    "Ticket checkin attempt {} via {} failed: {}",
                    attempt + 1,
                    endpoint,
                    e
                );
            }
        }
    }

    Err(CheckinError::Exhausted {
        attempts: candidates.len(),
    })
}
