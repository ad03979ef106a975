//! GETCONF: ticket hosts and ports from the booking host.

use std::time::Duration;

use loco_session::{Connector, Endpoint};
use loco_wire::bson::{doc, Document};
use loco_wire::{get_int_array, get_str_array};
use tracing::info;

use crate::device::DeviceInfo;
use crate::directory::plain_call;
use crate::error::CheckinError;

/// Directory configuration request method
pub const GETCONF_METHOD: &str = "GETCONF";

/// Candidate ticket endpoints announced by the booking host
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetConfResult {
    /// Ticket hosts (`ticket.lsl`)
    pub ticket_hosts: Vec<String>,
    /// IPv6 ticket hosts (`ticket.lsl6`)
    pub ticket_hosts6: Vec<String>,
    /// Ports to use on Wi-Fi (`wifi.ports`)
    pub wifi_ports: Vec<u16>,
    /// Ports to use on cellular (`3g.ports`)
    pub cell_ports: Vec<u16>,
}

fn ports(doc: &Document, section: &str) -> Vec<u16> {
    doc.get_document(section)
        .map(|s| {
            get_int_array(s, "ports")
                .into_iter()
                .filter_map(|p| u16::try_from(p).ok())
                .collect()
        })
        .unwrap_or_default()
}

impl GetConfResult {
    /// Parse a GETCONF reply body
    pub fn from_doc(doc: &Document) -> Self {
        let (ticket_hosts, ticket_hosts6) = match doc.get_document("ticket") {
            Ok(ticket) => (get_str_array(ticket, "lsl"), get_str_array(ticket, "lsl6")),
            Err(_) => (Vec::new(), Vec::new()),
        };
        Self {
            ticket_hosts,
            ticket_hosts6,
            wifi_ports: ports(doc, "wifi"),
            cell_ports: ports(doc, "3g"),
        }
    }
}

/// GETCONF request body
pub fn getconf_request(device: &DeviceInfo) -> Document {
    doc! {
        "MCCMNC": device.mccmnc.clone().unwrap_or_default(),
        "os": device.os.as_str(),
        "model": device.model.as_str(),
    }
}

/// Ask the booking host for ticket candidates
pub async fn getconf(
    connector: &dyn Connector,
    endpoint: &Endpoint,
    device: &DeviceInfo,
    timeout: Duration,
) -> Result<GetConfResult, CheckinError> {
    let reply = plain_call(
        connector,
        endpoint,
        GETCONF_METHOD,
        &getconf_request(device),
        timeout,
    )
    .await?;
    let result = GetConfResult::from_doc(&reply);
    info!(
        "GETCONF returned {} ticket hosts, {} wifi ports, {} cellular ports",
        result.ticket_hosts.len(),
        result.wifi_ports.len(),
        result.cell_ports.len()
    );
    Ok(result)
}
