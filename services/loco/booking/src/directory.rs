//! Plaintext request/response against the directory host.
//!
//! The booking connection is TLS-protected, so packets travel without the
//! V2SL layer: one request, one reply, then the connection is dropped.

use std::time::Duration;

use loco_session::{plain_exchange, Connector, Endpoint, SessionError};
use loco_wire::bson::Document;
use loco_wire::{decode_doc, encode_doc, get_status, Packet};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::CheckinError;

const DIRECTORY_PACKET_ID: i32 = 1;

/// Send `body` as `method` over a fresh directory connection and return the
/// reply document, failing on a non-zero status
pub async fn plain_call(
    connector: &dyn Connector,
    endpoint: &Endpoint,
    method: &str,
    body: &Document,
    timeout: Duration,
) -> Result<Document, CheckinError> {
    let bytes = encode_doc(body).map_err(|e| SessionError::body(method, e))?;
    let packet = Packet::new(DIRECTORY_PACKET_ID, method, bytes).map_err(SessionError::Request)?;

    debug!("Directory {} request to {}", method, endpoint);
    let mut stream = connector.connect(endpoint).await?;
    let reply = match tokio::time::timeout(timeout, plain_exchange(&mut stream, &packet)).await {
        Ok(reply) => reply?,
        Err(_) => {
            return Err(SessionError::Timeout {
                method: method.to_string(),
                packet_id: DIRECTORY_PACKET_ID,
            }
            .into())
        }
    };
    stream.shutdown().await.ok();

    let doc = decode_doc(&reply.body).map_err(|e| SessionError::body(method, e))?;
    let status = get_status(&doc);
    if status != 0 {
        return Err(CheckinError::Rejected {
            method: method.to_string(),
            status,
        });
    }
    Ok(doc)
}
