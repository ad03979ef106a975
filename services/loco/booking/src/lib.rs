//! LOCO endpoint discovery.
//!
//! Before a LOCO session can start, the client has to learn which host and
//! port to use. This crate implements that lookup:
//!
//! 1. **GETCONF** over plaintext TLS to the booking host returns ticket hosts
//!    and per-network port lists
//! 2. **Ticket checkin** tries every `(host, port)` pair over an encrypted
//!    session until one answers CHECKIN with an endpoint
//! 3. **Directory checkin** over plaintext TLS is the fallback when the
//!    ticket path yields nothing
//!
//! [`Bootstrap`] ties the steps together and caches the result for the
//! server-provided `cacheExpire`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bootstrap;
pub mod checkin;
pub mod device;
pub mod directory;
pub mod error;
pub mod getconf;
pub mod ticket;

pub use bootstrap::{BookingConfig, Bootstrap};
pub use checkin::{checkin_request, directory_checkin, CheckinResult, CHECKIN_METHOD};
pub use device::{DeviceInfo, NETWORK_CELLULAR, NETWORK_WIFI};
pub use directory::plain_call;
pub use error::CheckinError;
pub use getconf::{getconf, getconf_request, GetConfResult, GETCONF_METHOD};
pub use ticket::{candidate_endpoints, candidate_hosts, candidate_ports, ticket_checkin, FALLBACK_PORT};
