//! LOCO client.
//!
//! Ties the protocol crates together behind [`LocoClient`]:
//!
//! - `loco-wire`: packet framing, V2SL encryption, stream demultiplexing
//! - `loco-session`: encrypted sessions, keepalive, reconnect supervision
//! - `loco-booking`: endpoint discovery through GETCONF and checkin
//! - `loco-trailer`: resumable uploads
//!
//! ```rust,no_run
//! use loco::{logging, LocoClient, LocoConfig};
//! use loco::wire::bson::doc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! logging::init("info")?;
//! let config = LocoConfig::load_from_file("loco.yaml")?;
//! let (client, mut events) = LocoClient::new(&config)?;
//!
//! client.connect().await?;
//! let reply = client.call("PING", &doc! {}).await?;
//! println!("PING: {:?}", reply);
//!
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod logging;
pub mod msgid;

pub use client::{BootstrapFactory, LocoClient};
pub use config::{LocoConfig, ReconnectSettings, SessionSettings, TlsSettings};
pub use logging::LocoLogFormatter;
pub use msgid::MessageIdGenerator;

pub use loco_booking as booking;
pub use loco_session as session;
pub use loco_trailer as trailer;
pub use loco_wire as wire;
