//! LOCO sessions over TCP/TLS: V2SL handshake, request correlation, pushes,
//! keepalive and reconnection.
//!
//! This crate turns the byte-level codecs of `loco-wire` into a usable
//! connection. One driver task per socket owns all connection state, so any
//! number of requests may be outstanding at once without locking.
//!
//! ## Features
//!
//! - **Transport**: plain TCP for LOCO and trailer endpoints, TLS for booking
//! - **Handshake**: RSA-wrapped AES key sent once, Ready on the first block
//! - **Correlation**: requests matched to responses by packet id, with
//!   per-request timeouts
//! - **Pushes**: unmatched packets delivered to per-method subscribers
//! - **Keepalive**: periodic PING with a consecutive-failure threshold
//! - **Auto-reconnect**: exponential backoff around a session factory
//!
//! ## Example
//!
//! ```rust,no_run
//! use loco_session::{Endpoint, Session, SessionConfig, SessionEvent, TcpConnector};
//! use loco_wire::bson::doc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), loco_session::SessionError> {
//! let connector = TcpConnector::new(Duration::from_secs(10));
//! let endpoint = Endpoint::new("loco.example.com", 5223);
//! let (session, mut events) =
//!     Session::connect(&endpoint, SessionConfig::default(), &connector).await?;
//!
//! let mut messages = session.subscribe("MSG");
//! let reply = session.call("PING", &doc! {}).await?;
//! println!("PING answered: {:?}", reply);
//!
//! tokio::spawn(async move {
//!     while let Some(push) = messages.recv().await {
//!         println!("message push {}", push.packet_id);
//!     }
//! });
//!
//! while let Some(event) = events.recv().await {
//!     if let SessionEvent::Disconnected { requested, reason } = event {
//!         println!("closed (requested: {}, reason: {:?})", requested, reason);
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod handshake;
pub mod keepalive;
pub mod push;
pub mod reconnect;
pub mod session;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export main types
pub use error::SessionError;
pub use handshake::{plain_exchange, recv_packet, send_handshake, send_packet};
pub use keepalive::{KeepaliveTracker, PING_METHOD};
pub use push::{PushReceiver, PushRegistry};
pub use reconnect::{
    BackoffPolicy, ReconnectEvent, ReconnectEvents, ReconnectState, Reconnector, SessionFactory,
};
pub use session::{
    Session, SessionConfig, SessionEvent, SessionEvents, SessionHandle, SessionState,
    SessionStats, MAX_BLOCK_PLAINTEXT,
};
pub use transport::{
    connect_tcp, make_client_config, Connector, Endpoint, IoStream, TcpConnector, TlsConnector,
};
