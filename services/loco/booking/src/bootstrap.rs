//! Endpoint resolution with caching.
//!
//! [`Bootstrap`] runs GETCONF and ticket checkin first and falls back to a
//! plaintext directory checkin when no ticket pair answers. The winning
//! result is cached for its `cacheExpire` seconds.

use std::sync::Arc;
use std::time::Duration;

use loco_session::{Connector, Endpoint, SessionConfig};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::checkin::{directory_checkin, CheckinResult};
use crate::device::DeviceInfo;
use crate::error::CheckinError;
use crate::getconf::getconf;
use crate::ticket::ticket_checkin;

/// Booking host configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BookingConfig {
    /// Booking (directory) host
    pub host: String,
    /// Booking port
    pub port: u16,
    /// Timeout for each directory request (seconds)
    pub request_timeout_secs: u64,
    /// Whether to try ticket checkin before the directory
    pub use_ticket: bool,
}

impl Default for BookingConfig {
    fn default() -> Self {
        Self {
            host: "booking-loco.kakao.com".to_string(),
            port: 443,
            request_timeout_secs: 10,
            use_ticket: true,
        }
    }
}

impl BookingConfig {
    /// Directory endpoint
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }

    /// Directory request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone)]
struct CachedCheckin {
    result: CheckinResult,
    expires_at: Instant,
}

/// Resolves the endpoint for the main session
pub struct Bootstrap {
    config: BookingConfig,
    device: DeviceInfo,
    directory: Arc<dyn Connector>,
    tickets: Arc<dyn Connector>,
    session_config: SessionConfig,
    cache: RwLock<Option<CachedCheckin>>,
}

impl Bootstrap {
    /// Create a resolver.
    ///
    /// `directory` reaches the booking host (TLS); `tickets` opens the
    /// plain TCP streams ticket sessions run over.
    pub fn new(
        config: BookingConfig,
        device: DeviceInfo,
        directory: Arc<dyn Connector>,
        tickets: Arc<dyn Connector>,
        session_config: SessionConfig,
    ) -> Self {
        Self {
            config,
            device,
            directory,
            tickets,
            session_config,
            cache: RwLock::new(None),
        }
    }

    /// Identity sent with every request
    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    /// Cached endpoint if still fresh, otherwise a new lookup
    pub async fn resolve(&self) -> Result<CheckinResult, CheckinError> {
        if let Some(cached) = self.cache.read().await.as_ref() {
            if Instant::now() < cached.expires_at {
                debug!(
                    "Using cached checkin {}:{}",
                    cached.result.host, cached.result.port
                );
                return Ok(cached.result.clone());
            }
        }
        self.refresh().await
    }

    /// Look the endpoint up again, bypassing the cache
    pub async fn refresh(&self) -> Result<CheckinResult, CheckinError> {
        let result = match self.try_ticket().await {
            Some(result) => result,
            None => {
                info!("Falling back to directory checkin at {}", self.config.endpoint());
                directory_checkin(
                    self.directory.as_ref(),
                    &self.config.endpoint(),
                    &self.device,
                    self.config.request_timeout(),
                )
                .await?
            }
        };

        let mut cache = self.cache.write().await;
        *cache = if result.cache_expire > 0 {
            Some(CachedCheckin {
                result: result.clone(),
                expires_at: Instant::now() + result.cache_ttl(),
            })
        } else {
            None
        };
        Ok(result)
    }

    /// Forget the cached endpoint
    pub async fn invalidate(&self) {
        self.cache.write().await.take();
    }

    async fn try_ticket(&self) -> Option<CheckinResult> {
        if !self.config.use_ticket {
            return None;
        }

        let conf = match getconf(
            self.directory.as_ref(),
            &self.config.endpoint(),
            &self.device,
            self.config.request_timeout(),
        )
        .await
        {
            Ok(conf) => conf,
            Err(e) => {
                warn!("GETCONF failed: {}", e);
                return None;
            }
        };

        match ticket_checkin(
            self.tickets.as_ref(),
            &conf,
            &self.session_config,
            &self.device,
        )
        .await
        {
            Ok(result) => Some(result),
            Err(e) => {
                warn!("Ticket checkin failed: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loco_session::testing::{test_config, DuplexConnector, MockServer};
    use loco_session::{recv_packet, send_packet};
    use loco_wire::bson::{doc, Document};
    use loco_wire::{encode_doc, Packet, PacketDecoder};
    use std::sync::Mutex;

    /// Plaintext booking host answering GETCONF and CHECKIN; records methods
    fn booking_host(
        getconf_reply: Document,
        checkin_reply: Document,
        methods: Arc<Mutex<Vec<String>>>,
    ) -> DuplexConnector {
        DuplexConnector::new(move |_, mut stream| {
            let getconf_reply = getconf_reply.clone();
            let checkin_reply = checkin_reply.clone();
            let methods = methods.clone();
            tokio::spawn(async move {
                let mut decoder = PacketDecoder::new();
                let request = recv_packet(&mut stream, &mut decoder).await.unwrap();
                methods.lock().unwrap().push(request.method.clone());
                let body = match request.method.as_str() {
                    "GETCONF" => getconf_reply,
                    _ => checkin_reply,
                };
                let reply =
                    Packet::new(request.packet_id, request.method, encode_doc(&body).unwrap())
                        .unwrap();
                send_packet(&mut stream, &reply).await.unwrap();
            });
            Ok(())
        })
    }

    fn ticket_host(port: u16) -> DuplexConnector {
        let port = i32::from(port);
        DuplexConnector::new(move |_, stream| {
            tokio::spawn(async move {
                let mut server = MockServer::accept(stream).await.unwrap();
                let request = server.recv_packet().await.unwrap();
                let reply =
                    doc! { "status": 0, "host": "ticket.example", "port": port, "cacheExpire": 60 };
                server.reply(&request, reply).await.unwrap();
                while server.recv_packet().await.is_ok() {}
            });
            Ok(())
        })
    }

    fn refusing() -> DuplexConnector {
        DuplexConnector::new(|endpoint, _| {
            Err(loco_session::SessionError::Connect {
                endpoint: endpoint.to_string(),
                reason: "refused".into(),
            })
        })
    }

    fn getconf_doc() -> Document {
        doc! {
            "status": 0,
            "ticket": { "lsl": ["t1", "t2"] },
            "wifi": { "ports": [5223] },
            "3g": { "ports": [5228] },
        }
    }

    fn checkin_doc() -> Document {
        doc! { "status": 0, "host": "directory.example", "port": 5223, "cacheExpire": 3600 }
    }

    fn bootstrap(directory: DuplexConnector, tickets: DuplexConnector) -> Bootstrap {
        Bootstrap::new(
            BookingConfig::default(),
            DeviceInfo::default(),
            Arc::new(directory),
            Arc::new(tickets),
            test_config(),
        )
    }

    #[tokio::test]
    async fn test_ticket_path_preferred() {
        let methods = Arc::new(Mutex::new(Vec::new()));
        let directory = booking_host(getconf_doc(), checkin_doc(), methods.clone());
        let bootstrap = bootstrap(directory, ticket_host(9282));

        let result = bootstrap.resolve().await.unwrap();
        assert_eq!(result.endpoint(), Endpoint::new("ticket.example", 9282));
        assert_eq!(*methods.lock().unwrap(), vec!["GETCONF"]);
    }

    #[tokio::test]
    async fn test_fallback_after_ticket_exhaustion() {
        let methods = Arc::new(Mutex::new(Vec::new()));
        let directory = booking_host(getconf_doc(), checkin_doc(), methods.clone());
        let tickets = refusing();
        let bootstrap = bootstrap(directory, tickets.clone());

        let result = bootstrap.resolve().await.unwrap();
        assert_eq!(result.endpoint(), Endpoint::new("directory.example", 5223));
        assert_eq!(*methods.lock().unwrap(), vec!["GETCONF", "CHECKIN"]);
        assert_eq!(
            tickets.attempts(),
            vec![
                Endpoint::new("t1", 5223),
                Endpoint::new("t1", 5228),
                Endpoint::new("t2", 5223),
                Endpoint::new("t2", 5228),
            ]
        );
    }

    #[tokio::test]
    async fn test_fallback_after_getconf_failure() {
        let methods = Arc::new(Mutex::new(Vec::new()));
        let directory = booking_host(doc! { "status": -1 }, checkin_doc(), methods.clone());
        let tickets = refusing();
        let bootstrap = bootstrap(directory, tickets.clone());

        let result = bootstrap.resolve().await.unwrap();
        assert_eq!(result.host, "directory.example");
        assert!(tickets.attempts().is_empty());
    }

    #[tokio::test]
    async fn test_total_failure_surfaces() {
        let bootstrap = bootstrap(refusing(), refusing());
        let err = bootstrap.resolve().await.unwrap_err();
        assert!(matches!(err, CheckinError::Session(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_until_expiry() {
        let methods = Arc::new(Mutex::new(Vec::new()));
        let directory = booking_host(getconf_doc(), checkin_doc(), methods.clone());
        let bootstrap = bootstrap(directory.clone(), refusing());

        bootstrap.resolve().await.unwrap();
        bootstrap.resolve().await.unwrap();
        assert_eq!(directory.attempts().len(), 2);

        tokio::time::sleep(Duration::from_secs(3601)).await;
        bootstrap.resolve().await.unwrap();
        assert_eq!(directory.attempts().len(), 4);

        bootstrap.invalidate().await;
        bootstrap.resolve().await.unwrap();
        assert_eq!(directory.attempts().len(), 6);
    }
}
