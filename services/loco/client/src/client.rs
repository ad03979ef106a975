//! Client facade.
//!
//! [`LocoClient`] resolves the LOCO endpoint through [`Bootstrap`], keeps a
//! session alive through a [`Reconnector`] and starts uploads on the
//! installed session.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use loco_booking::{Bootstrap, CheckinError, CheckinResult};
use loco_session::{
    make_client_config, Connector, ReconnectEvents, Reconnector, Session, SessionConfig,
    SessionError, SessionEvents, SessionFactory, SessionHandle, TcpConnector, TlsConnector,
};
use loco_trailer::{UploadError, UploadOutcome, UploadPhase, UploadRequest, UploadState, Uploader};
use loco_wire::bson::Document;

use crate::config::LocoConfig;
use crate::msgid::MessageIdGenerator;

/// Opens sessions on the endpoint chosen by checkin
pub struct BootstrapFactory {
    bootstrap: Arc<Bootstrap>,
    connector: Arc<dyn Connector>,
    config: SessionConfig,
}

impl BootstrapFactory {
    /// Create a factory connecting through `connector`
    pub fn new(
        bootstrap: Arc<Bootstrap>,
        connector: Arc<dyn Connector>,
        config: SessionConfig,
    ) -> Self {
        Self {
            bootstrap,
            connector,
            config,
        }
    }
}

fn checkin_failure(err: CheckinError) -> SessionError {
    match err {
        CheckinError::Session(e) => e,
        other => SessionError::Connect {
            endpoint: "checkin".to_string(),
            reason: other.to_string(),
        },
    }
}

#[async_trait]
impl SessionFactory for BootstrapFactory {
    async fn open(&self) -> Result<(SessionHandle, SessionEvents), SessionError> {
        let checkin = self.bootstrap.resolve().await.map_err(checkin_failure)?;
        let endpoint = checkin.endpoint();
        match Session::connect(&endpoint, self.config.clone(), self.connector.as_ref()).await {
            Ok(opened) => {
                crate::component_info!("client", "Session established with {}", endpoint);
                Ok(opened)
            }
            Err(e) => {
                // The assignment may be stale; look it up again next time
                crate::component_warn!("client", "Connect to {} failed: {}", endpoint, e);
                self.bootstrap.invalidate().await;
                Err(e)
            }
        }
    }
}

/// LOCO client
pub struct LocoClient {
    bootstrap: Arc<Bootstrap>,
    reconnector: Reconnector,
    uploader: Uploader,
    message_ids: Mutex<MessageIdGenerator>,
}

impl LocoClient {
    /// Build a client with TLS for the booking host and plain TCP for LOCO.
    ///
    /// Must be called inside a Tokio runtime. Nothing connects until
    /// [`connect`](Self::connect).
    pub fn new(config: &LocoConfig) -> anyhow::Result<(Self, ReconnectEvents)> {
        let session_config = config.session_config();
        let ca_pem = config.read_ca_pem()?;
        let tls = make_client_config(ca_pem.as_deref())?;
        let directory: Arc<dyn Connector> =
            Arc::new(TlsConnector::new(tls, session_config.connect_timeout));
        let loco: Arc<dyn Connector> = Arc::new(TcpConnector::new(session_config.connect_timeout));
        Ok(Self::with_connectors(config, directory, loco, session_config))
    }

    /// Build a client over explicit connectors
    pub fn with_connectors(
        config: &LocoConfig,
        directory: Arc<dyn Connector>,
        loco: Arc<dyn Connector>,
        session_config: SessionConfig,
    ) -> (Self, ReconnectEvents) {
        let bootstrap = Arc::new(Bootstrap::new(
            config.booking.clone(),
            config.device.clone(),
            directory,
            loco.clone(),
            session_config.clone(),
        ));
        let factory = BootstrapFactory::new(bootstrap.clone(), loco.clone(), session_config.clone());
        let (reconnector, events) = Reconnector::spawn(factory, config.backoff_policy());
        let uploader = Uploader::new(
            config.upload.clone(),
            session_config,
            loco,
            config.device.clone(),
        );
        let message_ids = match &config.device_uuid {
            Some(uuid) => MessageIdGenerator::from_device(uuid),
            None => MessageIdGenerator::random(),
        };

        (
            Self {
                bootstrap,
                reconnector,
                uploader,
                message_ids: Mutex::new(message_ids),
            },
            events,
        )
    }

    /// Connect and keep reconnecting until [`disconnect`](Self::disconnect)
    pub async fn connect(&self) -> Result<SessionHandle, SessionError> {
        self.reconnector.connect().await
    }

    /// Close the session and stop reconnecting
    pub async fn disconnect(&self) {
        self.reconnector.disconnect().await;
    }

    /// Installed session, if connected
    pub fn session(&self) -> Option<SessionHandle> {
        self.reconnector.current()
    }

    /// Wait for a session, e.g. after a reconnect
    pub async fn wait_connected(&self) -> Result<SessionHandle, SessionError> {
        self.reconnector.wait_connected().await
    }

    /// Request on the installed session; fails if none is installed
    pub async fn call(&self, method: &str, body: &Document) -> Result<Document, SessionError> {
        let session = self.session().ok_or(SessionError::Disconnected)?;
        session.call(method, body).await
    }

    /// Current endpoint assignment
    pub async fn checkin(&self) -> Result<CheckinResult, CheckinError> {
        self.bootstrap.resolve().await
    }

    /// Upload over the installed session and a new trailer session
    pub async fn upload(&self, request: &UploadRequest) -> Result<UploadOutcome, UploadError> {
        let session = self.session().ok_or(UploadError::Session {
            phase: UploadPhase::Ship,
            source: SessionError::Disconnected,
        })?;
        self.uploader.upload(&session, request).await
    }

    /// Retry POST and streaming from an earlier upload state
    pub async fn resume_upload(
        &self,
        state: &mut UploadState,
        request: &UploadRequest,
    ) -> Result<UploadOutcome, UploadError> {
        self.uploader.resume(state, request).await
    }

    /// Next client message id
    pub fn next_message_id(&self) -> i64 {
        self.message_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loco_session::testing::{test_config, DuplexConnector, MockServer};
    use loco_session::{recv_packet, send_packet, Endpoint, ReconnectEvent};
    use loco_wire::bson::doc;
    use loco_wire::{encode_doc, Packet, PacketDecoder};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Booking host rejecting GETCONF and assigning `loco.test:5223`
    fn directory() -> DuplexConnector {
        DuplexConnector::new(|_, mut stream| {
            tokio::spawn(async move {
                let mut decoder = PacketDecoder::new();
                let request = recv_packet(&mut stream, &mut decoder).await.unwrap();
                let body = match request.method.as_str() {
                    "GETCONF" => doc! { "status": -1 },
                    _ => doc! { "status": 0, "host": "loco.test", "port": 5223, "cacheExpire": 3600 },
                };
                let reply =
                    Packet::new(request.packet_id, request.method, encode_doc(&body).unwrap())
                        .unwrap();
                send_packet(&mut stream, &reply).await.unwrap();
            });
            Ok(())
        })
    }

    /// LOCO server answering every request; the first connection is
    /// dropped after one reply when `drop_first` is set
    fn loco(drop_first: bool, connections: Arc<AtomicUsize>) -> DuplexConnector {
        DuplexConnector::new(move |_, stream| {
            let index = connections.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut server = MockServer::accept(stream).await.unwrap();
                while let Ok(request) = server.recv_packet().await {
                    server.reply(&request, doc! { "status": 0 }).await.unwrap();
                    if drop_first && index == 0 {
                        return;
                    }
                }
            });
            Ok(())
        })
    }

    fn config() -> LocoConfig {
        let mut config = LocoConfig::default();
        config.reconnect.base_delay_ms = 10;
        config.reconnect.max_delay_ms = 100;
        config.device_uuid = Some("test-device".into());
        config
    }

    fn client(directory: &DuplexConnector, loco: &DuplexConnector) -> (LocoClient, ReconnectEvents) {
        LocoClient::with_connectors(
            &config(),
            Arc::new(directory.clone()),
            Arc::new(loco.clone()),
            test_config(),
        )
    }

    #[tokio::test]
    async fn test_connect_and_call() {
        let directory = directory();
        let loco = loco(false, Arc::new(AtomicUsize::new(0)));
        let (client, _events) = client(&directory, &loco);

        let session = client.connect().await.unwrap();
        assert_eq!(session.peer(), "loco.test:5223");
        let reply = client.call("PING", &doc! {}).await.unwrap();
        assert_eq!(reply.get_i32("status").unwrap(), 0);
        assert_eq!(loco.attempts(), vec![Endpoint::new("loco.test", 5223)]);

        client.disconnect().await;
        assert!(client.session().is_none());
        assert!(matches!(
            client.call("PING", &doc! {}).await,
            Err(SessionError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_reconnect_reuses_cached_checkin() {
        let directory = directory();
        let connections = Arc::new(AtomicUsize::new(0));
        let loco = loco(true, connections.clone());
        let (client, mut events) = client(&directory, &loco);

        client.connect().await.unwrap();
        // The first server drops the connection after this reply
        client.call("PING", &doc! {}).await.unwrap();

        let mut scheduled = false;
        let reconnected = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = events.recv().await {
                match event {
                    ReconnectEvent::Scheduled { .. } => scheduled = true,
                    ReconnectEvent::Connected(_) if scheduled => return true,
                    _ => {}
                }
            }
            false
        })
        .await
        .unwrap();
        assert!(reconnected);
        assert_eq!(connections.load(Ordering::SeqCst), 2);
        // GETCONF and CHECKIN once; the reconnect used the cache
        assert_eq!(directory.attempts().len(), 2);

        client.call("PING", &doc! {}).await.unwrap();
        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_connect_failure_drops_cached_checkin() {
        let directory = directory();
        let refusing = DuplexConnector::new(|endpoint, _| {
            Err(SessionError::Connect {
                endpoint: endpoint.to_string(),
                reason: "refused".into(),
            })
        });
        let (client, _events) = client(&directory, &refusing);

        assert!(client.connect().await.is_err());
        assert_eq!(directory.attempts().len(), 2);
        assert!(client.connect().await.is_err());
        assert_eq!(directory.attempts().len(), 4);
    }

    #[tokio::test]
    async fn test_upload_needs_session() {
        let directory = directory();
        let loco = loco(false, Arc::new(AtomicUsize::new(0)));
        let (client, _events) = client(&directory, &loco);

        let err = client
            .upload(&UploadRequest::new(1, 2, "a.bin", vec![0u8; 4]))
            .await
            .unwrap_err();
        assert_eq!(err.phase(), Some(UploadPhase::Ship));
    }

    #[tokio::test]
    async fn test_message_ids_follow_device_seed() {
        let directory = directory();
        let loco = loco(false, Arc::new(AtomicUsize::new(0)));
        let (a, _a_events) = client(&directory, &loco);
        let (b, _b_events) = client(&directory, &loco);

        let first = a.next_message_id();
        assert_eq!(first, b.next_message_id());
        assert_eq!(a.next_message_id(), first + 1);
    }
}
