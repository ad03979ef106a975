//! Four-phase upload.
//!
//! 1. SHIP on the main session announces the payload and yields a token
//! 2. GETTRAILER resolves the trailer endpoint when SHIP did not name one
//! 3. POST on a fresh trailer session returns the resume offset `o`
//! 4. The bytes `[o, size)` are streamed and the COMPLETE push is awaited
//!
//! Phases 3 and 4 can be repeated from a saved [`UploadState`] with
//! [`Uploader::resume`].

use std::sync::Arc;

use loco_booking::DeviceInfo;
use loco_session::{
    Connector, Endpoint, PushReceiver, Session, SessionConfig, SessionError, SessionHandle,
};
use loco_wire::bson::Document;
use loco_wire::{decode_doc, get_int, get_nonempty_str, get_status};
use tracing::{debug, info, warn};

use crate::error::{UploadError, UploadPhase};
use crate::request::{
    get_trailer_request, post_request, ship_request, UploadConfig, UploadRequest, UploadState,
};

/// Upload announcement method
pub const SHIP_METHOD: &str = "SHIP";
/// Trailer lookup method
pub const GET_TRAILER_METHOD: &str = "GETTRAILER";
/// Trailer descriptor method
pub const POST_METHOD: &str = "POST";
/// Completion push method
pub const COMPLETE_METHOD: &str = "COMPLETE";

/// Result of a finished upload
#[derive(Debug, Clone, PartialEq)]
pub struct UploadOutcome {
    /// Final upload state
    pub state: UploadState,
    /// Bytes written in this attempt
    pub streamed: u64,
    /// COMPLETE push body
    pub complete: Document,
}

/// SHIP reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShipResult {
    /// Upload token
    pub token: String,
    /// Trailer endpoint, when SHIP named one
    pub trailer: Option<Endpoint>,
}

fn trailer_endpoint(doc: &Document) -> Option<Endpoint> {
    let host = get_nonempty_str(doc, "vh")?;
    let port = get_int(doc, "p")
        .and_then(|p| u16::try_from(p).ok())
        .filter(|p| *p != 0)?;
    Some(Endpoint::new(host, port))
}

/// Drives uploads over trailer sessions
pub struct Uploader {
    config: UploadConfig,
    session_config: SessionConfig,
    connector: Arc<dyn Connector>,
    device: DeviceInfo,
}

impl Uploader {
    /// Create an uploader that opens trailer sessions with `connector`.
    ///
    /// Trailer sessions never send keepalive PINGs: the trailer does not
    /// answer them and a PING written between chunks would land inside the
    /// raw payload.
    pub fn new(
        config: UploadConfig,
        mut session_config: SessionConfig,
        connector: Arc<dyn Connector>,
        device: DeviceInfo,
    ) -> Self {
        session_config.keepalive = false;
        Self {
            config,
            session_config,
            connector,
            device,
        }
    }

    /// Upload tuning
    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Run all four phases
    pub async fn upload(
        &self,
        main: &SessionHandle,
        request: &UploadRequest,
    ) -> Result<UploadOutcome, UploadError> {
        let mut state = self.prepare(main, request).await?;
        self.resume(&mut state, request).await
    }

    /// SHIP, then GETTRAILER if needed
    pub async fn prepare(
        &self,
        main: &SessionHandle,
        request: &UploadRequest,
    ) -> Result<UploadState, UploadError> {
        let ship = self.ship(main, request).await?;
        let trailer = match ship.trailer {
            Some(trailer) => trailer,
            None => {
                self.get_trailer(main, &ship.token, request.content_type)
                    .await?
            }
        };
        info!(
            "Upload of {} bytes to chat {} assigned trailer {}",
            request.size(),
            request.chat_id,
            trailer
        );
        Ok(UploadState {
            token: ship.token,
            trailer,
            total_size: request.size(),
            resume_offset: 0,
        })
    }

    /// Phase 1
    pub async fn ship(
        &self,
        main: &SessionHandle,
        request: &UploadRequest,
    ) -> Result<ShipResult, UploadError> {
        let reply = main
            .call_with_timeout(
                SHIP_METHOD,
                &ship_request(request),
                self.config.request_timeout(),
            )
            .await
            .map_err(|e| UploadError::in_phase(UploadPhase::Ship, e))?;

        let token = get_nonempty_str(&reply, "k").ok_or(UploadError::MissingField {
            phase: UploadPhase::Ship,
            field: "k",
        })?;
        Ok(ShipResult {
            token: token.to_string(),
            trailer: trailer_endpoint(&reply),
        })
    }

    /// Phase 2
    pub async fn get_trailer(
        &self,
        main: &SessionHandle,
        token: &str,
        content_type: i32,
    ) -> Result<Endpoint, UploadError> {
        let reply = main
            .call_with_timeout(
                GET_TRAILER_METHOD,
                &get_trailer_request(token, content_type),
                self.config.request_timeout(),
            )
            .await
            .map_err(|e| UploadError::in_phase(UploadPhase::GetTrailer, e))?;
        trailer_endpoint(&reply).ok_or(UploadError::MissingField {
            phase: UploadPhase::GetTrailer,
            field: "vh",
        })
    }

    /// Phases 3 and 4 on a new trailer session.
    ///
    /// `state.resume_offset` is updated from the POST reply. The trailer
    /// session is closed whether or not the transfer succeeds; the main
    /// session is never touched.
    pub async fn resume(
        &self,
        state: &mut UploadState,
        request: &UploadRequest,
    ) -> Result<UploadOutcome, UploadError> {
        let (trailer, _events) = Session::connect(
            &state.trailer,
            self.session_config.clone(),
            self.connector.as_ref(),
        )
        .await
        .map_err(|e| UploadError::in_phase(UploadPhase::Post, e))?;

        let result = self.transfer(&trailer, state, request).await;
        trailer.close().await;
        if let Err(e) = &result {
            warn!("Upload via {} failed: {}", state.trailer, e);
        }
        result
    }

    async fn transfer(
        &self,
        trailer: &SessionHandle,
        state: &mut UploadState,
        request: &UploadRequest,
    ) -> Result<UploadOutcome, UploadError> {
        let mut complete = trailer.subscribe(COMPLETE_METHOD);

        let reply = trailer
            .call_with_timeout(
                POST_METHOD,
                &post_request(&state.token, request, &self.device),
                self.config.request_timeout(),
            )
            .await
            .map_err(|e| UploadError::in_phase(UploadPhase::Post, e))?;

        let size = request.size();
        let offset = get_int(&reply, "o").unwrap_or(0);
        state.resume_offset = u64::try_from(offset)
            .ok()
            .filter(|o| *o <= size)
            .ok_or(UploadError::InvalidOffset { offset, size })?;
        state.total_size = size;
        debug!(
            "Trailer {} holds {} of {} bytes",
            state.trailer, state.resume_offset, size
        );

        let streamed = self.stream(trailer, request, state.resume_offset).await?;
        let body = self.await_complete(&mut complete).await?;
        info!(
            "Upload {} complete ({} bytes streamed)",
            state.token, streamed
        );

        Ok(UploadOutcome {
            state: state.clone(),
            streamed,
            complete: body,
        })
    }

    async fn stream(
        &self,
        trailer: &SessionHandle,
        request: &UploadRequest,
        offset: u64,
    ) -> Result<u64, UploadError> {
        let chunk_size = self.config.chunk_size.max(1);
        let end = request.data.len();
        // Offset was checked against the payload length
        let mut position = offset as usize;
        while position < end {
            let next = (position + chunk_size).min(end);
            trailer
                .write_raw(request.data.slice(position..next))
                .await
                .map_err(|e| UploadError::in_phase(UploadPhase::Stream, e))?;
            position = next;
        }
        Ok((end as u64) - offset)
    }

    async fn await_complete(&self, complete: &mut PushReceiver) -> Result<Document, UploadError> {
        let packet = tokio::time::timeout(self.config.complete_timeout(), complete.recv())
            .await
            .map_err(|_| UploadError::CompleteTimeout)?
            .ok_or(UploadError::Session {
                phase: UploadPhase::Complete,
                source: SessionError::Disconnected,
            })?;

        let body = decode_doc(&packet.body).map_err(|e| {
            UploadError::in_phase(UploadPhase::Complete, SessionError::body(COMPLETE_METHOD, e))
        })?;
        let status = get_status(&body);
        if status != 0 {
            return Err(UploadError::Rejected {
                phase: UploadPhase::Complete,
                status,
            });
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loco_session::testing::{test_config, DuplexConnector, MockServer};
    use loco_wire::bson::doc;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::DuplexStream;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn uploader(connector: DuplexConnector, chunk_size: usize) -> Uploader {
        Uploader::new(
            UploadConfig {
                chunk_size,
                ..UploadConfig::default()
            },
            test_config(),
            Arc::new(connector),
            DeviceInfo::default(),
        )
    }

    /// Trailer answering POST with `offset`, reading the remaining bytes
    /// and pushing COMPLETE with `complete_status`
    fn trailer(
        data: Vec<u8>,
        offset: i64,
        complete_status: i32,
        received: Arc<Mutex<Option<Vec<u8>>>>,
    ) -> DuplexConnector {
        let data = Arc::new(data);
        DuplexConnector::new(move |_, stream| {
            let data = data.clone();
            let received = received.clone();
            tokio::spawn(async move {
                let mut server = MockServer::accept(stream).await.unwrap();
                let post = server.recv_packet().await.unwrap();
                assert_eq!(post.method, "POST");
                server
                    .reply(&post, doc! { "status": 0, "o": offset })
                    .await
                    .unwrap();
                if offset < 0 || offset as usize > data.len() {
                    while server.recv_packet().await.is_ok() {}
                    return;
                }

                let remaining = data.len() - offset as usize;
                let bytes = server.recv_raw(remaining).await.unwrap();
                *received.lock().unwrap() = Some(bytes.to_vec());
                server
                    .push(0, "COMPLETE", doc! { "status": complete_status, "path": "/f" })
                    .await
                    .unwrap();
                // Nothing beyond the payload may follow
                assert!(server.recv_raw(1).await.is_err());
            });
            Ok(())
        })
    }

    fn state(size: usize) -> UploadState {
        UploadState {
            token: "tok".into(),
            trailer: Endpoint::new("trailer.example", 9000),
            total_size: size as u64,
            resume_offset: 0,
        }
    }

    #[tokio::test]
    async fn test_resume_streams_remaining_bytes() {
        let data = payload(200_000);
        let received = Arc::new(Mutex::new(None));
        let connector = trailer(data.clone(), 70_000, 0, received.clone());
        let uploader = uploader(connector.clone(), 64 * 1024);
        let request = UploadRequest::new(1, 2, "big.bin", data.clone());

        let mut state = state(data.len());
        let outcome = uploader.resume(&mut state, &request).await.unwrap();

        assert_eq!(outcome.streamed, 130_000);
        assert_eq!(outcome.state.resume_offset, 70_000);
        assert_eq!(outcome.complete.get_str("path").unwrap(), "/f");
        assert_eq!(received.lock().unwrap().as_deref(), Some(&data[70_000..]));
        assert_eq!(
            connector.attempts(),
            vec![Endpoint::new("trailer.example", 9000)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_trailer_receives_only_payload() {
        let data = payload(1_000_000);
        let offset = 100_000usize;
        let post_offset = offset as i64;
        let expected = data[offset..].to_vec();
        let received = Arc::new(Mutex::new(None));
        let sink = received.clone();

        // Reads one chunk every 90s, longer than the keepalive period
        let connector = DuplexConnector::new(move |_, stream| {
            let sink = sink.clone();
            let total = expected.len();
            tokio::spawn(async move {
                let mut server = MockServer::accept(stream).await.unwrap();
                let post = server.recv_packet().await.unwrap();
                server
                    .reply(&post, doc! { "status": 0, "o": post_offset })
                    .await
                    .unwrap();
                let mut bytes = Vec::with_capacity(total);
                while bytes.len() < total {
                    tokio::time::sleep(Duration::from_secs(90)).await;
                    let n = (total - bytes.len()).min(64 * 1024);
                    bytes.extend_from_slice(&server.recv_raw(n).await.unwrap());
                }
                *sink.lock().unwrap() = Some(bytes);
                server
                    .push(0, "COMPLETE", doc! { "status": 0 })
                    .await
                    .unwrap();
                assert!(server.recv_raw(1).await.is_err());
            });
            Ok(())
        });

        let request = UploadRequest::new(1, 2, "slow.bin", data.clone());
        let uploader = Uploader::new(
            UploadConfig {
                complete_timeout_secs: 3600,
                ..UploadConfig::default()
            },
            test_config(),
            Arc::new(connector),
            DeviceInfo::default(),
        );

        let mut state = state(data.len());
        let outcome = uploader.resume(&mut state, &request).await.unwrap();
        assert_eq!(outcome.streamed, (data.len() - offset) as u64);
        assert_eq!(received.lock().unwrap().as_deref(), Some(&data[offset..]));
    }

    #[tokio::test]
    async fn test_full_offset_streams_nothing_but_waits_for_complete() {
        let data = payload(1000);
        let received = Arc::new(Mutex::new(None));
        let connector = trailer(data.clone(), 1000, 0, received.clone());
        let request = UploadRequest::new(1, 2, "done.bin", data);

        let mut state = state(1000);
        let outcome = uploader(connector, 64)
            .resume(&mut state, &request)
            .await
            .unwrap();
        assert_eq!(outcome.streamed, 0);
        assert_eq!(received.lock().unwrap().as_deref(), Some(&b""[..]));
    }

    #[tokio::test]
    async fn test_complete_status_fails_transfer() {
        let data = payload(10);
        let connector = trailer(data.clone(), 0, -500, Arc::new(Mutex::new(None)));
        let request = UploadRequest::new(1, 2, "x.bin", data);

        let err = uploader(connector, 4)
            .resume(&mut state(10), &request)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            UploadError::Rejected {
                phase: UploadPhase::Complete,
                status: -500
            }
        );
    }

    #[tokio::test]
    async fn test_offset_beyond_size_is_rejected() {
        let data = payload(10);
        let connector = trailer(data.clone(), 11, 0, Arc::new(Mutex::new(None)));
        let request = UploadRequest::new(1, 2, "x.bin", data);

        let err = uploader(connector, 4)
            .resume(&mut state(10), &request)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            UploadError::InvalidOffset {
                offset: 11,
                size: 10
            }
        );
    }

    #[tokio::test]
    async fn test_post_status_fails_and_closes_trailer() {
        let closed = Arc::new(Mutex::new(false));
        let flag = closed.clone();
        let connector = DuplexConnector::new(move |_, stream| {
            let flag = flag.clone();
            tokio::spawn(async move {
                let mut server = MockServer::accept(stream).await.unwrap();
                let post = server.recv_packet().await.unwrap();
                server.reply(&post, doc! { "status": -3 }).await.unwrap();
                if server.recv_packet().await.is_err() {
                    *flag.lock().unwrap() = true;
                }
            });
            Ok(())
        });
        let request = UploadRequest::new(1, 2, "x.bin", payload(10));

        let err = uploader(connector, 4)
            .resume(&mut state(10), &request)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            UploadError::Rejected {
                phase: UploadPhase::Post,
                status: -3
            }
        );
        for _ in 0..100 {
            if *closed.lock().unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(*closed.lock().unwrap());
    }

    /// Main session server answering SHIP and GETTRAILER
    async fn main_server(stream: DuplexStream, ship_reply: Document) -> Vec<String> {
        let mut server = MockServer::accept(stream).await.unwrap();
        let mut methods = Vec::new();
        while let Ok(request) = server.recv_packet().await {
            methods.push(request.method.clone());
            let reply = match request.method.as_str() {
                "SHIP" => ship_reply.clone(),
                _ => doc! { "status": 0, "vh": "trailer.example", "p": 9000 },
            };
            server.reply(&request, reply).await.unwrap();
        }
        methods
    }

    #[tokio::test]
    async fn test_prepare_uses_gettrailer_when_ship_has_no_endpoint() {
        let (client, server) = tokio::io::duplex(256 * 1024);
        let server = tokio::spawn(main_server(server, doc! { "status": 0, "k": "tok" }));
        let (main, _events) = Session::start(client, "main", test_config()).await.unwrap();

        let uploader = uploader(DuplexConnector::new(|_, _| Ok(())), 64);
        let request = UploadRequest::new(9, 2, "a.png", payload(5));
        let state = uploader.prepare(&main, &request).await.unwrap();
        assert_eq!(state.token, "tok");
        assert_eq!(state.trailer, Endpoint::new("trailer.example", 9000));
        assert_eq!(state.total_size, 5);

        main.close().await;
        assert_eq!(server.await.unwrap(), vec!["SHIP", "GETTRAILER"]);
    }

    #[tokio::test]
    async fn test_full_upload_with_ship_endpoint() {
        let data = payload(3000);
        let (client, server) = tokio::io::duplex(256 * 1024);
        let server = tokio::spawn(main_server(
            server,
            doc! { "status": 0, "k": "tok", "vh": "direct.example", "p": 9100 },
        ));
        let (main, _events) = Session::start(client, "main", test_config()).await.unwrap();

        let received = Arc::new(Mutex::new(None));
        let connector = trailer(data.clone(), 0, 0, received.clone());
        let uploader = uploader(connector.clone(), 1024);
        let request = UploadRequest::new(9, 2, "a.png", data.clone());

        let outcome = uploader.upload(&main, &request).await.unwrap();
        assert_eq!(outcome.streamed, 3000);
        assert_eq!(received.lock().unwrap().as_deref(), Some(&data[..]));
        assert_eq!(connector.attempts(), vec![Endpoint::new("direct.example", 9100)]);

        // Main session survives the trailer closing
        assert!(!main.is_closed());
        main.close().await;
        assert_eq!(server.await.unwrap(), vec!["SHIP"]);
    }

    #[tokio::test]
    async fn test_ship_without_token() {
        let (client, server) = tokio::io::duplex(256 * 1024);
        tokio::spawn(main_server(server, doc! { "status": 0 }));
        let (main, _events) = Session::start(client, "main", test_config()).await.unwrap();

        let err = uploader(DuplexConnector::new(|_, _| Ok(())), 64)
            .ship(&main, &UploadRequest::new(1, 2, "a", payload(1)))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            UploadError::MissingField {
                phase: UploadPhase::Ship,
                field: "k"
            }
        );
    }
}
