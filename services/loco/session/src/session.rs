//! Encrypted LOCO sessions.
//!
//! A session is one V2SL connection. A single driver task owns the socket,
//! the decoder and the pending-request map; callers talk to it through a
//! cloneable [`SessionHandle`]. Inbound packets whose id matches a pending
//! request resolve that request, everything else is a push.
//!
//! ```text
//! Connecting -> HandshakeSent -> Ready -> Closed
//! ```
//!
//! `Ready` is entered on the first successfully decrypted block; the
//! server never acknowledges the handshake explicitly.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use loco_wire::bson::Document;
use loco_wire::crypto::{IV_SIZE, TAG_SIZE};
use loco_wire::{
    decode_doc, encode_doc, encrypt_block, get_status, HandshakeKey, Packet, SecureDecoder,
    SessionKey, MAX_BLOCK_SIZE,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant, Interval};
use tracing::{debug, error, info, warn};

use crate::error::SessionError;
use crate::handshake::send_handshake;
use crate::keepalive::{build_ping, ping_interval, KeepaliveTracker, PING_METHOD};
use crate::push::{PushReceiver, PushRegistry};
use crate::transport::{Connector, Endpoint};

/// Largest plaintext sealed into a single block
pub const MAX_BLOCK_PLAINTEXT: usize = MAX_BLOCK_SIZE as usize - IV_SIZE - TAG_SIZE;

/// Configuration for a LOCO session
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Default timeout for requests issued through [`SessionHandle::call`]
    pub request_timeout: Duration,
    /// Whether to send keepalive PINGs once ready
    pub keepalive: bool,
    /// Interval between keepalive PINGs once ready
    pub ping_interval: Duration,
    /// Consecutive PING timeouts that force the session closed (0 disables)
    pub keepalive_failure_threshold: u32,
    /// Timeout for the TCP connect and, separately, the handshake write
    pub connect_timeout: Duration,
    /// Size of the socket read buffer
    pub read_buffer_size: usize,
    /// Public key wrapping the session key; `None` uses the LOCO key
    pub handshake_key: Option<HandshakeKey>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            keepalive: true,
            ping_interval: Duration::from_secs(60),
            keepalive_failure_threshold: 3,
            connect_timeout: Duration::from_secs(10),
            read_buffer_size: 64 * 1024,
            handshake_key: None,
        }
    }
}

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// TCP connection in progress
    Connecting,
    /// Handshake written, no block received yet
    HandshakeSent,
    /// At least one block decrypted
    Ready,
    /// Terminal
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::HandshakeSent => "handshake-sent",
            SessionState::Ready => "ready",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Statistics for a session
#[derive(Clone, Debug, Default)]
pub struct SessionStats {
    /// Total bytes received
    pub bytes_in: u64,
    /// Total bytes sent, handshake included
    pub bytes_out: u64,
    /// Blocks decrypted
    pub blocks_in: u64,
    /// Blocks sent
    pub blocks_out: u64,
    /// Packets decoded
    pub packets_in: u64,
    /// Packets sent
    pub packets_out: u64,
    /// Packets delivered as pushes
    pub pushes: u64,
    /// Requests that timed out
    pub timeouts: u64,
    /// Requests currently awaiting a response
    pub pending: usize,
    /// Round trip of the last answered keepalive
    pub last_rtt: Option<Duration>,
}

/// Events emitted by a session
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// First block decrypted
    Ready,
    /// Packet that matched no pending request
    Push(Packet),
    /// Session-level error (decode failure, keepalive timeout)
    Error(SessionError),
    /// Session closed
    Disconnected {
        /// Whether the close was asked for locally
        requested: bool,
        /// Cause of an unrequested close
        reason: Option<SessionError>,
    },
}

/// Receiving end of a session's event stream
pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

enum Command {
    Request {
        packet: Packet,
        timeout: Duration,
        reply: Reply<Packet>,
    },
    WriteRaw {
        data: Bytes,
        reply: Reply<()>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
    Stats {
        reply: oneshot::Sender<SessionStats>,
    },
}

impl Command {
    fn fail(self, err: SessionError) {
        match self {
            Command::Request { reply, .. } => {
                reply.send(Err(err)).ok();
            }
            Command::WriteRaw { reply, .. } => {
                reply.send(Err(err)).ok();
            }
            Command::Close { reply } => {
                reply.send(()).ok();
            }
            Command::Stats { .. } => {}
        }
    }
}

/// Handle to a running session
#[derive(Clone)]
pub struct SessionHandle {
    peer: String,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionState>,
    pushes: PushRegistry,
    request_timeout: Duration,
}

impl SessionHandle {
    /// Peer label (usually `host:port`)
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Whether the session has closed
    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Default request timeout
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Send a request and wait for the packet carrying its packet id.
    ///
    /// A timeout fails only this request; a response arriving later is
    /// delivered as a push.
    pub async fn request(
        &self,
        method: &str,
        body: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Packet, SessionError> {
        let packet = Packet::new(0, method, body).map_err(SessionError::Request)?;
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Request {
                packet,
                timeout,
                reply,
            })
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Send a request with a BSON body
    pub async fn request_doc(
        &self,
        method: &str,
        body: &Document,
        timeout: Duration,
    ) -> Result<Packet, SessionError> {
        let bytes = encode_doc(body).map_err(|e| SessionError::body(method, e))?;
        self.request(method, bytes, timeout).await
    }

    /// Request with the default timeout and decode the reply body.
    ///
    /// A non-zero `status` field fails with [`SessionError::Status`].
    pub async fn call(&self, method: &str, body: &Document) -> Result<Document, SessionError> {
        self.call_with_timeout(method, body, self.request_timeout)
            .await
    }

    /// [`call`](Self::call) with an explicit timeout
    pub async fn call_with_timeout(
        &self,
        method: &str,
        body: &Document,
        timeout: Duration,
    ) -> Result<Document, SessionError> {
        let packet = self.request_doc(method, body, timeout).await?;
        let doc = decode_doc(&packet.body).map_err(|e| SessionError::body(method, e))?;
        let status = get_status(&doc);
        if status != 0 {
            return Err(SessionError::Status {
                method: method.to_string(),
                packet_id: packet.packet_id,
                status,
            });
        }
        Ok(doc)
    }

    /// Encrypt and write raw bytes outside any packet framing.
    ///
    /// Data larger than one block is split across several. Resolves once the
    /// bytes have been written to the socket.
    pub async fn write_raw(&self, data: impl Into<Bytes>) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::WriteRaw {
                data: data.into(),
                reply,
            })
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Subscribe to pushes with `method`.
    ///
    /// The receiver ends when the session closes.
    pub fn subscribe(&self, method: &str) -> PushReceiver {
        let rx = self.pushes.subscribe(method);
        if self.is_closed() {
            self.pushes.clear();
        }
        rx
    }

    /// Wait until the session is ready
    pub async fn ready(&self) -> Result<(), SessionError> {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(|s| matches!(s, SessionState::Ready | SessionState::Closed))
            .await
            .map(|s| *s)
            .unwrap_or(SessionState::Closed);
        match reached {
            SessionState::Ready => Ok(()),
            _ => Err(SessionError::Closed),
        }
    }

    /// Wait until the session has closed
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        state.wait_for(|s| *s == SessionState::Closed).await.ok();
    }

    /// Close gracefully.
    ///
    /// Keepalive stops, writes already issued complete, and pending requests
    /// fail with [`SessionError::Closed`].
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Close { reply }).is_ok() {
            rx.await.ok();
        }
        self.closed().await;
    }

    /// Snapshot of session statistics, `None` once closed
    pub async fn stats(&self) -> Option<SessionStats> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(Command::Stats { reply }).ok()?;
        rx.await.ok()
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}

/// Session entry points
pub struct Session;

impl Session {
    /// Connect to `endpoint` and start a session over the new stream
    pub async fn connect(
        endpoint: &Endpoint,
        config: SessionConfig,
        connector: &dyn Connector,
    ) -> Result<(SessionHandle, SessionEvents), SessionError> {
        info!("Connecting LOCO session to {}", endpoint);
        let stream = match tokio::time::timeout(config.connect_timeout, connector.connect(endpoint))
            .await
        {
            Ok(result) => result?,
            Err(_) => return Err(SessionError::ConnectTimeout(endpoint.to_string())),
        };
        Self::start(stream, endpoint.to_string(), config).await
    }

    /// Write the handshake on an established stream and spawn the driver
    pub async fn start<S>(
        mut stream: S,
        peer: impl Into<String>,
        config: SessionConfig,
    ) -> Result<(SessionHandle, SessionEvents), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let peer = peer.into();
        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);

        let public_key = match &config.handshake_key {
            Some(key) => key.clone(),
            None => HandshakeKey::loco()?,
        };
        let key = SessionKey::generate();
        let handshake_len = match tokio::time::timeout(
            config.connect_timeout,
            send_handshake(&mut stream, &key, &public_key),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(SessionError::ConnectTimeout(peer)),
        };
        state_tx.send_replace(SessionState::HandshakeSent);
        debug!("Session {} handshake sent", peer);

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let pushes = PushRegistry::new();

        let handle = SessionHandle {
            peer: peer.clone(),
            commands: command_tx,
            state: state_rx,
            pushes: pushes.clone(),
            request_timeout: config.request_timeout,
        };

        let mut driver = Driver {
            decoder: SecureDecoder::new(key.clone()),
            key,
            stream,
            peer,
            ping: ping_interval(config.ping_interval),
            keepalive: KeepaliveTracker::new(config.keepalive_failure_threshold),
            config,
            commands: command_rx,
            events: event_tx,
            state: state_tx,
            pushes,
            pending: PendingTable::default(),
            next_packet_id: 1,
            stats: SessionStats::default(),
        };
        driver.stats.bytes_out = handshake_len as u64;

        tokio::spawn(driver.run());
        Ok((handle, event_rx))
    }
}

enum Waiter {
    Caller(Reply<Packet>),
    Keepalive { sent_at: Instant },
}

struct PendingRequest {
    method: String,
    deadline: Instant,
    waiter: Waiter,
}

/// Outstanding requests with a deadline index ordered by expiry
#[derive(Default)]
struct PendingTable {
    requests: HashMap<i32, PendingRequest>,
    deadlines: BTreeSet<(Instant, i32)>,
}

impl PendingTable {
    fn insert(&mut self, packet_id: i32, request: PendingRequest) {
        self.deadlines.insert((request.deadline, packet_id));
        if let Some(replaced) = self.requests.insert(packet_id, request) {
            self.deadlines.remove(&(replaced.deadline, packet_id));
        }
    }

    fn remove(&mut self, packet_id: i32) -> Option<PendingRequest> {
        let request = self.requests.remove(&packet_id)?;
        self.deadlines.remove(&(request.deadline, packet_id));
        Some(request)
    }

    fn contains(&self, packet_id: i32) -> bool {
        self.requests.contains_key(&packet_id)
    }

    fn len(&self) -> usize {
        self.requests.len()
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.first().map(|(deadline, _)| *deadline)
    }

    /// Remove the earliest request whose deadline is at or before `now`
    fn pop_expired(&mut self, now: Instant) -> Option<(i32, PendingRequest)> {
        while let Some(&(deadline, packet_id)) = self.deadlines.first() {
            if deadline > now {
                return None;
            }
            self.deadlines.pop_first();
            if let Some(request) = self.requests.remove(&packet_id) {
                return Some((packet_id, request));
            }
        }
        None
    }

    fn drain(&mut self) -> impl Iterator<Item = PendingRequest> + '_ {
        self.deadlines.clear();
        self.requests.drain().map(|(_, request)| request)
    }
}

enum Exit {
    Requested(Option<oneshot::Sender<()>>),
    Dropped(SessionError),
}

struct Driver<S> {
    stream: S,
    key: SessionKey,
    decoder: SecureDecoder,
    peer: String,
    config: SessionConfig,
    ping: Interval,
    keepalive: KeepaliveTracker,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<SessionEvent>,
    state: watch::Sender<SessionState>,
    pushes: PushRegistry,
    pending: PendingTable,
    next_packet_id: i32,
    stats: SessionStats,
}

impl<S> Driver<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn run(mut self) {
        let mut chunk = vec![0u8; self.config.read_buffer_size.max(1)];

        let exit = loop {
            let pinging = self.config.keepalive && *self.state.borrow() == SessionState::Ready;
            let sweep_at = self.pending.next_deadline();

            tokio::select! {
                read = self.stream.read(&mut chunk) => {
                    match read {
                        Ok(0) => break Exit::Dropped(SessionError::Disconnected),
                        Ok(n) => {
                            if let Err(e) = self.on_bytes(&chunk[..n]) {
                                break Exit::Dropped(e);
                            }
                        }
                        Err(e) => break Exit::Dropped(e.into()),
                    }
                }

                command = self.commands.recv() => {
                    match command {
                        Some(Command::Close { reply }) => break Exit::Requested(Some(reply)),
                        Some(command) => {
                            if let Err(e) = self.on_command(command).await {
                                break Exit::Dropped(e);
                            }
                        }
                        // Every handle dropped
                        None => break Exit::Requested(None),
                    }
                }

                _ = sleep_until(sweep_at.unwrap_or_else(Instant::now)), if sweep_at.is_some() => {
                    if let Err(e) = self.expire_pending() {
                        break Exit::Dropped(e);
                    }
                }

                _ = self.ping.tick(), if pinging => {
                    if let Err(e) = self.send_ping().await {
                        break Exit::Dropped(e);
                    }
                }
            }
        };

        self.shutdown(exit).await;
    }

    fn on_bytes(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
        self.stats.bytes_in += bytes.len() as u64;
        let packets = self.decoder.feed(bytes)?;
        self.stats.blocks_in = self.decoder.blocks_opened();

        if self.stats.blocks_in > 0 && *self.state.borrow() == SessionState::HandshakeSent {
            self.state.send_replace(SessionState::Ready);
            self.ping.reset();
            info!("Session {} ready", self.peer);
            self.events.send(SessionEvent::Ready).ok();
        }

        for packet in packets {
            self.stats.packets_in += 1;
            self.dispatch(packet);
        }
        Ok(())
    }

    fn dispatch(&mut self, packet: Packet) {
        match self.pending.remove(packet.packet_id) {
            Some(pending) => match pending.waiter {
                Waiter::Caller(reply) => {
                    debug!(
                        "Session {} {} response (packet id {})",
                        self.peer, pending.method, packet.packet_id
                    );
                    reply.send(Ok(packet)).ok();
                }
                Waiter::Keepalive { sent_at } => {
                    let rtt = sent_at.elapsed();
                    self.keepalive.record_success(rtt);
                    self.stats.last_rtt = Some(rtt);
                    debug!("Session {} PING answered in {:?}", self.peer, rtt);
                }
            },
            None => {
                self.stats.pushes += 1;
                let delivered = self.pushes.dispatch(&packet);
                debug!(
                    "Session {} push {} (packet id {}) to {} subscribers",
                    self.peer, packet.method, packet.packet_id, delivered
                );
                self.events.send(SessionEvent::Push(packet)).ok();
            }
        }
    }

    async fn on_command(&mut self, command: Command) -> Result<(), SessionError> {
        match command {
            Command::Request {
                mut packet,
                timeout,
                reply,
            } => {
                packet.packet_id = self.allocate_packet_id();
                debug!(
                    "Session {} sending {} (packet id {})",
                    self.peer, packet.method, packet.packet_id
                );
                let bytes = match packet.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        reply.send(Err(SessionError::Request(e))).ok();
                        return Ok(());
                    }
                };
                self.pending.insert(
                    packet.packet_id,
                    PendingRequest {
                        method: packet.method,
                        deadline: Instant::now() + timeout,
                        waiter: Waiter::Caller(reply),
                    },
                );
                self.write_sealed(&bytes).await?;
                self.stats.packets_out += 1;
            }
            Command::WriteRaw { data, reply } => match self.write_sealed(&data).await {
                Ok(()) => {
                    reply.send(Ok(())).ok();
                }
                Err(e) => {
                    reply.send(Err(e.clone())).ok();
                    return Err(e);
                }
            },
            Command::Stats { reply } => {
                let mut stats = self.stats.clone();
                stats.pending = self.pending.len();
                reply.send(stats).ok();
            }
            Command::Close { reply } => {
                // Handled by the run loop
                reply.send(()).ok();
            }
        }
        Ok(())
    }

    async fn send_ping(&mut self) -> Result<(), SessionError> {
        let packet_id = self.allocate_packet_id();
        let packet = build_ping(packet_id)?;
        let now = Instant::now();
        self.pending.insert(
            packet_id,
            PendingRequest {
                method: PING_METHOD.to_string(),
                deadline: now + self.config.request_timeout,
                waiter: Waiter::Keepalive { sent_at: now },
            },
        );
        debug!("Session {} sending PING (packet id {})", self.peer, packet_id);
        self.write_sealed(&packet.encode()?).await?;
        self.stats.packets_out += 1;
        Ok(())
    }

    fn expire_pending(&mut self) -> Result<(), SessionError> {
        let now = Instant::now();
        while let Some((packet_id, pending)) = self.pending.pop_expired(now) {
            self.stats.timeouts += 1;
            let err = SessionError::Timeout {
                method: pending.method,
                packet_id,
            };
            warn!("Session {}: {}", self.peer, err);

            match pending.waiter {
                Waiter::Caller(reply) => {
                    reply.send(Err(err)).ok();
                }
                Waiter::Keepalive { .. } => {
                    self.events.send(SessionEvent::Error(err)).ok();
                    if self.keepalive.record_failure() {
                        return Err(SessionError::Keepalive(
                            self.keepalive.consecutive_failures(),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn allocate_packet_id(&mut self) -> i32 {
        let pending = &self.pending;
        next_packet_id(&mut self.next_packet_id, |id| pending.contains(id))
    }

    async fn write_sealed(&mut self, plaintext: &[u8]) -> Result<(), SessionError> {
        for slice in plaintext.chunks(MAX_BLOCK_PLAINTEXT) {
            let block = encrypt_block(&self.key, slice)?;
            self.stream.write_all(&block).await?;
            self.stats.blocks_out += 1;
            self.stats.bytes_out += block.len() as u64;
        }
        self.stream.flush().await?;
        Ok(())
    }

    async fn shutdown(mut self, exit: Exit) {
        let (requested, reason, close_reply) = match exit {
            Exit::Requested(reply) => (true, None, reply),
            Exit::Dropped(err) => (false, Some(err), None),
        };

        if requested {
            if let Err(e) = self.stream.shutdown().await {
                debug!("Session {} shutdown: {}", self.peer, e);
            }
            info!("Session {} closed", self.peer);
        } else if let Some(err) = &reason {
            if *err == SessionError::Disconnected {
                warn!("Session {} disconnected by peer", self.peer);
            } else {
                error!("Session {} failed: {}", self.peer, err);
                self.events.send(SessionEvent::Error(err.clone())).ok();
            }
        }

        let pending_err = if requested {
            SessionError::Closed
        } else {
            SessionError::Disconnected
        };
        for pending in self.pending.drain() {
            if let Waiter::Caller(reply) = pending.waiter {
                reply.send(Err(pending_err.clone())).ok();
            }
        }

        self.state.send_replace(SessionState::Closed);
        self.pushes.clear();

        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            command.fail(SessionError::Closed);
        }

        self.events
            .send(SessionEvent::Disconnected { requested, reason })
            .ok();
        if let Some(reply) = close_reply {
            reply.send(()).ok();
        }
    }
}

/// Take the next packet id from `counter`, skipping ids still in use.
///
/// The counter wraps on overflow.
fn next_packet_id(counter: &mut i32, in_use: impl Fn(i32) -> bool) -> i32 {
    loop {
        let packet_id = *counter;
        *counter = counter.wrapping_add(1);
        if !in_use(packet_id) {
            return packet_id;
        }
    }
}
