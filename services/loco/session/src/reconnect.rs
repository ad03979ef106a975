//! Automatic reconnection with exponential backoff.
//!
//! A [`Reconnector`] owns a supervisor task that opens sessions through a
//! [`SessionFactory`]. When a session drops without being asked to, the
//! supervisor schedules one reconnect timer; failures reschedule with a
//! doubled delay up to the policy maximum. An explicit disconnect stops all
//! scheduling until the next explicit connect.

use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, Sleep};
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::session::{SessionEvent, SessionEvents, SessionHandle};

/// Exponential backoff parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub base: Duration,
    /// Upper bound for any delay
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1000),
            max: Duration::from_millis(30_000),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based): `min(base * 2^(attempt-1), max)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }
}

/// Retry counter plus the single outstanding reconnect timer
#[derive(Debug, Default)]
pub struct ReconnectState {
    attempt: u32,
    timer: Option<Pin<Box<Sleep>>>,
}

impl ReconnectState {
    /// Fresh state with no attempts and no timer
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts made since the last successful connect
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether a reconnect timer is outstanding
    pub fn is_scheduled(&self) -> bool {
        self.timer.is_some()
    }

    /// Start the next timer, returning its delay.
    ///
    /// Does nothing and returns `None` if a timer is already outstanding.
    pub fn schedule(&mut self, policy: &BackoffPolicy) -> Option<Duration> {
        if self.timer.is_some() {
            return None;
        }
        self.attempt = self.attempt.saturating_add(1);
        let delay = policy.delay_for(self.attempt);
        self.timer = Some(Box::pin(sleep(delay)));
        Some(delay)
    }

    /// Drop the outstanding timer, keeping the attempt count
    pub fn cancel(&mut self) {
        self.timer = None;
    }

    /// Forget all attempts and any timer
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.timer = None;
    }

    /// Wait for the outstanding timer; pends forever if there is none
    pub async fn fired(&mut self) {
        match self.timer.as_mut() {
            Some(timer) => {
                timer.as_mut().await;
                self.timer = None;
            }
            None => pending().await,
        }
    }
}

/// Opens new sessions for a [`Reconnector`]
#[async_trait]
pub trait SessionFactory: Send + Sync + 'static {
    /// Resolve an endpoint and start a session on it
    async fn open(&self) -> Result<(SessionHandle, SessionEvents), SessionError>;
}

/// Events emitted by a [`Reconnector`]
#[derive(Debug, Clone)]
pub enum ReconnectEvent {
    /// A new session is installed
    Connected(SessionHandle),
    /// The installed session closed
    Disconnected {
        /// Whether the close was asked for locally
        requested: bool,
        /// Cause of an unrequested close
        reason: Option<SessionError>,
    },
    /// A reconnect timer was started
    Scheduled {
        /// Attempt number, starting at 1
        attempt: u32,
        /// Delay before the attempt
        delay: Duration,
    },
    /// A reconnect attempt failed
    Failed {
        /// Attempt number
        attempt: u32,
        /// Why it failed
        error: SessionError,
    },
    /// Event from the installed session other than its disconnect
    Session(SessionEvent),
}

/// Receiving end of a reconnector's event stream
pub type ReconnectEvents = mpsc::UnboundedReceiver<ReconnectEvent>;

enum Command {
    Connect {
        reply: oneshot::Sender<Result<SessionHandle, SessionError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a reconnect supervisor
#[derive(Clone)]
pub struct Reconnector {
    commands: mpsc::UnboundedSender<Command>,
    current: watch::Receiver<Option<SessionHandle>>,
}

impl Reconnector {
    /// Spawn a supervisor around `factory`; nothing connects until [`connect`](Self::connect)
    pub fn spawn<F: SessionFactory>(factory: F, policy: BackoffPolicy) -> (Self, ReconnectEvents) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (current_tx, current_rx) = watch::channel(None);

        let supervisor = Supervisor {
            factory: Arc::new(factory),
            policy,
            state: ReconnectState::new(),
            wanted: false,
            session: None,
            session_events: None,
            commands: command_rx,
            events: event_tx,
            current: current_tx,
        };
        tokio::spawn(supervisor.run());

        (
            Self {
                commands: command_tx,
                current: current_rx,
            },
            event_rx,
        )
    }

    /// Connect now, enabling automatic reconnects.
    ///
    /// Returns the live session if one is already installed. A failure here
    /// is returned to the caller and does not schedule a retry.
    pub async fn connect(&self) -> Result<SessionHandle, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect { reply })
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Close the current session and stop reconnecting
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Disconnect { reply }).is_ok() {
            rx.await.ok();
        }
    }

    /// The installed session, if any
    pub fn current(&self) -> Option<SessionHandle> {
        self.current.borrow().clone()
    }

    /// Wait until a session is installed
    pub async fn wait_connected(&self) -> Result<SessionHandle, SessionError> {
        let mut current = self.current.clone();
        let handle = current
            .wait_for(|session| session.is_some())
            .await
            .map_err(|_| SessionError::Closed)?;
        handle.clone().ok_or(SessionError::Closed)
    }
}

struct Supervisor<F> {
    factory: Arc<F>,
    policy: BackoffPolicy,
    state: ReconnectState,
    wanted: bool,
    session: Option<SessionHandle>,
    session_events: Option<SessionEvents>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ReconnectEvent>,
    current: watch::Sender<Option<SessionHandle>>,
}

async fn next_session_event(events: &mut Option<SessionEvents>) -> Option<SessionEvent> {
    match events.as_mut() {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

impl<F: SessionFactory> Supervisor<F> {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(Command::Connect { reply }) => {
                            let result = self.on_connect().await;
                            reply.send(result).ok();
                        }
                        Some(Command::Disconnect { reply }) => {
                            self.on_disconnect().await;
                            reply.send(()).ok();
                        }
                        None => {
                            self.on_disconnect().await;
                            break;
                        }
                    }
                }

                event = next_session_event(&mut self.session_events) => {
                    match event {
                        Some(SessionEvent::Disconnected { requested, reason }) => {
                            self.on_session_closed(requested, reason);
                        }
                        Some(event) => {
                            self.events.send(ReconnectEvent::Session(event)).ok();
                        }
                        None => self.on_session_closed(false, Some(SessionError::Disconnected)),
                    }
                }

                _ = self.state.fired() => {
                    self.attempt_reconnect().await;
                }
            }
        }
        debug!("Reconnect supervisor stopped");
    }

    async fn on_connect(&mut self) -> Result<SessionHandle, SessionError> {
        self.wanted = true;
        self.state.reset();

        if let Some(session) = &self.session {
            if !session.is_closed() {
                return Ok(session.clone());
            }
        }

        match self.factory.open().await {
            Ok((handle, events)) => {
                self.install(handle.clone(), events);
                Ok(handle)
            }
            Err(e) => {
                warn!("Connect failed: {}", e);
                self.wanted = false;
                Err(e)
            }
        }
    }

    async fn on_disconnect(&mut self) {
        self.wanted = false;
        self.state.reset();
        if let Some(session) = self.session.take() {
            info!("Disconnecting session {}", session.peer());
            session.close().await;
            self.events
                .send(ReconnectEvent::Disconnected {
                    requested: true,
                    reason: None,
                })
                .ok();
        }
        self.session_events = None;
        self.current.send_replace(None);
    }

    fn on_session_closed(&mut self, requested: bool, reason: Option<SessionError>) {
        self.session = None;
        self.session_events = None;
        self.current.send_replace(None);
        self.events
            .send(ReconnectEvent::Disconnected {
                requested,
                reason: reason.clone(),
            })
            .ok();

        if requested || !self.wanted {
            debug!("Session closed on request; not reconnecting");
            return;
        }
        warn!(
            "Session dropped ({}); scheduling reconnect",
            reason.map(|e| e.to_string()).unwrap_or_else(|| "no reason".into())
        );
        self.schedule();
    }

    fn schedule(&mut self) {
        if let Some(delay) = self.state.schedule(&self.policy) {
            let attempt = self.state.attempt();
            info!("Reconnect attempt {} in {:?}", attempt, delay);
            self.events
                .send(ReconnectEvent::Scheduled { attempt, delay })
                .ok();
        }
    }

    async fn attempt_reconnect(&mut self) {
        if !self.wanted {
            return;
        }
        let attempt = self.state.attempt();
        match self.factory.open().await {
            Ok((handle, events)) => {
                info!("Reconnected to {} after {} attempts", handle.peer(), attempt);
                self.state.reset();
                self.install(handle, events);
            }
            Err(error) => {
                warn!("Reconnect attempt {} failed: {}", attempt, error);
                self.events
                    .send(ReconnectEvent::Failed { attempt, error })
                    .ok();
                self.schedule();
            }
        }
    }

    fn install(&mut self, handle: SessionHandle, events: SessionEvents) {
        self.session = Some(handle.clone());
        self.session_events = Some(events);
        self.current.send_replace(Some(handle.clone()));
        self.events.send(ReconnectEvent::Connected(handle)).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use crate::testing::{test_config, MockServer};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::io::DuplexStream;

    #[test]
    fn test_backoff_sequence() {
        let policy = BackoffPolicy::default();
        let delays: Vec<u128> = (1..=8).map(|n| policy.delay_for(n).as_millis()).collect();
        assert_eq!(
            delays,
            vec![1000, 2000, 4000, 8000, 16000, 30000, 30000, 30000]
        );
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(30_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_timer_and_reset() {
        let policy = BackoffPolicy::default();
        let mut state = ReconnectState::new();

        assert_eq!(state.schedule(&policy), Some(Duration::from_millis(1000)));
        assert_eq!(state.schedule(&policy), None);
        assert_eq!(state.attempt(), 1);

        state.fired().await;
        assert!(!state.is_scheduled());
        assert_eq!(state.schedule(&policy), Some(Duration::from_millis(2000)));

        state.reset();
        assert_eq!(state.attempt(), 0);
        assert!(!state.is_scheduled());
        assert_eq!(state.schedule(&policy), Some(Duration::from_millis(1000)));
    }

    /// Factory serving sessions from mock servers; opens numbered
    /// `fail_from..fail_until` (0-based) are refused
    struct MockFactory {
        opens: AtomicU32,
        fail_from: u32,
        fail_until: u32,
        servers: mpsc::UnboundedSender<MockServer<DuplexStream>>,
    }

    #[async_trait]
    impl SessionFactory for MockFactory {
        async fn open(&self) -> Result<(SessionHandle, SessionEvents), SessionError> {
            let n = self.opens.fetch_add(1, Ordering::SeqCst);
            if n >= self.fail_from && n < self.fail_until {
                return Err(SessionError::Connect {
                    endpoint: "mock".into(),
                    reason: format!("refused #{}", n),
                });
            }
            let (client, server) = tokio::io::duplex(64 * 1024);
            let servers = self.servers.clone();
            tokio::spawn(async move {
                if let Ok(server) = MockServer::accept(server).await {
                    servers.send(server).ok();
                }
            });
            Session::start(client, "mock", test_config()).await
        }
    }

    fn factory(
        fail_from: u32,
        fail_until: u32,
    ) -> (MockFactory, mpsc::UnboundedReceiver<MockServer<DuplexStream>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            MockFactory {
                opens: AtomicU32::new(0),
                fail_from,
                fail_until,
                servers: tx,
            },
            rx,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_with_backoff_after_drop() {
        // Open #0 succeeds, #1..#3 fail, #4 succeeds
        let (factory, mut servers) = factory(1, 4);
        let (reconnector, mut events) = Reconnector::spawn(factory, BackoffPolicy::default());

        let first = reconnector.connect().await.unwrap();
        let server = servers.recv().await.unwrap();
        assert!(matches!(events.recv().await, Some(ReconnectEvent::Connected(_))));

        drop(server);
        first.closed().await;

        let mut scheduled = Vec::new();
        let mut failures = 0;
        loop {
            match events.recv().await.unwrap() {
                ReconnectEvent::Scheduled { attempt, delay } => scheduled.push((attempt, delay)),
                ReconnectEvent::Failed { .. } => failures += 1,
                ReconnectEvent::Connected(handle) => {
                    assert!(!handle.is_closed());
                    break;
                }
                ReconnectEvent::Disconnected { requested, .. } => assert!(!requested),
                ReconnectEvent::Session(_) => {}
            }
        }

        assert_eq!(failures, 3);
        assert_eq!(
            scheduled,
            vec![
                (1, Duration::from_millis(1000)),
                (2, Duration::from_millis(2000)),
                (3, Duration::from_millis(4000)),
                (4, Duration::from_millis(8000)),
            ]
        );
        assert!(reconnector.current().is_some());

        // Attempt counter restarts after a successful reconnect
        let server = servers.recv().await.unwrap();
        drop(server);
        loop {
            if let ReconnectEvent::Scheduled { attempt, delay } = events.recv().await.unwrap() {
                assert_eq!(attempt, 1);
                assert_eq!(delay, Duration::from_millis(1000));
                break;
            }
        }
        reconnector.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_disconnect_suppresses_reconnect() {
        let (factory, mut servers) = factory(u32::MAX, u32::MAX);
        let (reconnector, mut events) = Reconnector::spawn(factory, BackoffPolicy::default());

        let session = reconnector.connect().await.unwrap();
        let _server = servers.recv().await.unwrap();
        reconnector.disconnect().await;
        assert!(session.is_closed());
        assert!(reconnector.current().is_none());

        tokio::time::sleep(Duration::from_secs(120)).await;
        let mut saw_requested_disconnect = false;
        while let Ok(event) = events.try_recv() {
            match event {
                ReconnectEvent::Scheduled { .. } | ReconnectEvent::Failed { .. } => {
                    panic!("reconnect scheduled after explicit disconnect")
                }
                ReconnectEvent::Disconnected { requested, .. } => {
                    assert!(requested);
                    saw_requested_disconnect = true;
                }
                _ => {}
            }
        }
        assert!(saw_requested_disconnect);

        // Explicit connect re-enables the supervisor
        let again = reconnector.connect().await.unwrap();
        assert!(!again.is_closed());
    }

    #[tokio::test]
    async fn test_initial_connect_failure_is_returned() {
        let (factory, _servers) = factory(0, 1);
        let (reconnector, mut events) = Reconnector::spawn(factory, BackoffPolicy::default());

        let err = reconnector.connect().await.unwrap_err();
        assert!(matches!(err, SessionError::Connect { .. }));
        assert!(events.try_recv().is_err());

        // Second explicit connect succeeds
        assert!(reconnector.connect().await.is_ok());
    }
}
