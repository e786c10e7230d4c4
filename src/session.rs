//! Per-client session state machine.
//!
//! Every inbound connection gets one [`Session`] driven by its own task. Client
//! frames, client close and connect results arrive as [`SessionEvent`]s on one
//! channel; frames from the open upstream are read from its handle by the same
//! loop. The state below is only ever touched sequentially:
//!
//! ```text
//! Idle --msg--> Connecting --open--> Open --error/close--> Closed
//!                   |                                         |
//!                   +---------- connect failed -------------->+
//! Closed --msg--> Idle --> Connecting   (retry on new traffic)
//! ```

use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{ConnectError, RelayError, UpstreamSendError};
use crate::registry::{SessionHandle, SessionId, SessionRegistry};
use crate::telemetry::RelayStats;
use crate::upstream::{connect_with_timeout, Connector, UpstreamEvent, UpstreamHandle};
use crate::wsproto::{ErrorPayload, Frame};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectState {
    Idle,
    Connecting,
    Open,
    Closed,
}

impl ConnectState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectState::Idle => "idle",
            ConnectState::Connecting => "connecting",
            ConnectState::Open => "open",
            ConnectState::Closed => "closed",
        }
    }
}

#[derive(Debug)]
pub enum SessionEvent {
    /// Data frame from the client.
    Client(Frame),
    /// The inbound connection is gone.
    ClientClosed,
    /// The relay is stopping.
    Shutdown,
    ConnectFinished {
        attempt: u64,
        result: Result<UpstreamHandle, ConnectError>,
    },
    /// Something the open upstream reported.
    Upstream(UpstreamEvent),
}

#[derive(Clone, Debug)]
pub struct SessionSettings {
    pub connect_timeout: Duration,
    /// `None` keeps the pending queue unbounded.
    pub max_pending: Option<usize>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_pending: None,
        }
    }
}

/// Relay-wide dependencies every session shares.
#[derive(Clone)]
pub struct SessionContext {
    pub connector: Arc<dyn Connector>,
    pub registry: SessionRegistry,
    pub stats: Arc<RelayStats>,
    pub settings: SessionSettings,
}

/// Outbound half of the client connection, drained by the server's writer task.
#[derive(Clone, Debug)]
pub struct ClientSink {
    tx: mpsc::UnboundedSender<Frame>,
}

impl ClientSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queue a frame for the client. Returns false if the client is gone.
    pub fn send(&self, frame: Frame) -> bool {
        self.is_open() && self.tx.send(frame).is_ok()
    }
}

pub struct Session {
    handle: SessionHandle,
    client: ClientSink,
    ctx: SessionContext,
    state: ConnectState,
    pending: VecDeque<Frame>,
    upstream: Option<UpstreamHandle>,
    attempt: u64,
}

impl Session {
    pub fn new(handle: SessionHandle, client: ClientSink, ctx: SessionContext) -> Self {
        ctx.stats.on_session_opened();
        Self {
            handle,
            client,
            ctx,
            state: ConnectState::Idle,
            pending: VecDeque::new(),
            upstream: None,
            attempt: 0,
        }
    }

    pub fn id(&self) -> &SessionId {
        self.handle.id()
    }

    pub fn state(&self) -> ConnectState {
        self.state
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Generation of the latest connect attempt; 0 before the first one.
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Event loop; returns once the client is gone or the relay shuts down.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        info!(session_id = %self.id(), peer = ?self.handle.peer(), "client connected");
        loop {
            match self.next_event(&mut events).await {
                Some(event) => {
                    if self.handle(event).is_break() {
                        return;
                    }
                }
                None => {
                    self.on_client_close();
                    return;
                }
            }
        }
    }

    /// Wait for the next input: a session event, or an event from the open
    /// upstream if there is one.
    pub async fn next_event(
        &mut self,
        events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    ) -> Option<SessionEvent> {
        tokio::select! {
            event = events.recv() => event,
            event = next_upstream_event(self.upstream.as_mut()) => Some(SessionEvent::Upstream(event)),
        }
    }

    pub fn handle(&mut self, event: SessionEvent) -> ControlFlow<()> {
        match event {
            SessionEvent::Client(frame) => self.on_client_message(frame),
            SessionEvent::ClientClosed => {
                self.on_client_close();
                return ControlFlow::Break(());
            }
            SessionEvent::Shutdown => {
                self.on_shutdown();
                return ControlFlow::Break(());
            }
            SessionEvent::ConnectFinished { attempt, result } => {
                self.on_connect_finished(attempt, result)
            }
            SessionEvent::Upstream(event) => self.on_upstream_event(event),
        }
        ControlFlow::Continue(())
    }

    pub fn on_client_message(&mut self, frame: Frame) {
        if self.state != ConnectState::Open {
            self.enqueue(frame);
            return;
        }
        let len = frame.len();
        let sent = match self.upstream.as_ref() {
            Some(upstream) => upstream.send(frame),
            None => Err(UpstreamSendError::Stopped(frame)),
        };
        match sent {
            Ok(()) => self.ctx.stats.on_to_upstream(len),
            Err(err) => {
                debug!(session_id = %self.id(), error = %err, "upstream stopped while open");
                self.settle_stopped_upstream();
                self.enqueue(err.into_frame());
            }
        }
    }

    /// The upstream pump is gone. It queues its last frames and the reason it
    /// stopped before dropping its command channel, so read them now and
    /// report an error to the client before any reconnect.
    fn settle_stopped_upstream(&mut self) {
        let mut failure = None;
        while let Some(event) = self.upstream.as_mut().and_then(UpstreamHandle::try_next_event) {
            match event {
                UpstreamEvent::Message(frame) => self.on_upstream_message(frame),
                UpstreamEvent::Error(reason) => {
                    failure = Some(reason);
                    break;
                }
                UpstreamEvent::Closed => break,
            }
        }
        match failure {
            Some(reason) => self.on_upstream_error(reason),
            None => self.on_upstream_closed(),
        }
    }

    fn enqueue(&mut self, frame: Frame) {
        if let Some(limit) = self.ctx.settings.max_pending {
            if self.pending.len() >= limit {
                warn!(session_id = %self.id(), limit, "pending queue full, rejecting frame");
                self.ctx.stats.on_dropped(1);
                self.notify_client(&RelayError::QueueFull { limit });
                return;
            }
        }
        self.pending.push_back(frame);

        if self.state == ConnectState::Closed {
            debug!(session_id = %self.id(), "new traffic after close, retrying upstream");
            self.state = ConnectState::Idle;
        }
        if self.state == ConnectState::Idle {
            self.start_connect();
        }
    }

    fn start_connect(&mut self) {
        self.attempt += 1;
        self.state = ConnectState::Connecting;
        self.ctx.stats.on_connect_attempt();

        let attempt = self.attempt;
        let connector = self.ctx.connector.clone();
        let timeout = self.ctx.settings.connect_timeout;
        let session = self.handle.clone();
        info!(session_id = %self.id(), attempt, "connecting upstream");
        tokio::spawn(async move {
            let result = connect_with_timeout(&*connector, timeout).await;
            // If the session already ended the result is dropped here, which
            // closes any upstream that did open.
            session.send(SessionEvent::ConnectFinished { attempt, result });
        });
    }

    fn on_connect_finished(&mut self, attempt: u64, result: Result<UpstreamHandle, ConnectError>) {
        if attempt != self.attempt || self.state != ConnectState::Connecting {
            debug!(
                session_id = %self.id(),
                attempt,
                state = self.state.as_str(),
                "discarding stale connect result"
            );
            return;
        }
        match result {
            Ok(upstream) => self.on_connect_succeeded(upstream),
            Err(err) => self.on_connect_failed(err),
        }
    }

    pub fn on_connect_succeeded(&mut self, mut upstream: UpstreamHandle) {
        let flushed = self.pending.len();
        while let Some(frame) = self.pending.pop_front() {
            let len = frame.len();
            if let Err(err) = upstream.send(frame) {
                let err = RelayError::from(err);
                let dropped = self.pending.len() + 1;
                self.pending.clear();
                self.ctx.stats.on_dropped(dropped);
                warn!(
                    session_id = %self.id(),
                    error = %err,
                    dropped,
                    "upstream stopped while flushing queue"
                );
                upstream.close();
                self.state = ConnectState::Closed;
                self.notify_client(&err);
                return;
            }
            self.ctx.stats.on_to_upstream(len);
        }

        self.upstream = Some(upstream);
        self.state = ConnectState::Open;
        info!(session_id = %self.id(), attempt = self.attempt, flushed, "upstream open");
    }

    pub fn on_connect_failed(&mut self, err: ConnectError) {
        // Queued frames are not replayed; the client decides whether to resend.
        let dropped = self.pending.len();
        self.pending.clear();
        self.state = ConnectState::Closed;
        self.ctx.stats.on_connect_failure(&err);
        self.ctx.stats.on_dropped(dropped);
        warn!(
            session_id = %self.id(),
            attempt = self.attempt,
            error = %err,
            dropped,
            "upstream connect failed"
        );
        self.notify_client(&RelayError::from(err));
    }

    fn on_upstream_event(&mut self, event: UpstreamEvent) {
        match event {
            UpstreamEvent::Message(frame) => self.on_upstream_message(frame),
            UpstreamEvent::Error(reason) => self.on_upstream_error(reason),
            UpstreamEvent::Closed => self.on_upstream_closed(),
        }
    }

    pub fn on_upstream_message(&mut self, frame: Frame) {
        let len = frame.len();
        if self.client.send(frame) {
            self.ctx.stats.on_to_client(len);
        } else {
            self.ctx.stats.on_dropped(1);
            debug!(session_id = %self.id(), "client gone, dropping upstream frame");
        }
    }

    pub fn on_upstream_error(&mut self, reason: String) {
        warn!(session_id = %self.id(), error = %reason, "upstream error");
        self.release_upstream();
        self.state = ConnectState::Closed;
        self.ctx.stats.on_upstream_error(&reason);
        self.notify_client(&RelayError::UpstreamRuntime(reason));
    }

    pub fn on_upstream_closed(&mut self) {
        info!(session_id = %self.id(), "upstream closed");
        self.release_upstream();
        self.state = ConnectState::Closed;
    }

    pub fn on_client_close(&mut self) {
        info!(session_id = %self.id(), state = self.state.as_str(), "client disconnected");
        self.teardown();
    }

    pub fn on_shutdown(&mut self) {
        info!(session_id = %self.id(), "closing session for shutdown");
        self.teardown();
    }

    fn teardown(&mut self) {
        self.release_upstream();
        self.ctx.stats.on_dropped(self.pending.len());
        self.pending.clear();
        self.state = ConnectState::Closed;
        self.ctx.registry.remove(self.handle.id());
    }

    fn release_upstream(&mut self) {
        if let Some(mut upstream) = self.upstream.take() {
            upstream.close();
        }
    }

    fn notify_client(&self, err: &RelayError) {
        let frame = ErrorPayload::new(err.client_message()).to_frame();
        if !self.client.send(frame) {
            debug!(session_id = %self.id(), error = %err, "client gone, error not delivered");
        }
    }
}

/// Pends forever while no upstream is open. A pump that vanished without a
/// final event counts as a clean close.
async fn next_upstream_event(upstream: Option<&mut UpstreamHandle>) -> UpstreamEvent {
    match upstream {
        Some(upstream) => upstream
            .next_event()
            .await
            .unwrap_or(UpstreamEvent::Closed),
        None => std::future::pending().await,
    }
}
