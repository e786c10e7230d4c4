//! Inbound WebSocket server.
//!
//! Each accepted client socket is registered as a session and split in two:
//! a reader loop that turns client frames into [`SessionEvent`]s, and a writer
//! task that drains the session's [`ClientSink`]. Everything in between is the
//! session's business.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::ws::{Message as ClientMessage, WebSocket, WebSocketUpgrade},
    extract::{ConnectInfo, State},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::RelayError;
use crate::registry::{SessionHandle, SessionId, SessionRegistry};
use crate::session::{ClientSink, Session, SessionContext, SessionEvent};
use crate::telemetry::{RelayStats, RelayStatsSnapshot};
use crate::wsproto::{ErrorPayload, Frame, WS_MAX_MESSAGE_BYTES};

/// Fresh ids tried before a client is told registration failed.
const MAX_ID_ATTEMPTS: usize = 3;

pub struct RelayState {
    ctx: SessionContext,
    /// Upstream endpoint with the api key already redacted.
    upstream: String,
    started_at: DateTime<Utc>,
}

impl RelayState {
    pub fn new(ctx: SessionContext, upstream: impl Into<String>) -> Self {
        Self {
            ctx,
            upstream: upstream.into(),
            started_at: Utc::now(),
        }
    }

    pub fn stats(&self) -> &Arc<RelayStats> {
        &self.ctx.stats
    }
}

// SessionContext holds a trait object; only show what is safe to log.
impl std::fmt::Debug for RelayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayState")
            .field("upstream", &self.upstream)
            .field("sessions", &self.ctx.registry.len())
            .finish()
    }
}

#[derive(Debug)]
pub struct RelayServer {
    state: Arc<RelayState>,
    bound_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl RelayServer {
    /// Bind `addr` and serve until `shutdown` is notified.
    ///
    /// The listener is bound before this returns, so `bound_addr` is usable
    /// immediately (port 0 resolves to the port the OS picked). On shutdown
    /// every live session is told to close its upstream.
    pub async fn start(
        addr: &str,
        state: RelayState,
        shutdown: Arc<Notify>,
    ) -> anyhow::Result<RelayServer> {
        let requested: SocketAddr = addr.parse().with_context(|| {
            format!("invalid listen address '{addr}' (use numeric IP, not hostname like 'localhost')")
        })?;
        let listener = TcpListener::bind(requested)
            .await
            .with_context(|| format!("bind {requested}"))?;
        let bound_addr = listener.local_addr()?;

        let state = Arc::new(state);
        let app = router(state.clone());
        let registry = state.ctx.registry.clone();
        let task = tokio::spawn(async move {
            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                shutdown.notified().await;
                registry.shutdown_all();
            })
            .await;
            if let Err(err) = result {
                error!(error = %err, "relay server error");
            }
            info!("relay server stopped");
        });

        info!(addr = %bound_addr, upstream = %state.upstream, "relay listening");
        Ok(RelayServer {
            state,
            bound_addr,
            task,
        })
    }

    pub fn bound_addr(&self) -> SocketAddr {
        self.bound_addr
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.state.ctx.registry
    }

    pub fn stats(&self) -> RelayStatsSnapshot {
        self.state.ctx.stats.snapshot()
    }

    /// Wait for the accept loop to finish after shutdown.
    pub async fn wait(self) {
        if let Err(err) = self.task.await {
            error!(error = %err, "relay server task failed");
        }
    }
}

pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/", get(relay_upgrade))
        .route("/healthz", get(healthz))
        .route("/v1/status", get(status))
        .with_state(state)
}

async fn relay_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    ws.max_message_size(WS_MAX_MESSAGE_BYTES)
        .on_upgrade(move |socket| relay_socket(socket, state, peer))
}

async fn relay_socket(socket: WebSocket, state: Arc<RelayState>, peer: SocketAddr) {
    let (mut write, mut read) = socket.split();

    let (handle, events) = match register_session(&state.ctx.registry, peer) {
        Ok(registered) => registered,
        Err(err) => {
            error!(peer = %peer, error = %err, "session registration failed");
            let frame = ErrorPayload::new(err.client_message()).to_frame();
            let _ = write.send(ClientMessage::from(frame)).await;
            let _ = write.close().await;
            return;
        }
    };

    let (client, mut client_rx) = ClientSink::channel();
    let session = Session::new(handle.clone(), client, state.ctx.clone());
    let session_task = tokio::spawn(session.run(events));

    let writer_id = handle.id().clone();
    tokio::spawn(async move {
        while let Some(frame) = client_rx.recv().await {
            if let Err(err) = write.send(ClientMessage::from(frame)).await {
                debug!(session_id = %writer_id, error = %err, "client write failed");
                break;
            }
        }
        let _ = write.close().await;
    });

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(ClientMessage::Close(_))) | None => break,
                Some(Ok(msg)) => {
                    if let Some(frame) = Frame::from_client(msg) {
                        if !handle.client_message(frame) {
                            break;
                        }
                    }
                }
                Some(Err(err)) => {
                    debug!(session_id = %handle.id(), error = %err, "client read failed");
                    break;
                }
            },
            _ = handle.closed() => break,
        }
    }

    handle.client_closed();
    if let Err(err) = session_task.await {
        error!(session_id = %handle.id(), error = %err, "session task failed");
        state.ctx.registry.remove(handle.id());
    }
    info!(session_id = %handle.id(), peer = %peer, "client disconnected");
}

/// Register under a fresh id, retrying a few times on collision.
fn register_session(
    registry: &SessionRegistry,
    peer: SocketAddr,
) -> Result<(SessionHandle, mpsc::UnboundedReceiver<SessionEvent>), RelayError> {
    let mut tries = 0;
    loop {
        tries += 1;
        match registry.create(SessionId::generate(), Some(peer)) {
            Ok(registered) => return Ok(registered),
            Err(err) if tries < MAX_ID_ATTEMPTS => {
                warn!(peer = %peer, error = %err, "session id collision, regenerating");
            }
            Err(err) => return Err(err),
        }
    }
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Serialize)]
struct StatusResponse {
    status: String,
    #[serde(rename = "ts")]
    timestamp: String,
    version: String,
    upstream: String,
    started_at: String,
    sessions: SessionsInfo,
    runtime: RelayStatsSnapshot,
}

#[derive(Serialize)]
struct SessionsInfo {
    active: usize,
    open: Vec<SessionSummary>,
}

#[derive(Serialize)]
struct SessionSummary {
    id: SessionId,
    peer: Option<String>,
    opened_at: String,
}

impl From<&SessionHandle> for SessionSummary {
    fn from(handle: &SessionHandle) -> Self {
        Self {
            id: handle.id().clone(),
            peer: handle.peer().map(|peer| peer.to_string()),
            opened_at: handle.opened_at().to_rfc3339(),
        }
    }
}

async fn status(State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    let mut open: Vec<SessionSummary> = state
        .ctx
        .registry
        .handles()
        .iter()
        .map(SessionSummary::from)
        .collect();
    open.sort_by(|a, b| a.opened_at.cmp(&b.opened_at));
    Json(StatusResponse {
        status: "ok".to_string(),
        timestamp: Utc::now().to_rfc3339(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        upstream: state.upstream.clone(),
        started_at: state.started_at.to_rfc3339(),
        sessions: SessionsInfo {
            active: open.len(),
            open,
        },
        runtime: state.ctx.stats.snapshot(),
    })
}
