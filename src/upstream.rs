//! Outbound connections to the streaming backend.
//!
//! A [`Connector`] opens one upstream per session and hands back an
//! [`UpstreamHandle`]. Frames received from the upstream are not delivered
//! through callbacks: they are queued on the handle's event channel, which the
//! owning session polls alongside its own events.

use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::{Message, WebSocketConfig};
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use crate::error::{ConnectError, UpstreamSendError};
use crate::wsproto::{Frame, WS_MAX_MESSAGE_BYTES};

/// Query parameter that carries the backend credential.
pub const API_KEY_PARAM: &str = "key";

/// Something the upstream reported after the connection opened.
#[derive(Debug)]
pub enum UpstreamEvent {
    Message(Frame),
    Error(String),
    Closed,
}

/// Command for the task that owns the upstream socket.
#[derive(Debug)]
pub enum Outbound {
    Frame(Frame),
    Close,
}

/// Opens upstream connections. Implemented by [`WsConnector`] in production
/// and by a scripted fake in tests.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'static, Result<UpstreamHandle, ConnectError>>;
}

/// Run `connector.connect()` but give up after `timeout`.
///
/// On timeout the in-flight attempt is dropped, so an acknowledgment that
/// arrives later can never surface.
pub async fn connect_with_timeout(
    connector: &dyn Connector,
    timeout: Duration,
) -> Result<UpstreamHandle, ConnectError> {
    match tokio::time::timeout(timeout, connector.connect()).await {
        Ok(result) => result,
        Err(_) => Err(ConnectError::Timeout(timeout)),
    }
}

/// Owned end of one upstream connection.
///
/// Closing is idempotent and dropping the handle closes the connection.
#[derive(Debug)]
pub struct UpstreamHandle {
    outbound: mpsc::UnboundedSender<Outbound>,
    events: mpsc::UnboundedReceiver<UpstreamEvent>,
    closed: bool,
}

impl UpstreamHandle {
    pub fn new(
        outbound: mpsc::UnboundedSender<Outbound>,
        events: mpsc::UnboundedReceiver<UpstreamEvent>,
    ) -> Self {
        Self {
            outbound,
            events,
            closed: false,
        }
    }

    pub fn send(&self, frame: Frame) -> Result<(), UpstreamSendError> {
        if self.closed {
            return Err(UpstreamSendError::Closed(frame));
        }
        match self.outbound.send(Outbound::Frame(frame)) {
            Err(mpsc::error::SendError(Outbound::Frame(frame))) => {
                Err(UpstreamSendError::Stopped(frame))
            }
            _ => Ok(()),
        }
    }

    /// Next event from the upstream. `None` once the pump is gone and every
    /// event it queued has been read.
    pub async fn next_event(&mut self) -> Option<UpstreamEvent> {
        self.events.recv().await
    }

    /// Next event the pump has already queued, without waiting.
    pub fn try_next_event(&mut self) -> Option<UpstreamEvent> {
        self.events.try_recv().ok()
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.outbound.send(Outbound::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.closed || self.outbound.is_closed()
    }
}

impl Drop for UpstreamHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Production connector: one WebSocket per session to a fixed endpoint.
pub struct WsConnector {
    endpoint: Url,
    secret: String,
}

impl WsConnector {
    /// `base` is the upstream WebSocket URL; `api_key` is appended as the
    /// `key` query parameter.
    pub fn new(base: &Url, api_key: &str) -> Self {
        let mut endpoint = base.clone();
        endpoint.query_pairs_mut().append_pair(API_KEY_PARAM, api_key);
        Self {
            endpoint,
            secret: api_key.to_string(),
        }
    }

    /// Endpoint with the credential masked, safe for logs.
    pub fn redacted_endpoint(&self) -> String {
        redact(self.endpoint.as_str(), &self.secret)
    }
}

impl Connector for WsConnector {
    fn connect(&self) -> BoxFuture<'static, Result<UpstreamHandle, ConnectError>> {
        let endpoint = self.endpoint.to_string();
        let secret = self.secret.clone();
        Box::pin(async move {
            let config = WebSocketConfig {
                max_message_size: Some(WS_MAX_MESSAGE_BYTES),
                max_frame_size: Some(WS_MAX_MESSAGE_BYTES),
                ..Default::default()
            };
            let (stream, _response) =
                connect_async_with_config(endpoint.as_str(), Some(config), false)
                    .await
                    .map_err(|err| ConnectError::Refused(redact(&err.to_string(), &secret)))?;

            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            tokio::spawn(pump(stream, outbound_rx, events_tx, secret));
            Ok(UpstreamHandle::new(outbound_tx, events_rx))
        })
    }
}

/// Owns the upstream socket: writes queued frames, reads upstream frames into
/// the event channel, and stops on close, error, or when the handle is gone.
async fn pump(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<UpstreamEvent>,
    secret: String,
) {
    let (mut write, mut read) = stream.split();
    loop {
        tokio::select! {
            cmd = outbound.recv() => match cmd {
                Some(Outbound::Frame(frame)) => {
                    if let Err(err) = write.send(Message::from(frame)).await {
                        let reason = redact(&err.to_string(), &secret);
                        warn!(error = %reason, "upstream write failed");
                        let _ = events.send(UpstreamEvent::Error(reason));
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    debug!("closing upstream connection");
                    let _ = write.close().await;
                    break;
                }
            },
            msg = read.next() => match msg {
                Some(Ok(msg)) if msg.is_close() => {
                    let _ = events.send(UpstreamEvent::Closed);
                    break;
                }
                Some(Ok(msg)) => {
                    if let Some(frame) = Frame::from_upstream(msg) {
                        if events.send(UpstreamEvent::Message(frame)).is_err() {
                            let _ = write.close().await;
                            break;
                        }
                    }
                }
                Some(Err(err)) => {
                    let reason = redact(&err.to_string(), &secret);
                    let _ = events.send(UpstreamEvent::Error(reason));
                    break;
                }
                None => {
                    let _ = events.send(UpstreamEvent::Closed);
                    break;
                }
            },
        }
    }
}

/// Mask the credential in `text`, in both raw and query-encoded form.
fn redact(text: &str, secret: &str) -> String {
    if secret.is_empty() {
        return text.to_string();
    }
    let encoded: String = url::form_urlencoded::byte_serialize(secret.as_bytes()).collect();
    text.replace(secret, "[redacted]")
        .replace(&encoded, "[redacted]")
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted connector: every `connect` call parks until the test decides
    //! whether it opens or fails.

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use futures_util::future::BoxFuture;
    use tokio::sync::{mpsc, oneshot};

    use super::{Connector, Outbound, UpstreamEvent, UpstreamHandle};
    use crate::error::ConnectError;
    use crate::wsproto::Frame;

    pub struct MockConnector {
        calls: AtomicUsize,
        attempts: mpsc::UnboundedSender<MockUpstream>,
    }

    impl MockConnector {
        pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockUpstream>) {
            let (attempts, rx) = mpsc::unbounded_channel();
            let connector = Arc::new(Self {
                calls: AtomicUsize::new(0),
                attempts,
            });
            (connector, rx)
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Connector for MockConnector {
        fn connect(&self) -> BoxFuture<'static, Result<UpstreamHandle, ConnectError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let (gate_tx, gate_rx) = oneshot::channel();
            let _ = self.attempts.send(MockUpstream {
                gate: Some(gate_tx),
                sent: outbound_rx,
                events: events_tx,
            });
            Box::pin(async move {
                match gate_rx.await {
                    Ok(Ok(())) => Ok(UpstreamHandle::new(outbound_tx, events_rx)),
                    Ok(Err(err)) => Err(err),
                    Err(_) => Err(ConnectError::Refused("mock attempt dropped".into())),
                }
            })
        }
    }

    /// The test's end of one connect attempt.
    pub struct MockUpstream {
        gate: Option<oneshot::Sender<Result<(), ConnectError>>>,
        pub sent: mpsc::UnboundedReceiver<Outbound>,
        pub events: mpsc::UnboundedSender<UpstreamEvent>,
    }

    impl MockUpstream {
        /// Acknowledge the open. Returns false if the attempt was abandoned.
        pub fn open(&mut self) -> bool {
            self.resolve(Ok(()))
        }

        pub fn fail(&mut self, err: ConnectError) -> bool {
            self.resolve(Err(err))
        }

        fn resolve(&mut self, result: Result<(), ConnectError>) -> bool {
            match self.gate.take() {
                Some(gate) => gate.send(result).is_ok(),
                None => false,
            }
        }

        pub fn push(&self, frame: Frame) {
            let _ = self.events.send(UpstreamEvent::Message(frame));
        }

        pub fn error(&self, reason: &str) {
            let _ = self.events.send(UpstreamEvent::Error(reason.to_string()));
        }

        pub fn closed(&self) {
            let _ = self.events.send(UpstreamEvent::Closed);
        }

        /// Everything the relay has sent so far, without waiting.
        pub fn drain_sent(&mut self) -> Vec<Outbound> {
            let mut out = Vec::new();
            while let Ok(cmd) = self.sent.try_recv() {
                out.push(cmd);
            }
            out
        }

        pub fn sent_frames(&mut self) -> Vec<Frame> {
            self.drain_sent()
                .into_iter()
                .filter_map(|cmd| match cmd {
                    Outbound::Frame(frame) => Some(frame),
                    Outbound::Close => None,
                })
                .collect()
        }
    }
}
