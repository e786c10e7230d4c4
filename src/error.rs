use std::time::Duration;

use thiserror::Error;

use crate::registry::SessionId;
use crate::wsproto::Frame;

/// Failure to open an upstream connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("upstream did not open within {0:?}")]
    Timeout(Duration),
    #[error("upstream refused connection: {0}")]
    Refused(String),
}

/// A frame that could not be handed to the upstream, returned to the caller.
#[derive(Debug, Error)]
pub enum UpstreamSendError {
    #[error("send on a closed upstream handle")]
    Closed(Frame),
    #[error("upstream task has stopped")]
    Stopped(Frame),
}

impl UpstreamSendError {
    pub fn into_frame(self) -> Frame {
        match self {
            UpstreamSendError::Closed(frame) | UpstreamSendError::Stopped(frame) => frame,
        }
    }
}

/// Everything a session can report back to its client.
///
/// None of these ever escape a session: they are logged and turned into a
/// single `{"error": ...}` frame for the affected client.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("upstream connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("upstream connect refused: {0}")]
    ConnectRefused(String),
    #[error("upstream runtime error: {0}")]
    UpstreamRuntime(String),
    #[error("client handling error: {0}")]
    ClientHandling(String),
    #[error("session {0} is already registered")]
    DuplicateSession(SessionId),
    #[error("pending queue is full ({limit} messages)")]
    QueueFull { limit: usize },
}

impl RelayError {
    /// Human-readable text placed in the client-visible error payload.
    pub fn client_message(&self) -> &'static str {
        match self {
            RelayError::ConnectTimeout(_) | RelayError::ConnectRefused(_) => {
                "Failed to connect to upstream service"
            }
            RelayError::UpstreamRuntime(_) => "Upstream connection error",
            RelayError::ClientHandling(_) | RelayError::DuplicateSession(_) => {
                "Failed to process request"
            }
            RelayError::QueueFull { .. } => "Pending message queue is full",
        }
    }
}

impl From<ConnectError> for RelayError {
    fn from(err: ConnectError) -> Self {
        match err {
            ConnectError::Timeout(after) => RelayError::ConnectTimeout(after),
            ConnectError::Refused(reason) => RelayError::ConnectRefused(reason),
        }
    }
}

impl From<UpstreamSendError> for RelayError {
    fn from(err: UpstreamSendError) -> Self {
        match err {
            UpstreamSendError::Closed(_) => RelayError::ClientHandling(err.to_string()),
            UpstreamSendError::Stopped(_) => RelayError::UpstreamRuntime(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_errors_map_to_one_client_message() {
        let timeout: RelayError = ConnectError::Timeout(Duration::from_secs(10)).into();
        let refused: RelayError = ConnectError::Refused("tcp reset".into()).into();
        assert!(matches!(timeout, RelayError::ConnectTimeout(_)));
        assert!(matches!(refused, RelayError::ConnectRefused(_)));
        assert_eq!(timeout.client_message(), refused.client_message());
        assert_eq!(
            timeout.client_message(),
            "Failed to connect to upstream service"
        );
    }

    #[test]
    fn failed_send_gives_the_frame_back() {
        let err = UpstreamSendError::Stopped(Frame::Text("B".into()));
        assert_eq!(
            RelayError::from(UpstreamSendError::Stopped(Frame::Text("B".into()))).client_message(),
            "Upstream connection error"
        );
        assert_eq!(err.into_frame(), Frame::Text("B".into()));
    }

    #[test]
    fn client_message_never_leaks_internal_detail() {
        let err = RelayError::UpstreamRuntime("socket reset by 10.0.0.7".into());
        assert!(err.to_string().contains("10.0.0.7"));
        assert!(!err.client_message().contains("10.0.0.7"));
    }
}
