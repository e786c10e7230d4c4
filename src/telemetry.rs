use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

/// Relay-wide counters, shared by every session.
#[derive(Default)]
pub struct RelayStats {
    sessions_opened: AtomicU64,
    frames_to_upstream: AtomicU64,
    bytes_to_upstream: AtomicU64,
    frames_to_client: AtomicU64,
    bytes_to_client: AtomicU64,
    frames_dropped: AtomicU64,
    connect_attempts: AtomicU64,
    connect_failures: AtomicU64,
    upstream_errors: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl RelayStats {
    pub fn on_session_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_to_upstream(&self, bytes: usize) {
        self.frames_to_upstream.fetch_add(1, Ordering::Relaxed);
        self.bytes_to_upstream
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn on_to_client(&self, bytes: usize) {
        self.frames_to_client.fetch_add(1, Ordering::Relaxed);
        self.bytes_to_client.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn on_dropped(&self, frames: usize) {
        if frames == 0 {
            return;
        }
        self.frames_dropped
            .fetch_add(frames as u64, Ordering::Relaxed);
    }

    pub fn on_connect_attempt(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_connect_failure(&self, err: impl ToString) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
        self.set_last_error(err);
    }

    pub fn on_upstream_error(&self, err: impl ToString) {
        self.upstream_errors.fetch_add(1, Ordering::Relaxed);
        self.set_last_error(err);
    }

    pub fn set_last_error(&self, err: impl ToString) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.to_string());
        }
    }

    pub fn snapshot(&self) -> RelayStatsSnapshot {
        let last_error = self
            .last_error
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
            .unwrap_or_default();
        RelayStatsSnapshot {
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            frames_to_upstream: self.frames_to_upstream.load(Ordering::Relaxed),
            bytes_to_upstream: self.bytes_to_upstream.load(Ordering::Relaxed),
            frames_to_client: self.frames_to_client.load(Ordering::Relaxed),
            bytes_to_client: self.bytes_to_client.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            upstream_errors: self.upstream_errors.load(Ordering::Relaxed),
            last_error,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RelayStatsSnapshot {
    pub sessions_opened: u64,
    pub frames_to_upstream: u64,
    pub bytes_to_upstream: u64,
    pub frames_to_client: u64,
    pub bytes_to_client: u64,
    pub frames_dropped: u64,
    pub connect_attempts: u64,
    pub connect_failures: u64,
    pub upstream_errors: u64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_error: String,
}
