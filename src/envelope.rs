//! The per-call envelope: deadline, cancellation, metadata.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::frame::NO_DEADLINE;
use crate::status::Status;

/// Per-call context threaded through every operation of a call.
///
/// Created by the caller, observed by the handler for the call's duration,
/// discarded when the call terminates. Clones share the cancellation token;
/// cancellation is monotone and settable exactly once.
#[derive(Debug, Clone)]
pub struct CallEnvelope {
    deadline: Option<Instant>,
    cancel: CancellationToken,
    metadata: HashMap<String, String>,
}

impl CallEnvelope {
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    pub(crate) fn with_token(cancel: CancellationToken) -> Self {
        Self {
            deadline: None,
            cancel,
            metadata: HashMap::new(),
        }
    }

    pub fn set_deadline(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.deadline = Some(Instant::now() + timeout);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub fn insert_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// Abort the call. Any suspended send or receive on the call unblocks
    /// with a `Cancelled` outcome within one scheduling step.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Gate applied before every outbound message.
    pub fn check(&self) -> Result<(), Status> {
        if self.cancel.is_cancelled() {
            return Err(Status::cancelled("call was cancelled"));
        }
        if self.is_expired() {
            return Err(Status::deadline_exceeded("deadline elapsed"));
        }
        Ok(())
    }

    /// Resolves once the call is aborted, with the matching status.
    ///
    /// Deadline expiry and explicit cancellation unblock identically but are
    /// never conflated: each produces its own code.
    pub async fn aborted(&self) -> Status {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.cancel.cancelled() => Status::cancelled("call was cancelled"),
                _ = tokio::time::sleep_until(deadline) => {
                    Status::deadline_exceeded("deadline elapsed")
                }
            },
            None => {
                self.cancel.cancelled().await;
                Status::cancelled("call was cancelled")
            }
        }
    }

    /// Deadline as absolute unix nanoseconds for the OPEN frame.
    pub(crate) fn wire_deadline(&self) -> u64 {
        match self.deadline {
            None => NO_DEADLINE,
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let unix_now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default();
                let ns = (unix_now + remaining).as_nanos();
                ns.min(u128::from(NO_DEADLINE - 1)) as u64
            }
        }
    }

    /// Reconstruct a local deadline from the wire value. An already-elapsed
    /// deadline yields an instant in the past-equivalent (now), so the call
    /// aborts on its first suspension point.
    pub(crate) fn deadline_from_wire(deadline_ns: u64) -> Option<Instant> {
        if deadline_ns == NO_DEADLINE {
            return None;
        }
        let unix_now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let remaining = Duration::from_nanos(deadline_ns).saturating_sub(unix_now);
        Some(Instant::now() + remaining)
    }

    pub(crate) fn wire_metadata(&self) -> Vec<(String, String)> {
        self.metadata
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl Default for CallEnvelope {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusCode;

    #[test]
    fn check_distinguishes_cancel_from_deadline() {
        let mut envelope = CallEnvelope::new();
        assert!(envelope.check().is_ok());

        envelope.set_deadline(Instant::now() - Duration::from_millis(1));
        assert_eq!(
            envelope.check().unwrap_err().code,
            StatusCode::DeadlineExceeded
        );

        let envelope = CallEnvelope::new();
        envelope.cancel();
        assert_eq!(envelope.check().unwrap_err().code, StatusCode::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_resolves_on_deadline() {
        let mut envelope = CallEnvelope::new();
        envelope.set_timeout(Duration::from_millis(50));
        let status = envelope.aborted().await;
        assert_eq!(status.code, StatusCode::DeadlineExceeded);
    }

    #[tokio::test]
    async fn aborted_resolves_on_cancel() {
        let envelope = CallEnvelope::new();
        let watcher = envelope.clone();
        let handle = tokio::spawn(async move { watcher.aborted().await });
        envelope.cancel();
        let status = handle.await.unwrap();
        assert_eq!(status.code, StatusCode::Cancelled);
    }

    #[test]
    fn wire_deadline_round_trips_approximately() {
        let mut envelope = CallEnvelope::new();
        envelope.set_timeout(Duration::from_secs(5));
        let wire = envelope.wire_deadline();
        let restored = CallEnvelope::deadline_from_wire(wire).unwrap();
        let remaining = restored.saturating_duration_since(Instant::now());
        assert!(remaining > Duration::from_secs(4));
        assert!(remaining <= Duration::from_secs(5));
        assert_eq!(CallEnvelope::deadline_from_wire(NO_DEADLINE), None);
    }
}
