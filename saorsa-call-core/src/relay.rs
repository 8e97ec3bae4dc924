//! Signal relay
//!
//! The relay is a durable, call-keyed, append-only log. Every frame sent for
//! a call is appended and fanned out to that call's subscribers; a new
//! subscriber first receives the whole log in append order, then live
//! appends. Ordering is per call, delivery is at-least-once, so consumers
//! dedupe by sequence number.
//!
//! The relay itself never retries. [`RelayClient`] is the caller-side
//! wrapper that encodes negotiation messages and retries
//! [`RelayError::Unavailable`] with exponential backoff until a deadline.

use crate::identity::PeerIdentity;
use crate::signaling::NegotiationMessage;
use crate::types::{CallId, ConfigError};
use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Relay errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Relay could not be reached
    #[error("Relay unavailable: {0}")]
    Unavailable(String),

    /// Delivery for this call was stopped
    #[error("Relay log closed for call {0}")]
    CallClosed(CallId),

    /// Frame could not be encoded
    #[error("Relay encode error: {0}")]
    Encode(String),
}

/// One frame delivered from a call's log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEnvelope {
    /// Call the frame belongs to
    pub call_id: CallId,
    /// Position in the call's log, starting at 0
    pub offset: u64,
    /// Encoded negotiation message
    pub frame: Bytes,
}

/// Stream of envelopes for one call; ends when the call's log is closed
pub type RelaySubscription = UnboundedReceiverStream<RelayEnvelope>;

/// Relay transport trait
///
/// Implement this for your specific relay (hosted realtime channel,
/// websocket fan-out, DHT, ...).
#[async_trait]
pub trait SignalRelay: Send + Sync + 'static {
    /// Append a frame to the call's log and fan it out
    ///
    /// Returns the frame's offset in the log.
    async fn send(&self, call_id: CallId, frame: Bytes) -> Result<u64, RelayError>;

    /// Subscribe to a call's log from the beginning
    async fn subscribe(&self, call_id: CallId) -> Result<RelaySubscription, RelayError>;

    /// Stop delivering messages for a call
    async fn close(&self, call_id: CallId) -> Result<(), RelayError>;
}

/// Backoff policy for relay sends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// First backoff after a failed attempt
    pub initial_backoff_ms: u64,
    /// Backoff ceiling
    pub max_backoff_ms: u64,
    /// Give up once this much time has passed since the first attempt
    pub deadline_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 100,
            max_backoff_ms: 2_000,
            deadline_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt `attempt + 1` (attempt counts from 1)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .initial_backoff_ms
            .saturating_mul(1u64 << attempt.saturating_sub(1).min(16));
        Duration::from_millis(exp.min(self.max_backoff_ms))
    }

    /// Overall deadline
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    /// Check the policy is usable
    ///
    /// # Errors
    ///
    /// Returns error if a backoff is zero or the ceiling is below the
    /// initial backoff.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_backoff_ms == 0 || self.deadline_ms == 0 {
            return Err(ConfigError::Invalid(
                "retry backoff and deadline must be positive".to_string(),
            ));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(ConfigError::Invalid(format!(
                "max_backoff_ms ({}) below initial_backoff_ms ({})",
                self.max_backoff_ms, self.initial_backoff_ms
            )));
        }
        Ok(())
    }
}

/// Caller-side relay wrapper with encoding and retry
pub struct RelayClient {
    relay: Arc<dyn SignalRelay>,
    policy: RetryPolicy,
}

impl Clone for RelayClient {
    fn clone(&self) -> Self {
        Self {
            relay: Arc::clone(&self.relay),
            policy: self.policy.clone(),
        }
    }
}

impl RelayClient {
    /// Create a client over `relay`
    pub fn new(relay: Arc<dyn SignalRelay>, policy: RetryPolicy) -> Self {
        Self { relay, policy }
    }

    /// Underlying relay
    pub fn relay(&self) -> &Arc<dyn SignalRelay> {
        &self.relay
    }

    /// Send a negotiation message, retrying while the relay is unavailable
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` once the deadline passes, `CallClosed`
    /// immediately, `Encode` if the message cannot be serialized.
    #[tracing::instrument(
        skip(self, message),
        fields(call_id = %message.call_id, kind = %message.kind, seq = message.seq)
    )]
    pub async fn send<I: PeerIdentity>(
        &self,
        message: &NegotiationMessage<I>,
    ) -> Result<u64, RelayError> {
        let frame = message
            .encode()
            .map_err(|e| RelayError::Encode(e.to_string()))?;
        let offset = self
            .with_retry(|| self.relay.send(message.call_id, frame.clone()))
            .await?;
        tracing::trace!(offset, "Negotiation message appended");
        Ok(offset)
    }

    /// Subscribe to a call's log, retrying while the relay is unavailable
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` once the deadline passes.
    #[tracing::instrument(skip(self))]
    pub async fn subscribe(&self, call_id: CallId) -> Result<RelaySubscription, RelayError> {
        self.with_retry(|| self.relay.subscribe(call_id)).await
    }

    async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T, RelayError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, RelayError>>,
    {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            match op().await {
                Err(RelayError::Unavailable(reason)) => {
                    let base = self.policy.backoff(attempt);
                    let jitter = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 4);
                    let backoff = base + Duration::from_millis(jitter);
                    if started.elapsed() + backoff > self.policy.deadline() {
                        tracing::warn!(attempt, %reason, "Relay retry deadline exceeded");
                        return Err(RelayError::Unavailable(reason));
                    }
                    tracing::warn!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        %reason,
                        "Relay unavailable, backing off"
                    );
                    sleep(backoff).await;
                }
                other => return other,
            }
        }
    }
}

#[cfg(feature = "simulation")]
pub use memory::InMemoryRelay;

#[cfg(feature = "simulation")]
mod memory {
    use super::{RelayEnvelope, RelayError, RelaySubscription, SignalRelay};
    use crate::types::CallId;
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    #[derive(Default)]
    struct CallLog {
        entries: Vec<Bytes>,
        subscribers: Vec<mpsc::UnboundedSender<RelayEnvelope>>,
        closed: bool,
    }

    /// In-process relay keeping every call's log in memory
    ///
    /// `set_available(false)` makes every operation fail with
    /// `Unavailable`; `with_duplicate_delivery()` delivers each live frame
    /// twice to exercise consumer idempotence.
    #[derive(Default)]
    pub struct InMemoryRelay {
        logs: Mutex<HashMap<CallId, CallLog>>,
        unavailable: AtomicBool,
        duplicate_delivery: bool,
    }

    impl InMemoryRelay {
        /// Empty relay
        pub fn new() -> Self {
            Self::default()
        }

        /// Relay that delivers every live frame twice
        #[must_use]
        pub fn with_duplicate_delivery() -> Self {
            Self {
                duplicate_delivery: true,
                ..Self::default()
            }
        }

        /// Simulate the relay going away or coming back
        pub fn set_available(&self, available: bool) {
            self.unavailable.store(!available, Ordering::SeqCst);
        }

        /// Frames appended for a call
        pub fn log(&self, call_id: CallId) -> Vec<Bytes> {
            self.logs
                .lock()
                .get(&call_id)
                .map(|log| log.entries.clone())
                .unwrap_or_default()
        }

        /// Whether delivery for a call has been stopped
        pub fn is_closed(&self, call_id: CallId) -> bool {
            self.logs
                .lock()
                .get(&call_id)
                .is_some_and(|log| log.closed)
        }

        fn check_available(&self) -> Result<(), RelayError> {
            if self.unavailable.load(Ordering::SeqCst) {
                Err(RelayError::Unavailable("relay offline".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl SignalRelay for InMemoryRelay {
        async fn send(&self, call_id: CallId, frame: Bytes) -> Result<u64, RelayError> {
            self.check_available()?;
            let mut logs = self.logs.lock();
            let log = logs.entry(call_id).or_default();
            if log.closed {
                return Err(RelayError::CallClosed(call_id));
            }

            let offset = log.entries.len() as u64;
            log.entries.push(frame.clone());
            let envelope = RelayEnvelope {
                call_id,
                offset,
                frame,
            };
            let copies = if self.duplicate_delivery { 2 } else { 1 };
            log.subscribers.retain(|tx| {
                (0..copies).all(|_| tx.send(envelope.clone()).is_ok())
            });
            Ok(offset)
        }

        async fn subscribe(&self, call_id: CallId) -> Result<RelaySubscription, RelayError> {
            self.check_available()?;
            let mut logs = self.logs.lock();
            let log = logs.entry(call_id).or_default();
            if log.closed {
                return Err(RelayError::CallClosed(call_id));
            }

            let (tx, rx) = mpsc::unbounded_channel();
            for (offset, frame) in log.entries.iter().enumerate() {
                let _ = tx.send(RelayEnvelope {
                    call_id,
                    offset: offset as u64,
                    frame: frame.clone(),
                });
            }
            log.subscribers.push(tx);
            Ok(UnboundedReceiverStream::new(rx))
        }

        async fn close(&self, call_id: CallId) -> Result<(), RelayError> {
            let mut logs = self.logs.lock();
            let log = logs.entry(call_id).or_default();
            log.closed = true;
            // Dropping the senders ends every subscriber stream.
            log.subscribers.clear();
            Ok(())
        }
    }
}
