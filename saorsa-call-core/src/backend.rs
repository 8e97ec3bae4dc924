//! Hosted backend collaborators
//!
//! Call metadata persistence ([`CallStore`]) and push alerts for incoming
//! calls ([`PushNotifier`]). Both are best effort from the session's point
//! of view: failures are logged and never end a call.

use crate::types::{CallId, CallState, EndReason, MediaConstraints};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

/// Call store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No record for the call
    #[error("No record for call {0}")]
    NotFound(CallId),

    /// Record already exists
    #[error("Record for call {0} already exists")]
    Duplicate(CallId),

    /// Backend unreachable
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Persisted call metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    /// Call identifier
    pub call_id: CallId,
    /// Initiator's identity string
    pub caller: String,
    /// Responder's identity string
    pub callee: String,
    /// Requested media
    pub constraints: MediaConstraints,
    /// Last known state
    pub state: CallState,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// End time
    pub ended_at: Option<DateTime<Utc>>,
}

impl CallRecord {
    /// Record for a call being placed now
    pub fn placed(
        call_id: CallId,
        caller: impl Into<String>,
        callee: impl Into<String>,
        constraints: MediaConstraints,
    ) -> Self {
        Self {
            call_id,
            caller: caller.into(),
            callee: callee.into(),
            constraints,
            state: CallState::Negotiating,
            created_at: Utc::now(),
            ended_at: None,
        }
    }

    /// Termination reason, if ended
    pub fn end_reason(&self) -> Option<EndReason> {
        match self.state {
            CallState::Ended(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Change to a stored record
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CallRecordUpdate {
    /// New lifecycle state
    State(CallState),
    /// Call ended at the given time
    Ended {
        /// Why
        reason: EndReason,
        /// When
        at: DateTime<Utc>,
    },
}

impl CallRecordUpdate {
    fn apply(self, record: &mut CallRecord) {
        match self {
            Self::State(state) => record.state = state,
            Self::Ended { reason, at } => {
                record.state = CallState::Ended(reason);
                record.ended_at = Some(at);
            }
        }
    }
}

/// Call metadata persistence
#[async_trait]
pub trait CallStore: Send + Sync + 'static {
    /// Store a new record
    ///
    /// # Errors
    ///
    /// Returns error if the record exists or the backend is unreachable.
    async fn insert(&self, record: CallRecord) -> Result<(), StoreError>;

    /// Apply an update to an existing record
    ///
    /// # Errors
    ///
    /// Returns error if the record is missing or the backend is unreachable.
    async fn update(&self, call_id: CallId, update: CallRecordUpdate) -> Result<(), StoreError>;

    /// Watch a record
    ///
    /// # Errors
    ///
    /// Returns error if the record is missing.
    async fn subscribe(&self, call_id: CallId) -> Result<watch::Receiver<CallRecord>, StoreError>;
}

/// Alert sent to the callee's device for a new call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingCallAlert {
    /// Call identifier
    pub call_id: CallId,
    /// Caller identity string
    pub caller: String,
    /// Callee identity string
    pub callee: String,
    /// Whether the call asks for video
    pub video: bool,
}

/// Push delivery errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PushError {
    /// Alert could not be handed off
    #[error("Push delivery failed: {0}")]
    Delivery(String),
}

/// Push alerts for incoming calls
#[async_trait]
pub trait PushNotifier: Send + Sync + 'static {
    /// Alert the callee
    ///
    /// # Errors
    ///
    /// Returns error if the alert could not be handed off.
    async fn notify_incoming(&self, alert: IncomingCallAlert) -> Result<(), PushError>;
}

#[cfg(feature = "simulation")]
pub use simulated::{ChannelPushNotifier, InMemoryCallStore};

#[cfg(feature = "simulation")]
mod simulated {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;

    /// Call store kept in process memory
    #[derive(Debug)]
    pub struct InMemoryCallStore {
        records: Mutex<HashMap<CallId, watch::Sender<CallRecord>>>,
        available: AtomicBool,
    }

    impl InMemoryCallStore {
        /// Empty store
        pub fn new() -> Self {
            Self {
                records: Mutex::new(HashMap::new()),
                available: AtomicBool::new(true),
            }
        }

        /// Make every operation fail with `Unavailable`
        pub fn set_available(&self, available: bool) {
            self.available.store(available, Ordering::SeqCst);
        }

        /// Current record for `call_id`
        pub fn get(&self, call_id: CallId) -> Option<CallRecord> {
            self.records
                .lock()
                .get(&call_id)
                .map(|tx| tx.borrow().clone())
        }

        /// Number of records
        pub fn len(&self) -> usize {
            self.records.lock().len()
        }

        /// No records
        pub fn is_empty(&self) -> bool {
            self.records.lock().is_empty()
        }

        fn check(&self) -> Result<(), StoreError> {
            if self.available.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(StoreError::Unavailable("store offline".to_string()))
            }
        }
    }

    impl Default for InMemoryCallStore {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl CallStore for InMemoryCallStore {
        async fn insert(&self, record: CallRecord) -> Result<(), StoreError> {
            self.check()?;
            let mut records = self.records.lock();
            if records.contains_key(&record.call_id) {
                return Err(StoreError::Duplicate(record.call_id));
            }
            let (tx, _rx) = watch::channel(record.clone());
            records.insert(record.call_id, tx);
            Ok(())
        }

        async fn update(
            &self,
            call_id: CallId,
            update: CallRecordUpdate,
        ) -> Result<(), StoreError> {
            self.check()?;
            let records = self.records.lock();
            let tx = records.get(&call_id).ok_or(StoreError::NotFound(call_id))?;
            tx.send_modify(|record| update.apply(record));
            Ok(())
        }

        async fn subscribe(
            &self,
            call_id: CallId,
        ) -> Result<watch::Receiver<CallRecord>, StoreError> {
            self.check()?;
            self.records
                .lock()
                .get(&call_id)
                .map(watch::Sender::subscribe)
                .ok_or(StoreError::NotFound(call_id))
        }
    }

    /// Push notifier that forwards alerts over an in-process channel
    #[derive(Debug, Clone)]
    pub struct ChannelPushNotifier {
        tx: mpsc::UnboundedSender<IncomingCallAlert>,
    }

    impl ChannelPushNotifier {
        /// Notifier plus the receiving end a simulated callee listens on
        pub fn new() -> (Self, mpsc::UnboundedReceiver<IncomingCallAlert>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (Self { tx }, rx)
        }
    }

    #[async_trait]
    impl PushNotifier for ChannelPushNotifier {
        async fn notify_incoming(&self, alert: IncomingCallAlert) -> Result<(), PushError> {
            self.tx
                .send(alert)
                .map_err(|_| PushError::Delivery("no device listening".to_string()))
        }
    }
}
