//! Call management
//!
//! [`CallManager`] is the public face of the controller. It validates
//! requests, reserves participants, acquires devices, builds the live
//! connection and then hands the call to a session task (see
//! [`crate::session`]), which owns it from there on. Operations on an
//! existing call are forwarded to that task and answered over a oneshot.
//!
//! # Call Flow
//!
//! ```text
//!   caller                         relay log                        callee
//!     │ place_call                    │                               │
//!     ├── offer (seq 1) ─────────────►│── IncomingCall event ────────►│
//!     │                               │◄──────────── answer (seq 1) ──┤ accept_incoming
//!     │◄── answer ────────────────────│                               │ (Connected)
//!     │ (Connected)                   │                               │
//!     ├── candidates (seq 2..) ──────►│◄──────────── candidates ──────┤
//!     │                               │                               │
//!     │ end_call ── close ───────────►│── stream ends ───────────────►│ (RemoteHangup)
//! ```
//!
//! A manager may host several local identities; each participant can be
//! in at most one live call.

use crate::backend::{CallRecord, CallStore, IncomingCallAlert, PushNotifier};
use crate::connection::{ConnectionError, ConnectionFactory, LiveConnection};
use crate::identity::PeerIdentity;
use crate::media::{MediaDevices, MediaError, MediaGuard};
use crate::negotiation::{BatchConfig, CodecNegotiationOptimizer};
use crate::network::ClassifierConfig;
use crate::quality::DegradationConfig;
use crate::registry::{Registry, SessionHandle};
use crate::relay::{RelayClient, RelayError, RetryPolicy, SignalRelay};
use crate::session::{spawn_session, SessionCommand, SessionContext, SessionSetup, SignalOutcome};
use crate::signaling::{MessageKind, NegotiationMessage, SequenceCheck, SignalingError};
use crate::types::{
    CallEvent, CallId, CallSession, CallState, ConfigError, ConnectionStats, EndReason,
    MediaConstraints, NetworkMode, QualityLevel, Role,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};
use tokio_stream::StreamExt;

/// Call management errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallError {
    /// A participant (or the call id) already has a live session
    #[error("Already in call: {0}")]
    AlreadyInCall(String),

    /// A newer offer for this call was already seen
    #[error("Stale offer for call {call_id}: seen seq {seen}, offered seq {offered}")]
    StaleOffer {
        /// Call identifier
        call_id: CallId,
        /// Highest sequence seen
        seen: u64,
        /// Sequence of the rejected offer
        offered: u64,
    },

    /// Relay unreachable past the retry deadline
    #[error("Relay unavailable: {0}")]
    RelayUnavailable(String),

    /// Capture device held elsewhere
    #[error("Device busy: {0}")]
    DeviceBusy(String),

    /// Renegotiation refused while offline
    #[error("Renegotiation blocked while offline for call {0}")]
    RenegotiationBlocked(CallId),

    /// Negotiation did not finish in time
    #[error("Negotiation timed out for call {0}")]
    Timeout(CallId),

    /// Message or request breaks the negotiation protocol
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Call not found
    #[error("Call not found: {0}")]
    CallNotFound(CallId),

    /// Operation not valid in the session's current state
    #[error("Invalid state {state:?} for call {call_id}")]
    InvalidState {
        /// Call identifier
        call_id: CallId,
        /// State at the time of the request
        state: CallState,
    },

    /// Session ended before the request could be served
    #[error("Session ended for call {0}")]
    SessionEnded(CallId),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Device layer error other than busy
    #[error("Media error: {0}")]
    Media(MediaError),

    /// Live connection error
    #[error("Connection error: {0}")]
    Connection(ConnectionError),
}

impl From<MediaError> for CallError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::DeviceBusy(device) => CallError::DeviceBusy(device),
            other => CallError::Media(other),
        }
    }
}

impl From<ConnectionError> for CallError {
    fn from(err: ConnectionError) -> Self {
        CallError::Connection(err)
    }
}

impl From<RelayError> for CallError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Unavailable(reason) => CallError::RelayUnavailable(reason),
            RelayError::CallClosed(call_id) => CallError::SessionEnded(call_id),
            RelayError::Encode(reason) => CallError::ProtocolViolation(reason),
        }
    }
}

impl From<ConfigError> for CallError {
    fn from(err: ConfigError) -> Self {
        CallError::ConfigError(err.to_string())
    }
}

impl From<SignalingError> for CallError {
    fn from(err: SignalingError) -> Self {
        CallError::ProtocolViolation(err.to_string())
    }
}

/// Call manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallManagerConfig {
    /// Maximum concurrent calls
    pub max_concurrent_calls: usize,
    /// An initiator that has no answer after this long ends with `Timeout`
    pub negotiation_timeout_ms: u64,
    /// Locality results below this confidence are not acted on
    pub locality_confidence_threshold: f32,
    /// Poll the connection for stats at this period; `None` leaves ticks
    /// to the host via `on_connection_stats_tick`
    pub stats_poll_interval_ms: Option<u64>,
    /// Remote candidates held before the remote description is set
    pub max_pending_candidates: usize,
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
    /// Network mode classifier tuning
    pub classifier: ClassifierConfig,
    /// Quality engine tuning
    pub degradation: DegradationConfig,
    /// Outgoing candidate batching
    pub batching: BatchConfig,
    /// Relay retry policy
    pub retry: RetryPolicy,
}

impl Default for CallManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 10,
            negotiation_timeout_ms: 30_000,
            locality_confidence_threshold: 0.75,
            stats_poll_interval_ms: None,
            max_pending_candidates: 64,
            event_capacity: 100,
            classifier: ClassifierConfig::default(),
            degradation: DegradationConfig::default(),
            batching: BatchConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl CallManagerConfig {
    /// Check every section
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.classifier.validate()?;
        self.degradation.validate()?;
        self.batching.validate()?;
        self.retry.validate()?;

        if self.max_concurrent_calls == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_calls must be at least 1".to_string(),
            ));
        }
        if self.negotiation_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "negotiation_timeout_ms must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.locality_confidence_threshold) {
            return Err(ConfigError::Invalid(format!(
                "locality_confidence_threshold {} outside [0, 1]",
                self.locality_confidence_threshold
            )));
        }
        if self.stats_poll_interval_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "stats_poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.max_pending_candidates == 0 || self.event_capacity == 0 {
            return Err(ConfigError::Invalid(
                "max_pending_candidates and event_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Negotiation timeout as a duration
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    /// Stats poll period, if polling is enabled
    pub fn stats_poll_interval(&self) -> Option<Duration> {
        self.stats_poll_interval_ms.map(Duration::from_millis)
    }
}

struct Shared<I: PeerIdentity> {
    config: Arc<CallManagerConfig>,
    relay: RelayClient,
    devices: Arc<dyn MediaDevices>,
    connections: Arc<dyn ConnectionFactory>,
    store: Option<Arc<dyn CallStore>>,
    push: Option<Arc<dyn PushNotifier>>,
    registry: Registry<I>,
    events: broadcast::Sender<CallEvent<I>>,
    network_hint: RwLock<NetworkMode>,
}

/// Call manager
///
/// Cheap to clone; clones share the same sessions. The generic parameter
/// `I` is the peer identity type.
pub struct CallManager<I: PeerIdentity> {
    shared: Arc<Shared<I>>,
}

impl<I: PeerIdentity> Clone for CallManager<I> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<I: PeerIdentity> CallManager<I> {
    /// Create a builder over `relay`
    pub fn builder(relay: Arc<dyn SignalRelay>) -> CallManagerBuilder<I> {
        CallManagerBuilder::new(relay)
    }

    /// Active configuration
    pub fn config(&self) -> &CallManagerConfig {
        &self.shared.config
    }

    /// Place a call from `self_id` to `peer`
    ///
    /// Returns once the offer is on the relay, with the session in
    /// `Negotiating` (or already `Connected` if the answer raced us).
    ///
    /// # Errors
    ///
    /// - `ProtocolViolation` when calling yourself
    /// - `AlreadyInCall` when either side has a live session
    /// - `DeviceBusy` when a capture device is held
    /// - `RelayUnavailable` when the offer could not be sent in time
    #[tracing::instrument(skip(self, constraints), fields(caller = %self_id, callee = %peer))]
    pub async fn place_call(
        &self,
        self_id: I,
        peer: I,
        constraints: MediaConstraints,
    ) -> Result<CallSession<I>, CallError> {
        if self_id.unique_id() == peer.unique_id() {
            return Err(CallError::ProtocolViolation(
                "cannot place a call to yourself".to_string(),
            ));
        }

        let call_id = CallId::new();
        let reservation = self.shared.registry.reserve(
            call_id,
            &self_id,
            &peer,
            self.shared.config.max_concurrent_calls,
        )?;
        let media = MediaGuard::acquire(Arc::clone(&self.shared.devices), &constraints).await?;
        let connection = self.shared.connections.create(call_id).await?;

        let hint = self.network_hint();
        let offer = match connection.create_offer(&constraints).await {
            Ok(offer) => CodecNegotiationOptimizer::optimize_description(&offer, hint),
            Err(err) => {
                connection.close().await;
                return Err(err.into());
            }
        };

        self.store_insert(CallRecord::placed(
            call_id,
            self_id.to_string_repr(),
            peer.to_string_repr(),
            constraints.clone(),
        ))
        .await;

        let mut session = CallSession::new(
            call_id,
            self_id.clone(),
            peer.clone(),
            Role::Initiator,
            constraints.clone(),
            hint,
        );
        session.state = CallState::Negotiating;
        session.quality = hint.quality_ceiling();

        let (ack_tx, ack_rx) = oneshot::channel();
        let handle = spawn_session(
            self.context(),
            SessionSetup {
                session,
                connection,
                media,
                first_message: NegotiationMessage::offer(
                    call_id,
                    self_id.clone(),
                    peer.clone(),
                    1,
                    offer,
                ),
                first_ack: ack_tx,
                remote_offer_seq: None,
            },
            reservation,
        );
        self.await_first_send(call_id, ack_rx).await?;

        tracing::info!(%call_id, "Call placed");
        let _ = self.shared.events.send(CallEvent::CallPlaced {
            call_id,
            callee: peer.clone(),
        });
        self.push_alert(IncomingCallAlert {
            call_id,
            caller: self_id.to_string_repr(),
            callee: peer.to_string_repr(),
            video: constraints.has_video(),
        });

        let snapshot = handle.snapshot.borrow().clone();
        Ok(snapshot)
    }

    /// Accept an incoming offer, answering with media matching the offer
    ///
    /// Video is requested when the offer carries a video section.
    ///
    /// # Errors
    ///
    /// See [`CallManager::accept_incoming_with`].
    pub async fn accept_incoming(
        &self,
        offer: NegotiationMessage<I>,
    ) -> Result<CallSession<I>, CallError> {
        let constraints = if offer.payload.lines().any(|l| l.starts_with("m=video")) {
            MediaConstraints::video_call()
        } else {
            MediaConstraints::audio_only()
        };
        self.accept_incoming_with(offer, constraints).await
    }

    /// Accept an incoming offer with explicit local constraints
    ///
    /// The session is `Connected` once the answer is on the relay.
    ///
    /// # Errors
    ///
    /// - `ProtocolViolation` unless `offer` is a seq-1 offer addressed to a
    ///   local identity
    /// - `StaleOffer` when a newer offer for the call was already seen
    /// - `AlreadyInCall`, `DeviceBusy`, `RelayUnavailable` as for
    ///   [`CallManager::place_call`]
    #[tracing::instrument(
        skip(self, offer, constraints),
        fields(call_id = %offer.call_id, caller = %offer.from)
    )]
    pub async fn accept_incoming_with(
        &self,
        offer: NegotiationMessage<I>,
        constraints: MediaConstraints,
    ) -> Result<CallSession<I>, CallError> {
        offer.validate()?;
        if offer.kind != MessageKind::Offer || offer.seq != 1 {
            return Err(CallError::ProtocolViolation(format!(
                "expected initial offer, got {} seq {}",
                offer.kind, offer.seq
            )));
        }
        if !self.shared.registry.is_local(&offer.to) {
            return Err(CallError::ProtocolViolation(format!(
                "offer addressed to {}, not a local identity",
                offer.to
            )));
        }
        let call_id = offer.call_id;
        if let Some(seen) = self.shared.registry.newest_offer(call_id, &offer.from) {
            if seen > offer.seq {
                return Err(CallError::StaleOffer {
                    call_id,
                    seen,
                    offered: offer.seq,
                });
            }
        }

        let reservation = self.shared.registry.reserve(
            call_id,
            &offer.to,
            &offer.from,
            self.shared.config.max_concurrent_calls,
        )?;
        let media = MediaGuard::acquire(Arc::clone(&self.shared.devices), &constraints).await?;
        let connection = self.shared.connections.create(call_id).await?;

        let hint = self.network_hint();
        let answered = Self::answer_offer(connection.as_ref(), &offer.payload, &constraints).await;
        let answer = match answered {
            Ok(answer) => CodecNegotiationOptimizer::optimize_description(&answer, hint),
            Err(err) => {
                connection.close().await;
                return Err(err.into());
            }
        };
        self.shared.registry.stop_watcher(call_id);

        let mut session = CallSession::new(
            call_id,
            offer.to.clone(),
            offer.from.clone(),
            Role::Responder,
            constraints,
            hint,
        );
        session.quality = hint.quality_ceiling();
        session.state = if session.quality == QualityLevel::HdVideo {
            CallState::Connected
        } else {
            CallState::Degraded(session.quality)
        };
        session.connected_at = Some(chrono::Utc::now());

        let (ack_tx, ack_rx) = oneshot::channel();
        let handle = spawn_session(
            self.context(),
            SessionSetup {
                session,
                connection,
                media,
                first_message: NegotiationMessage::answer(
                    call_id,
                    offer.to.clone(),
                    offer.from.clone(),
                    1,
                    answer,
                ),
                first_ack: ack_tx,
                remote_offer_seq: Some(offer.seq),
            },
            reservation,
        );
        self.await_first_send(call_id, ack_rx).await?;

        tracing::info!("Call accepted");
        let snapshot = handle.snapshot.borrow().clone();
        Ok(snapshot)
    }

    async fn answer_offer(
        connection: &dyn LiveConnection,
        sdp: &str,
        constraints: &MediaConstraints,
    ) -> Result<String, ConnectionError> {
        connection.set_remote_description(sdp).await?;
        connection.create_answer(constraints).await
    }

    /// Decline an incoming call without answering
    ///
    /// Closes the call's relay log, so the caller ends with `RemoteHangup`.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyInCall` if the call was already accepted here.
    pub async fn decline_incoming(&self, call_id: CallId) -> Result<(), CallError> {
        if self.shared.registry.is_active(call_id) {
            return Err(CallError::AlreadyInCall(format!("call {call_id} is live")));
        }
        self.shared.registry.stop_watcher(call_id);
        self.shared.registry.forget_offers(call_id);
        self.shared.relay.relay().close(call_id).await?;
        tracing::info!(%call_id, "Incoming call declined");
        Ok(())
    }

    /// Hand a negotiation message to the controller
    ///
    /// Messages for live sessions are applied by the session; an offer for
    /// an unknown call addressed to a local identity is recorded as an
    /// incoming call. Messages for finished calls are ignored.
    ///
    /// # Errors
    ///
    /// `ProtocolViolation` for malformed messages, `CallNotFound` for
    /// non-offers about unknown calls.
    pub async fn on_signal(
        &self,
        message: NegotiationMessage<I>,
    ) -> Result<SignalOutcome, CallError> {
        message.validate()?;
        let call_id = message.call_id;

        if let Some(handle) = self.shared.registry.handle(call_id) {
            let (reply, outcome) = oneshot::channel();
            handle
                .commands
                .send(SessionCommand::Signal {
                    message,
                    reply: Some(reply),
                })
                .map_err(|_| CallError::SessionEnded(call_id))?;
            return outcome.await.map_err(|_| CallError::SessionEnded(call_id));
        }

        if self.shared.registry.finished(call_id).is_some() {
            tracing::debug!(%call_id, kind = %message.kind, "Ignoring message for finished call");
            return Ok(SignalOutcome::Ignored);
        }

        if message.kind == MessageKind::Offer && self.shared.registry.is_local(&message.to) {
            return Ok(record_incoming(
                &self.shared.registry,
                &self.shared.events,
                message,
            ));
        }

        Err(CallError::CallNotFound(call_id))
    }

    /// Follow a call's relay log for offers addressed to `self_id`
    ///
    /// Fresh initial offers are announced as [`CallEvent::IncomingCall`].
    /// The watch stops when the call is accepted, declined or finished. If
    /// the caller closes the log first, the recorded offer is dropped and
    /// [`CallEvent::IncomingCallCancelled`] is emitted.
    ///
    /// # Errors
    ///
    /// Returns `RelayUnavailable` if the subscription cannot be opened.
    pub async fn watch_incoming(&self, call_id: CallId, self_id: I) -> Result<(), CallError> {
        self.shared.registry.add_local(&self_id);
        let mut stream = self.shared.relay.subscribe(call_id).await?;

        let registry = self.shared.registry.clone();
        let events = self.shared.events.clone();
        let local_key = self_id.unique_id();
        self.shared.registry.spawn_watcher(call_id, move |generation| async move {
            while let Some(envelope) = stream.next().await {
                if registry.is_active(call_id) {
                    break;
                }
                match NegotiationMessage::<I>::decode(&envelope.frame) {
                    Ok(message)
                        if message.kind == MessageKind::Offer
                            && message.to.unique_id() == local_key =>
                    {
                        record_incoming(&registry, &events, message);
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(%call_id, error = %err, "Dropping undecodable relay frame");
                    }
                }
            }
            if registry.watch_ended(call_id, generation) {
                tracing::info!(%call_id, "Incoming call withdrawn by caller");
                let _ = events.send(CallEvent::IncomingCallCancelled { call_id });
            }
        });
        Ok(())
    }

    /// Feed one stats sample to the call's classifier and quality engine
    ///
    /// # Errors
    ///
    /// `CallNotFound`, `SessionEnded`, or `InvalidState` before the call
    /// is connected.
    pub async fn on_connection_stats_tick(
        &self,
        call_id: CallId,
        stats: ConnectionStats,
    ) -> Result<CallSession<I>, CallError> {
        self.request(call_id, |reply| SessionCommand::StatsTick { stats, reply })
            .await?
    }

    /// Renegotiate media on a connected call
    ///
    /// # Errors
    ///
    /// `RenegotiationBlocked` while the network is offline, `InvalidState`
    /// before the call is connected.
    pub async fn renegotiate(
        &self,
        call_id: CallId,
        constraints: MediaConstraints,
    ) -> Result<CallSession<I>, CallError> {
        self.request(call_id, |reply| SessionCommand::Renegotiate {
            constraints,
            reply,
        })
        .await?
    }

    /// Switch video on or off through renegotiation
    ///
    /// # Errors
    ///
    /// As for [`CallManager::renegotiate`].
    pub async fn toggle_video(
        &self,
        call_id: CallId,
        enabled: bool,
    ) -> Result<CallSession<I>, CallError> {
        let handle = self.live_handle(call_id)?;
        let constraints = handle.snapshot.borrow().constraints.clone();
        self.renegotiate(call_id, constraints.with_video(enabled))
            .await
    }

    /// Queue a locally gathered candidate for batched sending
    ///
    /// # Errors
    ///
    /// `CallNotFound` or `SessionEnded`.
    pub fn add_local_candidate(
        &self,
        call_id: CallId,
        candidate: impl Into<String>,
    ) -> Result<(), CallError> {
        let handle = self.live_handle(call_id)?;
        handle
            .commands
            .send(SessionCommand::AddLocalCandidate {
                candidate: candidate.into(),
            })
            .map_err(|_| CallError::SessionEnded(call_id))
    }

    /// End a call
    ///
    /// Idempotent: ending a finished call returns its final snapshot.
    ///
    /// # Errors
    ///
    /// `CallNotFound` if the call was never known here.
    #[tracing::instrument(skip(self))]
    pub async fn end_call(
        &self,
        call_id: CallId,
        reason: EndReason,
    ) -> Result<CallSession<I>, CallError> {
        if let Some(handle) = self.shared.registry.handle(call_id) {
            let (reply, ended) = oneshot::channel();
            let command = SessionCommand::End {
                reason,
                reply: Some(reply),
            };
            if handle.commands.send(command).is_ok() {
                if let Ok(snapshot) = ended.await {
                    return Ok(snapshot);
                }
            }
        }
        self.shared
            .registry
            .finished(call_id)
            .ok_or(CallError::CallNotFound(call_id))
    }

    /// Latest snapshot of a live or recently finished call
    pub fn session(&self, call_id: CallId) -> Option<CallSession<I>> {
        match self.shared.registry.handle(call_id) {
            Some(handle) => {
                let snapshot = handle.snapshot.borrow().clone();
                Some(snapshot)
            }
            None => self.shared.registry.finished(call_id),
        }
    }

    /// Snapshots of every live call
    pub fn active_calls(&self) -> Vec<CallSession<I>> {
        self.shared
            .registry
            .live()
            .into_iter()
            .map(|(_, handle)| handle.snapshot.borrow().clone())
            .filter(|session| session.state.is_live())
            .collect()
    }

    /// Calls announced as incoming that were neither accepted, declined
    /// nor withdrawn
    pub fn pending_incoming(&self) -> Vec<CallId> {
        self.shared.registry.pending_incoming()
    }

    /// An incoming-call watch is following `call_id`
    pub fn is_watching(&self, call_id: CallId) -> bool {
        self.shared.registry.is_watching(call_id)
    }

    /// Subscribe to call events
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent<I>> {
        self.shared.events.subscribe()
    }

    /// Network mode new calls start from
    pub fn set_network_hint(&self, mode: NetworkMode) {
        *self.shared.network_hint.write() = mode;
    }

    /// Current network hint
    pub fn network_hint(&self) -> NetworkMode {
        *self.shared.network_hint.read()
    }

    /// End every live call and stop all incoming-call watchers
    pub async fn shutdown(&self) {
        self.shared.registry.stop_all_watchers();
        let calls: Vec<CallId> = self
            .shared
            .registry
            .live()
            .into_iter()
            .map(|(call_id, _)| call_id)
            .collect();
        let ended = futures::future::join_all(
            calls
                .iter()
                .map(|call_id| self.end_call(*call_id, EndReason::LocalHangup)),
        )
        .await;
        tracing::info!(calls = ended.len(), "Call manager shut down");
    }

    fn context(&self) -> SessionContext<I> {
        SessionContext {
            config: Arc::clone(&self.shared.config),
            relay: self.shared.relay.clone(),
            devices: Arc::clone(&self.shared.devices),
            registry: self.shared.registry.clone(),
            events: self.shared.events.clone(),
            store: self.shared.store.clone(),
        }
    }

    fn live_handle(&self, call_id: CallId) -> Result<SessionHandle<I>, CallError> {
        self.shared.registry.handle(call_id).ok_or_else(|| {
            if self.shared.registry.finished(call_id).is_some() {
                CallError::SessionEnded(call_id)
            } else {
                CallError::CallNotFound(call_id)
            }
        })
    }

    async fn request<T>(
        &self,
        call_id: CallId,
        command: impl FnOnce(oneshot::Sender<T>) -> SessionCommand<I>,
    ) -> Result<T, CallError> {
        let handle = self.live_handle(call_id)?;
        let (reply, response) = oneshot::channel();
        handle
            .commands
            .send(command(reply))
            .map_err(|_| CallError::SessionEnded(call_id))?;
        response
            .await
            .map_err(|_| CallError::SessionEnded(call_id))
    }

    /// Wait for the first message to reach the relay
    ///
    /// On failure the session is ended and the error reflects why.
    async fn await_first_send(
        &self,
        call_id: CallId,
        ack: oneshot::Receiver<Result<u64, RelayError>>,
    ) -> Result<(), CallError> {
        let failure = match ack.await {
            Ok(Ok(_)) => return Ok(()),
            Ok(Err(err)) => err,
            Err(_) => RelayError::CallClosed(call_id),
        };
        let reason = match &failure {
            RelayError::Unavailable(_) => EndReason::RelayUnavailable,
            RelayError::CallClosed(_) => EndReason::RemoteHangup,
            RelayError::Encode(_) => EndReason::ConnectionFailed,
        };
        let ended = self.end_call(call_id, reason).await.ok();
        tracing::warn!(%call_id, error = %failure, "First negotiation message not delivered");

        Err(match ended.and_then(|s| s.end_reason()) {
            Some(EndReason::RelayUnavailable) => match failure {
                RelayError::Unavailable(reason) => CallError::RelayUnavailable(reason),
                other => CallError::RelayUnavailable(other.to_string()),
            },
            Some(EndReason::Timeout) => CallError::Timeout(call_id),
            _ => failure.into(),
        })
    }

    async fn store_insert(&self, record: CallRecord) {
        if let Some(store) = &self.shared.store {
            if let Err(err) = store.insert(record).await {
                tracing::warn!(error = %err, "Call store insert failed");
            }
        }
    }

    fn push_alert(&self, alert: IncomingCallAlert) {
        if let Some(push) = self.shared.push.clone() {
            tokio::spawn(async move {
                let call_id = alert.call_id;
                if let Err(err) = push.notify_incoming(alert).await {
                    tracing::warn!(%call_id, error = %err, "Push alert failed");
                }
            });
        }
    }
}

fn record_incoming<I: PeerIdentity>(
    registry: &Registry<I>,
    events: &broadcast::Sender<CallEvent<I>>,
    offer: NegotiationMessage<I>,
) -> SignalOutcome {
    match registry.observe_offer(&offer) {
        SequenceCheck::Duplicate => SignalOutcome::Duplicate,
        SequenceCheck::Stale => SignalOutcome::Stale,
        SequenceCheck::Fresh => {
            if offer.seq == 1 {
                tracing::info!(call_id = %offer.call_id, caller = %offer.from, "Incoming call");
                let _ = events.send(CallEvent::IncomingCall { offer });
            }
            SignalOutcome::Incoming
        }
    }
}

/// Builder for [`CallManager`]
pub struct CallManagerBuilder<I: PeerIdentity> {
    relay: Arc<dyn SignalRelay>,
    config: CallManagerConfig,
    devices: Option<Arc<dyn MediaDevices>>,
    connections: Option<Arc<dyn ConnectionFactory>>,
    store: Option<Arc<dyn CallStore>>,
    push: Option<Arc<dyn PushNotifier>>,
    locals: Vec<I>,
    network_hint: NetworkMode,
}

impl<I: PeerIdentity> CallManagerBuilder<I> {
    /// Create new builder
    pub fn new(relay: Arc<dyn SignalRelay>) -> Self {
        Self {
            relay,
            config: CallManagerConfig::default(),
            devices: None,
            connections: None,
            store: None,
            push: None,
            locals: Vec::new(),
            network_hint: NetworkMode::High,
        }
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: CallManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the media device layer
    #[must_use]
    pub fn with_devices(mut self, devices: Arc<dyn MediaDevices>) -> Self {
        self.devices = Some(devices);
        self
    }

    /// Set the live connection factory
    #[must_use]
    pub fn with_connections(mut self, connections: Arc<dyn ConnectionFactory>) -> Self {
        self.connections = Some(connections);
        self
    }

    /// Persist call records
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn CallStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Send push alerts for placed calls
    #[must_use]
    pub fn with_push_notifier(mut self, push: Arc<dyn PushNotifier>) -> Self {
        self.push = Some(push);
        self
    }

    /// Register an identity that may receive calls
    #[must_use]
    pub fn with_local_identity(mut self, identity: I) -> Self {
        self.locals.push(identity);
        self
    }

    /// Initial network hint
    #[must_use]
    pub fn with_network_hint(mut self, mode: NetworkMode) -> Self {
        self.network_hint = mode;
        self
    }

    /// Build the manager
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the configuration is invalid or no device
    /// layer or connection factory is available.
    pub async fn build(self) -> Result<CallManager<I>, CallError> {
        self.config.validate()?;
        let devices = match self.devices {
            Some(devices) => devices,
            None => default_devices()?,
        };
        let connections = match self.connections {
            Some(connections) => connections,
            None => default_connections()?,
        };

        let registry = Registry::new();
        for identity in &self.locals {
            registry.add_local(identity);
        }
        let (events, _) = broadcast::channel(self.config.event_capacity);
        let relay = RelayClient::new(self.relay, self.config.retry.clone());

        tracing::debug!(
            max_concurrent_calls = self.config.max_concurrent_calls,
            hint = %self.network_hint,
            "Call manager ready"
        );
        Ok(CallManager {
            shared: Arc::new(Shared {
                config: Arc::new(self.config),
                relay,
                devices,
                connections,
                store: self.store,
                push: self.push,
                registry,
                events,
                network_hint: RwLock::new(self.network_hint),
            }),
        })
    }
}

#[cfg(feature = "simulation")]
fn default_devices() -> Result<Arc<dyn MediaDevices>, CallError> {
    Ok(Arc::new(crate::media::SimulatedDevices::new()))
}

#[cfg(not(feature = "simulation"))]
fn default_devices() -> Result<Arc<dyn MediaDevices>, CallError> {
    Err(CallError::ConfigError(
        "no media device layer configured".to_string(),
    ))
}

#[cfg(feature = "simulation")]
fn default_connections() -> Result<Arc<dyn ConnectionFactory>, CallError> {
    Ok(Arc::new(crate::connection::SimulatedConnectionFactory::new()))
}

#[cfg(not(feature = "simulation"))]
fn default_connections() -> Result<Arc<dyn ConnectionFactory>, CallError> {
    Err(CallError::ConfigError(
        "no connection factory configured".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = CallManagerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.negotiation_timeout(), Duration::from_secs(30));
        assert!(config.stats_poll_interval().is_none());
    }

    #[test]
    fn test_config_rejects_bad_values() {
        let bad = [
            CallManagerConfig {
                max_concurrent_calls: 0,
                ..CallManagerConfig::default()
            },
            CallManagerConfig {
                locality_confidence_threshold: 1.5,
                ..CallManagerConfig::default()
            },
            CallManagerConfig {
                stats_poll_interval_ms: Some(0),
                ..CallManagerConfig::default()
            },
            CallManagerConfig {
                batching: BatchConfig {
                    max_batch: 0,
                    max_delay_ms: 10,
                },
                ..CallManagerConfig::default()
            },
        ];
        for config in bad {
            assert!(config.validate().is_err(), "{config:?}");
        }
    }

    #[test]
    fn test_config_partial_json_uses_defaults() {
        let config: CallManagerConfig =
            serde_json::from_str(r#"{"max_concurrent_calls": 2}"#).unwrap_or_default();
        assert_eq!(config.max_concurrent_calls, 2);
        assert_eq!(config.negotiation_timeout_ms, 30_000);
    }

    #[test]
    fn test_error_conversions() {
        assert_eq!(
            CallError::from(MediaError::DeviceBusy("mic-0".to_string())),
            CallError::DeviceBusy("mic-0".to_string())
        );
        assert!(matches!(
            CallError::from(MediaError::PermissionDenied("cam".to_string())),
            CallError::Media(_)
        ));
        assert_eq!(
            CallError::from(RelayError::Unavailable("down".to_string())),
            CallError::RelayUnavailable("down".to_string())
        );
        let call_id = CallId::new();
        assert_eq!(
            CallError::from(RelayError::CallClosed(call_id)),
            CallError::SessionEnded(call_id)
        );
    }
}
