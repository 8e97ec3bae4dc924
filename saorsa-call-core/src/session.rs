//! Per-call session task
//!
//! Each call runs as one task that owns all of the call's mutable state.
//! Everything that can change a session arrives as a [`SessionCommand`] on
//! its queue: signals from the relay, stats ticks, user requests, relay
//! failures. Two helper tasks run next to it:
//!
//! - the outbound task sends negotiation messages through the relay client
//!   in order, so retries never block the session and can be aborted on end
//! - the delivery task follows the call's relay log and feeds messages
//!   addressed to us back into the queue
//!
//! Every path into `Ended` goes through [`SessionActor::finish`], which
//! releases media, closes the connection and the relay log, and moves the
//! session to the registry's finished set.

use crate::backend::{CallRecordUpdate, CallStore};
use crate::call::{CallError, CallManagerConfig};
use crate::connection::LiveConnection;
use crate::identity::PeerIdentity;
use crate::locality::LocalPeerDiscovery;
use crate::media::{MediaDevices, MediaGuard};
use crate::negotiation::{CandidateBatch, CandidateBatcher, CodecNegotiationOptimizer};
use crate::network::NetworkModeClassifier;
use crate::quality::{MediaDirective, MediaQualityDegradationEngine};
use crate::registry::{Registry, Reservation, SessionHandle};
use crate::relay::{RelayClient, RelayError};
use crate::signaling::{
    CandidateBuffer, MessageKind, NegotiationMessage, SequenceCheck, SequenceTracker,
};
use crate::types::{
    CallEvent, CallId, CallSession, CallState, ConnectionStats, EndReason, MediaConstraints,
    NetworkMode, QualityLevel, Role,
};
use crate::ui_signal;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, Interval, MissedTickBehavior};
use tokio_stream::StreamExt;
use tracing::Instrument;

/// What a session did with one negotiation message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    /// Applied to the live connection
    Applied,
    /// Candidates held until the remote description is set
    Buffered,
    /// Same sequence number as the last applied message; dropped
    Duplicate,
    /// Older than the last applied message; dropped
    Stale,
    /// Not valid for this session or its state; dropped
    Ignored,
    /// Recorded as a new incoming call
    Incoming,
}

pub(crate) enum SessionCommand<I: PeerIdentity> {
    Signal {
        message: NegotiationMessage<I>,
        reply: Option<oneshot::Sender<SignalOutcome>>,
    },
    StatsTick {
        stats: ConnectionStats,
        reply: oneshot::Sender<Result<CallSession<I>, CallError>>,
    },
    Renegotiate {
        constraints: MediaConstraints,
        reply: oneshot::Sender<Result<CallSession<I>, CallError>>,
    },
    AddLocalCandidate {
        candidate: String,
    },
    End {
        reason: EndReason,
        reply: Option<oneshot::Sender<CallSession<I>>>,
    },
    RelayFailed(RelayError),
    RelayClosed,
}

struct Outbound<I: PeerIdentity> {
    message: NegotiationMessage<I>,
    ack: Option<oneshot::Sender<Result<u64, RelayError>>>,
}

/// Collaborators every session shares with the manager
pub(crate) struct SessionContext<I: PeerIdentity> {
    pub(crate) config: Arc<CallManagerConfig>,
    pub(crate) relay: RelayClient,
    pub(crate) devices: Arc<dyn MediaDevices>,
    pub(crate) registry: Registry<I>,
    pub(crate) events: broadcast::Sender<CallEvent<I>>,
    pub(crate) store: Option<Arc<dyn CallStore>>,
}

/// Everything a new session starts with
pub(crate) struct SessionSetup<I: PeerIdentity> {
    pub(crate) session: CallSession<I>,
    pub(crate) connection: Arc<dyn LiveConnection>,
    pub(crate) media: MediaGuard,
    /// Offer (initiator) or answer (responder), always seq 1
    pub(crate) first_message: NegotiationMessage<I>,
    pub(crate) first_ack: oneshot::Sender<Result<u64, RelayError>>,
    /// Responder only: the remote offer already applied
    pub(crate) remote_offer_seq: Option<u64>,
}

/// Start a session task and publish it under `reservation`
pub(crate) fn spawn_session<I: PeerIdentity>(
    ctx: SessionContext<I>,
    setup: SessionSetup<I>,
    reservation: Reservation<I>,
) -> SessionHandle<I> {
    let call_id = setup.session.call_id;
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (snapshot_tx, snapshot_rx) = watch::channel(setup.session.clone());
    let handle = SessionHandle {
        commands: command_tx.clone(),
        snapshot: snapshot_rx,
    };
    reservation.commit(handle.clone());

    let span = tracing::info_span!("call_session", call_id = %call_id);
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let _ = outbound_tx.send(Outbound {
        message: setup.first_message,
        ack: Some(setup.first_ack),
    });
    let outbound_task = tokio::spawn(
        run_outbound(ctx.relay.clone(), outbound_rx, command_tx.clone()).instrument(span.clone()),
    );
    let delivery_task = tokio::spawn(
        run_delivery(
            ctx.relay.clone(),
            call_id,
            setup.session.local.clone(),
            command_tx,
        )
        .instrument(span.clone()),
    );

    let actor = SessionActor::new(
        ctx,
        setup.session,
        setup.connection,
        setup.media,
        setup.remote_offer_seq,
        snapshot_tx,
        command_rx,
        outbound_tx,
        outbound_task,
        delivery_task,
    );
    tokio::spawn(actor.run().instrument(span));
    handle
}

async fn run_outbound<I: PeerIdentity>(
    relay: RelayClient,
    mut queue: mpsc::UnboundedReceiver<Outbound<I>>,
    commands: mpsc::UnboundedSender<SessionCommand<I>>,
) {
    while let Some(Outbound { message, ack }) = queue.recv().await {
        let result = relay.send(&message).await;
        let failure = result.as_ref().err().cloned();
        if let Some(ack) = ack {
            let _ = ack.send(result);
        }
        match failure {
            None => {}
            Some(RelayError::CallClosed(_)) => {
                let _ = commands.send(SessionCommand::RelayClosed);
                return;
            }
            Some(err) => {
                let _ = commands.send(SessionCommand::RelayFailed(err));
                return;
            }
        }
    }
}

async fn run_delivery<I: PeerIdentity>(
    relay: RelayClient,
    call_id: CallId,
    local: I,
    commands: mpsc::UnboundedSender<SessionCommand<I>>,
) {
    let mut stream = match relay.subscribe(call_id).await {
        Ok(stream) => stream,
        Err(RelayError::CallClosed(_)) => {
            let _ = commands.send(SessionCommand::RelayClosed);
            return;
        }
        Err(err) => {
            let _ = commands.send(SessionCommand::RelayFailed(err));
            return;
        }
    };

    let local_key = local.unique_id();
    while let Some(envelope) = stream.next().await {
        match NegotiationMessage::<I>::decode(&envelope.frame) {
            Ok(message) if message.to.unique_id() == local_key => {
                let command = SessionCommand::Signal {
                    message,
                    reply: None,
                };
                if commands.send(command).is_err() {
                    return;
                }
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(
                    offset = envelope.offset,
                    error = %err,
                    "Dropping undecodable relay frame"
                );
            }
        }
    }
    tracing::debug!("Relay log closed");
    let _ = commands.send(SessionCommand::RelayClosed);
}

/// Top level of the quality ladder means plain `Connected`
fn state_for_level(level: QualityLevel) -> CallState {
    if level == QualityLevel::HdVideo {
        CallState::Connected
    } else {
        CallState::Degraded(level)
    }
}

async fn poll_tick(poll: &mut Option<Interval>) {
    match poll {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

struct SessionActor<I: PeerIdentity> {
    ctx: SessionContext<I>,
    session: CallSession<I>,
    snapshot: watch::Sender<CallSession<I>>,
    commands: mpsc::UnboundedReceiver<SessionCommand<I>>,
    connection: Arc<dyn LiveConnection>,
    media: MediaGuard,
    /// Camera turned on after the call started
    camera: Option<MediaGuard>,
    outbound: mpsc::UnboundedSender<Outbound<I>>,
    outbound_task: JoinHandle<()>,
    delivery_task: JoinHandle<()>,
    next_seq: u64,
    tracker: SequenceTracker,
    pending_candidates: CandidateBuffer,
    remote_description_set: bool,
    awaiting_answer: bool,
    classifier: NetworkModeClassifier,
    engine: MediaQualityDegradationEngine,
    batcher: CandidateBatcher,
    discovery: LocalPeerDiscovery,
    local_candidates: Vec<String>,
    remote_candidates: Vec<String>,
    negotiation_deadline: Instant,
    poll: Option<Interval>,
}

impl<I: PeerIdentity> SessionActor<I> {
    #[allow(clippy::too_many_arguments)]
    fn new(
        ctx: SessionContext<I>,
        session: CallSession<I>,
        connection: Arc<dyn LiveConnection>,
        media: MediaGuard,
        remote_offer_seq: Option<u64>,
        snapshot: watch::Sender<CallSession<I>>,
        commands: mpsc::UnboundedReceiver<SessionCommand<I>>,
        outbound: mpsc::UnboundedSender<Outbound<I>>,
        outbound_task: JoinHandle<()>,
        delivery_task: JoinHandle<()>,
    ) -> Self {
        let config = Arc::clone(&ctx.config);
        let mode = session.network_mode;

        let mut tracker = SequenceTracker::new();
        if let Some(seq) = remote_offer_seq {
            tracker.accept(&session.remote.unique_id(), seq, MessageKind::Offer);
        }

        let mut engine = MediaQualityDegradationEngine::new(config.degradation.clone(), mode);
        engine.set_video_enabled(session.constraints.has_video());

        let poll = config.stats_poll_interval().map(|period| {
            let mut poll = interval(period);
            poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
            poll
        });

        Self {
            session,
            snapshot,
            commands,
            connection,
            media,
            camera: None,
            outbound,
            outbound_task,
            delivery_task,
            next_seq: 2,
            tracker,
            pending_candidates: CandidateBuffer::new(config.max_pending_candidates),
            remote_description_set: remote_offer_seq.is_some(),
            awaiting_answer: false,
            classifier: NetworkModeClassifier::starting_at(config.classifier.clone(), mode),
            engine,
            batcher: CandidateBatcher::new(config.batching.clone()),
            discovery: LocalPeerDiscovery::new(config.locality_confidence_threshold),
            local_candidates: Vec::new(),
            remote_candidates: Vec::new(),
            negotiation_deadline: Instant::now() + config.negotiation_timeout(),
            poll,
            ctx,
        }
    }

    async fn run(mut self) {
        tracing::info!(
            role = ?self.session.role,
            remote = %self.session.remote,
            mode = %self.session.network_mode,
            "Session started"
        );
        self.start().await;

        while !self.session.state.is_ended() {
            let negotiating = self.session.state == CallState::Negotiating;
            let polling = self.poll.is_some() && self.session.state.is_connected();
            let batch_deadline = self.batcher.next_deadline();

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => {
                        self.finish(EndReason::LocalHangup).await;
                    }
                },
                () = sleep_until(self.negotiation_deadline), if negotiating => {
                    tracing::warn!("Negotiation timed out");
                    self.finish(EndReason::Timeout).await;
                }
                () = sleep_until_some(batch_deadline), if batch_deadline.is_some() => {
                    self.flush_expired_candidates();
                }
                () = poll_tick(&mut self.poll), if polling => {
                    self.poll_stats().await;
                }
            }
        }

        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            self.reject(command);
        }
    }

    async fn start(&mut self) {
        match self.connection.local_candidates().await {
            Ok(candidates) => {
                for candidate in candidates {
                    self.queue_local_candidate(candidate).await;
                }
            }
            Err(err) => tracing::warn!(error = %err, "Local candidate gathering failed"),
        }
        if self.session.role == Role::Responder && self.session.state.is_connected() {
            self.announce_connected().await;
        }
    }

    async fn handle(&mut self, command: SessionCommand<I>) {
        match command {
            SessionCommand::Signal { message, reply } => {
                let outcome = self.on_signal(message).await;
                if let Some(reply) = reply {
                    let _ = reply.send(outcome);
                }
            }
            SessionCommand::StatsTick { stats, reply } => {
                let result = self.on_stats(stats).await;
                let _ = reply.send(result);
            }
            SessionCommand::Renegotiate { constraints, reply } => {
                let result = self.renegotiate(constraints).await;
                let _ = reply.send(result);
            }
            SessionCommand::AddLocalCandidate { candidate } => {
                self.queue_local_candidate(candidate).await;
            }
            SessionCommand::End { reason, reply } => {
                let snapshot = self.finish(reason).await;
                if let Some(reply) = reply {
                    let _ = reply.send(snapshot);
                }
            }
            SessionCommand::RelayFailed(err) => {
                tracing::warn!(error = %err, "Relay failed");
                let reason = match err {
                    RelayError::Unavailable(_) => EndReason::RelayUnavailable,
                    RelayError::CallClosed(_) => EndReason::RemoteHangup,
                    RelayError::Encode(_) => EndReason::ConnectionFailed,
                };
                self.finish(reason).await;
            }
            SessionCommand::RelayClosed => {
                tracing::info!("Remote side closed the call");
                self.finish(EndReason::RemoteHangup).await;
            }
        }
    }

    /// Answer a command that arrived after the session ended
    fn reject(&self, command: SessionCommand<I>) {
        let call_id = self.session.call_id;
        match command {
            SessionCommand::Signal { reply, .. } => {
                if let Some(reply) = reply {
                    let _ = reply.send(SignalOutcome::Ignored);
                }
            }
            SessionCommand::StatsTick { reply, .. } | SessionCommand::Renegotiate { reply, .. } => {
                let _ = reply.send(Err(CallError::SessionEnded(call_id)));
            }
            SessionCommand::End { reply, .. } => {
                if let Some(reply) = reply {
                    let _ = reply.send(self.session.clone());
                }
            }
            SessionCommand::AddLocalCandidate { .. }
            | SessionCommand::RelayFailed(_)
            | SessionCommand::RelayClosed => {}
        }
    }

    #[tracing::instrument(skip(self, message), fields(kind = %message.kind, seq = message.seq))]
    async fn on_signal(&mut self, message: NegotiationMessage<I>) -> SignalOutcome {
        if message.call_id != self.session.call_id
            || message.from.unique_id() != self.session.remote.unique_id()
            || message.to.unique_id() != self.session.local.unique_id()
        {
            tracing::warn!(
                from = %message.from,
                to = %message.to,
                "Protocol violation: message not for this session"
            );
            return SignalOutcome::Ignored;
        }

        match self
            .tracker
            .accept(&message.from.unique_id(), message.seq, message.kind)
        {
            SequenceCheck::Fresh => {}
            SequenceCheck::Duplicate => {
                tracing::debug!("Dropping duplicate message");
                return SignalOutcome::Duplicate;
            }
            SequenceCheck::Stale => {
                tracing::debug!("Dropping stale message");
                return SignalOutcome::Stale;
            }
        }

        match message.kind {
            MessageKind::Offer => self.on_offer(&message.payload).await,
            MessageKind::Answer => self.on_answer(&message.payload).await,
            MessageKind::Candidate => {
                let lines: Vec<String> = message.candidate_lines().map(str::to_string).collect();
                if !self.remote_description_set && lines.len() > self.pending_candidates.room() {
                    // Unrecorded, so a redelivery after the description applies
                    self.tracker
                        .forget_candidate(&message.from.unique_id(), message.seq);
                    tracing::warn!(
                        seq = message.seq,
                        count = lines.len(),
                        pending = self.pending_candidates.len(),
                        "Protocol violation: candidate buffer full"
                    );
                    return SignalOutcome::Ignored;
                }
                self.on_candidates(lines).await
            }
        }
    }

    async fn on_offer(&mut self, sdp: &str) -> SignalOutcome {
        if !self.session.state.is_connected() {
            tracing::warn!(
                state = ?self.session.state,
                "Protocol violation: offer during negotiation"
            );
            return SignalOutcome::Ignored;
        }
        if let Err(err) = self.connection.set_remote_description(sdp).await {
            tracing::warn!(error = %err, "Remote renegotiation rejected");
            return SignalOutcome::Ignored;
        }
        match self
            .connection
            .create_answer(&self.session.constraints)
            .await
        {
            Ok(answer) => {
                let mode = self.classifier.mode();
                let answer = CodecNegotiationOptimizer::optimize_description(&answer, mode);
                self.send(MessageKind::Answer, answer);
                tracing::debug!("Answered remote renegotiation");
                SignalOutcome::Applied
            }
            Err(err) => {
                tracing::warn!(error = %err, "Could not answer remote renegotiation");
                SignalOutcome::Ignored
            }
        }
    }

    async fn on_answer(&mut self, sdp: &str) -> SignalOutcome {
        let initial = self.session.role == Role::Initiator
            && self.session.state == CallState::Negotiating;
        let renegotiation = self.awaiting_answer && self.session.state.is_connected();
        if !initial && !renegotiation {
            tracing::warn!(state = ?self.session.state, "Protocol violation: unexpected answer");
            return SignalOutcome::Ignored;
        }

        if let Err(err) = self.connection.set_remote_description(sdp).await {
            tracing::warn!(error = %err, "Remote answer rejected");
            if initial {
                self.finish(EndReason::ConnectionFailed).await;
            }
            return SignalOutcome::Ignored;
        }

        if renegotiation {
            self.awaiting_answer = false;
            return SignalOutcome::Applied;
        }

        self.remote_description_set = true;
        for candidate in self.pending_candidates.drain() {
            if let Err(err) = self.connection.add_remote_candidate(&candidate).await {
                tracing::warn!(error = %err, "Buffered candidate rejected");
            }
        }
        self.session.state = state_for_level(self.engine.level());
        self.session.connected_at = Some(Utc::now());
        self.announce_connected().await;
        SignalOutcome::Applied
    }

    async fn on_candidates(&mut self, lines: Vec<String>) -> SignalOutcome {
        self.remote_candidates.extend(lines.iter().cloned());
        let outcome = if self.remote_description_set {
            for line in &lines {
                if let Err(err) = self.connection.add_remote_candidate(line).await {
                    tracing::warn!(error = %err, "Remote candidate rejected");
                }
            }
            SignalOutcome::Applied
        } else {
            for line in lines {
                if let Err(err) = self.pending_candidates.push(line) {
                    tracing::warn!(error = %err, "Protocol violation: dropping candidate");
                }
            }
            tracing::trace!(pending = self.pending_candidates.len(), "Candidates buffered");
            SignalOutcome::Buffered
        };
        self.check_locality().await;
        outcome
    }

    async fn announce_connected(&mut self) {
        tracing::info!(quality = %self.engine.level(), "Call connected");
        self.emit(CallEvent::Connected {
            call_id: self.session.call_id,
        });
        self.emit_ui_signal(None);
        self.store_update(CallRecordUpdate::State(self.session.state))
            .await;
        self.publish();
    }

    #[tracing::instrument(
        skip(self, stats),
        fields(
            rtt_ms = ?stats.rtt_ms,
            loss = stats.loss_fraction,
            kbps = stats.available_kbps
        )
    )]
    async fn on_stats(&mut self, stats: ConnectionStats) -> Result<CallSession<I>, CallError> {
        if !self.session.state.is_connected() {
            return Err(CallError::InvalidState {
                call_id: self.session.call_id,
                state: self.session.state,
            });
        }

        let mode_change = self.classifier.observe(stats.clone());
        if let Some(change) = mode_change {
            let window = self.classifier.summary();
            tracing::info!(
                from = %change.from,
                to = %change.to,
                forced = change.forced,
                samples = window.samples,
                mean_rtt_ms = ?window.mean_rtt_ms,
                mean_loss = window.mean_loss,
                mean_kbps = window.mean_kbps,
                "Network mode changed"
            );
            self.session.network_mode = change.to;
            self.emit(CallEvent::NetworkModeChanged {
                call_id: self.session.call_id,
                from: change.from,
                to: change.to,
            });
        }

        let decision = self.engine.evaluate(self.classifier.mode(), &stats);
        if let Err(err) = self.connection.apply_caps(&decision.caps).await {
            tracing::warn!(error = %err, "Failed to apply caps");
        }
        match decision.directive {
            MediaDirective::Continue => {}
            MediaDirective::StopAll => {
                tracing::info!("Falling back to text");
                if let Err(err) = self.connection.set_media_enabled(false).await {
                    tracing::warn!(error = %err, "Failed to stop media");
                }
                self.emit(CallEvent::TextFallback {
                    call_id: self.session.call_id,
                });
            }
            MediaDirective::Resume => {
                tracing::info!("Resuming media");
                if let Err(err) = self.connection.set_media_enabled(true).await {
                    tracing::warn!(error = %err, "Failed to resume media");
                }
            }
        }

        self.session.quality = decision.level;
        self.session.state = state_for_level(decision.level);
        if decision.changed() {
            self.emit(CallEvent::QualityChanged {
                call_id: self.session.call_id,
                from: decision.previous,
                to: decision.level,
                caps: decision.caps,
            });
        }
        if decision.changed() || mode_change.is_some() {
            self.emit_ui_signal(Some(decision.previous));
        }
        self.publish();
        Ok(self.session.clone())
    }

    async fn poll_stats(&mut self) {
        match self.connection.stats().await {
            Ok(stats) => {
                let _ = self.on_stats(stats).await;
            }
            Err(err) => tracing::warn!(error = %err, "Stats poll failed"),
        }
    }

    async fn renegotiate(
        &mut self,
        constraints: MediaConstraints,
    ) -> Result<CallSession<I>, CallError> {
        if !self.session.state.is_connected() {
            return Err(CallError::InvalidState {
                call_id: self.session.call_id,
                state: self.session.state,
            });
        }
        let mode = self.classifier.mode();
        if mode == NetworkMode::Offline {
            return Err(CallError::RenegotiationBlocked(self.session.call_id));
        }

        let video = constraints.has_video();
        let had_video = self.session.constraints.has_video();
        // Held locally until the offer exists so a failed offer drops it
        let camera = if video && !had_video {
            let camera_only = constraints.camera_only();
            Some(MediaGuard::acquire(Arc::clone(&self.ctx.devices), &camera_only).await?)
        } else {
            None
        };

        let offer = self.connection.create_offer(&constraints).await?;
        let offer = CodecNegotiationOptimizer::optimize_description(&offer, mode);
        if camera.is_some() {
            self.camera = camera;
        } else if had_video && !video {
            self.release_camera(&constraints).await?;
        }
        self.engine.set_video_enabled(video);
        tracing::info!(video, "Renegotiating");
        self.session.constraints = constraints;
        self.awaiting_answer = true;
        self.send(MessageKind::Offer, offer);
        self.publish();
        Ok(self.session.clone())
    }

    /// Give the camera back, keeping the microphone
    async fn release_camera(&mut self, constraints: &MediaConstraints) -> Result<(), CallError> {
        if let Some(mut camera) = self.camera.take() {
            camera.release();
            return Ok(());
        }
        // The camera came with the call's first acquisition
        self.media.release();
        match MediaGuard::acquire(Arc::clone(&self.ctx.devices), constraints).await {
            Ok(media) => {
                self.media = media;
                Ok(())
            }
            Err(err) => {
                tracing::warn!(error = %err, "Could not reopen audio devices");
                Err(err.into())
            }
        }
    }

    async fn queue_local_candidate(&mut self, candidate: String) {
        let call_id = self.session.call_id;
        let mut full = None;
        self.batcher
            .batch_candidates(call_id, &candidate, Instant::now(), |batch| {
                full = Some(batch);
            });
        self.local_candidates.push(candidate);
        if let Some(batch) = full {
            self.send_candidates(batch);
        }
        self.check_locality().await;
    }

    fn flush_expired_candidates(&mut self) {
        let mut ready = Vec::new();
        self.batcher
            .flush_expired(Instant::now(), |batch| ready.push(batch));
        for batch in ready {
            self.send_candidates(batch);
        }
    }

    fn send_candidates(&mut self, batch: CandidateBatch) {
        tracing::trace!(count = batch.candidates.len(), "Sending candidate batch");
        self.send(MessageKind::Candidate, batch.candidates.join("\n"));
    }

    fn send(&mut self, kind: MessageKind, payload: String) {
        let message = NegotiationMessage::new(
            kind,
            self.session.call_id,
            self.session.local.clone(),
            self.session.remote.clone(),
            self.next_seq,
            payload,
        );
        self.next_seq += 1;
        if self
            .outbound
            .send(Outbound { message, ack: None })
            .is_err()
        {
            tracing::debug!(%kind, "Outbound queue closed");
        }
    }

    async fn check_locality(&mut self) {
        if self.session.locality.is_some()
            || self.local_candidates.is_empty()
            || self.remote_candidates.is_empty()
        {
            return;
        }
        let locality = self
            .discovery
            .classify(&self.local_candidates, &self.remote_candidates);
        if !self.discovery.is_conclusive(&locality) {
            return;
        }

        tracing::info!(
            locality = ?locality.locality,
            confidence = locality.confidence,
            "Peer locality detected"
        );
        self.session.locality = Some(locality);
        self.emit(CallEvent::LocalityDetected {
            call_id: self.session.call_id,
            locality,
        });
        if self
            .discovery
            .should_prefer_direct(&locality, self.connection.has_direct_path())
        {
            if let Err(err) = self.connection.prefer_direct_path().await {
                tracing::warn!(error = %err, "Could not prefer direct path");
            }
        }
        self.publish();
    }

    async fn finish(&mut self, reason: EndReason) -> CallSession<I> {
        if self.session.state.is_ended() {
            return self.session.clone();
        }
        let call_id = self.session.call_id;

        self.outbound_task.abort();
        self.delivery_task.abort();
        if let Some(batch) = self.batcher.flush_call(call_id) {
            tracing::debug!(
                discarded = batch.candidates.len(),
                "Dropping unsent local candidates"
            );
        }
        self.media.release();
        if let Some(mut camera) = self.camera.take() {
            camera.release();
        }
        self.connection.close().await;
        if let Err(err) = self.ctx.relay.relay().close(call_id).await {
            tracing::warn!(error = %err, "Failed to close relay log");
        }

        self.session.state = CallState::Ended(reason);
        self.session.ended_at = Some(Utc::now());
        self.publish();
        tracing::info!(%reason, "Call ended");

        self.store_update(CallRecordUpdate::Ended {
            reason,
            at: Utc::now(),
        })
        .await;
        self.ctx.registry.finish(self.session.clone());
        self.emit_ui_signal(None);
        self.emit(CallEvent::CallEnded { call_id, reason });
        self.session.clone()
    }

    fn emit_ui_signal(&self, previous: Option<QualityLevel>) {
        let signal = ui_signal::project(
            self.session.network_mode,
            self.session.quality,
            self.session.state,
            previous,
        );
        self.emit(CallEvent::UiSignal {
            call_id: self.session.call_id,
            signal,
        });
    }

    fn emit(&self, event: CallEvent<I>) {
        let _ = self.ctx.events.send(event);
    }

    fn publish(&self) {
        self.snapshot.send_replace(self.session.clone());
    }

    async fn store_update(&self, update: CallRecordUpdate) {
        if let Some(store) = &self.ctx.store {
            if let Err(err) = store.update(self.session.call_id, update).await {
                tracing::warn!(error = %err, "Call store update failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_for_level() {
        assert_eq!(state_for_level(QualityLevel::HdVideo), CallState::Connected);
        assert_eq!(
            state_for_level(QualityLevel::AudioOnly),
            CallState::Degraded(QualityLevel::AudioOnly)
        );
        assert_eq!(
            state_for_level(QualityLevel::TextFallback),
            CallState::Degraded(QualityLevel::TextFallback)
        );
    }
}
