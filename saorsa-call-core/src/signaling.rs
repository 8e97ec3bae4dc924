//! Negotiation message protocol
//!
//! Offer/answer/candidate messages exchanged through the relay, plus the
//! receive-side bookkeeping that makes at-least-once delivery safe: a
//! per-sender sequence tracker that discards duplicates and stale messages,
//! and a buffer that holds candidates until a remote description exists.
//!
//! # Wire format
//!
//! Each message is one JSON frame on the relay:
//!
//! ```json
//! { "kind": "candidate", "callId": "…", "from": "alice", "to": "bob", "seq": 3, "payload": "…" }
//! ```
//!
//! Candidate payloads carry one or more candidate lines separated by `\n`
//! (batched by [`crate::negotiation::CandidateBatcher`]).

use crate::identity::PeerIdentity;
use crate::types::CallId;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use thiserror::Error;

/// Signaling errors
#[derive(Error, Debug)]
pub enum SignalingError {
    /// Frame could not be decoded
    #[error("Malformed negotiation message: {0}")]
    Malformed(String),

    /// Message decoded but violates the protocol
    #[error("Invalid negotiation message: {0}")]
    Invalid(String),

    /// Message could not be encoded
    #[error("Failed to encode negotiation message: {0}")]
    Encode(String),
}

/// Kind of negotiation message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Session description offer
    Offer,
    /// Session description answer
    Answer,
    /// One or more connectivity candidates
    Candidate,
}

impl MessageKind {
    /// Name used in logs
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Candidate => "candidate",
        }
    }

    /// Offer or answer
    pub fn is_description(self) -> bool {
        matches!(self, Self::Offer | Self::Answer)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Addressed unit of connection-setup data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", bound = "I: PeerIdentity")]
pub struct NegotiationMessage<I: PeerIdentity> {
    /// Offer, answer or candidate
    pub kind: MessageKind,
    /// Call this message belongs to
    pub call_id: CallId,
    /// Sender
    pub from: I,
    /// Recipient
    pub to: I,
    /// Per-(call, sender) sequence number, starting at 1
    pub seq: u64,
    /// Session description or candidate lines
    pub payload: String,
}

impl<I: PeerIdentity> NegotiationMessage<I> {
    /// Create a message
    pub fn new(
        kind: MessageKind,
        call_id: CallId,
        from: I,
        to: I,
        seq: u64,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            call_id,
            from,
            to,
            seq,
            payload: payload.into(),
        }
    }

    /// Offer message
    pub fn offer(call_id: CallId, from: I, to: I, seq: u64, sdp: impl Into<String>) -> Self {
        Self::new(MessageKind::Offer, call_id, from, to, seq, sdp)
    }

    /// Answer message
    pub fn answer(call_id: CallId, from: I, to: I, seq: u64, sdp: impl Into<String>) -> Self {
        Self::new(MessageKind::Answer, call_id, from, to, seq, sdp)
    }

    /// Candidate message carrying one or more candidate lines
    pub fn candidates<S: AsRef<str>>(
        call_id: CallId,
        from: I,
        to: I,
        seq: u64,
        candidates: &[S],
    ) -> Self {
        let payload = candidates
            .iter()
            .map(AsRef::as_ref)
            .collect::<Vec<_>>()
            .join("\n");
        Self::new(MessageKind::Candidate, call_id, from, to, seq, payload)
    }

    /// Candidate lines in a candidate payload
    pub fn candidate_lines(&self) -> impl Iterator<Item = &str> {
        self.payload
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
    }

    /// Structural checks that do not depend on session state
    ///
    /// # Errors
    ///
    /// Returns error if the sequence number is zero, the payload is empty,
    /// or sender and recipient are the same participant.
    pub fn validate(&self) -> Result<(), SignalingError> {
        if self.seq == 0 {
            return Err(SignalingError::Invalid(
                "sequence numbers start at 1".to_string(),
            ));
        }
        if self.payload.trim().is_empty() {
            return Err(SignalingError::Invalid(format!(
                "empty {} payload",
                self.kind
            )));
        }
        if self.from.unique_id() == self.to.unique_id() {
            return Err(SignalingError::Invalid(
                "sender and recipient are the same participant".to_string(),
            ));
        }
        Ok(())
    }

    /// Encode as a JSON relay frame
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn encode(&self) -> Result<Bytes, SignalingError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| SignalingError::Encode(e.to_string()))
    }

    /// Decode and validate a JSON relay frame
    ///
    /// # Errors
    ///
    /// Returns error if the frame is not a valid negotiation message
    pub fn decode(frame: &[u8]) -> Result<Self, SignalingError> {
        let message: Self =
            serde_json::from_slice(frame).map_err(|e| SignalingError::Malformed(e.to_string()))?;
        message.validate()?;
        Ok(message)
    }
}

/// Outcome of checking an inbound sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    /// Not seen before and not superseded
    Fresh,
    /// Same sequence number already accepted from this sender
    Duplicate,
    /// Description older than one already accepted from this sender
    Stale,
}

#[derive(Debug, Default, Clone)]
struct SenderSequences {
    seen: HashSet<u64>,
    last_description: Option<u64>,
}

/// Per-sender sequence bookkeeping for inbound messages
///
/// Every sequence number is accepted once. Offers and answers must also
/// be newer than the last accepted description from the same sender;
/// candidates are order-independent, so a candidate overtaking the answer
/// it belongs to is still fresh and the answer is still applied after it.
#[derive(Debug, Default, Clone)]
pub struct SequenceTracker {
    senders: HashMap<String, SenderSequences>,
}

impl SequenceTracker {
    /// Empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Check a `kind` message with `seq` from `sender`, recording it when
    /// fresh
    pub fn accept(&mut self, sender: &str, seq: u64, kind: MessageKind) -> SequenceCheck {
        let entry = self.senders.entry(sender.to_string()).or_default();
        if entry.seen.contains(&seq) {
            return SequenceCheck::Duplicate;
        }
        if kind.is_description() && entry.last_description.is_some_and(|last| seq < last) {
            return SequenceCheck::Stale;
        }
        entry.seen.insert(seq);
        if kind.is_description() {
            entry.last_description = Some(seq);
        }
        SequenceCheck::Fresh
    }

    /// Un-record a candidate message that could not be kept, so its
    /// redelivery is fresh again
    ///
    /// Descriptions are never forgotten; returns whether `seq` was dropped.
    pub fn forget_candidate(&mut self, sender: &str, seq: u64) -> bool {
        let Some(entry) = self.senders.get_mut(sender) else {
            return false;
        };
        if entry.last_description == Some(seq) {
            return false;
        }
        entry.seen.remove(&seq)
    }
}

/// Remote candidates waiting for the remote description
#[derive(Debug, Clone)]
pub struct CandidateBuffer {
    pending: VecDeque<String>,
    capacity: usize,
}

impl CandidateBuffer {
    /// Buffer holding at most `capacity` candidates
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            capacity,
        }
    }

    /// Queue a candidate in arrival order
    ///
    /// # Errors
    ///
    /// Returns error when the buffer is full
    pub fn push(&mut self, candidate: impl Into<String>) -> Result<(), SignalingError> {
        if self.pending.len() >= self.capacity {
            return Err(SignalingError::Invalid(format!(
                "more than {} candidates before remote description",
                self.capacity
            )));
        }
        self.pending.push_back(candidate.into());
        Ok(())
    }

    /// Take every buffered candidate, oldest first
    pub fn drain(&mut self) -> Vec<String> {
        self.pending.drain(..).collect()
    }

    /// Candidates that still fit
    pub fn room(&self) -> usize {
        self.capacity.saturating_sub(self.pending.len())
    }

    /// Number of buffered candidates
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Nothing buffered
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::identity::PeerIdentityString;

    fn alice() -> PeerIdentityString {
        PeerIdentityString::new("alice")
    }

    fn bob() -> PeerIdentityString {
        PeerIdentityString::new("bob")
    }

    #[test]
    fn test_wire_format_field_names() {
        let call_id = CallId::new();
        let msg = NegotiationMessage::offer(call_id, alice(), bob(), 1, "v=0");
        let json: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();

        assert_eq!(json["kind"], "offer");
        assert_eq!(json["callId"], call_id.to_string());
        assert_eq!(json["from"], "alice");
        assert_eq!(json["to"], "bob");
        assert_eq!(json["seq"], 1);
        assert_eq!(json["payload"], "v=0");
    }

    #[test]
    fn test_decode_rejects_garbage_and_invalid() {
        assert!(matches!(
            NegotiationMessage::<PeerIdentityString>::decode(b"not json"),
            Err(SignalingError::Malformed(_))
        ));

        let zero_seq = NegotiationMessage::answer(CallId::new(), bob(), alice(), 0, "v=0");
        let frame = serde_json::to_vec(&zero_seq).unwrap();
        assert!(matches!(
            NegotiationMessage::<PeerIdentityString>::decode(&frame),
            Err(SignalingError::Invalid(_))
        ));

        let self_addressed = NegotiationMessage::answer(CallId::new(), bob(), bob(), 2, "v=0");
        assert!(self_addressed.validate().is_err());
    }

    #[test]
    fn test_candidate_lines() {
        let msg = NegotiationMessage::candidates(
            CallId::new(),
            alice(),
            bob(),
            2,
            &[
                "candidate:1 1 udp 1 10.0.0.2 5000 typ host",
                "candidate:2 1 udp 1 1.2.3.4 6000 typ srflx",
            ],
        );
        let lines: Vec<_> = msg.candidate_lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("srflx"));
    }

    #[test]
    fn test_sequence_tracker() {
        use MessageKind::{Answer, Offer};
        let mut tracker = SequenceTracker::new();
        assert_eq!(tracker.accept("alice", 1, Offer), SequenceCheck::Fresh);
        assert_eq!(tracker.accept("alice", 1, Offer), SequenceCheck::Duplicate);
        assert_eq!(tracker.accept("alice", 4, Offer), SequenceCheck::Fresh);
        assert_eq!(tracker.accept("alice", 3, Answer), SequenceCheck::Stale);
        assert_eq!(tracker.accept("bob", 1, Offer), SequenceCheck::Fresh);
    }

    #[test]
    fn test_candidates_may_overtake_the_description() {
        use MessageKind::{Answer, Candidate};
        let mut tracker = SequenceTracker::new();
        assert_eq!(tracker.accept("bob", 3, Candidate), SequenceCheck::Fresh);
        assert_eq!(tracker.accept("bob", 2, Candidate), SequenceCheck::Fresh);
        assert_eq!(tracker.accept("bob", 1, Answer), SequenceCheck::Fresh);
        assert_eq!(tracker.accept("bob", 2, Candidate), SequenceCheck::Duplicate);
    }

    #[test]
    fn test_forgotten_candidate_is_fresh_again() {
        use MessageKind::{Answer, Candidate};
        let mut tracker = SequenceTracker::new();
        assert_eq!(tracker.accept("bob", 2, Candidate), SequenceCheck::Fresh);
        assert!(tracker.forget_candidate("bob", 2));
        assert!(!tracker.forget_candidate("bob", 2));
        assert!(!tracker.forget_candidate("carol", 2));
        assert_eq!(tracker.accept("bob", 2, Candidate), SequenceCheck::Fresh);

        assert_eq!(tracker.accept("bob", 1, Answer), SequenceCheck::Fresh);
        assert!(!tracker.forget_candidate("bob", 1));
        assert_eq!(tracker.accept("bob", 1, Answer), SequenceCheck::Duplicate);
    }

    #[test]
    fn test_candidate_buffer_preserves_order_and_capacity() {
        let mut buffer = CandidateBuffer::new(2);
        buffer.push("a").unwrap();
        buffer.push("b").unwrap();
        assert_eq!(buffer.room(), 0);
        assert!(buffer.push("c").is_err());
        assert_eq!(buffer.drain(), vec!["a".to_string(), "b".to_string()]);
        assert!(buffer.is_empty());
    }
}
