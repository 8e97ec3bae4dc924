//! Call types and data structures

use crate::identity::PeerIdentity;
use crate::signaling::NegotiationMessage;
use crate::ui_signal::UiSignal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A tuning parameter is out of range or inconsistent
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Unique identifier for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Media constraints for a call
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Enable audio
    pub audio: bool,
    /// Enable video
    pub video: bool,
    /// Preferred microphone device id
    #[serde(default)]
    pub audio_input: Option<String>,
    /// Preferred speaker device id
    #[serde(default)]
    pub audio_output: Option<String>,
    /// Preferred camera device id
    #[serde(default)]
    pub video_input: Option<String>,
}

impl MediaConstraints {
    /// Audio-only call
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            ..Self::default()
        }
    }

    /// Video call with audio
    pub fn video_call() -> Self {
        Self {
            audio: true,
            video: true,
            ..Self::default()
        }
    }

    /// Check if audio is enabled
    pub fn has_audio(&self) -> bool {
        self.audio
    }

    /// Check if video is enabled
    pub fn has_video(&self) -> bool {
        self.video
    }

    /// Same constraints with video switched on or off
    #[must_use]
    pub fn with_video(mut self, video: bool) -> Self {
        self.video = video;
        self
    }

    /// Only the camera these constraints name
    pub fn camera_only(&self) -> Self {
        Self {
            video: true,
            video_input: self.video_input.clone(),
            ..Self::default()
        }
    }
}

/// Which side of the call this session is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Placed the call and sent the first offer
    Initiator,
    /// Accepted an incoming offer
    Responder,
}

/// Why a call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Local user hung up
    LocalHangup,
    /// Remote side hung up (relay log closed)
    RemoteHangup,
    /// Remote side declined before answering
    Declined,
    /// No answer within the negotiation timeout
    Timeout,
    /// Relay could not be reached before the retry deadline
    RelayUnavailable,
    /// Host connection reported an unrecoverable error
    ConnectionFailed,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::LocalHangup => "local hangup",
            Self::RemoteHangup => "remote hangup",
            Self::Declined => "declined",
            Self::Timeout => "timeout",
            Self::RelayUnavailable => "relay unavailable",
            Self::ConnectionFailed => "connection failed",
        };
        f.write_str(s)
    }
}

/// Call lifecycle state
///
/// ```text
///   Idle ──► Negotiating ──► Connected ◄──► Degraded(level)
///                │               │               │
///                └───────────────┴───────────────┴──► Ended(reason)
/// ```
///
/// `Degraded` is a sub-state of `Connected`: media is flowing, just below
/// the top of the quality ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallState {
    /// No active call
    Idle,
    /// Offer/answer exchange in progress
    Negotiating,
    /// Media flowing at full quality
    Connected,
    /// Media flowing below full quality
    Degraded(QualityLevel),
    /// Call is over
    Ended(EndReason),
}

impl CallState {
    /// Media is (or may be) flowing
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::Degraded(_))
    }

    /// Terminal state reached
    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Ended(_))
    }

    /// Session still owns resources
    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Idle | Self::Ended(_))
    }
}

/// Discrete network condition, ordered from worst to best
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    /// No usable connectivity
    Offline,
    /// Barely usable; narrowband audio only
    VeryLow,
    /// Constrained; audio only
    Low,
    /// Enough for standard-definition video
    Medium,
    /// Unconstrained
    High,
}

impl NetworkMode {
    /// Best quality level this mode can sustain
    pub fn quality_ceiling(self) -> QualityLevel {
        match self {
            Self::Offline => QualityLevel::TextFallback,
            Self::VeryLow | Self::Low => QualityLevel::AudioOnly,
            Self::Medium => QualityLevel::SdVideo,
            Self::High => QualityLevel::HdVideo,
        }
    }

    /// All modes, worst first
    pub const ALL: [NetworkMode; 5] = [
        Self::Offline,
        Self::VeryLow,
        Self::Low,
        Self::Medium,
        Self::High,
    ];
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Offline => "offline",
            Self::VeryLow => "very-low",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        f.write_str(s)
    }
}

/// Media quality ladder, ordered from most degraded to best
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityLevel {
    /// No media; text chat only
    TextFallback,
    /// Audio without video
    AudioOnly,
    /// Standard-definition video
    SdVideo,
    /// High-definition video
    HdVideo,
}

impl QualityLevel {
    /// Whether video is sent at this level
    pub fn has_video(self) -> bool {
        matches!(self, Self::SdVideo | Self::HdVideo)
    }

    /// Whether any media is sent at this level
    pub fn has_media(self) -> bool {
        self != Self::TextFallback
    }
}

impl fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TextFallback => "text-fallback",
            Self::AudioOnly => "audio-only",
            Self::SdVideo => "sd-video",
            Self::HdVideo => "hd-video",
        };
        f.write_str(s)
    }
}

/// One connection statistics sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStats {
    /// Round-trip time in milliseconds, if any probe came back
    pub rtt_ms: Option<u32>,
    /// Packet loss as a fraction in `[0, 1]`
    pub loss_fraction: f32,
    /// Estimated available send bitrate in kilobits per second
    pub available_kbps: u32,
    /// Jitter in milliseconds
    #[serde(default)]
    pub jitter_ms: u32,
    /// Timestamp when the sample was taken
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ConnectionStats {
    /// Sample taken now
    pub fn new(rtt_ms: u32, loss_fraction: f32, available_kbps: u32) -> Self {
        Self {
            rtt_ms: Some(rtt_ms),
            loss_fraction,
            available_kbps,
            jitter_ms: 0,
            timestamp: Utc::now(),
        }
    }

    /// Sample describing total connectivity loss
    pub fn disconnected() -> Self {
        Self {
            rtt_ms: None,
            loss_fraction: 1.0,
            available_kbps: 0,
            jitter_ms: 0,
            timestamp: Utc::now(),
        }
    }

    /// Nothing is getting through
    pub fn is_connectivity_loss(&self) -> bool {
        self.loss_fraction >= 1.0 || self.available_kbps == 0
    }
}

/// Video resolution options
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VideoResolution {
    /// 320x240
    QVGA240,
    /// 640x360
    SD360,
    /// 640x480
    SD480,
    /// 1280x720
    HD720,
}

impl VideoResolution {
    /// Get width in pixels
    pub fn width(&self) -> u32 {
        match self {
            Self::QVGA240 => 320,
            Self::SD360 | Self::SD480 => 640,
            Self::HD720 => 1280,
        }
    }

    /// Get height in pixels
    pub fn height(&self) -> u32 {
        match self {
            Self::QVGA240 => 240,
            Self::SD360 => 360,
            Self::SD480 => 480,
            Self::HD720 => 720,
        }
    }
}

/// Audio track limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioCaps {
    /// Maximum audio bitrate in kilobits per second
    pub max_bitrate_kbps: u32,
    /// Enable discontinuous transmission
    pub dtx: bool,
}

/// Video track limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoCaps {
    /// Maximum video bitrate in kilobits per second
    pub max_bitrate_kbps: u32,
    /// Largest resolution to encode
    pub max_resolution: VideoResolution,
    /// Frame rate ceiling
    pub max_fps: u32,
}

/// Per-track limits applied to the live connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityCaps {
    /// Audio limits, `None` when audio must not be sent
    pub audio: Option<AudioCaps>,
    /// Video limits, `None` when video must not be sent
    pub video: Option<VideoCaps>,
}

impl QualityCaps {
    /// Caps that stop all media
    pub fn silent() -> Self {
        Self {
            audio: None,
            video: None,
        }
    }
}

/// Whether the remote peer shares our local network segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Locality {
    /// Same local network
    Local,
    /// Different network
    Remote,
}

/// Locality classification with a confidence score in `[0, 1]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeerLocality {
    /// Classification
    pub locality: Locality,
    /// Confidence in the classification
    pub confidence: f32,
}

impl PeerLocality {
    /// Local classification with at least `threshold` confidence
    pub fn is_confident_local(&self, threshold: f32) -> bool {
        self.locality == Locality::Local && self.confidence >= threshold
    }
}

/// Call session information
///
/// Snapshot of the state owned by a session task. Published after every
/// mutation; never mutated by readers.
#[derive(Debug, Clone)]
pub struct CallSession<I: PeerIdentity> {
    /// Call identifier
    pub call_id: CallId,
    /// Local participant
    pub local: I,
    /// Remote participant
    pub remote: I,
    /// Which side we are
    pub role: Role,
    /// Current state
    pub state: CallState,
    /// Media constraints
    pub constraints: MediaConstraints,
    /// Classifier's current mode
    pub network_mode: NetworkMode,
    /// Active quality level
    pub quality: QualityLevel,
    /// Cached locality, once conclusive
    pub locality: Option<PeerLocality>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// When media started flowing
    pub connected_at: Option<DateTime<Utc>>,
    /// End time
    pub ended_at: Option<DateTime<Utc>>,
}

impl<I: PeerIdentity> CallSession<I> {
    /// Create a new call session in `Idle`
    pub fn new(
        call_id: CallId,
        local: I,
        remote: I,
        role: Role,
        constraints: MediaConstraints,
        network_mode: NetworkMode,
    ) -> Self {
        Self {
            call_id,
            local,
            remote,
            role,
            state: CallState::Idle,
            constraints,
            network_mode,
            quality: QualityLevel::HdVideo,
            locality: None,
            created_at: Utc::now(),
            connected_at: None,
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

    /// Get call duration
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.connected_at, self.ended_at) {
            (Some(start), Some(end)) => Some(end - start),
            (Some(start), None) => Some(Utc::now() - start),
            _ => None,
        }
    }

    /// Whether `participant` is one of the two parties
    pub fn involves(&self, participant: &I) -> bool {
        let id = participant.unique_id();
        self.local.unique_id() == id || self.remote.unique_id() == id
    }
}

/// Call event for notifications
#[derive(Debug, Clone)]
pub enum CallEvent<I: PeerIdentity> {
    /// An offer addressed to us arrived for a call we are not in
    IncomingCall {
        /// The offer
        offer: NegotiationMessage<I>,
    },
    /// The caller closed an announced incoming call before it was answered
    IncomingCallCancelled {
        /// Call identifier
        call_id: CallId,
    },
    /// Call placed and offer delivered to the relay
    CallPlaced {
        /// Call identifier
        call_id: CallId,
        /// Who is being called
        callee: I,
    },
    /// Remote description applied; media may flow
    Connected {
        /// Call identifier
        call_id: CallId,
    },
    /// Classifier changed mode
    NetworkModeChanged {
        /// Call identifier
        call_id: CallId,
        /// Previous mode
        from: NetworkMode,
        /// New mode
        to: NetworkMode,
    },
    /// Quality level changed
    QualityChanged {
        /// Call identifier
        call_id: CallId,
        /// Previous level
        from: QualityLevel,
        /// New level
        to: QualityLevel,
        /// Caps now applied
        caps: QualityCaps,
    },
    /// Media stopped; the call continues as text chat
    TextFallback {
        /// Call identifier
        call_id: CallId,
    },
    /// Locality classification became conclusive
    LocalityDetected {
        /// Call identifier
        call_id: CallId,
        /// Classification
        locality: PeerLocality,
    },
    /// User-facing quality signal changed
    UiSignal {
        /// Call identifier
        call_id: CallId,
        /// New signal
        signal: UiSignal,
    },
    /// Call ended
    CallEnded {
        /// Call identifier
        call_id: CallId,
        /// Why
        reason: EndReason,
    },
}

impl<I: PeerIdentity> CallEvent<I> {
    /// Call the event refers to
    pub fn call_id(&self) -> CallId {
        match self {
            Self::IncomingCall { offer } => offer.call_id,
            Self::IncomingCallCancelled { call_id }
            | Self::CallPlaced { call_id, .. }
            | Self::Connected { call_id }
            | Self::NetworkModeChanged { call_id, .. }
            | Self::QualityChanged { call_id, .. }
            | Self::TextFallback { call_id }
            | Self::LocalityDetected { call_id, .. }
            | Self::UiSignal { call_id, .. }
            | Self::CallEnded { call_id, .. } => *call_id,
        }
    }
}
