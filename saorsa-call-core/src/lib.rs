//! Saorsa Call - adaptive call signaling and media-quality control
//!
//! This library drives one-to-one calls over an unreliable signal relay and
//! keeps them usable as the network changes. It features:
//!
//! - **Session State Machine**: one task per call, `Negotiating` through
//!   `Connected`/`Degraded` to `Ended`, with a negotiation timeout
//! - **Relay Signaling**: offer/answer/candidate messages over a call-keyed
//!   append-only log, deduplicated by sequence number
//! - **Network Classification**: five network modes with hysteresis
//! - **Quality Ladder**: HD video down to text-only, immediate downgrade and
//!   dwelled upgrade
//! - **Locality Detection**: same-LAN peers are steered onto a direct path
//! - **Codec Shaping**: Opus profiles and candidate compaction per mode
//!
//! The media engine itself is outside the crate: hosts plug in their live
//! connection, device layer and relay through traits. The `simulation`
//! feature provides in-memory implementations of all of them.
//!
//! # Examples
//!
//! ```rust,no_run
//! use saorsa_call_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let relay = Arc::new(InMemoryRelay::new());
//! let alice = PeerIdentityString::new("alice");
//! let bob = PeerIdentityString::new("bob");
//!
//! let caller = CallManager::builder(relay.clone()).build().await?;
//! let callee = CallManager::builder(relay)
//!     .with_local_identity(bob.clone())
//!     .build()
//!     .await?;
//!
//! let session = caller
//!     .place_call(alice, bob.clone(), MediaConstraints::video_call())
//!     .await?;
//! callee.watch_incoming(session.call_id, bob).await?;
//!
//! let mut events = callee.subscribe_events();
//! while let Ok(event) = events.recv().await {
//!     if let CallEvent::IncomingCall { offer } = event {
//!         callee.accept_incoming(offer).await?;
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::unused_async)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::derivable_impls)]

/// Core call types and data structures
pub mod types;

/// Peer identity abstraction
pub mod identity;

/// Negotiation messages, ordering and candidate buffering
pub mod signaling;

/// Signal relay trait and retrying client
pub mod relay;

/// Network mode classification
pub mod network;

/// Media quality ladder
pub mod quality;

/// ICE candidate lines
pub mod candidate;

/// Session description shaping and candidate batching
pub mod negotiation;

/// Peer locality detection
pub mod locality;

/// User-facing quality signal
pub mod ui_signal;

/// Local media devices
pub mod media;

/// Live connection abstraction
pub mod connection;

/// Call store and push alerts
pub mod backend;

mod registry;

/// Per-call session task
pub mod session;

/// Call management
pub mod call;

// Re-export main types at crate root
pub use backend::{
    CallRecord, CallRecordUpdate, CallStore, IncomingCallAlert, PushError, PushNotifier,
    StoreError,
};
#[cfg(feature = "simulation")]
pub use backend::{ChannelPushNotifier, InMemoryCallStore};
pub use call::{CallError, CallManager, CallManagerBuilder, CallManagerConfig};
pub use candidate::{CandidateType, IceCandidate};
pub use connection::{ConnectionError, ConnectionFactory, LiveConnection};
#[cfg(feature = "simulation")]
pub use connection::{SimulatedConnection, SimulatedConnectionFactory};
pub use identity::{PeerIdentity, PeerIdentityString};
pub use locality::LocalPeerDiscovery;
pub use media::{DeviceInfo, DeviceKind, MediaDevices, MediaError, MediaGuard, MediaHandle};
#[cfg(feature = "simulation")]
pub use media::SimulatedDevices;
pub use negotiation::{
    BatchConfig, CandidateBatch, CandidateBatcher, CodecNegotiationOptimizer, OpusProfile,
};
pub use network::{ClassifierConfig, ModeChange, NetworkModeClassifier, WindowSummary};
pub use quality::{
    DegradationConfig, MediaDirective, MediaQualityDegradationEngine, QualityDecision,
};
#[cfg(feature = "simulation")]
pub use relay::InMemoryRelay;
pub use relay::{RelayClient, RelayEnvelope, RelayError, RetryPolicy, SignalRelay};
pub use session::SignalOutcome;
pub use signaling::{MessageKind, NegotiationMessage, SignalingError};
pub use types::*;
pub use ui_signal::{SignalIndicator, UiSignal};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::{CallError, CallManager, CallManagerConfig};
    pub use crate::identity::{PeerIdentity, PeerIdentityString};
    #[cfg(feature = "simulation")]
    pub use crate::relay::InMemoryRelay;
    pub use crate::relay::SignalRelay;
    pub use crate::session::SignalOutcome;
    pub use crate::signaling::{MessageKind, NegotiationMessage};
    pub use crate::types::{
        CallEvent, CallId, CallSession, CallState, ConnectionStats, EndReason, MediaConstraints,
        NetworkMode, QualityLevel,
    };
    pub use crate::ui_signal::{SignalIndicator, UiSignal};
}
