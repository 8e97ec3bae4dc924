//! User-facing call quality signal
//!
//! A coarse view derived from the session's network mode and quality level.
//! No decisions are made here; the calling surface decides how to render it.

use crate::identity::PeerIdentity;
use crate::types::{CallEvent, CallId, CallState, NetworkMode, QualityLevel};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Coarse quality indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalIndicator {
    /// HD video on a good network
    Excellent,
    /// Video, possibly reduced
    Good,
    /// Audio only
    Poor,
    /// Text only
    Critical,
    /// No connectivity or call over
    Offline,
}

impl fmt::Display for SignalIndicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Poor => "poor",
            Self::Critical => "critical",
            Self::Offline => "offline",
        };
        f.write_str(s)
    }
}

/// Signal plus whether it warrants a blocking banner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiSignal {
    /// Indicator to show
    pub indicator: SignalIndicator,
    /// Change should interrupt the user rather than update quietly
    pub interruptive: bool,
}

/// Project the session's condition onto a [`UiSignal`]
///
/// `previous` is the level before the change being projected, if any.
/// Interruptive changes: the call ending, entering text fallback (which
/// includes going offline) and losing video.
pub fn project(
    mode: NetworkMode,
    level: QualityLevel,
    state: CallState,
    previous: Option<QualityLevel>,
) -> UiSignal {
    if state.is_ended() {
        return UiSignal {
            indicator: SignalIndicator::Offline,
            interruptive: true,
        };
    }

    let indicator = match (mode, level) {
        (NetworkMode::Offline, _) => SignalIndicator::Offline,
        (_, QualityLevel::TextFallback) => SignalIndicator::Critical,
        (_, QualityLevel::AudioOnly) => SignalIndicator::Poor,
        (NetworkMode::High, QualityLevel::HdVideo) => SignalIndicator::Excellent,
        (_, QualityLevel::SdVideo | QualityLevel::HdVideo) => SignalIndicator::Good,
    };

    let interruptive = previous.is_some_and(|prev| {
        let entered_fallback =
            level == QualityLevel::TextFallback && prev != QualityLevel::TextFallback;
        let lost_video = prev.has_video() && !level.has_video();
        entered_fallback || lost_video
    });

    UiSignal {
        indicator,
        interruptive,
    }
}

/// Stream of UI signals from a controller event receiver
///
/// Lagged receivers skip the missed events.
pub fn ui_signals<I: PeerIdentity>(
    events: broadcast::Receiver<CallEvent<I>>,
) -> impl Stream<Item = (CallId, UiSignal)> {
    BroadcastStream::new(events).filter_map(|event| async move {
        match event {
            Ok(CallEvent::UiSignal { call_id, signal }) => Some((call_id, signal)),
            Ok(_) => None,
            Err(err) => {
                tracing::warn!(error = %err, "UI signal stream lagged");
                None
            }
        }
    })
}
