//! Media quality degradation
//!
//! Picks the active rung of the quality ladder from the classifier's mode
//! and the latest stats, and derives per-track caps for the live connection.
//!
//! The mode sets an upper bound (`NetworkMode::quality_ceiling`) that the
//! active level never exceeds. Moving down happens on the tick the bound
//! drops. Moving up waits until the bound has allowed a better level for
//! `upgrade_dwell_ticks` consecutive ticks, then moves to the best level
//! that was allowed throughout that run.

use crate::types::{
    AudioCaps, ConfigError, ConnectionStats, NetworkMode, QualityCaps, QualityLevel, VideoCaps,
    VideoResolution,
};
use serde::{Deserialize, Serialize};

/// Degradation engine tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DegradationConfig {
    /// Consecutive ticks a better level must be allowed before upgrading
    pub upgrade_dwell_ticks: u32,
    /// Share of the available bitrate media may use
    pub bitrate_headroom: f32,
    /// Video is never capped below this while it is on
    pub min_video_kbps: u32,
    /// Video bitrate at `HdVideo`
    pub hd_video_kbps: u32,
    /// Video bitrate at `SdVideo`
    pub sd_video_kbps: u32,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            upgrade_dwell_ticks: 3,
            bitrate_headroom: 0.85,
            min_video_kbps: 150,
            hd_video_kbps: 1_500,
            sd_video_kbps: 450,
        }
    }
}

impl DegradationConfig {
    /// Check the tuning is usable
    ///
    /// # Errors
    ///
    /// Returns error if the dwell is zero, the headroom is outside `(0, 1]`
    /// or the video bitrates are not ordered.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upgrade_dwell_ticks == 0 {
            return Err(ConfigError::Invalid(
                "upgrade_dwell_ticks must be at least 1".to_string(),
            ));
        }
        if !(self.bitrate_headroom > 0.0 && self.bitrate_headroom <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "bitrate_headroom {} outside (0, 1]",
                self.bitrate_headroom
            )));
        }
        if !(self.min_video_kbps <= self.sd_video_kbps && self.sd_video_kbps <= self.hd_video_kbps)
        {
            return Err(ConfigError::Invalid(
                "video bitrates must satisfy min <= sd <= hd".to_string(),
            ));
        }
        Ok(())
    }
}

/// What the controller must do with media after a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaDirective {
    /// Keep sending with the new caps
    Continue,
    /// Entered `TextFallback`: stop all media, surface text chat
    StopAll,
    /// Left `TextFallback`: start sending media again
    Resume,
}

/// Result of one engine tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityDecision {
    /// Level before this tick
    pub previous: QualityLevel,
    /// Level after this tick
    pub level: QualityLevel,
    /// Upper bound imposed by the network mode
    pub ceiling: QualityLevel,
    /// Caps to apply
    pub caps: QualityCaps,
    /// Media start/stop instruction
    pub directive: MediaDirective,
}

impl QualityDecision {
    /// Level moved this tick
    pub fn changed(&self) -> bool {
        self.previous != self.level
    }
}

/// Ladder selection with immediate downgrade and dwelled upgrade
#[derive(Debug, Clone)]
pub struct MediaQualityDegradationEngine {
    config: DegradationConfig,
    level: QualityLevel,
    upgrade_streak: u32,
    streak_floor: Option<QualityLevel>,
    video_enabled: bool,
}

impl MediaQualityDegradationEngine {
    /// Engine starting at the ceiling of `initial_mode`
    pub fn new(config: DegradationConfig, initial_mode: NetworkMode) -> Self {
        Self {
            config,
            level: initial_mode.quality_ceiling(),
            upgrade_streak: 0,
            streak_floor: None,
            video_enabled: true,
        }
    }

    /// Active level
    pub fn level(&self) -> QualityLevel {
        self.level
    }

    /// Whether video caps should be produced at video levels
    pub fn set_video_enabled(&mut self, enabled: bool) {
        self.video_enabled = enabled;
    }

    /// Run one tick
    pub fn evaluate(&mut self, mode: NetworkMode, stats: &ConnectionStats) -> QualityDecision {
        let previous = self.level;
        let ceiling = mode.quality_ceiling();

        if self.level > ceiling {
            self.level = ceiling;
            self.reset_streak();
        } else if ceiling > self.level {
            self.upgrade_streak += 1;
            let floor = self.streak_floor.map_or(ceiling, |f| f.min(ceiling));
            self.streak_floor = Some(floor);
            if self.upgrade_streak >= self.config.upgrade_dwell_ticks {
                self.level = floor;
                self.reset_streak();
            }
        } else {
            self.reset_streak();
        }

        let directive = match (previous, self.level) {
            (p, QualityLevel::TextFallback) if p != QualityLevel::TextFallback => {
                MediaDirective::StopAll
            }
            (QualityLevel::TextFallback, l) if l != QualityLevel::TextFallback => {
                MediaDirective::Resume
            }
            _ => MediaDirective::Continue,
        };

        if previous != self.level {
            tracing::debug!(
                from = %previous,
                to = %self.level,
                %mode,
                "Quality level changed"
            );
        }

        QualityDecision {
            previous,
            level: self.level,
            ceiling,
            caps: self.caps(mode, stats),
            directive,
        }
    }

    fn reset_streak(&mut self) {
        self.upgrade_streak = 0;
        self.streak_floor = None;
    }

    /// Caps for the active level under `mode` and `stats`
    pub fn caps(&self, mode: NetworkMode, stats: &ConnectionStats) -> QualityCaps {
        if self.level == QualityLevel::TextFallback {
            return QualityCaps::silent();
        }

        let audio = audio_caps(mode);
        let video = match self.level {
            QualityLevel::HdVideo if self.video_enabled => Some((
                self.config.hd_video_kbps,
                VideoResolution::HD720,
                30,
            )),
            QualityLevel::SdVideo if self.video_enabled => Some((
                self.config.sd_video_kbps,
                VideoResolution::SD360,
                20,
            )),
            _ => None,
        }
        .map(|(nominal, max_resolution, max_fps)| {
            let budget = (f64::from(stats.available_kbps) * f64::from(self.config.bitrate_headroom))
                .round() as u32;
            let budget = budget.saturating_sub(audio.max_bitrate_kbps);
            VideoCaps {
                max_bitrate_kbps: nominal.min(budget).max(self.config.min_video_kbps),
                max_resolution,
                max_fps,
            }
        });

        QualityCaps {
            audio: Some(audio),
            video,
        }
    }
}

fn audio_caps(mode: NetworkMode) -> AudioCaps {
    match mode {
        NetworkMode::High => AudioCaps {
            max_bitrate_kbps: 40,
            dtx: false,
        },
        NetworkMode::Medium => AudioCaps {
            max_bitrate_kbps: 32,
            dtx: false,
        },
        NetworkMode::Low => AudioCaps {
            max_bitrate_kbps: 20,
            dtx: true,
        },
        NetworkMode::VeryLow | NetworkMode::Offline => AudioCaps {
            max_bitrate_kbps: 10,
            dtx: true,
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn stats() -> ConnectionStats {
        ConnectionStats::new(50, 0.0, 3_000)
    }

    fn engine() -> MediaQualityDegradationEngine {
        MediaQualityDegradationEngine::new(DegradationConfig::default(), NetworkMode::High)
    }

    #[test]
    fn test_downgrade_is_immediate() {
        let mut e = engine();
        let d = e.evaluate(NetworkMode::Low, &stats());
        assert_eq!(d.previous, QualityLevel::HdVideo);
        assert_eq!(d.level, QualityLevel::AudioOnly);
        assert!(d.changed());
        assert_eq!(d.directive, MediaDirective::Continue);
        assert!(d.caps.video.is_none());
        assert!(d.caps.audio.unwrap().dtx);
    }

    #[test]
    fn test_upgrade_waits_for_dwell() {
        let mut e = engine();
        e.evaluate(NetworkMode::Low, &stats());

        let one = e.evaluate(NetworkMode::High, &stats());
        assert_eq!(one.level, QualityLevel::AudioOnly);
        let back_down = e.evaluate(NetworkMode::Low, &stats());
        assert_eq!(back_down.level, QualityLevel::AudioOnly);

        assert_eq!(e.evaluate(NetworkMode::High, &stats()).level, QualityLevel::AudioOnly);
        assert_eq!(e.evaluate(NetworkMode::High, &stats()).level, QualityLevel::AudioOnly);
        let third = e.evaluate(NetworkMode::High, &stats());
        assert_eq!(third.level, QualityLevel::HdVideo);
        assert_eq!(third.previous, QualityLevel::AudioOnly);
    }

    #[test]
    fn test_upgrade_goes_to_level_allowed_throughout() {
        let mut e = engine();
        e.evaluate(NetworkMode::Offline, &stats());
        e.evaluate(NetworkMode::High, &stats());
        e.evaluate(NetworkMode::Medium, &stats());
        let d = e.evaluate(NetworkMode::High, &stats());
        assert_eq!(d.level, QualityLevel::SdVideo);
        assert_eq!(d.directive, MediaDirective::Resume);
    }

    #[test]
    fn test_text_fallback_stops_media() {
        let mut e = engine();
        let d = e.evaluate(NetworkMode::Offline, &stats());
        assert_eq!(d.level, QualityLevel::TextFallback);
        assert_eq!(d.directive, MediaDirective::StopAll);
        assert_eq!(d.caps, QualityCaps::silent());

        let again = e.evaluate(NetworkMode::Offline, &stats());
        assert_eq!(again.directive, MediaDirective::Continue);
    }

    #[test]
    fn test_video_caps_follow_available_bitrate() {
        let mut e = engine();
        let d = e.evaluate(NetworkMode::High, &ConnectionStats::new(50, 0.0, 1_000));
        let video = d.caps.video.unwrap();
        // 1000 * 0.85 - 40 audio
        assert_eq!(video.max_bitrate_kbps, 810);
        assert_eq!(video.max_resolution, VideoResolution::HD720);

        let starved = e.caps(NetworkMode::High, &ConnectionStats::new(50, 0.0, 100));
        assert_eq!(starved.video.unwrap().max_bitrate_kbps, 150);
    }

    #[test]
    fn test_video_disabled_means_no_video_caps() {
        let mut e = engine();
        e.set_video_enabled(false);
        let d = e.evaluate(NetworkMode::High, &stats());
        assert_eq!(d.level, QualityLevel::HdVideo);
        assert!(d.caps.video.is_none());
        assert!(d.caps.audio.is_some());
    }

    #[test]
    fn test_config_validation() {
        assert!(DegradationConfig::default().validate().is_ok());
        let bad = DegradationConfig {
            upgrade_dwell_ticks: 0,
            ..DegradationConfig::default()
        };
        assert!(bad.validate().is_err());
        let bad = DegradationConfig {
            bitrate_headroom: 1.5,
            ..DegradationConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
