//! Network mode classification
//!
//! Turns a stream of connection statistics into a discrete [`NetworkMode`].
//! Each sample is scored against a fixed threshold table; the visible mode
//! only moves once `hysteresis_samples` consecutive samples agree on the same
//! new mode. A single sample showing total connectivity loss forces
//! `Offline` at once; getting back out of `Offline` still needs the full run
//! of agreeing samples.

use crate::types::{ConfigError, ConnectionStats, NetworkMode};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Minimum conditions for one network mode
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModeThreshold {
    /// Mode these thresholds qualify for
    pub mode: NetworkMode,
    /// Available bitrate must be at least this
    pub min_kbps: u32,
    /// Round-trip time must be at most this
    pub max_rtt_ms: u32,
    /// Loss fraction must be at most this
    pub max_loss: f32,
}

impl ModeThreshold {
    fn admits(&self, sample: &ConnectionStats) -> bool {
        let rtt_ok = sample.rtt_ms.is_some_and(|rtt| rtt <= self.max_rtt_ms);
        sample.available_kbps >= self.min_kbps && rtt_ok && sample.loss_fraction <= self.max_loss
    }
}

/// Classifier tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Samples kept in the rolling window
    pub window_size: usize,
    /// Consecutive agreeing samples needed to change mode
    pub hysteresis_samples: usize,
    /// Mode before any sample arrives
    pub initial_mode: NetworkMode,
    /// Threshold table, best mode first; a sample gets the first mode it
    /// satisfies and `VeryLow` if it satisfies none
    pub thresholds: Vec<ModeThreshold>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            window_size: 8,
            hysteresis_samples: 3,
            initial_mode: NetworkMode::High,
            thresholds: vec![
                ModeThreshold {
                    mode: NetworkMode::High,
                    min_kbps: 1_500,
                    max_rtt_ms: 150,
                    max_loss: 0.02,
                },
                ModeThreshold {
                    mode: NetworkMode::Medium,
                    min_kbps: 500,
                    max_rtt_ms: 300,
                    max_loss: 0.05,
                },
                ModeThreshold {
                    mode: NetworkMode::Low,
                    min_kbps: 64,
                    max_rtt_ms: 700,
                    max_loss: 0.12,
                },
            ],
        }
    }
}

impl ClassifierConfig {
    /// Check the tuning is usable
    ///
    /// # Errors
    ///
    /// Returns error if the window cannot hold a full hysteresis run, or the
    /// threshold table is not ordered best-first.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hysteresis_samples == 0 {
            return Err(ConfigError::Invalid(
                "hysteresis_samples must be at least 1".to_string(),
            ));
        }
        if self.hysteresis_samples > self.window_size {
            return Err(ConfigError::Invalid(format!(
                "hysteresis_samples ({}) exceeds window_size ({})",
                self.hysteresis_samples, self.window_size
            )));
        }
        let ordered = self.thresholds.windows(2).all(|w| w[0].mode > w[1].mode);
        if !ordered {
            return Err(ConfigError::Invalid(
                "thresholds must be listed best mode first".to_string(),
            ));
        }
        if self
            .thresholds
            .iter()
            .any(|t| t.mode <= NetworkMode::VeryLow || !(0.0..=1.0).contains(&t.max_loss))
        {
            return Err(ConfigError::Invalid(
                "thresholds may only name Low and above, with loss in [0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

/// Emitted exactly once per visible mode transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeChange {
    /// Mode before the sample
    pub from: NetworkMode,
    /// Mode after the sample
    pub to: NetworkMode,
    /// Forced by connectivity loss, bypassing hysteresis
    pub forced: bool,
}

/// Mean values over the window
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WindowSummary {
    /// Samples in the window
    pub samples: usize,
    /// Mean RTT over samples that had one
    pub mean_rtt_ms: Option<u32>,
    /// Mean loss fraction
    pub mean_loss: f32,
    /// Mean available bitrate
    pub mean_kbps: u32,
}

#[derive(Debug, Clone)]
struct ScoredSample {
    stats: ConnectionStats,
    mode: NetworkMode,
}

/// Sliding-window classifier with hysteresis
#[derive(Debug, Clone)]
pub struct NetworkModeClassifier {
    config: ClassifierConfig,
    window: VecDeque<ScoredSample>,
    mode: NetworkMode,
}

impl NetworkModeClassifier {
    /// Create a classifier starting at `config.initial_mode`
    pub fn new(config: ClassifierConfig) -> Self {
        let mode = config.initial_mode;
        Self {
            window: VecDeque::with_capacity(config.window_size),
            config,
            mode,
        }
    }

    /// Create a classifier starting at `mode`
    pub fn starting_at(config: ClassifierConfig, mode: NetworkMode) -> Self {
        let mut classifier = Self::new(config);
        classifier.mode = mode;
        classifier
    }

    /// Current visible mode
    pub fn mode(&self) -> NetworkMode {
        self.mode
    }

    /// Mode a single sample scores on its own
    pub fn score(&self, sample: &ConnectionStats) -> NetworkMode {
        if sample.is_connectivity_loss() {
            return NetworkMode::Offline;
        }
        self.config
            .thresholds
            .iter()
            .find(|t| t.admits(sample))
            .map_or(NetworkMode::VeryLow, |t| t.mode)
    }

    /// Feed one sample; returns the transition if the visible mode changed
    pub fn observe(&mut self, sample: ConnectionStats) -> Option<ModeChange> {
        let scored = self.score(&sample);
        if self.window.len() == self.config.window_size {
            self.window.pop_front();
        }
        self.window.push_back(ScoredSample {
            stats: sample,
            mode: scored,
        });

        if scored == NetworkMode::Offline && self.mode != NetworkMode::Offline {
            return Some(self.transition(NetworkMode::Offline, true));
        }

        let k = self.config.hysteresis_samples;
        if scored == self.mode || self.window.len() < k {
            return None;
        }
        let agreed = self.window.iter().rev().take(k).all(|s| s.mode == scored);
        agreed.then(|| self.transition(scored, false))
    }

    fn transition(&mut self, to: NetworkMode, forced: bool) -> ModeChange {
        let change = ModeChange {
            from: self.mode,
            to,
            forced,
        };
        self.mode = to;
        tracing::debug!(from = %change.from, to = %change.to, forced, "Network mode changed");
        change
    }

    /// Mean values over the current window
    pub fn summary(&self) -> WindowSummary {
        let samples = self.window.len();
        if samples == 0 {
            return WindowSummary {
                samples,
                mean_rtt_ms: None,
                mean_loss: 0.0,
                mean_kbps: 0,
            };
        }
        let rtts: Vec<u64> = self
            .window
            .iter()
            .filter_map(|s| s.stats.rtt_ms.map(u64::from))
            .collect();
        let mean_rtt_ms =
            (!rtts.is_empty()).then(|| (rtts.iter().sum::<u64>() / rtts.len() as u64) as u32);
        let mean_loss =
            self.window.iter().map(|s| s.stats.loss_fraction).sum::<f32>() / samples as f32;
        let mean_kbps = (self
            .window
            .iter()
            .map(|s| u64::from(s.stats.available_kbps))
            .sum::<u64>()
            / samples as u64) as u32;
        WindowSummary {
            samples,
            mean_rtt_ms,
            mean_loss,
            mean_kbps,
        }
    }
}
