//! Offline tools: replay stats through the classifier, shape a description

use anyhow::{Context, Result};
use clap::ValueEnum;
use saorsa_call_core::{
    CallManagerConfig, CodecNegotiationOptimizer, ConnectionStats, MediaQualityDegradationEngine,
    NetworkMode, NetworkModeClassifier, QualityLevel, WindowSummary,
};
use serde::Serialize;
use std::path::Path;

/// Network mode as a command-line value
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliNetworkMode {
    /// No connectivity
    Offline,
    /// Narrowband audio
    VeryLow,
    /// Audio only
    Low,
    /// SD video
    Medium,
    /// Unconstrained
    High,
}

impl From<CliNetworkMode> for NetworkMode {
    fn from(mode: CliNetworkMode) -> Self {
        match mode {
            CliNetworkMode::Offline => NetworkMode::Offline,
            CliNetworkMode::VeryLow => NetworkMode::VeryLow,
            CliNetworkMode::Low => NetworkMode::Low,
            CliNetworkMode::Medium => NetworkMode::Medium,
            CliNetworkMode::High => NetworkMode::High,
        }
    }
}

/// Classifier and engine output for one sample
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickReport {
    /// Sample index
    pub tick: usize,
    /// What the sample scored on its own
    pub scored: NetworkMode,
    /// Mode after hysteresis
    pub mode: NetworkMode,
    /// Quality level after the engine ran
    pub level: QualityLevel,
    /// Video bitrate cap, if video is sent
    pub video_kbps: Option<u32>,
    /// Classifier window after this sample
    pub window: WindowSummary,
}

/// Read a JSON array of stats samples
pub fn read_samples(path: &Path) -> Result<Vec<ConnectionStats>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

/// Run every sample through a fresh classifier and engine
pub fn classify(config: &CallManagerConfig, samples: Vec<ConnectionStats>) -> Vec<TickReport> {
    let mut classifier = NetworkModeClassifier::new(config.classifier.clone());
    let mut engine =
        MediaQualityDegradationEngine::new(config.degradation.clone(), classifier.mode());

    samples
        .into_iter()
        .enumerate()
        .map(|(tick, sample)| {
            let scored = classifier.score(&sample);
            classifier.observe(sample.clone());
            let decision = engine.evaluate(classifier.mode(), &sample);
            TickReport {
                tick,
                scored,
                mode: classifier.mode(),
                level: decision.level,
                video_kbps: decision.caps.video.map(|v| v.max_bitrate_kbps),
                window: classifier.summary(),
            }
        })
        .collect()
}

/// Rewrite a session description file for `mode`
pub fn optimize_file(path: &Path, mode: NetworkMode) -> Result<String> {
    let sdp = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    if !sdp.starts_with("v=") {
        anyhow::bail!("{} does not look like a session description", path.display());
    }
    Ok(CodecNegotiationOptimizer::optimize_description(&sdp, mode))
}
