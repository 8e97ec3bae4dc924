//! Negotiation payload shaping
//!
//! [`CodecNegotiationOptimizer`] rewrites session descriptions for the
//! current network mode: Opus parameters are tightened on poor networks and
//! connectivity candidate lines are deduplicated and compacted.
//!
//! [`CandidateBatcher`] groups locally gathered candidates so they go out
//! over the relay in a few messages instead of one per candidate.

use crate::candidate::IceCandidate;
use crate::types::{CallId, ConfigError, NetworkMode};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;

/// Opus parameters written into the audio section
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpusProfile {
    /// Highest sample rate the decoder wants to receive
    pub max_playback_rate: u32,
    /// Average bitrate target in bits per second
    pub max_average_bitrate: u32,
    /// Packet duration in milliseconds
    pub ptime_ms: u32,
    /// In-band forward error correction
    pub inband_fec: bool,
    /// Discontinuous transmission
    pub dtx: bool,
}

impl OpusProfile {
    /// Profile for `mode`; `None` leaves the description untouched
    pub fn for_mode(mode: NetworkMode) -> Option<Self> {
        match mode {
            NetworkMode::High => None,
            NetworkMode::Medium => Some(Self {
                max_playback_rate: 24_000,
                max_average_bitrate: 32_000,
                ptime_ms: 20,
                inband_fec: true,
                dtx: false,
            }),
            NetworkMode::Low => Some(Self {
                max_playback_rate: 16_000,
                max_average_bitrate: 20_000,
                ptime_ms: 40,
                inband_fec: true,
                dtx: true,
            }),
            NetworkMode::VeryLow | NetworkMode::Offline => Some(Self {
                max_playback_rate: 8_000,
                max_average_bitrate: 10_000,
                ptime_ms: 60,
                inband_fec: true,
                dtx: true,
            }),
        }
    }

    fn fmtp_params(&self) -> [(&'static str, String); 6] {
        [
            ("maxplaybackrate", self.max_playback_rate.to_string()),
            ("sprop-maxcapturerate", self.max_playback_rate.to_string()),
            ("maxaveragebitrate", self.max_average_bitrate.to_string()),
            ("useinbandfec", u8::from(self.inband_fec).to_string()),
            ("usedtx", u8::from(self.dtx).to_string()),
            ("stereo", "0".to_string()),
        ]
    }
}

/// Stateless session description rewriter
#[derive(Debug, Clone, Copy, Default)]
pub struct CodecNegotiationOptimizer;

impl CodecNegotiationOptimizer {
    /// Rewrite `sdp` for `mode`
    ///
    /// Candidate lines are always deduplicated, stripped of unreachable
    /// active-TCP entries and compacted. Opus parameters are only touched
    /// below `High`. Lines that do not parse are passed through unchanged.
    /// The input's line ending style is kept.
    pub fn optimize_description(sdp: &str, mode: NetworkMode) -> String {
        let newline = if sdp.contains("\r\n") { "\r\n" } else { "\n" };
        let mut lines = Self::shape_candidates(sdp.lines());

        if let Some(profile) = OpusProfile::for_mode(mode) {
            Self::apply_opus_profile(&mut lines, profile);
        }

        let mut out = lines.join(newline);
        if !out.is_empty() {
            out.push_str(newline);
        }
        out
    }

    /// Compact form of one candidate line
    ///
    /// Returns `None` for candidates that are never worth sending. The `a=`
    /// prefix is kept when the input had one. Unparseable lines come back
    /// unchanged.
    pub fn compress_candidate(line: &str) -> Option<String> {
        let trimmed = line.trim();
        let Ok(candidate) = IceCandidate::parse(trimmed) else {
            return Some(trimmed.to_string());
        };
        if candidate.is_active_tcp() {
            return None;
        }
        let prefix = if trimmed.starts_with("a=") { "a=" } else { "" };
        Some(format!("{prefix}{}", candidate.compact()))
    }

    fn shape_candidates<'a>(lines: impl Iterator<Item = &'a str>) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut kept = Vec::new();
        let mut dropped = 0usize;

        for line in lines {
            if !line.starts_with("a=candidate:") {
                kept.push(line.to_string());
                continue;
            }
            let Ok(candidate) = IceCandidate::parse(line) else {
                kept.push(line.to_string());
                continue;
            };
            if candidate.is_active_tcp() || !seen.insert(candidate.path_key()) {
                dropped += 1;
                continue;
            }
            kept.push(format!("a={}", candidate.compact()));
        }

        if dropped > 0 {
            tracing::trace!(dropped, "Removed redundant candidate lines");
        }
        kept
    }

    fn apply_opus_profile(lines: &mut Vec<String>, profile: OpusProfile) {
        let Some((start, end)) = audio_section(lines) else {
            return;
        };
        let Some((rtpmap_idx, payload_type)) = lines[start..end]
            .iter()
            .enumerate()
            .find_map(|(i, line)| opus_payload_type(line).map(|pt| (start + i, pt)))
        else {
            return;
        };

        let fmtp_prefix = format!("a=fmtp:{payload_type} ");
        let fmtp_idx = match lines[start..end]
            .iter()
            .position(|l| l.starts_with(&fmtp_prefix))
        {
            Some(i) => {
                let idx = start + i;
                let existing = lines[idx][fmtp_prefix.len()..].to_string();
                lines[idx] = format!("{fmtp_prefix}{}", merge_fmtp(&existing, &profile));
                idx
            }
            None => {
                let idx = rtpmap_idx + 1;
                lines.insert(idx, format!("{fmtp_prefix}{}", merge_fmtp("", &profile)));
                idx
            }
        };

        // Section may have grown by the inserted fmtp line
        let end = audio_section(lines).map_or(lines.len(), |(_, e)| e);
        let ptime = format!("a=ptime:{}", profile.ptime_ms);
        match lines[start..end]
            .iter()
            .position(|l| l.starts_with("a=ptime:"))
        {
            Some(i) => lines[start + i] = ptime,
            None => lines.insert(fmtp_idx + 1, ptime),
        }
    }
}

fn audio_section(lines: &[String]) -> Option<(usize, usize)> {
    let start = lines.iter().position(|l| l.starts_with("m=audio"))?;
    let end = lines[start + 1..]
        .iter()
        .position(|l| l.starts_with("m="))
        .map_or(lines.len(), |i| start + 1 + i);
    Some((start, end))
}

fn opus_payload_type(line: &str) -> Option<u8> {
    let rest = line.strip_prefix("a=rtpmap:")?;
    let (pt, encoding) = rest.split_once(' ')?;
    encoding
        .to_ascii_lowercase()
        .starts_with("opus/")
        .then(|| pt.parse().ok())
        .flatten()
}

fn merge_fmtp(existing: &str, profile: &OpusProfile) -> String {
    let overrides = profile.fmtp_params();
    let mut params: Vec<(String, String)> = existing
        .split(';')
        .filter_map(|p| {
            let (k, v) = p.trim().split_once('=')?;
            Some((k.trim().to_string(), v.trim().to_string()))
        })
        .filter(|(k, _)| !overrides.iter().any(|(o, _)| o == k))
        .collect();
    params.extend(overrides.into_iter().map(|(k, v)| (k.to_string(), v)));
    params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(";")
}

/// Candidate batching tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// A batch is flushed once it holds this many candidates
    pub max_batch: usize,
    /// A batch is flushed this long after its first candidate
    pub max_delay_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch: 8,
            max_delay_ms: 150,
        }
    }
}

impl BatchConfig {
    /// Check the tuning is usable
    ///
    /// # Errors
    ///
    /// Returns error if `max_batch` is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_batch == 0 {
            return Err(ConfigError::Invalid(
                "max_batch must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Batch delay as a duration
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Candidates ready to go out in one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateBatch {
    /// Call the candidates belong to
    pub call_id: CallId,
    /// Compacted candidate lines, in gathering order
    pub candidates: Vec<String>,
}

#[derive(Debug)]
struct PendingBatch {
    candidates: Vec<String>,
    opened_at: Instant,
}

/// Groups outgoing candidates per call by size and age
#[derive(Debug)]
pub struct CandidateBatcher {
    config: BatchConfig,
    pending: HashMap<CallId, PendingBatch>,
}

impl CandidateBatcher {
    /// Create a batcher
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            pending: HashMap::new(),
        }
    }

    /// Add a candidate; calls `flush` if the batch for `call_id` is full
    ///
    /// Candidates that are never worth sending and exact repeats within the
    /// open batch are dropped. Returns whether a flush happened.
    pub fn batch_candidates<F>(
        &mut self,
        call_id: CallId,
        candidate: &str,
        now: Instant,
        flush: F,
    ) -> bool
    where
        F: FnOnce(CandidateBatch),
    {
        let Some(line) = CodecNegotiationOptimizer::compress_candidate(candidate) else {
            tracing::trace!(%call_id, "Dropping unreachable candidate");
            return false;
        };

        let batch = self.pending.entry(call_id).or_insert_with(|| PendingBatch {
            candidates: Vec::new(),
            opened_at: now,
        });
        if batch.candidates.contains(&line) {
            return false;
        }
        batch.candidates.push(line);

        if batch.candidates.len() >= self.config.max_batch {
            if let Some(batch) = self.pending.remove(&call_id) {
                flush(CandidateBatch {
                    call_id,
                    candidates: batch.candidates,
                });
                return true;
            }
        }
        false
    }

    /// Flush every batch older than the configured delay
    pub fn flush_expired<F>(&mut self, now: Instant, mut flush: F)
    where
        F: FnMut(CandidateBatch),
    {
        let delay = self.config.max_delay();
        let expired: Vec<CallId> = self
            .pending
            .iter()
            .filter(|(_, b)| now.saturating_duration_since(b.opened_at) >= delay)
            .map(|(id, _)| *id)
            .collect();
        for call_id in expired {
            if let Some(batch) = self.pending.remove(&call_id) {
                flush(CandidateBatch {
                    call_id,
                    candidates: batch.candidates,
                });
            }
        }
    }

    /// Flush whatever is pending for `call_id`
    pub fn flush_call(&mut self, call_id: CallId) -> Option<CandidateBatch> {
        self.pending.remove(&call_id).map(|b| CandidateBatch {
            call_id,
            candidates: b.candidates,
        })
    }

    /// Earliest instant at which a pending batch expires
    pub fn next_deadline(&self) -> Option<Instant> {
        let delay = self.config.max_delay();
        self.pending.values().map(|b| b.opened_at + delay).min()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const OFFER: &str = "v=0\r\n\
o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111 0\r\n\
c=IN IP4 0.0.0.0\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=fmtp:111 minptime=10;useinbandfec=1\r\n\
a=rtpmap:0 PCMU/8000\r\n\
a=candidate:1 1 udp 2122260223 192.168.1.20 50000 typ host generation 0 network-id 1\r\n\
a=candidate:2 1 udp 2122260223 192.168.1.20 50000 typ host generation 0 network-id 2\r\n\
a=candidate:3 1 tcp 1518280447 192.168.1.20 9 typ host tcptype active generation 0\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
a=rtpmap:96 VP8/90000\r\n";

    #[test]
    fn test_high_mode_only_shapes_candidates() {
        let out = CodecNegotiationOptimizer::optimize_description(OFFER, NetworkMode::High);
        assert!(out.contains("a=fmtp:111 minptime=10;useinbandfec=1\r\n"));
        assert!(!out.contains("a=ptime"));
        assert!(out.contains("a=candidate:1 1 udp 2122260223 192.168.1.20 50000 typ host\r\n"));
        assert!(!out.contains("a=candidate:2 "));
        assert!(!out.contains("tcptype active"));
        assert!(out.ends_with("a=rtpmap:96 VP8/90000\r\n"));
    }

    #[test]
    fn test_low_mode_rewrites_existing_fmtp() {
        let out = CodecNegotiationOptimizer::optimize_description(OFFER, NetworkMode::Low);
        assert!(out.contains(
            "a=fmtp:111 minptime=10;maxplaybackrate=16000;sprop-maxcapturerate=16000;\
maxaveragebitrate=20000;useinbandfec=1;usedtx=1;stereo=0\r\na=ptime:40\r\n"
        ));
        // Video section untouched
        let video = out.split("m=video").nth(1).unwrap();
        assert!(!video.contains("a=ptime"));
    }

    #[test]
    fn test_missing_fmtp_is_inserted_after_rtpmap() {
        let sdp = "v=0\nm=audio 9 RTP/AVP 109\na=rtpmap:109 OPUS/48000/2\na=ptime:20\n";
        let out = CodecNegotiationOptimizer::optimize_description(sdp, NetworkMode::VeryLow);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(
            lines,
            vec![
                "v=0",
                "m=audio 9 RTP/AVP 109",
                "a=rtpmap:109 OPUS/48000/2",
                "a=fmtp:109 maxplaybackrate=8000;sprop-maxcapturerate=8000;maxaveragebitrate=10000;useinbandfec=1;usedtx=1;stereo=0",
                "a=ptime:60",
            ]
        );
        assert!(!out.contains('\r'));
    }

    #[test]
    fn test_without_opus_nothing_changes() {
        let sdp = "v=0\r\nm=audio 9 RTP/AVP 0\r\na=rtpmap:0 PCMU/8000\r\n";
        let out = CodecNegotiationOptimizer::optimize_description(sdp, NetworkMode::Low);
        assert_eq!(out, sdp);
    }

    #[test]
    fn test_compress_candidate() {
        assert_eq!(
            CodecNegotiationOptimizer::compress_candidate(
                "candidate:7 1 udp 1 10.0.0.1 5000 typ host generation 0"
            )
            .as_deref(),
            Some("candidate:7 1 udp 1 10.0.0.1 5000 typ host")
        );
        assert!(CodecNegotiationOptimizer::compress_candidate(
            "candidate:7 1 tcp 1 10.0.0.1 9 typ host tcptype active"
        )
        .is_none());
        assert_eq!(
            CodecNegotiationOptimizer::compress_candidate("garbage").as_deref(),
            Some("garbage")
        );
    }

    fn cand(n: u16) -> String {
        format!("candidate:{n} 1 udp 2122260223 10.0.0.1 {} typ host", 5000 + n)
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_flushes_when_full() {
        let mut batcher = CandidateBatcher::new(BatchConfig {
            max_batch: 3,
            max_delay_ms: 100,
        });
        let call = CallId::new();
        let now = Instant::now();
        let mut flushed = Vec::new();

        assert!(!batcher.batch_candidates(call, &cand(1), now, |b| flushed.push(b)));
        assert!(!batcher.batch_candidates(call, &cand(1), now, |b| flushed.push(b)));
        assert!(!batcher.batch_candidates(call, &cand(2), now, |b| flushed.push(b)));
        assert!(flushed.is_empty());
        assert!(batcher.batch_candidates(call, &cand(3), now, |b| flushed.push(b)));

        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].candidates, vec![cand(1), cand(2), cand(3)]);
        assert!(batcher.flush_call(call).is_none());
        assert!(batcher.next_deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_flushes_on_deadline() {
        let mut batcher = CandidateBatcher::new(BatchConfig::default());
        let a = CallId::new();
        let b = CallId::new();
        let start = Instant::now();

        batcher.batch_candidates(a, &cand(1), start, |_| {});
        batcher.batch_candidates(b, &cand(2), start + Duration::from_millis(100), |_| {});
        assert_eq!(
            batcher.next_deadline(),
            Some(start + Duration::from_millis(150))
        );

        let mut flushed = Vec::new();
        batcher.flush_expired(start + Duration::from_millis(149), |batch| flushed.push(batch));
        assert!(flushed.is_empty());

        batcher.flush_expired(start + Duration::from_millis(150), |batch| flushed.push(batch));
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].call_id, a);

        assert_eq!(batcher.flush_call(b).unwrap().candidates, vec![cand(2)]);
        assert!(batcher.flush_call(b).is_none());
    }

    #[test]
    fn test_batch_config_validation() {
        assert!(BatchConfig::default().validate().is_ok());
        assert!(BatchConfig {
            max_batch: 0,
            max_delay_ms: 10
        }
        .validate()
        .is_err());
    }
}
