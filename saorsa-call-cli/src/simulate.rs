//! Two simulated peers calling each other over an in-memory relay

use anyhow::{Context, Result};
use clap::ValueEnum;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use saorsa_call_core::prelude::*;
use saorsa_call_core::SimulatedConnectionFactory;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

type Id = PeerIdentityString;

/// Scripted network behaviour for the caller's connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum NetworkProfile {
    /// Good throughout
    Stable,
    /// Slides from good to barely usable over the run
    Degrading,
    /// Alternates between good and poor every few ticks
    Flaky,
    /// Good, then nothing gets through for the middle third, then good
    Outage,
}

impl NetworkProfile {
    /// Stats sample for `tick` of `ticks`
    pub fn sample(self, tick: u32, ticks: u32, rng: &mut impl Rng) -> ConnectionStats {
        match self {
            Self::Stable => good(rng),
            Self::Degrading => {
                let progress = f64::from(tick) / f64::from(ticks.max(1));
                let kbps = 3_000.0 - progress * 2_950.0;
                let rtt = 40.0 + progress * 760.0;
                let loss = progress * 0.15;
                ConnectionStats::new(
                    rtt as u32 + rng.gen_range(0..10),
                    loss as f32,
                    kbps as u32,
                )
            }
            Self::Flaky => {
                if (tick / 4) % 2 == 0 {
                    good(rng)
                } else {
                    ConnectionStats::new(rng.gen_range(350..600), 0.08, rng.gen_range(100..400))
                }
            }
            Self::Outage => {
                let third = ticks / 3;
                if (third..2 * third).contains(&tick) {
                    ConnectionStats::disconnected()
                } else {
                    good(rng)
                }
            }
        }
    }
}

fn good(rng: &mut impl Rng) -> ConnectionStats {
    ConnectionStats::new(
        rng.gen_range(30..60),
        rng.gen_range(0.0..0.01),
        rng.gen_range(2_500..3_500),
    )
}

/// Simulation parameters
#[derive(Debug, Clone)]
pub struct SimulationOptions {
    /// Network behaviour
    pub profile: NetworkProfile,
    /// Stats ticks to run once connected
    pub ticks: u32,
    /// Seed for the sample generator
    pub seed: u64,
    /// Ask for video
    pub video: bool,
    /// Wall-clock pause between ticks
    pub tick_interval: Duration,
}

/// What happened during a run
#[derive(Debug, Clone)]
pub struct SimulationReport {
    /// Simulated call
    pub call_id: CallId,
    /// Network mode after each tick
    pub modes: Vec<NetworkMode>,
    /// Quality level after each tick
    pub levels: Vec<QualityLevel>,
    /// Caller's final snapshot
    pub caller: CallSession<Id>,
    /// Callee's final snapshot
    pub callee: CallSession<Id>,
}

/// Run one call from "alice" to "bob", calling `on_event` for every caller
/// and callee event as it is observed
pub async fn run(
    config: CallManagerConfig,
    options: SimulationOptions,
    mut on_event: impl FnMut(&str, &CallEvent<Id>),
) -> Result<SimulationReport> {
    let relay = Arc::new(InMemoryRelay::new());
    let alice = PeerIdentityString::new("alice");
    let bob = PeerIdentityString::new("bob");

    let caller = CallManager::<Id>::builder(relay.clone())
        .with_config(config.clone())
        .with_connections(Arc::new(SimulatedConnectionFactory::with_local_candidates(
            vec![
                "candidate:1 1 udp 2122260223 192.168.1.10 50000 typ host".to_string(),
                "candidate:2 1 udp 1686052607 203.0.113.7 61000 typ srflx raddr 192.168.1.10 rport 50000".to_string(),
            ],
        )))
        .build()
        .await?;
    let callee = CallManager::<Id>::builder(relay)
        .with_config(config)
        .with_local_identity(bob.clone())
        .with_connections(Arc::new(SimulatedConnectionFactory::with_local_candidates(
            vec![
                "candidate:1 1 udp 2122260223 192.168.1.20 50000 typ host".to_string(),
                "candidate:2 1 udp 1686052607 203.0.113.7 62000 typ srflx raddr 192.168.1.20 rport 50000".to_string(),
            ],
        )))
        .build()
        .await?;

    let mut caller_events = caller.subscribe_events();
    let mut callee_events = callee.subscribe_events();
    let constraints = MediaConstraints::audio_only().with_video(options.video);

    let placed = caller.place_call(alice, bob.clone(), constraints).await?;
    let call_id = placed.call_id;
    callee.watch_incoming(call_id, bob).await?;

    let offer = wait_for_event(&mut callee_events, "callee", &mut on_event, |e| match e {
        CallEvent::IncomingCall { offer } if offer.call_id == call_id => Some(offer.clone()),
        _ => None,
    })
    .await
    .context("offer never reached the callee")?;
    callee.accept_incoming(offer).await?;
    wait_for_event(&mut caller_events, "caller", &mut on_event, |e| match e {
        CallEvent::Connected { call_id: id } if *id == call_id => Some(()),
        _ => None,
    })
    .await
    .context("caller never connected")?;

    let mut rng = StdRng::seed_from_u64(options.seed);
    let mut modes = Vec::with_capacity(options.ticks as usize);
    let mut levels = Vec::with_capacity(options.ticks as usize);
    for tick in 0..options.ticks {
        let stats = options.profile.sample(tick, options.ticks, &mut rng);
        let session = caller.on_connection_stats_tick(call_id, stats).await?;
        modes.push(session.network_mode);
        levels.push(session.quality);
        drain(&mut caller_events, "caller", &mut on_event);
        drain(&mut callee_events, "callee", &mut on_event);
        if !options.tick_interval.is_zero() {
            tokio::time::sleep(options.tick_interval).await;
        }
    }

    let caller_final = caller.end_call(call_id, EndReason::LocalHangup).await?;
    wait_for_event(&mut callee_events, "callee", &mut on_event, |e| match e {
        CallEvent::CallEnded { call_id: id, .. } if *id == call_id => Some(()),
        _ => None,
    })
    .await
    .context("callee never saw the hangup")?;
    drain(&mut caller_events, "caller", &mut on_event);
    let callee_final = callee
        .session(call_id)
        .context("callee lost the session")?;

    Ok(SimulationReport {
        call_id,
        modes,
        levels,
        caller: caller_final,
        callee: callee_final,
    })
}

async fn wait_for_event<T>(
    events: &mut broadcast::Receiver<CallEvent<Id>>,
    side: &str,
    on_event: &mut impl FnMut(&str, &CallEvent<Id>),
    mut pick: impl FnMut(&CallEvent<Id>) -> Option<T>,
) -> Result<T> {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    on_event(side, &event);
                    if let Some(found) = pick(&event) {
                        return Ok(found);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, side, "Event receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    anyhow::bail!("{side} event channel closed");
                }
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), wait)
        .await
        .context("timed out waiting for call event")?
}

fn drain(
    events: &mut broadcast::Receiver<CallEvent<Id>>,
    side: &str,
    on_event: &mut impl FnMut(&str, &CallEvent<Id>),
) {
    loop {
        match events.try_recv() {
            Ok(event) => on_event(side, &event),
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, side, "Event receiver lagged");
            }
            Err(_) => break,
        }
    }
}

/// One-line rendering of an event
pub fn describe(event: &CallEvent<Id>) -> String {
    match event {
        CallEvent::IncomingCall { offer } => format!("📞 incoming call from {}", offer.from),
        CallEvent::IncomingCallCancelled { .. } => "🚫 caller hung up".to_string(),
        CallEvent::CallPlaced { callee, .. } => format!("📤 calling {callee}"),
        CallEvent::Connected { .. } => "✅ connected".to_string(),
        CallEvent::NetworkModeChanged { from, to, .. } => format!("📶 network {from} → {to}"),
        CallEvent::QualityChanged { from, to, caps, .. } => {
            let video = caps
                .video
                .map_or("no video".to_string(), |v| format!("video ≤{} kbps", v.max_bitrate_kbps));
            format!("🎚  quality {from} → {to} ({video})")
        }
        CallEvent::TextFallback { .. } => "💬 media stopped, text only".to_string(),
        CallEvent::LocalityDetected { locality, .. } => format!(
            "📍 peer locality {:?} ({:.2})",
            locality.locality, locality.confidence
        ),
        CallEvent::UiSignal { signal, .. } => {
            if signal.interruptive {
                format!("🔔 signal {} (alert)", signal.indicator)
            } else {
                format!("🔔 signal {}", signal.indicator)
            }
        }
        CallEvent::CallEnded { reason, .. } => format!("📴 ended: {reason}"),
    }
}
