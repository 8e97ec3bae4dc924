//! Network mode and quality ladder behaviour on a connected call

#![cfg(feature = "simulation")]

mod common;

use common::{id, next_event, wait_for, Harness, Id};
use saorsa_call_core::{
    CallEvent, CallId, CallManagerConfig, CallSession, CallState, ConnectionStats,
    InMemoryRelay, MediaConstraints, NetworkMode, QualityLevel, SignalIndicator,
};
use std::sync::Arc;

fn high() -> ConnectionStats {
    ConnectionStats::new(40, 0.0, 3_000)
}

fn low() -> ConnectionStats {
    ConnectionStats::new(400, 0.08, 200)
}

async fn connected_call(h: &Harness, constraints: MediaConstraints) -> CallId {
    let session = h
        .manager
        .place_call(id("alice"), id("bob"), constraints)
        .await
        .unwrap();
    h.answer_from(session.call_id, "bob", "alice").await;
    session.call_id
}

async fn tick(h: &Harness, call_id: CallId, stats: ConnectionStats) -> CallSession<Id> {
    h.manager
        .on_connection_stats_tick(call_id, stats)
        .await
        .unwrap()
}

#[tokio::test]
async fn high_to_low_downgrades_on_the_confirming_tick() {
    let h = Harness::new().await;
    let call_id = connected_call(&h, MediaConstraints::video_call()).await;
    let mut events = h.manager.subscribe_events();

    let first = tick(&h, call_id, low()).await;
    assert_eq!(first.network_mode, NetworkMode::High);
    assert_eq!(first.quality, QualityLevel::HdVideo);

    let second = tick(&h, call_id, low()).await;
    assert_eq!(second.quality, QualityLevel::HdVideo);

    let third = tick(&h, call_id, low()).await;
    assert_eq!(third.network_mode, NetworkMode::Low);
    assert_eq!(third.quality, QualityLevel::AudioOnly);
    assert_eq!(third.state, CallState::Degraded(QualityLevel::AudioOnly));

    let (from, to) = next_event(&mut events, |e| match e {
        CallEvent::QualityChanged { from, to, .. } => Some((from, to)),
        _ => None,
    })
    .await;
    assert_eq!((from, to), (QualityLevel::HdVideo, QualityLevel::AudioOnly));

    // Losing video is worth interrupting the user for
    let signal = next_event(&mut events, |e| match e {
        CallEvent::UiSignal { signal, .. } => Some(signal),
        _ => None,
    })
    .await;
    assert_eq!(signal.indicator, SignalIndicator::Poor);
    assert!(signal.interruptive);

    let caps = h.connection(call_id).applied_caps();
    assert_eq!(caps.len(), 3);
    assert!(caps[1].video.is_some());
    assert!(caps[2].video.is_none());
    assert!(caps[2].audio.unwrap().dtx);
}

#[tokio::test]
async fn recovery_needs_the_dwell_before_upgrading() {
    let h = Harness::new().await;
    let call_id = connected_call(&h, MediaConstraints::video_call()).await;
    for _ in 0..3 {
        tick(&h, call_id, low()).await;
    }

    // A single good sample neither changes the mode nor the level
    let one = tick(&h, call_id, high()).await;
    assert_eq!(one.network_mode, NetworkMode::Low);
    assert_eq!(one.quality, QualityLevel::AudioOnly);
    tick(&h, call_id, low()).await;

    // Mode confirms HIGH on the third good sample, then dwells
    let mut qualities = Vec::new();
    for _ in 0..5 {
        let session = tick(&h, call_id, high()).await;
        qualities.push((session.network_mode, session.quality));
    }
    assert_eq!(
        qualities,
        vec![
            (NetworkMode::Low, QualityLevel::AudioOnly),
            (NetworkMode::Low, QualityLevel::AudioOnly),
            (NetworkMode::High, QualityLevel::AudioOnly),
            (NetworkMode::High, QualityLevel::AudioOnly),
            (NetworkMode::High, QualityLevel::HdVideo),
        ]
    );
    assert_eq!(
        h.manager.session(call_id).unwrap().state,
        CallState::Connected
    );
}

#[tokio::test]
async fn connectivity_loss_falls_back_to_text_and_recovers() {
    let h = Harness::new().await;
    let call_id = connected_call(&h, MediaConstraints::video_call()).await;
    let mut events = h.manager.subscribe_events();

    let offline = tick(&h, call_id, ConnectionStats::disconnected()).await;
    assert_eq!(offline.network_mode, NetworkMode::Offline);
    assert_eq!(offline.state, CallState::Degraded(QualityLevel::TextFallback));
    assert!(!h.connection(call_id).media_enabled());
    next_event(&mut events, |e| match e {
        CallEvent::TextFallback { call_id } => Some(call_id),
        _ => None,
    })
    .await;

    // Three good samples to leave Offline, three more ticks of dwell
    let mut last = offline;
    for _ in 0..5 {
        last = tick(&h, call_id, high()).await;
    }
    assert_eq!(last.network_mode, NetworkMode::High);
    assert_eq!(last.quality, QualityLevel::HdVideo);
    assert!(h.connection(call_id).media_enabled());
}

#[tokio::test]
async fn audio_only_call_never_gets_video_caps() {
    let h = Harness::new().await;
    let call_id = connected_call(&h, MediaConstraints::audio_only()).await;
    tick(&h, call_id, high()).await;
    let caps = h.connection(call_id).applied_caps();
    assert_eq!(caps.len(), 1);
    assert!(caps[0].video.is_none());
    assert!(caps[0].audio.is_some());
}

#[tokio::test]
async fn low_network_hint_shapes_the_offer_and_start_level() {
    let h = Harness::new().await;
    h.manager.set_network_hint(NetworkMode::Low);
    let session = h
        .manager
        .place_call(id("alice"), id("bob"), MediaConstraints::video_call())
        .await
        .unwrap();
    assert_eq!(session.network_mode, NetworkMode::Low);
    assert_eq!(session.quality, QualityLevel::AudioOnly);

    let offer = &h.relay_messages(session.call_id)[0];
    assert!(offer.payload.contains("maxaveragebitrate=20000"));
    assert!(offer.payload.contains("a=ptime:40"));

    h.answer_from(session.call_id, "bob", "alice").await;
    assert_eq!(
        h.manager.session(session.call_id).unwrap().state,
        CallState::Degraded(QualityLevel::AudioOnly)
    );
}

#[tokio::test(start_paused = true)]
async fn polled_stats_drive_the_session() {
    let config = CallManagerConfig {
        stats_poll_interval_ms: Some(1_000),
        ..CallManagerConfig::default()
    };
    let h = Harness::with(Arc::new(InMemoryRelay::new()), config, vec![], &[]).await;
    let call_id = connected_call(&h, MediaConstraints::video_call()).await;

    h.connection(call_id).push_stats(ConnectionStats::disconnected());
    wait_for("offline from polling", || {
        h.manager.session(call_id).unwrap().network_mode == NetworkMode::Offline
    })
    .await;
    assert!(!h.connection(call_id).media_enabled());
}
