//! Behaviour when the signal relay goes away

#![cfg(feature = "simulation")]

mod common;

use common::{id, next_event, wait_for, Harness};
use saorsa_call_core::{
    CallError, CallEvent, CallManagerConfig, CallState, EndReason, InMemoryRelay,
    MediaConstraints, RetryPolicy, SignalRelay,
};
use std::sync::Arc;
use std::time::Duration;

fn short_retry() -> CallManagerConfig {
    CallManagerConfig {
        retry: RetryPolicy {
            initial_backoff_ms: 10,
            max_backoff_ms: 50,
            deadline_ms: 500,
        },
        ..CallManagerConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn offer_that_cannot_be_delivered_fails_the_call() {
    let relay = Arc::new(InMemoryRelay::new());
    relay.set_available(false);
    let h = Harness::with(relay, short_retry(), vec![], &[]).await;
    let mut events = h.manager.subscribe_events();

    let err = h
        .manager
        .place_call(id("alice"), id("bob"), MediaConstraints::video_call())
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::RelayUnavailable(_)));

    assert_eq!(h.devices.held_count(), 0);
    assert_eq!(h.devices.release_count(), 1);
    assert!(h.manager.active_calls().is_empty());
    let reason = next_event(&mut events, |e| match e {
        CallEvent::CallEnded { reason, .. } => Some(reason),
        _ => None,
    })
    .await;
    assert_eq!(reason, EndReason::RelayUnavailable);
}

#[tokio::test(start_paused = true)]
async fn relay_recovering_within_the_deadline_is_transparent() {
    let relay = Arc::new(InMemoryRelay::new());
    relay.set_available(false);
    let h = Harness::with(Arc::clone(&relay), short_retry(), vec![], &[]).await;

    let flip = tokio::spawn({
        let relay = Arc::clone(&relay);
        async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            relay.set_available(true);
        }
    });

    let session = h
        .manager
        .place_call(id("alice"), id("bob"), MediaConstraints::audio_only())
        .await
        .unwrap();
    flip.await.unwrap();
    assert_eq!(session.state, CallState::Negotiating);
    assert_eq!(relay.log(session.call_id).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn outage_mid_call_ends_with_relay_unavailable() {
    let relay = Arc::new(InMemoryRelay::new());
    let h = Harness::with(Arc::clone(&relay), short_retry(), vec![], &[]).await;
    let session = h
        .manager
        .place_call(id("alice"), id("bob"), MediaConstraints::video_call())
        .await
        .unwrap();
    let call_id = session.call_id;
    h.answer_from(call_id, "bob", "alice").await;

    relay.set_available(false);
    h.manager.toggle_video(call_id, false).await.unwrap();

    wait_for("relay failure to end the call", || {
        h.manager.session(call_id).unwrap().state == CallState::Ended(EndReason::RelayUnavailable)
    })
    .await;
    assert_eq!(h.devices.held_count(), 0);
    assert!(h.connection(call_id).is_closed());
}

#[tokio::test]
async fn closed_log_is_a_remote_hangup() {
    let relay = Arc::new(InMemoryRelay::new());
    let h = Harness::with(Arc::clone(&relay), CallManagerConfig::default(), vec![], &[]).await;
    let session = h
        .manager
        .place_call(id("alice"), id("bob"), MediaConstraints::audio_only())
        .await
        .unwrap();

    relay.close(session.call_id).await.unwrap();

    wait_for("remote hangup", || {
        h.manager.session(session.call_id).unwrap().end_reason() == Some(EndReason::RemoteHangup)
    })
    .await;
    assert_eq!(h.devices.held_count(), 0);
}
