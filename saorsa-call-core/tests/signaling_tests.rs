//! Negotiation message handling: buffering, ordering, duplicates, offers

#![cfg(feature = "simulation")]

mod common;

use common::{host, id, next_event, srflx, wait_for, Harness, ANSWER_SDP};
use pretty_assertions::assert_eq;
use saorsa_call_core::{
    CallError, CallEvent, CallId, CallManagerConfig, InMemoryRelay, Locality, MediaConstraints,
    NegotiationMessage, SignalOutcome,
};
use std::sync::Arc;

const OFFER_SDP: &str = "v=0\r\n\
o=- 9 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
a=rtpmap:111 opus/48000/2\r\n";

#[tokio::test]
async fn candidates_before_answer_are_buffered_then_applied_in_order() {
    let h = Harness::new().await;
    let session = h
        .manager
        .place_call(id("alice"), id("bob"), MediaConstraints::audio_only())
        .await
        .unwrap();
    let call_id = session.call_id;

    let first = host("10.0.0.2");
    let second = host("10.0.0.3");
    let early = [
        NegotiationMessage::candidates(call_id, id("bob"), id("alice"), 2, &[first.clone()]),
        NegotiationMessage::candidates(call_id, id("bob"), id("alice"), 3, &[second.clone()]),
    ];
    for message in early {
        assert_eq!(
            h.manager.on_signal(message).await.unwrap(),
            SignalOutcome::Buffered
        );
    }
    assert!(h.connection(call_id).remote_candidates().is_empty());

    h.answer_from(call_id, "bob", "alice").await;
    assert_eq!(h.connection(call_id).remote_candidates(), vec![first, second]);

    // After the description, candidates apply immediately
    let late = host("10.0.0.4");
    let message =
        NegotiationMessage::candidates(call_id, id("bob"), id("alice"), 4, &[late.clone()]);
    assert_eq!(
        h.manager.on_signal(message).await.unwrap(),
        SignalOutcome::Applied
    );
    assert_eq!(h.connection(call_id).remote_candidates().last(), Some(&late));
}

#[tokio::test]
async fn candidates_that_overflow_the_buffer_can_be_redelivered() {
    let config = CallManagerConfig {
        max_pending_candidates: 2,
        ..CallManagerConfig::default()
    };
    let h = Harness::with(Arc::new(InMemoryRelay::new()), config, vec![], &[]).await;
    let session = h
        .manager
        .place_call(id("alice"), id("bob"), MediaConstraints::audio_only())
        .await
        .unwrap();
    let call_id = session.call_id;

    let pair = [host("10.0.0.2"), host("10.0.0.3")];
    let extra = host("10.0.0.4");
    let fits = NegotiationMessage::candidates(call_id, id("bob"), id("alice"), 2, &pair);
    let overflow = NegotiationMessage::candidates(call_id, id("bob"), id("alice"), 3, &[&extra]);
    assert_eq!(h.manager.on_signal(fits).await.unwrap(), SignalOutcome::Buffered);
    assert_eq!(
        h.manager.on_signal(overflow.clone()).await.unwrap(),
        SignalOutcome::Ignored
    );

    h.answer_from(call_id, "bob", "alice").await;
    assert_eq!(h.connection(call_id).remote_candidates(), pair.to_vec());

    // The rejected message was not marked as seen
    assert_eq!(
        h.manager.on_signal(overflow.clone()).await.unwrap(),
        SignalOutcome::Applied
    );
    assert_eq!(
        h.manager.on_signal(overflow).await.unwrap(),
        SignalOutcome::Duplicate
    );
    assert_eq!(
        h.connection(call_id).remote_candidates(),
        vec![pair[0].clone(), pair[1].clone(), extra]
    );
}

#[tokio::test]
async fn duplicate_delivery_is_a_no_op() {
    let h = Harness::new().await;
    let session = h
        .manager
        .place_call(id("alice"), id("bob"), MediaConstraints::audio_only())
        .await
        .unwrap();
    let call_id = session.call_id;
    h.answer_from(call_id, "bob", "alice").await;
    let after_answer = h.manager.session(call_id).unwrap();

    let again = NegotiationMessage::answer(call_id, id("bob"), id("alice"), 1, ANSWER_SDP);
    assert_eq!(
        h.manager.on_signal(again).await.unwrap(),
        SignalOutcome::Duplicate
    );

    let candidate =
        NegotiationMessage::candidates(call_id, id("bob"), id("alice"), 2, &[host("10.0.0.2")]);
    assert_eq!(
        h.manager.on_signal(candidate.clone()).await.unwrap(),
        SignalOutcome::Applied
    );
    assert_eq!(
        h.manager.on_signal(candidate).await.unwrap(),
        SignalOutcome::Duplicate
    );

    let now = h.manager.session(call_id).unwrap();
    assert_eq!(now.state, after_answer.state);
    assert_eq!(now.connected_at, after_answer.connected_at);
    assert_eq!(h.connection(call_id).remote_candidates().len(), 1);
}

#[tokio::test]
async fn messages_not_for_the_session_are_ignored() {
    let h = Harness::new().await;
    let session = h
        .manager
        .place_call(id("alice"), id("bob"), MediaConstraints::audio_only())
        .await
        .unwrap();

    let intruder =
        NegotiationMessage::answer(session.call_id, id("mallory"), id("alice"), 1, ANSWER_SDP);
    assert_eq!(
        h.manager.on_signal(intruder).await.unwrap(),
        SignalOutcome::Ignored
    );
    assert_eq!(
        h.manager.session(session.call_id).unwrap().state,
        saorsa_call_core::CallState::Negotiating
    );
}

#[tokio::test]
async fn malformed_and_unknown_messages() {
    let h = Harness::new().await;
    let zero_seq = NegotiationMessage::offer(CallId::new(), id("bob"), id("alice"), 0, OFFER_SDP);
    assert!(matches!(
        h.manager.on_signal(zero_seq).await,
        Err(CallError::ProtocolViolation(_))
    ));

    let call_id = CallId::new();
    let stray = NegotiationMessage::answer(call_id, id("bob"), id("alice"), 1, ANSWER_SDP);
    assert_eq!(
        h.manager.on_signal(stray).await.unwrap_err(),
        CallError::CallNotFound(call_id)
    );
}

#[tokio::test]
async fn incoming_offer_is_announced_once() {
    let h = Harness::with(
        Arc::new(InMemoryRelay::new()),
        CallManagerConfig::default(),
        vec![],
        &["bob"],
    )
    .await;
    let mut events = h.manager.subscribe_events();
    let call_id = CallId::new();
    let offer = NegotiationMessage::offer(call_id, id("alice"), id("bob"), 1, OFFER_SDP);

    assert_eq!(
        h.manager.on_signal(offer.clone()).await.unwrap(),
        SignalOutcome::Incoming
    );
    assert_eq!(
        h.manager.on_signal(offer.clone()).await.unwrap(),
        SignalOutcome::Duplicate
    );
    let announced = next_event(&mut events, |e| match e {
        CallEvent::IncomingCall { offer } => Some(offer),
        _ => None,
    })
    .await;
    assert_eq!(announced, offer);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn superseded_offer_is_stale() {
    let h = Harness::with(
        Arc::new(InMemoryRelay::new()),
        CallManagerConfig::default(),
        vec![],
        &["bob"],
    )
    .await;
    let call_id = CallId::new();
    let first = NegotiationMessage::offer(call_id, id("alice"), id("bob"), 1, OFFER_SDP);
    let newer = NegotiationMessage::offer(call_id, id("alice"), id("bob"), 2, OFFER_SDP);
    h.manager.on_signal(first.clone()).await.unwrap();
    h.manager.on_signal(newer).await.unwrap();

    assert_eq!(
        h.manager.accept_incoming(first).await.unwrap_err(),
        CallError::StaleOffer {
            call_id,
            seen: 2,
            offered: 1
        }
    );
    assert_eq!(h.devices.acquisition_count(), 0);
}

#[tokio::test]
async fn accept_requires_initial_offer_to_a_local_identity() {
    let h = Harness::with(
        Arc::new(InMemoryRelay::new()),
        CallManagerConfig::default(),
        vec![],
        &["bob"],
    )
    .await;
    let call_id = CallId::new();

    let answer = NegotiationMessage::answer(call_id, id("alice"), id("bob"), 1, OFFER_SDP);
    assert!(matches!(
        h.manager.accept_incoming(answer).await,
        Err(CallError::ProtocolViolation(_))
    ));

    let later = NegotiationMessage::offer(call_id, id("alice"), id("bob"), 2, OFFER_SDP);
    assert!(matches!(
        h.manager.accept_incoming(later).await,
        Err(CallError::ProtocolViolation(_))
    ));

    let misaddressed = NegotiationMessage::offer(call_id, id("alice"), id("carol"), 1, OFFER_SDP);
    assert!(matches!(
        h.manager.accept_incoming(misaddressed).await,
        Err(CallError::ProtocolViolation(_))
    ));
}

#[tokio::test]
async fn accepted_call_is_connected_and_answer_is_sent() {
    let h = Harness::with(
        Arc::new(InMemoryRelay::new()),
        CallManagerConfig::default(),
        vec![],
        &["bob"],
    )
    .await;
    let call_id = CallId::new();
    let offer = NegotiationMessage::offer(call_id, id("alice"), id("bob"), 1, OFFER_SDP);

    let session = h.manager.accept_incoming(offer.clone()).await.unwrap();
    assert_eq!(session.state, saorsa_call_core::CallState::Connected);
    assert_eq!(session.role, saorsa_call_core::Role::Responder);
    assert_eq!(session.remote, id("alice"));

    let log = h.relay_messages(call_id);
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].kind, saorsa_call_core::MessageKind::Answer);
    assert_eq!(log[0].seq, 1);
    assert_eq!(h.connection(call_id).remote_description().as_deref(), Some(OFFER_SDP));

    // The offer we accepted from is not reapplied
    assert_eq!(
        h.manager.on_signal(offer.clone()).await.unwrap(),
        SignalOutcome::Duplicate
    );
    // Accepting twice is refused
    assert!(matches!(
        h.manager.accept_incoming(offer).await,
        Err(CallError::AlreadyInCall(_))
    ));
}

#[tokio::test]
async fn same_network_peer_is_detected_and_direct_path_preferred() {
    let h = Harness::with(
        Arc::new(InMemoryRelay::new()),
        CallManagerConfig::default(),
        vec![host("192.168.1.10"), srflx("203.0.113.7", "192.168.1.10")],
        &[],
    )
    .await;
    let mut events = h.manager.subscribe_events();
    let session = h
        .manager
        .place_call(id("alice"), id("bob"), MediaConstraints::audio_only())
        .await
        .unwrap();
    let call_id = session.call_id;
    h.answer_from(call_id, "bob", "alice").await;

    let theirs = NegotiationMessage::candidates(
        call_id,
        id("bob"),
        id("alice"),
        2,
        &[host("192.168.1.20"), srflx("203.0.113.7", "192.168.1.20")],
    );
    h.manager.on_signal(theirs).await.unwrap();

    let locality = next_event(&mut events, |e| match e {
        CallEvent::LocalityDetected { locality, .. } => Some(locality),
        _ => None,
    })
    .await;
    assert_eq!(locality.locality, Locality::Local);
    assert!(locality.confidence >= 0.75);
    assert!(h.connection(call_id).prefers_direct());
    assert_eq!(
        h.manager.session(call_id).unwrap().locality,
        Some(locality)
    );
}

#[tokio::test]
async fn local_candidates_are_batched_onto_the_relay() {
    let h = Harness::with(
        Arc::new(InMemoryRelay::new()),
        CallManagerConfig::default(),
        vec![host("10.1.0.5"), host("10.1.0.6")],
        &[],
    )
    .await;
    let session = h
        .manager
        .place_call(id("alice"), id("bob"), MediaConstraints::audio_only())
        .await
        .unwrap();
    let call_id = session.call_id;
    h.manager
        .add_local_candidate(call_id, host("10.1.0.7"))
        .unwrap();

    wait_for("candidate batch", || h.relay.log(call_id).len() == 2).await;
    let batch = h.relay_messages(call_id).pop().unwrap();
    assert_eq!(batch.kind, saorsa_call_core::MessageKind::Candidate);
    assert_eq!(batch.seq, 2);
    let lines: Vec<&str> = batch.candidate_lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].contains("10.1.0.5"));
    assert!(lines[2].contains("10.1.0.7"));
}
