//! Shared fixtures for integration tests

#![allow(dead_code)]

use saorsa_call_core::{
    CallEvent, CallId, CallManager, CallManagerConfig, InMemoryRelay, NegotiationMessage,
    PeerIdentityString, SignalOutcome, SimulatedConnection, SimulatedConnectionFactory,
    SimulatedDevices,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

pub type Id = PeerIdentityString;

pub const ANSWER_SDP: &str = "v=0\r\n\
o=- 7 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
a=rtpmap:111 opus/48000/2\r\n";

pub fn id(name: &str) -> Id {
    PeerIdentityString::new(name)
}

pub fn host(ip: &str) -> String {
    format!("candidate:1 1 udp 2122260223 {ip} 50000 typ host")
}

pub fn srflx(public: &str, base: &str) -> String {
    format!("candidate:2 1 udp 1686052607 {public} 61000 typ srflx raddr {base} rport 50000")
}

/// One manager with inspectable simulated collaborators
pub struct Harness {
    pub manager: CallManager<Id>,
    pub relay: Arc<InMemoryRelay>,
    pub devices: Arc<SimulatedDevices>,
    pub connections: Arc<SimulatedConnectionFactory>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with(Arc::new(InMemoryRelay::new()), CallManagerConfig::default(), vec![], &[]).await
    }

    pub async fn with(
        relay: Arc<InMemoryRelay>,
        config: CallManagerConfig,
        candidates: Vec<String>,
        locals: &[&str],
    ) -> Self {
        init_tracing();
        let devices = Arc::new(SimulatedDevices::new());
        let connections = Arc::new(SimulatedConnectionFactory::with_local_candidates(candidates));
        let mut builder = CallManager::<Id>::builder(relay.clone())
            .with_config(config)
            .with_devices(devices.clone())
            .with_connections(connections.clone());
        for local in locals {
            builder = builder.with_local_identity(id(local));
        }
        let manager = builder.build().await.unwrap();
        Self {
            manager,
            relay,
            devices,
            connections,
        }
    }

    pub fn connection(&self, call_id: CallId) -> Arc<SimulatedConnection> {
        self.connections.connection(call_id).unwrap()
    }

    /// Play the remote side answering an initiator's offer
    pub async fn answer_from(&self, call_id: CallId, remote: &str, local: &str) {
        let answer = NegotiationMessage::answer(call_id, id(remote), id(local), 1, ANSWER_SDP);
        let outcome = self.manager.on_signal(answer).await.unwrap();
        assert_eq!(outcome, SignalOutcome::Applied);
    }

    /// Messages on the call's relay log, decoded
    pub fn relay_messages(&self, call_id: CallId) -> Vec<NegotiationMessage<Id>> {
        self.relay
            .log(call_id)
            .iter()
            .map(|frame| NegotiationMessage::decode(frame).unwrap())
            .collect()
    }
}

/// Route library logs to the test writer; `RUST_LOG` picks the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Poll `check` until it holds
pub async fn wait_for(what: &str, check: impl Fn() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Next event matching `pick`, skipping others
pub async fn next_event<T>(
    events: &mut broadcast::Receiver<CallEvent<Id>>,
    pick: impl Fn(CallEvent<Id>) -> Option<T>,
) -> T {
    let found = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(found) = pick(event) {
                        return found;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await;
    found.unwrap()
}
