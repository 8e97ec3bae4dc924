//! Live media connection seam
//!
//! The host's peer connection is reached through [`LiveConnection`]: it
//! produces descriptions, accepts the remote side's description and
//! candidates, and takes the caps the quality engine decides on. Each
//! session gets its own connection from a [`ConnectionFactory`].

use crate::types::{CallId, ConnectionStats, MediaConstraints, QualityCaps};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Live connection errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Description or candidate rejected
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// Connection already closed
    #[error("Connection closed")]
    Closed,

    /// Host-side failure
    #[error("Connection failed: {0}")]
    Failed(String),
}

/// Host media connection for one session
#[async_trait]
pub trait LiveConnection: Send + Sync + 'static {
    /// Create an offer and set it as local description
    ///
    /// # Errors
    ///
    /// Returns error if the host cannot produce a description.
    async fn create_offer(&self, constraints: &MediaConstraints) -> Result<String, ConnectionError>;

    /// Create an answer to the remote description and set it as local
    ///
    /// # Errors
    ///
    /// Returns error if no remote offer is set.
    async fn create_answer(&self, constraints: &MediaConstraints)
        -> Result<String, ConnectionError>;

    /// Apply the remote description
    ///
    /// # Errors
    ///
    /// Returns error if the description is rejected.
    async fn set_remote_description(&self, sdp: &str) -> Result<(), ConnectionError>;

    /// Apply one remote candidate line
    ///
    /// # Errors
    ///
    /// Returns error if no remote description is set yet or the line is
    /// rejected.
    async fn add_remote_candidate(&self, candidate: &str) -> Result<(), ConnectionError>;

    /// Candidates gathered after the local description was set
    ///
    /// # Errors
    ///
    /// Returns error if gathering failed.
    async fn local_candidates(&self) -> Result<Vec<String>, ConnectionError>;

    /// Apply per-track caps
    ///
    /// # Errors
    ///
    /// Returns error if the connection is closed.
    async fn apply_caps(&self, caps: &QualityCaps) -> Result<(), ConnectionError>;

    /// Start or stop all outgoing media
    ///
    /// # Errors
    ///
    /// Returns error if the connection is closed.
    async fn set_media_enabled(&self, enabled: bool) -> Result<(), ConnectionError>;

    /// Ask the host to favour a direct path over relayed ones
    ///
    /// # Errors
    ///
    /// Returns error if the connection is closed.
    async fn prefer_direct_path(&self) -> Result<(), ConnectionError>;

    /// A direct path is already in use
    fn has_direct_path(&self) -> bool;

    /// Latest statistics
    ///
    /// # Errors
    ///
    /// Returns error if the connection is closed.
    async fn stats(&self) -> Result<ConnectionStats, ConnectionError>;

    /// Close the connection; idempotent
    async fn close(&self);
}

/// Creates one connection per session
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// Connection for `call_id`
    ///
    /// # Errors
    ///
    /// Returns error if the host cannot create a connection.
    async fn create(&self, call_id: CallId) -> Result<Arc<dyn LiveConnection>, ConnectionError>;
}

#[cfg(feature = "simulation")]
pub use simulated::{SimulatedConnection, SimulatedConnectionFactory};

#[cfg(feature = "simulation")]
mod simulated {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::{HashMap, VecDeque};

    #[derive(Debug, Default)]
    struct State {
        offers_created: usize,
        answers_created: usize,
        remote_description: Option<String>,
        remote_descriptions_set: usize,
        remote_candidates: Vec<String>,
        applied_caps: Vec<QualityCaps>,
        media_enabled: bool,
        prefers_direct: bool,
        direct_path: bool,
        scripted_stats: VecDeque<ConnectionStats>,
        closed: bool,
    }

    /// In-process connection that records what the session asks of it
    #[derive(Debug)]
    pub struct SimulatedConnection {
        call_id: CallId,
        local_candidates: Vec<String>,
        state: Mutex<State>,
    }

    impl SimulatedConnection {
        /// Connection offering `local_candidates`
        pub fn new(call_id: CallId, local_candidates: Vec<String>) -> Self {
            Self {
                call_id,
                local_candidates,
                state: Mutex::new(State {
                    media_enabled: true,
                    ..State::default()
                }),
            }
        }

        fn describe(&self, kind: &str, constraints: &MediaConstraints) -> String {
            let mut sdp = format!(
                "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\na=group:BUNDLE 0 1\r\na=x-kind:{kind}\r\n",
                self.call_id.0.as_u128() as u64
            );
            if constraints.has_audio() {
                sdp.push_str(
                    "m=audio 9 UDP/TLS/RTP/SAVPF 111 0\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:0\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=fmtp:111 minptime=10;useinbandfec=1\r\n\
a=rtpmap:0 PCMU/8000\r\n",
                );
            }
            if constraints.has_video() {
                sdp.push_str(
                    "m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:1\r\n\
a=rtpmap:96 VP8/90000\r\n",
                );
            }
            sdp
        }

        fn open(&self) -> Result<parking_lot::MutexGuard<'_, State>, ConnectionError> {
            let state = self.state.lock();
            if state.closed {
                return Err(ConnectionError::Closed);
            }
            Ok(state)
        }

        /// Remote description, once set
        pub fn remote_description(&self) -> Option<String> {
            self.state.lock().remote_description.clone()
        }

        /// Times a remote description was applied
        pub fn remote_descriptions_set(&self) -> usize {
            self.state.lock().remote_descriptions_set
        }

        /// Remote candidates in application order
        pub fn remote_candidates(&self) -> Vec<String> {
            self.state.lock().remote_candidates.clone()
        }

        /// Every caps value applied so far
        pub fn applied_caps(&self) -> Vec<QualityCaps> {
            self.state.lock().applied_caps.clone()
        }

        /// Outgoing media enabled
        pub fn media_enabled(&self) -> bool {
            self.state.lock().media_enabled
        }

        /// Direct path was requested
        pub fn prefers_direct(&self) -> bool {
            self.state.lock().prefers_direct
        }

        /// Mark a direct path as established
        pub fn set_direct_path(&self, direct: bool) {
            self.state.lock().direct_path = direct;
        }

        /// Queue stats for the next `stats()` calls
        pub fn push_stats(&self, stats: ConnectionStats) {
            self.state.lock().scripted_stats.push_back(stats);
        }

        /// Offers produced
        pub fn offers_created(&self) -> usize {
            self.state.lock().offers_created
        }

        /// Answers produced
        pub fn answers_created(&self) -> usize {
            self.state.lock().answers_created
        }

        /// Connection was closed
        pub fn is_closed(&self) -> bool {
            self.state.lock().closed
        }
    }

    #[async_trait]
    impl LiveConnection for SimulatedConnection {
        async fn create_offer(
            &self,
            constraints: &MediaConstraints,
        ) -> Result<String, ConnectionError> {
            self.open()?.offers_created += 1;
            Ok(self.describe("offer", constraints))
        }

        async fn create_answer(
            &self,
            constraints: &MediaConstraints,
        ) -> Result<String, ConnectionError> {
            let mut state = self.open()?;
            if state.remote_description.is_none() {
                return Err(ConnectionError::Negotiation(
                    "no remote offer to answer".to_string(),
                ));
            }
            state.answers_created += 1;
            drop(state);
            Ok(self.describe("answer", constraints))
        }

        async fn set_remote_description(&self, sdp: &str) -> Result<(), ConnectionError> {
            if !sdp.starts_with("v=0") {
                return Err(ConnectionError::Negotiation(
                    "description does not start with v=0".to_string(),
                ));
            }
            let mut state = self.open()?;
            state.remote_description = Some(sdp.to_string());
            state.remote_descriptions_set += 1;
            Ok(())
        }

        async fn add_remote_candidate(&self, candidate: &str) -> Result<(), ConnectionError> {
            let mut state = self.open()?;
            if state.remote_description.is_none() {
                return Err(ConnectionError::Negotiation(
                    "candidate before remote description".to_string(),
                ));
            }
            state.remote_candidates.push(candidate.to_string());
            Ok(())
        }

        async fn local_candidates(&self) -> Result<Vec<String>, ConnectionError> {
            drop(self.open()?);
            Ok(self.local_candidates.clone())
        }

        async fn apply_caps(&self, caps: &QualityCaps) -> Result<(), ConnectionError> {
            self.open()?.applied_caps.push(*caps);
            Ok(())
        }

        async fn set_media_enabled(&self, enabled: bool) -> Result<(), ConnectionError> {
            self.open()?.media_enabled = enabled;
            Ok(())
        }

        async fn prefer_direct_path(&self) -> Result<(), ConnectionError> {
            self.open()?.prefers_direct = true;
            Ok(())
        }

        fn has_direct_path(&self) -> bool {
            self.state.lock().direct_path
        }

        async fn stats(&self) -> Result<ConnectionStats, ConnectionError> {
            let mut state = self.open()?;
            Ok(state
                .scripted_stats
                .pop_front()
                .unwrap_or_else(|| ConnectionStats::new(40, 0.0, 3_000)))
        }

        async fn close(&self) {
            self.state.lock().closed = true;
        }
    }

    /// Factory handing out [`SimulatedConnection`]s and keeping them for
    /// inspection
    #[derive(Debug, Default)]
    pub struct SimulatedConnectionFactory {
        local_candidates: Vec<String>,
        created: Mutex<HashMap<CallId, Arc<SimulatedConnection>>>,
    }

    impl SimulatedConnectionFactory {
        /// Factory whose connections gather no candidates
        pub fn new() -> Self {
            Self::default()
        }

        /// Factory whose connections gather `candidates`
        pub fn with_local_candidates(candidates: Vec<String>) -> Self {
            Self {
                local_candidates: candidates,
                created: Mutex::new(HashMap::new()),
            }
        }

        /// Connection created for `call_id`
        pub fn connection(&self, call_id: CallId) -> Option<Arc<SimulatedConnection>> {
            self.created.lock().get(&call_id).cloned()
        }
    }

    #[async_trait]
    impl ConnectionFactory for SimulatedConnectionFactory {
        async fn create(
            &self,
            call_id: CallId,
        ) -> Result<Arc<dyn LiveConnection>, ConnectionError> {
            let connection = Arc::new(SimulatedConnection::new(
                call_id,
                self.local_candidates.clone(),
            ));
            self.created.lock().insert(call_id, connection.clone());
            Ok(connection)
        }
    }
}

#[cfg(all(test, feature = "simulation"))]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::AudioCaps;

    #[tokio::test]
    async fn test_offer_has_requested_sections() {
        let conn = SimulatedConnection::new(CallId::new(), Vec::new());
        let audio = conn
            .create_offer(&MediaConstraints::audio_only())
            .await
            .unwrap();
        assert!(audio.contains("m=audio"));
        assert!(!audio.contains("m=video"));

        let video = conn
            .create_offer(&MediaConstraints::video_call())
            .await
            .unwrap();
        assert!(video.contains("m=video"));
        assert_eq!(conn.offers_created(), 2);
    }

    #[tokio::test]
    async fn test_candidates_need_remote_description() {
        let conn = SimulatedConnection::new(CallId::new(), Vec::new());
        let line = "candidate:1 1 udp 1 10.0.0.1 5000 typ host";
        assert!(conn.add_remote_candidate(line).await.is_err());
        assert!(conn
            .create_answer(&MediaConstraints::audio_only())
            .await
            .is_err());

        conn.set_remote_description("v=0\r\n").await.unwrap();
        conn.add_remote_candidate(line).await.unwrap();
        assert_eq!(conn.remote_candidates(), vec![line.to_string()]);
        assert!(conn
            .create_answer(&MediaConstraints::audio_only())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_closed_connection_rejects_calls() {
        let conn = SimulatedConnection::new(CallId::new(), Vec::new());
        conn.close().await;
        conn.close().await;
        assert!(conn.is_closed());
        let caps = QualityCaps {
            audio: Some(AudioCaps {
                max_bitrate_kbps: 10,
                dtx: true,
            }),
            video: None,
        };
        assert_eq!(conn.apply_caps(&caps).await, Err(ConnectionError::Closed));
        assert_eq!(conn.stats().await, Err(ConnectionError::Closed));
    }

    #[tokio::test]
    async fn test_scripted_stats_then_default() {
        let conn = SimulatedConnection::new(CallId::new(), Vec::new());
        conn.push_stats(ConnectionStats::disconnected());
        assert!(conn.stats().await.unwrap().is_connectivity_loss());
        assert!(!conn.stats().await.unwrap().is_connectivity_loss());
    }

    #[tokio::test]
    async fn test_factory_keeps_connections() {
        let factory =
            SimulatedConnectionFactory::with_local_candidates(vec!["candidate:x".to_string()]);
        let call_id = CallId::new();
        let conn = factory.create(call_id).await.unwrap();
        assert_eq!(conn.local_candidates().await.unwrap().len(), 1);
        assert!(factory.connection(call_id).is_some());
        assert!(factory.connection(CallId::new()).is_none());
    }
}
