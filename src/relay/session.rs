//! # Relay Session Management
//!
//! One `RelaySession` per actively streaming client connection: it exclusively
//! owns its chunk buffer, its forwarding workers and its bridge handle —
//! nothing is shared across sessions except the registry itself.
//!
//! ## Session Lifecycle:
//! 1. **Started**: `start` control frame validated, backend stream opened,
//!    workers running
//! 2. **Streaming**: binary frames enqueued, workers forwarding
//! 3. **Torn down**: explicit `end` or transport disconnect, whichever comes
//!    first; teardown is idempotent and closes the bridge exactly once
//!
//! The `SessionManager` is the single mutation point the transport layer
//! talks to; insert and remove are atomic with respect to concurrent lookups,
//! so a chunk racing a disconnect is dropped silently instead of erroring.

use crate::config::RecognizerConfig;
use crate::error::AppError;
use crate::recognizer::bridge::{self, BridgeHandle, StreamParams};
use crate::relay::buffer::{BufferPolicy, SessionBuffer};
use crate::relay::worker::WorkerPool;
use crate::telemetry::TelemetryEmitter;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Validated parameters from a `start` control frame.
#[derive(Debug, Clone)]
pub struct StartParams {
    /// Client-supplied logical grouping label; opaque, uniqueness not enforced.
    pub segment_id: String,
    pub sample_rate_hz: u32,
    pub language_code: String,
    pub worker_count: usize,
    pub policy: BufferPolicy,
}

impl StartParams {
    /// Validate wire-level start parameters.
    ///
    /// The worker count is clamped to at least one rather than rejected; the
    /// buffer policy/capacity combination must already have been parsed via
    /// [`BufferPolicy::from_wire`].
    pub fn validate(self) -> Result<Self, AppError> {
        if self.sample_rate_hz == 0 {
            return Err(AppError::ConfigInvalid(
                "sampleRateHz must be positive".to_string(),
            ));
        }
        if self.language_code.is_empty() {
            return Err(AppError::ConfigInvalid(
                "languageCode must not be empty".to_string(),
            ));
        }
        Ok(Self {
            worker_count: self.worker_count.max(1),
            ..self
        })
    }
}

/// One live audio-to-transcript pipeline instance.
pub struct RelaySession {
    /// Opaque unique key, lifetime = transport connection lifetime.
    pub session_key: String,
    pub segment_id: String,
    pub created_at: DateTime<Utc>,

    buffer: Arc<SessionBuffer>,
    bridge: BridgeHandle,
    workers: WorkerPool,
    torn_down: AtomicBool,
}

impl RelaySession {
    pub fn new(
        session_key: String,
        segment_id: String,
        buffer: Arc<SessionBuffer>,
        bridge: BridgeHandle,
        workers: WorkerPool,
    ) -> Self {
        Self {
            session_key,
            segment_id,
            created_at: Utc::now(),
            buffer,
            bridge,
            workers,
            torn_down: AtomicBool::new(false),
        }
    }

    /// Hand one opaque audio chunk to the session buffer. Never blocks; a
    /// no-op after teardown.
    pub fn enqueue(&self, chunk: Vec<u8>) {
        self.buffer.enqueue(chunk);
    }

    /// Tear the session down: close the buffer (waking every worker) and
    /// finish the bridge. Idempotent; only the first caller does the work.
    /// Chunks never dequeued are discarded with the buffer, and the teardown
    /// does not wait for in-flight sends.
    pub fn teardown(&self) -> bool {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.buffer.close();
        self.bridge.finish();
        info!(
            session_key = %self.session_key,
            chunks_enqueued = self.buffer.chunks_enqueued(),
            chunks_dropped = self.buffer.chunks_dropped(),
            "Relay session torn down"
        );
        true
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.worker_count()
    }

    pub fn chunks_enqueued(&self) -> u64 {
        self.buffer.chunks_enqueued()
    }

    pub fn chunks_dropped(&self) -> u64 {
        self.buffer.chunks_dropped()
    }

    pub fn drop_rate(&self) -> f64 {
        self.buffer.drop_rate()
    }
}

/// Registry mapping session key → live session; the only cross-session state.
///
/// ## Thread Safety:
/// A `RwLock<HashMap>` gives atomic insert-if-absent and remove-if-present
/// with cheap concurrent lookups from the chunk path.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<RelaySession>>>,
    max_concurrent_sessions: usize,
    recognizer: RecognizerConfig,
}

impl SessionManager {
    pub fn new(max_concurrent_sessions: usize, recognizer: RecognizerConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_concurrent_sessions,
            recognizer,
        }
    }

    /// Create and register a session for `session_key`.
    ///
    /// Fails fast with `DuplicateSession` if the key is already live, and
    /// with `ConfigInvalid`/`CredentialsUnavailable`/`BackendStream` from
    /// validation or bridge opening — in every failure case nothing is left
    /// registered.
    pub async fn start_session(
        &self,
        session_key: &str,
        params: StartParams,
        telemetry: TelemetryEmitter,
    ) -> Result<(), AppError> {
        let params = params.validate()?;

        // Cheap pre-checks before dialing the backend. The registration below
        // re-checks under the write lock, so a racing start cannot slip by.
        {
            let sessions = self.sessions.read().unwrap();
            if sessions.contains_key(session_key) {
                return Err(AppError::DuplicateSession(session_key.to_string()));
            }
            if sessions.len() >= self.max_concurrent_sessions {
                return Err(AppError::Internal(format!(
                    "Maximum concurrent sessions ({}) reached",
                    self.max_concurrent_sessions
                )));
            }
        }

        let stream_params = StreamParams {
            encoding: "LINEAR16".to_string(),
            sample_rate_hz: params.sample_rate_hz,
            language_code: params.language_code.clone(),
        };
        let (bridge, events) = bridge::open(&self.recognizer, &stream_params).await?;

        let buffer = Arc::new(SessionBuffer::new(params.policy));
        bridge::spawn_result_dispatch(events, bridge.clone(), buffer.clone(), telemetry.clone());
        let workers = WorkerPool::spawn(params.worker_count, buffer.clone(), bridge.clone(), telemetry);

        let session = Arc::new(RelaySession::new(
            session_key.to_string(),
            params.segment_id,
            buffer,
            bridge,
            workers,
        ));
        self.register(session)?;

        info!(
            session_key,
            workers = params.worker_count,
            policy = ?params.policy,
            "Relay session started"
        );
        Ok(())
    }

    /// Atomic insert-if-absent, re-validating the session cap under the
    /// write lock (the pre-check in `start_session` ran lock-free and N
    /// concurrent starts can all pass it). A rejected session is torn down
    /// here since its bridge was already open; the incumbents are untouched.
    pub fn register(&self, session: Arc<RelaySession>) -> Result<(), AppError> {
        let rejection = {
            let mut sessions = self.sessions.write().unwrap();
            if sessions.contains_key(&session.session_key) {
                AppError::DuplicateSession(session.session_key.clone())
            } else if sessions.len() >= self.max_concurrent_sessions {
                AppError::Internal(format!(
                    "Maximum concurrent sessions ({}) reached",
                    self.max_concurrent_sessions
                ))
            } else {
                sessions.insert(session.session_key.clone(), session);
                return Ok(());
            }
        };
        session.teardown();
        Err(rejection)
    }

    /// Route one binary frame to its session. Unknown keys are dropped
    /// silently: chunks legitimately race teardown and transport close.
    pub fn enqueue_chunk(&self, session_key: &str, chunk: Vec<u8>) {
        let session = {
            let sessions = self.sessions.read().unwrap();
            sessions.get(session_key).cloned()
        };
        match session {
            Some(session) => session.enqueue(chunk),
            None => debug!(session_key, "Dropping chunk for unknown session"),
        }
    }

    pub fn get_session(&self, session_key: &str) -> Option<Arc<RelaySession>> {
        self.sessions.read().unwrap().get(session_key).cloned()
    }

    /// Remove-if-present followed by teardown. Safe to call repeatedly and
    /// concurrently with a transport-close event for the same key; the
    /// session's own teardown guard makes the bridge close exactly once.
    pub fn end_session(&self, session_key: &str) -> bool {
        let removed = {
            let mut sessions = self.sessions.write().unwrap();
            sessions.remove(session_key)
        };
        match removed {
            Some(session) => {
                session.teardown();
                true
            }
            None => false,
        }
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognizer::bridge::{spawn_result_dispatch, BridgeCommand, RecognitionEvent};
    use crate::telemetry::ServerEvent;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct SessionFixture {
        session: Arc<RelaySession>,
        bridge_rx: mpsc::UnboundedReceiver<BridgeCommand>,
        telemetry_rx: mpsc::UnboundedReceiver<ServerEvent>,
        event_tx: mpsc::UnboundedSender<RecognitionEvent>,
    }

    /// Build a fully wired session (workers + result dispatch) with the
    /// backend replaced by raw channel ends.
    fn detached_session(key: &str, policy: BufferPolicy, worker_count: usize) -> SessionFixture {
        let (bridge, bridge_rx) = BridgeHandle::pair();
        let (telemetry, telemetry_rx) = TelemetryEmitter::channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let buffer = Arc::new(SessionBuffer::new(policy));
        spawn_result_dispatch(event_rx, bridge.clone(), buffer.clone(), telemetry.clone());
        let workers = WorkerPool::spawn(worker_count, buffer.clone(), bridge.clone(), telemetry);

        let session = Arc::new(RelaySession::new(
            key.to_string(),
            "segment-1".to_string(),
            buffer,
            bridge,
            workers,
        ));
        SessionFixture { session, bridge_rx, telemetry_rx, event_tx }
    }

    fn manager_with_capacity(max_sessions: usize) -> SessionManager {
        SessionManager::new(
            max_sessions,
            RecognizerConfig {
                url: "wss://recognizer.invalid/v1/stream".to_string(),
                credentials_path: "/nonexistent/token".to_string(),
            },
        )
    }

    fn test_manager() -> SessionManager {
        manager_with_capacity(8)
    }

    #[test]
    fn test_start_params_validation() {
        let params = StartParams {
            segment_id: "seg".into(),
            sample_rate_hz: 16000,
            language_code: "en-US".into(),
            worker_count: 0,
            policy: BufferPolicy::Unbounded,
        };
        // Zero workers clamps to one.
        assert_eq!(params.clone().validate().unwrap().worker_count, 1);

        let bad_rate = StartParams { sample_rate_hz: 0, ..params.clone() };
        assert!(matches!(bad_rate.validate(), Err(AppError::ConfigInvalid(_))));

        let bad_language = StartParams { language_code: String::new(), ..params };
        assert!(matches!(bad_language.validate(), Err(AppError::ConfigInvalid(_))));
    }

    #[tokio::test]
    async fn test_register_rejects_duplicate_key_and_tears_down_newcomer() {
        let manager = test_manager();
        let first = detached_session("conn-1", BufferPolicy::Unbounded, 1);
        let mut second = detached_session("conn-1", BufferPolicy::Unbounded, 1);

        manager.register(first.session.clone()).unwrap();
        let err = manager.register(second.session.clone()).unwrap_err();
        assert!(matches!(err, AppError::DuplicateSession(_)));

        // The losing session was torn down (bridge finished), the incumbent
        // is untouched.
        assert!(second.session.is_torn_down());
        assert_eq!(second.bridge_rx.recv().await, Some(BridgeCommand::Finish));
        assert!(!first.session.is_torn_down());
        assert_eq!(manager.active_session_count(), 1);
    }

    #[tokio::test]
    async fn test_register_enforces_session_cap_and_tears_down_overflow() {
        let manager = manager_with_capacity(1);
        let first = detached_session("conn-a", BufferPolicy::Unbounded, 1);
        let mut second = detached_session("conn-b", BufferPolicy::Unbounded, 1);

        manager.register(first.session.clone()).unwrap();
        let err = manager.register(second.session.clone()).unwrap_err();
        assert!(matches!(err, AppError::Internal(_)));

        // The overflow session is fully released, not just rejected.
        assert!(second.session.is_torn_down());
        assert_eq!(second.bridge_rx.recv().await, Some(BridgeCommand::Finish));
        assert_eq!(manager.active_session_count(), 1);
    }

    #[tokio::test]
    async fn test_session_registered_after_disconnect_can_still_be_ended() {
        let manager = test_manager();
        let mut fixture = detached_session("conn-gone", BufferPolicy::Unbounded, 1);

        // Transport closed while the backend dial was in flight: its teardown
        // pass found nothing to remove.
        assert!(!manager.end_session("conn-gone"));

        // The in-flight start completes afterwards and registers the session;
        // the late-cleanup pass the transport runs next must fully end it.
        manager.register(fixture.session.clone()).unwrap();
        assert!(manager.end_session("conn-gone"));

        assert!(fixture.session.is_torn_down());
        assert_eq!(fixture.bridge_rx.recv().await, Some(BridgeCommand::Finish));
        assert_eq!(manager.active_session_count(), 0);
    }

    #[tokio::test]
    async fn test_chunks_for_unknown_sessions_are_dropped_silently() {
        let manager = test_manager();
        manager.enqueue_chunk("ghost", vec![1, 2, 3]);
        assert_eq!(manager.active_session_count(), 0);
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent_and_closes_bridge_once() {
        let manager = test_manager();
        let mut fixture = detached_session("conn-2", BufferPolicy::Unbounded, 2);
        manager.register(fixture.session.clone()).unwrap();

        assert!(manager.end_session("conn-2"));
        assert!(!manager.end_session("conn-2"));
        // Transport close arriving after an explicit end is also a no-op.
        fixture.session.teardown();

        assert_eq!(fixture.bridge_rx.recv().await, Some(BridgeCommand::Finish));
        assert!(fixture.bridge_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_enqueue_after_teardown_is_a_noop() {
        let manager = test_manager();
        let fixture = detached_session("conn-3", BufferPolicy::Unbounded, 1);
        manager.register(fixture.session.clone()).unwrap();

        manager.end_session("conn-3");
        manager.enqueue_chunk("conn-3", vec![1]);
        fixture.session.enqueue(vec![2]);

        assert_eq!(fixture.session.chunks_enqueued(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_full_relay_scenario_unbounded_two_workers() {
        let manager = test_manager();
        let mut fixture = detached_session("conn-4", BufferPolicy::Unbounded, 2);
        manager.register(fixture.session.clone()).unwrap();

        for n in 1..=5u8 {
            manager.enqueue_chunk("conn-4", vec![n]);
        }

        // Exactly five forwards reach the bridge.
        let mut forwarded = Vec::new();
        for _ in 0..5 {
            match tokio::time::timeout(Duration::from_secs(2), fixture.bridge_rx.recv())
                .await
                .expect("chunk never forwarded")
                .expect("bridge closed early")
            {
                BridgeCommand::Audio(chunk) => forwarded.push(chunk[0]),
                other => panic!("Unexpected command {:?}", other),
            }
        }
        forwarded.sort_unstable();
        assert_eq!(forwarded, vec![1, 2, 3, 4, 5]);

        // First-forward milestone precedes any final-transcript event.
        match fixture.telemetry_rx.recv().await.unwrap() {
            ServerEvent::ForwardingStarted { .. } => {}
            other => panic!("Expected SVR_T3 first, got {:?}", other),
        }

        fixture
            .event_tx
            .send(RecognitionEvent::Transcript { text: "hello world".into(), is_final: true })
            .unwrap();
        match fixture.telemetry_rx.recv().await.unwrap() {
            ServerEvent::FinalTranscript { transcript, drop_rate, .. } => {
                assert_eq!(transcript, "hello world");
                assert_eq!(drop_rate, 0.0);
            }
            other => panic!("Expected SVR_T4_FINAL, got {:?}", other),
        }

        manager.end_session("conn-4");
        assert_eq!(fixture.session.chunks_dropped(), 0);
    }

    #[tokio::test]
    async fn test_bounded_session_reports_drop_rate_in_final_event() {
        let mut fixture = detached_session("conn-5", BufferPolicy::DropNewest(2), 1);

        // No worker is draining fast enough to matter: flood before yielding.
        for n in 1..=5u8 {
            fixture.session.enqueue(vec![n]);
        }

        fixture
            .event_tx
            .send(RecognitionEvent::Transcript { text: "late".into(), is_final: true })
            .unwrap();

        // Find the final-transcript event (a T3 may precede it).
        let final_event = loop {
            match tokio::time::timeout(Duration::from_secs(2), fixture.telemetry_rx.recv())
                .await
                .expect("no telemetry arrived")
                .expect("telemetry channel closed")
            {
                ServerEvent::FinalTranscript { drop_rate, .. } => break drop_rate,
                ServerEvent::ForwardingStarted { .. } => continue,
            }
        };
        assert!(final_event > 0.0);
        assert_eq!(fixture.session.chunks_enqueued(), 5);
    }
}
