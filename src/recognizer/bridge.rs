//! # Streaming Bridge
//!
//! Adapts a session's outbound chunk sequence (plus a terminal finish signal)
//! into a bidirectional streaming conversation with the remote recognition
//! backend, and adapts the backend's asynchronous responses into a channel of
//! [`RecognitionEvent`]s.
//!
//! ## Structure:
//! - `open()` authenticates, dials the backend over WebSocket and sends the
//!   initial configuration frame before any audio.
//! - A **writer task** owns the WebSocket sink and drains the handle's command
//!   channel: audio chunks as binary frames, one end-of-audio frame on finish.
//! - A **reader task** owns the WebSocket stream and translates backend result
//!   frames into events; the error event fires at most once per session.
//! - A **result-dispatch task** (one per session) consumes the event channel
//!   and drives telemetry, decoupling backend I/O from the transport actor.
//!
//! The handle itself is just a sender plus two liveness flags, so tests can
//! build a detached pair and observe the exact command sequence a worker pool
//! produces without touching the network.

use crate::config::RecognizerConfig;
use crate::error::AppError;
use crate::recognizer::credentials;
use crate::relay::buffer::SessionBuffer;
use crate::telemetry::TelemetryEmitter;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::connect_async;
use tracing::{debug, warn};

/// Recognition stream parameters, sent to the backend before any audio.
#[derive(Debug, Clone, Serialize)]
pub struct StreamParams {
    pub encoding: String,
    pub sample_rate_hz: u32,
    pub language_code: String,
}

/// Initial configuration frame for the backend stream. Interim results stay
/// enabled and single-utterance mode disabled: the session streams until the
/// client says stop.
#[derive(Debug, Serialize)]
struct StreamConfigFrame<'a> {
    #[serde(rename = "type")]
    frame_type: &'static str,
    encoding: &'a str,
    sample_rate_hz: u32,
    language_code: &'a str,
    interim_results: bool,
    single_utterance: bool,
}

/// One result frame from the recognition backend.
#[derive(Debug, Deserialize)]
struct BackendResultFrame {
    #[serde(default)]
    alternatives: Vec<BackendAlternative>,
    #[serde(default)]
    is_final: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BackendAlternative {
    transcript: String,
}

/// Asynchronous events surfaced by the bridge's reader task.
#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionEvent {
    /// A transcript hypothesis; `is_final` marks a committed result.
    Transcript { text: String, is_final: bool },
    /// The backend stream failed. Fires at most once and ends the stream.
    Error(String),
    /// The backend closed the stream normally.
    Completed,
}

/// Commands travelling from the worker pool to the writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeCommand {
    Audio(Vec<u8>),
    Finish,
}

/// Handle to one session's backend stream: `send` + `finish` plus liveness.
///
/// Cloneable so the worker pool, the result dispatcher and the session can
/// each hold one; all clones share the finished/dead flags, which is what
/// makes `finish()` exactly-once.
#[derive(Clone)]
pub struct BridgeHandle {
    tx: mpsc::UnboundedSender<BridgeCommand>,
    finished: Arc<AtomicBool>,
    dead: Arc<AtomicBool>,
}

impl BridgeHandle {
    /// Create a handle wired to a raw command receiver. `open()` hands the
    /// receiver to the writer task; tests keep it to assert on the commands.
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<BridgeCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            tx,
            finished: Arc::new(AtomicBool::new(false)),
            dead: Arc::new(AtomicBool::new(false)),
        };
        (handle, rx)
    }

    /// Transmit one audio chunk. A no-op once finished or dead — forwarding
    /// failures are never surfaced to the producer side.
    pub fn send(&self, chunk: Vec<u8>) {
        if self.is_closed() {
            return;
        }
        if self.tx.send(BridgeCommand::Audio(chunk)).is_err() {
            // Writer task is gone; treat the stream as dead from here on.
            self.dead.store(true, Ordering::Release);
        }
    }

    /// Signal end-of-audio and release the underlying connection. Idempotent:
    /// only the first call reaches the writer task.
    pub fn finish(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.tx.send(BridgeCommand::Finish);
    }

    /// Mark the backend stream unusable (error callback fired).
    pub fn mark_dead(&self) {
        self.dead.store(true, Ordering::Release);
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    /// True once no further audio will be accepted, for any reason.
    pub fn is_closed(&self) -> bool {
        self.finished.load(Ordering::Acquire) || self.is_dead()
    }
}

/// Open a streaming recognition session with the remote backend.
///
/// Loads credentials, dials the backend, sends the configuration frame, then
/// spawns the writer and reader tasks. Returns the session's bridge handle
/// and the event channel its reader feeds. Any failure here aborts session
/// creation before anything was registered.
pub async fn open(
    config: &RecognizerConfig,
    params: &StreamParams,
) -> Result<(BridgeHandle, mpsc::UnboundedReceiver<RecognitionEvent>), AppError> {
    let token = credentials::load_api_token(&config.credentials_path)?;

    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| AppError::BackendStream(format!("Invalid backend URL: {}", e)))?;
    request.headers_mut().insert(
        AUTHORIZATION,
        format!("Bearer {}", token)
            .parse()
            .map_err(|_| AppError::CredentialsUnavailable("Token is not header-safe".into()))?,
    );

    let (ws_stream, _) = connect_async(request)
        .await
        .map_err(|e| AppError::BackendStream(format!("Backend connect failed: {}", e)))?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    // Configuration frame goes out before the first audio chunk.
    let config_frame = StreamConfigFrame {
        frame_type: "config",
        encoding: &params.encoding,
        sample_rate_hz: params.sample_rate_hz,
        language_code: &params.language_code,
        interim_results: true,
        single_utterance: false,
    };
    let config_json = serde_json::to_string(&config_frame)?;
    ws_tx
        .send(Message::Text(config_json.into()))
        .await
        .map_err(|e| AppError::BackendStream(format!("Failed to send stream config: {}", e)))?;

    let (handle, mut cmd_rx) = BridgeHandle::pair();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    // Writer task: audio out, end-of-audio frame on finish.
    tokio::spawn(async move {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                BridgeCommand::Audio(chunk) => {
                    if let Err(e) = ws_tx.send(Message::Binary(chunk.into())).await {
                        debug!("Backend audio send failed: {}", e);
                        break;
                    }
                }
                BridgeCommand::Finish => {
                    let finish_frame = r#"{"type":"finish"}"#;
                    if let Err(e) = ws_tx.send(Message::Text(finish_frame.into())).await {
                        debug!("Backend finish send failed: {}", e);
                    }
                    break;
                }
            }
        }
        let _ = ws_tx.close().await;
    });

    // Reader task: backend result frames in, events out.
    tokio::spawn(async move {
        loop {
            match ws_rx.next().await {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<BackendResultFrame>(&text) {
                        Ok(frame) => {
                            if let Some(message) = frame.error {
                                let _ = event_tx.send(RecognitionEvent::Error(message));
                                return;
                            }
                            if let Some(alternative) = frame.alternatives.first() {
                                let _ = event_tx.send(RecognitionEvent::Transcript {
                                    text: alternative.transcript.clone(),
                                    is_final: frame.is_final,
                                });
                            }
                        }
                        Err(e) => {
                            debug!("Unparseable backend frame ignored: {}", e);
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    let _ = event_tx.send(RecognitionEvent::Completed);
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = event_tx.send(RecognitionEvent::Error(e.to_string()));
                    return;
                }
            }
        }
    });

    Ok((handle, event_rx))
}

/// Spawn the per-session result-dispatch task.
///
/// Final transcripts capture the T4 milestone with the session's current drop
/// rate; interim transcripts are only logged. A backend error marks the bridge
/// dead and closes the buffer: nothing will drain a dead stream, so the
/// workers exit and further chunks are discarded instead of accumulating.
/// The session stays silenced until explicit teardown, with no retry at this
/// layer.
pub fn spawn_result_dispatch(
    mut events: mpsc::UnboundedReceiver<RecognitionEvent>,
    bridge: BridgeHandle,
    buffer: Arc<SessionBuffer>,
    telemetry: TelemetryEmitter,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                RecognitionEvent::Transcript { text, is_final: true } => {
                    telemetry.final_transcript(&text, buffer.drop_rate());
                }
                RecognitionEvent::Transcript { text, is_final: false } => {
                    debug!(interim = %text, "Interim transcript");
                }
                RecognitionEvent::Error(message) => {
                    warn!("Backend stream error, silencing session: {}", message);
                    bridge.mark_dead();
                    buffer.close();
                }
                RecognitionEvent::Completed => {
                    debug!("Backend stream completed");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::buffer::BufferPolicy;
    use crate::telemetry::{ServerEvent, TelemetryEmitter};
    use std::time::Duration;

    #[tokio::test]
    async fn test_send_after_finish_is_a_noop() {
        let (handle, mut rx) = BridgeHandle::pair();

        handle.send(vec![1]);
        handle.finish();
        handle.send(vec![2]);

        assert_eq!(rx.recv().await, Some(BridgeCommand::Audio(vec![1])));
        assert_eq!(rx.recv().await, Some(BridgeCommand::Finish));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_finish_is_idempotent() {
        let (handle, mut rx) = BridgeHandle::pair();
        let second = handle.clone();

        handle.finish();
        second.finish();
        handle.finish();

        assert_eq!(rx.recv().await, Some(BridgeCommand::Finish));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dead_bridge_drops_sends() {
        let (handle, mut rx) = BridgeHandle::pair();
        handle.mark_dead();
        handle.send(vec![9]);

        assert!(handle.is_closed());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_send_into_closed_channel_marks_dead() {
        let (handle, rx) = BridgeHandle::pair();
        drop(rx);

        handle.send(vec![1]);
        assert!(handle.is_dead());
    }

    #[test]
    fn test_backend_frame_parsing() {
        let frame: BackendResultFrame = serde_json::from_str(
            r#"{"alternatives":[{"transcript":"hello world"}],"is_final":true}"#,
        )
        .unwrap();
        assert!(frame.is_final);
        assert_eq!(frame.alternatives[0].transcript, "hello world");

        let error: BackendResultFrame =
            serde_json::from_str(r#"{"error":"quota exceeded"}"#).unwrap();
        assert_eq!(error.error.as_deref(), Some("quota exceeded"));
    }

    #[tokio::test]
    async fn test_dispatch_emits_t4_for_final_transcripts_only() {
        let (bridge, _cmd_rx) = BridgeHandle::pair();
        let buffer = Arc::new(SessionBuffer::new(BufferPolicy::Unbounded));
        let (telemetry, mut telemetry_rx) = TelemetryEmitter::channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let dispatch = spawn_result_dispatch(event_rx, bridge, buffer, telemetry);

        event_tx
            .send(RecognitionEvent::Transcript { text: "hel".into(), is_final: false })
            .unwrap();
        event_tx
            .send(RecognitionEvent::Transcript { text: "hello world".into(), is_final: true })
            .unwrap();
        drop(event_tx);
        dispatch.await.unwrap();

        match telemetry_rx.recv().await.unwrap() {
            ServerEvent::FinalTranscript { transcript, drop_rate, .. } => {
                assert_eq!(transcript, "hello world");
                assert_eq!(drop_rate, 0.0);
            }
            other => panic!("Expected SVR_T4_FINAL, got {:?}", other),
        }
        assert!(telemetry_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dispatch_silences_session_on_backend_error() {
        let (bridge, _cmd_rx) = BridgeHandle::pair();
        let buffer = Arc::new(SessionBuffer::new(BufferPolicy::Unbounded));
        let (telemetry, mut telemetry_rx) = TelemetryEmitter::channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let dispatch = spawn_result_dispatch(event_rx, bridge.clone(), buffer.clone(), telemetry);
        event_tx
            .send(RecognitionEvent::Error("stream reset".into()))
            .unwrap();
        drop(event_tx);

        tokio::time::timeout(Duration::from_secs(1), dispatch)
            .await
            .unwrap()
            .unwrap();
        assert!(bridge.is_dead());
        // The buffer closes with the stream: workers exit and later chunks
        // are discarded instead of piling up until teardown.
        assert!(buffer.is_closed());
        buffer.enqueue(vec![1]);
        assert_eq!(buffer.chunks_enqueued(), 0);
        // Errors never surface as client telemetry.
        assert!(telemetry_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dispatch_reports_current_drop_rate() {
        let (bridge, _cmd_rx) = BridgeHandle::pair();
        let buffer = Arc::new(SessionBuffer::new(BufferPolicy::DropNewest(1)));
        buffer.enqueue(vec![1]);
        buffer.enqueue(vec![2]); // dropped
        let (telemetry, mut telemetry_rx) = TelemetryEmitter::channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let dispatch = spawn_result_dispatch(event_rx, bridge, buffer, telemetry);
        event_tx
            .send(RecognitionEvent::Transcript { text: "hi".into(), is_final: true })
            .unwrap();
        drop(event_tx);
        dispatch.await.unwrap();

        match telemetry_rx.recv().await.unwrap() {
            ServerEvent::FinalTranscript { drop_rate, .. } => assert_eq!(drop_rate, 0.5),
            other => panic!("Expected SVR_T4_FINAL, got {:?}", other),
        }
    }
}
