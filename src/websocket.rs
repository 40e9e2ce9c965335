//! # WebSocket Relay Transport
//!
//! Client-facing streaming endpoint at `/ws/stt`. Each connection is one
//! Actix actor and maps to at most one relay session, keyed by a
//! server-generated connection UUID.
//!
//! ## Protocol:
//! 1. **start**: JSON control frame with segment and stream parameters;
//!    opens the backend stream and the forwarding pipeline
//! 2. **Audio Streaming**: binary frames are opaque audio chunks, enqueued
//!    without inspection
//! 3. **Telemetry**: the server pushes `SVR_T3` once forwarding begins and
//!    one `SVR_T4_FINAL` per committed transcript
//! 4. **end**: finishes the session; disconnecting without `end` tears it
//!    down just the same
//!
//! Start failures are reported as an `error` frame and leave the connection
//! open; the client may retry with corrected parameters.

use crate::error::AppError;
use crate::relay::buffer::BufferPolicy;
use crate::relay::session::{SessionManager, StartParams};
use crate::state::AppState;
use crate::telemetry::TelemetryEmitter;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How often the server pings an idle connection.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// How long without any client traffic before the connection is dropped.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

fn default_sample_rate() -> u32 {
    16000
}

fn default_language() -> String {
    "en-US".to_string()
}

fn default_worker_count() -> usize {
    1
}

fn default_buffer_policy() -> String {
    "UNBOUNDED".to_string()
}

/// Control frames sent by the client. Binary frames carry the audio itself
/// and never go through this type.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Begin a relay session on this connection.
    #[serde(rename = "start", rename_all = "camelCase")]
    Start {
        /// Client-chosen label for this audio segment.
        segment_id: String,
        #[serde(default = "default_sample_rate")]
        sample_rate_hz: u32,
        #[serde(default = "default_language")]
        language_code: String,
        #[serde(default = "default_worker_count")]
        worker_count: usize,
        #[serde(default = "default_buffer_policy")]
        buffer_policy: String,
        #[serde(default)]
        queue_capacity: usize,
    },

    /// Finish the session. Safe to send repeatedly.
    #[serde(rename = "end")]
    End,
}

/// Error frame pushed to the client when a control frame cannot be honored.
#[derive(Debug, Serialize)]
struct ErrorFrame<'a> {
    #[serde(rename = "type")]
    frame_type: &'static str,
    code: &'static str,
    message: &'a str,
}

/// Text payload ready to go out on the socket.
#[derive(Message)]
#[rtype(result = "()")]
struct SendText(String);

/// The session for this connection was registered successfully.
#[derive(Message)]
#[rtype(result = "()")]
struct SessionStarted;

/// One client connection; owns the lifecycle of at most one relay session.
pub struct RelayWebSocket {
    /// Server-generated key tying this connection to its session.
    session_key: String,
    app_state: web::Data<AppState>,
    session_manager: Arc<SessionManager>,
    last_heartbeat: Instant,
    /// True between successful registration and teardown, for metrics.
    session_active: bool,
}

impl RelayWebSocket {
    pub fn new(app_state: web::Data<AppState>, session_manager: Arc<SessionManager>) -> Self {
        Self {
            session_key: Uuid::new_v4().to_string(),
            app_state,
            session_manager,
            last_heartbeat: Instant::now(),
            session_active: false,
        }
    }

    fn handle_start(
        &mut self,
        ctx: &mut ws::WebsocketContext<Self>,
        segment_id: String,
        sample_rate_hz: u32,
        language_code: String,
        worker_count: usize,
        buffer_policy: String,
        queue_capacity: usize,
    ) {
        let policy = match BufferPolicy::from_wire(&buffer_policy, queue_capacity) {
            Ok(policy) => policy,
            Err(err) => {
                self.send_error(ctx, &err);
                return;
            }
        };
        let params = StartParams {
            segment_id,
            sample_rate_hz,
            language_code,
            worker_count,
            policy,
        };

        // Telemetry flows backend -> dispatch -> this channel -> the socket.
        let (telemetry, mut telemetry_rx) = TelemetryEmitter::channel();
        let addr = ctx.address();
        {
            let addr = addr.clone();
            tokio::spawn(async move {
                while let Some(event) = telemetry_rx.recv().await {
                    match serde_json::to_string(&event) {
                        Ok(json) => addr.do_send(SendText(json)),
                        Err(e) => error!("Failed to serialize telemetry event: {}", e),
                    }
                }
            });
        }

        let session_manager = self.session_manager.clone();
        let session_key = self.session_key.clone();
        tokio::spawn(async move {
            match session_manager
                .start_session(&session_key, params, telemetry)
                .await
            {
                Ok(()) => {
                    // The client may have disconnected while the backend dial
                    // was in flight. The actor's stop handler already ran and
                    // found nothing registered, so a session landing now must
                    // be ended here or it outlives its transport.
                    if addr.connected() {
                        addr.do_send(SessionStarted);
                    } else {
                        warn!(
                            session_key = %session_key,
                            "Client gone before session start completed, ending session"
                        );
                        session_manager.end_session(&session_key);
                    }
                }
                Err(err) => {
                    warn!(session_key = %session_key, "Session start failed: {}", err);
                    let message = err.to_string();
                    let frame = ErrorFrame {
                        frame_type: "error",
                        code: err.kind(),
                        message: &message,
                    };
                    if let Ok(json) = serde_json::to_string(&frame) {
                        addr.do_send(SendText(json));
                    }
                }
            }
        });
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, err: &AppError) {
        warn!(session_key = %self.session_key, "WebSocket error: {}", err);
        let message = err.to_string();
        let frame = ErrorFrame {
            frame_type: "error",
            code: err.kind(),
            message: &message,
        };
        if let Ok(json) = serde_json::to_string(&frame) {
            ctx.text(json);
        }
    }

    /// End this connection's session if one is live, folding its chunk
    /// counters into the server metrics. Safe to call repeatedly; `end` and
    /// disconnect both land here.
    fn finish_session(&mut self) {
        let session = self.session_manager.get_session(&self.session_key);
        if self.session_manager.end_session(&self.session_key) {
            if let Some(session) = session {
                self.app_state
                    .session_finished(session.chunks_enqueued(), session.chunks_dropped());
            }
            self.session_active = false;
        }
    }
}

impl Actor for RelayWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_key = %self.session_key, "WebSocket connection started");

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(session_key = %act.session_key, "Heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(session_key = %self.session_key, "WebSocket connection stopped");
        self.finish_session();
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelayWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Start {
                    segment_id,
                    sample_rate_hz,
                    language_code,
                    worker_count,
                    buffer_policy,
                    queue_capacity,
                }) => {
                    self.handle_start(
                        ctx,
                        segment_id,
                        sample_rate_hz,
                        language_code,
                        worker_count,
                        buffer_policy,
                        queue_capacity,
                    );
                }
                Ok(ClientMessage::End) => {
                    debug!(session_key = %self.session_key, "End frame received");
                    self.finish_session();
                }
                Err(err) => {
                    self.send_error(ctx, &AppError::from(err));
                }
            },
            Ok(ws::Message::Binary(data)) => {
                // Chunks racing session start or teardown are dropped inside
                // the manager, never surfaced as errors.
                self.session_manager
                    .enqueue_chunk(&self.session_key, data.to_vec());
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(session_key = %self.session_key, "WebSocket closed: {:?}", reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

impl Handler<SendText> for RelayWebSocket {
    type Result = ();

    fn handle(&mut self, msg: SendText, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

impl Handler<SessionStarted> for RelayWebSocket {
    type Result = ();

    fn handle(&mut self, _msg: SessionStarted, _ctx: &mut Self::Context) {
        self.session_active = true;
        self.app_state.session_started();
        info!(session_key = %self.session_key, "Relay session active");
    }
}

/// HTTP handler that upgrades `/ws/stt` requests to WebSocket connections.
pub async fn stt_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
    session_manager: web::Data<SessionManager>,
) -> ActixResult<HttpResponse> {
    info!(
        "New WebSocket connection request from: {:?}",
        req.connection_info().peer_addr()
    );

    let websocket = RelayWebSocket::new(app_state, session_manager.into_inner());
    ws::start(websocket, &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_frame_with_all_fields() {
        let json = r#"{
            "type": "start",
            "segmentId": "seg-42",
            "sampleRateHz": 44100,
            "languageCode": "de-DE",
            "workerCount": 4,
            "bufferPolicy": "BOUNDED_DROP_OLDEST",
            "queueCapacity": 16
        }"#;

        match serde_json::from_str::<ClientMessage>(json).unwrap() {
            ClientMessage::Start {
                segment_id,
                sample_rate_hz,
                language_code,
                worker_count,
                buffer_policy,
                queue_capacity,
            } => {
                assert_eq!(segment_id, "seg-42");
                assert_eq!(sample_rate_hz, 44100);
                assert_eq!(language_code, "de-DE");
                assert_eq!(worker_count, 4);
                assert_eq!(buffer_policy, "BOUNDED_DROP_OLDEST");
                assert_eq!(queue_capacity, 16);
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_start_frame_defaults() {
        let json = r#"{"type": "start", "segmentId": "seg-1"}"#;

        match serde_json::from_str::<ClientMessage>(json).unwrap() {
            ClientMessage::Start {
                sample_rate_hz,
                language_code,
                worker_count,
                buffer_policy,
                queue_capacity,
                ..
            } => {
                assert_eq!(sample_rate_hz, 16000);
                assert_eq!(language_code, "en-US");
                assert_eq!(worker_count, 1);
                assert_eq!(buffer_policy, "UNBOUNDED");
                assert_eq!(queue_capacity, 0);
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_end_frame() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type": "end"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::End));
    }

    #[test]
    fn test_unknown_frame_type_is_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type": "pause"}"#).is_err());
    }

    #[test]
    fn test_error_frame_wire_format() {
        let frame = ErrorFrame {
            frame_type: "error",
            code: "config_invalid",
            message: "queueCapacity must be positive",
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains(r#""type":"error""#));
        assert!(json.contains(r#""code":"config_invalid""#));
    }
}
