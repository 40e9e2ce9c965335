//! # Telemetry Events
//!
//! Formats and delivers the timing/latency events the client uses to measure
//! the relay pipeline. Events are emitted synchronously at two milestones:
//!
//! - **SVR_T3**: the first audio chunk of a session is handed to the
//!   streaming bridge (exactly once per session).
//! - **SVR_T4_FINAL**: a final transcript arrives from the recognition
//!   backend (once per final result), carrying the session's drop rate.
//!
//! ## Clock Model:
//! `t3_ms`/`t4_ms` are monotonic milliseconds relative to process start, so
//! they can be subtracted safely even if the wall clock steps. `server_epoch_ms`
//! is wall-clock epoch millis for cross-host correlation.

use serde::Serialize;
use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

/// Outbound telemetry frames, serialized as JSON with a `type` tag.
///
/// The wire names (`SVR_T3`, `SVR_T4_FINAL`) are part of the client protocol
/// and must not change.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// First audio chunk forwarded to the recognition backend.
    #[serde(rename = "SVR_T3")]
    ForwardingStarted {
        t3_ms: u64,
        server_epoch_ms: u64,
    },

    /// Final transcript received from the recognition backend.
    #[serde(rename = "SVR_T4_FINAL")]
    FinalTranscript {
        t4_ms: u64,
        server_epoch_ms: u64,
        drop_rate: f64,
        transcript: String,
    },
}

/// Monotonic milliseconds since the first call in this process.
///
/// Mirrors a nanoTime-style monotonic timestamp: the epoch is arbitrary but
/// stable for the process lifetime, which is all the latency math needs.
pub fn monotonic_ms() -> u64 {
    static PROCESS_START: OnceLock<Instant> = OnceLock::new();
    PROCESS_START.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// Wall-clock epoch milliseconds.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Session-scoped emitter pushing events onto an unbounded channel.
///
/// ## Why a channel:
/// Milestones fire from worker tasks and from the bridge's result-dispatch
/// task, both outside the transport actor's context. The transport side owns
/// the receiver and serializes events onto the client connection, so emitting
/// never blocks the hot forwarding path.
#[derive(Clone)]
pub struct TelemetryEmitter {
    tx: mpsc::UnboundedSender<ServerEvent>,
}

impl TelemetryEmitter {
    /// Create an emitter plus the receiving end for the transport layer.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Emit the one-shot first-forward milestone. The caller is responsible
    /// for the once-per-session guarantee (see the worker pool).
    pub fn forwarding_started(&self) {
        let event = ServerEvent::ForwardingStarted {
            t3_ms: monotonic_ms(),
            server_epoch_ms: epoch_ms(),
        };
        // A closed receiver just means the client is gone; nothing to do.
        let _ = self.tx.send(event);
    }

    /// Emit a final-transcript milestone with the session's current drop rate.
    pub fn final_transcript(&self, transcript: &str, drop_rate: f64) {
        let event = ServerEvent::FinalTranscript {
            t4_ms: monotonic_ms(),
            server_epoch_ms: epoch_ms(),
            drop_rate,
            transcript: transcript.to_string(),
        };
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_t3_wire_format() {
        let event = ServerEvent::ForwardingStarted {
            t3_ms: 120,
            server_epoch_ms: 1_700_000_000_000,
        };

        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(json["type"], "SVR_T3");
        assert_eq!(json["t3_ms"], 120);
        assert_eq!(json["server_epoch_ms"], 1_700_000_000_000u64);
    }

    #[test]
    fn test_t4_wire_format_carries_drop_rate_and_transcript() {
        let event = ServerEvent::FinalTranscript {
            t4_ms: 950,
            server_epoch_ms: 1_700_000_000_500,
            drop_rate: 0.25,
            transcript: "hello world".to_string(),
        };

        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(json["type"], "SVR_T4_FINAL");
        assert_eq!(json["drop_rate"], 0.25);
        assert_eq!(json["transcript"], "hello world");
    }

    #[test]
    fn test_monotonic_ms_does_not_go_backwards() {
        let a = monotonic_ms();
        let b = monotonic_ms();
        assert!(b >= a);
    }

    #[tokio::test]
    async fn test_emitter_delivers_events_in_order() {
        let (emitter, mut rx) = TelemetryEmitter::channel();

        emitter.forwarding_started();
        emitter.final_transcript("done", 0.0);

        match rx.recv().await.unwrap() {
            ServerEvent::ForwardingStarted { .. } => {}
            other => panic!("Expected SVR_T3 first, got {:?}", other),
        }
        match rx.recv().await.unwrap() {
            ServerEvent::FinalTranscript { transcript, drop_rate, .. } => {
                assert_eq!(transcript, "done");
                assert_eq!(drop_rate, 0.0);
            }
            other => panic!("Expected SVR_T4_FINAL second, got {:?}", other),
        }
    }

    #[test]
    fn test_emitting_without_receiver_is_harmless() {
        let (emitter, rx) = TelemetryEmitter::channel();
        drop(rx);
        emitter.forwarding_started();
        emitter.final_transcript("ignored", 1.0);
    }
}
