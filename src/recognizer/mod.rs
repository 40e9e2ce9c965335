//! # Recognition Backend Integration
//!
//! Everything that talks to the remote streaming speech-recognition backend:
//!
//! - **Credentials**: API-token loading and validation
//! - **Streaming Bridge**: the per-session bidirectional stream (audio out,
//!   transcript events in) plus the result-dispatch task
//!
//! The backend's recognition algorithm and exact wire protocol are external
//! collaborators; this module only owns the adapter.

pub mod bridge;
pub mod credentials;
