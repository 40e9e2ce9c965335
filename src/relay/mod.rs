//! # Audio Relay Pipeline
//!
//! The per-session pipeline between the client transport and the recognition
//! backend:
//!
//! - **Session Buffer**: decouples chunk arrival from forwarding, with
//!   configurable backpressure policies
//! - **Worker Pool**: drains the buffer and pushes chunks into the bridge
//! - **Session Management**: per-connection lifecycle plus the registry the
//!   transport layer routes through

pub mod buffer;
pub mod session;
pub mod worker;
