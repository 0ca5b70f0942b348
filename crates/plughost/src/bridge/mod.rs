//! IPC bridge for supervisor-worker communication.
//!
//! This module provides the rendezvous endpoint, wire protocol and codec for
//! communication between the supervisor (parent) and the plugin host (worker).
//!
//! # Architecture
//!
//! - **endpoint**: One-shot local socket / named pipe the worker connects back to
//! - **protocol**: HostMessage (TerminateRequest, TerminatedEvent, Application)
//! - **codec**: Length-prefixed CBOR framing for AsyncRead/AsyncWrite

pub mod codec;
pub mod endpoint;
pub mod protocol;
