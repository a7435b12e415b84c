//! IPC bridge for host-worker communication.
//!
//! This module provides the wire protocol, codec and transport shared by the
//! host-side multiplexer and the worker-side client.
//!
//! # Architecture
//!
//! - **protocol**: Message types, request-kind catalogue, result codes
//! - **codec**: Fixed-header framing codec for AsyncRead/AsyncWrite
//! - **transport**: Unix socket listener and connector

pub mod codec;
pub mod protocol;
pub mod transport;
