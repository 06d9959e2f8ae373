//! skua: a deadline-aware multiplexed RPC core.
//!
//! This crate provides:
//! - Typed call shapes: unary, server-streaming, client-streaming, bidi
//!   ([`Channel`], [`StreamSender`], [`StreamReceiver`])
//! - Per-call envelopes with deadline, cancellation, metadata
//!   ([`CallEnvelope`], [`CallOptions`])
//! - Method dispatch with startup-checked registration
//!   ([`Dispatcher`], [`DispatcherBuilder`])
//! - A status taxonomy distinguishing caller faults from server faults
//!   ([`Status`], [`StatusCode`])
//! - Encrypted or plaintext transport ([`Security`], [`ClientTlsConfig`],
//!   [`ServerTlsConfig`]) and an accept loop ([`Server`])
//! - An in-memory CRUD collaborator ([`Store`], [`MemStore`])
//!
//! Many calls multiplex over one connection; frames are routed by call id
//! and no call observes another call's traffic.

#![forbid(unsafe_code)]

mod channel;
mod conn;
mod dispatch;
mod envelope;
mod error;
mod frame;
mod server;
mod status;
mod store;
mod stream;
mod tls;

pub use channel::{CallOptions, Channel, UnaryResponse};
pub use dispatch::{Dispatcher, DispatcherBuilder};
pub use envelope::CallEnvelope;
pub use error::{ConfigError, RpcError, TransportError};
pub use server::Server;
pub use status::{Status, StatusCode};
pub use store::{MemStore, RecordId, Store};
pub use stream::{StreamReceiver, StreamSender};
pub use tls::{ClientTlsConfig, Security, ServerTlsConfig};

// Re-export so callers can mint tokens for CallOptions without naming
// tokio-util themselves.
pub use tokio_util::sync::CancellationToken;
