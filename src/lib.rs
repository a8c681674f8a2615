#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # xrpc
//!
//! xrpc is a small, general-purpose RPC runtime: a bidirectional framed
//! wire protocol between clients and servers, a server-side dispatcher
//! that invokes registered service methods by name, a client-side
//! in-flight call registry that multiplexes many concurrent calls over
//! one transport connection, and a service-discovery + load-balancing
//! facade (the "X-Client") layered on top of per-endpoint clients.
//!
//! ## Components
//!
//! - [`codec`] — pluggable `(Header, Body)` frame encoding over a byte
//!   stream. Ships one implementation, [`codec::BincodeCodec`].
//! - [`service`] — admits and dispatches named `"Service.Method"` calls
//!   against a registered receiver, without runtime reflection.
//! - [`server`] — accepts connections, negotiates the handshake, reads
//!   pipelined framed requests, dispatches them, and enforces a
//!   per-connection handle timeout.
//! - [`client`] — one connection to one server: sequencing, the
//!   pending-call table, the background reader, and the blocking/
//!   asynchronous call APIs with per-call cancellation.
//! - [`discovery`] — produces endpoint lists for the X-Client to select
//!   from, either a static list or one kept current by polling a
//!   [`registry`].
//! - [`xclient`] — owns a [`discovery::Discovery`], caches a
//!   [`client::Client`] per endpoint, and implements `call` and
//!   `broadcast`.
//! - [`registry`] — a small HTTP service holding `{addr -> lastHeartbeat}`
//!   with TTL-based, lazily-swept liveness.
//!
//! ## What this crate deliberately does not do
//!
//! The serialization format is a pluggable [`codec::WireCodec`]; the
//! transport is any ordered, reliable, bidirectional byte stream (this
//! crate drives it over TCP, but nothing in [`client`] or [`server`]
//! assumes that specifically). There is no cross-runtime wire
//! compatibility with any other RPC system, no streaming/bidi-stream
//! calls (one request, one response), no authentication or TLS, and no
//! flow control beyond what the transport already provides.

#[macro_use]
mod trace;
#[macro_use]
mod cfg;

mod common;
pub mod codec;
pub mod error;
pub mod option;
pub mod service;

cfg_server! {
    pub mod server;
}

cfg_client! {
    pub mod client;
}

cfg_discovery! {
    pub mod discovery;
    pub mod xclient;
}

cfg_registry! {
    pub mod registry;
}

pub use crate::error::{Error, Result};
pub use crate::option::ConnectOption;
