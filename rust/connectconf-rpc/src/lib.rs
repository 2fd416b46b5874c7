#![forbid(unsafe_op_in_unsafe_fn)]

//! Connect, gRPC and gRPC-Web framing over the [`RoundTrip`] and
//! [`ResponseWriter`] seams.
//!
//! Covers enough of each protocol for the reference
//! client to drive a server under test, and for the reference server to
//! answer one. Message bodies use the codec the call selected; compression
//! applies per message for enveloped bodies and to the whole body for Connect
//! unary.
//!
//! [`RoundTrip`]: connectconf_wire::RoundTrip
//! [`ResponseWriter`]: connectconf_wire::ResponseWriter

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;

pub use client::{
    CallContext, CallOptions, Client, ClientConfig, ClientStream, SendError, UnaryResponse,
};
pub use error::RpcError;
pub use protocol::Wire;
pub use server::ServerCall;

/// Path of `method` on `service`.
pub fn procedure(service: &str, method: &str) -> String {
    format!("/{service}/{method}")
}
