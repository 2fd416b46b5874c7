#![forbid(unsafe_op_in_unsafe_fn)]

//! Schema types exchanged between the conformance runner and the reference
//! client and server.
//!
//! Every type here is plain data deriving serde. The same values travel in
//! two encodings:
//! - a compact binary form (postcard), standing in for the protobuf binary
//!   encoding, used by default on stdin/stdout and for `PROTO` RPC messages
//! - a JSON form (camelCase field names, base64 byte strings), selected with
//!   `--json` and used for `JSON` RPC messages

pub mod any;
pub mod bytes_serde;
pub mod compat;
pub mod config;
pub mod service;

pub use any::{Any, Message, TYPE_URL_PREFIX};
pub use compat::*;
pub use config::*;
pub use service::*;
