#![forbid(unsafe_op_in_unsafe_fn)]

//! Wire traces of HTTP operations.
//!
//! A [`Trace`] records one HTTP operation attempt as it happened on the
//! wire: the request and response heads, the size of each message
//! envelope in both directions, trailers, end-of-stream content, and how
//! the operation ended. Traces are produced by
//!
//! - [`TracingRoundTripper`], wrapping a client transport,
//! - [`TracingHandler`], wrapping a server handler,
//! - [`TracingHttp2Conn`], tapping a raw HTTP/2 connection so that every
//!   stream is seen, including ones the HTTP stack retries on its own,
//!
//! and handed to a [`Collector`], typically a [`TraceRegistry`] keyed by
//! test case name.

pub mod builder;
pub mod http2;
pub mod middleware;
pub mod registry;
pub mod tap;
pub mod trace;

pub use builder::{Builder, Collector, Direction};
pub use http2::{ErrorCode, RETRY_WAIT, RetryCollector, TracingHttp2Conn};
pub use middleware::{TracingHandler, TracingResponseWriter, TracingRoundTripper};
pub use registry::{RegistryError, TraceRegistry};
pub use tap::{BodyProperties, DataTap, Decompressor, TracingBody, properties_from_headers};
pub use trace::{Event, EventKind, RequestInfo, ResponseInfo, Trace, TraceError};
