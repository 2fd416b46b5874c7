#![forbid(unsafe_op_in_unsafe_fn)]

//! Framing primitives shared by the reference client and server.
//!
//! - [`delimited`] and [`codec`]: length-prefixed records on stdin/stdout
//! - [`envelope`]: the 5-byte message prefix of the streaming protocols
//! - [`compression`]: encoder/decoder factories per algorithm
//! - [`raw_body`]: byte-exact request and response bodies
//! - [`http`]: body aliases, [`RoundTrip`], [`Handler`] and [`ResponseWriter`]

pub mod codec;
pub mod compression;
pub mod delimited;
pub mod envelope;
pub mod headers;
pub mod http;
pub mod printer;
pub mod raw_body;
pub mod tls;

pub use codec::{CodecError, RecordFormat, RecordReader, RecordWriter};
pub use delimited::DelimitedError;
pub use envelope::Envelope;
pub use self::http::{Body, BoxError, Handler, ResponseWriter, RoundTrip};
pub use printer::{FeedbackPrinter, Printer, WritePrinter};
