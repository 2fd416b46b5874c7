//! Serialization of raw request and response bodies.
//!
//! Raw bodies let a directive put exact bytes on the wire, including framing
//! that disagrees with its payload.

use std::io::Write;

use connectconf_proto::{MessageContents, MessageData, RawBody, StreamContents};

use crate::compression::Encoder;
use crate::envelope::{Envelope, PREFIX_LEN};

#[derive(Debug, thiserror::Error)]
pub enum RawBodyError {
    #[error("message #{index}: flags is out of range: {flags}, should be [0,255]")]
    FlagsOutOfRange { index: usize, flags: u32 },

    #[error("message #{index}: {err}")]
    Item {
        index: usize,
        err: Box<RawBodyError>,
    },

    #[error("{algorithm}: {err}")]
    Compress {
        algorithm: &'static str,
        err: std::io::Error,
    },

    #[error("write raw body: {0}")]
    Io(#[from] std::io::Error),
}

/// The uncompressed bytes a [`MessageContents`] describes.
pub fn message_bytes(contents: &MessageContents) -> &[u8] {
    match &contents.data {
        None => &[],
        Some(MessageData::Binary(bytes)) => bytes,
        Some(MessageData::Text(text)) => text.as_bytes(),
        Some(MessageData::BinaryMessage(any)) => &any.value,
    }
}

/// Write one message, compressed as `contents.compression` says.
///
/// Contents without data write nothing, not even a compression header.
pub fn write_raw_message_contents<W: Write>(
    contents: &MessageContents,
    writer: &mut W,
) -> Result<(), RawBodyError> {
    if contents.data.is_none() {
        return Ok(());
    }
    let data = message_bytes(contents);
    if contents.compression.is_identity() {
        writer.write_all(data)?;
        return Ok(());
    }
    let algorithm = contents.compression.name();
    let compress_err = |err| RawBodyError::Compress { algorithm, err };
    let mut encoder = Encoder::new(contents.compression, writer).map_err(compress_err)?;
    encoder.write_all(data).map_err(compress_err)?;
    encoder.finish().map_err(compress_err)?;
    Ok(())
}

/// Write a sequence of envelopes.
///
/// An item's explicit `length` goes on the wire verbatim. Otherwise the
/// length is that of the serialized (possibly compressed) payload.
pub fn write_raw_stream_contents<W: Write>(
    contents: &StreamContents,
    writer: &mut W,
) -> Result<(), RawBodyError> {
    for (i, item) in contents.items.iter().enumerate() {
        let index = i + 1;
        let flags = u8::try_from(item.flags).map_err(|_| RawBodyError::FlagsOutOfRange {
            index,
            flags: item.flags,
        })?;
        let wrap = |err: RawBodyError| RawBodyError::Item {
            index,
            err: Box::new(err),
        };

        let mut payload = Vec::new();
        write_raw_message_contents(&item.payload, &mut payload).map_err(wrap)?;
        let env = Envelope {
            flags,
            len: item.length.unwrap_or(payload.len() as u32),
        };
        let mut framed = Vec::with_capacity(PREFIX_LEN + payload.len());
        framed.extend_from_slice(&env.to_bytes());
        framed.extend_from_slice(&payload);
        writer
            .write_all(&framed)
            .map_err(|err| wrap(RawBodyError::Io(err)))?;
    }
    Ok(())
}

/// Serialize a raw body to bytes.
pub fn raw_body_bytes(body: &RawBody) -> Result<Vec<u8>, RawBodyError> {
    let mut out = Vec::new();
    match body {
        RawBody::Unary(contents) => write_raw_message_contents(contents, &mut out)?,
        RawBody::Stream(stream) => write_raw_stream_contents(stream, &mut out)?,
    }
    Ok(out)
}
