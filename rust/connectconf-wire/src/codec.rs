// rust/connectconf-wire/src/codec.rs

//! Record codecs for the runner's stdin/stdout streams and for RPC messages.

use std::fmt;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use connectconf_proto::Codec as MessageCodec;

use crate::delimited::{self, DelimitedError};

/// Serialization format identifier.
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
    /// Postcard: compact binary format, stands in for the protobuf binary form.
    Postcard = 1,
    /// JSON: camelCase field names, base64 byte strings.
    Json = 2,
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encoding::Postcard => write!(f, "postcard"),
            Encoding::Json => write!(f, "json"),
        }
    }
}

/// Codec trait for message serialization.
///
/// Each codec declares its encoding and its error types.
pub trait Codec {
    const ENCODING: Encoding;

    type EncodeError: std::error::Error;

    type DecodeError: std::error::Error;

    fn encode<T: Serialize>(val: &T) -> Result<Vec<u8>, Self::EncodeError>;

    fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, Self::DecodeError>;
}

pub struct PostcardCodec;

impl Codec for PostcardCodec {
    const ENCODING: Encoding = Encoding::Postcard;
    type EncodeError = postcard::Error;
    type DecodeError = postcard::Error;

    fn encode<T: Serialize>(val: &T) -> Result<Vec<u8>, Self::EncodeError> {
        postcard::to_allocvec(val)
    }

    fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, Self::DecodeError> {
        postcard::from_bytes(buf)
    }
}

pub struct JsonCodec;

impl Codec for JsonCodec {
    const ENCODING: Encoding = Encoding::Json;
    type EncodeError = serde_json::Error;
    type DecodeError = serde_json::Error;

    fn encode<T: Serialize>(val: &T) -> Result<Vec<u8>, Self::EncodeError> {
        serde_json::to_vec(val)
    }

    fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, Self::DecodeError> {
        serde_json::from_slice(buf)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("postcard: {0}")]
    Postcard(#[from] postcard::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Delimited(#[from] DelimitedError),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected EOF: input ended inside a JSON value")]
    TruncatedJson,

    #[error("codec {0} is not supported")]
    Unsupported(MessageCodec),
}

/// Encode an RPC message with the codec a directive selected.
pub fn encode_message<T: Serialize>(codec: MessageCodec, val: &T) -> Result<Vec<u8>, CodecError> {
    match codec {
        MessageCodec::Unspecified | MessageCodec::Proto => Ok(PostcardCodec::encode(val)?),
        MessageCodec::Json => Ok(JsonCodec::encode(val)?),
        MessageCodec::Text => Err(CodecError::Unsupported(codec)),
    }
}

/// Decode an RPC message with the codec a directive selected.
pub fn decode_message<T: DeserializeOwned>(
    codec: MessageCodec,
    buf: &[u8],
) -> Result<T, CodecError> {
    match codec {
        MessageCodec::Unspecified | MessageCodec::Proto => Ok(PostcardCodec::decode(buf)?),
        MessageCodec::Json => Ok(JsonCodec::decode(buf)?),
        MessageCodec::Text => Err(CodecError::Unsupported(codec)),
    }
}

/// How records are laid out on a byte stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordFormat {
    /// Length-delimited postcard records.
    Binary,
    /// Newline-delimited JSON objects. Pretty-printed input is accepted.
    Json,
}

impl RecordFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            RecordFormat::Json
        } else {
            RecordFormat::Binary
        }
    }
}

/// Reads typed records from a byte stream.
pub struct RecordReader<R> {
    inner: R,
    format: RecordFormat,
    from: String,
    max_size: usize,
    timeout: Option<Duration>,
    buf: BytesMut,
    eof: bool,
}

impl<R: AsyncRead + Unpin> RecordReader<R> {
    pub fn new(inner: R, format: RecordFormat, from: impl Into<String>) -> Self {
        RecordReader {
            inner,
            format,
            from: from.into(),
            max_size: delimited::DEFAULT_MAX_SIZE,
            timeout: None,
            buf: BytesMut::new(),
            eof: false,
        }
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Bound each binary record read. JSON records are not timed.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The next record, or `None` at a clean end of input.
    pub async fn next<T: DeserializeOwned>(&mut self) -> Result<Option<T>, CodecError> {
        match self.format {
            RecordFormat::Binary => {
                let record =
                    delimited::read_delimited(&mut self.inner, &self.from, self.max_size, self.timeout)
                        .await?;
                match record {
                    Some(bytes) => Ok(Some(PostcardCodec::decode(&bytes)?)),
                    None => Ok(None),
                }
            }
            RecordFormat::Json => self.next_json().await,
        }
    }

    async fn next_json<T: DeserializeOwned>(&mut self) -> Result<Option<T>, CodecError> {
        loop {
            let mut stream = serde_json::Deserializer::from_slice(&self.buf).into_iter::<T>();
            match stream.next() {
                Some(Ok(value)) => {
                    let consumed = stream.byte_offset();
                    self.buf.advance(consumed);
                    return Ok(Some(value));
                }
                Some(Err(err)) if err.is_eof() => {
                    if self.eof {
                        return Err(CodecError::TruncatedJson);
                    }
                }
                Some(Err(err)) => return Err(err.into()),
                None => {
                    if self.eof {
                        self.buf.clear();
                        return Ok(None);
                    }
                }
            }
            if self.buf.len() > self.max_size {
                return Err(DelimitedError::TooLarge {
                    from: self.from.clone(),
                    size: self.buf.len(),
                    max: self.max_size,
                }
                .into());
            }
            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                self.eof = true;
            }
        }
    }
}

/// Writes typed records to a byte stream.
pub struct RecordWriter<W> {
    inner: W,
    format: RecordFormat,
}

impl<W: AsyncWrite + Unpin> RecordWriter<W> {
    pub fn new(inner: W, format: RecordFormat) -> Self {
        RecordWriter { inner, format }
    }

    pub async fn write<T: Serialize>(&mut self, val: &T) -> Result<(), CodecError> {
        match self.format {
            RecordFormat::Binary => {
                let bytes = PostcardCodec::encode(val)?;
                delimited::write_delimited(&mut self.inner, &bytes).await?;
            }
            RecordFormat::Json => {
                let mut bytes = JsonCodec::encode(val)?;
                if bytes.last() != Some(&b'\n') {
                    bytes.push(b'\n');
                }
                self.inner.write_all(&bytes).await?;
                self.inner.flush().await?;
            }
        }
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delimited::test_io::ScriptedReader;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Directive {
        id: u32,
        name: String,
    }

    fn directive(id: u32) -> Directive {
        Directive {
            id,
            name: format!("case-{id}"),
        }
    }

    #[test]
    fn encoding_display() {
        assert_eq!(Encoding::Postcard.to_string(), "postcard");
        assert_eq!(Encoding::Json.to_string(), "json");
    }

    #[test]
    fn postcard_is_smaller_than_json() {
        let msg = directive(42);
        let postcard = PostcardCodec::encode(&msg).unwrap();
        let json = JsonCodec::encode(&msg).unwrap();
        assert!(postcard.len() < json.len());
    }

    #[test]
    fn text_codec_is_rejected() {
        let err = encode_message(MessageCodec::Text, &directive(1)).unwrap_err();
        assert_eq!(err.to_string(), "codec CODEC_TEXT is not supported");
    }

    #[tokio::test]
    async fn binary_records_through_a_pipe() {
        let (a, b) = tokio::io::duplex(1024);
        let mut writer = RecordWriter::new(a, RecordFormat::Binary);
        writer.write(&directive(1)).await.unwrap();
        writer.write(&directive(2)).await.unwrap();
        drop(writer);

        let mut reader = RecordReader::new(b, RecordFormat::Binary, "runner");
        assert_eq!(reader.next::<Directive>().await.unwrap(), Some(directive(1)));
        assert_eq!(reader.next::<Directive>().await.unwrap(), Some(directive(2)));
        assert_eq!(reader.next::<Directive>().await.unwrap(), None);
    }

    #[tokio::test]
    async fn json_writer_emits_one_line_per_record() {
        let mut writer = RecordWriter::new(Vec::new(), RecordFormat::Json);
        writer.write(&directive(7)).await.unwrap();
        let out = String::from_utf8(writer.into_inner()).unwrap();
        assert_eq!(out, "{\"id\":7,\"name\":\"case-7\"}\n");
    }

    #[tokio::test]
    async fn json_reader_accepts_pretty_printed_and_split_input() {
        let input = "{\n  \"id\": 1,\n  \"name\": \"case-1\"\n}\n{\"id\":2,\"name\":\"case-2\"}\n  \n";
        let bytes = input.as_bytes();
        let reader = ScriptedReader::new(vec![
            bytes[..10].to_vec(),
            bytes[10..31].to_vec(),
            bytes[31..].to_vec(),
        ]);
        let mut reader = RecordReader::new(reader, RecordFormat::Json, "runner");
        assert_eq!(reader.next::<Directive>().await.unwrap(), Some(directive(1)));
        assert_eq!(reader.next::<Directive>().await.unwrap(), Some(directive(2)));
        assert_eq!(reader.next::<Directive>().await.unwrap(), None);
    }

    #[tokio::test]
    async fn json_reader_reports_truncated_value() {
        let reader = ScriptedReader::new(vec![b"{\"id\": 1, \"na".to_vec()]);
        let mut reader = RecordReader::new(reader, RecordFormat::Json, "runner");
        let err = reader.next::<Directive>().await.unwrap_err();
        assert!(matches!(err, CodecError::TruncatedJson), "{err}");
    }

    #[tokio::test]
    async fn json_reader_rejects_garbage() {
        let reader = ScriptedReader::new(vec![b"not json\n".to_vec()]);
        let mut reader = RecordReader::new(reader, RecordFormat::Json, "runner");
        assert!(matches!(
            reader.next::<Directive>().await,
            Err(CodecError::Json(_))
        ));
    }
}
