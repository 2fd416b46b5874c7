//! Enumerations shared by directives, results and the RPC layer.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// HTTP version a test case runs over.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HttpVersion {
    #[default]
    #[serde(rename = "HTTP_VERSION_UNSPECIFIED")]
    Unspecified,
    #[serde(rename = "HTTP_VERSION_1")]
    Http1,
    #[serde(rename = "HTTP_VERSION_2")]
    Http2,
    #[serde(rename = "HTTP_VERSION_3")]
    Http3,
}

impl HttpVersion {
    /// Major version number, 0 when unspecified.
    pub fn major(self) -> u32 {
        match self {
            HttpVersion::Unspecified => 0,
            HttpVersion::Http1 => 1,
            HttpVersion::Http2 => 2,
            HttpVersion::Http3 => 3,
        }
    }

    pub fn from_major(major: u32) -> Option<Self> {
        match major {
            1 => Some(HttpVersion::Http1),
            2 => Some(HttpVersion::Http2),
            3 => Some(HttpVersion::Http3),
            _ => None,
        }
    }
}

/// RPC protocol.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    #[default]
    #[serde(rename = "PROTOCOL_UNSPECIFIED")]
    Unspecified,
    #[serde(rename = "PROTOCOL_CONNECT")]
    Connect,
    #[serde(rename = "PROTOCOL_GRPC")]
    Grpc,
    #[serde(rename = "PROTOCOL_GRPC_WEB")]
    GrpcWeb,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Unspecified => "PROTOCOL_UNSPECIFIED",
            Protocol::Connect => "PROTOCOL_CONNECT",
            Protocol::Grpc => "PROTOCOL_GRPC",
            Protocol::GrpcWeb => "PROTOCOL_GRPC_WEB",
        })
    }
}

impl FromStr for Protocol {
    type Err = UnknownValue;

    /// Accepts the enum name with or without the `PROTOCOL_` prefix, in any case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        match upper.trim_start_matches("PROTOCOL_") {
            "CONNECT" => Ok(Protocol::Connect),
            "GRPC" => Ok(Protocol::Grpc),
            "GRPC_WEB" => Ok(Protocol::GrpcWeb),
            _ => Err(UnknownValue::new("protocol", s)),
        }
    }
}

/// Message codec.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Codec {
    #[default]
    #[serde(rename = "CODEC_UNSPECIFIED")]
    Unspecified,
    #[serde(rename = "CODEC_PROTO")]
    Proto,
    #[serde(rename = "CODEC_JSON")]
    Json,
    #[serde(rename = "CODEC_TEXT")]
    Text,
}

impl Codec {
    /// Name used in content types and the Connect GET `encoding` parameter.
    pub fn name(self) -> &'static str {
        match self {
            Codec::Unspecified | Codec::Proto => "proto",
            Codec::Json => "json",
            Codec::Text => "text",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "proto" => Some(Codec::Proto),
            "json" => Some(Codec::Json),
            "text" => Some(Codec::Text),
            _ => None,
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Codec::Unspecified => "CODEC_UNSPECIFIED",
            Codec::Proto => "CODEC_PROTO",
            Codec::Json => "CODEC_JSON",
            Codec::Text => "CODEC_TEXT",
        })
    }
}

impl FromStr for Codec {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        match upper.trim_start_matches("CODEC_") {
            "PROTO" => Ok(Codec::Proto),
            "JSON" => Ok(Codec::Json),
            "TEXT" => Ok(Codec::Text),
            _ => Err(UnknownValue::new("codec", s)),
        }
    }
}

/// Compression algorithm.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Compression {
    #[default]
    #[serde(rename = "COMPRESSION_UNSPECIFIED")]
    Unspecified,
    #[serde(rename = "COMPRESSION_IDENTITY")]
    Identity,
    #[serde(rename = "COMPRESSION_GZIP")]
    Gzip,
    #[serde(rename = "COMPRESSION_BR")]
    Br,
    #[serde(rename = "COMPRESSION_ZSTD")]
    Zstd,
    #[serde(rename = "COMPRESSION_DEFLATE")]
    Deflate,
    #[serde(rename = "COMPRESSION_SNAPPY")]
    Snappy,
}

impl Compression {
    /// Encoding token as it appears in `*-encoding` headers.
    pub fn name(self) -> &'static str {
        match self {
            Compression::Unspecified | Compression::Identity => "identity",
            Compression::Gzip => "gzip",
            Compression::Br => "br",
            Compression::Zstd => "zstd",
            Compression::Deflate => "deflate",
            Compression::Snappy => "snappy",
        }
    }

    /// Parses an encoding token. The empty string means identity.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "" | "identity" => Some(Compression::Identity),
            "gzip" => Some(Compression::Gzip),
            "br" => Some(Compression::Br),
            "zstd" => Some(Compression::Zstd),
            "deflate" => Some(Compression::Deflate),
            "snappy" => Some(Compression::Snappy),
            _ => None,
        }
    }

    pub fn is_identity(self) -> bool {
        matches!(self, Compression::Unspecified | Compression::Identity)
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Compression::Unspecified => "COMPRESSION_UNSPECIFIED",
            Compression::Identity => "COMPRESSION_IDENTITY",
            Compression::Gzip => "COMPRESSION_GZIP",
            Compression::Br => "COMPRESSION_BR",
            Compression::Zstd => "COMPRESSION_ZSTD",
            Compression::Deflate => "COMPRESSION_DEFLATE",
            Compression::Snappy => "COMPRESSION_SNAPPY",
        })
    }
}

impl FromStr for Compression {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        let short = upper.trim_start_matches("COMPRESSION_");
        Compression::from_name(&short.to_ascii_lowercase())
            .ok_or_else(|| UnknownValue::new("compression", s))
    }
}

/// Shape of an RPC.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamType {
    #[default]
    #[serde(rename = "STREAM_TYPE_UNSPECIFIED")]
    Unspecified,
    #[serde(rename = "STREAM_TYPE_UNARY")]
    Unary,
    #[serde(rename = "STREAM_TYPE_CLIENT_STREAM")]
    ClientStream,
    #[serde(rename = "STREAM_TYPE_SERVER_STREAM")]
    ServerStream,
    #[serde(rename = "STREAM_TYPE_HALF_DUPLEX_BIDI_STREAM")]
    HalfDuplexBidiStream,
    #[serde(rename = "STREAM_TYPE_FULL_DUPLEX_BIDI_STREAM")]
    FullDuplexBidiStream,
}

impl StreamType {
    /// Whether responses are framed as a stream of envelopes.
    pub fn is_streaming(self) -> bool {
        !matches!(self, StreamType::Unary | StreamType::Unspecified)
    }
}

/// RPC status code.
///
/// Numbering matches gRPC. Connect carries the snake_case names on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Code {
    #[default]
    #[serde(rename = "CODE_UNSPECIFIED")]
    Unspecified,
    #[serde(rename = "CODE_CANCELED")]
    Canceled,
    #[serde(rename = "CODE_UNKNOWN")]
    Unknown,
    #[serde(rename = "CODE_INVALID_ARGUMENT")]
    InvalidArgument,
    #[serde(rename = "CODE_DEADLINE_EXCEEDED")]
    DeadlineExceeded,
    #[serde(rename = "CODE_NOT_FOUND")]
    NotFound,
    #[serde(rename = "CODE_ALREADY_EXISTS")]
    AlreadyExists,
    #[serde(rename = "CODE_PERMISSION_DENIED")]
    PermissionDenied,
    #[serde(rename = "CODE_RESOURCE_EXHAUSTED")]
    ResourceExhausted,
    #[serde(rename = "CODE_FAILED_PRECONDITION")]
    FailedPrecondition,
    #[serde(rename = "CODE_ABORTED")]
    Aborted,
    #[serde(rename = "CODE_OUT_OF_RANGE")]
    OutOfRange,
    #[serde(rename = "CODE_UNIMPLEMENTED")]
    Unimplemented,
    #[serde(rename = "CODE_INTERNAL")]
    Internal,
    #[serde(rename = "CODE_UNAVAILABLE")]
    Unavailable,
    #[serde(rename = "CODE_DATA_LOSS")]
    DataLoss,
    #[serde(rename = "CODE_UNAUTHENTICATED")]
    Unauthenticated,
}

const CODES: [Code; 17] = [
    Code::Unspecified,
    Code::Canceled,
    Code::Unknown,
    Code::InvalidArgument,
    Code::DeadlineExceeded,
    Code::NotFound,
    Code::AlreadyExists,
    Code::PermissionDenied,
    Code::ResourceExhausted,
    Code::FailedPrecondition,
    Code::Aborted,
    Code::OutOfRange,
    Code::Unimplemented,
    Code::Internal,
    Code::Unavailable,
    Code::DataLoss,
    Code::Unauthenticated,
];

impl Code {
    /// Convert from the numeric code; 0 (OK) has no `Code`.
    pub fn from_u32(val: u32) -> Option<Self> {
        match val {
            1..=16 => Some(CODES[val as usize]),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// The Connect protocol name, e.g. `invalid_argument`.
    pub fn connect_name(self) -> &'static str {
        match self {
            Code::Unspecified => "unspecified",
            Code::Canceled => "canceled",
            Code::Unknown => "unknown",
            Code::InvalidArgument => "invalid_argument",
            Code::DeadlineExceeded => "deadline_exceeded",
            Code::NotFound => "not_found",
            Code::AlreadyExists => "already_exists",
            Code::PermissionDenied => "permission_denied",
            Code::ResourceExhausted => "resource_exhausted",
            Code::FailedPrecondition => "failed_precondition",
            Code::Aborted => "aborted",
            Code::OutOfRange => "out_of_range",
            Code::Unimplemented => "unimplemented",
            Code::Internal => "internal",
            Code::Unavailable => "unavailable",
            Code::DataLoss => "data_loss",
            Code::Unauthenticated => "unauthenticated",
        }
    }

    pub fn from_connect_name(name: &str) -> Option<Self> {
        CODES[1..].iter().copied().find(|c| c.connect_name() == name)
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.connect_name())
    }
}

/// Error for a string that names no known enum value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownValue {
    kind: &'static str,
    value: String,
}

impl UnknownValue {
    fn new(kind: &'static str, value: &str) -> Self {
        UnknownValue {
            kind,
            value: value.to_string(),
        }
    }
}

impl fmt::Display for UnknownValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {}: {:?}", self.kind, self.value)
    }
}

impl std::error::Error for UnknownValue {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_numbers_follow_grpc() {
        assert_eq!(Code::from_u32(1), Some(Code::Canceled));
        assert_eq!(Code::from_u32(16), Some(Code::Unauthenticated));
        assert_eq!(Code::from_u32(0), None);
        assert_eq!(Code::from_u32(17), None);
        assert_eq!(Code::ResourceExhausted.as_u32(), 8);
    }

    #[test]
    fn code_connect_names() {
        assert_eq!(Code::DeadlineExceeded.connect_name(), "deadline_exceeded");
        assert_eq!(Code::from_connect_name("already_exists"), Some(Code::AlreadyExists));
        assert_eq!(Code::from_connect_name("unspecified"), None);
        assert_eq!(Code::from_connect_name("bogus"), None);
    }

    #[test]
    fn compression_names() {
        assert_eq!(Compression::from_name(""), Some(Compression::Identity));
        assert_eq!(Compression::from_name("GZIP"), Some(Compression::Gzip));
        assert_eq!(Compression::from_name("lz4"), None);
        assert_eq!("COMPRESSION_ZSTD".parse::<Compression>(), Ok(Compression::Zstd));
        assert_eq!(Compression::Unspecified.name(), "identity");
    }

    #[test]
    fn protocol_parse_accepts_short_names() {
        assert_eq!("grpc_web".parse::<Protocol>(), Ok(Protocol::GrpcWeb));
        assert_eq!("PROTOCOL_CONNECT".parse::<Protocol>(), Ok(Protocol::Connect));
        let err = "http".parse::<Protocol>().unwrap_err();
        assert_eq!(err.to_string(), r#"unknown protocol: "http""#);
    }

    #[test]
    fn enums_serialize_with_proto_names() {
        let json = serde_json::to_string(&HttpVersion::Http2).unwrap();
        assert_eq!(json, r#""HTTP_VERSION_2""#);
        let codec: Codec = serde_json::from_str(r#""CODEC_JSON""#).unwrap();
        assert_eq!(codec, Codec::Json);
    }
}
