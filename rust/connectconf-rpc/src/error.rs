//! RPC errors and the forms they take on the wire.
//!
//! Connect carries errors as JSON: the whole body of a unary error response,
//! or the `error` member of a streaming end-stream message. gRPC and gRPC-Web
//! carry them as `grpc-status`, `grpc-message` and `grpc-status-details-bin`
//! fields, in HTTP trailers or a trailers block.

use std::collections::BTreeMap;
use std::fmt;

use base64::Engine as _;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;
use serde::{Deserialize, Serialize};

use connectconf_proto::{Any, Code, RpcStatus};
use connectconf_wire::BoxError;
use connectconf_wire::codec::CodecError;
use connectconf_wire::compression::CompressionError;
use connectconf_wire::envelope::FrameError;

pub const GRPC_STATUS: &str = "grpc-status";
pub const GRPC_MESSAGE: &str = "grpc-message";
pub const GRPC_STATUS_DETAILS: &str = "grpc-status-details-bin";

/// Standard base64 that writes no padding and reads either form.
pub(crate) const BASE64_STD: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// URL-safe base64 that writes no padding and reads either form.
pub(crate) const BASE64_URL: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// An RPC failed with a status code.
#[derive(Clone, Debug, PartialEq)]
pub struct RpcError {
    pub code: Code,
    pub message: String,
    pub details: Vec<Any>,
    /// Response headers that came with the error.
    pub headers: HeaderMap,
    /// Response trailers that came with the error.
    pub trailers: HeaderMap,
    /// Set when the error was read off the wire rather than raised locally.
    pub wire: bool,
}

impl RpcError {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        RpcError {
            code,
            message: message.into(),
            details: Vec::new(),
            headers: HeaderMap::new(),
            trailers: HeaderMap::new(),
            wire: false,
        }
    }

    pub fn canceled() -> Self {
        RpcError::new(Code::Canceled, "context canceled")
    }

    pub fn deadline_exceeded() -> Self {
        RpcError::new(Code::DeadlineExceeded, "context deadline exceeded")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        RpcError::new(Code::Internal, message)
    }

    pub fn with_details(mut self, details: Vec<Any>) -> Self {
        self.details = details;
        self
    }

    /// A transport failure. Connection-level problems are `unavailable`.
    pub fn from_transport(err: &BoxError) -> Self {
        RpcError::new(Code::Unavailable, err.to_string())
    }

    /// Build the error a peer described in a gRPC status.
    fn from_grpc(code: u32, message: String, details: Vec<Any>) -> Self {
        let code = Code::from_u32(code).unwrap_or(Code::Unknown);
        RpcError {
            wire: true,
            ..RpcError::new(code, message).with_details(details)
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

impl std::error::Error for RpcError {}

impl From<FrameError> for RpcError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::TooLarge { .. } => RpcError::new(Code::ResourceExhausted, err.to_string()),
            FrameError::Incomplete { .. } => RpcError::internal(err.to_string()),
        }
    }
}

impl From<CompressionError> for RpcError {
    fn from(err: CompressionError) -> Self {
        match err {
            CompressionError::TooLarge { .. } => {
                RpcError::new(Code::ResourceExhausted, err.to_string())
            }
            CompressionError::Unknown(_) => RpcError::new(Code::Unimplemented, err.to_string()),
            CompressionError::Io { .. } => RpcError::internal(err.to_string()),
        }
    }
}

impl From<CodecError> for RpcError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Unsupported(_) => RpcError::new(Code::Unimplemented, err.to_string()),
            _ => RpcError::internal(err.to_string()),
        }
    }
}

// ============================================================================
// HTTP status mapping
// ============================================================================

/// Code implied by an HTTP status when the body carries no error.
pub fn code_from_http_status(status: StatusCode) -> Code {
    match status.as_u16() {
        400 => Code::Internal,
        401 => Code::Unauthenticated,
        403 => Code::PermissionDenied,
        404 => Code::Unimplemented,
        429 | 502 | 503 | 504 => Code::Unavailable,
        _ => Code::Unknown,
    }
}

/// HTTP status of a Connect unary error response.
pub fn http_status_from_code(code: Code) -> StatusCode {
    let status = match code {
        Code::Canceled => 499,
        Code::InvalidArgument | Code::FailedPrecondition | Code::OutOfRange => 400,
        Code::DeadlineExceeded => 504,
        Code::NotFound => 404,
        Code::AlreadyExists | Code::Aborted => 409,
        Code::PermissionDenied => 403,
        Code::ResourceExhausted => 429,
        Code::Unimplemented => 501,
        Code::Unavailable => 503,
        Code::Unauthenticated => 401,
        Code::Unspecified | Code::Unknown | Code::Internal | Code::DataLoss => 500,
    };
    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

// ============================================================================
// Connect JSON
// ============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
struct WireError {
    #[serde(default)]
    code: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    details: Vec<WireDetail>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireDetail {
    #[serde(rename = "type")]
    type_name: String,
    value: String,
}

impl WireError {
    fn from_error(err: &RpcError) -> Self {
        WireError {
            code: err.code.connect_name().to_string(),
            message: err.message.clone(),
            details: err
                .details
                .iter()
                .map(|any| WireDetail {
                    type_name: any.type_name().to_string(),
                    value: BASE64_STD.encode(&any.value),
                })
                .collect(),
        }
    }

    fn into_error(self, fallback: Code) -> RpcError {
        let code = Code::from_connect_name(&self.code).unwrap_or(fallback);
        let details = self
            .details
            .into_iter()
            .filter_map(|d| {
                let value = BASE64_STD.decode(d.value.as_bytes()).ok()?;
                Some(Any {
                    type_url: format!("{}{}", connectconf_proto::TYPE_URL_PREFIX, d.type_name),
                    value,
                })
            })
            .collect();
        RpcError {
            wire: true,
            ..RpcError::new(code, self.message).with_details(details)
        }
    }
}

/// The JSON body of a Connect unary error response.
pub fn connect_error_json(err: &RpcError) -> Vec<u8> {
    serde_json::to_vec(&WireError::from_error(err)).unwrap_or_default()
}

/// Read a Connect unary error body, falling back to the HTTP status.
pub fn parse_connect_error(body: &[u8], status: StatusCode) -> RpcError {
    let fallback = code_from_http_status(status);
    match serde_json::from_slice::<WireError>(body) {
        Ok(wire) if !wire.code.is_empty() => wire.into_error(fallback),
        _ => RpcError {
            wire: true,
            ..RpcError::new(
                fallback,
                status.canonical_reason().unwrap_or_default().to_string(),
            )
        },
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct EndStream {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<WireError>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    metadata: BTreeMap<String, Vec<String>>,
}

/// The payload of a Connect end-stream message.
pub fn connect_end_stream_json(err: Option<&RpcError>, trailers: &HeaderMap) -> Vec<u8> {
    let mut metadata: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in trailers {
        metadata
            .entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    let end = EndStream {
        error: err.map(WireError::from_error),
        metadata,
    };
    serde_json::to_vec(&end).unwrap_or_default()
}

/// Parse a Connect end-stream message into trailers and an optional error.
pub fn parse_connect_end_stream(payload: &[u8]) -> Result<(HeaderMap, Option<RpcError>), RpcError> {
    let end: EndStream = serde_json::from_slice(payload).map_err(|err| {
        RpcError::internal(format!("protocol error: invalid end stream message: {err}"))
    })?;
    let mut trailers = HeaderMap::new();
    for (name, values) in end.metadata {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        for value in values {
            if let Ok(value) = HeaderValue::from_str(&value) {
                trailers.append(name.clone(), value);
            }
        }
    }
    Ok((trailers, end.error.map(|e| e.into_error(Code::Unknown))))
}

// ============================================================================
// gRPC status
// ============================================================================

/// Percent-encode a `grpc-message` value.
pub fn encode_grpc_message(msg: &str) -> String {
    let mut out = String::with_capacity(msg.len());
    for b in msg.bytes() {
        if (0x20..=0x7e).contains(&b) && b != b'%' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

/// Decode a `grpc-message` value. Malformed escapes are kept as they are.
pub fn decode_grpc_message(msg: &str) -> String {
    match urlencoding::decode_binary(msg.as_bytes()) {
        std::borrow::Cow::Borrowed(b) => String::from_utf8_lossy(b).into_owned(),
        std::borrow::Cow::Owned(b) => String::from_utf8_lossy(&b).into_owned(),
    }
}

/// The status fields describing `err`, or success.
pub fn grpc_status_fields(err: Option<&RpcError>) -> HeaderMap {
    let mut fields = HeaderMap::new();
    let Some(err) = err else {
        fields.insert(GRPC_STATUS, HeaderValue::from_static("0"));
        return fields;
    };
    fields.insert(GRPC_STATUS, HeaderValue::from(err.code.as_u32()));
    if let Ok(value) = HeaderValue::from_str(&encode_grpc_message(&err.message)) {
        fields.insert(GRPC_MESSAGE, value);
    }
    if !err.details.is_empty() {
        let status = RpcStatus {
            code: err.code.as_u32() as i32,
            message: err.message.clone(),
            details: err.details.clone(),
        };
        if let Ok(bin) = postcard::to_allocvec(&status)
            && let Ok(value) = HeaderValue::from_str(&BASE64_STD.encode(bin))
        {
            fields.insert(GRPC_STATUS_DETAILS, value);
        }
    }
    fields
}

/// Read the status out of gRPC trailers. `Ok(None)` means success.
pub fn parse_grpc_status(trailers: &HeaderMap) -> Result<Option<RpcError>, RpcError> {
    let Some(status) = trailers.get(GRPC_STATUS) else {
        return Err(RpcError::internal("protocol error: no grpc-status trailer"));
    };
    let code: u32 = status
        .to_str()
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| {
            RpcError::internal(format!("protocol error: invalid grpc-status {status:?}"))
        })?;
    if code == 0 {
        return Ok(None);
    }
    let message = trailers
        .get(GRPC_MESSAGE)
        .and_then(|v| v.to_str().ok())
        .map(decode_grpc_message)
        .unwrap_or_default();
    let details = trailers
        .get(GRPC_STATUS_DETAILS)
        .and_then(|v| BASE64_STD.decode(v.as_bytes()).ok())
        .and_then(|bin| postcard::from_bytes::<RpcStatus>(&bin).ok())
        .map(|s| s.details)
        .unwrap_or_default();
    Ok(Some(RpcError::from_grpc(code, message, details)))
}

/// Decode `grpc-status-details-bin` into a status message.
pub fn decode_status_details(value: &str) -> Result<RpcStatus, String> {
    let bin = BASE64_STD
        .decode(value.as_bytes())
        .map_err(|err| format!("invalid base64: {err}"))?;
    postcard::from_bytes(&bin).map_err(|err| format!("invalid status message: {err}"))
}

// ============================================================================
// gRPC-Web trailers block
// ============================================================================

/// Serialize trailers as a gRPC-Web trailers block: lowercase names, CRLF lines.
pub fn grpc_web_trailers_block(trailers: &HeaderMap) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, value) in trailers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Parse a gRPC-Web trailers block leniently.
pub fn parse_grpc_web_trailers(block: &[u8]) -> HeaderMap {
    let mut trailers = HeaderMap::new();
    for line in block.split(|b| *b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let Some(colon) = line.iter().position(|b| *b == b':') else {
            continue;
        };
        let name = String::from_utf8_lossy(&line[..colon]).trim().to_ascii_lowercase();
        let value = String::from_utf8_lossy(&line[colon + 1..]).trim().to_string();
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            trailers.append(name, value);
        }
    }
    trailers
}
