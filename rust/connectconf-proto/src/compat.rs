//! Records exchanged over stdin/stdout with the test runner.

use serde::{Deserialize, Serialize};

use crate::any::Any;
use crate::config::{Codec, Compression, HttpVersion, Protocol, StreamType};
use crate::service::{ConformancePayload, Error, Header, RawHttpRequest};

/// One test directive for the client.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientCompatRequest {
    pub test_name: String,
    pub http_version: HttpVersion,
    pub protocol: Protocol,
    pub codec: Codec,
    pub compression: Compression,
    pub host: String,
    pub port: u32,
    /// PEM-encoded certificate the server presents. Empty means plain-text.
    #[serde(with = "crate::bytes_serde")]
    pub server_tls_cert: Vec<u8>,
    pub client_tls_creds: Option<TlsCreds>,
    pub message_receive_limit: u32,
    pub service: String,
    pub method: String,
    pub stream_type: StreamType,
    pub use_get_http_method: bool,
    pub request_headers: Vec<Header>,
    pub request_messages: Vec<Any>,
    pub timeout_ms: Option<u32>,
    pub request_delay_ms: u32,
    pub cancel: Option<Cancel>,
    pub raw_request: Option<RawHttpRequest>,
}

/// PEM-encoded client certificate and key.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TlsCreds {
    #[serde(with = "crate::bytes_serde")]
    pub cert: Vec<u8>,
    #[serde(with = "crate::bytes_serde")]
    pub key: Vec<u8>,
}

/// When the client cancels the RPC.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Cancel {
    pub cancel_timing: Option<CancelTiming>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CancelTiming {
    BeforeCloseSend,
    AfterCloseSendMs(u32),
    AfterNumResponses(u32),
}

/// The outcome of one directive.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCompatResponse {
    pub test_name: String,
    pub result: ClientCompatResult,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientCompatResult {
    /// The RPC ran; what was observed.
    Response(ClientResponseResult),
    /// The RPC could not be attempted.
    Error(ClientErrorResult),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientResponseResult {
    pub response_headers: Vec<Header>,
    pub payloads: Vec<ConformancePayload>,
    pub error: Option<Error>,
    pub response_trailers: Vec<Header>,
    pub num_unsent_requests: i32,
    /// Only set in reference mode.
    pub http_status_code: Option<i32>,
    /// Only set in reference mode.
    pub feedback: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientErrorResult {
    pub message: String,
}

/// Server configuration, sent once on startup.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerCompatRequest {
    pub protocol: Protocol,
    pub http_version: HttpVersion,
    pub use_tls: bool,
    /// PEM certificate clients must present. Empty means no client certs.
    #[serde(with = "crate::bytes_serde")]
    pub client_tls_cert: Vec<u8>,
    pub message_receive_limit: u32,
}

/// Where the server ended up listening.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerCompatResponse {
    pub host: String,
    pub port: u32,
    #[serde(with = "crate::bytes_serde")]
    pub pem_cert: Vec<u8>,
}
