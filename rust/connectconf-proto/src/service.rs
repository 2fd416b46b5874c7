//! Messages of the conformance service and the raw HTTP overrides.

use serde::{Deserialize, Serialize};

use crate::any::{Any, Message};
use crate::config::{Code, Compression};

/// Name of the conformance service.
pub const CONFORMANCE_SERVICE: &str = "connectrpc.conformance.v1.ConformanceService";

/// A header or trailer with all of its values.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Header {
    pub name: String,
    pub value: Vec<String>,
}

impl Header {
    pub fn new(name: impl Into<String>, values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Header {
            name: name.into(),
            value: values.into_iter().map(Into::into).collect(),
        }
    }
}

/// An RPC error as it is reported in results and requested in directives.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Error {
    pub code: Code,
    pub message: Option<String>,
    pub details: Vec<Any>,
}

/// Definition of the response to a unary-response RPC.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UnaryResponseDefinition {
    pub response_headers: Vec<Header>,
    pub response: Option<UnaryOutcome>,
    pub response_trailers: Vec<Header>,
    pub response_delay_ms: u32,
    pub raw_response: Option<RawHttpResponse>,
}

/// Either the data to echo back or the error to fail with.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UnaryOutcome {
    #[serde(with = "crate::bytes_serde")]
    ResponseData(Vec<u8>),
    Error(Error),
}

/// Definition of the responses to a streaming-response RPC.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StreamResponseDefinition {
    pub response_headers: Vec<Header>,
    #[serde(with = "crate::bytes_serde::vec")]
    pub response_data: Vec<Vec<u8>>,
    pub response_delay_ms: u32,
    pub error: Option<Error>,
    pub response_trailers: Vec<Header>,
    pub raw_response: Option<RawHttpResponse>,
}

macro_rules! conformance_messages {
    ($($name:ident),* $(,)?) => {
        $(
            impl Message for $name {
                const TYPE_NAME: &'static str = concat!("connectrpc.conformance.v1.", stringify!($name));
            }
        )*
    };
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UnaryRequest {
    pub response_definition: Option<UnaryResponseDefinition>,
    #[serde(with = "crate::bytes_serde")]
    pub request_data: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UnaryResponse {
    pub payload: Option<ConformancePayload>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IdempotentUnaryRequest {
    pub response_definition: Option<UnaryResponseDefinition>,
    #[serde(with = "crate::bytes_serde")]
    pub request_data: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IdempotentUnaryResponse {
    pub payload: Option<ConformancePayload>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerStreamRequest {
    pub response_definition: Option<StreamResponseDefinition>,
    #[serde(with = "crate::bytes_serde")]
    pub request_data: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerStreamResponse {
    pub payload: Option<ConformancePayload>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientStreamRequest {
    pub response_definition: Option<UnaryResponseDefinition>,
    #[serde(with = "crate::bytes_serde")]
    pub request_data: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientStreamResponse {
    pub payload: Option<ConformancePayload>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BidiStreamRequest {
    pub response_definition: Option<StreamResponseDefinition>,
    pub full_duplex: bool,
    #[serde(with = "crate::bytes_serde")]
    pub request_data: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BidiStreamResponse {
    pub payload: Option<ConformancePayload>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnimplementedRequest {}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnimplementedResponse {}

conformance_messages!(
    UnaryRequest,
    UnaryResponse,
    IdempotentUnaryRequest,
    IdempotentUnaryResponse,
    ServerStreamRequest,
    ServerStreamResponse,
    ClientStreamRequest,
    ClientStreamResponse,
    BidiStreamRequest,
    BidiStreamResponse,
    UnimplementedRequest,
    UnimplementedResponse,
    RequestInfo,
);

/// The status message carried base64-encoded in `grpc-status-details-bin`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RpcStatus {
    pub code: i32,
    pub message: String,
    pub details: Vec<Any>,
}

impl Message for RpcStatus {
    const TYPE_NAME: &'static str = "google.rpc.Status";
}

/// What the server observed, echoed back to the client.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConformancePayload {
    #[serde(with = "crate::bytes_serde")]
    pub data: Vec<u8>,
    pub request_info: Option<RequestInfo>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RequestInfo {
    pub request_headers: Vec<Header>,
    pub timeout_ms: Option<i64>,
    pub requests: Vec<Any>,
    pub connect_get_info: Option<ConnectGetInfo>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectGetInfo {
    pub query_params: Vec<Header>,
}

/// A request the client sends verbatim instead of the one its RPC layer
/// would build.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawHttpRequest {
    pub verb: String,
    pub uri: String,
    pub headers: Vec<Header>,
    pub raw_query_params: Vec<Header>,
    pub encoded_query_params: Vec<EncodedQueryParam>,
    pub body: Option<RawBody>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EncodedQueryParam {
    pub name: String,
    pub value: MessageContents,
    pub base64_encode: bool,
}

/// Body of a raw request or response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RawBody {
    Unary(MessageContents),
    Stream(StreamContents),
}

/// The bytes of one message, optionally compressed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MessageContents {
    pub data: Option<MessageData>,
    pub compression: Compression,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageData {
    #[serde(with = "crate::bytes_serde")]
    Binary(Vec<u8>),
    Text(String),
    BinaryMessage(Any),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StreamContents {
    pub items: Vec<StreamItem>,
}

/// One envelope of a raw stream body. An explicit `length` is written
/// verbatim, even when it disagrees with the payload.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StreamItem {
    pub flags: u32,
    pub length: Option<u32>,
    pub payload: MessageContents,
}

/// A response the server sends verbatim instead of its natural one.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawHttpResponse {
    pub status_code: u32,
    pub headers: Vec<Header>,
    pub body: Option<RawBody>,
    pub trailers: Vec<Header>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_names() {
        assert_eq!(
            BidiStreamRequest::TYPE_NAME,
            "connectrpc.conformance.v1.BidiStreamRequest"
        );
        assert_eq!(
            UnaryResponse::TYPE_NAME,
            "connectrpc.conformance.v1.UnaryResponse"
        );
    }

    #[test]
    fn raw_response_from_json() {
        let json = r#"{
            "statusCode": 505,
            "headers": [{"name": "content-type", "value": ["foo/bar"]}],
            "body": {"unary": {"data": {"text": "{\"foo\":\"bar\"}"}}},
            "trailers": [{"name": "x", "value": ["123"]}]
        }"#;
        let raw: RawHttpResponse = serde_json::from_str(json).unwrap();
        assert_eq!(raw.status_code, 505);
        assert_eq!(raw.headers[0], Header::new("content-type", ["foo/bar"]));
        match raw.body {
            Some(RawBody::Unary(MessageContents {
                data: Some(MessageData::Text(ref text)),
                compression: Compression::Unspecified,
            })) => assert_eq!(text, r#"{"foo":"bar"}"#),
            ref other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn stream_definition_survives_postcard() {
        let def = StreamResponseDefinition {
            response_data: vec![b"one".to_vec(), b"two".to_vec()],
            response_delay_ms: 5,
            error: Some(Error {
                code: Code::Aborted,
                message: Some("stop".into()),
                details: vec![],
            }),
            ..Default::default()
        };
        let bytes = postcard::to_allocvec(&def).unwrap();
        let back: StreamResponseDefinition = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(back, def);
    }
}
