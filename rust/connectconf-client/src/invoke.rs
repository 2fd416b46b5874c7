//! Runs one directive against the server under test.

use std::sync::Arc;
use std::time::Duration;

use http::{HeaderMap, HeaderValue};
use tokio_util::sync::CancellationToken;

use connectconf_proto::any::UnpackError;
use connectconf_proto::{
    Any, BidiStreamRequest, BidiStreamResponse, CONFORMANCE_SERVICE, CancelTiming,
    ClientCompatRequest, ClientResponseResult, ClientStreamRequest, ClientStreamResponse, Codec,
    ConformancePayload, Error, IdempotentUnaryRequest, IdempotentUnaryResponse, Message, Protocol,
    ServerStreamRequest, ServerStreamResponse, StreamType, UnaryRequest, UnaryResponse,
    UnimplementedRequest, UnimplementedResponse,
};
use connectconf_rpc::{CallOptions, Client, ClientConfig, ClientStream, RpcError, procedure};
use connectconf_tracer::TraceRegistry;
use connectconf_wire::headers::{HeaderError, TEST_CASE_NAME, add_headers, to_proto_headers};
use connectconf_wire::{FeedbackPrinter, RoundTrip};

use crate::raw_request::RawRequestSender;
use crate::transports::{TransportError, Transports};
use crate::wire_details::{self, WireCapture};

/// A directive that cannot be run. It becomes an error result for that
/// test case only.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("a protocol must be specified")]
    NoProtocol,

    #[error("a codec must be specified")]
    NoCodec,

    #[error("codec {0} is not supported")]
    UnsupportedCodec(&'static str),

    #[error("service name {0} is not a valid service")]
    UnknownService(String),

    #[error("method name {0} does not exist")]
    UnknownMethod(String),

    #[error("unary calls must specify exactly one request message")]
    UnaryMessageCount,

    #[error("server streaming calls must specify exactly one request message")]
    ServerStreamMessageCount,

    #[error("invalid request message: {0}")]
    Unpack(#[from] UnpackError),

    #[error("invalid request headers: {0}")]
    Header(#[from] HeaderError),

    #[error("invalid url: {0}")]
    Url(String),
}

/// Response messages that carry a payload back to the client.
trait Payload {
    fn into_payload(self) -> Option<ConformancePayload>;
}

macro_rules! impl_payload {
    ($($ty:ty),* $(,)?) => {
        $(impl Payload for $ty {
            fn into_payload(self) -> Option<ConformancePayload> {
                self.payload
            }
        })*
    };
}

impl_payload!(
    UnaryResponse,
    IdempotentUnaryResponse,
    ServerStreamResponse,
    ClientStreamResponse,
    BidiStreamResponse,
);

impl Payload for UnimplementedResponse {
    fn into_payload(self) -> Option<ConformancePayload> {
        None
    }
}

/// Runs directives, sharing transports and the trace registry between them.
pub struct Invoker {
    transports: Transports,
    registry: Arc<TraceRegistry>,
    reference_mode: bool,
}

impl Invoker {
    /// In reference mode, results carry the HTTP status code and feedback
    /// about what was seen on the wire.
    pub fn new(reference_mode: bool) -> Self {
        Invoker {
            transports: Transports::new(),
            registry: Arc::new(TraceRegistry::new()),
            reference_mode,
        }
    }

    pub async fn invoke(&self, req: &ClientCompatRequest) -> Result<ClientResponseResult, SetupError> {
        let transport = self.transports.get(req)?;
        self.invoke_with(req, transport).await
    }

    /// Run `req` over the given transport instead of a cached one.
    pub async fn invoke_with(
        &self,
        req: &ClientCompatRequest,
        transport: Arc<dyn RoundTrip>,
    ) -> Result<ClientResponseResult, SetupError> {
        if req.protocol == Protocol::Unspecified {
            return Err(SetupError::NoProtocol);
        }
        match req.codec {
            Codec::Proto | Codec::Json => {}
            Codec::Text => return Err(SetupError::UnsupportedCodec(req.codec.name())),
            Codec::Unspecified => return Err(SetupError::NoCodec),
        }
        if req.service != CONFORMANCE_SERVICE {
            return Err(SetupError::UnknownService(req.service.clone()));
        }
        let base_uri = base_uri(req)?;

        let capture = Arc::new(WireCapture::new(transport, self.registry.clone(), &req.test_name));
        let mut round_trip: Arc<dyn RoundTrip> = capture.clone();
        if let Some(raw) = &req.raw_request {
            round_trip = Arc::new(RawRequestSender::new(round_trip, raw.clone()));
        }
        let client = Client::new(
            round_trip,
            ClientConfig {
                protocol: req.protocol,
                codec: req.codec,
                compression: req.compression,
                base_uri,
                read_max_bytes: req.message_receive_limit,
                use_get: req.use_get_http_method,
            },
        );

        let mut headers = HeaderMap::new();
        add_headers(&req.request_headers, &mut headers)?;
        if !headers.contains_key(TEST_CASE_NAME)
            && let Ok(name) = HeaderValue::from_str(&req.test_name)
        {
            headers.insert(TEST_CASE_NAME, name);
        }
        let call = Call {
            client: &client,
            req,
            headers,
            cancel: CancellationToken::new(),
        };

        let mut result = match req.method.as_str() {
            "Unary" => {
                let msg: UnaryRequest = single(req, SetupError::UnaryMessageCount)?;
                call.unary::<_, UnaryResponse>("Unary", &msg, false).await
            }
            "IdempotentUnary" => {
                let msg: IdempotentUnaryRequest = single(req, SetupError::UnaryMessageCount)?;
                call.unary::<_, IdempotentUnaryResponse>("IdempotentUnary", &msg, true)
                    .await
            }
            "Unimplemented" => {
                let msg: UnimplementedRequest = single(req, SetupError::UnaryMessageCount)?;
                call.unary::<_, UnimplementedResponse>("Unimplemented", &msg, false)
                    .await
            }
            "ServerStream" => {
                let msg: ServerStreamRequest = single(req, SetupError::ServerStreamMessageCount)?;
                call.server_stream(&msg).await
            }
            "ClientStream" => call.client_stream(&unpack_all(req)?).await,
            "BidiStream" => call.bidi_stream(&unpack_all(req)?).await,
            other => return Err(SetupError::UnknownMethod(other.to_string())),
        };

        if self.reference_mode {
            let feedback = FeedbackPrinter::new();
            let trace = capture.await_trace().await;
            let status = wire_details::examine(trace.as_ref(), &capture.error_body(), &feedback);
            if let Some(trace) = &trace
                && let Some((expected, delay_ms)) = expected_delivery(req)
            {
                wire_details::examine_stream_delivery(trace, expected, delay_ms, &feedback);
            }
            wire_details::check_binary_metadata("response headers", &result.response_headers, &feedback);
            wire_details::check_binary_metadata("response trailers", &result.response_trailers, &feedback);
            result.http_status_code = status.map(|s| i32::from(s.as_u16()));
            result.feedback = feedback.take();
        }
        Ok(result)
    }
}

fn base_uri(req: &ClientCompatRequest) -> Result<String, SetupError> {
    let scheme = if req.server_tls_cert.is_empty() {
        "http"
    } else {
        "https"
    };
    let host = if req.host.contains(':') && !req.host.starts_with('[') {
        format!("[{}]", req.host)
    } else {
        req.host.clone()
    };
    let uri = format!("{scheme}://{host}:{}", req.port);
    if req.host.is_empty() || uri.parse::<http::Uri>().is_err() {
        return Err(SetupError::Url(uri));
    }
    Ok(uri)
}

fn single<M: Message>(req: &ClientCompatRequest, count_err: SetupError) -> Result<M, SetupError> {
    match req.request_messages.as_slice() {
        [msg] => Ok(msg.unpack()?),
        _ => Err(count_err),
    }
}

fn unpack_all<M: Message>(req: &ClientCompatRequest) -> Result<Vec<M>, SetupError> {
    req.request_messages
        .iter()
        .map(|msg| msg.unpack().map_err(SetupError::from))
        .collect()
}

/// Message count and delay the server was asked to stream with.
fn expected_delivery(req: &ClientCompatRequest) -> Option<(usize, u32)> {
    let first: &Any = req.request_messages.first()?;
    let def = match req.method.as_str() {
        "ServerStream" => first.unpack::<ServerStreamRequest>().ok()?.response_definition,
        "BidiStream" => first.unpack::<BidiStreamRequest>().ok()?.response_definition,
        _ => None,
    }?;
    Some((def.response_data.len(), def.response_delay_ms))
}

fn cancel_timing(req: &ClientCompatRequest) -> Option<CancelTiming> {
    let cancel = req.cancel.as_ref()?;
    // no timing means cancel right after closing the send side
    Some(
        cancel
            .cancel_timing
            .clone()
            .unwrap_or(CancelTiming::AfterCloseSendMs(0)),
    )
}

/// Requests that never went out, saturating at `i32::MAX`.
fn unsent(total: usize, sent: usize) -> i32 {
    i32::try_from(total.saturating_sub(sent)).unwrap_or(i32::MAX)
}

fn cancel_after(token: &CancellationToken, ms: u32) {
    if ms == 0 {
        token.cancel();
        return;
    }
    let token = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(u64::from(ms))).await;
        token.cancel();
    });
}

fn proto_error(err: &RpcError) -> Error {
    Error {
        code: err.code,
        message: (!err.message.is_empty()).then(|| err.message.clone()),
        details: err.details.clone(),
    }
}

fn error_result(err: &RpcError) -> ClientResponseResult {
    ClientResponseResult {
        response_headers: to_proto_headers(&err.headers),
        response_trailers: to_proto_headers(&err.trailers),
        error: Some(proto_error(err)),
        ..Default::default()
    }
}

// ============================================================================
// Calls
// ============================================================================

struct Call<'a> {
    client: &'a Client,
    req: &'a ClientCompatRequest,
    headers: HeaderMap,
    cancel: CancellationToken,
}

impl Call<'_> {
    fn options(&self, idempotent: bool) -> CallOptions {
        CallOptions {
            headers: self.headers.clone(),
            timeout: self
                .req
                .timeout_ms
                .map(|ms| Duration::from_millis(u64::from(ms))),
            cancel: self.cancel.clone(),
            idempotent,
        }
    }

    fn procedure(&self, method: &str) -> String {
        procedure(&self.req.service, method)
    }

    fn request_delay(&self) -> Option<Duration> {
        (self.req.request_delay_ms > 0)
            .then(|| Duration::from_millis(u64::from(self.req.request_delay_ms)))
    }

    async fn unary<Req: Message, Resp: Message + Payload>(
        &self,
        method: &str,
        msg: &Req,
        idempotent: bool,
    ) -> ClientResponseResult {
        match cancel_timing(self.req) {
            Some(CancelTiming::BeforeCloseSend) => self.cancel.cancel(),
            Some(CancelTiming::AfterCloseSendMs(ms)) => cancel_after(&self.cancel, ms),
            Some(CancelTiming::AfterNumResponses(_)) | None => {}
        }
        let opts = self.options(idempotent);
        match self.client.unary::<Req, Resp>(&self.procedure(method), msg, opts).await {
            Ok(resp) => ClientResponseResult {
                response_headers: to_proto_headers(&resp.headers),
                response_trailers: to_proto_headers(&resp.trailers),
                payloads: resp.message.into_payload().into_iter().collect(),
                ..Default::default()
            },
            Err(err) => error_result(&err),
        }
    }

    async fn server_stream(&self, msg: &ServerStreamRequest) -> ClientResponseResult {
        let mut stream = match self.client.stream::<ServerStreamRequest, ServerStreamResponse>(
            &self.procedure("ServerStream"),
            StreamType::ServerStream,
            self.options(false),
        ) {
            Ok(stream) => stream,
            Err(err) => return error_result(&err),
        };
        // a closed request body shows up as the real error on receive
        let _ = stream.send(msg);
        let timing = cancel_timing(self.req);
        if let Some(CancelTiming::BeforeCloseSend) = timing {
            stream.cancel();
        }
        stream.close_send();
        if let Some(CancelTiming::AfterCloseSendMs(ms)) = timing {
            cancel_after(&self.cancel, ms);
        }
        let cancel_after_responses = match timing {
            Some(CancelTiming::AfterNumResponses(n)) => Some(n as usize),
            _ => None,
        };
        let mut result = ClientResponseResult::default();
        receive_all(&mut stream, &mut result, cancel_after_responses).await;
        result
    }

    async fn client_stream(&self, msgs: &[ClientStreamRequest]) -> ClientResponseResult {
        let mut stream = match self.client.stream::<ClientStreamRequest, ClientStreamResponse>(
            &self.procedure("ClientStream"),
            StreamType::ClientStream,
            self.options(false),
        ) {
            Ok(stream) => stream,
            Err(err) => return error_result(&err),
        };
        let mut sent = 0;
        for msg in msgs {
            if let Some(delay) = self.request_delay() {
                tokio::time::sleep(delay).await;
            }
            if stream.send(msg).is_err() {
                break;
            }
            sent += 1;
        }
        let timing = cancel_timing(self.req);
        if let Some(CancelTiming::BeforeCloseSend) = timing {
            stream.cancel();
        }
        stream.close_send();
        if let Some(CancelTiming::AfterCloseSendMs(ms)) = timing {
            cancel_after(&self.cancel, ms);
        }
        let mut result = ClientResponseResult::default();
        receive_all(&mut stream, &mut result, None).await;
        result.num_unsent_requests = unsent(msgs.len(), sent);
        result
    }

    async fn bidi_stream(&self, msgs: &[BidiStreamRequest]) -> ClientResponseResult {
        let full_duplex = msgs.first().is_some_and(|msg| msg.full_duplex);
        let stream_type = if full_duplex {
            StreamType::FullDuplexBidiStream
        } else {
            StreamType::HalfDuplexBidiStream
        };
        let mut stream = match self.client.stream::<BidiStreamRequest, BidiStreamResponse>(
            &self.procedure("BidiStream"),
            stream_type,
            self.options(false),
        ) {
            Ok(stream) => stream,
            Err(err) => return error_result(&err),
        };
        let timing = cancel_timing(self.req);
        let cancel_after_responses = match timing {
            Some(CancelTiming::AfterNumResponses(n)) => Some(n as usize),
            _ => None,
        };
        let mut result = ClientResponseResult::default();
        let mut sent = 0;

        for msg in msgs {
            if let Some(delay) = self.request_delay() {
                tokio::time::sleep(delay).await;
            }
            if stream.send(msg).is_err() {
                // receive surfaces the actual error
                break;
            }
            sent += 1;
            if full_duplex {
                if cancel_after_responses == Some(result.payloads.len()) {
                    stream.cancel();
                }
                match stream.receive().await {
                    Ok(Some(resp)) => result.payloads.extend(resp.into_payload()),
                    Ok(None) => break,
                    Err(err) => {
                        fill_error(&stream, &mut result, &err);
                        break;
                    }
                }
            }
        }

        if result.error.is_none() {
            if let Some(CancelTiming::BeforeCloseSend) = timing {
                stream.cancel();
            }
            stream.close_send();
            if let Some(CancelTiming::AfterCloseSendMs(ms)) = timing {
                cancel_after(&self.cancel, ms);
            }
            receive_all(&mut stream, &mut result, cancel_after_responses).await;
        }
        result.num_unsent_requests = unsent(msgs.len(), sent);
        result
    }
}

/// Read responses until the stream ends, recording payloads, metadata and
/// the final error. With `cancel_after`, the call is canceled once that many
/// responses have arrived.
async fn receive_all<Req, Resp>(
    stream: &mut ClientStream<Req, Resp>,
    result: &mut ClientResponseResult,
    cancel_after: Option<usize>,
) where
    Req: Message,
    Resp: Message + Payload,
{
    loop {
        if cancel_after == Some(result.payloads.len()) {
            stream.cancel();
        }
        match stream.receive().await {
            Ok(Some(resp)) => result.payloads.extend(resp.into_payload()),
            Ok(None) => break,
            Err(err) => {
                fill_error(stream, result, &err);
                return;
            }
        }
    }
    result.response_headers = to_proto_headers(stream.response_headers());
    result.response_trailers = to_proto_headers(stream.response_trailers());
}

fn fill_error<Req, Resp>(stream: &ClientStream<Req, Resp>, result: &mut ClientResponseResult, err: &RpcError)
where
    Req: Message,
    Resp: Message,
{
    let headers = if err.headers.is_empty() {
        stream.response_headers()
    } else {
        &err.headers
    };
    let trailers = if err.trailers.is_empty() {
        stream.response_trailers()
    } else {
        &err.trailers
    };
    result.response_headers = to_proto_headers(headers);
    result.response_trailers = to_proto_headers(trailers);
    result.error = Some(proto_error(err));
}

#[cfg(test)]
mod tests {
    use super::*;
    use connectconf_proto::{
        Cancel, Code, Compression, HttpVersion, StreamResponseDefinition, UnaryResponseDefinition,
    };
    use connectconf_rpc::ServerCall;
    use connectconf_wire::http::{Body, Handler, ResponseFuture, ResponseWriter, dispatch};
    use futures_util::future::BoxFuture;
    use http::{Request, Version};

    #[test]
    fn unsent_count_saturates() {
        assert_eq!(unsent(5, 2), 3);
        assert_eq!(unsent(2, 2), 0);
        assert_eq!(unsent(usize::MAX, 0), i32::MAX);
    }

    /// Answers the conformance methods with minimal payloads.
    struct Service;

    impl Handler for Service {
        fn serve<'a>(&'a self, req: Request<Body>, w: &'a mut dyn ResponseWriter) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                let Ok(mut call) = ServerCall::new(req, w, 0) else {
                    return;
                };
                let method = call.procedure().rsplit('/').next().unwrap_or_default().to_string();
                let result = match method.as_str() {
                    "Unary" => unary(&mut call).await,
                    "ClientStream" => client_stream(&mut call).await,
                    "ServerStream" => server_stream(&mut call).await,
                    "BidiStream" => bidi(&mut call).await,
                    other => Err(RpcError::new(Code::Unimplemented, format!("{other} is not implemented"))),
                };
                call.finish(result);
            })
        }
    }

    fn payload(data: &[u8]) -> Option<ConformancePayload> {
        Some(ConformancePayload {
            data: data.to_vec(),
            request_info: None,
        })
    }

    async fn unary(call: &mut ServerCall<'_>) -> Result<(), RpcError> {
        let req: UnaryRequest = call
            .receive()
            .await?
            .ok_or_else(|| RpcError::internal("missing request"))?;
        call.send(&UnaryResponse {
            payload: payload(&req.request_data),
        })
    }

    async fn client_stream(call: &mut ServerCall<'_>) -> Result<(), RpcError> {
        let mut data = Vec::new();
        while let Some(req) = call.receive::<ClientStreamRequest>().await? {
            data.extend(req.request_data);
        }
        call.send(&ClientStreamResponse {
            payload: payload(&data),
        })
    }

    async fn server_stream(call: &mut ServerCall<'_>) -> Result<(), RpcError> {
        let req: ServerStreamRequest = call
            .receive()
            .await?
            .ok_or_else(|| RpcError::internal("missing request"))?;
        let def = req.response_definition.unwrap_or_default();
        for data in &def.response_data {
            call.send(&ServerStreamResponse {
                payload: payload(data),
            })?;
        }
        match def.error {
            Some(err) => Err(RpcError::new(err.code, err.message.unwrap_or_default())),
            None => Ok(()),
        }
    }

    async fn bidi(call: &mut ServerCall<'_>) -> Result<(), RpcError> {
        while let Some(req) = call.receive::<BidiStreamRequest>().await? {
            call.send(&BidiStreamResponse {
                payload: payload(&req.request_data),
            })?;
        }
        Ok(())
    }

    struct Loopback(Arc<dyn Handler>);

    impl RoundTrip for Loopback {
        fn round_trip(&self, mut req: Request<Body>) -> ResponseFuture {
            *req.version_mut() = Version::HTTP_2;
            let handler = self.0.clone();
            Box::pin(async move { Ok(dispatch(handler, req).await) })
        }
    }

    fn loopback() -> Arc<dyn RoundTrip> {
        Arc::new(Loopback(Arc::new(Service)))
    }

    fn directive(name: &str, method: &str, messages: Vec<Any>) -> ClientCompatRequest {
        ClientCompatRequest {
            test_name: name.to_string(),
            http_version: HttpVersion::Http2,
            protocol: Protocol::Connect,
            codec: Codec::Proto,
            compression: Compression::Identity,
            host: "127.0.0.1".into(),
            port: 8080,
            service: CONFORMANCE_SERVICE.into(),
            method: method.into(),
            request_messages: messages,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn unary_round_trip_with_feedback() {
        let invoker = Invoker::new(true);
        let msg = Any::pack(&UnaryRequest {
            response_definition: Some(UnaryResponseDefinition::default()),
            request_data: b"hello".to_vec(),
        })
        .unwrap();
        let req = directive("unary", "Unary", vec![msg]);
        let result = invoker.invoke_with(&req, loopback()).await.unwrap();
        assert!(result.error.is_none(), "{result:?}");
        assert_eq!(result.payloads.len(), 1);
        assert_eq!(result.payloads[0].data, b"hello");
        assert_eq!(result.http_status_code, Some(200));
        assert!(result.feedback.is_empty(), "{:?}", result.feedback);
    }

    #[tokio::test]
    async fn unary_needs_exactly_one_message() {
        let invoker = Invoker::new(false);
        let req = directive("none", "Unary", vec![]);
        let err = invoker.invoke_with(&req, loopback()).await.unwrap_err();
        assert_eq!(err.to_string(), "unary calls must specify exactly one request message");
    }

    #[tokio::test]
    async fn unknown_service_and_method() {
        let invoker = Invoker::new(false);
        let mut req = directive("svc", "Unary", vec![]);
        req.service = "foo.Bar".into();
        let err = invoker.invoke_with(&req, loopback()).await.unwrap_err();
        assert_eq!(err.to_string(), "service name foo.Bar is not a valid service");

        let req = directive("method", "Nope", vec![]);
        let err = invoker.invoke_with(&req, loopback()).await.unwrap_err();
        assert_eq!(err.to_string(), "method name Nope does not exist");
    }

    #[tokio::test]
    async fn server_stream_error_keeps_payloads() {
        let invoker = Invoker::new(false);
        let msg = Any::pack(&ServerStreamRequest {
            response_definition: Some(StreamResponseDefinition {
                response_data: vec![b"a".to_vec(), b"b".to_vec()],
                error: Some(Error {
                    code: Code::Aborted,
                    message: Some("stop".into()),
                    details: vec![],
                }),
                ..Default::default()
            }),
            request_data: vec![],
        })
        .unwrap();
        let mut req = directive("ss", "ServerStream", vec![msg]);
        req.protocol = Protocol::Grpc;
        let result = invoker.invoke_with(&req, loopback()).await.unwrap();
        assert_eq!(result.payloads.len(), 2);
        let err = result.error.unwrap();
        assert_eq!(err.code, Code::Aborted);
        assert_eq!(err.message.as_deref(), Some("stop"));
        assert_eq!(result.http_status_code, None);
        assert!(result.feedback.is_empty());
    }

    #[tokio::test]
    async fn client_stream_canceled_before_close_send() {
        let invoker = Invoker::new(false);
        let msgs = (0..3u8)
            .map(|i| {
                Any::pack(&ClientStreamRequest {
                    response_definition: None,
                    request_data: vec![i],
                })
                .unwrap()
            })
            .collect();
        let mut req = directive("cancel", "ClientStream", msgs);
        req.request_delay_ms = 10;
        req.cancel = Some(Cancel {
            cancel_timing: Some(CancelTiming::BeforeCloseSend),
        });
        let result = invoker.invoke_with(&req, loopback()).await.unwrap();
        assert_eq!(result.error.unwrap().code, Code::Canceled);
        assert!((0..=3).contains(&result.num_unsent_requests));
    }

    #[tokio::test]
    async fn half_duplex_bidi_sends_then_receives() {
        let invoker = Invoker::new(false);
        let msgs = (0..3u8)
            .map(|i| {
                Any::pack(&BidiStreamRequest {
                    response_definition: None,
                    full_duplex: false,
                    request_data: vec![i],
                })
                .unwrap()
            })
            .collect();
        let req = directive("bidi", "BidiStream", msgs);
        let result = invoker.invoke_with(&req, loopback()).await.unwrap();
        assert!(result.error.is_none(), "{result:?}");
        let data: Vec<_> = result.payloads.iter().map(|p| p.data.clone()).collect();
        assert_eq!(data, [vec![0], vec![1], vec![2]]);
        assert_eq!(result.num_unsent_requests, 0);
    }

    #[tokio::test]
    async fn full_duplex_bidi_cancel_after_responses() {
        let invoker = Invoker::new(false);
        let msgs = (0..3u8)
            .map(|i| {
                Any::pack(&BidiStreamRequest {
                    response_definition: None,
                    full_duplex: true,
                    request_data: vec![i],
                })
                .unwrap()
            })
            .collect();
        let mut req = directive("fdx", "BidiStream", msgs);
        req.cancel = Some(Cancel {
            cancel_timing: Some(CancelTiming::AfterNumResponses(1)),
        });
        let result = invoker.invoke_with(&req, loopback()).await.unwrap();
        assert_eq!(result.payloads.len(), 1);
        assert_eq!(result.error.unwrap().code, Code::Canceled);
    }

    #[tokio::test]
    async fn setup_errors() {
        let invoker = Invoker::new(false);
        let mut req = directive("h3", "Unary", vec![]);
        req.http_version = HttpVersion::Http3;
        let err = invoker.invoke(&req).await.unwrap_err();
        assert_eq!(err.to_string(), "HTTP/3 indicated in request but no TLS info provided");

        let mut req = directive("nov", "Unary", vec![]);
        req.http_version = HttpVersion::Unspecified;
        let err = invoker.invoke(&req).await.unwrap_err();
        assert_eq!(err.to_string(), "an HTTP version must be specified");

        let mut req = directive("codec", "Unary", vec![]);
        req.codec = Codec::Unspecified;
        let err = invoker.invoke_with(&req, loopback()).await.unwrap_err();
        assert_eq!(err.to_string(), "a codec must be specified");
    }
}
