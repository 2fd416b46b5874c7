//! Client side of the three protocols over a [`RoundTrip`].
//!
//! Connect unary calls (and Connect GET) go through [`Client::unary`], which
//! sends and reads whole bodies. Everything else is a [`ClientStream`]: the
//! request body is a channel fed by [`ClientStream::send`], and the response
//! is read envelope by envelope in [`ClientStream::receive`].

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use http::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use http::{Method, Request, Response, StatusCode, Uri, Version};
use http_body_util::BodyExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use connectconf_proto::{Codec, Code, Compression, Protocol, StreamType};
use connectconf_wire::codec::{decode_message, encode_message};
use connectconf_wire::compression::{compress, decompress, from_header};
use connectconf_wire::envelope::{
    self, FLAG_COMPRESSED, FLAG_CONNECT_END_STREAM, FLAG_GRPC_WEB_TRAILERS, Frame, FrameBuffer,
};
use connectconf_wire::headers::header_str;
use connectconf_wire::http::{
    Body, BodySender, BoxError, RoundTrip, body_channel, box_body, empty_body, full_body,
};

use crate::error::{
    BASE64_URL, RpcError, code_from_http_status, parse_connect_end_stream, parse_connect_error,
    parse_grpc_status, parse_grpc_web_trailers,
};
use crate::protocol::{
    CONNECT_PROTOCOL_VERSION, CONNECT_UNARY_TRAILER_PREFIX, Wire, X_GRPC_WEB, encode_timeout,
};

/// Encodings advertised in accept headers.
pub const ACCEPTED_ENCODINGS: &str = "gzip, br, zstd, deflate, snappy";

const USER_AGENT_VALUE: &str = concat!("connectconf-rpc/", env!("CARGO_PKG_VERSION"));

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub protocol: Protocol,
    pub codec: Codec,
    /// Compression of request messages.
    pub compression: Compression,
    /// Scheme and authority the procedure path is appended to.
    pub base_uri: String,
    /// Largest response message accepted, after decompression. 0 means no limit.
    pub read_max_bytes: u32,
    /// Send idempotent Connect unary calls as GET requests.
    pub use_get: bool,
}

/// Per-call settings.
#[derive(Clone, Debug, Default)]
pub struct CallOptions {
    pub headers: HeaderMap,
    pub timeout: Option<Duration>,
    /// Firing this cancels the call.
    pub cancel: CancellationToken,
    /// The procedure has no side effects, so Connect may use GET.
    pub idempotent: bool,
}

// ============================================================================
// Call context
// ============================================================================

/// Cancellation and deadline of one call.
///
/// The token is a child of the caller's; it is also fired when the deadline
/// passes, and it rides along in the request extensions so the transport and
/// the tracer see the cancellation.
#[derive(Clone, Debug)]
pub struct CallContext {
    inner: Arc<ContextInner>,
}

#[derive(Debug)]
struct ContextInner {
    token: CancellationToken,
    deadline: Option<Instant>,
    timer: Option<JoinHandle<()>>,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl CallContext {
    pub fn new(parent: &CancellationToken, timeout: Option<Duration>) -> Self {
        let token = parent.child_token();
        let deadline = timeout.map(|t| Instant::now() + t);
        let timer = deadline.map(|deadline| {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => token.cancel(),
                    _ = token.cancelled() => {}
                }
            })
        });
        CallContext {
            inner: Arc::new(ContextInner {
                token,
                deadline,
                timer,
            }),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    /// Resolves once the call is canceled or past its deadline.
    pub async fn done(&self) {
        self.inner.token.cancelled().await
    }

    /// Why the call is done, if it is.
    pub fn err(&self) -> Option<RpcError> {
        if let Some(deadline) = self.inner.deadline
            && Instant::now() >= deadline
        {
            return Some(RpcError::deadline_exceeded());
        }
        self.inner
            .token
            .is_cancelled()
            .then(RpcError::canceled)
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

// ============================================================================
// Client
// ============================================================================

/// A successful unary call.
#[derive(Debug)]
pub struct UnaryResponse<T> {
    pub message: T,
    pub headers: HeaderMap,
    pub trailers: HeaderMap,
}

#[derive(Clone)]
pub struct Client {
    transport: Arc<dyn RoundTrip>,
    config: ClientConfig,
}

impl Client {
    pub fn new(transport: Arc<dyn RoundTrip>, config: ClientConfig) -> Self {
        Client { transport, config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn wire(&self, streaming: bool) -> Wire {
        Wire::new(self.config.protocol, self.config.codec, streaming)
    }

    fn uri(&self, procedure: &str, query: Option<&str>) -> Result<Uri, RpcError> {
        let base = self.config.base_uri.trim_end_matches('/');
        let uri = match query {
            Some(q) => format!("{base}{procedure}?{q}"),
            None => format!("{base}{procedure}"),
        };
        uri.parse()
            .map_err(|err| RpcError::new(Code::Internal, format!("invalid URI {uri:?}: {err}")))
    }

    fn request(
        &self,
        method: Method,
        uri: Uri,
        wire: Wire,
        ctx: &CallContext,
        opts: &CallOptions,
        body: Body,
    ) -> Request<Body> {
        let mut req = Request::new(body);
        *req.method_mut() = method.clone();
        *req.uri_mut() = uri;
        let headers = req.headers_mut();
        headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));
        if method != Method::GET
            && let Ok(ct) = HeaderValue::from_str(&wire.content_type())
        {
            headers.insert(CONTENT_TYPE, ct);
        }
        match wire.protocol {
            Protocol::Grpc => {
                headers.insert(http::header::TE, HeaderValue::from_static("trailers"));
            }
            Protocol::GrpcWeb => {
                headers.insert(X_GRPC_WEB, HeaderValue::from_static("1"));
            }
            _ => {
                if method != Method::GET {
                    headers.insert(CONNECT_PROTOCOL_VERSION, HeaderValue::from_static("1"));
                }
            }
        }
        if let Some(remaining) = ctx.remaining()
            && let Ok(value) = HeaderValue::from_str(&encode_timeout(wire.timeout_header(), remaining))
        {
            headers.insert(wire.timeout_header(), value);
        }
        if !self.config.compression.is_identity() && method != Method::GET {
            headers.insert(
                wire.encoding_header(),
                HeaderValue::from_static(self.config.compression.name()),
            );
        }
        headers.insert(
            wire.accept_encoding_header(),
            HeaderValue::from_static(ACCEPTED_ENCODINGS),
        );
        for (name, value) in &opts.headers {
            headers.append(name.clone(), value.clone());
        }
        req.extensions_mut().insert(ctx.token().clone());
        req
    }

    /// A call with one request and one response message.
    pub async fn unary<Req, Resp>(
        &self,
        procedure: &str,
        msg: &Req,
        opts: CallOptions,
    ) -> Result<UnaryResponse<Resp>, RpcError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        if self.config.protocol == Protocol::Connect {
            return self.connect_unary(procedure, msg, opts).await;
        }
        let mut stream = self.stream::<Req, Resp>(procedure, StreamType::Unary, opts)?;
        // A closed request body surfaces as the real error on receive.
        let _ = stream.send(msg);
        stream.close_send();
        let mut message = None;
        let mut count = 0usize;
        while let Some(resp) = stream.receive().await? {
            count += 1;
            if message.is_none() {
                message = Some(resp);
            }
        }
        let headers = stream.response_headers().clone();
        let trailers = stream.response_trailers().clone();
        let problem = match (message, count) {
            (Some(message), 1) => {
                return Ok(UnaryResponse {
                    message,
                    headers,
                    trailers,
                });
            }
            (None, _) => "unary response has zero messages",
            _ => "unary response has multiple messages",
        };
        Err(RpcError {
            headers,
            trailers,
            ..RpcError::new(Code::Unimplemented, problem)
        })
    }

    async fn connect_unary<Req, Resp>(
        &self,
        procedure: &str,
        msg: &Req,
        opts: CallOptions,
    ) -> Result<UnaryResponse<Resp>, RpcError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let wire = self.wire(false);
        let ctx = CallContext::new(&opts.cancel, opts.timeout);
        let mut payload = encode_message(self.config.codec, msg)?;
        let compressed = !self.config.compression.is_identity();
        if compressed {
            payload = compress(self.config.compression, &payload)?;
        }

        let req = if opts.idempotent && self.config.use_get {
            let query = self.get_query(&payload, compressed);
            let uri = self.uri(procedure, Some(&query))?;
            self.request(Method::GET, uri, wire, &ctx, &opts, empty_body())
        } else {
            let uri = self.uri(procedure, None)?;
            self.request(Method::POST, uri, wire, &ctx, &opts, full_body(payload))
        };

        let resp = tokio::select! {
            resp = self.transport.round_trip(req) => resp.map_err(|err| transport_error(&ctx, &err))?,
            _ = ctx.done() => return Err(ctx.err().unwrap_or_else(RpcError::canceled)),
        };
        let (parts, body) = resp.into_parts();
        let collected = tokio::select! {
            body = body.collect() => body.map_err(|err| transport_error(&ctx, &err))?,
            _ = ctx.done() => return Err(ctx.err().unwrap_or_else(RpcError::canceled)),
        };
        let mut headers = parts.headers;
        let mut trailers = collected.trailers().cloned().unwrap_or_default();
        split_unary_trailers(&mut headers, &mut trailers);
        let mut body = collected.to_bytes().to_vec();

        if let Some(encoding) = header_str(&headers, "content-encoding") {
            let compression = from_header(encoding)?;
            body = decompress(compression, &body, self.config.read_max_bytes as usize)?;
        }

        if parts.status != StatusCode::OK {
            let mut err = parse_connect_error(&body, parts.status);
            err.headers = headers;
            err.trailers = trailers;
            return Err(err);
        }

        let expected = wire.content_type();
        let actual = header_str(&headers, CONTENT_TYPE.as_str()).unwrap_or_default();
        if !actual.eq_ignore_ascii_case(&expected) {
            let err = RpcError::new(
                Code::Internal,
                format!("invalid content-type: {actual:?}; expecting {expected:?}"),
            );
            return Err(RpcError {
                headers,
                trailers,
                ..err
            });
        }
        let max = self.config.read_max_bytes as usize;
        if max > 0 && body.len() > max {
            return Err(RpcError {
                headers,
                trailers,
                ..RpcError::new(
                    Code::ResourceExhausted,
                    format!("message size {} is larger than configured max {max}", body.len()),
                )
            });
        }
        let message = decode_message(self.config.codec, &body)?;
        Ok(UnaryResponse {
            message,
            headers,
            trailers,
        })
    }

    fn get_query(&self, payload: &[u8], compressed: bool) -> String {
        let mut query = format!("connect=v1&encoding={}", self.config.codec.name());
        if self.config.codec == Codec::Json && !compressed {
            query.push_str("&message=");
            query.push_str(&urlencoding::encode_binary(payload));
        } else {
            query.push_str("&base64=1");
            if compressed {
                query.push_str("&compression=");
                query.push_str(self.config.compression.name());
            }
            query.push_str("&message=");
            query.push_str(&BASE64_URL.encode(payload));
        }
        query
    }

    /// Start a streaming call. The request is on the wire once this returns.
    pub fn stream<Req, Resp>(
        &self,
        procedure: &str,
        stream_type: StreamType,
        opts: CallOptions,
    ) -> Result<ClientStream<Req, Resp>, RpcError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let wire = self.wire(true);
        let ctx = CallContext::new(&opts.cancel, opts.timeout);
        let uri = self.uri(procedure, None)?;
        let (sender, body) = body_channel();
        let req = self.request(Method::POST, uri, wire, &ctx, &opts, box_body(body));
        let pending = tokio::spawn(self.transport.round_trip(req));
        Ok(ClientStream {
            wire,
            stream_type,
            ctx,
            compression: self.config.compression,
            read_max_bytes: self.config.read_max_bytes,
            sender: Some(sender),
            pending: Some(pending),
            body: None,
            frames: FrameBuffer::with_max_size(self.config.read_max_bytes),
            response_compression: Compression::Identity,
            headers: HeaderMap::new(),
            trailers: HeaderMap::new(),
            outcome: None,
            _marker: PhantomData,
        })
    }
}

fn transport_error(ctx: &CallContext, err: &BoxError) -> RpcError {
    ctx.err().unwrap_or_else(|| RpcError::from_transport(err))
}

/// Move `trailer-` prefixed headers of a Connect unary response into trailers.
fn split_unary_trailers(headers: &mut HeaderMap, trailers: &mut HeaderMap) {
    let marked: Vec<HeaderName> = headers
        .keys()
        .filter(|name| name.as_str().starts_with(CONNECT_UNARY_TRAILER_PREFIX))
        .cloned()
        .collect();
    for name in marked {
        let stripped = &name.as_str()[CONNECT_UNARY_TRAILER_PREFIX.len()..];
        let Ok(stripped) = HeaderName::from_bytes(stripped.as_bytes()) else {
            continue;
        };
        for value in headers.get_all(&name) {
            trailers.append(stripped.clone(), value.clone());
        }
        headers.remove(&name);
    }
}

// ============================================================================
// Streams
// ============================================================================

/// The request side is closed; the response explains why.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("request stream closed")]
    Closed,
    #[error(transparent)]
    Failed(#[from] RpcError),
}

/// An in-flight call with enveloped request and response bodies.
pub struct ClientStream<Req, Resp> {
    wire: Wire,
    stream_type: StreamType,
    ctx: CallContext,
    compression: Compression,
    read_max_bytes: u32,
    sender: Option<BodySender>,
    pending: Option<JoinHandle<Result<Response<Body>, BoxError>>>,
    body: Option<Body>,
    frames: FrameBuffer,
    response_compression: Compression,
    headers: HeaderMap,
    trailers: HeaderMap,
    /// Set once the response is complete: `Ok` for success, or the error.
    outcome: Option<Result<(), RpcError>>,
    _marker: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> Drop for ClientStream<Req, Resp> {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }
    }
}

enum BodyEvent {
    Data,
    End,
}

impl<Req: Serialize, Resp: DeserializeOwned> ClientStream<Req, Resp> {
    pub fn context(&self) -> &CallContext {
        &self.ctx
    }

    /// Cancel the call.
    pub fn cancel(&self) {
        self.ctx.token().cancel();
    }

    /// Queue one request message.
    pub fn send(&mut self, msg: &Req) -> Result<(), SendError> {
        let Some(sender) = &self.sender else {
            return Err(SendError::Closed);
        };
        if self.ctx.err().is_some() {
            return Err(SendError::Closed);
        }
        let mut payload = encode_message(self.wire.codec, msg).map_err(RpcError::from)?;
        let mut flags = 0;
        if !self.compression.is_identity() {
            payload = compress(self.compression, &payload).map_err(RpcError::from)?;
            flags |= FLAG_COMPRESSED;
        }
        sender
            .send_data(envelope::encode(flags, &payload))
            .map_err(|_| SendError::Closed)
    }

    /// Close the request side.
    pub fn close_send(&mut self) {
        self.sender = None;
    }

    pub fn response_headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn response_trailers(&self) -> &HeaderMap {
        &self.trailers
    }

    /// Next response message, `Ok(None)` at a clean end of stream.
    pub async fn receive(&mut self) -> Result<Option<Resp>, RpcError> {
        loop {
            if let Some(outcome) = &self.outcome {
                return outcome.clone().map(|()| None);
            }
            if let Err(err) = self.ensure_response().await {
                return self.fail(err);
            }
            if self.outcome.is_some() {
                continue;
            }
            match self.frames.next_frame() {
                Ok(Some(frame)) => match self.on_frame(frame) {
                    Ok(Some(msg)) => return Ok(Some(msg)),
                    Ok(None) => continue,
                    Err(err) => return self.fail(err),
                },
                Ok(None) => {}
                Err(err) => return self.fail(err.into()),
            }
            match self.next_body_event().await {
                Ok(BodyEvent::Data) => {}
                Ok(BodyEvent::End) => {
                    let result = self.on_body_end();
                    if let Err(err) = result {
                        return self.fail(err);
                    }
                    self.outcome = Some(Ok(()));
                }
                Err(err) => return self.fail(err),
            }
        }
    }

    fn fail(&mut self, mut err: RpcError) -> Result<Option<Resp>, RpcError> {
        if err.headers.is_empty() {
            err.headers = self.headers.clone();
        }
        if err.trailers.is_empty() {
            err.trailers = self.trailers.clone();
        }
        self.body = None;
        self.sender = None;
        self.outcome = Some(Err(err.clone()));
        Err(err)
    }

    async fn ensure_response(&mut self) -> Result<(), RpcError> {
        let Some(pending) = self.pending.as_mut() else {
            return Ok(());
        };
        // a canceled call reports cancellation even if the response is ready
        let joined = tokio::select! {
            biased;
            _ = self.ctx.done() => {
                return Err(self.ctx.err().unwrap_or_else(RpcError::canceled));
            }
            joined = pending => joined,
        };
        self.pending = None;
        let resp = match joined {
            Ok(Ok(resp)) => resp,
            Ok(Err(err)) => return Err(transport_error(&self.ctx, &err)),
            Err(err) => return Err(RpcError::internal(format!("round trip task failed: {err}"))),
        };
        let (parts, body) = resp.into_parts();
        self.headers = parts.headers;

        let bidi = matches!(
            self.stream_type,
            StreamType::HalfDuplexBidiStream | StreamType::FullDuplexBidiStream
        );
        if bidi && parts.version < Version::HTTP_2 {
            return Err(RpcError::new(
                Code::Unimplemented,
                "HTTP/2 required for bidirectional streaming",
            ));
        }
        if parts.status != StatusCode::OK {
            let message = match self.wire.protocol {
                Protocol::Connect => parts
                    .status
                    .canonical_reason()
                    .unwrap_or_default()
                    .to_string(),
                _ => format!("unexpected HTTP status code {}", parts.status.as_u16()),
            };
            return Err(RpcError {
                wire: true,
                ..RpcError::new(code_from_http_status(parts.status), message)
            });
        }

        // gRPC and gRPC-Web trailers-only responses carry the status in headers.
        if self.wire.protocol != Protocol::Connect && self.headers.contains_key("grpc-status") {
            self.trailers = self.headers.clone();
            return match parse_grpc_status(&self.headers)? {
                None => {
                    self.outcome = Some(Ok(()));
                    Ok(())
                }
                Some(err) => Err(err),
            };
        }

        let expected = self.wire.content_type();
        let actual = header_str(&self.headers, CONTENT_TYPE.as_str()).unwrap_or_default();
        let expected_base = expected.split('+').next().unwrap_or_default();
        if !actual.to_ascii_lowercase().starts_with(expected_base) {
            return Err(RpcError::new(
                Code::Unknown,
                format!("invalid content-type: {actual:?}; expecting {expected:?}"),
            ));
        }
        if let Some(encoding) = header_str(&self.headers, self.wire.encoding_header()) {
            self.response_compression = from_header(encoding)?;
        }
        self.body = Some(body);
        Ok(())
    }

    async fn next_body_event(&mut self) -> Result<BodyEvent, RpcError> {
        let Some(body) = self.body.as_mut() else {
            return Ok(BodyEvent::End);
        };
        let frame = tokio::select! {
            biased;
            _ = self.ctx.done() => {
                return Err(self.ctx.err().unwrap_or_else(RpcError::canceled));
            }
            frame = body.frame() => frame,
        };
        match frame {
            None => {
                self.body = None;
                Ok(BodyEvent::End)
            }
            Some(Err(err)) => Err(transport_error(&self.ctx, &err)),
            Some(Ok(frame)) => {
                match frame.into_data() {
                    Ok(data) => self.frames.push(&data),
                    Err(frame) => {
                        if let Ok(trailers) = frame.into_trailers() {
                            self.trailers.extend(trailers);
                        }
                    }
                }
                Ok(BodyEvent::Data)
            }
        }
    }

    fn payload(&self, frame: &Frame) -> Result<Vec<u8>, RpcError> {
        if frame.flags & FLAG_COMPRESSED == 0 {
            return Ok(frame.payload.to_vec());
        }
        if self.response_compression.is_identity() {
            return Err(RpcError::internal(
                "protocol error: received compressed message without encoding",
            ));
        }
        Ok(decompress(
            self.response_compression,
            &frame.payload,
            self.read_max_bytes as usize,
        )?)
    }

    fn on_frame(&mut self, frame: Frame) -> Result<Option<Resp>, RpcError> {
        let payload = self.payload(&frame)?;
        match self.wire.protocol {
            Protocol::Connect if frame.flags & FLAG_CONNECT_END_STREAM != 0 => {
                let (trailers, err) = parse_connect_end_stream(&payload)?;
                self.trailers = trailers;
                self.body = None;
                match err {
                    Some(err) => Err(err),
                    None => {
                        self.outcome = Some(Ok(()));
                        Ok(None)
                    }
                }
            }
            Protocol::GrpcWeb if frame.flags & FLAG_GRPC_WEB_TRAILERS != 0 => {
                self.trailers = parse_grpc_web_trailers(&payload);
                self.body = None;
                match parse_grpc_status(&self.trailers)? {
                    Some(err) => Err(err),
                    None => {
                        self.outcome = Some(Ok(()));
                        Ok(None)
                    }
                }
            }
            _ => Ok(Some(decode_message(self.wire.codec, &payload)?)),
        }
    }

    fn on_body_end(&mut self) -> Result<(), RpcError> {
        self.frames.finish()?;
        match self.wire.protocol {
            Protocol::Connect => Err(RpcError::internal(
                "protocol error: missing end stream message",
            )),
            Protocol::GrpcWeb if self.trailers.is_empty() => {
                Err(RpcError::internal("protocol error: missing trailers"))
            }
            _ => match parse_grpc_status(&self.trailers)? {
                Some(err) => Err(err),
                None => Ok(()),
            },
        }
    }
}
