//! Server side of the three protocols over a [`ResponseWriter`].

use std::time::Duration;

use base64::Engine as _;
use http::header::{CONTENT_ENCODING, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, TRAILER};
use http::request::Parts;
use http::{Method, Request, StatusCode, Version};
use http_body_util::BodyExt;
use serde::Serialize;
use serde::de::DeserializeOwned;

use connectconf_proto::{Codec, Code, Compression, Protocol};
use connectconf_wire::codec::{decode_message, encode_message};
use connectconf_wire::compression::{compress, decompress, from_header};
use connectconf_wire::envelope::{
    self, FLAG_COMPRESSED, FLAG_CONNECT_END_STREAM, FLAG_GRPC_WEB_TRAILERS, FrameBuffer,
};
use connectconf_wire::headers::{TRAILER_PREFIX, header_str, query_param};
use connectconf_wire::http::{Body, ResponseWriter};

use crate::error::{
    BASE64_URL, GRPC_MESSAGE, GRPC_STATUS, GRPC_STATUS_DETAILS, RpcError, connect_end_stream_json,
    connect_error_json, grpc_status_fields, grpc_web_trailers_block, http_status_from_code,
};
use crate::protocol::{CONNECT_UNARY_TRAILER_PREFIX, Wire, parse_timeout};

const ACCEPT_POST: &str = "application/grpc, application/grpc+proto, application/grpc+json, \
application/grpc-web, application/grpc-web+proto, application/grpc-web+json, \
application/proto, application/json, application/connect+proto, application/connect+json";

/// One incoming call, from request decoding to the final status.
pub struct ServerCall<'a> {
    parts: Parts,
    body: Option<Body>,
    w: &'a mut dyn ResponseWriter,
    wire: Wire,
    /// The message of a Connect GET, taken on the first receive.
    get_message: Option<Vec<u8>>,
    request_compression: Compression,
    read_max_bytes: u32,
    frames: FrameBuffer,
    unary_read: bool,
    unary_response: Option<Vec<u8>>,
    headers_sent: bool,
    /// Headers to send with the response head.
    pub response_headers: HeaderMap,
    /// Trailers to send with the final status.
    pub response_trailers: HeaderMap,
}

impl<'a> ServerCall<'a> {
    /// Work out the protocol of `req`. Requests no protocol claims are
    /// answered with a 415 and an error.
    pub fn new(
        req: Request<Body>,
        w: &'a mut dyn ResponseWriter,
        read_max_bytes: u32,
    ) -> Result<Self, RpcError> {
        let (parts, body) = req.into_parts();
        let detected = if parts.method == Method::GET {
            connect_get(&parts)
        } else {
            header_str(&parts.headers, CONTENT_TYPE.as_str())
                .and_then(Wire::from_content_type)
                .map(|wire| (wire, None, Compression::Identity))
        };
        let Some((wire, get_message, mut request_compression)) = detected else {
            w.headers_mut()
                .insert("accept-post", HeaderValue::from_static(ACCEPT_POST));
            w.write_header(StatusCode::UNSUPPORTED_MEDIA_TYPE);
            return Err(RpcError::new(Code::Unimplemented, "unsupported content type"));
        };
        if get_message.is_none()
            && let Some(name) = header_str(&parts.headers, wire.encoding_header())
        {
            request_compression = from_header(name)?;
        }
        let get_message = match get_message {
            Some(raw) if !request_compression.is_identity() => Some(decompress(
                request_compression,
                &raw,
                read_max_bytes as usize,
            )?),
            other => other,
        };
        Ok(ServerCall {
            parts,
            body: Some(body),
            w,
            wire,
            get_message,
            request_compression,
            read_max_bytes,
            frames: FrameBuffer::with_max_size(read_max_bytes),
            unary_read: false,
            unary_response: None,
            headers_sent: false,
            response_headers: HeaderMap::new(),
            response_trailers: HeaderMap::new(),
        })
    }

    pub fn wire(&self) -> Wire {
        self.wire
    }

    /// The procedure path, e.g. `/pkg.Service/Method`.
    pub fn procedure(&self) -> &str {
        self.parts.uri.path()
    }

    pub fn method(&self) -> &Method {
        &self.parts.method
    }

    pub fn version(&self) -> Version {
        self.parts.version
    }

    pub fn request_headers(&self) -> &HeaderMap {
        &self.parts.headers
    }

    pub fn request_parts(&self) -> &Parts {
        &self.parts
    }

    /// Compression of request messages.
    pub fn request_compression(&self) -> Compression {
        self.request_compression
    }

    /// The query string of a Connect GET.
    pub fn get_query(&self) -> Option<&str> {
        (self.parts.method == Method::GET).then(|| self.parts.uri.query().unwrap_or_default())
    }

    /// Timeout the client asked for.
    pub fn timeout(&self) -> Option<Duration> {
        let header = self.wire.timeout_header();
        header_str(&self.parts.headers, header).and_then(|v| parse_timeout(header, v))
    }

    /// Whether anything has been written to the response yet.
    pub fn has_written(&self) -> bool {
        self.headers_sent
    }

    fn response_compression(&self) -> Compression {
        self.request_compression
    }

    fn too_large(&self, size: usize) -> RpcError {
        RpcError::new(
            Code::ResourceExhausted,
            format!(
                "message size {size} is larger than configured max {}",
                self.read_max_bytes
            ),
        )
    }

    /// Next request message, `Ok(None)` once the request side is done.
    pub async fn receive<T: DeserializeOwned>(&mut self) -> Result<Option<T>, RpcError> {
        if !self.wire.is_enveloped() {
            return self.receive_unary().await;
        }
        loop {
            if let Some(frame) = self.frames.next_frame()? {
                let mut payload = frame.payload.to_vec();
                if frame.flags & FLAG_COMPRESSED != 0 {
                    if self.request_compression.is_identity() {
                        return Err(RpcError::internal(
                            "protocol error: received compressed message without encoding",
                        ));
                    }
                    payload = decompress(
                        self.request_compression,
                        &payload,
                        self.read_max_bytes as usize,
                    )?;
                }
                return Ok(Some(decode_message(self.wire.codec, &payload)?));
            }
            let Some(body) = self.body.as_mut() else {
                self.frames.finish()?;
                return Ok(None);
            };
            match body.frame().await {
                None => self.body = None,
                Some(Err(err)) => {
                    self.body = None;
                    return Err(RpcError::new(Code::Canceled, err.to_string()));
                }
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        self.frames.push(&data);
                    }
                }
            }
        }
    }

    async fn receive_unary<T: DeserializeOwned>(&mut self) -> Result<Option<T>, RpcError> {
        if self.unary_read {
            return Ok(None);
        }
        self.unary_read = true;
        let max = self.read_max_bytes as usize;
        let raw = match self.get_message.take() {
            Some(raw) => raw,
            None => {
                let Some(body) = self.body.take() else {
                    return Ok(None);
                };
                let bytes = body
                    .collect()
                    .await
                    .map_err(|err| RpcError::new(Code::Canceled, err.to_string()))?
                    .to_bytes();
                let mut raw = bytes.to_vec();
                if max > 0 && raw.len() > max && self.request_compression.is_identity() {
                    return Err(self.too_large(raw.len()));
                }
                if !self.request_compression.is_identity() {
                    raw = decompress(self.request_compression, &raw, max)?;
                }
                raw
            }
        };
        if max > 0 && raw.len() > max {
            return Err(self.too_large(raw.len()));
        }
        Ok(Some(decode_message(self.wire.codec, &raw)?))
    }

    /// Send the response head now.
    pub fn send_headers(&mut self) {
        if self.headers_sent {
            return;
        }
        self.headers_sent = true;
        let content_type = self.wire.content_type();
        let compression = self.response_compression();
        let http1 = self.parts.version < Version::HTTP_2;
        let protocol = self.wire.protocol;
        let trailer_names: Vec<HeaderName> = self.response_trailers.keys().cloned().collect();

        let headers = self.w.headers_mut();
        if let Ok(ct) = HeaderValue::from_str(&content_type) {
            headers.insert(CONTENT_TYPE, ct);
        }
        if !compression.is_identity() {
            headers.insert(
                self.wire.encoding_header(),
                HeaderValue::from_static(compression.name()),
            );
        }
        for (name, value) in &self.response_headers {
            headers.append(name.clone(), value.clone());
        }
        if protocol == Protocol::Grpc && http1 {
            let mut declared = vec![GRPC_STATUS, GRPC_MESSAGE, GRPC_STATUS_DETAILS].join(", ");
            for name in trailer_names {
                declared.push_str(", ");
                declared.push_str(name.as_str());
            }
            if let Ok(value) = HeaderValue::from_str(&declared) {
                headers.insert(TRAILER, value);
            }
        }
        self.w.write_header(StatusCode::OK);
        self.w.flush();
    }

    /// Send one response message.
    pub fn send<T: Serialize>(&mut self, msg: &T) -> Result<(), RpcError> {
        let mut payload = encode_message(self.wire.codec, msg)?;
        let compression = self.response_compression();
        if !self.wire.is_enveloped() {
            if !compression.is_identity() {
                payload = compress(compression, &payload)?;
            }
            self.unary_response = Some(payload);
            return Ok(());
        }
        self.send_headers();
        let mut flags = 0;
        if !compression.is_identity() {
            payload = compress(compression, &payload)?;
            flags |= FLAG_COMPRESSED;
        }
        self.write(&envelope::encode(flags, &payload))
    }

    fn write(&mut self, data: &[u8]) -> Result<(), RpcError> {
        self.w
            .write(data)
            .map_err(|err| RpcError::new(Code::Canceled, err.to_string()))?;
        self.w.flush();
        Ok(())
    }

    /// Complete the call with `result`.
    pub fn finish(mut self, result: Result<(), RpcError>) {
        let err = result.err().map(|mut err| {
            for (name, value) in std::mem::take(&mut err.headers) {
                if let Some(name) = name {
                    self.response_headers.append(name, value);
                }
            }
            self.response_trailers.extend(std::mem::take(&mut err.trailers));
            err
        });
        let written = match self.wire.protocol {
            Protocol::Connect if !self.wire.is_enveloped() => self.finish_connect_unary(err.as_ref()),
            Protocol::Connect => {
                let payload = connect_end_stream_json(err.as_ref(), &self.response_trailers);
                self.send_headers();
                self.write(&envelope::encode(FLAG_CONNECT_END_STREAM, &payload))
            }
            Protocol::GrpcWeb if err.is_none() || self.headers_sent => {
                let mut trailers = grpc_status_fields(err.as_ref());
                trailers.extend(self.response_trailers.clone());
                self.send_headers();
                let block = grpc_web_trailers_block(&trailers);
                self.write(&envelope::encode(FLAG_GRPC_WEB_TRAILERS, &block))
            }
            _ if err.is_some() && !self.headers_sent => {
                self.trailers_only(err.as_ref());
                Ok(())
            }
            _ => {
                self.send_headers();
                let mut trailers = grpc_status_fields(err.as_ref());
                trailers.extend(self.response_trailers.clone());
                let headers = self.w.headers_mut();
                for (name, value) in &trailers {
                    if let Ok(marked) =
                        HeaderName::from_bytes(format!("{TRAILER_PREFIX}{name}").as_bytes())
                    {
                        headers.append(marked, value.clone());
                    }
                }
                Ok(())
            }
        };
        if let Err(err) = written {
            tracing::debug!(%err, "failed to finish response");
        }
    }

    fn trailers_only(&mut self, err: Option<&RpcError>) {
        self.headers_sent = true;
        let content_type = self.wire.content_type();
        let headers = self.w.headers_mut();
        if let Ok(ct) = HeaderValue::from_str(&content_type) {
            headers.insert(CONTENT_TYPE, ct);
        }
        for (name, value) in &self.response_headers {
            headers.append(name.clone(), value.clone());
        }
        headers.extend(grpc_status_fields(err));
        for (name, value) in &self.response_trailers {
            headers.append(name.clone(), value.clone());
        }
        self.w.write_header(StatusCode::OK);
    }

    fn finish_connect_unary(&mut self, err: Option<&RpcError>) -> Result<(), RpcError> {
        self.headers_sent = true;
        let headers = self.w.headers_mut();
        for (name, value) in &self.response_headers {
            headers.append(name.clone(), value.clone());
        }
        for (name, value) in &self.response_trailers {
            if let Ok(prefixed) = HeaderName::from_bytes(
                format!("{CONNECT_UNARY_TRAILER_PREFIX}{name}").as_bytes(),
            ) {
                headers.append(prefixed, value.clone());
            }
        }
        let (status, body) = match (err, self.unary_response.take()) {
            (Some(err), _) => {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                (http_status_from_code(err.code), connect_error_json(err))
            }
            (None, Some(body)) => {
                if let Ok(ct) = HeaderValue::from_str(&self.wire.content_type()) {
                    headers.insert(CONTENT_TYPE, ct);
                }
                let compression = self.request_compression;
                if !compression.is_identity() {
                    headers.insert(CONTENT_ENCODING, HeaderValue::from_static(compression.name()));
                }
                (StatusCode::OK, body)
            }
            (None, None) => {
                let err = RpcError::internal("unary handler returned no response");
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                (http_status_from_code(err.code), connect_error_json(&err))
            }
        };
        self.w.write_header(status);
        self.write(&body)
    }
}

/// Recognise a Connect GET: `encoding` and `message` query parameters.
fn connect_get(parts: &Parts) -> Option<(Wire, Option<Vec<u8>>, Compression)> {
    let query = parts.uri.query().unwrap_or_default();
    let codec = Codec::from_name(&query_param(query, "encoding")?)?;
    let message = query_param(query, "message").unwrap_or_default();
    let message = if query_param(query, "base64").as_deref() == Some("1") {
        BASE64_URL.decode(message.as_bytes()).ok()?
    } else {
        message.into_bytes()
    };
    let compression = match query_param(query, "compression") {
        Some(name) => Compression::from_name(&name)?,
        None => Compression::Identity,
    };
    Some((
        Wire::new(Protocol::Connect, codec, false),
        Some(message),
        compression,
    ))
}
