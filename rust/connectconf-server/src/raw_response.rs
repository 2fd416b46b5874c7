//! Byte-exact responses requested by the test case.
//!
//! The service decodes the first request message. When its response
//! definition carries a raw response, the service parks it in the request's
//! [`RawResponseSlot`] and aborts. [`RawResponder`] then discards whatever
//! the aborted call tried to write and sends the raw response instead.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use http::header::{CONTENT_LENGTH, HeaderMap, HeaderValue, TRAILER};
use http::{Request, StatusCode};
use parking_lot::Mutex;

use connectconf_proto::{
    Codec, Compression, MessageContents, MessageData, Protocol, RawBody, RawHttpResponse,
    StreamContents, StreamItem,
};
use connectconf_rpc::RpcError;
use connectconf_rpc::error::{grpc_status_fields, grpc_web_trailers_block};
use connectconf_rpc::protocol::Wire;
use connectconf_wire::envelope::FLAG_GRPC_WEB_TRAILERS;
use connectconf_wire::headers::{
    HeaderError, TEST_CASE_NAME, add_headers, add_trailers, header_str, to_proto_headers,
};
use connectconf_wire::http::{Body, BoxError, Handler, ResponseWriter};
use connectconf_wire::raw_body::{RawBodyError, raw_body_bytes};
use connectconf_wire::Printer;

#[derive(Debug, thiserror::Error)]
pub enum RawResponseError {
    #[error(transparent)]
    Header(#[from] HeaderError),

    #[error("invalid status code {0}")]
    Status(u32),

    #[error(transparent)]
    Body(#[from] RawBodyError),

    #[error("failed to write raw response: {0}")]
    Write(BoxError),
}

/// Where the service leaves a raw response for [`RawResponder`].
#[derive(Debug, Default)]
pub struct RawResponseSlot(Mutex<Option<RawHttpResponse>>);

impl RawResponseSlot {
    pub fn set(&self, resp: RawHttpResponse) {
        *self.0.lock() = Some(resp);
    }

    fn is_set(&self) -> bool {
        self.0.lock().is_some()
    }

    fn take(&self) -> Option<RawHttpResponse> {
        self.0.lock().take()
    }
}

/// Sends the raw response a handler asked for, if it asked before writing
/// anything itself.
pub struct RawResponder<H> {
    inner: H,
    feedback: Arc<dyn Printer>,
}

impl<H> RawResponder<H> {
    pub fn new(inner: H, feedback: Arc<dyn Printer>) -> Self {
        RawResponder { inner, feedback }
    }
}

impl<H: Handler> Handler for RawResponder<H> {
    fn serve<'a>(&'a self, mut req: Request<Body>, w: &'a mut dyn ResponseWriter) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let test_name = header_str(req.headers(), TEST_CASE_NAME)
                .unwrap_or_default()
                .to_string();
            let slot = Arc::new(RawResponseSlot::default());
            req.extensions_mut().insert(slot.clone());
            let initial = w.headers_mut().clone();

            let mut guarded = GuardedWriter {
                inner: &mut *w,
                slot: &slot,
                started: false,
            };
            self.inner.serve(req, &mut guarded).await;
            let started = guarded.started;

            let Some(raw) = slot.take() else {
                return;
            };
            if started {
                self.feedback.prefix_printf(
                    &test_name,
                    format_args!("could not send raw response; handler sent response too soon"),
                );
                return;
            }
            if let Err(err) = write_raw_response(w, initial, &raw) {
                self.feedback
                    .prefix_printf(&test_name, format_args!("raw response: {err}"));
            }
        })
    }
}

/// Passes writes through until a raw response is parked, then drops them.
struct GuardedWriter<'a> {
    inner: &'a mut dyn ResponseWriter,
    slot: &'a RawResponseSlot,
    started: bool,
}

impl GuardedWriter<'_> {
    fn can_send(&mut self) -> bool {
        if self.started {
            return true;
        }
        if self.slot.is_set() {
            return false;
        }
        self.started = true;
        true
    }
}

impl ResponseWriter for GuardedWriter<'_> {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        self.inner.headers_mut()
    }

    fn write_header(&mut self, status: StatusCode) {
        if self.can_send() {
            self.inner.write_header(status);
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, BoxError> {
        if self.can_send() {
            return self.inner.write(data);
        }
        Ok(data.len())
    }

    fn flush(&mut self) {
        if self.can_send() {
            self.inner.flush();
        }
    }
}

/// Write `raw` to `w`, starting over from the `initial` headers.
pub fn write_raw_response(
    w: &mut dyn ResponseWriter,
    initial: HeaderMap,
    raw: &RawHttpResponse,
) -> Result<(), RawResponseError> {
    let status = match raw.status_code {
        0 => StatusCode::OK,
        code => u16::try_from(code)
            .ok()
            .and_then(|c| StatusCode::from_u16(c).ok())
            .ok_or(RawResponseError::Status(code))?,
    };
    let body = match &raw.body {
        Some(body) => raw_body_bytes(body)?,
        None => Vec::new(),
    };

    let headers = w.headers_mut();
    *headers = initial;
    add_headers(&raw.headers, headers)?;
    headers.remove(CONTENT_LENGTH);
    for trailer in &raw.trailers {
        if let Ok(name) = HeaderValue::from_str(&trailer.name) {
            headers.append(TRAILER, name);
        }
    }
    w.write_header(status);
    if !body.is_empty() {
        w.write(&body).map_err(RawResponseError::Write)?;
    }
    add_trailers(&raw.trailers, w.headers_mut())?;
    Ok(())
}

/// The raw response equivalent to failing a gRPC or gRPC-Web call with
/// `err`, keeping `headers` in the response head and `trailers` after the
/// (empty) body.
pub fn grpc_error_response(
    protocol: Protocol,
    codec: Codec,
    err: &RpcError,
    headers: &HeaderMap,
    trailers: &HeaderMap,
) -> RawHttpResponse {
    let mut status = grpc_status_fields(Some(err));
    status.extend(trailers.clone());

    let mut head = HeaderMap::new();
    let content_type = Wire::new(protocol, codec, true).content_type();
    if let Ok(value) = HeaderValue::from_str(&content_type) {
        head.insert(http::header::CONTENT_TYPE, value);
    }
    head.extend(headers.clone());

    match protocol {
        Protocol::GrpcWeb => RawHttpResponse {
            status_code: 200,
            headers: to_proto_headers(&head),
            body: Some(RawBody::Stream(StreamContents {
                items: vec![StreamItem {
                    flags: u32::from(FLAG_GRPC_WEB_TRAILERS),
                    length: None,
                    payload: MessageContents {
                        data: Some(MessageData::Binary(grpc_web_trailers_block(&status))),
                        compression: Compression::Identity,
                    },
                }],
            })),
            trailers: Vec::new(),
        },
        _ => RawHttpResponse {
            status_code: 200,
            headers: to_proto_headers(&head),
            body: None,
            trailers: to_proto_headers(&status),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use connectconf_proto::{Code, Header};
    use connectconf_wire::http::{ChannelResponseWriter, collect_body, dispatch, full_body};
    use connectconf_wire::FeedbackPrinter;
    use http::Version;

    fn header(name: &str, values: &[&str]) -> Header {
        Header {
            name: name.to_string(),
            value: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    /// Parks the response it is built with, optionally after writing.
    struct Parks {
        raw: RawHttpResponse,
        write_first: bool,
    }

    impl Handler for Parks {
        fn serve<'a>(&'a self, req: Request<Body>, w: &'a mut dyn ResponseWriter) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                w.headers_mut()
                    .insert("x-from-handler", HeaderValue::from_static("1"));
                if self.write_first {
                    w.write_header(StatusCode::ACCEPTED);
                }
                if let Some(slot) = req.extensions().get::<Arc<RawResponseSlot>>() {
                    slot.set(self.raw.clone());
                }
                w.write_header(StatusCode::CONFLICT);
                let _ = w.write(b"ignored");
            })
        }
    }

    fn raw() -> RawHttpResponse {
        RawHttpResponse {
            status_code: 0,
            headers: vec![header("content-type", &["application/foo"])],
            body: Some(RawBody::Unary(MessageContents {
                data: Some(MessageData::Text("hello".into())),
                compression: Compression::Identity,
            })),
            trailers: vec![header("x-trailer", &["a", "b"])],
        }
    }

    async fn serve(write_first: bool) -> (http::Response<Body>, Arc<FeedbackPrinter>) {
        let feedback = Arc::new(FeedbackPrinter::new());
        let handler = RawResponder::new(
            Parks {
                raw: raw(),
                write_first,
            },
            feedback.clone(),
        );
        let req = Request::post("/x")
            .header(TEST_CASE_NAME, "raw")
            .body(full_body(""))
            .unwrap();
        (dispatch(Arc::new(handler), req).await, feedback)
    }

    #[tokio::test]
    async fn raw_response_replaces_handler_output() {
        let (resp, feedback) = serve(false).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["content-type"], "application/foo");
        assert!(!resp.headers().contains_key("x-from-handler"));
        assert_eq!(resp.headers()["trailer"], "x-trailer");
        let (body, trailers) = collect_body(resp.into_body()).await.unwrap();
        assert_eq!(&body[..], b"hello");
        let trailers = trailers.unwrap();
        let values: Vec<_> = trailers.get_all("x-trailer").iter().collect();
        assert_eq!(values, ["a", "b"]);
        assert!(feedback.is_empty());
    }

    #[tokio::test]
    async fn raw_response_after_writing_is_reported() {
        let (resp, feedback) = serve(true).await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(
            feedback.take(),
            ["raw: could not send raw response; handler sent response too soon"]
        );
    }

    #[tokio::test]
    async fn invalid_status_is_an_error() {
        let (mut w, _pending) = ChannelResponseWriter::new(Version::HTTP_11);
        let mut raw = raw();
        raw.status_code = 1000;
        let err = write_raw_response(&mut w, HeaderMap::new(), &raw).unwrap_err();
        assert_eq!(err.to_string(), "invalid status code 1000");
    }

    #[test]
    fn grpc_error_keeps_placement() {
        let err = RpcError::new(Code::Aborted, "nope");
        let mut headers = HeaderMap::new();
        headers.insert("x-head", HeaderValue::from_static("h"));
        let mut trailers = HeaderMap::new();
        trailers.insert("x-tail", HeaderValue::from_static("t"));

        let grpc = grpc_error_response(Protocol::Grpc, Codec::Proto, &err, &headers, &trailers);
        assert!(grpc.headers.contains(&header("content-type", &["application/grpc"])));
        assert!(grpc.headers.contains(&header("x-head", &["h"])));
        assert!(grpc.trailers.contains(&header("grpc-status", &["10"])));
        assert!(grpc.trailers.contains(&header("grpc-message", &["nope"])));
        assert!(grpc.trailers.contains(&header("x-tail", &["t"])));
        assert!(grpc.body.is_none());

        let web = grpc_error_response(Protocol::GrpcWeb, Codec::Json, &err, &headers, &trailers);
        assert!(web.trailers.is_empty());
        let Some(RawBody::Stream(stream)) = web.body else {
            panic!("expected a stream body");
        };
        assert_eq!(stream.items.len(), 1);
        assert_eq!(stream.items[0].flags, 0x80);
        let Some(MessageData::Binary(block)) = &stream.items[0].payload.data else {
            panic!("expected binary trailers");
        };
        let block = String::from_utf8_lossy(block);
        assert!(block.contains("grpc-status: 10\r\n"), "{block}");
        assert!(block.contains("x-tail: t\r\n"), "{block}");
    }
}
