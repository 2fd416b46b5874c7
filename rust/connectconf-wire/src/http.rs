//! HTTP plumbing shared by the tracer, the RPC layer, the client and the server.
//!
//! Two seams matter:
//! - [`RoundTrip`]: anything that turns a request into a response. Transports
//!   implement it and middleware wraps it.
//! - [`ResponseWriter`]: the handler-facing side of a server response. Headers
//!   are mutable until the first write or flush; trailers travel as headers
//!   marked with [`TRAILER_PREFIX`] until [`ChannelResponseWriter::finish`].

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::header::{self, HeaderMap, HeaderName};
use http::{Request, Response, StatusCode, Version};
use http_body::{Body as HttpBody, Frame, SizeHint};
use http_body_util::{BodyExt, Empty, Full};
use tokio::sync::{mpsc, oneshot};

use crate::headers::{TRAILER_PREFIX, take_prefixed_trailers};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The body type used on both sides of every connection.
pub type Body = http_body_util::combinators::BoxBody<Bytes, BoxError>;

pub type ResponseFuture = BoxFuture<'static, Result<Response<Body>, BoxError>>;

pub fn empty_body() -> Body {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

pub fn full_body(data: impl Into<Bytes>) -> Body {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

/// Box any body whose error converts into [`BoxError`].
pub fn box_body<B>(body: B) -> Body
where
    B: HttpBody<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<BoxError>,
{
    body.map_err(Into::into).boxed()
}

/// Sends one HTTP request and yields its response.
pub trait RoundTrip: Send + Sync {
    fn round_trip(&self, req: Request<Body>) -> ResponseFuture;
}

impl<T: RoundTrip + ?Sized> RoundTrip for Arc<T> {
    fn round_trip(&self, req: Request<Body>) -> ResponseFuture {
        (**self).round_trip(req)
    }
}

/// Serves one request by writing to a [`ResponseWriter`].
pub trait Handler: Send + Sync {
    fn serve<'a>(&'a self, req: Request<Body>, w: &'a mut dyn ResponseWriter) -> BoxFuture<'a, ()>;
}

impl<T: Handler + ?Sized> Handler for Arc<T> {
    fn serve<'a>(&'a self, req: Request<Body>, w: &'a mut dyn ResponseWriter) -> BoxFuture<'a, ()> {
        (**self).serve(req, w)
    }
}

/// Run `handler` on its own task and resolve to the response it writes.
///
/// The response resolves as soon as the head is sent; the body keeps
/// streaming while the handler runs.
pub async fn dispatch(handler: Arc<dyn Handler>, req: Request<Body>) -> Response<Body> {
    let (mut w, pending) = ChannelResponseWriter::new(req.version());
    tokio::spawn(async move {
        handler.serve(req, &mut w).await;
        w.finish();
    });
    pending.into_response().await
}

// ============================================================================
// Channel-backed body
// ============================================================================

/// Error returned when the receiving side of a channel body is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("body receiver dropped")]
pub struct BodyClosed;

/// The sending half of a [`ChannelBody`].
#[derive(Clone, Debug)]
pub struct BodySender {
    tx: mpsc::UnboundedSender<Result<Frame<Bytes>, BoxError>>,
}

impl BodySender {
    pub fn send_data(&self, data: Bytes) -> Result<(), BodyClosed> {
        self.tx.send(Ok(Frame::data(data))).map_err(|_| BodyClosed)
    }

    pub fn send_trailers(&self, trailers: HeaderMap) -> Result<(), BodyClosed> {
        self.tx.send(Ok(Frame::trailers(trailers))).map_err(|_| BodyClosed)
    }

    /// End the body with an error instead of a clean EOF.
    pub fn abort(&self, err: BoxError) {
        let _ = self.tx.send(Err(err));
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A body fed frame by frame from a [`BodySender`]. It ends when every
/// sender has been dropped.
#[derive(Debug)]
pub struct ChannelBody {
    rx: mpsc::UnboundedReceiver<Result<Frame<Bytes>, BoxError>>,
}

pub fn body_channel() -> (BodySender, ChannelBody) {
    let (tx, rx) = mpsc::unbounded_channel();
    (BodySender { tx }, ChannelBody { rx })
}

impl HttpBody for ChannelBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        self.rx.poll_recv(cx)
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::default()
    }
}

// ============================================================================
// Response writer
// ============================================================================

/// Handler-facing side of a server response.
pub trait ResponseWriter: Send {
    /// Response headers. Changes after the head is sent only matter for
    /// trailers, either marked with [`TRAILER_PREFIX`] or declared in `Trailer`.
    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// Send the head with `status`. Only the first call has any effect.
    fn write_header(&mut self, status: StatusCode);

    /// Write body bytes, implying status 200 if no head was sent.
    fn write(&mut self, data: &[u8]) -> Result<usize, BoxError>;

    /// Push the head (and any written data) to the peer now.
    fn flush(&mut self);
}

/// Head of a response produced by a [`ChannelResponseWriter`].
#[derive(Debug)]
struct Head {
    status: StatusCode,
    headers: HeaderMap,
}

/// A [`ResponseWriter`] whose output is a `Response<Body>` for hyper.
pub struct ChannelResponseWriter {
    headers: HeaderMap,
    sent_headers: Option<HeaderMap>,
    head_tx: Option<oneshot::Sender<Head>>,
    body: BodySender,
}

/// The response side of a [`ChannelResponseWriter`], resolved once the head
/// is sent.
pub struct PendingResponse {
    head_rx: oneshot::Receiver<Head>,
    body: ChannelBody,
    version: Version,
}

impl ChannelResponseWriter {
    pub fn new(version: Version) -> (Self, PendingResponse) {
        let (head_tx, head_rx) = oneshot::channel();
        let (body, body_rx) = body_channel();
        (
            ChannelResponseWriter {
                headers: HeaderMap::new(),
                sent_headers: None,
                head_tx: Some(head_tx),
                body,
            },
            PendingResponse {
                head_rx,
                body: body_rx,
                version,
            },
        )
    }

    pub fn head_sent(&self) -> bool {
        self.head_tx.is_none()
    }

    fn send_head(&mut self, status: StatusCode) {
        let Some(tx) = self.head_tx.take() else {
            return;
        };
        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            if !name.as_str().starts_with(TRAILER_PREFIX) {
                headers.append(name.clone(), value.clone());
            }
        }
        self.sent_headers = Some(headers.clone());
        let _ = tx.send(Head { status, headers });
    }

    /// Complete the response: send the head if nobody did, then the trailers.
    pub fn finish(mut self) {
        self.send_head(StatusCode::OK);
        let mut trailers = take_prefixed_trailers(&mut self.headers);
        let sent = self.sent_headers.take().unwrap_or_default();
        for name in declared_trailers(&self.headers) {
            if sent.contains_key(&name) || trailers.contains_key(&name) {
                continue;
            }
            for value in self.headers.get_all(&name) {
                trailers.append(name.clone(), value.clone());
            }
        }
        if !trailers.is_empty() {
            let _ = self.body.send_trailers(trailers);
        }
    }
}

impl ResponseWriter for ChannelResponseWriter {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn write_header(&mut self, status: StatusCode) {
        self.send_head(status);
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, BoxError> {
        self.send_head(StatusCode::OK);
        if data.is_empty() {
            return Ok(0);
        }
        self.body.send_data(Bytes::copy_from_slice(data))?;
        Ok(data.len())
    }

    fn flush(&mut self) {
        self.send_head(StatusCode::OK);
    }
}

impl PendingResponse {
    /// Wait for the head. A writer dropped without sending one yields a 500.
    pub async fn into_response(self) -> Response<Body> {
        let head = self.head_rx.await.unwrap_or(Head {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            headers: HeaderMap::new(),
        });
        let mut resp = Response::new(box_body(self.body));
        *resp.status_mut() = head.status;
        *resp.version_mut() = self.version;
        *resp.headers_mut() = head.headers;
        resp
    }
}

/// Names listed in `Trailer` headers.
pub fn declared_trailers(headers: &HeaderMap) -> Vec<HeaderName> {
    headers
        .get_all(header::TRAILER)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .filter_map(|name| HeaderName::from_bytes(name.as_bytes()).ok())
        .collect()
}

/// Collect a whole body, keeping its trailers.
pub async fn collect_body(body: Body) -> Result<(Bytes, Option<HeaderMap>), BoxError> {
    let collected = body.collect().await?;
    let trailers = collected.trailers().cloned();
    Ok((collected.to_bytes(), trailers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[tokio::test]
    async fn head_is_sent_on_first_write() {
        let (mut w, pending) = ChannelResponseWriter::new(Version::HTTP_11);
        w.headers_mut()
            .insert("content-type", HeaderValue::from_static("application/json"));
        w.write(b"{}").unwrap();
        w.headers_mut()
            .insert("x-too-late", HeaderValue::from_static("1"));
        w.finish();

        let resp = pending.into_response().await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["content-type"], "application/json");
        assert!(!resp.headers().contains_key("x-too-late"));
        let (body, trailers) = collect_body(resp.into_body()).await.unwrap();
        assert_eq!(body.as_ref(), b"{}");
        assert!(trailers.is_none());
    }

    #[tokio::test]
    async fn marked_and_declared_trailers_are_sent_last() {
        let (mut w, pending) = ChannelResponseWriter::new(Version::HTTP_2);
        w.headers_mut()
            .insert("trailer", HeaderValue::from_static("grpc-status"));
        w.headers_mut()
            .insert("trailer+x-custom", HeaderValue::from_static("abc"));
        w.write_header(StatusCode::ACCEPTED);
        w.headers_mut()
            .insert("grpc-status", HeaderValue::from_static("0"));
        w.finish();

        let resp = pending.into_response().await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert!(!resp.headers().contains_key("trailer+x-custom"));
        let (body, trailers) = collect_body(resp.into_body()).await.unwrap();
        assert!(body.is_empty());
        let trailers = trailers.unwrap();
        assert_eq!(trailers["x-custom"], "abc");
        assert_eq!(trailers["grpc-status"], "0");
    }

    #[tokio::test]
    async fn finish_without_writes_is_an_empty_ok() {
        let (w, pending) = ChannelResponseWriter::new(Version::HTTP_11);
        w.finish();
        let resp = pending.into_response().await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    struct Echo;

    impl Handler for Echo {
        fn serve<'a>(
            &'a self,
            req: Request<Body>,
            w: &'a mut dyn ResponseWriter,
        ) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                let (body, _) = collect_body(req.into_body()).await.unwrap();
                w.headers_mut()
                    .insert("trailer+x-len", HeaderValue::from(body.len()));
                w.write(&body).unwrap();
            })
        }
    }

    #[tokio::test]
    async fn dispatch_runs_the_handler() {
        let req = Request::new(full_body("ping"));
        let resp = dispatch(Arc::new(Echo), req).await;
        let (body, trailers) = collect_body(resp.into_body()).await.unwrap();
        assert_eq!(body.as_ref(), b"ping");
        assert_eq!(trailers.unwrap()["x-len"], "4");
    }

    #[test]
    fn declared_trailer_names() {
        let mut headers = HeaderMap::new();
        headers.append("trailer", HeaderValue::from_static("a, b"));
        headers.append("trailer", HeaderValue::from_static("c,"));
        let names: Vec<_> = declared_trailers(&headers)
            .iter()
            .map(|n| n.as_str().to_string())
            .collect();
        assert_eq!(names, ["a", "b", "c"]);
    }
}
