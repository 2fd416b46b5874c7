//! Tracing wrappers for the client transport and the server handler.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use http::header::{CONTENT_LENGTH, HeaderMap, HeaderValue};
use http::{Request, StatusCode, Version};
use http_body::Body as _;
use tokio_util::sync::CancellationToken;

use connectconf_wire::headers::TRAILER_PREFIX;
use connectconf_wire::http::{
    Body, BoxError, Handler, ResponseFuture, ResponseWriter, RoundTrip, box_body, declared_trailers,
};

use crate::builder::{Builder, Collector, Direction};
use crate::tap::{DataTap, TracingBody, properties_from_headers};
use crate::trace::{EventKind, RequestInfo, ResponseInfo, TraceError, content_length};

/// Records a trace for every request sent through `inner`.
///
/// A [`CancellationToken`] in the request extensions marks the call as
/// canceled when it fires before the response body is done.
pub struct TracingRoundTripper<T> {
    inner: T,
    collector: Arc<dyn Collector>,
}

impl<T> TracingRoundTripper<T> {
    pub fn new(inner: T, collector: Arc<dyn Collector>) -> Self {
        TracingRoundTripper { inner, collector }
    }
}

impl<T: RoundTrip> RoundTrip for TracingRoundTripper<T> {
    fn round_trip(&self, req: Request<Body>) -> ResponseFuture {
        let builder = Builder::new(RequestInfo::from_request(&req), true, self.collector.clone());
        let done = CancellationToken::new();
        if let Some(canceled) = req.extensions().get::<CancellationToken>().cloned() {
            let builder = builder.clone();
            let done = done.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = canceled.cancelled() => builder.add(EventKind::RequestCanceled),
                    _ = done.cancelled() => {}
                }
            });
        }

        let (parts, body) = req.into_parts();
        let props = properties_from_headers(&parts.headers);
        let body = TracingBody::new(body, Direction::Request, props, builder.clone());
        let fut = self
            .inner
            .round_trip(Request::from_parts(parts, box_body(body)));

        Box::pin(async move {
            let resp = match fut.await {
                Ok(resp) => resp,
                Err(err) => {
                    builder.add(EventKind::ResponseError {
                        err: TraceError::other(&err),
                    });
                    done.cancel();
                    return Err(err);
                }
            };
            builder.add(EventKind::ResponseStart(ResponseInfo::from_response(&resp)));
            let (parts, body) = resp.into_parts();
            let props = properties_from_headers(&parts.headers);
            let body = TracingBody::new(body, Direction::Response, props, builder)
                .with_done_token(done);
            Ok(http::Response::from_parts(parts, box_body(body)))
        })
    }
}

/// Records a trace for every request served by `inner`.
pub struct TracingHandler<H> {
    inner: H,
    collector: Arc<dyn Collector>,
}

impl<H> TracingHandler<H> {
    pub fn new(inner: H, collector: Arc<dyn Collector>) -> Self {
        TracingHandler { inner, collector }
    }
}

impl<H: Handler> Handler for TracingHandler<H> {
    fn serve<'a>(&'a self, req: Request<Body>, w: &'a mut dyn ResponseWriter) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut info = RequestInfo::from_request(&req);
            // a known body size must have come from a header
            if !info.headers.contains_key(CONTENT_LENGTH)
                && let Some(len) = req.body().size_hint().exact()
            {
                info.headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
            }
            let version = req.version();
            let builder = Builder::new(info, false, self.collector.clone());

            let (parts, body) = req.into_parts();
            let props = properties_from_headers(&parts.headers);
            let body = TracingBody::new(body, Direction::Request, props, builder.clone());
            let req = Request::from_parts(parts, box_body(body));

            let mut traced = TracingResponseWriter::new(w, builder.clone(), version);
            let outcome = AssertUnwindSafe(self.inner.serve(req, &mut traced))
                .catch_unwind()
                .await;
            match outcome {
                Ok(()) => {
                    traced.finish(None);
                    builder.build();
                }
                Err(panic) => {
                    traced.finish(Some(TraceError::Other(format!(
                        "panic: {}",
                        panic_message(&*panic)
                    ))));
                    builder.build();
                    std::panic::resume_unwind(panic);
                }
            }
        })
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown"
    }
}

/// A [`ResponseWriter`] that records the response as it is written.
pub struct TracingResponseWriter<'a> {
    inner: &'a mut dyn ResponseWriter,
    builder: Arc<Builder>,
    version: Version,
    started: bool,
    finished: bool,
    trailer_names: Vec<http::HeaderName>,
    tap: Option<DataTap>,
}

impl<'a> TracingResponseWriter<'a> {
    pub fn new(inner: &'a mut dyn ResponseWriter, builder: Arc<Builder>, version: Version) -> Self {
        TracingResponseWriter {
            inner,
            builder,
            version,
            started: false,
            finished: false,
            trailer_names: Vec::new(),
            tap: None,
        }
    }

    /// Record the end of the response. Only the first call has any effect.
    pub fn finish(&mut self, err: Option<TraceError>) {
        if self.finished {
            return;
        }
        if !self.started {
            self.write_header(StatusCode::OK);
        }
        self.finished = true;
        if let Some(ev) = self.tap.as_mut().and_then(DataTap::unfinished) {
            self.builder.add(ev);
        }
        let trailers = self.collect_trailers();
        self.builder.set_trailers(Direction::Response, trailers);
        self.builder.add(EventKind::ResponseBodyEnd { err });
    }

    /// Declared trailers first, then the ones marked with the trailer prefix.
    fn collect_trailers(&mut self) -> HeaderMap {
        let headers = self.inner.headers_mut();
        let mut trailers = HeaderMap::new();
        for name in &self.trailer_names {
            for value in headers.get_all(name) {
                trailers.append(name.clone(), value.clone());
            }
        }
        for (name, value) in headers.iter() {
            let Some(stripped) = name.as_str().strip_prefix(TRAILER_PREFIX) else {
                continue;
            };
            if let Ok(stripped) = http::HeaderName::from_bytes(stripped.as_bytes()) {
                trailers.append(stripped, value.clone());
            }
        }
        trailers
    }
}

impl ResponseWriter for TracingResponseWriter<'_> {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        self.inner.headers_mut()
    }

    fn write_header(&mut self, status: StatusCode) {
        if self.started {
            return;
        }
        self.started = true;
        self.inner.write_header(status);

        let all = self.inner.headers_mut();
        let mut headers = HeaderMap::with_capacity(all.len());
        for (name, value) in all.iter() {
            if !name.as_str().starts_with(TRAILER_PREFIX) {
                headers.append(name.clone(), value.clone());
            }
        }
        self.trailer_names = declared_trailers(all);
        self.tap = Some(DataTap::new(
            Direction::Response,
            properties_from_headers(&headers),
        ));
        self.builder.add(EventKind::ResponseStart(ResponseInfo {
            status,
            version: self.version,
            content_length: content_length(&headers),
            headers,
            trailers: HeaderMap::new(),
        }));
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, BoxError> {
        if !self.started {
            self.write_header(StatusCode::OK);
        }
        let result = self.inner.write(data);
        let n = *result.as_ref().unwrap_or(&0);
        if let Some(tap) = self.tap.as_mut() {
            for ev in tap.feed(&data[..n]) {
                self.builder.add(ev);
            }
        }
        if let Err(err) = &result {
            self.finish(Some(TraceError::other(err)));
        }
        result
    }

    fn flush(&mut self) {
        self.inner.flush();
    }
}
