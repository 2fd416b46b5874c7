//! HTTP/1 connections that can frame a response themselves.
//!
//! hyper only writes trailer fields when the request carried `te: trailers`.
//! A response that declares trailers for a request without it is parked in
//! a [`Takeover`]; hyper then writes a placeholder that closes the
//! connection, and [`Http1Conn`] puts the real response on the wire in its
//! place: status line, headers, chunked body and trailer block.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::header::{CONNECTION, CONTENT_LENGTH, HeaderMap, HeaderValue, TE, TRANSFER_ENCODING};
use http::response::Parts;
use http::{Request, Response, Version};
use hyper::body::Body as _;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use connectconf_wire::http::{Body, declared_trailers, empty_body};

/// Whether hyper writes the trailers of the response to `req`. HTTP/1.0
/// has no chunked bodies, so there is nothing to take over there.
pub(crate) fn hyper_writes_trailers<B>(req: &Request<B>) -> bool {
    req.version() != Version::HTTP_11
        || req
            .headers()
            .get_all(TE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("trailers"))
}

/// Whether `resp` has to be framed by the connection.
pub(crate) fn needs_takeover(resp: &Response<Body>) -> bool {
    !declared_trailers(resp.headers()).is_empty()
}

/// Response handed from the service to its connection.
#[derive(Default)]
pub(crate) struct Takeover {
    pending: Mutex<Option<Response<Body>>>,
}

impl Takeover {
    /// Park `resp` and return the placeholder hyper should write instead.
    pub(crate) fn replace(&self, resp: Response<Body>) -> Response<Body> {
        *self.pending.lock() = Some(resp);
        let mut placeholder = Response::new(empty_body());
        placeholder
            .headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("close"));
        placeholder
    }

    fn take(&self) -> Option<Response<Body>> {
        self.pending.lock().take()
    }
}

enum State {
    Hyper,
    Framing { out: BytesMut, body: Option<Body> },
}

/// Passes hyper's I/O through until a response is parked in the
/// [`Takeover`]; from then on hyper's writes are dropped and the parked
/// response is written instead.
pub(crate) struct Http1Conn<IO> {
    io: IO,
    takeover: Arc<Takeover>,
    state: State,
}

impl<IO> Http1Conn<IO> {
    pub(crate) fn new(io: IO, takeover: Arc<Takeover>) -> Self {
        Self {
            io,
            takeover,
            state: State::Hyper,
        }
    }

    fn start(&mut self) {
        if !matches!(self.state, State::Hyper) {
            return;
        }
        if let Some(resp) = self.takeover.take() {
            let (parts, body) = resp.into_parts();
            self.state = State::Framing {
                out: encode_head(&parts),
                body: Some(body),
            };
        }
    }
}

impl<IO: AsyncWrite + Unpin> Http1Conn<IO> {
    /// Write the parked response until its body is done.
    fn poll_framing(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let State::Framing { out, body } = &mut self.state else {
            return Poll::Ready(Ok(()));
        };
        loop {
            if !out.is_empty() {
                let n = ready!(Pin::new(&mut self.io).poll_write(cx, out))?;
                if n == 0 {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                out.advance(n);
                continue;
            }
            let Some(frames) = body else {
                return Poll::Ready(Ok(()));
            };
            match ready!(Pin::new(frames).poll_frame(cx)) {
                Some(Ok(frame)) => match frame.into_data() {
                    Ok(data) => encode_chunk(out, &data),
                    Err(frame) => {
                        if let Ok(trailers) = frame.into_trailers() {
                            encode_end(out, &trailers);
                            *body = None;
                        }
                    }
                },
                Some(Err(err)) => return Poll::Ready(Err(io::Error::other(err))),
                None => {
                    encode_end(out, &HeaderMap::new());
                    *body = None;
                }
            }
        }
    }
}

fn put_field(out: &mut BytesMut, name: &str, value: &HeaderValue) {
    out.put_slice(name.as_bytes());
    out.put_slice(b": ");
    out.put_slice(value.as_bytes());
    out.put_slice(b"\r\n");
}

fn encode_head(parts: &Parts) -> BytesMut {
    let mut out = BytesMut::new();
    let reason = parts.status.canonical_reason().unwrap_or_default();
    out.put_slice(format!("HTTP/1.1 {} {reason}\r\n", parts.status.as_str()).as_bytes());
    for (name, value) in &parts.headers {
        if name == CONTENT_LENGTH || name == TRANSFER_ENCODING || name == CONNECTION {
            continue;
        }
        put_field(&mut out, name.as_str(), value);
    }
    out.put_slice(b"transfer-encoding: chunked\r\nconnection: close\r\n\r\n");
    out
}

fn encode_chunk(out: &mut BytesMut, data: &Bytes) {
    if data.is_empty() {
        return;
    }
    out.put_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.put_slice(data);
    out.put_slice(b"\r\n");
}

fn encode_end(out: &mut BytesMut, trailers: &HeaderMap) {
    out.put_slice(b"0\r\n");
    for (name, value) in trailers {
        put_field(out, name.as_str(), value);
    }
    out.put_slice(b"\r\n");
}

impl<IO: AsyncRead + Unpin> AsyncRead for Http1Conn<IO> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_read(cx, buf)
    }
}

impl<IO: AsyncWrite + Unpin> AsyncWrite for Http1Conn<IO> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.start();
        match this.state {
            State::Hyper => Pin::new(&mut this.io).poll_write(cx, buf),
            State::Framing { .. } => Poll::Ready(Ok(buf.len())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.start();
        ready!(this.poll_framing(cx))?;
        Pin::new(&mut this.io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.start();
        ready!(this.poll_framing(cx))?;
        Pin::new(&mut this.io).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use connectconf_wire::http::{ChannelResponseWriter, ResponseWriter};
    use http::StatusCode;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn hyper_writes_trailers_follows_te() {
        let plain = Request::get("/").body(()).unwrap();
        assert!(!hyper_writes_trailers(&plain));
        let asked = Request::get("/").header(TE, "gzip, Trailers").body(()).unwrap();
        assert!(hyper_writes_trailers(&asked));
        let h2 = Request::get("/").version(Version::HTTP_2).body(()).unwrap();
        assert!(hyper_writes_trailers(&h2));
    }

    #[tokio::test]
    async fn parked_response_replaces_hyper_output() {
        let (mut w, pending) = ChannelResponseWriter::new(Version::HTTP_11);
        let headers = w.headers_mut();
        headers.insert("content-type", HeaderValue::from_static("foo/bar"));
        headers.insert("trailer", HeaderValue::from_static("x"));
        headers.insert("content-length", HeaderValue::from_static("99"));
        w.write_header(StatusCode::HTTP_VERSION_NOT_SUPPORTED);
        w.write(br#"{"foo":"bar"}"#).unwrap();
        w.headers_mut().insert("x", HeaderValue::from_static("123"));
        w.finish();
        let resp = pending.into_response().await;
        assert!(needs_takeover(&resp));

        let (client, server) = tokio::io::duplex(4096);
        let takeover = Arc::new(Takeover::default());
        let mut conn = Http1Conn::new(server, takeover.clone());
        conn.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
        let placeholder = takeover.replace(resp);
        assert_eq!(placeholder.headers()[CONNECTION], "close");
        conn.write_all(b"dropped").await.unwrap();
        conn.shutdown().await.unwrap();
        drop(conn);

        let mut wire = String::new();
        let mut client = client;
        client.read_to_string(&mut wire).await.unwrap();
        assert_eq!(
            wire,
            "HTTP/1.1 200 OK\r\n\r\n\
             HTTP/1.1 505 HTTP Version Not Supported\r\n\
             content-type: foo/bar\r\n\
             trailer: x\r\n\
             transfer-encoding: chunked\r\n\
             connection: close\r\n\r\n\
             d\r\n{\"foo\":\"bar\"}\r\n\
             0\r\nx: 123\r\n\r\n"
        );
    }
}
