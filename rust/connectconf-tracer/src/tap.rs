//! Turns body bytes into body data events.
//!
//! [`DataTap`] is a small state machine: it is fed byte slices as they are
//! read or written and returns the events those bytes complete.
//! [`TracingBody`] wraps an HTTP body and feeds a tap as frames go by.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::HeaderMap;
use http::header::CONTENT_ENCODING;
use http_body::{Body as HttpBody, Frame, SizeHint};
use tokio_util::sync::CancellationToken;

use connectconf_proto::Compression;
use connectconf_wire::compression;
use connectconf_wire::envelope::{END_STREAM_MASK, Envelope, PREFIX_LEN};
use connectconf_wire::http::{Body, BoxError};

use crate::builder::{Builder, Direction};
use crate::trace::{EventKind, TraceError};

/// How end-stream payloads are decompressed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decompressor {
    Codec(Compression),
    /// Treats every compressed message as empty.
    Broken,
}

impl Decompressor {
    fn from_encoding(encoding: &str) -> Self {
        match Compression::from_name(encoding) {
            Some(c) => Decompressor::Codec(c),
            None => Decompressor::Broken,
        }
    }

    fn decompress(self, data: &[u8]) -> Vec<u8> {
        match self {
            Decompressor::Codec(c) => compression::decompress(c, data, 0).unwrap_or_default(),
            Decompressor::Broken => Vec::new(),
        }
    }
}

/// Framing of a body, derived from its headers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BodyProperties {
    pub is_stream: bool,
    pub decompressor: Decompressor,
}

/// Decide from the headers whether a body is a stream of envelopes.
///
/// Whole-body compression hides the envelopes, so such bodies are opaque.
pub fn properties_from_headers(headers: &HeaderMap) -> BodyProperties {
    let opaque = BodyProperties {
        is_stream: false,
        decompressor: Decompressor::Broken,
    };
    let get = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
    };
    if !get(CONTENT_ENCODING.as_str()).is_empty() {
        return opaque;
    }
    let content_type = get("content-type").to_ascii_lowercase();
    let encoding = if content_type.starts_with("application/connect") {
        get("connect-content-encoding")
    } else if content_type.starts_with("application/grpc") {
        get("grpc-encoding")
    } else {
        return opaque;
    };
    BodyProperties {
        is_stream: true,
        decompressor: Decompressor::from_encoding(encoding),
    }
}

enum TapState {
    Prefix(Vec<u8>),
    Payload {
        env: Envelope,
        seen: u32,
        end_stream: Option<Vec<u8>>,
    },
}

/// Tracks envelope boundaries in one direction of a body.
pub struct DataTap {
    direction: Direction,
    props: BodyProperties,
    state: TapState,
    opaque_len: u64,
}

impl DataTap {
    pub fn new(direction: Direction, props: BodyProperties) -> Self {
        DataTap {
            direction,
            props,
            state: TapState::Prefix(Vec::with_capacity(PREFIX_LEN)),
            opaque_len: 0,
        }
    }

    fn data_event(&self, envelope: Option<Envelope>, len: u64) -> EventKind {
        // the builder assigns the real index
        match self.direction {
            Direction::Request => EventKind::RequestBodyData {
                envelope,
                len,
                message_index: 0,
            },
            Direction::Response => EventKind::ResponseBodyData {
                envelope,
                len,
                message_index: 0,
            },
        }
    }

    /// Consume `data`, returning the events for every message it completes.
    pub fn feed(&mut self, mut data: &[u8]) -> Vec<EventKind> {
        let mut events = Vec::new();
        if !self.props.is_stream {
            self.opaque_len += data.len() as u64;
            return events;
        }
        while !data.is_empty() {
            match &mut self.state {
                TapState::Prefix(prefix) => {
                    let take = (PREFIX_LEN - prefix.len()).min(data.len());
                    prefix.extend_from_slice(&data[..take]);
                    data = &data[take..];
                    if prefix.len() < PREFIX_LEN {
                        break;
                    }
                    let mut raw = [0u8; PREFIX_LEN];
                    raw.copy_from_slice(prefix);
                    let env = Envelope::parse(raw);
                    if env.len == 0 {
                        events.push(self.data_event(Some(env), 0));
                        self.state = TapState::Prefix(Vec::with_capacity(PREFIX_LEN));
                        continue;
                    }
                    let end_stream = (self.direction == Direction::Response
                        && env.flags & END_STREAM_MASK != 0)
                        .then(|| Vec::with_capacity(env.len as usize));
                    self.state = TapState::Payload {
                        env,
                        seen: 0,
                        end_stream,
                    };
                }
                TapState::Payload {
                    env,
                    seen,
                    end_stream,
                } => {
                    let need = (env.len - *seen) as usize;
                    let take = need.min(data.len());
                    if let Some(buf) = end_stream.as_mut() {
                        buf.extend_from_slice(&data[..take]);
                    }
                    *seen += take as u32;
                    data = &data[take..];
                    if take < need {
                        break;
                    }
                    let env = *env;
                    let content = end_stream.take();
                    events.push(self.data_event(Some(env), env.len as u64));
                    if let Some(raw) = content {
                        let content = if env.is_compressed() {
                            self.props.decompressor.decompress(&raw)
                        } else {
                            raw
                        };
                        if !content.is_empty() {
                            events.push(EventKind::ResponseBodyEndStream {
                                content: String::from_utf8_lossy(&content).into_owned(),
                            });
                        }
                    }
                    self.state = TapState::Prefix(Vec::with_capacity(PREFIX_LEN));
                }
            }
        }
        events
    }

    /// The event for a message that was cut short, if any. Resets the tap.
    pub fn unfinished(&mut self) -> Option<EventKind> {
        let state = std::mem::replace(
            &mut self.state,
            TapState::Prefix(Vec::with_capacity(PREFIX_LEN)),
        );
        let opaque = std::mem::take(&mut self.opaque_len);
        let (envelope, len) = match state {
            TapState::Prefix(prefix) if !prefix.is_empty() => (None, prefix.len() as u64),
            TapState::Prefix(_) => (None, opaque),
            TapState::Payload { env, seen, .. } => (Some(env), seen as u64),
        };
        (len > 0).then(|| self.data_event(envelope, len))
    }
}

/// A body that reports what flows through it to a [`Builder`].
///
/// Reaching the end of the body records the direction's body end event.
/// Dropping it early records "body closed before fully consumed".
pub struct TracingBody {
    inner: Body,
    direction: Direction,
    tap: DataTap,
    builder: Arc<Builder>,
    finished: bool,
    when_done: Option<CancellationToken>,
}

impl TracingBody {
    pub fn new(
        inner: Body,
        direction: Direction,
        props: BodyProperties,
        builder: Arc<Builder>,
    ) -> Self {
        TracingBody {
            inner,
            direction,
            tap: DataTap::new(direction, props),
            builder,
            finished: false,
            when_done: None,
        }
    }

    /// Cancel `token` once the body is finished.
    pub fn with_done_token(mut self, token: CancellationToken) -> Self {
        self.when_done = Some(token);
        self
    }

    fn finish(&mut self, err: Option<TraceError>) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Some(ev) = self.tap.unfinished() {
            self.builder.add(ev);
        }
        self.builder.add(match self.direction {
            Direction::Request => EventKind::RequestBodyEnd { err },
            Direction::Response => EventKind::ResponseBodyEnd { err },
        });
        if let Some(token) = self.when_done.take() {
            token.cancel();
        }
    }
}

impl HttpBody for TracingBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => {
                this.finish(None);
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(err))) => {
                this.finish(Some(TraceError::other(&err)));
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    for ev in this.tap.feed(data) {
                        this.builder.add(ev);
                    }
                } else if let Some(trailers) = frame.trailers_ref() {
                    this.builder.set_trailers(this.direction, trailers.clone());
                }
                Poll::Ready(Some(Ok(frame)))
            }
        }
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for TracingBody {
    fn drop(&mut self) {
        self.finish(Some(TraceError::ClosedEarly));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use connectconf_wire::envelope::encode;
    use http::HeaderValue;

    fn stream_props() -> BodyProperties {
        BodyProperties {
            is_stream: true,
            decompressor: Decompressor::Codec(Compression::Identity),
        }
    }

    fn lens(events: &[EventKind]) -> Vec<(Option<u8>, u64)> {
        events
            .iter()
            .filter_map(|ev| match ev {
                EventKind::ResponseBodyData { envelope, len, .. }
                | EventKind::RequestBodyData { envelope, len, .. } => {
                    Some((envelope.map(|e| e.flags), *len))
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn properties() {
        let mut headers = HeaderMap::new();
        assert!(!properties_from_headers(&headers).is_stream);

        headers.insert("content-type", HeaderValue::from_static("application/connect+json"));
        headers.insert("connect-content-encoding", HeaderValue::from_static("gzip"));
        let props = properties_from_headers(&headers);
        assert!(props.is_stream);
        assert_eq!(props.decompressor, Decompressor::Codec(Compression::Gzip));

        headers.insert("content-type", HeaderValue::from_static("application/grpc-web+proto"));
        headers.insert("grpc-encoding", HeaderValue::from_static("lz4"));
        assert_eq!(properties_from_headers(&headers).decompressor, Decompressor::Broken);

        headers.insert("content-encoding", HeaderValue::from_static("gzip"));
        assert!(!properties_from_headers(&headers).is_stream);
    }

    #[test]
    fn byte_at_a_time_stream() {
        let mut body = encode(0, b"hello").to_vec();
        body.extend_from_slice(&encode(0, b""));
        body.extend_from_slice(&encode(2, br#"{"error":{"code":6,"message":"foo"}}"#));

        let mut tap = DataTap::new(Direction::Response, stream_props());
        let mut events = Vec::new();
        for b in &body {
            events.extend(tap.feed(std::slice::from_ref(b)));
        }
        assert!(tap.unfinished().is_none());
        assert_eq!(lens(&events), [(Some(0), 5), (Some(0), 0), (Some(2), 36)]);
        match events.last() {
            Some(EventKind::ResponseBodyEndStream { content }) => {
                assert_eq!(content, r#"{"error":{"code":6,"message":"foo"}}"#)
            }
            other => panic!("expected end stream, got {other:?}"),
        }
    }

    #[test]
    fn requests_never_capture_end_stream() {
        let mut tap = DataTap::new(Direction::Request, stream_props());
        let events = tap.feed(&encode(0x80, b"grpc-status: 0\r\n"));
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn compressed_end_stream_is_decompressed() {
        let trailers = b"grpc-status: 0\r\n";
        let compressed = compression::compress(Compression::Snappy, trailers).unwrap();
        let props = BodyProperties {
            is_stream: true,
            decompressor: Decompressor::Codec(Compression::Snappy),
        };
        let mut tap = DataTap::new(Direction::Response, props);
        let events = tap.feed(&encode(0x81, &compressed));
        match &events[1] {
            EventKind::ResponseBodyEndStream { content } => assert_eq!(content, "grpc-status: 0\r\n"),
            other => panic!("unexpected {other:?}"),
        }

        let props = BodyProperties {
            is_stream: true,
            decompressor: Decompressor::Broken,
        };
        let mut tap = DataTap::new(Direction::Response, props);
        assert_eq!(tap.feed(&encode(0x81, &compressed)).len(), 1);
    }

    #[test]
    fn partial_prefix_and_partial_message() {
        let mut tap = DataTap::new(Direction::Response, stream_props());
        assert!(tap.feed(&[0, 0, 0]).is_empty());
        assert_eq!(lens(&[tap.unfinished().unwrap()]), [(None, 3)]);

        let full = encode(0, b"0123456789");
        assert!(tap.feed(&full[..9]).is_empty());
        assert_eq!(lens(&[tap.unfinished().unwrap()]), [(Some(0), 4)]);
        assert!(tap.unfinished().is_none());
    }

    #[test]
    fn opaque_bodies_are_counted() {
        let props = BodyProperties {
            is_stream: false,
            decompressor: Decompressor::Broken,
        };
        let mut tap = DataTap::new(Direction::Request, props);
        assert!(tap.feed(b"{\"a\":").is_empty());
        assert!(tap.feed(b"1}").is_empty());
        assert_eq!(lens(&[tap.unfinished().unwrap()]), [(None, 7)]);
    }
}
