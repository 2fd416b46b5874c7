//! Tracing of raw HTTP/2 connections.
//!
//! [`TracingHttp2Conn`] wraps the clear-text side of a connection and runs a
//! frame parser over each direction. Every stream gets its own [`Builder`],
//! so this sees all streams of a connection, including attempts an HTTP/2
//! client retries on its own.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode, Uri, Version};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::task::JoinHandle;

use crate::builder::{Builder, Collector, Direction};
use crate::tap::{DataTap, properties_from_headers};
use crate::trace::{EventKind, RequestInfo, ResponseInfo, Trace, TraceError, content_length};

const FRAME_HEADER_LEN: usize = 9;

/// The fixed bytes a client sends before its first frame.
pub const CLIENT_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// How long a trace that ended in a retryable error is held back, waiting
/// for the client to retry.
pub const RETRY_WAIT: Duration = Duration::from_secs(3);

const FRAME_DATA: u8 = 0x0;
const FRAME_HEADERS: u8 = 0x1;
const FRAME_RST_STREAM: u8 = 0x3;
const FRAME_GOAWAY: u8 = 0x7;
const FRAME_CONTINUATION: u8 = 0x9;

const FLAG_END_STREAM: u8 = 0x1;
const FLAG_END_HEADERS: u8 = 0x4;
const FLAG_PADDED: u8 = 0x8;
const FLAG_PRIORITY: u8 = 0x20;

/// An HTTP/2 error code (RFC 9113 §7).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    pub const NO_ERROR: ErrorCode = ErrorCode(0x0);
    pub const PROTOCOL_ERROR: ErrorCode = ErrorCode(0x1);
    pub const INTERNAL_ERROR: ErrorCode = ErrorCode(0x2);
    pub const FLOW_CONTROL_ERROR: ErrorCode = ErrorCode(0x3);
    pub const SETTINGS_TIMEOUT: ErrorCode = ErrorCode(0x4);
    pub const STREAM_CLOSED: ErrorCode = ErrorCode(0x5);
    pub const FRAME_SIZE_ERROR: ErrorCode = ErrorCode(0x6);
    pub const REFUSED_STREAM: ErrorCode = ErrorCode(0x7);
    pub const CANCEL: ErrorCode = ErrorCode(0x8);
    pub const COMPRESSION_ERROR: ErrorCode = ErrorCode(0x9);
    pub const CONNECT_ERROR: ErrorCode = ErrorCode(0xa);
    pub const ENHANCE_YOUR_CALM: ErrorCode = ErrorCode(0xb);
    pub const INADEQUATE_SECURITY: ErrorCode = ErrorCode(0xc);
    pub const HTTP_1_1_REQUIRED: ErrorCode = ErrorCode(0xd);

    fn name(self) -> Option<&'static str> {
        Some(match self.0 {
            0x0 => "NO_ERROR",
            0x1 => "PROTOCOL_ERROR",
            0x2 => "INTERNAL_ERROR",
            0x3 => "FLOW_CONTROL_ERROR",
            0x4 => "SETTINGS_TIMEOUT",
            0x5 => "STREAM_CLOSED",
            0x6 => "FRAME_SIZE_ERROR",
            0x7 => "REFUSED_STREAM",
            0x8 => "CANCEL",
            0x9 => "COMPRESSION_ERROR",
            0xa => "CONNECT_ERROR",
            0xb => "ENHANCE_YOUR_CALM",
            0xc => "INADEQUATE_SECURITY",
            0xd => "HTTP_1_1_REQUIRED",
            _ => return None,
        })
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "unknown error code 0x{:x}", self.0),
        }
    }
}

// ============================================================================
// Frame parsing
// ============================================================================

#[derive(Debug)]
enum Http2Frame {
    Headers {
        stream_id: u32,
        fields: Vec<(String, String)>,
        end_stream: bool,
    },
    Data {
        stream_id: u32,
        data: Vec<u8>,
        end_stream: bool,
    },
    RstStream {
        stream_id: u32,
        code: ErrorCode,
    },
    GoAway {
        last_stream_id: u32,
        code: ErrorCode,
    },
}

#[derive(Clone, Copy, Debug)]
struct FrameHeader {
    len: u32,
    kind: u8,
    flags: u8,
    stream_id: u32,
}

impl FrameHeader {
    fn parse(raw: &[u8]) -> Self {
        FrameHeader {
            len: u32::from_be_bytes([0, raw[0], raw[1], raw[2]]),
            kind: raw[3],
            flags: raw[4],
            stream_id: u32::from_be_bytes([raw[5], raw[6], raw[7], raw[8]]) & 0x7fff_ffff,
        }
    }

    fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

/// A header block split over HEADERS and CONTINUATION frames.
struct PendingHeaders {
    stream_id: u32,
    end_stream: bool,
    block: Vec<u8>,
}

/// Malformed input; the direction stops being traced.
#[derive(Debug)]
struct Broken;

/// Parses the frames of one direction of a connection.
struct FrameTracer {
    decoder: loona_hpack::Decoder<'static>,
    preface: Option<Vec<u8>>,
    broken: bool,
    header: Vec<u8>,
    current: Option<FrameHeader>,
    payload: Vec<u8>,
    pending_headers: Option<PendingHeaders>,
}

impl FrameTracer {
    fn new(expect_preface: bool) -> Self {
        FrameTracer {
            decoder: loona_hpack::Decoder::new(),
            preface: expect_preface.then(|| Vec::with_capacity(CLIENT_PREFACE.len())),
            broken: false,
            header: Vec::with_capacity(FRAME_HEADER_LEN),
            current: None,
            payload: Vec::new(),
            pending_headers: None,
        }
    }

    fn feed(&mut self, mut data: &[u8]) -> Vec<Http2Frame> {
        let mut frames = Vec::new();
        while !data.is_empty() && !self.broken {
            if let Some(preface) = self.preface.as_mut() {
                let take = (CLIENT_PREFACE.len() - preface.len()).min(data.len());
                preface.extend_from_slice(&data[..take]);
                data = &data[take..];
                if preface.len() < CLIENT_PREFACE.len() {
                    break;
                }
                if preface.as_slice() != CLIENT_PREFACE {
                    self.broken = true;
                    break;
                }
                self.preface = None;
                continue;
            }

            let header = match self.current {
                Some(header) => header,
                None => {
                    let take = (FRAME_HEADER_LEN - self.header.len()).min(data.len());
                    self.header.extend_from_slice(&data[..take]);
                    data = &data[take..];
                    if self.header.len() < FRAME_HEADER_LEN {
                        break;
                    }
                    let header = FrameHeader::parse(&self.header);
                    self.header.clear();
                    self.current = Some(header);
                    header
                }
            };
            let need = header.len as usize - self.payload.len();
            let take = need.min(data.len());
            self.payload.extend_from_slice(&data[..take]);
            data = &data[take..];
            if take < need {
                break;
            }
            self.current = None;
            let payload = std::mem::take(&mut self.payload);
            match self.parse(header, payload) {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => {}
                Err(Broken) => self.broken = true,
            }
        }
        frames
    }

    fn parse(&mut self, header: FrameHeader, payload: Vec<u8>) -> Result<Option<Http2Frame>, Broken> {
        if self.pending_headers.is_some() && header.kind != FRAME_CONTINUATION {
            return Err(Broken);
        }
        match header.kind {
            FRAME_DATA => Ok(Some(Http2Frame::Data {
                stream_id: header.stream_id,
                data: unpad(&header, &payload)?.to_vec(),
                end_stream: header.has(FLAG_END_STREAM),
            })),
            FRAME_HEADERS => {
                let mut block = unpad(&header, &payload)?;
                if header.has(FLAG_PRIORITY) {
                    block = block.get(5..).ok_or(Broken)?;
                }
                let pending = PendingHeaders {
                    stream_id: header.stream_id,
                    end_stream: header.has(FLAG_END_STREAM),
                    block: block.to_vec(),
                };
                if header.has(FLAG_END_HEADERS) {
                    return self.decode(pending).map(Some);
                }
                self.pending_headers = Some(pending);
                Ok(None)
            }
            FRAME_CONTINUATION => {
                let mut pending = self.pending_headers.take().ok_or(Broken)?;
                if pending.stream_id != header.stream_id {
                    return Err(Broken);
                }
                pending.block.extend_from_slice(&payload);
                if header.has(FLAG_END_HEADERS) {
                    return self.decode(pending).map(Some);
                }
                self.pending_headers = Some(pending);
                Ok(None)
            }
            FRAME_RST_STREAM => {
                let code: [u8; 4] = payload.as_slice().try_into().map_err(|_| Broken)?;
                Ok(Some(Http2Frame::RstStream {
                    stream_id: header.stream_id,
                    code: ErrorCode(u32::from_be_bytes(code)),
                }))
            }
            FRAME_GOAWAY => {
                if payload.len() < 8 {
                    return Err(Broken);
                }
                let last = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                let code = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
                Ok(Some(Http2Frame::GoAway {
                    last_stream_id: last & 0x7fff_ffff,
                    code: ErrorCode(code),
                }))
            }
            _ => Ok(None),
        }
    }

    fn decode(&mut self, pending: PendingHeaders) -> Result<Http2Frame, Broken> {
        let mut fields = Vec::new();
        self.decoder
            .decode_with_cb(&pending.block, |name, value| {
                fields.push((
                    String::from_utf8_lossy(&name).into_owned(),
                    String::from_utf8_lossy(&value).into_owned(),
                ));
            })
            .map_err(|_| Broken)?;
        Ok(Http2Frame::Headers {
            stream_id: pending.stream_id,
            fields,
            end_stream: pending.end_stream,
        })
    }
}

fn unpad<'a>(header: &FrameHeader, payload: &'a [u8]) -> Result<&'a [u8], Broken> {
    if !header.has(FLAG_PADDED) {
        return Ok(payload);
    }
    let (&pad, rest) = payload.split_first().ok_or(Broken)?;
    let end = rest.len().checked_sub(pad as usize).ok_or(Broken)?;
    Ok(&rest[..end])
}

fn pseudo<'a>(fields: &'a [(String, String)], name: &str) -> &'a str {
    fields
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.as_str())
        .unwrap_or_default()
}

fn regular_headers(fields: &[(String, String)]) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(fields.len());
    for (name, value) in fields {
        if name.starts_with(':') {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.append(name, value);
        }
    }
    headers
}

fn make_request(fields: &[(String, String)]) -> RequestInfo {
    let path = pseudo(fields, ":path");
    let uri = Uri::builder()
        .scheme(pseudo(fields, ":scheme"))
        .authority(pseudo(fields, ":authority"))
        .path_and_query(path)
        .build()
        .or_else(|_| path.parse())
        .unwrap_or_default();
    RequestInfo {
        method: Method::from_bytes(pseudo(fields, ":method").as_bytes()).unwrap_or_default(),
        uri,
        version: Version::HTTP_2,
        headers: regular_headers(fields),
        trailers: HeaderMap::new(),
    }
}

fn make_response(fields: &[(String, String)]) -> ResponseInfo {
    let status = pseudo(fields, ":status")
        .parse::<u16>()
        .ok()
        .and_then(|s| StatusCode::from_u16(s).ok())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let headers = regular_headers(fields);
    ResponseInfo {
        status,
        version: Version::HTTP_2,
        content_length: content_length(&headers),
        headers,
        trailers: HeaderMap::new(),
    }
}

// ============================================================================
// Connection state
// ============================================================================

struct Http2Stream {
    builder: Arc<Builder>,
    request_tap: DataTap,
    response_tap: Option<DataTap>,
}

impl Http2Stream {
    fn emit_unfinished(&mut self) {
        if let Some(ev) = self.request_tap.unfinished() {
            self.builder.add(ev);
        }
        if let Some(ev) = self.response_tap.as_mut().and_then(DataTap::unfinished) {
            self.builder.add(ev);
        }
    }

    /// End the response side with `err`, whether or not it started.
    fn fail(&mut self, err: TraceError) {
        self.emit_unfinished();
        if self.response_tap.is_some() {
            self.builder.add(EventKind::ResponseBodyEnd { err: Some(err) });
        } else {
            self.builder.add(EventKind::ResponseError { err });
        }
    }
}

struct ConnState {
    is_server: bool,
    collector: Arc<RetryCollector>,
    streams: HashMap<u32, Http2Stream>,
    max_stream_id: u32,
}

impl ConnState {
    fn handle(&mut self, frame: Http2Frame, is_request: bool) {
        match frame {
            Http2Frame::Headers {
                stream_id,
                fields,
                end_stream,
            } => {
                let is_new = if self.streams.contains_key(&stream_id) {
                    false
                } else if is_request && (self.max_stream_id == 0 || stream_id <= self.max_stream_id)
                {
                    self.new_stream(stream_id, &fields);
                    true
                } else {
                    return;
                };
                let Some(stream) = self.streams.get_mut(&stream_id) else {
                    return;
                };
                if !is_new {
                    if !is_request && stream.response_tap.is_none() {
                        let resp = make_response(&fields);
                        stream.response_tap = Some(DataTap::new(
                            Direction::Response,
                            properties_from_headers(&resp.headers),
                        ));
                        stream.builder.add(EventKind::ResponseStart(resp));
                    } else {
                        let direction = if is_request {
                            Direction::Request
                        } else {
                            Direction::Response
                        };
                        stream
                            .builder
                            .set_trailers(direction, regular_headers(&fields));
                    }
                }
                if end_stream {
                    self.close_stream(stream_id, is_request, None);
                }
            }
            Http2Frame::Data {
                stream_id,
                data,
                end_stream,
            } => {
                let Some(stream) = self.streams.get_mut(&stream_id) else {
                    return;
                };
                let tap = if is_request {
                    Some(&mut stream.request_tap)
                } else {
                    stream.response_tap.as_mut()
                };
                if let Some(tap) = tap {
                    for ev in tap.feed(&data) {
                        stream.builder.add(ev);
                    }
                }
                if end_stream {
                    self.close_stream(stream_id, is_request, None);
                }
            }
            Http2Frame::RstStream { stream_id, code } => {
                if self.streams.contains_key(&stream_id) {
                    self.close_stream(
                        stream_id,
                        is_request,
                        Some(TraceError::Stream { stream_id, code }),
                    );
                }
            }
            Http2Frame::GoAway {
                last_stream_id,
                code,
            } => {
                self.max_stream_id = last_stream_id;
                let refused: Vec<u32> = self
                    .streams
                    .keys()
                    .copied()
                    .filter(|id| *id > last_stream_id)
                    .collect();
                for id in refused {
                    if let Some(mut stream) = self.streams.remove(&id) {
                        stream.fail(TraceError::Connection(code));
                    }
                }
            }
        }
    }

    fn new_stream(&mut self, stream_id: u32, fields: &[(String, String)]) {
        let request = make_request(fields);
        let props = properties_from_headers(&request.headers);
        let test_name = request.test_name();
        let collector: Arc<dyn Collector> = self.collector.clone();
        let builder = Builder::new(request, !self.is_server, collector);
        self.collector.new_attempt(&test_name);
        self.streams.insert(
            stream_id,
            Http2Stream {
                builder,
                request_tap: DataTap::new(Direction::Request, props),
                response_tap: None,
            },
        );
    }

    fn close_stream(&mut self, stream_id: u32, is_request: bool, err: Option<TraceError>) {
        // the end of the response, or any error, ends the whole operation
        if !is_request || err.is_some() {
            let Some(mut stream) = self.streams.remove(&stream_id) else {
                return;
            };
            match err {
                Some(err) if !is_request => stream.fail(err),
                err if is_request => {
                    if let Some(ev) = stream.request_tap.unfinished() {
                        stream.builder.add(ev);
                    }
                    stream.builder.add(EventKind::RequestBodyEnd { err });
                }
                _ => {
                    stream.emit_unfinished();
                    if stream.response_tap.is_some() {
                        stream.builder.add(EventKind::ResponseBodyEnd { err: None });
                    }
                }
            }
            return;
        }
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            if let Some(ev) = stream.request_tap.unfinished() {
                stream.builder.add(ev);
            }
            stream.builder.add(EventKind::RequestBodyEnd { err: None });
        }
    }

    fn cancel_all(&mut self, err: TraceError) {
        for (_, mut stream) in self.streams.drain() {
            if self.is_server {
                stream.emit_unfinished();
                stream.builder.add(EventKind::ResponseBodyEnd {
                    err: Some(err.clone()),
                });
            } else {
                if let Some(ev) = stream.request_tap.unfinished() {
                    stream.builder.add(ev);
                }
                stream.builder.add(EventKind::RequestBodyEnd {
                    err: Some(err.clone()),
                });
                stream.builder.add(EventKind::RequestCanceled);
            }
        }
    }
}

/// A connection whose HTTP/2 traffic is traced.
///
/// The wrapped I/O must carry clear-text HTTP/2: wrap inside TLS, not
/// outside it. On a server connection, reads carry requests and writes
/// carry responses; on a client connection it is the other way around.
pub struct TracingHttp2Conn<IO> {
    io: IO,
    state: ConnState,
    read_tracer: FrameTracer,
    write_tracer: FrameTracer,
    /// Bytes at the front of the next write that were already traced.
    traced_ahead: usize,
}

impl<IO> TracingHttp2Conn<IO> {
    pub fn new(io: IO, is_server: bool, collector: Arc<dyn Collector>) -> Self {
        TracingHttp2Conn {
            io,
            state: ConnState {
                is_server,
                collector: RetryCollector::new(collector),
                streams: HashMap::new(),
                max_stream_id: 0,
            },
            read_tracer: FrameTracer::new(is_server),
            write_tracer: FrameTracer::new(!is_server),
            traced_ahead: 0,
        }
    }

    pub fn get_ref(&self) -> &IO {
        &self.io
    }

    fn trace(&mut self, data: &[u8], is_read: bool) {
        let is_request = is_read == self.state.is_server;
        let tracer = if is_read {
            &mut self.read_tracer
        } else {
            &mut self.write_tracer
        };
        for frame in tracer.feed(data) {
            self.state.handle(frame, is_request);
        }
    }

    fn cancel_all(&mut self, err: TraceError) {
        self.state.cancel_all(err);
        self.state.collector.cancel();
    }
}

impl<IO: AsyncRead + Unpin> AsyncRead for TracingHttp2Conn<IO> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let asked = buf.remaining();
        match Pin::new(&mut this.io).poll_read(cx, buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(())) => {
                let read = buf.filled()[before..].to_vec();
                if read.is_empty() && asked > 0 {
                    this.cancel_all(TraceError::other("EOF"));
                } else {
                    this.trace(&read, true);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(err)) => {
                // servers use read timeouts while waiting for the preface
                if err.kind() != io::ErrorKind::TimedOut {
                    this.cancel_all(TraceError::other(&err));
                }
                Poll::Ready(Err(err))
            }
        }
    }
}

impl<IO: AsyncWrite + Unpin> AsyncWrite for TracingHttp2Conn<IO> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        // Trace before writing: the peer may answer before this call returns.
        let skip = this.traced_ahead.min(data.len());
        this.trace(&data[skip..], false);
        this.traced_ahead = data.len();
        match Pin::new(&mut this.io).poll_write(cx, data) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(n)) => {
                this.traced_ahead -= n.min(this.traced_ahead);
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(err)) => {
                this.traced_ahead = 0;
                this.cancel_all(TraceError::other(&err));
                Poll::Ready(Err(err))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let res = Pin::new(&mut this.io).poll_shutdown(cx);
        match &res {
            Poll::Pending => {}
            Poll::Ready(Ok(())) => this.cancel_all(TraceError::other("socket closed")),
            Poll::Ready(Err(err)) => this.cancel_all(TraceError::other(format!("socket closed; {err}"))),
        }
        res
    }
}

// ============================================================================
// Retry collector
// ============================================================================

struct Waiting {
    trace: Trace,
    timer: JoinHandle<()>,
}

/// Holds back traces that ended in a retryable error.
///
/// If a new attempt with the same test name starts within [`RETRY_WAIT`],
/// the held trace is discarded. Otherwise it is delivered when the wait
/// lapses, or when the connection goes away.
pub struct RetryCollector {
    collector: Arc<dyn Collector>,
    me: Weak<RetryCollector>,
    waiting: Mutex<HashMap<String, Waiting>>,
}

impl RetryCollector {
    pub fn new(collector: Arc<dyn Collector>) -> Arc<Self> {
        Arc::new_cyclic(|me| RetryCollector {
            collector,
            me: me.clone(),
            waiting: Mutex::new(HashMap::new()),
        })
    }

    /// A new attempt for `test_name` started; a held trace is a retried one.
    pub fn new_attempt(&self, test_name: &str) {
        if let Some(held) = self.waiting.lock().remove(test_name) {
            tracing::debug!(test_name, "discarding trace of retried attempt");
            held.timer.abort();
        }
    }

    fn times_up(&self, test_name: &str) {
        let held = self.waiting.lock().remove(test_name);
        if let Some(held) = held {
            self.collector.complete(held.trace);
        }
    }

    /// No retries are coming: deliver everything held.
    pub fn cancel(&self) {
        let held: Vec<Waiting> = self.waiting.lock().drain().map(|(_, w)| w).collect();
        for w in held {
            w.timer.abort();
            self.collector.complete(w.trace);
        }
    }
}

impl Collector for RetryCollector {
    fn complete(&self, trace: Trace) {
        if trace.err.as_ref().is_some_and(TraceError::is_retryable) {
            let name = trace.test_name.clone();
            let me = self.me.clone();
            let timer = {
                let name = name.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(RETRY_WAIT).await;
                    if let Some(me) = me.upgrade() {
                        me.times_up(&name);
                    }
                })
            };
            if let Some(old) = self.waiting.lock().insert(name, Waiting { trace, timer }) {
                old.timer.abort();
            }
            return;
        }
        let held = self.waiting.lock().contains_key(&trace.test_name);
        if !held {
            self.collector.complete(trace);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use connectconf_wire::envelope::encode;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};

    type Sink = Arc<Mutex<Vec<Trace>>>;

    fn collecting() -> (Arc<dyn Collector>, Sink) {
        let traces: Sink = Arc::new(Mutex::new(Vec::new()));
        let sink = traces.clone();
        (Arc::new(move |t: Trace| sink.lock().push(t)), traces)
    }

    fn frame(kind: u8, flags: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
        let len = (payload.len() as u32).to_be_bytes();
        let mut out = vec![len[1], len[2], len[3], kind, flags];
        out.extend_from_slice(&stream_id.to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    /// Literal header fields without indexing, no Huffman coding.
    fn block(fields: &[(&str, &str)]) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, value) in fields {
            out.push(0x00);
            out.push(name.len() as u8);
            out.extend_from_slice(name.as_bytes());
            out.push(value.len() as u8);
            out.extend_from_slice(value.as_bytes());
        }
        out
    }

    fn request_headers(stream_id: u32, test_name: &str) -> Vec<u8> {
        frame(
            FRAME_HEADERS,
            FLAG_END_HEADERS,
            stream_id,
            &block(&[
                (":method", "POST"),
                (":scheme", "http"),
                (":authority", "127.0.0.1:8080"),
                (":path", "/connectrpc.conformance.v1.ConformanceService/Unary"),
                ("content-type", "application/grpc"),
                ("x-test-case-name", test_name),
            ]),
        )
    }

    async fn pass_through(from: &mut DuplexStream, to: &mut TracingHttp2Conn<DuplexStream>, bytes: &[u8]) {
        from.write_all(bytes).await.unwrap();
        let mut buf = vec![0u8; bytes.len()];
        to.read_exact(&mut buf).await.unwrap();
    }

    #[tokio::test]
    async fn server_conn_traces_a_grpc_call() {
        let (collector, traces) = collecting();
        let (mut client, server) = duplex(64 * 1024);
        let mut conn = TracingHttp2Conn::new(server, true, collector);

        let mut req = CLIENT_PREFACE.to_vec();
        req.extend(request_headers(1, "grpc-call"));
        req.extend(frame(FRAME_DATA, FLAG_END_STREAM, 1, &encode(0, b"abc")));
        pass_through(&mut client, &mut conn, &req).await;

        let mut resp = frame(
            FRAME_HEADERS,
            FLAG_END_HEADERS,
            1,
            &block(&[(":status", "200"), ("content-type", "application/grpc")]),
        );
        resp.extend(frame(FRAME_DATA, 0, 1, &encode(0, b"hello")));
        resp.extend(frame(
            FRAME_HEADERS,
            FLAG_END_HEADERS | FLAG_END_STREAM,
            1,
            &block(&[("grpc-status", "0")]),
        ));
        conn.write_all(&resp).await.unwrap();

        let traces = traces.lock();
        assert_eq!(traces.len(), 1);
        let t = &traces[0];
        assert_eq!(t.test_name, "grpc-call");
        assert_eq!(t.request.method, Method::POST);
        assert_eq!(
            t.request.uri.path(),
            "/connectrpc.conformance.v1.ConformanceService/Unary"
        );
        let resp = t.response.as_ref().unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.trailers["grpc-status"], "0");
        let kinds: Vec<&str> = t
            .events
            .iter()
            .map(|ev| match ev.kind {
                EventKind::RequestStart(_) => "req-start",
                EventKind::RequestBodyData { .. } => "req-data",
                EventKind::RequestBodyEnd { .. } => "req-end",
                EventKind::ResponseStart(_) => "resp-start",
                EventKind::ResponseBodyData { .. } => "resp-data",
                EventKind::ResponseBodyEnd { .. } => "resp-end",
                _ => "other",
            })
            .collect();
        assert_eq!(
            kinds,
            ["req-start", "req-data", "req-end", "resp-start", "resp-data", "resp-end"]
        );
    }

    #[tokio::test]
    async fn missing_status_defaults_to_500() {
        let (collector, traces) = collecting();
        let (mut client, server) = duplex(64 * 1024);
        let mut conn = TracingHttp2Conn::new(server, true, collector);

        let mut req = CLIENT_PREFACE.to_vec();
        req.extend(request_headers(1, "no-status"));
        pass_through(&mut client, &mut conn, &req).await;
        conn.write_all(&frame(
            FRAME_HEADERS,
            FLAG_END_HEADERS | FLAG_END_STREAM,
            1,
            &block(&[("content-type", "application/grpc")]),
        ))
        .await
        .unwrap();

        let traces = traces.lock();
        assert_eq!(
            traces[0].response.as_ref().unwrap().status,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn bad_preface_stops_tracing() {
        let (collector, traces) = collecting();
        let (mut client, server) = duplex(64 * 1024);
        let mut conn = TracingHttp2Conn::new(server, true, collector);
        let mut req = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n".to_vec();
        req.extend(request_headers(1, "ignored"));
        pass_through(&mut client, &mut conn, &req).await;
        conn.shutdown().await.unwrap();
        assert!(traces.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn refused_stream_is_dropped_when_retried() {
        let (collector, traces) = collecting();
        let (client, mut server) = duplex(64 * 1024);
        let mut conn = TracingHttp2Conn::new(client, false, collector);

        let mut req = CLIENT_PREFACE.to_vec();
        req.extend(request_headers(1, "retried"));
        conn.write_all(&req).await.unwrap();
        let refused = frame(
            FRAME_RST_STREAM,
            0,
            1,
            &ErrorCode::REFUSED_STREAM.0.to_be_bytes(),
        );
        pass_through(&mut server, &mut conn, &refused).await;
        assert!(traces.lock().is_empty());

        // the client retries on a new stream
        let mut retry = request_headers(3, "retried");
        retry.extend(frame(FRAME_DATA, FLAG_END_STREAM, 3, &[]));
        conn.write_all(&retry).await.unwrap();
        let resp = frame(
            FRAME_HEADERS,
            FLAG_END_HEADERS | FLAG_END_STREAM,
            3,
            &block(&[(":status", "200"), ("grpc-status", "0")]),
        );
        pass_through(&mut server, &mut conn, &resp).await;

        tokio::time::sleep(RETRY_WAIT * 2).await;
        let traces = traces.lock();
        assert_eq!(traces.len(), 1);
        assert!(traces[0].err.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn refused_stream_is_delivered_after_the_wait() {
        let (collector, traces) = collecting();
        let (client, mut server) = duplex(64 * 1024);
        let mut conn = TracingHttp2Conn::new(client, false, collector);

        let mut req = CLIENT_PREFACE.to_vec();
        req.extend(request_headers(1, "not-retried"));
        conn.write_all(&req).await.unwrap();
        let refused = frame(
            FRAME_RST_STREAM,
            0,
            1,
            &ErrorCode::REFUSED_STREAM.0.to_be_bytes(),
        );
        pass_through(&mut server, &mut conn, &refused).await;
        assert!(traces.lock().is_empty());

        tokio::time::sleep(RETRY_WAIT + Duration::from_millis(10)).await;
        let traces = traces.lock();
        assert_eq!(traces.len(), 1);
        assert_eq!(
            traces[0].err,
            Some(TraceError::Stream {
                stream_id: 1,
                code: ErrorCode::REFUSED_STREAM
            })
        );
    }

    #[tokio::test]
    async fn goaway_closes_later_streams() {
        let (collector, traces) = collecting();
        let (mut client, server) = duplex(64 * 1024);
        let mut conn = TracingHttp2Conn::new(server, true, collector);

        let mut req = CLIENT_PREFACE.to_vec();
        req.extend(request_headers(1, "kept"));
        req.extend(request_headers(3, "dropped"));
        pass_through(&mut client, &mut conn, &req).await;

        let mut goaway = 1u32.to_be_bytes().to_vec();
        goaway.extend_from_slice(&ErrorCode::PROTOCOL_ERROR.0.to_be_bytes());
        conn.write_all(&frame(FRAME_GOAWAY, 0, 0, &goaway)).await.unwrap();

        {
            let traces = traces.lock();
            assert_eq!(traces.len(), 1);
            assert_eq!(traces[0].test_name, "dropped");
            assert_eq!(
                traces[0].err,
                Some(TraceError::Connection(ErrorCode::PROTOCOL_ERROR))
            );
        }

        // closing the socket finishes whatever is left
        conn.shutdown().await.unwrap();
        let traces = traces.lock();
        assert_eq!(traces.len(), 2);
        assert_eq!(traces[1].test_name, "kept");
        assert_eq!(traces[1].err, Some(TraceError::other("socket closed")));
    }

    #[test]
    fn continuation_frames_are_joined() {
        let mut tracer = FrameTracer::new(false);
        let fields = block(&[(":status", "204"), ("x-long", "value")]);
        let (first, rest) = fields.split_at(4);
        let mut bytes = frame(FRAME_HEADERS, 0, 5, first);
        bytes.extend(frame(FRAME_CONTINUATION, FLAG_END_HEADERS, 5, rest));
        let frames = tracer.feed(&bytes);
        match &frames[..] {
            [Http2Frame::Headers { stream_id: 5, fields, end_stream: false }] => {
                assert_eq!(fields[1], ("x-long".to_string(), "value".to_string()));
            }
            other => panic!("unexpected frames: {other:?}"),
        }
    }

    #[test]
    fn error_code_names() {
        assert_eq!(ErrorCode::REFUSED_STREAM.to_string(), "REFUSED_STREAM");
        assert_eq!(ErrorCode(0x42).to_string(), "unknown error code 0x42");
    }
}
