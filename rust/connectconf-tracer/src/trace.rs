//! The trace model: one HTTP operation attempt as an ordered list of events.

use std::fmt::Write as _;
use std::time::Duration;

use http::{HeaderMap, Method, Request, Response, StatusCode, Uri, Version};

use connectconf_wire::Printer;
use connectconf_wire::envelope::Envelope;
use connectconf_wire::headers::TEST_CASE_NAME;

use crate::http2::ErrorCode;

const REQUEST_PREFIX: &str = " request>";
const RESPONSE_PREFIX: &str = "response<";

/// The request side of a trace, captured by value.
#[derive(Clone, Debug)]
pub struct RequestInfo {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub trailers: HeaderMap,
}

impl RequestInfo {
    pub fn from_request<B>(req: &Request<B>) -> Self {
        RequestInfo {
            method: req.method().clone(),
            uri: req.uri().clone(),
            version: req.version(),
            headers: req.headers().clone(),
            trailers: HeaderMap::new(),
        }
    }

    /// Value of the test case name header, or empty.
    pub fn test_name(&self) -> String {
        self.headers
            .get(TEST_CASE_NAME)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    }
}

/// The response side of a trace, captured by value.
#[derive(Clone, Debug)]
pub struct ResponseInfo {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
    pub trailers: HeaderMap,
    pub content_length: Option<u64>,
}

impl ResponseInfo {
    pub fn from_response<B>(resp: &Response<B>) -> Self {
        ResponseInfo {
            status: resp.status(),
            version: resp.version(),
            headers: resp.headers().clone(),
            trailers: HeaderMap::new(),
            content_length: content_length(resp.headers()),
        }
    }
}

pub(crate) fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Terminal error of a trace.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TraceError {
    #[error("context canceled")]
    Canceled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    #[error("body closed before fully consumed")]
    ClosedEarly,

    #[error("stream error: stream ID {stream_id}; {code}")]
    Stream { stream_id: u32, code: ErrorCode },

    #[error("connection error: {0}")]
    Connection(ErrorCode),

    #[error("{0}")]
    Other(String),
}

impl TraceError {
    pub fn other(err: impl std::fmt::Display) -> Self {
        TraceError::Other(err.to_string())
    }

    /// Whether an HTTP/2 client may transparently retry after this error:
    /// the server refused the stream, or it is shutting down gracefully.
    pub fn is_retryable(&self) -> bool {
        match self {
            TraceError::Stream { code, .. } => *code == ErrorCode::REFUSED_STREAM,
            TraceError::Connection(code) => *code == ErrorCode::NO_ERROR,
            _ => false,
        }
    }
}

/// One observed step of an HTTP operation.
#[derive(Clone, Debug)]
pub struct Event {
    /// Time since the request started.
    pub offset: Duration,
    pub kind: EventKind,
}

#[derive(Clone, Debug)]
pub enum EventKind {
    RequestStart(RequestInfo),
    /// A whole request message, or what was seen of it. `envelope` is `None`
    /// for opaque bodies and for a partial envelope prefix.
    RequestBodyData {
        envelope: Option<Envelope>,
        len: u64,
        message_index: usize,
    },
    RequestBodyEnd {
        err: Option<TraceError>,
    },
    ResponseStart(ResponseInfo),
    ResponseError {
        err: TraceError,
    },
    ResponseBodyData {
        envelope: Option<Envelope>,
        len: u64,
        message_index: usize,
    },
    /// Decoded payload of a Connect end-stream message or gRPC-Web trailers.
    ResponseBodyEndStream {
        content: String,
    },
    ResponseBodyEnd {
        err: Option<TraceError>,
    },
    RequestCanceled,
}

impl EventKind {
    pub fn is_response_data(&self) -> bool {
        matches!(self, EventKind::ResponseBodyData { .. })
    }
}

/// The activity of a single HTTP operation.
#[derive(Clone, Debug)]
pub struct Trace {
    pub test_name: String,
    pub request: RequestInfo,
    pub response: Option<ResponseInfo>,
    pub err: Option<TraceError>,
    pub events: Vec<Event>,
}

impl Trace {
    /// Content of the end-stream message, if one was seen.
    pub fn end_stream_content(&self) -> Option<&str> {
        self.events.iter().find_map(|ev| match &ev.kind {
            EventKind::ResponseBodyEndStream { content } => Some(content.as_str()),
            _ => None,
        })
    }

    /// Render the trace, one line per call.
    pub fn print(&self, p: &dyn Printer) {
        for event in &self.events {
            print_event(event, p);
        }
        if let Some(resp) = &self.response
            && !resp.trailers.is_empty()
        {
            p.printf(format_args!("{RESPONSE_PREFIX}"));
            print_headers(RESPONSE_PREFIX, &resp.trailers, p);
        }
    }
}

fn millis(offset: Duration) -> f64 {
    offset.as_secs_f64() * 1000.0
}

fn print_event(event: &Event, p: &dyn Printer) {
    let ms = millis(event.offset);
    match &event.kind {
        EventKind::RequestStart(req) => {
            p.printf(format_args!(
                "{REQUEST_PREFIX} {ms:9.3}ms {} {} {:?}",
                req.method,
                display_uri(&req.uri),
                req.version
            ));
            print_headers(REQUEST_PREFIX, &req.headers, p);
            p.printf(format_args!("{REQUEST_PREFIX}"));
        }
        EventKind::RequestBodyData {
            envelope,
            len,
            message_index,
        } => print_data(REQUEST_PREFIX, ms, *message_index, *envelope, *len, p),
        EventKind::RequestBodyEnd { err } => print_end(REQUEST_PREFIX, ms, err.as_ref(), p),
        EventKind::ResponseStart(resp) => {
            p.printf(format_args!("{RESPONSE_PREFIX} {ms:9.3}ms {}", resp.status));
            print_headers(RESPONSE_PREFIX, &resp.headers, p);
            p.printf(format_args!("{RESPONSE_PREFIX}"));
        }
        EventKind::ResponseError { err } => {
            p.printf(format_args!("{RESPONSE_PREFIX} {ms:9.3}ms failed: {err}"));
        }
        EventKind::ResponseBodyData {
            envelope,
            len,
            message_index,
        } => print_data(RESPONSE_PREFIX, ms, *message_index, *envelope, *len, p),
        EventKind::ResponseBodyEndStream { content } => {
            for line in content.split('\n') {
                let line = line.trim_matches('\r');
                p.printf(format_args!("{RESPONSE_PREFIX} {:11}   eos: {line}", ""));
            }
        }
        EventKind::ResponseBodyEnd { err } => print_end(RESPONSE_PREFIX, ms, err.as_ref(), p),
        EventKind::RequestCanceled => {
            p.printf(format_args!("{REQUEST_PREFIX} {ms:9.3}ms canceled"));
        }
    }
}

fn display_uri(uri: &Uri) -> String {
    if uri.authority().is_some() {
        return uri.to_string();
    }
    let mut out = String::from("http://...");
    let _ = write!(
        out,
        "{}",
        uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
    );
    out
}

fn print_headers(prefix: &str, headers: &HeaderMap, p: &dyn Printer) {
    let mut names: Vec<_> = headers.keys().collect();
    names.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    for name in names {
        for value in headers.get_all(name) {
            p.printf(format_args!(
                "{prefix} {:11} {name}: {}",
                "",
                String::from_utf8_lossy(value.as_bytes())
            ));
        }
    }
}

fn print_data(
    prefix: &str,
    ms: f64,
    index: usize,
    envelope: Option<Envelope>,
    len: u64,
    p: &dyn Printer,
) {
    let n = index + 1;
    match envelope {
        Some(env) => {
            p.printf(format_args!(
                "{prefix} {ms:9.3}ms message #{n}: prefix: flags={}, len={}",
                env.flags, env.len
            ));
            if len > 0 {
                p.printf(format_args!(
                    "{prefix} {:11} message #{n}: data: {len}/{} bytes",
                    "", env.len
                ));
            }
        }
        None => p.printf(format_args!(
            "{prefix} {ms:9.3}ms message #{n}: data: {len} bytes"
        )),
    }
}

fn print_end(prefix: &str, ms: f64, err: Option<&TraceError>, p: &dyn Printer) {
    match err {
        Some(err) => p.printf(format_args!("{prefix} {ms:9.3}ms body end (err={err})")),
        None => p.printf(format_args!("{prefix} {ms:9.3}ms body end")),
    }
}
