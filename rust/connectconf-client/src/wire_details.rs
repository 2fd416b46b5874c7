//! Wire-level checks of a completed call.
//!
//! The RPC layer hides most protocol details. To check that a server got
//! them right, every call goes through a [`WireCapture`], which traces the
//! HTTP operation and keeps the raw body of unary JSON errors. Once the
//! call is done, [`examine`] looks at the trace and reports anything that
//! is off as feedback lines.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use bytes::Bytes;
use http::{HeaderMap, Request, StatusCode};
use http_body::{Body as HttpBody, Frame, SizeHint};
use parking_lot::Mutex;
use serde::de::{self, DeserializeSeed, Deserializer, MapAccess, SeqAccess, Visitor};
use serde_json::{Map, Value};

use connectconf_proto::{Code, Header, RpcStatus};
use connectconf_tracer::{EventKind, Trace, TraceRegistry, TracingRoundTripper};
use connectconf_wire::compression::{decompress, from_header};
use connectconf_wire::headers::header_str;
use connectconf_wire::http::{Body, BoxError, ResponseFuture, RoundTrip, box_body};
use connectconf_wire::Printer;

/// How long to wait for the trace of a call that has already returned.
///
/// A call that times out can return before its HTTP operation has
/// finished recording.
pub const TRACE_WAIT: Duration = Duration::from_secs(1);

const CONNECT_ERROR: &str = "connect error JSON";
const CONNECT_END_STREAM: &str = "connect end stream JSON";

// ============================================================================
// Capture
// ============================================================================

/// Traces every request of one test case and tees unary JSON error bodies.
///
/// The trace slot for the test case lives as long as the capture.
pub struct WireCapture {
    inner: TracingRoundTripper<Arc<dyn RoundTrip>>,
    registry: Arc<TraceRegistry>,
    test_name: String,
    error_body: Arc<Mutex<Vec<u8>>>,
}

impl WireCapture {
    pub fn new(transport: Arc<dyn RoundTrip>, registry: Arc<TraceRegistry>, test_name: &str) -> Self {
        registry.init(test_name);
        WireCapture {
            inner: TracingRoundTripper::new(transport, registry.clone()),
            registry,
            test_name: test_name.to_string(),
            error_body: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The completed trace, or `None` if it did not show up in time.
    pub async fn await_trace(&self) -> Option<Trace> {
        match self.registry.await_trace(&self.test_name, TRACE_WAIT).await {
            Ok(trace) => Some(trace),
            Err(err) => {
                tracing::debug!(%err, "no trace for call");
                None
            }
        }
    }

    /// Raw bytes of a unary JSON error body, as far as the caller read it.
    pub fn error_body(&self) -> Vec<u8> {
        self.error_body.lock().clone()
    }
}

impl Drop for WireCapture {
    fn drop(&mut self) {
        self.registry.clear(&self.test_name);
    }
}

impl RoundTrip for WireCapture {
    fn round_trip(&self, req: Request<Body>) -> ResponseFuture {
        let fut = self.inner.round_trip(req);
        let sink = self.error_body.clone();
        Box::pin(async move {
            let resp = fut.await?;
            let content_type = header_str(resp.headers(), "content-type").unwrap_or_default();
            if !is_unary_json_error(content_type, resp.status()) {
                return Ok(resp);
            }
            Ok(resp.map(|body| box_body(TeeBody { inner: body, sink })))
        })
    }
}

/// Copies every data frame into `sink` as it is read.
struct TeeBody {
    inner: Body,
    sink: Arc<Mutex<Vec<u8>>>,
}

impl HttpBody for TeeBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        let polled = Pin::new(&mut self.inner).poll_frame(cx);
        if let Poll::Ready(Some(Ok(frame))) = &polled
            && let Some(data) = frame.data_ref()
        {
            self.sink.lock().extend_from_slice(data);
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

fn is_unary_json_error(content_type: &str, status: StatusCode) -> bool {
    content_type == "application/json" && status != StatusCode::OK
}

// ============================================================================
// Examination
// ============================================================================

/// Check the wire details of a completed call.
///
/// Returns the HTTP status code, or `None` when there is nothing to
/// examine. The two `None` cases differ only in feedback: a missing trace
/// is reported on `p`, while a trace without a response (the round trip
/// itself failed) is left to the call's own error.
pub fn examine(trace: Option<&Trace>, error_body: &[u8], p: &dyn Printer) -> Option<StatusCode> {
    let Some(trace) = trace else {
        p.printf(format_args!(
            "unable to examine wire details: completed trace not found"
        ));
        return None;
    };
    // no response means the round trip itself failed
    let resp = trace.response.as_ref()?;

    let content_type = header_str(&resp.headers, "content-type").unwrap_or_default();
    if is_unary_json_error(content_type, resp.status) {
        let encoding = header_str(&resp.headers, "content-encoding").unwrap_or_default();
        if let Ok(compression) = from_header(encoding)
            && let Ok(body) = decompress(compression, error_body, 0)
        {
            examine_connect_error(&body, p);
        }
    } else if content_type.starts_with("application/connect+") {
        if let Some(content) = trace.end_stream_content() {
            examine_connect_end_stream(content.as_bytes(), p);
        }
    } else if content_type.starts_with("application/grpc-web") {
        if let Some(content) = trace.end_stream_content() {
            let fields = examine_grpc_web_end_stream(content, p);
            check_grpc_status(&fields, p);
        } else if is_trailers_only(trace) {
            check_grpc_status(&FieldMap::from_headers(&resp.headers), p);
        }
    } else if content_type.starts_with("application/grpc") {
        if is_trailers_only(trace) {
            check_grpc_status(&FieldMap::from_headers(&resp.headers), p);
        } else if !resp.trailers.is_empty() {
            check_grpc_status(&FieldMap::from_headers(&resp.trailers), p);
        }
    }

    let is_grpc = content_type == "application/grpc" || content_type.starts_with("application/grpc+");
    if !is_grpc && !resp.trailers.is_empty() {
        p.printf(format_args!(
            "response included {} HTTP trailers but should not have any",
            resp.trailers.keys_len()
        ));
    }
    Some(resp.status)
}

/// A response with no body and no trailers carries its status in headers.
fn is_trailers_only(trace: &Trace) -> bool {
    let Some(resp) = &trace.response else {
        return false;
    };
    // an error hid the end of the response
    if trace.err.is_some() {
        return false;
    }
    if !resp.trailers.is_empty() {
        return false;
    }
    !trace.events.iter().any(|ev| ev.kind.is_response_data())
}

/// Check that streamed response messages arrived spread out over time
/// rather than in one buffered batch.
pub fn examine_stream_delivery(trace: &Trace, expected: usize, delay_ms: u32, p: &dyn Printer) {
    if delay_ms == 0 || expected < 2 {
        return;
    }
    let offsets: Vec<Duration> = trace
        .events
        .iter()
        .filter_map(|ev| match &ev.kind {
            EventKind::ResponseBodyData { envelope, .. }
                if !envelope.is_some_and(|env| env.is_end_stream()) =>
            {
                Some(ev.offset)
            }
            _ => None,
        })
        .collect();
    let (Some(first), Some(last)) = (offsets.first(), offsets.last()) else {
        return;
    };
    if offsets.len() < 2 {
        return;
    }
    let actual = *last - *first;
    let expected_span = Duration::from_millis(u64::from(delay_ms)) * (offsets.len() as u32 - 1);
    // a quarter of the expected span leaves room for slow machines
    let min_span = expected_span / 4;
    if actual < min_span {
        p.printf(format_args!(
            "response messages were not delivered incrementally: {} messages arrived within {:?} of each other, \
             but with a {}ms response delay between {} messages expected a span of at least {:?}",
            offsets.len(),
            round_millis(actual),
            delay_ms,
            offsets.len(),
            round_millis(min_span),
        ));
    }
}

fn round_millis(d: Duration) -> Duration {
    Duration::from_millis(((d.as_micros() + 500) / 1000) as u64)
}

/// Check that `-bin` metadata is unpadded base64.
pub fn check_binary_metadata(what: &str, metadata: &[Header], p: &dyn Printer) {
    for entry in metadata {
        let name = entry.name.to_ascii_lowercase();
        // status details are checked against grpc-status instead
        if !name.ends_with("-bin") || name == "grpc-status-details-bin" {
            continue;
        }
        for value in &entry.value {
            if STANDARD_NO_PAD.decode(value).is_ok() {
                continue;
            }
            if let Err(err) = STANDARD.decode(value) {
                p.printf(format_args!(
                    "{what} include incorrectly-encoded '{}' value: {err}",
                    entry.name
                ));
                return;
            }
            p.printf(format_args!(
                "{what} include '{}' value with padding but servers should emit unpadded: {value}",
                entry.name
            ));
        }
    }
}

// ============================================================================
// Connect JSON
// ============================================================================

fn kind(val: &Value) -> &'static str {
    match val {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn sorted(map: &Map<String, Value>) -> Vec<(&String, &Value)> {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
}

/// Parse `raw` as a JSON object with unique keys, reporting problems under `prefix`.
fn examine_json(raw: &[u8], prefix: &str, p: &dyn Printer) -> Option<Map<String, Value>> {
    let value: Value = match serde_json::from_slice(raw) {
        Ok(value) => value,
        Err(err) => {
            p.printf(format_args!("{prefix}: {err}"));
            return None;
        }
    };
    let Value::Object(map) = value else {
        p.printf(format_args!("{prefix}: expecting an object but got {}", kind(&value)));
        return None;
    };
    if let Some(dup) = find_duplicate_key(raw) {
        p.printf(format_args!("{prefix}: {dup}"));
        return None;
    }
    Some(map)
}

/// Check a unary Connect error body.
pub fn examine_connect_error(raw: &[u8], p: &dyn Printer) {
    if let Some(map) = examine_json(raw, CONNECT_ERROR, p) {
        examine_connect_error_fields(&map, false, p);
    }
}

fn examine_connect_error_fields(map: &Map<String, Value>, numeric_code: bool, p: &dyn Printer) {
    let mut has_code = false;
    let mut details = None;
    for (key, val) in sorted(map) {
        match key.as_str() {
            "code" => {
                has_code = true;
                check_code(val, numeric_code, p);
            }
            "message" => {
                if !val.is_string() {
                    p.printf(format_args!(
                        r#"{CONNECT_ERROR}: value for key "message" is a {} instead of a string"#,
                        kind(val)
                    ));
                }
            }
            "details" => match val {
                Value::Array(items) => details = Some(items),
                other => p.printf(format_args!(
                    r#"{CONNECT_ERROR}: value for key "details" is a {} instead of an array"#,
                    kind(other)
                )),
            },
            _ => p.printf(format_args!("{CONNECT_ERROR}: invalid key {key:?}")),
        }
    }
    if !has_code {
        p.printf(format_args!(r#"{CONNECT_ERROR}: missing required key "code""#));
    }
    for (i, detail) in details.into_iter().flatten().enumerate() {
        examine_connect_error_detail(i, detail, p);
    }
}

fn check_code(val: &Value, numeric_code: bool, p: &dyn Printer) {
    match val {
        Value::String(name) => {
            if Code::from_connect_name(name).is_none() {
                p.printf(format_args!(
                    r#"{CONNECT_ERROR}: value for key "code" is not a recognized error code name: {name:?}"#
                ));
            }
        }
        Value::Number(n) if numeric_code => {
            let known = n
                .as_u64()
                .and_then(|c| u32::try_from(c).ok())
                .and_then(Code::from_u32)
                .is_some();
            if !known {
                p.printf(format_args!(
                    r#"{CONNECT_ERROR}: value for key "code" is not a recognized error code: {n}"#
                ));
            }
        }
        other => p.printf(format_args!(
            r#"{CONNECT_ERROR}: value for key "code" is a {} instead of a string"#,
            kind(other)
        )),
    }
}

fn examine_connect_error_detail(i: usize, detail: &Value, p: &dyn Printer) {
    let prefix = format!("{CONNECT_ERROR}: details[{i}]");
    let Value::Object(map) = detail else {
        p.printf(format_args!("{prefix}: expecting an object but got {}", kind(detail)));
        return;
    };
    let (mut has_type, mut has_value) = (false, false);
    for (key, val) in sorted(map) {
        match key.as_str() {
            "type" => {
                has_type = true;
                match val {
                    Value::String(name) if !is_valid_type_name(name) => p.printf(format_args!(
                        r#"{prefix}: value for key "type", {name:?}, is not a valid type name"#
                    )),
                    Value::String(_) => {}
                    other => p.printf(format_args!(
                        r#"{prefix}: value for key "type" is a {} instead of a string"#,
                        kind(other)
                    )),
                }
            }
            "value" => {
                has_value = true;
                match val {
                    Value::String(encoded) => {
                        if let Err(err) = STANDARD_NO_PAD.decode(encoded) {
                            p.printf(format_args!(
                                r#"{prefix}: value for key "value", {encoded:?}, is not valid unpadded base64-encoding: {err}"#
                            ));
                        }
                    }
                    other => p.printf(format_args!(
                        r#"{prefix}: value for key "value" is a {} instead of a string"#,
                        kind(other)
                    )),
                }
            }
            // debug data may be any JSON value
            "debug" => {}
            _ => p.printf(format_args!("{prefix}: invalid key {key:?}")),
        }
    }
    if !has_type {
        p.printf(format_args!(r#"{prefix}: missing required key "type""#));
    }
    if !has_value {
        p.printf(format_args!(r#"{prefix}: missing required key "value""#));
    }
}

/// A fully-qualified message name: dot-separated identifiers.
fn is_valid_type_name(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}

/// Check the JSON payload of a Connect end-stream message.
///
/// The error code may be a name or a number.
pub fn examine_connect_end_stream(raw: &[u8], p: &dyn Printer) {
    let Some(map) = examine_json(raw, CONNECT_END_STREAM, p) else {
        return;
    };
    let mut error = None;
    for (key, val) in sorted(&map) {
        match key.as_str() {
            "error" => match val {
                Value::Object(obj) => error = Some(obj),
                other => p.printf(format_args!(
                    r#"{CONNECT_END_STREAM}: value for key "error" is a {} instead of a map/object"#,
                    kind(other)
                )),
            },
            "metadata" => match val {
                Value::Object(metadata) => examine_end_stream_metadata(metadata, p),
                other => p.printf(format_args!(
                    r#"{CONNECT_END_STREAM}: value for key "metadata" is a {} instead of a map/object"#,
                    kind(other)
                )),
            },
            _ => p.printf(format_args!("{CONNECT_END_STREAM}: invalid key {key:?}")),
        }
    }
    if let Some(error) = error {
        examine_connect_error_fields(error, true, p);
    }
}

fn examine_end_stream_metadata(metadata: &Map<String, Value>, p: &dyn Printer) {
    for (name, values) in sorted(metadata) {
        if !is_valid_field_name(name) {
            p.printf(format_args!(
                "{CONNECT_END_STREAM}: metadata[{name:?}]: entry key is not a valid HTTP field name"
            ));
        }
        let Value::Array(values) = values else {
            p.printf(format_args!(
                "{CONNECT_END_STREAM}: metadata[{name:?}]: value is a {} instead of an array of strings",
                kind(values)
            ));
            continue;
        };
        for (i, val) in values.iter().enumerate() {
            let n = i + 1;
            match val {
                Value::String(s) if !is_valid_field_value(s) => p.printf(format_args!(
                    "{CONNECT_END_STREAM}: metadata[{name:?}]: value #{n} is not a valid HTTP field value: {s:?}"
                )),
                Value::String(_) => {}
                other => p.printf(format_args!(
                    "{CONNECT_END_STREAM}: metadata[{name:?}]: value #{n} is a {} instead of a string",
                    kind(other)
                )),
            }
        }
    }
}

/// First duplicate object key anywhere in `raw`, described with its path.
fn find_duplicate_key(raw: &[u8]) -> Option<String> {
    let mut found = None;
    let mut de = serde_json::Deserializer::from_slice(raw);
    let check = KeyCheck {
        path: String::new(),
        found: &mut found,
    };
    // syntax errors were already reported by the caller
    let _ = check.deserialize(&mut de);
    found
}

/// Walks a JSON value, remembering the first object with a repeated key.
struct KeyCheck<'a> {
    path: String,
    found: &'a mut Option<String>,
}

impl<'de> DeserializeSeed<'de> for KeyCheck<'_> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, de: D) -> Result<(), D::Error> {
        de.deserialize_any(self)
    }
}

impl<'de> Visitor<'de> for KeyCheck<'_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("any JSON value")
    }

    fn visit_bool<E: de::Error>(self, _: bool) -> Result<(), E> {
        Ok(())
    }

    fn visit_i64<E: de::Error>(self, _: i64) -> Result<(), E> {
        Ok(())
    }

    fn visit_u64<E: de::Error>(self, _: u64) -> Result<(), E> {
        Ok(())
    }

    fn visit_f64<E: de::Error>(self, _: f64) -> Result<(), E> {
        Ok(())
    }

    fn visit_str<E: de::Error>(self, _: &str) -> Result<(), E> {
        Ok(())
    }

    fn visit_unit<E: de::Error>(self) -> Result<(), E> {
        Ok(())
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<(), A::Error> {
        let KeyCheck { path, found } = self;
        let mut i = 0;
        loop {
            let elem = KeyCheck {
                path: format!("{path}[{i}]"),
                found: &mut *found,
            };
            if seq.next_element_seed(elem)?.is_none() {
                return Ok(());
            }
            i += 1;
        }
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<(), A::Error> {
        let KeyCheck { path, found } = self;
        let mut seen = HashSet::new();
        while let Some(key) = map.next_key::<String>()? {
            if !seen.insert(key.clone()) && found.is_none() {
                let prefix = if path.is_empty() {
                    String::new()
                } else {
                    format!("{path}: ")
                };
                *found = Some(format!("{prefix}contains duplicate key {key:?}"));
            }
            let path = if path.is_empty() {
                key
            } else {
                format!("{path}.{key}")
            };
            map.next_value_seed(KeyCheck {
                path,
                found: &mut *found,
            })?;
        }
        Ok(())
    }
}

// ============================================================================
// gRPC status
// ============================================================================

/// Header fields by lower-case name, values in order and untrimmed.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct FieldMap(BTreeMap<String, Vec<String>>);

impl FieldMap {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut fields = FieldMap::default();
        for (name, value) in headers {
            fields.push(name.as_str(), String::from_utf8_lossy(value.as_bytes()).into_owned());
        }
        fields
    }

    fn push(&mut self, name: &str, value: String) {
        self.0.entry(name.to_ascii_lowercase()).or_default().push(value);
    }

    pub fn values(&self, name: &str) -> &[String] {
        self.0.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    fn append_to_last(&mut self, name: &str, text: &str) {
        let values = self.0.entry(name.to_string()).or_default();
        match values.last_mut() {
            Some(last) => {
                last.push(' ');
                last.push_str(text);
            }
            None => values.push(text.to_string()),
        }
    }
}

/// Parse a gRPC-Web trailers block, reporting anything malformed.
pub fn examine_grpc_web_end_stream(block: &str, p: &dyn Printer) -> FieldMap {
    // split on LF alone so that missing CRs can be reported
    let lines: Vec<&str> = block.split('\n').collect();
    let mut fields = FieldMap::default();
    let mut lines_without_cr = 0;
    let mut blank_lines = 0;
    let mut ends_in_crlf = false;
    let mut blank_line_at_end = false;
    let mut obs_line_folds = 0;
    let mut prev_key = String::new();

    for (i, raw_line) in lines.iter().enumerate() {
        let mut line = *raw_line;
        if i == lines.len() - 1 {
            if line.is_empty() {
                ends_in_crlf = true;
                continue;
            }
        } else if let Some(stripped) = line.strip_suffix('\r') {
            line = stripped;
        } else {
            lines_without_cr += 1;
        }

        if line.is_empty() {
            blank_lines += 1;
            if i + 2 == lines.len() {
                blank_line_at_end = true;
            }
            continue;
        }

        let (key, value) = match line.split_once(':') {
            Some((key, value)) => (key, Some(value)),
            None => (line, None),
        };
        if i > blank_lines && (key.starts_with(' ') || key.starts_with('\t')) {
            // obsolete line folding, RFC 7230 section 3.2.4
            obs_line_folds += 1;
            fields.append_to_last(&prev_key, line.trim_matches([' ', '\t']));
            continue;
        }
        let lower_key = key.to_ascii_lowercase();
        let Some(value) = value else {
            p.printf(format_args!(
                "grpc-web trailers include invalid field (missing colon): {line:?}"
            ));
            fields.push(&lower_key, String::new());
            prev_key = lower_key;
            continue;
        };
        if !is_valid_field_name(key) {
            p.printf(format_args!(
                "grpc-web trailers include invalid field; name contains invalid characters: {line:?}"
            ));
        }
        if key != lower_key {
            p.printf(format_args!(
                "grpc-web trailers include non-lower-case field key: {key:?}"
            ));
        }
        let value = value.trim_matches([' ', '\t']);
        if !is_valid_field_value(value) {
            p.printf(format_args!(
                "grpc-web trailers include invalid field; value contains invalid characters: {line:?}"
            ));
        }
        fields.push(&lower_key, value.to_string());
        prev_key = lower_key;
    }

    if obs_line_folds > 0 {
        p.printf(format_args!("grpc-web trailers use obsolete line-folding"));
    }
    if blank_lines == 1 && blank_line_at_end {
        p.printf(format_args!("grpc-web trailers ends in extra blank line"));
    } else if blank_lines > 0 {
        p.printf(format_args!("grpc-web trailers include blank lines"));
    }
    if lines_without_cr > 0 {
        p.printf(format_args!(
            "grpc-web trailers have lines with LF line ending instead of CRLF"
        ));
    }
    if !ends_in_crlf {
        p.printf(format_args!("grpc-web trailers should end with CRLF but does not"));
    }
    fields
}

/// Check `grpc-status`, `grpc-message` and `grpc-status-details-bin`.
pub fn check_grpc_status(fields: &FieldMap, p: &dyn Printer) {
    let statuses = fields.values("grpc-status");
    let mut status = None;
    match statuses {
        [] => p.printf(format_args!("trailers did not include 'grpc-status' key")),
        [value] => match value.parse::<i64>() {
            Ok(code) => {
                status = Some(code);
                if !(0..=16).contains(&code) {
                    p.printf(format_args!(
                        "trailers include invalid 'grpc-status' value {code}: should be >= 0 && <= 16"
                    ));
                }
            }
            Err(err) => p.printf(format_args!(
                "trailers include invalid 'grpc-status' value {value:?}: {err}"
            )),
        },
        many => p.printf(format_args!(
            "trailers include multiple 'grpc-status' keys ({})",
            many.len()
        )),
    }

    let messages = fields.values("grpc-message");
    if messages.len() > 1 {
        p.printf(format_args!(
            "trailers include multiple 'grpc-message' keys ({})",
            messages.len()
        ));
    }
    let mut message = None;
    if let Some(raw) = messages.first() {
        if check_percent_encoding(raw, p) {
            let decoded = urlencoding::decode_binary(raw.as_bytes());
            message = Some(String::from_utf8_lossy(&decoded).into_owned());
        }
        if status == Some(0) && !raw.is_empty() {
            p.printf(format_args!(
                "trailers include a non-empty 'grpc-message' value with zero/okay 'grpc-status'"
            ));
        }
    }

    let details = fields.values("grpc-status-details-bin");
    if details.len() > 1 {
        p.printf(format_args!(
            "trailers include multiple 'grpc-status-details-bin' keys ({})",
            details.len()
        ));
    }
    let Some(encoded) = details.first() else {
        return;
    };
    let data = match STANDARD_NO_PAD.decode(encoded) {
        Ok(data) => data,
        Err(_) => match STANDARD.decode(encoded) {
            Ok(data) => {
                p.printf(format_args!(
                    "trailers include 'grpc-status-details-bin' value with padding but servers should emit unpadded: {encoded}"
                ));
                data
            }
            Err(err) => {
                p.printf(format_args!(
                    "trailers include incorrectly-encoded 'grpc-status-details-bin' value: {err}"
                ));
                return;
            }
        },
    };
    let details: RpcStatus = match postcard::from_bytes(&data) {
        Ok(details) => details,
        Err(err) => {
            p.printf(format_args!(
                "trailers include un-parseable 'grpc-status-details-bin' value: {err}"
            ));
            return;
        }
    };
    if let Some(code) = status
        && i64::from(details.code) != code
    {
        p.printf(format_args!(
            "trailers include 'grpc-status-details-bin' value that disagrees with 'grpc-status' value: {} != {code}",
            details.code
        ));
    }
    if details.code == 0 && !details.details.is_empty() {
        p.printf(format_args!(
            "trailers include 'grpc-status-details-bin' value with zero/okay 'grpc-status' and non-empty details"
        ));
    }
    if let Some(message) = message
        && details.message != message
    {
        p.printf(format_args!(
            "trailers include 'grpc-status-details-bin' value that disagrees with 'grpc-message' value: {:?} != {message:?}",
            details.message
        ));
    }
}

/// Report the first encoding problem in a `grpc-message` value. Returns
/// whether every escape was well-formed.
fn check_percent_encoding(raw: &str, p: &dyn Printer) -> bool {
    let mut expect_hex = 0;
    for (i, &b) in raw.as_bytes().iter().enumerate() {
        if expect_hex > 0 {
            if b.is_ascii_hexdigit() {
                expect_hex -= 1;
                continue;
            }
            p.printf(format_args!(
                "trailers include incorrectly-encoded 'grpc-message' value {raw:?}: byte at position {i} (0x{b:02x}) should be hexadecimal digit"
            ));
            return false;
        }
        if b == b'%' {
            expect_hex = 2;
            continue;
        }
        if !(0x20..=0x7e).contains(&b) {
            p.printf(format_args!(
                "trailers include incorrectly-encoded 'grpc-message' value {raw:?}: byte at position {i} (0x{b:02x}) should be percent-encoded"
            ));
            return true;
        }
    }
    if expect_hex > 0 {
        p.printf(format_args!(
            "trailers include incorrectly-encoded 'grpc-message' value {raw:?}: incomplete percent-encoded character at the end"
        ));
        return false;
    }
    true
}

/// RFC 7230 token characters.
fn is_valid_field_name(name: &str) -> bool {
    name.bytes().all(|b| {
        b.is_ascii_alphanumeric()
            || matches!(
                b,
                b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'^' | b'_'
                    | b'`' | b'|' | b'~'
            )
    })
}

/// Visible US-ASCII plus SP and HTAB.
fn is_valid_field_value(value: &str) -> bool {
    value.bytes().all(|b| b == b'\t' || (b >= 32 && b != 127))
}
