//! Structural checks on incoming requests.
//!
//! The test runner announces what each request should look like through
//! `x-expect-*` headers. Mismatches are reported as feedback keyed by the
//! test case name; the request is served either way. The only hard failure
//! is a missing `x-test-case-name` header.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, Method, Request, StatusCode, Version};

use connectconf_proto::{Codec, Compression, HttpVersion, Protocol};
use connectconf_wire::headers::{
    EXPECT_CLIENT_CERT, EXPECT_CODEC, EXPECT_COMPRESSION, EXPECT_HTTP_METHOD,
    EXPECT_HTTP_VERSION, EXPECT_PROTOCOL, EXPECT_TLS, TEST_CASE_NAME, header_str,
};
use connectconf_wire::http::{Body, Handler, ResponseWriter};
use connectconf_wire::Printer;

const GRPC: &str = "application/grpc";
const GRPC_WEB: &str = "application/grpc-web";
const CONNECT_STREAM_PREFIX: &str = "application/connect+";
const CONNECT_UNARY_PREFIX: &str = "application/";

/// What the server knows about the connection a request arrived on.
#[derive(Clone, Debug, Default)]
pub struct ConnInfo {
    pub tls: bool,
    /// Common name of the client certificate, if one was presented.
    pub client_cert_name: Option<String>,
}

pub struct ReferenceChecks<H> {
    inner: H,
    feedback: Arc<dyn Printer>,
    seen: DashMap<String, usize>,
}

impl<H> ReferenceChecks<H> {
    pub fn new(inner: H, feedback: Arc<dyn Printer>) -> Self {
        ReferenceChecks {
            inner,
            feedback,
            seen: DashMap::new(),
        }
    }
}

impl<H: Handler> Handler for ReferenceChecks<H> {
    fn serve<'a>(&'a self, req: Request<Body>, w: &'a mut dyn ResponseWriter) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let Some(test_name) = header_str(req.headers(), TEST_CASE_NAME)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
            else {
                w.headers_mut().insert(
                    CONTENT_TYPE,
                    http::HeaderValue::from_static("text/plain; charset=utf-8"),
                );
                w.write_header(StatusCode::BAD_REQUEST);
                let _ = w.write(b"missing x-test-case-name header\n");
                return;
            };

            let mut feedback = Feedback {
                printer: self.feedback.as_ref(),
                test_name: &test_name,
            };
            let count = {
                let mut entry = self.seen.entry(test_name.clone()).or_insert(0);
                *entry += 1;
                *entry
            };
            if count > 1 {
                feedback.print(format_args!(
                    "received {count} requests for this test case; expected just one"
                ));
            }
            check_request(&req, &mut feedback);

            self.inner.serve(req, w).await;
        })
    }
}

struct Feedback<'a> {
    printer: &'a dyn Printer,
    test_name: &'a str,
}

impl Feedback<'_> {
    fn print(&mut self, args: fmt::Arguments<'_>) {
        tracing::debug!(test = self.test_name, "{args}");
        self.printer.prefix_printf(self.test_name, args);
    }
}

fn check_request(req: &Request<Body>, feedback: &mut Feedback<'_>) {
    let headers = req.headers();
    if let Some(n) = enum_value(headers, EXPECT_HTTP_VERSION, 3, feedback) {
        check_http_version(n, req.version(), feedback);
    }
    if let Some(n) = enum_value(headers, EXPECT_PROTOCOL, 3, feedback) {
        check_protocol(protocol_from_number(n), req, feedback);
    }
    if let Some(n) = enum_value(headers, EXPECT_CODEC, 3, feedback) {
        check_codec(codec_from_number(n), req, feedback);
    }
    if let Some(n) = enum_value(headers, EXPECT_COMPRESSION, 6, feedback) {
        check_compression(compression_from_number(n), req, feedback);
    }
    if get_header(headers, EXPECT_TLS, feedback).is_some() {
        let conn = req.extensions().get::<ConnInfo>().cloned().unwrap_or_default();
        check_tls(headers, &conn, feedback);
    }
    if let Some(expected) = get_header(headers, EXPECT_HTTP_METHOD, feedback)
        && req.method().as_str() != expected
    {
        feedback.print(format_args!(
            "expected HTTP method {expected:?}, got {:?}",
            req.method().as_str()
        ));
    }
}

// ============================================================================
// Expectations
// ============================================================================

/// The numeric value of an expectation header, or `None` when the header is
/// absent or invalid. Invalid values are reported.
fn enum_value(headers: &HeaderMap, name: &str, max: u32, feedback: &mut Feedback<'_>) -> Option<u32> {
    let value = get_header(headers, name, feedback)?;
    let n: i32 = match value.parse() {
        Ok(n) => n,
        Err(err) => {
            feedback.print(format_args!(
                "invalid value for {name:?} header: {value:?}: {err}"
            ));
            return None;
        }
    };
    match u32::try_from(n) {
        Ok(n) if n <= max => Some(n),
        _ => {
            feedback.print(format_args!(
                "invalid value for {name:?} header: {n} is not in range"
            ));
            None
        }
    }
}

fn protocol_from_number(n: u32) -> Protocol {
    match n {
        1 => Protocol::Connect,
        2 => Protocol::Grpc,
        3 => Protocol::GrpcWeb,
        _ => Protocol::Unspecified,
    }
}

fn codec_from_number(n: u32) -> Codec {
    match n {
        1 => Codec::Proto,
        2 => Codec::Json,
        3 => Codec::Text,
        _ => Codec::Unspecified,
    }
}

fn compression_from_number(n: u32) -> Compression {
    match n {
        1 => Compression::Identity,
        2 => Compression::Gzip,
        3 => Compression::Br,
        4 => Compression::Zstd,
        5 => Compression::Deflate,
        6 => Compression::Snappy,
        _ => Compression::Unspecified,
    }
}

fn check_http_version(expected: u32, actual: Version, feedback: &mut Feedback<'_>) {
    let Some(expected) = HttpVersion::from_major(expected).map(HttpVersion::major) else {
        feedback.print(format_args!("invalid expected HTTP version {expected}"));
        return;
    };
    let actual = match actual {
        Version::HTTP_09 => 0,
        Version::HTTP_10 | Version::HTTP_11 => 1,
        Version::HTTP_2 => 2,
        _ => 3,
    };
    if expected != actual {
        feedback.print(format_args!(
            "expected HTTP version {expected}; instead got {actual}"
        ));
    }
}

fn is_grpc(content_type: &str) -> bool {
    content_type == GRPC || content_type.starts_with("application/grpc+")
}

fn is_grpc_web(content_type: &str) -> bool {
    content_type == GRPC_WEB || content_type.starts_with("application/grpc-web+")
}

fn check_protocol(expected: Protocol, req: &Request<Body>, feedback: &mut Feedback<'_>) {
    let content_type = header_str(req.headers(), CONTENT_TYPE.as_str()).unwrap_or_default();
    let actual = if is_grpc(content_type) {
        Protocol::Grpc
    } else if is_grpc_web(content_type) {
        Protocol::GrpcWeb
    } else if content_type.starts_with(CONNECT_UNARY_PREFIX) || req.method() == Method::GET {
        Protocol::Connect
    } else {
        feedback.print(format_args!(
            "could not determine protocol from content-type {content_type:?}"
        ));
        return;
    };
    if expected != actual {
        feedback.print(format_args!(
            "expected protocol {expected}; instead got {actual}"
        ));
    }
}

fn check_codec(expected: Codec, req: &Request<Body>, feedback: &mut Feedback<'_>) {
    if expected == Codec::Unspecified {
        feedback.print(format_args!("invalid expected codec {expected}"));
        return;
    }
    let expect = expected.name();
    let content_type = get_header(req.headers(), CONTENT_TYPE.as_str(), feedback);
    let actual = if req.method() == Method::GET {
        if content_type.is_some() {
            feedback.print(format_args!(
                "content-type header should not appear with method GET"
            ));
        }
        match get_query_param(req.uri().query(), "encoding", feedback) {
            Some(actual) => actual,
            None => {
                feedback.print(format_args!("encoding query parameter is missing"));
                return;
            }
        }
    } else {
        let content_type = content_type.unwrap_or_default();
        let suffix = if content_type == GRPC || content_type == GRPC_WEB {
            Some("proto")
        } else {
            ["application/grpc+", "application/grpc-web+", CONNECT_STREAM_PREFIX, CONNECT_UNARY_PREFIX]
                .iter()
                .find_map(|prefix| content_type.strip_prefix(prefix))
        };
        // a bad content-type was already reported by the protocol check
        let Some(suffix) = suffix else {
            return;
        };
        suffix.to_string()
    };
    if expect != actual {
        feedback.print(format_args!("expected codec {expect}; instead got {actual}"));
    }
}

fn check_compression(expected: Compression, req: &Request<Body>, feedback: &mut Feedback<'_>) {
    if expected == Compression::Unspecified {
        feedback.print(format_args!("invalid expected compression {expected}"));
        return;
    }
    let expect = expected.name();
    let actual = if req.method() == Method::GET {
        get_query_param(req.uri().query(), "compression", feedback)
    } else {
        let content_type = header_str(req.headers(), CONTENT_TYPE.as_str()).unwrap_or_default();
        let encoding_header = if is_grpc(content_type) || is_grpc_web(content_type) {
            "grpc-encoding"
        } else if content_type.starts_with(CONNECT_STREAM_PREFIX) {
            "connect-content-encoding"
        } else if content_type.starts_with(CONNECT_UNARY_PREFIX) {
            "content-encoding"
        } else {
            return;
        };
        get_header(req.headers(), encoding_header, feedback)
    };
    let actual = actual.unwrap_or_else(|| Compression::Identity.name().to_string());
    if expect != actual {
        feedback.print(format_args!(
            "expected compression {expect}; instead got {actual}"
        ));
    }
}

/// Boolean spellings accepted for `x-expect-tls`.
fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

fn check_tls(headers: &HeaderMap, conn: &ConnInfo, feedback: &mut Feedback<'_>) {
    let value = header_str(headers, EXPECT_TLS).unwrap_or_default();
    let Some(expect_tls) = parse_bool(value) else {
        feedback.print(format_args!(
            "invalid value for {EXPECT_TLS:?} header: {value:?}: invalid syntax"
        ));
        return;
    };
    if expect_tls && !conn.tls {
        feedback.print(format_args!("expecting TLS request but instead was plain-text"));
        return;
    }
    if !expect_tls && conn.tls {
        feedback.print(format_args!("expecting plain-text request but instead was TLS"));
        return;
    }
    if !conn.tls {
        return;
    }
    let expected = get_header(headers, EXPECT_CLIENT_CERT, feedback).unwrap_or_default();
    let actual = conn.client_cert_name.as_deref().unwrap_or_default();
    if expected != actual {
        feedback.print(format_args!(
            "expecting client cert {expected:?}, instead was {actual:?}"
        ));
    }
}

// ============================================================================
// Lookups that report duplicates
// ============================================================================

fn get_header(headers: &HeaderMap, name: &str, feedback: &mut Feedback<'_>) -> Option<String> {
    let count = headers.get_all(name).iter().count();
    if count > 1 {
        feedback.print(format_args!(
            "{name} header appears {count} times; should appear just once"
        ));
    }
    header_str(headers, name).map(str::to_string)
}

fn get_query_param(query: Option<&str>, name: &str, feedback: &mut Feedback<'_>) -> Option<String> {
    let query = query.unwrap_or_default();
    let values: Vec<String> = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = urlencoding::decode(key).ok()?;
            (key == name).then(|| {
                urlencoding::decode(&value.replace('+', " "))
                    .map(|v| v.into_owned())
                    .unwrap_or_else(|_| value.to_string())
            })
        })
        .collect();
    if values.len() > 1 {
        feedback.print(format_args!(
            "{name} query string param appears {} times; should appear just once",
            values.len()
        ));
    }
    values.into_iter().next()
}
