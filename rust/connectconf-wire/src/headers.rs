//! Conversions between schema headers and `http::HeaderMap`, plus the
//! reserved header names the harness uses to talk to itself.

use http::HeaderMap;
use http::header::{HeaderName, HeaderValue};

use connectconf_proto::Header;

/// Carries the test case name on every request the client sends.
pub const TEST_CASE_NAME: &str = "x-test-case-name";
pub const EXPECT_HTTP_VERSION: &str = "x-expect-http-version";
pub const EXPECT_PROTOCOL: &str = "x-expect-protocol";
pub const EXPECT_CODEC: &str = "x-expect-codec";
pub const EXPECT_COMPRESSION: &str = "x-expect-compression";
pub const EXPECT_TLS: &str = "x-expect-tls";
pub const EXPECT_CLIENT_CERT: &str = "x-expect-client-cert";
pub const EXPECT_HTTP_METHOD: &str = "x-expect-http-method";

/// Headers whose name starts with this are trailers in disguise.
///
/// Middleware that assembles a response in terms of headers marks a trailer
/// this way. Only the final flush moves it into the trailer block, with the
/// prefix stripped. `:` cannot appear in an `http` header name, so the marker
/// uses `+`, which is a valid token character.
pub const TRAILER_PREFIX: &str = "trailer+";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    #[error("invalid header name {0:?}")]
    InvalidName(String),

    #[error("invalid value for header {name:?}")]
    InvalidValue { name: String },
}

fn insert_all(
    src: &[Header],
    dest: &mut HeaderMap,
    prefix: &str,
) -> Result<(), HeaderError> {
    for header in src {
        let full = format!("{prefix}{}", header.name);
        let name = HeaderName::from_bytes(full.as_bytes())
            .map_err(|_| HeaderError::InvalidName(header.name.clone()))?;
        for value in &header.value {
            let value = HeaderValue::from_str(value).map_err(|_| HeaderError::InvalidValue {
                name: header.name.clone(),
            })?;
            dest.append(name.clone(), value);
        }
    }
    Ok(())
}

/// Append every value of every header to `dest`.
pub fn add_headers(src: &[Header], dest: &mut HeaderMap) -> Result<(), HeaderError> {
    insert_all(src, dest, "")
}

/// Append every value as a trailer marked with [`TRAILER_PREFIX`].
pub fn add_trailers(src: &[Header], dest: &mut HeaderMap) -> Result<(), HeaderError> {
    insert_all(src, dest, TRAILER_PREFIX)
}

/// Remove every marked trailer from `headers` and return them, unmarked.
pub fn take_prefixed_trailers(headers: &mut HeaderMap) -> HeaderMap {
    let marked: Vec<HeaderName> = headers
        .keys()
        .filter(|name| name.as_str().starts_with(TRAILER_PREFIX))
        .cloned()
        .collect();
    let mut trailers = HeaderMap::new();
    for name in marked {
        let Ok(stripped) = HeaderName::from_bytes(&name.as_str().as_bytes()[TRAILER_PREFIX.len()..])
        else {
            continue;
        };
        if let http::header::Entry::Occupied(entry) = headers.entry(name) {
            for value in entry.remove_entry_mult().1 {
                trailers.append(stripped.clone(), value);
            }
        }
    }
    trailers
}

/// Convert a header map to schema headers, one entry per distinct name.
///
/// Values that are not valid UTF-8 are converted lossily.
pub fn to_proto_headers(src: &HeaderMap) -> Vec<Header> {
    src.keys()
        .map(|name| Header {
            name: name.as_str().to_string(),
            value: src
                .get_all(name)
                .iter()
                .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
                .collect(),
        })
        .collect()
}

/// Convert a URL query string to schema headers, grouping repeated keys.
pub fn query_to_proto_headers(query: &str) -> Vec<Header> {
    let mut out: Vec<Header> = Vec::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = decode_query_component(key);
        let value = decode_query_component(value);
        match out.iter_mut().find(|h| h.name == key) {
            Some(existing) => existing.value.push(value),
            None => out.push(Header {
                name: key,
                value: vec![value],
            }),
        }
    }
    out
}

/// Look up a single query parameter.
pub fn query_param(query: &str, name: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_query_component(key) == name).then(|| decode_query_component(value))
        })
        .next()
}

fn decode_query_component(s: &str) -> String {
    let plus_decoded = s.replace('+', " ");
    match urlencoding::decode(&plus_decoded) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => plus_decoded,
    }
}

/// First value of `name`, if it is valid UTF-8.
pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
