//! Replaces the request the RPC layer built with one described byte for
//! byte by the directive.

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE;
use http::{HeaderMap, Method, Request, Uri};
use http_body_util::BodyExt;

use connectconf_proto::RawHttpRequest;
use connectconf_wire::headers::{TEST_CASE_NAME, add_headers, query_to_proto_headers};
use connectconf_wire::http::{Body, BoxError, ResponseFuture, RoundTrip, full_body};
use connectconf_wire::raw_body::{raw_body_bytes, write_raw_message_contents};

/// Prefix of the expectation headers the server checks.
const EXPECT_PREFIX: &str = "x-expect-";

pub struct RawRequestSender {
    inner: Arc<dyn RoundTrip>,
    raw: RawHttpRequest,
}

impl RawRequestSender {
    pub fn new(inner: Arc<dyn RoundTrip>, raw: RawHttpRequest) -> Self {
        RawRequestSender { inner, raw }
    }

    fn build(&self, orig: &Request<Body>) -> Result<Request<Body>, BoxError> {
        let body = match &self.raw.body {
            Some(body) => raw_body_bytes(body)?,
            None => Vec::new(),
        };
        let method = if self.raw.verb.is_empty() {
            Method::POST
        } else {
            Method::from_bytes(self.raw.verb.as_bytes())?
        };

        let mut req = Request::new(full_body(body));
        *req.method_mut() = method;
        *req.uri_mut() = self.uri(orig.uri())?;
        *req.extensions_mut() = orig.extensions().clone();
        let headers = req.headers_mut();
        add_headers(&self.raw.headers, headers)?;
        keep_reserved_headers(orig.headers(), headers);
        Ok(req)
    }

    /// The directive's URI plus its query parameters, resolved against the
    /// original request's scheme and authority.
    fn uri(&self, orig: &Uri) -> Result<Uri, BoxError> {
        let raw: Uri = self
            .raw
            .uri
            .parse()
            .map_err(|err| format!("raw request has invalid URI: {}: {err}", self.raw.uri))?;

        let mut query = raw.query().unwrap_or_default().to_string();
        if !self.raw.raw_query_params.is_empty() || !self.raw.encoded_query_params.is_empty() {
            let mut params: BTreeMap<String, Vec<Vec<u8>>> = BTreeMap::new();
            for param in query_to_proto_headers(&query) {
                let values = params.entry(param.name).or_default();
                values.extend(param.value.into_iter().map(String::into_bytes));
            }
            for param in &self.raw.raw_query_params {
                let values = params.entry(param.name.clone()).or_default();
                values.extend(param.value.iter().map(|v| v.clone().into_bytes()));
            }
            for param in &self.raw.encoded_query_params {
                let mut buf = Vec::new();
                write_raw_message_contents(&param.value, &mut buf).map_err(|err| {
                    format!("raw request has invalid encoded query param {}: {err}", param.name)
                })?;
                if param.base64_encode {
                    buf = URL_SAFE.encode(&buf).into_bytes();
                }
                params.entry(param.name.clone()).or_default().push(buf);
            }
            query = params
                .iter()
                .flat_map(|(name, values)| {
                    values.iter().map(move |value| {
                        format!(
                            "{}={}",
                            urlencoding::encode(name),
                            urlencoding::encode_binary(value)
                        )
                    })
                })
                .collect::<Vec<_>>()
                .join("&");
        }

        let path = if query.is_empty() {
            raw.path().to_string()
        } else {
            format!("{}?{query}", raw.path())
        };
        let mut builder = Uri::builder().path_and_query(path);
        match (raw.scheme(), raw.authority()) {
            (Some(scheme), Some(authority)) => {
                builder = builder.scheme(scheme.clone()).authority(authority.clone());
            }
            _ => {
                if let Some(scheme) = orig.scheme() {
                    builder = builder.scheme(scheme.clone());
                }
                if let Some(authority) = orig.authority() {
                    builder = builder.authority(authority.clone());
                }
            }
        }
        Ok(builder.build()?)
    }
}

/// Copy the test case name and expectation headers the harness relies on.
fn keep_reserved_headers(orig: &HeaderMap, dest: &mut HeaderMap) {
    for (name, value) in orig {
        let reserved = name == TEST_CASE_NAME || name.as_str().starts_with(EXPECT_PREFIX);
        if reserved && !dest.contains_key(name) {
            dest.append(name.clone(), value.clone());
        }
    }
}

impl RoundTrip for RawRequestSender {
    fn round_trip(&self, orig: Request<Body>) -> ResponseFuture {
        let built = self.build(&orig);
        // nobody reads the original body, but its writer may wait on it
        let mut body = orig.into_body();
        tokio::spawn(async move { while let Some(Ok(_)) = body.frame().await {} });
        match built {
            Ok(req) => self.inner.round_trip(req),
            Err(err) => Box::pin(async move { Err(err) }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use connectconf_proto::{
        Compression, EncodedQueryParam, Header, MessageContents, MessageData, RawBody,
        StreamContents, StreamItem,
    };
    use connectconf_wire::http::{collect_body, empty_body};
    use parking_lot::Mutex;

    type Seen = Arc<Mutex<Option<(http::request::Parts, Vec<u8>)>>>;

    #[derive(Default)]
    struct Recorder {
        seen: Seen,
    }

    impl RoundTrip for Recorder {
        fn round_trip(&self, req: Request<Body>) -> ResponseFuture {
            let seen = self.seen.clone();
            Box::pin(async move {
                let (parts, body) = req.into_parts();
                let (data, _) = collect_body(body).await?;
                *seen.lock() = Some((parts, data.to_vec()));
                Ok(http::Response::new(empty_body()))
            })
        }
    }

    fn text(s: &str) -> MessageContents {
        MessageContents {
            data: Some(MessageData::Text(s.to_string())),
            compression: Compression::Identity,
        }
    }

    fn header(name: &str, values: &[&str]) -> Header {
        Header {
            name: name.to_string(),
            value: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    async fn send(raw: RawHttpRequest) -> (http::request::Parts, Vec<u8>) {
        let recorder = Recorder::default();
        let seen = recorder.seen.clone();
        let sender = RawRequestSender::new(Arc::new(recorder), raw);
        let orig = Request::get("http://127.0.0.1:8080/some.random.endpoint/")
            .header(TEST_CASE_NAME, "raw case")
            .header("x-expect-codec", "1")
            .header("x-other", "dropped")
            .body(full_body("foobar"))
            .unwrap();
        let resp = sender.round_trip(orig).await.unwrap();
        assert_eq!(resp.status(), http::StatusCode::OK);
        let got = seen.lock().take();
        got.unwrap()
    }

    #[tokio::test]
    async fn unary_body_and_headers() {
        let (parts, body) = send(RawHttpRequest {
            verb: "POST".into(),
            uri: "/foo/bar.baz".into(),
            headers: vec![
                header("Content-Type", &["foo/bar"]),
                header("X-Custom-Header", &["abc", "def"]),
            ],
            body: Some(RawBody::Unary(MessageContents {
                data: Some(MessageData::Binary(vec![0, 1, 2, 3])),
                compression: Compression::Identity,
            })),
            ..Default::default()
        })
        .await;
        assert_eq!(parts.method, Method::POST);
        assert_eq!(parts.uri, "http://127.0.0.1:8080/foo/bar.baz");
        assert_eq!(parts.headers["content-type"], "foo/bar");
        let custom: Vec<_> = parts.headers.get_all("x-custom-header").iter().collect();
        assert_eq!(custom, ["abc", "def"]);
        assert_eq!(parts.headers[TEST_CASE_NAME], "raw case");
        assert_eq!(parts.headers["x-expect-codec"], "1");
        assert!(!parts.headers.contains_key("x-other"));
        assert_eq!(body, [0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn query_params_are_merged() {
        let gzipped = MessageContents {
            data: Some(MessageData::Binary(vec![0, 1, 2, 3, 4, 5, 6, 7])),
            compression: Compression::Gzip,
        };
        let mut expected_q = Vec::new();
        write_raw_message_contents(&gzipped, &mut expected_q).unwrap();
        let expected_q = URL_SAFE.encode(&expected_q);

        let (parts, body) = send(RawHttpRequest {
            verb: "GET".into(),
            uri: "/foo/bar.baz?q=q&x=456".into(),
            raw_query_params: vec![header("q", &["a", "b"]), header("x", &["123"])],
            encoded_query_params: vec![
                EncodedQueryParam {
                    name: "q".into(),
                    value: gzipped,
                    base64_encode: true,
                },
                EncodedQueryParam {
                    name: "x".into(),
                    value: text(r#"{"foo": "bar"}"#),
                    base64_encode: false,
                },
            ],
            body: Some(RawBody::Unary(text("{}"))),
            ..Default::default()
        })
        .await;
        assert_eq!(parts.method, Method::GET);
        assert_eq!(parts.uri.path(), "/foo/bar.baz");
        let query = query_to_proto_headers(parts.uri.query().unwrap());
        assert_eq!(
            query,
            [
                header("q", &["q", "a", "b", &expected_q]),
                header("x", &["456", "123", r#"{"foo": "bar"}"#]),
            ]
        );
        assert_eq!(body, b"{}");
    }

    #[tokio::test]
    async fn stream_body_with_default_verb() {
        let (parts, body) = send(RawHttpRequest {
            uri: "/svc/Method".into(),
            body: Some(RawBody::Stream(StreamContents {
                items: vec![
                    StreamItem {
                        flags: 0,
                        length: None,
                        payload: text("ab"),
                    },
                    StreamItem {
                        flags: 2,
                        length: Some(9),
                        payload: text("{}"),
                    },
                ],
            })),
            ..Default::default()
        })
        .await;
        assert_eq!(parts.method, Method::POST);
        assert_eq!(body, [0, 0, 0, 0, 2, b'a', b'b', 2, 0, 0, 0, 9, b'{', b'}']);
    }

    #[tokio::test]
    async fn invalid_verb_fails_the_round_trip() {
        let recorder = Recorder::default();
        let seen = recorder.seen.clone();
        let sender = RawRequestSender::new(
            Arc::new(recorder),
            RawHttpRequest {
                verb: "NOT A VERB".into(),
                uri: "/x".into(),
                ..Default::default()
            },
        );
        let orig = Request::post("http://localhost/x").body(empty_body()).unwrap();
        assert!(sender.round_trip(orig).await.is_err());
        assert!(seen.lock().is_none());
    }
}
