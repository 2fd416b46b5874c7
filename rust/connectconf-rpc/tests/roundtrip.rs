//! Client and server talking through an in-process loopback.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use http::{HeaderValue, Request, StatusCode, Version};
use serde::{Deserialize, Serialize};

use connectconf_proto::{Any, Code, Codec, Compression, Protocol, StreamType, UnaryRequest};
use connectconf_rpc::{CallOptions, Client, ClientConfig, RpcError, ServerCall};
use connectconf_wire::http::{
    Body, Handler, ResponseFuture, ResponseWriter, RoundTrip, dispatch, full_body,
};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct Ping {
    n: u32,
    text: String,
}

fn ping(n: u32, text: &str) -> Ping {
    Ping {
        n,
        text: text.to_string(),
    }
}

struct Echo;

impl Handler for Echo {
    fn serve<'a>(&'a self, req: Request<Body>, w: &'a mut dyn ResponseWriter) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let Ok(mut call) = ServerCall::new(req, w, 1024) else {
                return;
            };
            let result = match call.procedure() {
                "/test.Echo/Unary" => unary(&mut call).await,
                "/test.Echo/Stream" => stream(&mut call).await,
                "/test.Echo/Fail" => fail(&mut call).await,
                other => Err(RpcError::new(Code::Unimplemented, format!("{other} not found"))),
            };
            call.finish(result);
        })
    }
}

async fn unary(call: &mut ServerCall<'_>) -> Result<(), RpcError> {
    let req: Ping = call
        .receive()
        .await?
        .ok_or_else(|| RpcError::internal("missing request"))?;
    let method = HeaderValue::from_str(call.method().as_str())
        .map_err(|err| RpcError::internal(err.to_string()))?;
    call.response_headers.insert("x-method", method);
    call.response_trailers
        .insert("x-echo-trailer", HeaderValue::from_static("t"));
    call.send(&ping(req.n + 1, &req.text))
}

async fn stream(call: &mut ServerCall<'_>) -> Result<(), RpcError> {
    let mut count = 0u32;
    while let Some(req) = call.receive::<Ping>().await? {
        count += 1;
        call.send(&req)?;
    }
    call.response_trailers
        .insert("x-count", HeaderValue::from(count));
    Ok(())
}

async fn fail(call: &mut ServerCall<'_>) -> Result<(), RpcError> {
    let req: Ping = call.receive().await?.unwrap_or_default();
    if req.n > 0 {
        call.send(&req)?;
    }
    call.response_trailers
        .insert("x-fail", HeaderValue::from_static("1"));
    let detail = Any::pack(&UnaryRequest {
        request_data: req.text.into_bytes(),
        ..Default::default()
    })
    .map_err(|err| RpcError::internal(err.to_string()))?;
    Err(RpcError::new(Code::FailedPrecondition, "nope").with_details(vec![detail]))
}

struct Loopback(Arc<dyn Handler>);

impl RoundTrip for Loopback {
    fn round_trip(&self, mut req: Request<Body>) -> ResponseFuture {
        *req.version_mut() = Version::HTTP_2;
        let handler = self.0.clone();
        Box::pin(async move { Ok(dispatch(handler, req).await) })
    }
}

fn client(protocol: Protocol, codec: Codec, compression: Compression) -> Client {
    client_with(ClientConfig {
        protocol,
        codec,
        compression,
        base_uri: "http://loopback".into(),
        read_max_bytes: 0,
        use_get: false,
    })
}

fn client_with(config: ClientConfig) -> Client {
    Client::new(Arc::new(Loopback(Arc::new(Echo))), config)
}

#[tokio::test]
async fn connect_unary() {
    let client = client(Protocol::Connect, Codec::Proto, Compression::Identity);
    let resp = client
        .unary::<_, Ping>("/test.Echo/Unary", &ping(1, "hi"), CallOptions::default())
        .await
        .unwrap();
    assert_eq!(resp.message, ping(2, "hi"));
    assert_eq!(resp.headers["x-method"], "POST");
    assert_eq!(resp.trailers["x-echo-trailer"], "t");
    assert!(!resp.headers.contains_key("trailer-x-echo-trailer"));
}

#[tokio::test]
async fn connect_get_with_json_and_gzip() {
    for compression in [Compression::Identity, Compression::Gzip] {
        let client = client_with(ClientConfig {
            protocol: Protocol::Connect,
            codec: Codec::Json,
            compression,
            base_uri: "http://loopback/".into(),
            read_max_bytes: 0,
            use_get: true,
        });
        let opts = CallOptions {
            idempotent: true,
            ..Default::default()
        };
        let resp = client
            .unary::<_, Ping>("/test.Echo/Unary", &ping(7, "a b+c"), opts)
            .await
            .unwrap();
        assert_eq!(resp.message, ping(8, "a b+c"));
        assert_eq!(resp.headers["x-method"], "GET");
    }
}

#[tokio::test]
async fn connect_unary_error() {
    let client = client(Protocol::Connect, Codec::Json, Compression::Identity);
    let err = client
        .unary::<_, Ping>("/test.Echo/Fail", &ping(0, "why"), CallOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::FailedPrecondition);
    assert_eq!(err.message, "nope");
    assert!(err.wire);
    let detail: UnaryRequest = err.details[0].unpack().unwrap();
    assert_eq!(detail.request_data, b"why");
    assert_eq!(err.trailers["x-fail"], "1");
}

#[tokio::test]
async fn grpc_bidi_echo_with_gzip() {
    let client = client(Protocol::Grpc, Codec::Proto, Compression::Gzip);
    let mut stream = client
        .stream::<Ping, Ping>(
            "/test.Echo/Stream",
            StreamType::FullDuplexBidiStream,
            CallOptions::default(),
        )
        .unwrap();
    for n in 0..3 {
        stream.send(&ping(n, "x")).unwrap();
    }
    stream.close_send();
    let mut got = Vec::new();
    while let Some(msg) = stream.receive().await.unwrap() {
        got.push(msg.n);
    }
    assert_eq!(got, [0, 1, 2]);
    assert_eq!(stream.response_headers()["grpc-encoding"], "gzip");
    assert_eq!(stream.response_trailers()["x-count"], "3");
    assert_eq!(stream.response_trailers()["grpc-status"], "0");
}

#[tokio::test]
async fn grpc_trailers_only_error() {
    let client = client(Protocol::Grpc, Codec::Proto, Compression::Identity);
    let err = client
        .unary::<_, Ping>("/test.Echo/Fail", &ping(0, ""), CallOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::FailedPrecondition);
    assert_eq!(err.details.len(), 1);
    assert_eq!(err.headers["grpc-status"], "9");
    assert_eq!(err.trailers["x-fail"], "1");
}

#[tokio::test]
async fn grpc_web_error_after_a_message() {
    let client = client(Protocol::GrpcWeb, Codec::Json, Compression::Identity);
    let mut stream = client
        .stream::<Ping, Ping>("/test.Echo/Fail", StreamType::ServerStream, CallOptions::default())
        .unwrap();
    stream.send(&ping(4, "w")).unwrap();
    stream.close_send();
    assert_eq!(stream.receive().await.unwrap(), Some(ping(4, "w")));
    let err = stream.receive().await.unwrap_err();
    assert_eq!(err.code, Code::FailedPrecondition);
    assert_eq!(err.trailers["x-fail"], "1");
    // The outcome sticks.
    assert_eq!(stream.receive().await.unwrap_err().code, Code::FailedPrecondition);
}

#[tokio::test]
async fn connect_stream_error_in_end_stream() {
    let client = client(Protocol::Connect, Codec::Proto, Compression::Identity);
    let mut stream = client
        .stream::<Ping, Ping>("/test.Echo/Fail", StreamType::ServerStream, CallOptions::default())
        .unwrap();
    stream.send(&ping(1, "s")).unwrap();
    stream.close_send();
    assert_eq!(stream.receive().await.unwrap(), Some(ping(1, "s")));
    let err = stream.receive().await.unwrap_err();
    assert_eq!(err.code, Code::FailedPrecondition);
    assert_eq!(err.details.len(), 1);
    assert_eq!(stream.response_trailers()["x-fail"], "1");
}

#[tokio::test]
async fn client_read_limit() {
    for protocol in [Protocol::Connect, Protocol::Grpc] {
        let client = client_with(ClientConfig {
            protocol,
            codec: Codec::Proto,
            compression: Compression::Identity,
            base_uri: "http://loopback".into(),
            read_max_bytes: 10,
            use_get: false,
        });
        let err = client
            .unary::<_, Ping>("/test.Echo/Unary", &ping(1, &"z".repeat(100)), CallOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, Code::ResourceExhausted, "{protocol:?}");
    }
}

#[tokio::test]
async fn server_read_limit() {
    let client = client(Protocol::Connect, Codec::Proto, Compression::Identity);
    let err = client
        .unary::<_, Ping>("/test.Echo/Unary", &ping(1, &"z".repeat(2000)), CallOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::ResourceExhausted);
    assert!(err.message.contains("larger than configured max 1024"));
}

#[tokio::test]
async fn unknown_method() {
    let client = client(Protocol::Grpc, Codec::Proto, Compression::Identity);
    let err = client
        .unary::<_, Ping>("/test.Echo/Nope", &ping(1, ""), CallOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::Unimplemented);
    assert_eq!(err.message, "/test.Echo/Nope not found");
}

#[tokio::test]
async fn unsupported_content_type() {
    let mut req = Request::new(full_body("hello"));
    *req.uri_mut() = "/test.Echo/Unary".parse().unwrap();
    *req.method_mut() = http::Method::POST;
    req.headers_mut()
        .insert("content-type", HeaderValue::from_static("text/plain"));
    let resp = dispatch(Arc::new(Echo), req).await;
    assert_eq!(resp.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert!(resp.headers().contains_key("accept-post"));
}

struct HtmlPage;

impl RoundTrip for HtmlPage {
    fn round_trip(&self, _req: Request<Body>) -> ResponseFuture {
        Box::pin(async {
            Ok(http::Response::builder()
                .header("content-type", "text/html")
                .header("x-served-by", "proxy")
                .body(full_body("<html></html>"))
                .unwrap())
        })
    }
}

#[tokio::test]
async fn connect_unary_wrong_response_content_type() {
    let config = ClientConfig {
        protocol: Protocol::Connect,
        codec: Codec::Proto,
        compression: Compression::Identity,
        base_uri: "http://proxy".into(),
        read_max_bytes: 0,
        use_get: false,
    };
    let client = Client::new(Arc::new(HtmlPage), config);
    let err = client
        .unary::<_, Ping>("/test.Echo/Unary", &ping(1, "hi"), CallOptions::default())
        .await
        .err()
        .unwrap();
    assert_eq!(err.code, Code::Internal);
    assert_eq!(
        err.message,
        r#"invalid content-type: "text/html"; expecting "application/proto""#
    );
    assert_eq!(err.headers["x-served-by"], "proxy");
}
