//! The reference client against the reference server, over real sockets.

use std::sync::Arc;

use connectconf_client::Invoker;
use connectconf_proto::{
    Any, CONFORMANCE_SERVICE, ClientCompatRequest, Code, Codec, Compression, Error, Header,
    HttpVersion, MessageContents, MessageData, Protocol, RawBody, RawHttpResponse,
    ServerCompatRequest, ServerStreamRequest, StreamResponseDefinition, StreamType, UnaryOutcome,
    UnaryRequest, UnaryResponseDefinition,
};
use connectconf_server::{ReferenceServer, ServerOptions, start};
use connectconf_wire::FeedbackPrinter;
use connectconf_wire::codec::encode_message;
use http_body_util::{BodyExt, Full};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

async fn server(http_version: HttpVersion) -> (ReferenceServer, Arc<FeedbackPrinter>) {
    let feedback = Arc::new(FeedbackPrinter::new());
    let req = ServerCompatRequest {
        protocol: Protocol::Connect,
        http_version,
        ..Default::default()
    };
    let server = start(&req, &ServerOptions::new(feedback.clone()))
        .await
        .unwrap();
    (server, feedback)
}

fn directive(
    server: &ReferenceServer,
    name: &str,
    http_version: HttpVersion,
    protocol: Protocol,
    method: &str,
    message: Any,
) -> ClientCompatRequest {
    let resp = server.compat_response();
    ClientCompatRequest {
        test_name: name.into(),
        http_version,
        protocol,
        codec: Codec::Proto,
        compression: Compression::Identity,
        host: resp.host,
        port: resp.port,
        service: CONFORMANCE_SERVICE.into(),
        method: method.into(),
        stream_type: match method {
            "ServerStream" => StreamType::ServerStream,
            _ => StreamType::Unary,
        },
        request_messages: vec![message],
        ..Default::default()
    }
}

fn unary(def: UnaryResponseDefinition) -> Any {
    Any::pack(&UnaryRequest {
        response_definition: Some(def),
        request_data: b"ping".to_vec(),
    })
    .unwrap()
}

#[tokio::test]
async fn connect_unary_over_http1() {
    let (server, feedback) = server(HttpVersion::Http1).await;
    let msg = unary(UnaryResponseDefinition {
        response_headers: vec![Header::new("x-resp", ["yes"])],
        response: Some(UnaryOutcome::ResponseData(b"pong".to_vec())),
        ..Default::default()
    });
    let mut req = directive(&server, "h1-unary", HttpVersion::Http1, Protocol::Connect, "Unary", msg);
    req.request_headers = vec![Header::new("x-custom", ["value"])];

    let result = Invoker::new(true).invoke(&req).await.unwrap();
    assert!(result.error.is_none(), "{result:?}");
    assert_eq!(result.http_status_code, Some(200));
    assert!(result.feedback.is_empty(), "{:?}", result.feedback);
    assert!(result.response_headers.contains(&Header::new("x-resp", ["yes"])));
    assert!(result.response_headers.iter().any(|h| h.name == "date"));
    assert_eq!(result.payloads.len(), 1);
    assert_eq!(result.payloads[0].data, b"pong");
    let info = result.payloads[0].request_info.as_ref().unwrap();
    assert!(info.request_headers.contains(&Header::new("x-custom", ["value"])));
    assert!(info.request_headers.contains(&Header::new("x-test-case-name", ["h1-unary"])));
    assert!(feedback.is_empty(), "{:?}", feedback.take());
    server.shutdown().await;
}

#[tokio::test]
async fn grpc_server_stream_over_http2() {
    let (server, _feedback) = server(HttpVersion::Http2).await;
    let msg = Any::pack(&ServerStreamRequest {
        response_definition: Some(StreamResponseDefinition {
            response_data: vec![b"one".to_vec(), b"two".to_vec()],
            error: Some(Error {
                code: Code::ResourceExhausted,
                message: Some("enough".into()),
                details: vec![],
            }),
            ..Default::default()
        }),
        request_data: vec![],
    })
    .unwrap();
    let req = directive(&server, "h2-stream", HttpVersion::Http2, Protocol::Grpc, "ServerStream", msg);

    let result = Invoker::new(true).invoke(&req).await.unwrap();
    let data: Vec<_> = result.payloads.iter().map(|p| p.data.clone()).collect();
    assert_eq!(data, [b"one".to_vec(), b"two".to_vec()]);
    assert!(result.payloads[0].request_info.is_some());
    assert!(result.payloads[1].request_info.is_none());
    let err = result.error.unwrap();
    assert_eq!(err.code, Code::ResourceExhausted);
    assert_eq!(err.message.as_deref(), Some("enough"));
    server.shutdown().await;
}

#[tokio::test]
async fn raw_response_reaches_the_client() {
    let (server, feedback) = server(HttpVersion::Http1).await;
    let msg = unary(UnaryResponseDefinition {
        raw_response: Some(RawHttpResponse {
            status_code: 503,
            headers: vec![Header::new("content-type", ["application/json"])],
            body: Some(RawBody::Unary(MessageContents {
                data: Some(MessageData::Text(
                    r#"{"code":"unavailable","message":"from raw"}"#.into(),
                )),
                compression: Compression::Identity,
            })),
            trailers: vec![],
        }),
        ..Default::default()
    });
    let req = directive(&server, "raw", HttpVersion::Http1, Protocol::Connect, "Unary", msg);

    let result = Invoker::new(true).invoke(&req).await.unwrap();
    assert_eq!(result.http_status_code, Some(503));
    let err = result.error.unwrap();
    assert_eq!(err.code, Code::Unavailable);
    assert_eq!(err.message.as_deref(), Some("from raw"));
    assert!(feedback.is_empty(), "{:?}", feedback.take());
    server.shutdown().await;
}

#[tokio::test]
async fn grpc_error_keeps_headers_apart_from_trailers() {
    let (server, _feedback) = server(HttpVersion::Http2).await;
    let msg = unary(UnaryResponseDefinition {
        response_headers: vec![Header::new("x-head", ["h"])],
        response_trailers: vec![Header::new("x-tail", ["t"])],
        response: Some(UnaryOutcome::Error(Error {
            code: Code::PermissionDenied,
            message: Some("no".into()),
            details: vec![],
        })),
        ..Default::default()
    });
    let req = directive(&server, "grpc-err", HttpVersion::Http2, Protocol::Grpc, "Unary", msg);

    let result = Invoker::new(false).invoke(&req).await.unwrap();
    assert!(result.response_headers.contains(&Header::new("x-head", ["h"])));
    assert!(!result.response_headers.iter().any(|h| h.name == "x-tail"));
    assert!(result.response_trailers.contains(&Header::new("x-tail", ["t"])));
    assert_eq!(result.error.unwrap().code, Code::PermissionDenied);
    server.shutdown().await;
}

#[tokio::test]
async fn mismatched_expectations_produce_feedback() {
    let (server, feedback) = server(HttpVersion::Http2).await;
    let msg = unary(UnaryResponseDefinition::default());
    let mut req = directive(&server, "expect", HttpVersion::Http2, Protocol::Connect, "Unary", msg);
    req.request_headers = vec![
        Header::new("x-expect-protocol", ["2"]),
        Header::new("x-expect-http-version", ["2"]),
    ];

    let result = Invoker::new(false).invoke(&req).await.unwrap();
    assert!(result.error.is_none(), "{result:?}");
    assert_eq!(
        feedback.take(),
        ["expect: expected protocol PROTOCOL_GRPC; instead got PROTOCOL_CONNECT"]
    );
    server.shutdown().await;
}

/// A unary request whose response is 505 `{"foo":"bar"}` with trailer
/// `x: 123`, as a Connect proto body.
fn foo_bar_request() -> Vec<u8> {
    let req = UnaryRequest {
        response_definition: Some(UnaryResponseDefinition {
            raw_response: Some(RawHttpResponse {
                status_code: 505,
                headers: vec![Header::new("content-type", ["foo/bar"])],
                body: Some(RawBody::Unary(MessageContents {
                    data: Some(MessageData::Text(r#"{"foo":"bar"}"#.into())),
                    compression: Compression::Identity,
                })),
                trailers: vec![Header::new("x", ["123"])],
            }),
            ..Default::default()
        }),
        request_data: vec![],
    };
    encode_message(Codec::Proto, &req).unwrap()
}

const UNARY_PATH: &str = "/connectrpc.conformance.v1.ConformanceService/Unary";

#[tokio::test]
async fn raw_response_trailers_over_http1_without_te() {
    let (server, feedback) = server(HttpVersion::Http1).await;
    let body = foo_bar_request();
    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
    let head = format!(
        "POST {UNARY_PATH} HTTP/1.1\r\n\
         host: localhost\r\n\
         content-type: application/proto\r\n\
         x-test-case-name: raw-h1\r\n\
         content-length: {}\r\n\r\n",
        body.len()
    );
    stream.write_all(head.as_bytes()).await.unwrap();
    stream.write_all(&body).await.unwrap();

    let mut wire = String::new();
    stream.read_to_string(&mut wire).await.unwrap();
    let (head, rest) = wire.split_once("\r\n\r\n").unwrap();
    let mut lines = head.lines();
    assert_eq!(lines.next(), Some("HTTP/1.1 505 HTTP Version Not Supported"));
    let fields: Vec<_> = lines.map(str::to_ascii_lowercase).collect();
    assert!(fields.contains(&"content-type: foo/bar".to_string()), "{fields:?}");
    assert!(fields.contains(&"transfer-encoding: chunked".to_string()), "{fields:?}");
    assert!(!fields.iter().any(|f| f.starts_with("date:")), "{fields:?}");
    assert_eq!(rest, "d\r\n{\"foo\":\"bar\"}\r\n0\r\nx: 123\r\n\r\n");
    assert!(feedback.is_empty(), "{:?}", feedback.take());
    server.shutdown().await;
}

#[tokio::test]
async fn raw_response_trailers_over_http2() {
    let (server, feedback) = server(HttpVersion::Http2).await;
    let stream = TcpStream::connect(server.local_addr()).await.unwrap();
    let (mut sender, conn) =
        hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(stream))
            .await
            .unwrap();
    tokio::spawn(conn);
    let req = http::Request::post(format!("http://{}{UNARY_PATH}", server.local_addr()))
        .header("content-type", "application/proto")
        .header("x-test-case-name", "raw-h2")
        .body(Full::new(bytes::Bytes::from(foo_bar_request())))
        .unwrap();

    let resp = sender.send_request(req).await.unwrap();
    assert_eq!(resp.status(), http::StatusCode::HTTP_VERSION_NOT_SUPPORTED);
    assert_eq!(resp.headers()["content-type"], "foo/bar");
    assert!(!resp.headers().contains_key("date"));
    let collected = resp.into_body().collect().await.unwrap();
    let trailers = collected.trailers().cloned().unwrap();
    assert_eq!(&collected.to_bytes()[..], br#"{"foo":"bar"}"#);
    assert_eq!(trailers["x"], "123");
    assert!(feedback.is_empty(), "{:?}", feedback.take());
    server.shutdown().await;
}
