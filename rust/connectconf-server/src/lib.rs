#![forbid(unsafe_op_in_unsafe_fn)]

//! Reference conformance server.
//!
//! Reads one [`ServerCompatRequest`] describing how to listen, starts a
//! server that implements the conformance service, and answers with a
//! [`ServerCompatResponse`] naming the address it listens on. Every request
//! goes through the same stack:
//!
//! - [`ReferenceChecks`]: feedback on requests that do not look the way the
//!   test runner announced,
//! - [`RawResponder`]: byte-exact responses requested by the test case,
//! - [`ConformanceService`]: the service itself.
//!
//! Completed wire traces are logged at `debug`.

use std::convert::Infallible;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use http::Request;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use connectconf_proto::{HttpVersion, ServerCompatRequest, ServerCompatResponse};
use connectconf_tracer::{Collector, Trace, TracingHandler, TracingHttp2Conn};
use connectconf_wire::http::{Handler, box_body, dispatch};
use connectconf_wire::tls::{self, TlsError};
use connectconf_wire::{CodecError, FeedbackPrinter, Printer, RecordFormat, RecordReader, RecordWriter};

use crate::http1::{Http1Conn, Takeover, hyper_writes_trailers, needs_takeover};

pub mod checks;
mod http1;
pub mod raw_response;
pub mod service;

#[cfg(feature = "http3")]
mod h3_server;

pub use checks::{ConnInfo, ReferenceChecks};
pub use raw_response::{RawResponder, RawResponseSlot, grpc_error_response};
pub use service::ConformanceService;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("an HTTP version must be specified")]
    NoVersion,

    #[error("request indicated HTTP/3 without TLS, which is not possible")]
    Http3WithoutTls,

    #[error("TLS requested but no certificate configured")]
    NoCertificate,

    #[error("HTTP/3 support is not compiled in")]
    Http3Unavailable,

    #[error("no server configuration on input")]
    NoRequest,

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("failed to set up HTTP/3 endpoint: {0}")]
    Quic(String),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

pub struct ServerOptions {
    pub bind: IpAddr,
    /// Zero picks a free port.
    pub port: u16,
    /// PEM certificate and key, used when the request asks for TLS.
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
    /// Where request-check feedback goes, prefixed by test name.
    pub feedback: Arc<dyn Printer>,
}

impl ServerOptions {
    pub fn new(feedback: Arc<dyn Printer>) -> Self {
        ServerOptions {
            bind: IpAddr::from([127, 0, 0, 1]),
            port: 0,
            cert: Vec::new(),
            key: Vec::new(),
            feedback,
        }
    }
}

/// A running server.
pub struct ReferenceServer {
    local_addr: SocketAddr,
    pem_cert: Vec<u8>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ReferenceServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn compat_response(&self) -> ServerCompatResponse {
        ServerCompatResponse {
            host: self.local_addr.ip().to_string(),
            port: u32::from(self.local_addr.port()),
            pem_cert: self.pem_cert.clone(),
        }
    }

    /// Stop accepting, let in-flight calls finish, then return.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(err) = self.task.await {
            tracing::error!(%err, "server task failed");
        }
    }
}

/// The handler stack every request goes through.
pub fn reference_handler(read_max_bytes: u32, feedback: Arc<dyn Printer>) -> Arc<dyn Handler> {
    let service = ConformanceService::new(read_max_bytes);
    let raw = RawResponder::new(service, feedback.clone());
    Arc::new(ReferenceChecks::new(raw, feedback))
}

/// Logs each completed trace in its printed form.
fn trace_logger() -> Arc<dyn Collector> {
    Arc::new(|trace: Trace| {
        let printer = FeedbackPrinter::new();
        trace.print(&printer);
        tracing::debug!(
            test = %trace.test_name,
            "server trace:\n{}",
            printer.take().join("\n")
        );
    })
}

const ALPN_HTTP1: &[&[u8]] = &[b"http/1.1"];
const ALPN_HTTP2: &[&[u8]] = &[b"h2"];
const ALPN_HTTP3: &[&[u8]] = &[b"h3"];

fn alpn(version: HttpVersion) -> &'static [&'static [u8]] {
    match version {
        HttpVersion::Http1 => ALPN_HTTP1,
        HttpVersion::Http3 => ALPN_HTTP3,
        _ => ALPN_HTTP2,
    }
}

/// Start serving according to `req`.
pub async fn start(req: &ServerCompatRequest, opts: &ServerOptions) -> Result<ReferenceServer, ServerError> {
    match req.http_version {
        HttpVersion::Unspecified => return Err(ServerError::NoVersion),
        HttpVersion::Http3 if !req.use_tls => return Err(ServerError::Http3WithoutTls),
        _ => {}
    }
    let tls_config = if req.use_tls {
        if opts.cert.is_empty() || opts.key.is_empty() {
            return Err(ServerError::NoCertificate);
        }
        Some(tls::server_config(
            &opts.cert,
            &opts.key,
            &req.client_tls_cert,
            alpn(req.http_version),
        )?)
    } else {
        None
    };
    let pem_cert = if req.use_tls { opts.cert.clone() } else { Vec::new() };

    let stack = reference_handler(req.message_receive_limit, opts.feedback.clone());
    let addr = SocketAddr::new(opts.bind, opts.port);
    let shutdown = CancellationToken::new();

    if req.http_version == HttpVersion::Http3 {
        let handler: Arc<dyn Handler> = Arc::new(TracingHandler::new(stack, trace_logger()));
        let (local_addr, task) = start_http3(addr, tls_config, handler, shutdown.clone())?;
        tracing::info!(%local_addr, "serving HTTP/3");
        return Ok(ReferenceServer {
            local_addr,
            pem_cert,
            shutdown,
            task,
        });
    }

    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    let conn = ConnConfig {
        tls: tls_config.map(|config| TlsAcceptor::from(Arc::new(config))),
        http2: req.http_version == HttpVersion::Http2,
        handler: if req.http_version == HttpVersion::Http2 {
            // HTTP/2 is traced at the connection instead
            stack
        } else {
            Arc::new(TracingHandler::new(stack, trace_logger()))
        },
        collector: trace_logger(),
    };
    tracing::info!(%local_addr, version = ?req.http_version, tls = req.use_tls, "serving");
    let task = tokio::spawn(serve_tcp(listener, Arc::new(conn), shutdown.clone()));
    Ok(ReferenceServer {
        local_addr,
        pem_cert,
        shutdown,
        task,
    })
}

#[cfg(feature = "http3")]
fn start_http3(
    addr: SocketAddr,
    tls: Option<rustls::ServerConfig>,
    handler: Arc<dyn Handler>,
    shutdown: CancellationToken,
) -> Result<(SocketAddr, JoinHandle<()>), ServerError> {
    let tls = tls.ok_or(ServerError::Http3WithoutTls)?;
    let endpoint = h3_server::bind(addr, tls)?;
    let local_addr = endpoint.local_addr()?;
    let task = tokio::spawn(h3_server::serve(endpoint, handler, shutdown));
    Ok((local_addr, task))
}

#[cfg(not(feature = "http3"))]
fn start_http3(
    _addr: SocketAddr,
    _tls: Option<rustls::ServerConfig>,
    _handler: Arc<dyn Handler>,
    _shutdown: CancellationToken,
) -> Result<(SocketAddr, JoinHandle<()>), ServerError> {
    Err(ServerError::Http3Unavailable)
}

// ============================================================================
// HTTP/1 and HTTP/2 over TCP
// ============================================================================

struct ConnConfig {
    tls: Option<TlsAcceptor>,
    http2: bool,
    handler: Arc<dyn Handler>,
    collector: Arc<dyn Collector>,
}

trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

async fn serve_tcp(listener: TcpListener, conn: Arc<ConnConfig>, shutdown: CancellationToken) {
    let mut conns = JoinSet::new();
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::warn!(%err, "failed to accept connection");
                    continue;
                }
            },
        };
        tracing::trace!(%peer, "accepted connection");
        conns.spawn(serve_conn(stream, conn.clone(), shutdown.clone()));
        while conns.try_join_next().is_some() {}
    }
    drop(listener);
    while conns.join_next().await.is_some() {}
}

async fn serve_conn(stream: TcpStream, conn: Arc<ConnConfig>, shutdown: CancellationToken) {
    let mut info = ConnInfo::default();
    let io: Box<dyn Io> = match &conn.tls {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(stream) => {
                info.tls = true;
                info.client_cert_name = stream
                    .get_ref()
                    .1
                    .peer_certificates()
                    .and_then(|certs| certs.first())
                    .and_then(|cert| tls::subject_common_name(cert));
                Box::new(stream)
            }
            Err(err) => {
                tracing::debug!(%err, "TLS handshake failed");
                return;
            }
        },
        None => Box::new(stream),
    };
    let takeover = Arc::new(Takeover::default());
    let io: Box<dyn Io> = if conn.http2 {
        Box::new(TracingHttp2Conn::new(io, true, conn.collector.clone()))
    } else {
        Box::new(Http1Conn::new(io, takeover.clone()))
    };

    let handler = conn.handler.clone();
    let svc = service_fn(move |mut req: Request<Incoming>| {
        let handler = handler.clone();
        let takeover = takeover.clone();
        req.extensions_mut().insert(info.clone());
        let framed_by_hyper = hyper_writes_trailers(&req);
        async move {
            let resp = dispatch(handler, req.map(box_body)).await;
            if framed_by_hyper || !needs_takeover(&resp) {
                return Ok::<_, Infallible>(resp);
            }
            Ok(takeover.replace(resp))
        }
    });

    // Responses that should carry a Date set it themselves.
    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder.http1().auto_date_header(false);
    builder.http2().auto_date_header(false);
    let builder = if conn.http2 {
        builder.http2_only()
    } else {
        builder.http1_only()
    };
    let served = builder.serve_connection(TokioIo::new(io), svc);
    tokio::pin!(served);
    let result = tokio::select! {
        result = served.as_mut() => result,
        _ = shutdown.cancelled() => {
            served.as_mut().graceful_shutdown();
            served.await
        }
    };
    if let Err(err) = result {
        tracing::debug!(%err, "connection ended with error");
    }
}

// ============================================================================
// Runner protocol
// ============================================================================

/// Read the server configuration from `input`, start serving, report where
/// on `output`, and serve until `shutdown` resolves.
pub async fn run<R, W, F>(
    input: R,
    output: W,
    format: RecordFormat,
    opts: ServerOptions,
    shutdown: F,
) -> Result<(), ServerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Future<Output = ()>,
{
    let mut reader = RecordReader::new(input, format, "server input");
    let req: ServerCompatRequest = reader.next().await?.ok_or(ServerError::NoRequest)?;
    let server = start(&req, &opts).await?;
    RecordWriter::new(output, format)
        .write(&server.compat_response())
        .await?;
    shutdown.await;
    tracing::info!("shutting down");
    server.shutdown().await;
    Ok(())
}
