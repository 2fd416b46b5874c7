//! HTTP transports, cached by HTTP version and TLS material.
//!
//! HTTP/1 opens a connection per request. HTTP/2 shares one connection per
//! transport and reconnects when it closes. HTTP/3 needs the `http3` feature.

use std::sync::Arc;

use dashmap::DashMap;
use http::header::HOST;
use http::uri::{Authority, PathAndQuery};
use http::{HeaderValue, Request, Uri, Version};
use hyper::client::conn::{http1, http2};
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;

use connectconf_proto::{ClientCompatRequest, HttpVersion};
use connectconf_wire::http::{Body, BoxError, ResponseFuture, RoundTrip, box_body};
use connectconf_wire::tls::{self, TlsError};

/// Suffix of the bidi procedure, which may run half-duplex over HTTP/1.
const BIDI_SUFFIX: &str = "/BidiStream";

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("an HTTP version must be specified")]
    NoVersion,

    #[error("HTTP/3 indicated in request but no TLS info provided")]
    Http3WithoutTls,

    #[error("HTTP/3 support is not compiled in")]
    Http3Unavailable,

    #[error("request indicated TLS client credentials but not server TLS cert provided")]
    ClientCredsWithoutServerCert,

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("failed to set up HTTP/3 endpoint: {0}")]
    Quic(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct TransportKey {
    version: HttpVersion,
    server_cert: Vec<u8>,
    client_cert: Vec<u8>,
    client_key: Vec<u8>,
}

impl TransportKey {
    fn of(req: &ClientCompatRequest) -> Self {
        let (client_cert, client_key) = match &req.client_tls_creds {
            Some(creds) => (creds.cert.clone(), creds.key.clone()),
            None => Default::default(),
        };
        TransportKey {
            version: req.http_version,
            server_cert: req.server_tls_cert.clone(),
            client_cert,
            client_key,
        }
    }
}

/// Transports shared by every test case with the same settings.
#[derive(Default)]
pub struct Transports {
    cache: DashMap<TransportKey, Arc<dyn RoundTrip>>,
}

impl Transports {
    pub fn new() -> Self {
        Self::default()
    }

    /// The transport for `req`, built on first use.
    pub fn get(&self, req: &ClientCompatRequest) -> Result<Arc<dyn RoundTrip>, TransportError> {
        let key = TransportKey::of(req);
        if let Some(found) = self.cache.get(&key) {
            return Ok(found.clone());
        }
        let built = build(&key)?;
        // a concurrent miss may have won; use its transport
        Ok(self.cache.entry(key).or_insert(built).clone())
    }
}

fn build(key: &TransportKey) -> Result<Arc<dyn RoundTrip>, TransportError> {
    if key.server_cert.is_empty() && !key.client_cert.is_empty() {
        return Err(TransportError::ClientCredsWithoutServerCert);
    }
    let tls = |alpn: &[&[u8]]| -> Result<Option<TlsConnector>, TransportError> {
        if key.server_cert.is_empty() {
            return Ok(None);
        }
        let config = tls::client_config(&key.server_cert, &key.client_cert, &key.client_key, alpn)?;
        Ok(Some(TlsConnector::from(Arc::new(config))))
    };
    match key.version {
        HttpVersion::Http1 => Ok(Arc::new(Http1Transport {
            tls: tls(&[b"http/1.1"])?,
        })),
        HttpVersion::Http2 => Ok(Arc::new(Http2Transport {
            tls: tls(&[b"h2"])?,
            conn: Arc::new(Mutex::new(None)),
        })),
        HttpVersion::Http3 => {
            if key.server_cert.is_empty() {
                return Err(TransportError::Http3WithoutTls);
            }
            http3_transport(key)
        }
        HttpVersion::Unspecified => Err(TransportError::NoVersion),
    }
}

#[cfg(feature = "http3")]
fn http3_transport(key: &TransportKey) -> Result<Arc<dyn RoundTrip>, TransportError> {
    let config = tls::client_config(&key.server_cert, &key.client_cert, &key.client_key, &[b"h3"])?;
    Ok(Arc::new(h3_transport::Http3Transport::new(config)?))
}

#[cfg(not(feature = "http3"))]
fn http3_transport(_key: &TransportKey) -> Result<Arc<dyn RoundTrip>, TransportError> {
    Err(TransportError::Http3Unavailable)
}

// ============================================================================
// Connecting
// ============================================================================

fn authority(uri: &Uri) -> Result<Authority, BoxError> {
    uri.authority()
        .cloned()
        .ok_or_else(|| format!("request URI {uri} has no host").into())
}

/// `host:port` to dial, filling in the scheme's default port.
fn dial_addr(uri: &Uri, authority: &Authority) -> String {
    let port = authority.port_u16().unwrap_or(match uri.scheme_str() {
        Some("https") => 443,
        _ => 80,
    });
    format!("{}:{port}", authority.host())
}

fn server_name(authority: &Authority) -> Result<ServerName<'static>, BoxError> {
    let host = authority.host().trim_start_matches('[').trim_end_matches(']');
    Ok(ServerName::try_from(host.to_string())?)
}

async fn dial(uri: &Uri) -> Result<(TcpStream, Authority), BoxError> {
    let authority = authority(uri)?;
    let stream = TcpStream::connect(dial_addr(uri, &authority)).await?;
    stream.set_nodelay(true)?;
    Ok((stream, authority))
}

async fn http1_handshake<IO>(io: IO) -> Result<http1::SendRequest<Body>, BoxError>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, conn) = http1::handshake(TokioIo::new(io)).await?;
    tokio::spawn(async move {
        if let Err(err) = conn.await {
            tracing::debug!(%err, "HTTP/1 connection failed");
        }
    });
    Ok(sender)
}

async fn http2_handshake<IO>(io: IO) -> Result<http2::SendRequest<Body>, BoxError>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, conn) = http2::handshake(TokioExecutor::new(), TokioIo::new(io)).await?;
    tokio::spawn(async move {
        if let Err(err) = conn.await {
            tracing::debug!(%err, "HTTP/2 connection failed");
        }
    });
    Ok(sender)
}

// ============================================================================
// HTTP/1.1
// ============================================================================

struct Http1Transport {
    tls: Option<TlsConnector>,
}

impl RoundTrip for Http1Transport {
    fn round_trip(&self, req: Request<Body>) -> ResponseFuture {
        let tls = self.tls.clone();
        Box::pin(async move {
            let (mut parts, body) = req.into_parts();
            let (stream, authority) = dial(&parts.uri).await?;
            let mut sender = match tls {
                Some(tls) => {
                    let stream = tls.connect(server_name(&authority)?, stream).await?;
                    http1_handshake(stream).await?
                }
                None => http1_handshake(stream).await?,
            };

            let bidi = parts.uri.path().ends_with(BIDI_SUFFIX);
            if !parts.headers.contains_key(HOST) {
                parts
                    .headers
                    .insert(HOST, HeaderValue::from_str(authority.as_str())?);
            }
            let origin = parts
                .uri
                .path_and_query()
                .cloned()
                .unwrap_or_else(|| PathAndQuery::from_static("/"));
            parts.uri = Uri::from(origin);
            parts.version = Version::HTTP_11;

            let resp = sender.send_request(Request::from_parts(parts, body)).await?;
            let mut resp = resp.map(box_body);
            if bidi {
                // half-duplex bidi works over HTTP/1
                *resp.version_mut() = Version::HTTP_2;
            }
            Ok(resp)
        })
    }
}

// ============================================================================
// HTTP/2
// ============================================================================

struct Http2Transport {
    tls: Option<TlsConnector>,
    conn: Arc<Mutex<Option<http2::SendRequest<Body>>>>,
}

impl Http2Transport {
    /// The live shared connection, dialing a new one if it closed.
    async fn sender(
        tls: Option<TlsConnector>,
        slot: &Mutex<Option<http2::SendRequest<Body>>>,
        uri: &Uri,
    ) -> Result<http2::SendRequest<Body>, BoxError> {
        let mut slot = slot.lock().await;
        if let Some(sender) = slot.as_ref()
            && !sender.is_closed()
        {
            return Ok(sender.clone());
        }
        let (stream, authority) = dial(uri).await?;
        let sender = match tls {
            Some(tls) => {
                let stream = tls.connect(server_name(&authority)?, stream).await?;
                http2_handshake(stream).await?
            }
            None => http2_handshake(stream).await?,
        };
        *slot = Some(sender.clone());
        Ok(sender)
    }
}

impl RoundTrip for Http2Transport {
    fn round_trip(&self, mut req: Request<Body>) -> ResponseFuture {
        let tls = self.tls.clone();
        let conn = self.conn.clone();
        Box::pin(async move {
            *req.version_mut() = Version::HTTP_2;
            let mut sender = Http2Transport::sender(tls, &conn, req.uri()).await?;
            sender.ready().await?;
            let resp = sender.send_request(req).await?;
            Ok(resp.map(box_body))
        })
    }
}

// ============================================================================
// HTTP/3
// ============================================================================

#[cfg(feature = "http3")]
mod h3_transport {
    use std::future::poll_fn;
    use std::net::SocketAddr;
    use std::sync::Arc;

    use bytes::{Buf, Bytes};
    use http::{Request, Version};
    use http_body_util::BodyExt;

    use connectconf_wire::http::{Body, BoxError, ResponseFuture, RoundTrip, body_channel, box_body};

    use super::{TransportError, authority, dial_addr};

    pub(super) struct Http3Transport {
        endpoint: quinn::Endpoint,
    }

    impl Http3Transport {
        pub(super) fn new(tls: rustls::ClientConfig) -> Result<Self, TransportError> {
            let quic = quinn::crypto::rustls::QuicClientConfig::try_from(tls)
                .map_err(|err| TransportError::Quic(err.to_string()))?;
            let bind: SocketAddr = ([0, 0, 0, 0], 0).into();
            let mut endpoint =
                quinn::Endpoint::client(bind).map_err(|err| TransportError::Quic(err.to_string()))?;
            endpoint.set_default_client_config(quinn::ClientConfig::new(Arc::new(quic)));
            Ok(Http3Transport { endpoint })
        }
    }

    impl RoundTrip for Http3Transport {
        fn round_trip(&self, req: Request<Body>) -> ResponseFuture {
            let endpoint = self.endpoint.clone();
            Box::pin(async move {
                let (mut parts, mut body) = req.into_parts();
                let authority = authority(&parts.uri)?;
                let addr = tokio::net::lookup_host(dial_addr(&parts.uri, &authority))
                    .await?
                    .next()
                    .ok_or("host did not resolve to any address")?;
                let conn = endpoint.connect(addr, authority.host())?.await?;
                let (mut driver, mut send_request) =
                    h3::client::new(h3_quinn::Connection::new(conn)).await?;
                tokio::spawn(async move {
                    if let Err(err) = poll_fn(|cx| driver.poll_close(cx)).await {
                        tracing::debug!(%err, "HTTP/3 connection closed");
                    }
                });

                parts.version = Version::HTTP_3;
                let stream = send_request
                    .send_request(Request::from_parts(parts, ()))
                    .await?;
                let (mut send, mut recv) = stream.split();

                tokio::spawn(async move {
                    let result: Result<(), BoxError> = async {
                        while let Some(frame) = body.frame().await {
                            let frame = frame?;
                            match frame.into_data() {
                                Ok(data) => send.send_data(data).await?,
                                Err(frame) => {
                                    if let Ok(trailers) = frame.into_trailers() {
                                        send.send_trailers(trailers).await?;
                                    }
                                }
                            }
                        }
                        send.finish().await?;
                        Ok(())
                    }
                    .await;
                    if let Err(err) = result {
                        tracing::debug!(%err, "HTTP/3 request body failed");
                    }
                });

                let head = recv.recv_response().await?;
                let (sender, resp_body) = body_channel();
                tokio::spawn(async move {
                    loop {
                        match recv.recv_data().await {
                            Ok(Some(mut chunk)) => {
                                let data: Bytes = chunk.copy_to_bytes(chunk.remaining());
                                if sender.send_data(data).is_err() {
                                    return;
                                }
                            }
                            Ok(None) => break,
                            Err(err) => {
                                sender.abort(Box::new(err));
                                return;
                            }
                        }
                    }
                    match recv.recv_trailers().await {
                        Ok(Some(trailers)) => {
                            let _ = sender.send_trailers(trailers);
                        }
                        Ok(None) => {}
                        Err(err) => sender.abort(Box::new(err)),
                    }
                });
                Ok(head.map(|()| box_body(resp_body)))
            })
        }
    }
}
