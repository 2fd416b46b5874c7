//! HTTP/3 over QUIC.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, Bytes};
use http::{Response, Version};
use http_body_util::BodyExt;
use rustls::pki_types::CertificateDer;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use connectconf_wire::http::{BoxError, Handler, body_channel, box_body, dispatch};
use connectconf_wire::tls;

use crate::{ConnInfo, ServerError};

type H3Conn = h3::server::Connection<h3_quinn::Connection, Bytes>;
type H3Stream = h3::server::RequestStream<h3_quinn::BidiStream<Bytes>, Bytes>;

pub(crate) fn bind(addr: SocketAddr, tls: rustls::ServerConfig) -> Result<quinn::Endpoint, ServerError> {
    let quic = quinn::crypto::rustls::QuicServerConfig::try_from(tls)
        .map_err(|err| ServerError::Quic(err.to_string()))?;
    let config = quinn::ServerConfig::with_crypto(Arc::new(quic));
    Ok(quinn::Endpoint::server(config, addr)?)
}

pub(crate) async fn serve(endpoint: quinn::Endpoint, handler: Arc<dyn Handler>, shutdown: CancellationToken) {
    let mut conns = JoinSet::new();
    loop {
        let incoming = tokio::select! {
            _ = shutdown.cancelled() => break,
            incoming = endpoint.accept() => match incoming {
                Some(incoming) => incoming,
                None => break,
            },
        };
        conns.spawn(serve_conn(incoming, handler.clone(), shutdown.clone()));
        while conns.try_join_next().is_some() {}
    }
    while conns.join_next().await.is_some() {}
    endpoint.close(0u32.into(), b"shutdown");
    endpoint.wait_idle().await;
}

fn client_cert_name(conn: &quinn::Connection) -> Option<String> {
    let identity = conn.peer_identity()?;
    let certs = identity.downcast::<Vec<CertificateDer<'static>>>().ok()?;
    certs.first().and_then(|cert| tls::subject_common_name(cert))
}

async fn serve_conn(incoming: quinn::Incoming, handler: Arc<dyn Handler>, shutdown: CancellationToken) {
    let conn = match incoming.await {
        Ok(conn) => conn,
        Err(err) => {
            tracing::debug!(%err, "QUIC handshake failed");
            return;
        }
    };
    let info = ConnInfo {
        tls: true,
        client_cert_name: client_cert_name(&conn),
    };
    let mut h3_conn: H3Conn = match h3::server::Connection::new(h3_quinn::Connection::new(conn)).await {
        Ok(h3_conn) => h3_conn,
        Err(err) => {
            tracing::debug!(%err, "HTTP/3 setup failed");
            return;
        }
    };

    let mut streams = JoinSet::new();
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = h3_conn.shutdown(0).await;
                break;
            }
            accepted = h3_conn.accept() => accepted,
        };
        match accepted {
            Ok(Some((mut req, stream))) => {
                *req.version_mut() = Version::HTTP_3;
                req.extensions_mut().insert(info.clone());
                streams.spawn(serve_stream(req, stream, handler.clone()));
            }
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(%err, "HTTP/3 connection ended");
                break;
            }
        }
    }
    while streams.join_next().await.is_some() {}
}

async fn serve_stream(req: http::Request<()>, stream: H3Stream, handler: Arc<dyn Handler>) {
    let (mut send, mut recv) = stream.split();
    let (sender, body) = body_channel();
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

    let resp = dispatch(handler, req.map(|()| box_body(body))).await;
    let result: Result<(), BoxError> = async {
        let (parts, mut body) = resp.into_parts();
        send.send_response(Response::from_parts(parts, ())).await?;
        while let Some(frame) = body.frame().await {
            match frame?.into_data() {
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
        tracing::debug!(%err, "HTTP/3 response failed");
    }
}
