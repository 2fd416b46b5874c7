//! rustls configuration from PEM material carried in directives.

use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};

/// Common name of the certificate the conformance runner issues to clients.
pub const CLIENT_CERT_NAME: &str = "Conformance Client";
/// Common name of the certificate the conformance runner issues to servers.
pub const SERVER_CERT_NAME: &str = "Conformance Server";

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("{what} is empty")]
    Empty { what: &'static str },

    #[error("failed to parse {what} from given data: {err}")]
    Pem {
        what: &'static str,
        err: std::io::Error,
    },

    #[error("no certificates found in {what}")]
    NoCertificates { what: &'static str },

    #[error("no private key found in {what}")]
    NoKey { what: &'static str },

    #[error("clientCert is not empty but clientKey is")]
    MissingClientKey,

    #[error("clientKey is not empty but clientCert is")]
    MissingClientCert,

    #[error("client cert provided but no server cert")]
    ClientCertWithoutServerCert,

    #[error(transparent)]
    Rustls(#[from] rustls::Error),

    #[error("client cert verifier: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Parse every certificate in a PEM bundle.
pub fn parse_certs(
    pem: &[u8],
    what: &'static str,
) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    if pem.is_empty() {
        return Err(TlsError::Empty { what });
    }
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| TlsError::Pem { what, err })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates { what });
    }
    Ok(certs)
}

/// Parse the first private key in a PEM blob.
pub fn parse_key(pem: &[u8], what: &'static str) -> Result<PrivateKeyDer<'static>, TlsError> {
    if pem.is_empty() {
        return Err(TlsError::Empty { what });
    }
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|err| TlsError::Pem { what, err })?
        .ok_or(TlsError::NoKey { what })
}

fn root_store(pem: &[u8], what: &'static str) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in parse_certs(pem, what)? {
        roots.add(cert)?;
    }
    Ok(roots)
}

/// A client config that trusts exactly `server_cert` and optionally presents
/// a client certificate.
pub fn client_config(
    server_cert: &[u8],
    client_cert: &[u8],
    client_key: &[u8],
    alpn: &[&[u8]],
) -> Result<ClientConfig, TlsError> {
    if server_cert.is_empty() && !client_cert.is_empty() {
        return Err(TlsError::ClientCertWithoutServerCert);
    }
    let roots = root_store(server_cert, "CA cert")?;
    let builder = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots);
    let mut config = match (client_cert.is_empty(), client_key.is_empty()) {
        (false, false) => builder.with_client_auth_cert(
            parse_certs(client_cert, "client cert")?,
            parse_key(client_key, "client key")?,
        )?,
        (false, true) => return Err(TlsError::MissingClientKey),
        (true, false) => return Err(TlsError::MissingClientCert),
        (true, true) => builder.with_no_client_auth(),
    };
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(config)
}

/// A server config presenting `cert`/`key`. When `client_ca` is non-empty,
/// clients must present a certificate signed by it.
pub fn server_config(
    cert: &[u8],
    key: &[u8],
    client_ca: &[u8],
    alpn: &[&[u8]],
) -> Result<ServerConfig, TlsError> {
    let provider = provider();
    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?;
    let builder = if client_ca.is_empty() {
        builder.with_no_client_auth()
    } else {
        let roots = Arc::new(root_store(client_ca, "client CA cert")?);
        let verifier = WebPkiClientVerifier::builder_with_provider(roots, provider).build()?;
        builder.with_client_cert_verifier(verifier)
    };
    let mut config =
        builder.with_single_cert(parse_certs(cert, "cert")?, parse_key(key, "key")?)?;
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(config)
}

// ============================================================================
// Subject common name
// ============================================================================

const OID_COMMON_NAME: [u8; 3] = [0x55, 0x04, 0x03];
const TAG_SEQUENCE: u8 = 0x30;
const TAG_SET: u8 = 0x31;
const TAG_OID: u8 = 0x06;
const TAG_VERSION: u8 = 0xa0;

/// Split one DER TLV off the front of `input`: (tag, content, rest).
fn read_tlv(input: &[u8]) -> Option<(u8, &[u8], &[u8])> {
    let (&tag, rest) = input.split_first()?;
    let (&first, rest) = rest.split_first()?;
    let (len, rest) = if first < 0x80 {
        (first as usize, rest)
    } else {
        let n = (first & 0x7f) as usize;
        if n == 0 || n > 4 || rest.len() < n {
            return None;
        }
        let len = rest[..n].iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
        (len, &rest[n..])
    };
    if rest.len() < len {
        return None;
    }
    Some((tag, &rest[..len], &rest[len..]))
}

/// The subject common name of a DER certificate, if it has one.
pub fn subject_common_name(der: &[u8]) -> Option<String> {
    let (tag, cert, _) = read_tlv(der)?;
    if tag != TAG_SEQUENCE {
        return None;
    }
    let (tag, tbs, _) = read_tlv(cert)?;
    if tag != TAG_SEQUENCE {
        return None;
    }
    let (tag, _, mut rest) = read_tlv(tbs)?;
    if tag == TAG_VERSION {
        // serial number follows an explicit version
        rest = read_tlv(rest)?.2;
    }
    // signature algorithm, issuer, validity
    for _ in 0..3 {
        rest = read_tlv(rest)?.2;
    }
    let (tag, mut subject, _) = read_tlv(rest)?;
    if tag != TAG_SEQUENCE {
        return None;
    }
    while !subject.is_empty() {
        let (tag, mut set, next) = read_tlv(subject)?;
        subject = next;
        if tag != TAG_SET {
            continue;
        }
        while !set.is_empty() {
            let (_, attr, next) = read_tlv(set)?;
            set = next;
            let (tag, oid, value) = read_tlv(attr)?;
            if tag == TAG_OID && oid == OID_COMMON_NAME {
                let (_, name, _) = read_tlv(value)?;
                return Some(String::from_utf8_lossy(name).into_owned());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        if content.len() < 0x80 {
            out.push(content.len() as u8);
        } else {
            out.push(0x82);
            out.extend_from_slice(&(content.len() as u16).to_be_bytes());
        }
        out.extend_from_slice(content);
        out
    }

    fn name(attrs: &[(&[u8; 3], &str)]) -> Vec<u8> {
        let mut sets = Vec::new();
        for (oid, value) in attrs {
            let mut attr = tlv(TAG_OID, &oid[..]);
            attr.extend(tlv(0x0c, value.as_bytes()));
            sets.extend(tlv(TAG_SET, &tlv(TAG_SEQUENCE, &attr)));
        }
        tlv(TAG_SEQUENCE, &sets)
    }

    fn certificate(subject: Vec<u8>, with_version: bool) -> Vec<u8> {
        let mut tbs = Vec::new();
        if with_version {
            tbs.extend(tlv(TAG_VERSION, &tlv(0x02, &[2])));
        }
        tbs.extend(tlv(0x02, &[0x01, 0x23]));
        tbs.extend(tlv(TAG_SEQUENCE, &tlv(TAG_OID, &[0x2a, 0x86, 0x48])));
        tbs.extend(name(&[(&OID_COMMON_NAME, "Issuer")]));
        tbs.extend(tlv(TAG_SEQUENCE, &[0x17, 0x00, 0x17, 0x00]));
        tbs.extend(subject);
        let mut cert = tlv(TAG_SEQUENCE, &tbs);
        cert.extend(tlv(TAG_SEQUENCE, &[]));
        cert.extend(tlv(0x03, &[0x00; 140]));
        tlv(TAG_SEQUENCE, &cert)
    }

    #[test]
    fn finds_subject_common_name() {
        let subject = name(&[
            (&[0x55, 0x04, 0x0a], "ConnectRPC"),
            (&OID_COMMON_NAME, CLIENT_CERT_NAME),
        ]);
        let der = certificate(subject, true);
        assert_eq!(subject_common_name(&der).as_deref(), Some(CLIENT_CERT_NAME));
    }

    #[test]
    fn version_is_optional() {
        let der = certificate(name(&[(&OID_COMMON_NAME, "v1 cert")]), false);
        assert_eq!(subject_common_name(&der).as_deref(), Some("v1 cert"));
    }

    #[test]
    fn no_common_name() {
        let der = certificate(name(&[(&[0x55, 0x04, 0x0a], "ConnectRPC")]), true);
        assert_eq!(subject_common_name(&der), None);
        assert_eq!(subject_common_name(&[0x30, 0x05, 0x00]), None);
    }

    #[test]
    fn client_creds_need_a_server_cert() {
        let err = client_config(b"", b"cert", b"key", &[]).unwrap_err();
        assert_eq!(err.to_string(), "client cert provided but no server cert");
    }

    #[test]
    fn garbage_pem_has_no_certificates() {
        let err = client_config(b"not a pem file", b"", b"", &[]).unwrap_err();
        assert!(matches!(err, TlsError::NoCertificates { .. }), "{err}");
    }
}
