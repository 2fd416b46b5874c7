//! Content types, encoding headers and timeouts of the three protocols.

use std::time::Duration;

use connectconf_proto::{Codec, Protocol};

pub const CONNECT_PROTOCOL_VERSION: &str = "connect-protocol-version";
pub const CONNECT_TIMEOUT: &str = "connect-timeout-ms";
pub const CONNECT_CONTENT_ENCODING: &str = "connect-content-encoding";
pub const CONNECT_ACCEPT_ENCODING: &str = "connect-accept-encoding";
pub const CONNECT_UNARY_TRAILER_PREFIX: &str = "trailer-";
pub const GRPC_TIMEOUT: &str = "grpc-timeout";
pub const GRPC_ENCODING: &str = "grpc-encoding";
pub const GRPC_ACCEPT_ENCODING: &str = "grpc-accept-encoding";
pub const X_GRPC_WEB: &str = "x-grpc-web";

/// Which wire shape a call uses: protocol, codec, and for Connect whether
/// the call is a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Wire {
    pub protocol: Protocol,
    pub codec: Codec,
    /// Only meaningful for Connect. gRPC and gRPC-Web are always enveloped.
    pub streaming: bool,
}

impl Wire {
    pub fn new(protocol: Protocol, codec: Codec, streaming: bool) -> Self {
        Wire {
            protocol,
            codec,
            streaming,
        }
    }

    pub fn content_type(&self) -> String {
        let codec = self.codec.name();
        match self.protocol {
            Protocol::Grpc if self.codec == Codec::Proto => "application/grpc".to_string(),
            Protocol::Grpc => format!("application/grpc+{codec}"),
            Protocol::GrpcWeb => format!("application/grpc-web+{codec}"),
            _ if self.streaming => format!("application/connect+{codec}"),
            _ => format!("application/{codec}"),
        }
    }

    /// Work out the wire shape from a request content type.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let base = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        let sub = base.strip_prefix("application/")?;
        let (protocol, streaming, codec) = if let Some(rest) = sub.strip_prefix("grpc-web") {
            (Protocol::GrpcWeb, true, rest.strip_prefix('+').unwrap_or("proto"))
        } else if let Some(rest) = sub.strip_prefix("grpc") {
            (Protocol::Grpc, true, rest.strip_prefix('+').unwrap_or("proto"))
        } else if let Some(rest) = sub.strip_prefix("connect+") {
            (Protocol::Connect, true, rest)
        } else {
            (Protocol::Connect, false, sub)
        };
        let codec = Codec::from_name(codec)?;
        Some(Wire::new(protocol, codec, streaming))
    }

    /// Bodies made of enveloped messages rather than one bare message.
    pub fn is_enveloped(&self) -> bool {
        self.protocol != Protocol::Connect || self.streaming
    }

    /// Header naming the compression of messages in this wire shape.
    pub fn encoding_header(&self) -> &'static str {
        match self.protocol {
            Protocol::Grpc | Protocol::GrpcWeb => GRPC_ENCODING,
            _ if self.streaming => CONNECT_CONTENT_ENCODING,
            _ => "content-encoding",
        }
    }

    pub fn accept_encoding_header(&self) -> &'static str {
        match self.protocol {
            Protocol::Grpc | Protocol::GrpcWeb => GRPC_ACCEPT_ENCODING,
            _ if self.streaming => CONNECT_ACCEPT_ENCODING,
            _ => "accept-encoding",
        }
    }

    /// Header carrying the call timeout.
    pub fn timeout_header(&self) -> &'static str {
        match self.protocol {
            Protocol::Grpc | Protocol::GrpcWeb => GRPC_TIMEOUT,
            _ => CONNECT_TIMEOUT,
        }
    }
}

/// Render a timeout for `header`.
pub fn encode_timeout(header: &str, timeout: Duration) -> String {
    if header == CONNECT_TIMEOUT {
        return timeout.as_millis().max(1).to_string();
    }
    // gRPC allows at most eight digits per unit.
    const MAX: u128 = 99_999_999;
    let nanos = timeout.as_nanos().max(1);
    let units: [(u128, char); 6] = [
        (1, 'n'),
        (1_000, 'u'),
        (1_000_000, 'm'),
        (1_000_000_000, 'S'),
        (60_000_000_000, 'M'),
        (3_600_000_000_000, 'H'),
    ];
    for (size, unit) in units {
        let value = nanos.div_ceil(size);
        if value <= MAX {
            return format!("{value}{unit}");
        }
    }
    format!("{MAX}H")
}

/// Parse a timeout header value. `None` for missing or malformed values.
pub fn parse_timeout(header: &str, value: &str) -> Option<Duration> {
    if header == CONNECT_TIMEOUT {
        if value.is_empty() || value.len() > 10 {
            return None;
        }
        return value.parse::<u64>().ok().map(Duration::from_millis);
    }
    if value.len() < 2 || value.len() > 9 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    let n: u64 = digits.parse().ok()?;
    Some(match unit {
        "H" => Duration::from_secs(n.saturating_mul(3600)),
        "M" => Duration::from_secs(n.saturating_mul(60)),
        "S" => Duration::from_secs(n),
        "m" => Duration::from_millis(n),
        "u" => Duration::from_micros(n),
        "n" => Duration::from_nanos(n),
        _ => return None,
    })
}
