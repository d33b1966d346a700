//! VLESS-style handshake parsing and serialization.
//!
//! The handshake travels base64url-encoded inside the WebSocket negotiation
//! header and decodes to a compact binary layout: version byte, 16-byte auth
//! token, a length-prefixed addon region that is skipped, then destination
//! port, address type, address value, and any leading payload to forward.
//! Parsing is zero-copy: [`HandshakeRef`] borrows from the decoded buffer.

use base64::alphabet;
use base64::engine::{DecodePaddingMode, Engine, GeneralPurpose, GeneralPurposeConfig};
use bytes::BytesMut;

/// Auth token length in bytes.
pub const TOKEN_LEN: usize = 16;
/// Minimum decoded handshake length: version + token + addon-length byte.
pub const MIN_HANDSHAKE: usize = 1 + TOKEN_LEN + 1;
/// Maximum domain name length.
pub const MAX_DOMAIN_LEN: usize = 255;
/// Length of the downlink response prefix sent ahead of the first chunk.
pub const RESPONSE_PREFIX_LEN: usize = 2;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x02;
pub const ATYP_IPV6: u8 = 0x03;

/// Clients encode without padding but padded input is accepted as well.
const B64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// The negotiation header is not valid base64url.
    InvalidEncoding,
    /// Decoded handshake is shorter than the minimum header.
    TooShort,
    /// A computed offset runs past the end of the buffer.
    Truncated,
    InvalidAddressType,
    InvalidDomainLength,
    InvalidUtf8,
}

/// Errors that can occur when writing a handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteError {
    /// Token must be exactly 16 bytes.
    InvalidTokenLen,
    /// Domain name exceeds 255 bytes.
    DomainTooLong,
    /// Addon region exceeds 255 bytes.
    AddonTooLong,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostRef<'a> {
    Ipv4([u8; 4]),
    Ipv6([u8; 16]),
    Domain(&'a [u8]),
}

/// Address kind of a parsed destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrKind {
    Ipv4,
    Domain,
    Ipv6,
}

/// Zero-copy view of a decoded handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRef<'a> {
    pub version: u8,
    /// Exactly [`TOKEN_LEN`] bytes.
    pub token: &'a [u8],
    pub host: HostRef<'a>,
    pub port: u16,
    /// Offset of the first payload byte following the header.
    pub payload_offset: usize,
    pub payload: &'a [u8],
}

/// A dialable destination, derived once from a valid handshake. Immutable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub host: String,
    pub port: u16,
    pub kind: AddrKind,
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            AddrKind::Ipv6 => write!(f, "[{}]:{}", self.host, self.port),
            _ => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

impl HandshakeRef<'_> {
    /// Render the destination into its dialable string form.
    ///
    /// IPv4 renders dotted-quad, IPv6 renders eight uncompressed hextets
    /// joined by `:` (sufficient for dialing), domains render as UTF-8.
    pub fn destination(&self) -> Destination {
        match &self.host {
            HostRef::Ipv4(octets) => Destination {
                host: format!("{}.{}.{}.{}", octets[0], octets[1], octets[2], octets[3]),
                port: self.port,
                kind: AddrKind::Ipv4,
            },
            HostRef::Ipv6(octets) => {
                let mut host = String::with_capacity(39);
                for (i, pair) in octets.chunks_exact(2).enumerate() {
                    if i > 0 {
                        host.push(':');
                    }
                    let hextet = u16::from_be_bytes([pair[0], pair[1]]);
                    host.push_str(&format!("{hextet:x}"));
                }
                Destination {
                    host,
                    port: self.port,
                    kind: AddrKind::Ipv6,
                }
            }
            // Domains are validated UTF-8 during parsing.
            HostRef::Domain(domain) => Destination {
                host: String::from_utf8_lossy(domain).into_owned(),
                port: self.port,
                kind: AddrKind::Domain,
            },
        }
    }
}

/// Conservative decoded size for an encoded negotiation header.
///
/// May exceed the actual decoded length by up to two bytes; size the scratch
/// buffer with this and truncate to what [`decode_negotiation`] returns.
#[inline]
pub fn decoded_len(encoded: &str) -> usize {
    base64::decoded_len_estimate(encoded.len())
}

/// Decode the base64url negotiation header into `out`, returning the number
/// of decoded bytes.
#[inline]
pub fn decode_negotiation(encoded: &str, out: &mut [u8]) -> Result<usize, ParseError> {
    B64.decode_slice(encoded.as_bytes(), out)
        .map_err(|_| ParseError::InvalidEncoding)
}

/// Encode a raw handshake for the negotiation header (no padding).
#[inline]
pub fn encode_negotiation(raw: &[u8]) -> String {
    let mut out = B64.encode(raw);
    // Indifferent-padding engines still emit padding on encode; strip it to
    // match what clients put in the header.
    while out.ends_with('=') {
        out.pop();
    }
    out
}

/// Parse a decoded handshake buffer.
#[inline]
pub fn parse_handshake(buf: &[u8]) -> Result<HandshakeRef<'_>, ParseError> {
    if buf.len() < MIN_HANDSHAKE {
        return Err(ParseError::TooShort);
    }

    let version = buf[0];
    let token = &buf[1..1 + TOKEN_LEN];
    let addon_len = buf[MIN_HANDSHAKE - 1] as usize;

    // Addon bytes are opaque and skipped entirely.
    let addr_off = MIN_HANDSHAKE + addon_len;
    if buf.len() < addr_off + 3 {
        return Err(ParseError::Truncated);
    }
    let port = u16::from_be_bytes([buf[addr_off], buf[addr_off + 1]]);
    let atype = buf[addr_off + 2];

    let base = addr_off + 3;
    let (host, payload_offset) = match atype {
        ATYP_IPV4 => {
            let end = base + 4;
            if buf.len() < end {
                return Err(ParseError::Truncated);
            }
            let host = HostRef::Ipv4([buf[base], buf[base + 1], buf[base + 2], buf[base + 3]]);
            (host, end)
        }
        ATYP_DOMAIN => {
            if buf.len() < base + 1 {
                return Err(ParseError::Truncated);
            }
            let len = buf[base] as usize;
            if len == 0 {
                return Err(ParseError::InvalidDomainLength);
            }
            let end = base + 1 + len;
            if buf.len() < end {
                return Err(ParseError::Truncated);
            }
            let domain = &buf[base + 1..end];
            if std::str::from_utf8(domain).is_err() {
                return Err(ParseError::InvalidUtf8);
            }
            (HostRef::Domain(domain), end)
        }
        ATYP_IPV6 => {
            let end = base + 16;
            if buf.len() < end {
                return Err(ParseError::Truncated);
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[base..end]);
            (HostRef::Ipv6(octets), end)
        }
        _ => return Err(ParseError::InvalidAddressType),
    };

    Ok(HandshakeRef {
        version,
        token,
        host,
        port,
        payload_offset,
        payload: &buf[payload_offset..],
    })
}

/// Writes a handshake header (and optional payload) to the buffer.
///
/// # Errors
/// - `InvalidTokenLen` if the token is not exactly 16 bytes.
/// - `AddonTooLong` if the addon region exceeds 255 bytes.
/// - `DomainTooLong` if a domain host exceeds 255 bytes.
#[allow(clippy::cast_possible_truncation)]
pub fn write_handshake(
    buf: &mut BytesMut,
    version: u8,
    token: &[u8],
    addons: &[u8],
    host: &HostRef<'_>,
    port: u16,
) -> Result<(), WriteError> {
    if token.len() != TOKEN_LEN {
        return Err(WriteError::InvalidTokenLen);
    }
    if addons.len() > u8::MAX as usize {
        return Err(WriteError::AddonTooLong);
    }
    if let HostRef::Domain(d) = host
        && d.len() > MAX_DOMAIN_LEN
    {
        return Err(WriteError::DomainTooLong);
    }

    buf.extend_from_slice(&[version]);
    buf.extend_from_slice(token);
    buf.extend_from_slice(&[addons.len() as u8]);
    buf.extend_from_slice(addons);
    buf.extend_from_slice(&port.to_be_bytes());
    match host {
        HostRef::Ipv4(octets) => {
            buf.extend_from_slice(&[ATYP_IPV4]);
            buf.extend_from_slice(octets);
        }
        HostRef::Domain(domain) => {
            buf.extend_from_slice(&[ATYP_DOMAIN, domain.len() as u8]);
            buf.extend_from_slice(domain);
        }
        HostRef::Ipv6(octets) => {
            buf.extend_from_slice(&[ATYP_IPV6]);
            buf.extend_from_slice(octets);
        }
    }
    Ok(())
}

/// The two-byte prefix sent ahead of the first downlink chunk: echoed
/// protocol version plus a reserved zero byte.
#[inline]
pub fn response_prefix(version: u8) -> [u8; RESPONSE_PREFIX_LEN] {
    [version, 0x00]
}
