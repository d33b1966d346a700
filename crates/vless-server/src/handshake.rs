//! Handshake processing: decode, authenticate, parse.
//!
//! Runs entirely before the upgrade is accepted. The scratch buffer backing
//! the decoded handshake comes from the shared arena and goes back on every
//! exit path; on success the leading payload is copied out first, so the
//! release happens only after the forwarded bytes have their own storage.

use bytes::Bytes;
use vless_core::defaults::TOKEN_LEN;
use vless_proto::{Destination, MIN_HANDSHAKE};

use crate::error::ServerError;
use crate::state::ServerState;

/// Outcome of a validated handshake, ready to dial.
#[derive(Debug)]
pub struct ParsedHandshake {
    pub version: u8,
    pub destination: Destination,
    /// Leading payload bytes to forward before the first uplink message.
    pub initial_payload: Bytes,
}

/// Decode the negotiation header, check the auth token, parse the header.
pub fn authenticate_handshake(
    negotiation: Option<&str>,
    state: &ServerState,
) -> Result<ParsedHandshake, ServerError> {
    // Absence is checked before any allocation.
    let encoded = negotiation.ok_or(ServerError::MissingHandshake)?;

    let mut scratch = state.arena.acquire(vless_proto::decoded_len(encoded));
    let n = match vless_proto::decode_negotiation(encoded, &mut scratch) {
        Ok(n) => n,
        Err(_) => {
            state.arena.release(scratch);
            return Err(ServerError::MalformedHandshake);
        }
    };
    scratch.truncate(n);

    if scratch.len() < MIN_HANDSHAKE {
        state.arena.release(scratch);
        return Err(ServerError::MalformedHandshake);
    }

    // Byte-wise token check at offset 1. Not a hardened comparison; the
    // transport boundary does not present itself as one.
    if scratch[1..1 + TOKEN_LEN] != state.token {
        state.arena.release(scratch);
        return Err(ServerError::AuthenticationFailed);
    }

    let parsed = match vless_proto::parse_handshake(&scratch) {
        Ok(hs) => ParsedHandshake {
            version: hs.version,
            destination: hs.destination(),
            // Copying here transfers ownership of the forwarded bytes out of
            // the scratch buffer, making the release below safe.
            initial_payload: Bytes::copy_from_slice(hs.payload),
        },
        Err(e) => {
            state.arena.release(scratch);
            return Err(ServerError::MalformedHeader(e));
        }
    };
    state.arena.release(scratch);
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_state;
    use bytes::BytesMut;
    use vless_proto::{HostRef, encode_negotiation, write_handshake};

    fn encode(token: &[u8], host: &HostRef<'_>, port: u16, payload: &[u8]) -> String {
        let mut buf = BytesMut::new();
        write_handshake(&mut buf, 0, token, &[], host, port).unwrap();
        buf.extend_from_slice(payload);
        encode_negotiation(&buf)
    }

    #[test]
    fn valid_handshake_parses() {
        let state = test_state();
        let encoded = encode(&state.token, &HostRef::Ipv4([93, 184, 216, 34]), 443, b"hi");
        let parsed = authenticate_handshake(Some(&encoded), &state).unwrap();
        assert_eq!(parsed.version, 0);
        assert_eq!(parsed.destination.host, "93.184.216.34");
        assert_eq!(parsed.destination.port, 443);
        assert_eq!(&parsed.initial_payload[..], b"hi");
    }

    #[test]
    fn missing_header_rejected_before_allocation() {
        let state = test_state();
        let before = state.arena.stats();
        assert!(matches!(
            authenticate_handshake(None, &state),
            Err(ServerError::MissingHandshake)
        ));
        assert_eq!(state.arena.stats(), before);
    }

    #[test]
    fn undecodable_header_is_malformed() {
        let state = test_state();
        assert!(matches!(
            authenticate_handshake(Some("!!not-base64!!"), &state),
            Err(ServerError::MalformedHandshake)
        ));
    }

    #[test]
    fn short_handshake_is_malformed() {
        let state = test_state();
        let encoded = encode_negotiation(&[0u8; 17]);
        assert!(matches!(
            authenticate_handshake(Some(&encoded), &state),
            Err(ServerError::MalformedHandshake)
        ));
    }

    #[test]
    fn wrong_token_byte_fails_auth() {
        let state = test_state();
        let mut token = state.token;
        token[TOKEN_LEN - 1] ^= 0x01;
        let encoded = encode(&token, &HostRef::Ipv4([1, 2, 3, 4]), 80, &[]);
        assert!(matches!(
            authenticate_handshake(Some(&encoded), &state),
            Err(ServerError::AuthenticationFailed)
        ));
    }

    #[test]
    fn auth_and_short_rejections_share_status() {
        // Externally a bad token must look exactly like a too-short handshake.
        let state = test_state();
        let mut token = state.token;
        token[TOKEN_LEN - 1] ^= 0x01;
        let bad_token = encode(&token, &HostRef::Ipv4([1, 2, 3, 4]), 80, &[]);
        let short = encode_negotiation(&[0u8; 17]);

        let a = authenticate_handshake(Some(&bad_token), &state).unwrap_err();
        let b = authenticate_handshake(Some(&short), &state).unwrap_err();
        assert_eq!(a.reject_status(), b.reject_status());
    }

    #[test]
    fn truncated_header_is_malformed_header() {
        let state = test_state();
        let mut buf = BytesMut::new();
        write_handshake(&mut buf, 0, &state.token, &[], &HostRef::Ipv4([1, 2, 3, 4]), 80).unwrap();
        let encoded = encode_negotiation(&buf[..buf.len() - 2]);
        assert!(matches!(
            authenticate_handshake(Some(&encoded), &state),
            Err(ServerError::MalformedHeader(_))
        ));
    }

    #[test]
    fn scratch_released_on_every_path() {
        // An oversized handshake bypasses the 256-byte test arena region, so
        // its buffer must come back through the recycle pool — observable on
        // both the failure and success paths.
        let state = test_state();
        let mut token = state.token;
        token[0] ^= 0xff;
        let bad = encode(&token, &HostRef::Ipv4([1, 2, 3, 4]), 80, &[0u8; 512]);
        assert_eq!(state.arena.stats().pooled, 0);
        let _ = authenticate_handshake(Some(&bad), &state).unwrap_err();
        assert_eq!(state.arena.stats().pooled, 1);

        let good = encode(&state.token, &HostRef::Ipv4([1, 2, 3, 4]), 80, &[0u8; 512]);
        authenticate_handshake(Some(&good), &state).unwrap();
        assert_eq!(state.arena.stats().pooled, 1, "pooled buffer was reused and returned");
    }
}
