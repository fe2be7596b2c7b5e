//! SASL PLAIN (RFC 4616) for the AUTH command.

use crate::error::{Pop3Error, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

/// SASL mechanisms advertised in CAPA and accepted by AUTH.
pub const SUPPORTED_MECHANISMS: &[&str] = &["PLAIN"];

/// State of an in-progress SASL exchange. While present on the session, the
/// next client line is consumed as a SASL response rather than a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaslExchange {
    pub mechanism: String,
}

/// Decoded PLAIN credentials: `authzid NUL authcid NUL password`.
#[derive(Debug, PartialEq, Eq)]
pub struct PlainCredentials {
    pub authzid: String,
    pub authcid: String,
    pub password: String,
}

/// Decode a base64 SASL response line.
pub fn decode_response(encoded: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(encoded.trim())
        .map_err(|e| Pop3Error::Protocol(format!("invalid base64: {e}")))
}

/// Encode a challenge for a `+ ` continuation line.
pub fn encode_challenge(challenge: &[u8]) -> String {
    BASE64.encode(challenge)
}

/// Parse a decoded PLAIN response into its three NUL-separated parts.
pub fn parse_plain(data: &[u8]) -> Result<PlainCredentials> {
    let text = std::str::from_utf8(data)
        .map_err(|_| Pop3Error::Protocol("PLAIN response is not UTF-8".to_string()))?;

    let parts: Vec<&str> = text.split('\0').collect();
    if parts.len() != 3 {
        return Err(Pop3Error::Protocol(
            "invalid PLAIN response format".to_string(),
        ));
    }
    if parts[1].is_empty() {
        return Err(Pop3Error::AuthenticationFailed);
    }

    Ok(PlainCredentials {
        authzid: parts[0].to_string(),
        authcid: parts[1].to_string(),
        password: parts[2].to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain() {
        let creds = parse_plain(b"\0alice@test.local\0secret").unwrap();
        assert_eq!(
            creds,
            PlainCredentials {
                authzid: String::new(),
                authcid: "alice@test.local".to_string(),
                password: "secret".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_plain_with_authzid() {
        let creds = parse_plain(b"admin\0alice@test.local\0secret").unwrap();
        assert_eq!(creds.authzid, "admin");
        assert_eq!(creds.authcid, "alice@test.local");
    }

    #[test]
    fn test_parse_plain_rejects_bad_shapes() {
        assert!(parse_plain(b"").is_err());
        assert!(parse_plain(b"no-separators").is_err());
        assert!(parse_plain(b"a\0b").is_err());
        assert!(parse_plain(b"a\0b\0c\0d").is_err());
        assert!(parse_plain(b"\0\0password").is_err());
    }

    #[test]
    fn test_decode_response() {
        assert_eq!(decode_response("dGVzdA==").unwrap(), b"test");
        assert_eq!(decode_response("").unwrap(), b"");
        assert!(decode_response("not base64!!").is_err());
    }

    #[test]
    fn test_encode_round_trip() {
        let data = b"\0alice@test.local\0secret";
        assert_eq!(decode_response(&encode_challenge(data)).unwrap(), data);
    }
}
