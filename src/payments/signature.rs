//! Webhook signature verification
//!
//! The provider signs the raw request body with HMAC-SHA256 under a shared
//! secret. Verification fails closed: a configured secret means every request
//! must carry a matching signature.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("signature header missing")]
    Missing,

    #[error("signature is neither hex nor base64")]
    Malformed,

    #[error("signature does not match payload")]
    Mismatch,

    #[error("no signing secret configured")]
    SecretNotConfigured,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureCheck {
    Verified,
    /// No secret configured and unsigned webhooks explicitly allowed.
    Skipped,
}

#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Option<String>,
    allow_unsigned: bool,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("allow_unsigned", &self.allow_unsigned)
            .finish()
    }
}

impl SignatureVerifier {
    /// `allow_unsigned` only has an effect when `secret` is empty.
    pub fn new(secret: Option<String>, allow_unsigned: bool) -> Self {
        let secret = secret.filter(|s| !s.trim().is_empty());
        Self {
            secret,
            allow_unsigned,
        }
    }

    pub fn is_enforcing(&self) -> bool {
        self.secret.is_some()
    }

    pub fn verify(
        &self,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<SignatureCheck, SignatureError> {
        let secret = match &self.secret {
            Some(secret) => secret,
            None if self.allow_unsigned => return Ok(SignatureCheck::Skipped),
            None => return Err(SignatureError::SecretNotConfigured),
        };

        let provided = signature
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(SignatureError::Missing)?;
        let provided = decode_signature(provided)?;

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| SignatureError::SecretNotConfigured)?;
        mac.update(body);

        // verify_slice compares in constant time
        mac.verify_slice(&provided)
            .map(|_| SignatureCheck::Verified)
            .map_err(|_| SignatureError::Mismatch)
    }
}

fn decode_signature(raw: &str) -> Result<Vec<u8>, SignatureError> {
    let raw = raw.strip_prefix("sha256=").unwrap_or(raw);

    if raw.len() == 64 {
        if let Ok(bytes) = hex::decode(raw) {
            return Ok(bytes);
        }
    }

    STANDARD.decode(raw).map_err(|_| SignatureError::Malformed)
}

/// Hex HMAC-SHA256 of `body`, the format providers send.
pub fn sign(secret: &str, body: &[u8]) -> String {
    // HMAC accepts keys of any length
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC key of any size");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_key";

    fn verifier() -> SignatureVerifier {
        SignatureVerifier::new(Some(SECRET.to_string()), false)
    }

    #[test]
    fn test_valid_hex_signature() {
        let body = br#"{"amount":5000}"#;
        let signature = sign(SECRET, body);
        assert_eq!(
            verifier().verify(body, Some(&signature)),
            Ok(SignatureCheck::Verified)
        );
        let prefixed = format!("sha256={}", signature);
        assert_eq!(
            verifier().verify(body, Some(&prefixed)),
            Ok(SignatureCheck::Verified)
        );
    }

    #[test]
    fn test_valid_base64_signature() {
        let body = br#"{"amount":5000}"#;
        let mut mac = HmacSha256::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(body);
        let signature = STANDARD.encode(mac.finalize().into_bytes());
        assert_eq!(
            verifier().verify(body, Some(&signature)),
            Ok(SignatureCheck::Verified)
        );
    }

    #[test]
    fn test_tampered_body_is_rejected() {
        let signature = sign(SECRET, br#"{"amount":5000}"#);
        assert_eq!(
            verifier().verify(br#"{"amount":50}"#, Some(&signature)),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_missing_and_garbage_signatures() {
        let body = b"{}";
        assert_eq!(verifier().verify(body, None), Err(SignatureError::Missing));
        assert_eq!(verifier().verify(body, Some("  ")), Err(SignatureError::Missing));
        assert_eq!(
            verifier().verify(body, Some("not a signature!")),
            Err(SignatureError::Malformed)
        );
    }

    #[test]
    fn test_no_secret_fails_closed_unless_opted_in() {
        let closed = SignatureVerifier::new(None, false);
        assert_eq!(
            closed.verify(b"{}", None),
            Err(SignatureError::SecretNotConfigured)
        );

        let open = SignatureVerifier::new(Some("   ".to_string()), true);
        assert!(!open.is_enforcing());
        assert_eq!(open.verify(b"{}", None), Ok(SignatureCheck::Skipped));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let printed = format!("{:?}", verifier());
        assert!(!printed.contains(SECRET));
    }
}
