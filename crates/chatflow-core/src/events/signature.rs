//! Webhook payload signing and verification

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Compute the hex HMAC-SHA256 signature of a payload
pub fn sign(secret: &str, payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a hex HMAC-SHA256 signature in constant time
pub fn verify(secret: &str, payload: &[u8], signature_hex: &str) -> bool {
    let Ok(expected) = hex::decode(signature_hex) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_roundtrip() {
        let signature = sign("secret", b"payload");
        assert!(verify("secret", b"payload", &signature));
    }

    #[test]
    fn test_verify_rejects_tampering() {
        let signature = sign("secret", b"payload");
        assert!(!verify("secret", b"other payload", &signature));
        assert!(!verify("other secret", b"payload", &signature));
        assert!(!verify("secret", b"payload", "not-hex"));
    }
}
