//! Webhook signature verification.
//!
//! GitHub signs each delivery with HMAC-SHA256 over the raw request body and
//! sends the hex digest as `X-Hub-Signature-256: sha256=<hex>`. Verification
//! must run on the exact bytes received: re-serializing the JSON first would
//! break any payload whose encoding is not byte-stable.

use hmac::{Hmac, Mac};
use sha2::Sha256;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

const SIGNATURE_PREFIX: &str = "sha256=";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Accepted,
    Unauthorized,
}

#[derive(Clone)]
pub struct SignatureVerifier {
    secret: String,
}

impl SignatureVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Check `signature` (the header value, if any) against `payload`.
    pub fn verify(&self, payload: &[u8], signature: Option<&str>) -> Verification {
        let Some(signature_hex) = signature.and_then(|s| s.strip_prefix(SIGNATURE_PREFIX)) else {
            return Verification::Unauthorized;
        };

        let signature_bytes = match hex::decode(signature_hex) {
            Ok(bytes) => bytes,
            Err(_) => return Verification::Unauthorized,
        };

        let mut mac = match HmacSha256::new_from_slice(self.secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return Verification::Unauthorized,
        };
        mac.update(payload);

        // Constant-time comparison
        match mac.verify_slice(&signature_bytes) {
            Ok(()) => Verification::Accepted,
            Err(_) => Verification::Unauthorized,
        }
    }
}

/// Compute the header value GitHub would send for `payload`.
pub fn sign(secret: &str, payload: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(payload);
    format!("{}{}", SIGNATURE_PREFIX, hex::encode(mac.finalize().into_bytes()))
}
