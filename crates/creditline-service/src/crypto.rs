//! Cryptographic helpers for webhook verification and payment form signing.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

fn hmac_sha256(secret: &[u8], message: &[u8]) -> Vec<u8> {
    // INVARIANT: HMAC accepts keys of any length (RFC 2104).
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC-SHA256 accepts any key size");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

/// Compute HMAC-SHA256 and return the hex-encoded digest (64 characters).
#[must_use]
pub fn hmac_sha256_hex(secret: &str, message: &str) -> String {
    hex::encode(hmac_sha256(secret.as_bytes(), message.as_bytes()))
}

/// Compute HMAC-SHA256 and return the standard base64 encoding of the digest.
///
/// This is the signature format of the Shopier payment form.
#[must_use]
pub fn hmac_sha256_base64(secret: &str, message: &str) -> String {
    STANDARD.encode(hmac_sha256(secret.as_bytes(), message.as_bytes()))
}

/// Constant-time string comparison.
///
/// Only the length is leaked; equal-length inputs take the same time
/// regardless of where they differ.
#[must_use]
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}
