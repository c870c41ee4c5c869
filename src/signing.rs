//! Shared-secret authentication and HMAC-SHA256 body signatures.
//!
//! Every comparison goes through `Mac::verify_slice`, which is constant time.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const AUTH_HEADER: &str = "authorization";
pub const SIGNATURE_HEADER: &str = "x-signature";

const SECRET_PROBE: &[u8] = b"swarmq-auth";

fn mac(key: &[u8]) -> HmacSha256 {
  HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length")
}

/// Hex HMAC-SHA256 of `body` keyed by `secret`.
pub fn sign(secret: &str, body: &[u8]) -> String {
  let mut mac = mac(secret.as_bytes());
  mac.update(body);
  hex::encode(mac.finalize().into_bytes())
}

pub fn verify(secret: &str, body: &[u8], signature: &str) -> bool {
  let Ok(expected) = hex::decode(signature.trim()) else {
    return false;
  };
  let mut mac = mac(secret.as_bytes());
  mac.update(body);
  mac.verify_slice(&expected).is_ok()
}

/// Compares a presented secret with the configured one without leaking
/// length or prefix information: both are used as HMAC keys over a fixed
/// probe and the tags are compared in constant time.
pub fn secret_matches(expected: &str, provided: &str) -> bool {
  let mut expected_mac = mac(expected.as_bytes());
  expected_mac.update(SECRET_PROBE);
  let tag = expected_mac.finalize().into_bytes();

  let mut provided_mac = mac(provided.as_bytes());
  provided_mac.update(SECRET_PROBE);
  provided_mac.verify_slice(&tag).is_ok()
}

/// Accepts both `Bearer <secret>` and a bare secret.
pub fn bearer(header: &str) -> &str {
  let header = header.trim();
  header.strip_prefix("Bearer ").map(str::trim).unwrap_or(header)
}
