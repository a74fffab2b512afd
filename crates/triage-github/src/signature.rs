//! Webhook signature verification.
//!
//! The tracker signs each delivery with HMAC-SHA256 over the raw body and sends
//! `sha256=<lowercase hex>` in [`SIGNATURE_HEADER`]. The comparison runs over a
//! fixed-size buffer so neither the content nor the length of the presented
//! header changes how long it takes.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::AuthError;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

const SIGNATURE_PREFIX: &str = "sha256=";
// "sha256=" + 64 hex characters
const SIGNATURE_LEN: usize = 71;

/// Verify that `body` was signed with `secret`.
pub fn verify(signature: Option<&str>, body: Option<&[u8]>, secret: &[u8]) -> Result<(), AuthError> {
    let body = body
        .filter(|bytes| !bytes.is_empty())
        .ok_or(AuthError::MissingPayload)?;
    let signature = signature
        .filter(|value| !value.is_empty())
        .ok_or(AuthError::MissingSignature)?;

    let expected = sign(body, secret)?;
    if fixed_time_eq(signature.as_bytes(), expected.as_bytes()) {
        Ok(())
    } else {
        Err(AuthError::InvalidSignature)
    }
}

/// Header value the tracker would send for `body`.
pub fn sign(body: &[u8], secret: &[u8]) -> Result<String, AuthError> {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret).map_err(|_| AuthError::InvalidSignature)?;
    mac.update(body);
    Ok(format!(
        "{SIGNATURE_PREFIX}{}",
        hex::encode(mac.finalize().into_bytes())
    ))
}

fn fixed_time_eq(presented: &[u8], expected: &[u8]) -> bool {
    let mut padded = [0u8; SIGNATURE_LEN];
    let copied = presented.len().min(SIGNATURE_LEN);
    padded[..copied].copy_from_slice(&presented[..copied]);

    let same_len = (presented.len() as u64).ct_eq(&(SIGNATURE_LEN as u64));
    let same_bytes = padded[..].ct_eq(expected);
    (same_len & same_bytes).into()
}
