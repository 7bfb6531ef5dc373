//! Canonical request/response signing.
//!
//! Both directions of the protocol are authenticated with HMAC-SHA1 keyed by the
//! client secret. The signed string is built from whole `key=value` pairs sorted
//! lexicographically and joined with `&`; the digest is sent base64 encoded.

use base64ct::{Base64, Encoding};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha1 = Hmac<Sha1>;

/// Name of the parameter carrying the signature, excluded from the signed string.
pub const SIGNATURE_PARAM: &str = "h";

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("invalid HMAC key length")]
    KeyLength,
}

/// Sort the pairs as whole strings and join them with `&`.
#[must_use]
pub fn canonical_string<S: AsRef<str>>(params: &[S]) -> String {
    let mut sorted: Vec<&str> = params.iter().map(AsRef::as_ref).collect();
    sorted.sort_unstable();
    sorted.join("&")
}

/// Compute the base64 HMAC-SHA1 signature of `params`.
///
/// # Errors
/// Returns an error if the HMAC cannot be keyed with `key`.
pub fn sign<S: AsRef<str>>(params: &[S], key: &[u8]) -> Result<String, SignatureError> {
    let mut mac = HmacSha1::new_from_slice(key).map_err(|_| SignatureError::KeyLength)?;
    mac.update(canonical_string(params).as_bytes());

    Ok(Base64::encode_string(&mac.finalize().into_bytes()))
}

/// Check `provided` against the signature of every pair except `h=`.
///
/// The comparison runs in constant time over the encoded signatures.
///
/// # Errors
/// Returns an error if the HMAC cannot be keyed with `key`.
pub fn verify<S: AsRef<str>>(
    params: &[S],
    provided: &str,
    key: &[u8],
) -> Result<bool, SignatureError> {
    let prefix = format!("{SIGNATURE_PARAM}=");
    let signed: Vec<&str> = params
        .iter()
        .map(AsRef::as_ref)
        .filter(|pair| !pair.starts_with(&prefix))
        .collect();

    let expected = sign(&signed, key)?;

    Ok(expected.as_bytes().ct_eq(provided.as_bytes()).into())
}
