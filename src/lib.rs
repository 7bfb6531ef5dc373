//! # Ykval (YubiKey OTP Validation Server)
//!
//! `ykval` answers the YubiKey validation protocol 2.0: a client posts an OTP
//! together with its id and a nonce, and receives a signed, line-oriented answer
//! telling it whether the OTP is genuine and fresh.
//!
//! ## Request pipeline
//!
//! 1. **Parameters** are extracted (POST body or query string), normalized and
//!    validated ([`validation::params`]).
//! 2. The **client signature** `h` is checked with HMAC-SHA1 over the canonical,
//!    alphabetically sorted parameter string ([`signing`]).
//! 3. The OTP is **decrypted**, either locally with the per-device AES key or by a
//!    concurrent fan-out to remote KSM endpoints ([`ksm`], [`fanout`]).
//! 4. The token counters are compared with the last accepted ones and either
//!    classified as a replay or **advanced** with a conditional update
//!    ([`counters`], [`storage`]).
//! 5. The answer is composed and **signed** with the client secret
//!    ([`validation::response`]).
//!
//! ## Counter invariant
//!
//! For a given public name, `(session_counter, use_counter)` never decreases. The
//! storage layer re-checks the ordering inside the `UPDATE` statement, so two
//! racing requests carrying the same OTP can never both advance the device.

pub mod cli;
pub mod counters;
pub mod fanout;
pub mod ksm;
pub mod signing;
pub mod storage;
pub mod validation;
pub mod ykval;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
