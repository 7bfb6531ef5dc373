//! OTP decryption.
//!
//! Tokens are decrypted either with the per-device AES key on file (built-in
//! mode) or by asking the configured YK-KSM endpoints, whose first answer wins.

pub mod modhex;
pub mod token;

use crate::{
    fanout::{Retrieval, Retriever},
    storage::{Storage, StorageError},
};
use regex::Regex;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, error, info, instrument};

pub use self::token::TokenError;

/// Log label of the remote decryption service.
pub const KSM_IDENT: &str = "YK-KSM";

/// Prefix of a successful KSM answer.
pub const KSM_SUCCESS_PATTERN: &str = "^OK";

#[derive(Debug, Error)]
pub enum DecryptError {
    #[error("malformed OTP: {0}")]
    Decode(TokenError),
    #[error("no secret key on file for {0}")]
    KeyNotFound(String),
    #[error("token decryption failed: {0}")]
    Decrypt(TokenError),
    #[error("YK-KSM response is empty")]
    EmptyResponse,
    #[error("error parsing YK-KSM response: {0:?}")]
    Parse(String),
    #[error("no YK-KSM endpoints configured")]
    NoEndpoints,
    #[error("backend error: {0}")]
    Backend(#[from] StorageError),
}

impl DecryptError {
    /// Whether the failure is infrastructure rather than the token itself.
    #[must_use]
    pub fn is_backend(&self) -> bool {
        matches!(
            self,
            Self::EmptyResponse | Self::NoEndpoints | Self::Backend(_)
        )
    }
}

/// How decryption failures are reported to clients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DecryptFailurePolicy {
    /// Every failure is a `BAD_OTP`.
    #[default]
    BadOtp,
    /// Backend failures become `BACKEND_ERROR`, the rest stay `BAD_OTP`.
    Distinguish,
}

/// Counters extracted from a decrypted token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecryptedOtp {
    pub session_counter: i32,
    pub use_counter: i32,
    pub timestamp_low: i32,
    pub timestamp_high: i32,
}

impl From<token::Token> for DecryptedOtp {
    fn from(token: token::Token) -> Self {
        Self {
            session_counter: i32::from(token.session_counter),
            use_counter: i32::from(token.session_use),
            timestamp_low: i32::from(token.timestamp_low),
            timestamp_high: i32::from(token.timestamp_high),
        }
    }
}

#[derive(Debug, Clone)]
pub struct KsmConfig {
    /// Decrypt endpoints, each getting `?otp=<otp>` appended.
    pub urls: Vec<String>,
    /// Decrypt locally with the stored per-device keys.
    pub builtin: bool,
    pub timeout: Duration,
}

impl Default for KsmConfig {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            builtin: false,
            timeout: Duration::from_secs(10),
        }
    }
}

pub struct Decryptor {
    config: KsmConfig,
    storage: Arc<dyn Storage>,
    retriever: Retriever,
    success_pattern: Regex,
}

impl Decryptor {
    /// # Errors
    /// Returns an error if the success pattern does not compile.
    pub fn new(
        config: KsmConfig,
        storage: Arc<dyn Storage>,
        retriever: Retriever,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            config,
            storage,
            retriever,
            success_pattern: Regex::new(KSM_SUCCESS_PATTERN)?,
        })
    }

    /// Fully qualified decrypt URLs for `otp`.
    #[must_use]
    pub fn ksm_urls(&self, otp: &str) -> Vec<String> {
        self.config
            .urls
            .iter()
            .map(|url| format!("{url}?otp={otp}"))
            .collect()
    }

    /// Decrypt `otp` on behalf of `client_id`.
    ///
    /// # Errors
    /// Returns a [`DecryptError`] describing why no counters could be obtained.
    #[instrument(skip(self))]
    pub async fn decrypt(&self, otp: &str, client_id: i32) -> Result<DecryptedOtp, DecryptError> {
        if self.config.builtin {
            return self.decrypt_builtin(otp).await;
        }

        let urls = self.ksm_urls(otp);
        if urls.is_empty() {
            error!("no {KSM_IDENT} URLs for client {client_id}, please check the config");
            return Err(DecryptError::NoEndpoints);
        }

        let answers = self
            .retriever
            .retrieve(&Retrieval {
                ident: KSM_IDENT,
                urls: &urls,
                required: 1,
                pattern: &self.success_pattern,
                include_source_url: false,
                timeout: self.config.timeout,
            })
            .await;

        let answer = answers.first().ok_or(DecryptError::EmptyResponse)?;
        debug!("{KSM_IDENT} response: {}", answer.trim_end());

        parse_ksm_response(answer)
    }

    async fn decrypt_builtin(&self, otp: &str) -> Result<DecryptedOtp, DecryptError> {
        let (public_name, encrypted) = token::split_otp(otp).map_err(|err| {
            info!("error parsing OTP string: {err}");
            DecryptError::Decode(err)
        })?;

        let key = self
            .storage
            .device_secret_key(public_name)
            .await?
            .ok_or_else(|| DecryptError::KeyNotFound(public_name.to_string()))?;

        let token = token::decrypt(encrypted, &key).map_err(|err| {
            error!("token decryption for {public_name} failed: {err}");
            DecryptError::Decrypt(err)
        })?;

        Ok(token.into())
    }
}

/// Parse `OK counter=XXXX low=XXXX high=XX use=XX` (hex fields).
///
/// Anything after the last field, such as the trailing newline, is ignored.
///
/// # Errors
/// Returns [`DecryptError::Parse`] when the body does not have that exact shape.
pub fn parse_ksm_response(body: &str) -> Result<DecryptedOtp, DecryptError> {
    let parse = || -> Option<DecryptedOtp> {
        let (session_counter, rest) = hex_field(body, "OK counter=", 4)?;
        let (timestamp_low, rest) = hex_field(rest, " low=", 4)?;
        let (timestamp_high, rest) = hex_field(rest, " high=", 2)?;
        let (use_counter, _) = hex_field(rest, " use=", 2)?;
        Some(DecryptedOtp {
            session_counter,
            use_counter,
            timestamp_low,
            timestamp_high,
        })
    };

    parse().ok_or_else(|| DecryptError::Parse(body.trim_end().to_string()))
}

fn hex_field<'a>(input: &'a str, label: &str, width: usize) -> Option<(i32, &'a str)> {
    let rest = input.strip_prefix(label)?;
    let digits = rest.get(..width)?;
    if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let value = i32::from_str_radix(digits, 16).ok()?;
    Some((value, &rest[width..]))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use anyhow::Result;
    use std::net::TcpListener;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const KEY: [u8; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15];
    const OTP: &str = "cccccccccccbgvifjgiitecdbvlckrbrgkgeudjcurji";

    fn can_bind_localhost() -> bool {
        TcpListener::bind("127.0.0.1:0").is_ok()
    }

    fn expected() -> DecryptedOtp {
        DecryptedOtp {
            session_counter: 1,
            use_counter: 4,
            timestamp_low: 0x86bf,
            timestamp_high: 0x83,
        }
    }

    fn decryptor(config: KsmConfig, storage: Arc<dyn Storage>) -> Decryptor {
        Decryptor::new(config, storage, Retriever::new().unwrap()).unwrap()
    }

    #[test]
    fn ksm_urls_append_otp() {
        let config = KsmConfig {
            urls: vec![
                "http://127.0.0.1:80/wsapi/decrypt".to_string(),
                "http://127.0.0.1:8002/wsapi/decrypt".to_string(),
            ],
            ..KsmConfig::default()
        };
        let urls = decryptor(config, Arc::new(MemoryStorage::new())).ksm_urls(OTP);
        assert_eq!(
            urls,
            vec![
                format!("http://127.0.0.1:80/wsapi/decrypt?otp={OTP}"),
                format!("http://127.0.0.1:8002/wsapi/decrypt?otp={OTP}"),
            ]
        );
    }

    #[test]
    fn parse_reads_hex_fields() {
        let parsed = parse_ksm_response("OK counter=0001 low=86bf high=83 use=04\n").unwrap();
        assert_eq!(parsed, expected());

        let upper = parse_ksm_response("OK counter=00FF low=FFFF high=FF use=FF").unwrap();
        assert_eq!(upper.session_counter, 255);
        assert_eq!(upper.timestamp_low, 0xffff);
    }

    #[test]
    fn parse_rejects_other_shapes() {
        for body in [
            "ERR Corrupt OTP",
            "OK counter=1 low=86bf high=83 use=04",
            "OK counter=0001 low=86bf high=83",
            "OK counter=0001 low=86bg high=83 use=04",
            "OK  counter=0001 low=86bf high=83 use=04",
            "",
        ] {
            assert!(
                matches!(parse_ksm_response(body), Err(DecryptError::Parse(_))),
                "accepted {body:?}"
            );
        }
    }

    #[test]
    fn backend_classification() {
        assert!(DecryptError::EmptyResponse.is_backend());
        assert!(DecryptError::NoEndpoints.is_backend());
        assert!(DecryptError::Backend(StorageError::Unavailable("x".into())).is_backend());
        assert!(!DecryptError::Parse(String::new()).is_backend());
        assert!(!DecryptError::KeyNotFound(String::new()).is_backend());
        assert!(!DecryptError::Decrypt(TokenError::Crc).is_backend());
        assert!(!DecryptError::Decode(TokenError::Format).is_backend());
    }

    #[tokio::test]
    async fn no_endpoints_is_an_error() {
        let decryptor = decryptor(KsmConfig::default(), Arc::new(MemoryStorage::new()));
        let result = decryptor.decrypt(OTP, 1).await;
        assert!(matches!(result, Err(DecryptError::NoEndpoints)));
    }

    #[tokio::test]
    async fn remote_decrypt_parses_first_answer() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return Ok(());
        }
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/wsapi/decrypt"))
            .and(query_param("otp", OTP))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("OK counter=0001 low=86bf high=83 use=04\n"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let config = KsmConfig {
            urls: vec![format!("{}/wsapi/decrypt", server.uri())],
            ..KsmConfig::default()
        };
        let decrypted = decryptor(config, Arc::new(MemoryStorage::new()))
            .decrypt(OTP, 1)
            .await?;
        assert_eq!(decrypted, expected());
        Ok(())
    }

    #[tokio::test]
    async fn remote_failure_is_empty_response() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return Ok(());
        }
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let config = KsmConfig {
            urls: vec![format!("{}/wsapi/decrypt", server.uri())],
            ..KsmConfig::default()
        };
        let result = decryptor(config, Arc::new(MemoryStorage::new()))
            .decrypt(OTP, 1)
            .await;
        assert!(matches!(result, Err(DecryptError::EmptyResponse)));
        Ok(())
    }

    #[tokio::test]
    async fn remote_error_body_is_parse_error() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return Ok(());
        }
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ERR Corrupt OTP\n"))
            .mount(&server)
            .await;

        let config = KsmConfig {
            urls: vec![format!("{}/wsapi/decrypt", server.uri())],
            ..KsmConfig::default()
        };
        let result = decryptor(config, Arc::new(MemoryStorage::new()))
            .decrypt(OTP, 1)
            .await;
        assert!(matches!(result, Err(DecryptError::Parse(_))));
        Ok(())
    }

    fn builtin() -> KsmConfig {
        KsmConfig {
            builtin: true,
            ..KsmConfig::default()
        }
    }

    #[tokio::test]
    async fn builtin_decrypts_with_stored_key() -> Result<()> {
        let storage = Arc::new(MemoryStorage::new());
        storage.insert_secret_key("cccccccccccb", KEY.to_vec())?;

        let decrypted = decryptor(builtin(), storage).decrypt(OTP, 1).await?;
        assert_eq!(decrypted, expected());
        Ok(())
    }

    #[tokio::test]
    async fn builtin_without_key_fails() {
        let result = decryptor(builtin(), Arc::new(MemoryStorage::new()))
            .decrypt(OTP, 1)
            .await;
        assert!(matches!(result, Err(DecryptError::KeyNotFound(name)) if name == "cccccccccccb"));
    }

    #[tokio::test]
    async fn builtin_with_wrong_key_fails() -> Result<()> {
        let storage = Arc::new(MemoryStorage::new());
        storage.insert_secret_key("cccccccccccb", vec![0xaa; 16])?;

        let result = decryptor(builtin(), storage).decrypt(OTP, 1).await;
        assert!(matches!(result, Err(DecryptError::Decrypt(TokenError::Crc))));
        Ok(())
    }

    #[tokio::test]
    async fn builtin_rejects_malformed_otp() {
        let result = decryptor(builtin(), Arc::new(MemoryStorage::new()))
            .decrypt("not-an-otp", 1)
            .await;
        assert!(matches!(result, Err(DecryptError::Decode(_))));
    }

    #[tokio::test]
    async fn builtin_storage_fault_is_backend() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set_unavailable(true);

        let result = decryptor(builtin(), storage).decrypt(OTP, 1).await;
        assert!(result.as_ref().is_err_and(DecryptError::is_backend));
    }
}
