//! Verify request parameters.

use crate::{
    ksm::{
        modhex,
        token::{OTP_MAX_LEN, TOKEN_LEN},
    },
    signing::SIGNATURE_PARAM,
    validation::response::Status,
};
use tracing::info;

const NONCE_MIN_LEN: usize = 16;
const NONCE_MAX_LEN: usize = 40;

/// Decoded `key=value` pairs in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestParams {
    pairs: Vec<(String, String)>,
}

impl RequestParams {
    /// Parse an `application/x-www-form-urlencoded` string (query or body).
    #[must_use]
    pub fn from_form(input: &[u8]) -> Self {
        Self {
            pairs: url::form_urlencoded::parse(input)
                .map(|(key, value)| (key.into_owned(), value.into_owned()))
                .collect(),
        }
    }

    /// Parameters of a request: the body for `POST`, the query string otherwise.
    #[must_use]
    pub fn extract(is_post: bool, query: Option<&str>, body: &[u8]) -> Self {
        if is_post {
            Self::from_form(body)
        } else {
            Self::from_form(query.unwrap_or_default().as_bytes())
        }
    }

    /// First value of `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Every pair as `key=value`, the input of signature verification.
    #[must_use]
    pub fn pairs(&self) -> Vec<String> {
        self.pairs.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RequestParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            pairs: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Sync level values selectable by `sl`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncLevels {
    pub default: i32,
    pub fast: i32,
    pub secure: i32,
    /// Seconds to wait for peers; kept for the `timeout` parameter.
    pub default_timeout: u64,
}

impl Default for SyncLevels {
    fn default() -> Self {
        Self {
            default: 60,
            fast: 1,
            secure: 40,
            default_timeout: 1,
        }
    }
}

/// Validated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyRequest {
    pub otp: String,
    pub nonce: String,
    pub client_id: i32,
    pub sync_level: i32,
    /// Whether the client asked for `timestamp=1`.
    pub timestamp: bool,
    pub signature: Option<String>,
}

impl VerifyRequest {
    /// Public name part of the OTP.
    #[must_use]
    pub fn public_name(&self) -> &str {
        &self.otp[..self.otp.len() - TOKEN_LEN]
    }
}

/// Lowercase the OTP and undo a Dvorak layout.
#[must_use]
pub fn normalize_otp(raw: &str) -> String {
    modhex::from_dvorak(&raw.to_lowercase())
}

/// Validate `params`, stopping at the first problem.
///
/// # Errors
/// Returns the status to answer with when a parameter is missing or malformed.
pub fn validate(params: &RequestParams, levels: &SyncLevels) -> Result<VerifyRequest, Status> {
    let nonce = params.get("nonce").unwrap_or_default();
    if nonce.is_empty() {
        info!("NONCE is missing");
        return Err(Status::MissingParameter);
    }
    if !nonce.bytes().all(|b| b.is_ascii_alphanumeric())
        || !(NONCE_MIN_LEN..=NONCE_MAX_LEN).contains(&nonce.len())
    {
        info!("NONCE is provided but not correct");
        return Err(Status::MissingParameter);
    }

    let otp = normalize_otp(params.get("otp").unwrap_or_default());
    if otp.is_empty() {
        info!("OTP is missing");
        return Err(Status::MissingParameter);
    }
    if !(TOKEN_LEN..=OTP_MAX_LEN).contains(&otp.len()) {
        info!("Incorrect OTP length: {otp}");
        return Err(Status::BadOtp);
    }
    if !modhex::is_modhex(&otp) {
        info!("Invalid OTP: {otp}");
        return Err(Status::BadOtp);
    }

    let client_id = match params.get("id").map(str::parse::<i32>) {
        Some(Ok(id)) if id > 0 => id,
        Some(Ok(_)) | None => {
            info!("Client ID is missing");
            return Err(Status::MissingParameter);
        }
        Some(Err(_)) => {
            info!("id provided in request must be an integer");
            return Err(Status::MissingParameter);
        }
    };

    let sync_level = match params.get("sl").filter(|sl| !sl.is_empty()) {
        None => levels.default,
        Some(sl) => match sl.parse::<i32>() {
            Ok(level) if (0..=100).contains(&level) => level,
            Ok(_) => {
                info!("SL is provided but not correct");
                return Err(Status::MissingParameter);
            }
            Err(_) if sl.eq_ignore_ascii_case("fast") => levels.fast,
            Err(_) if sl.eq_ignore_ascii_case("secure") => levels.secure,
            Err(_) => levels.default,
        },
    };

    Ok(VerifyRequest {
        otp,
        nonce: nonce.to_string(),
        client_id,
        sync_level,
        timestamp: params.get("timestamp") == Some("1"),
        signature: params
            .get(SIGNATURE_PARAM)
            .filter(|h| !h.is_empty())
            .map(ToString::to_string),
    })
}
