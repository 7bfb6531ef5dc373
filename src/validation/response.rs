//! Status codes and the signed, line-oriented answer.

use crate::signing;
use chrono::{DateTime, Utc};
use std::fmt;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    BadOtp,
    ReplayedOtp,
    /// Reserved, never emitted.
    DelayedOtp,
    BadSignature,
    MissingParameter,
    NoSuchClient,
    /// Reserved, never emitted.
    OperationNotAllowed,
    BackendError,
    /// Reserved, never emitted.
    NotEnoughAnswers,
    ReplayedRequest,
}

impl Status {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::BadOtp => "BAD_OTP",
            Self::ReplayedOtp => "REPLAYED_OTP",
            Self::DelayedOtp => "DELAYED_OTP",
            Self::BadSignature => "BAD_SIGNATURE",
            Self::MissingParameter => "MISSING_PARAMETER",
            Self::NoSuchClient => "NO_SUCH_CLIENT",
            Self::OperationNotAllowed => "OPERATION_NOT_ALLOWED",
            Self::BackendError => "BACKEND_ERROR",
            Self::NotEnoughAnswers => "NOT_ENOUGH_ANSWERS",
            Self::ReplayedRequest => "REPLAYED_REQUEST",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server timestamp, e.g. `2024-01-31T12:00:00Z0123` (UTC, milliseconds last).
#[must_use]
pub fn server_timestamp(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%dT%H:%M:%SZ0%3f").to_string()
}

/// A composed answer, ready to be written out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub timestamp: String,
    /// `key=value` lines between `t` and `status`.
    pub extra: Vec<String>,
    pub signature: String,
}

impl Response {
    /// Build and sign an answer with `key`.
    ///
    /// The signature covers `status`, `t` and `extra`.
    #[must_use]
    pub fn signed(status: Status, extra: Vec<String>, key: &[u8], now: DateTime<Utc>) -> Self {
        let timestamp = server_timestamp(now);

        let mut signed = Vec::with_capacity(extra.len() + 2);
        signed.push(format!("status={status}"));
        signed.push(format!("t={timestamp}"));
        signed.extend(extra.iter().cloned());

        let signature = signing::sign(&signed, key).unwrap_or_else(|err| {
            error!("failed to sign response: {err}");
            String::new()
        });

        Self {
            status,
            timestamp,
            extra,
            signature,
        }
    }

    /// Answer that carries no client specific data, signed with an empty key.
    #[must_use]
    pub fn unsigned(status: Status) -> Self {
        Self::signed(status, Vec::new(), b"", Utc::now())
    }

    /// CRLF separated body terminated by an empty line.
    #[must_use]
    pub fn body(&self) -> String {
        let mut body = format!("h={}\r\nt={}\r\n", self.signature, self.timestamp);
        for line in &self.extra {
            body.push_str(line);
            body.push_str("\r\n");
        }
        body.push_str("status=");
        body.push_str(self.status.as_str());
        body.push_str("\r\n\r\n");
        body
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 31, 12, 5, 9).unwrap() + chrono::Duration::milliseconds(42)
    }

    #[test]
    fn status_strings() {
        assert_eq!(Status::Ok.to_string(), "OK");
        assert_eq!(Status::ReplayedRequest.as_str(), "REPLAYED_REQUEST");
        assert_eq!(Status::NotEnoughAnswers.as_str(), "NOT_ENOUGH_ANSWERS");
        assert_eq!(Status::OperationNotAllowed.as_str(), "OPERATION_NOT_ALLOWED");
    }

    #[test]
    fn timestamp_has_millisecond_suffix() {
        assert_eq!(server_timestamp(now()), "2024-01-31T12:05:09Z0042");
    }

    #[test]
    fn body_layout() {
        let response = Response::signed(
            Status::Ok,
            vec!["otp=abc".to_string(), "nonce=def".to_string()],
            b"key",
            now(),
        );
        let body = response.body();
        let lines: Vec<&str> = body.split("\r\n").collect();

        assert!(lines[0].starts_with("h="));
        assert_eq!(
            &lines[1..],
            &[
                "t=2024-01-31T12:05:09Z0042",
                "otp=abc",
                "nonce=def",
                "status=OK",
                "",
                ""
            ]
        );
        assert!(body.ends_with("status=OK\r\n\r\n"));
    }

    #[test]
    fn signature_covers_status_time_and_extra() {
        let response = Response::signed(
            Status::ReplayedOtp,
            vec!["otp=abc".to_string(), "nonce=def".to_string()],
            b"key",
            now(),
        );
        let signed = [
            "nonce=def",
            "otp=abc",
            "status=REPLAYED_OTP",
            "t=2024-01-31T12:05:09Z0042",
        ];
        assert!(signing::verify(&signed, &response.signature, b"key").unwrap());
    }

    #[test]
    fn empty_key_still_signs() {
        let response = Response::unsigned(Status::MissingParameter);
        assert!(!response.signature.is_empty());
        assert!(response.extra.is_empty());
        assert!(response.body().contains("status=MISSING_PARAMETER\r\n"));
    }
}
