//! Verify protocol 2.0 request handling.
//!
//! [`Validator::verify`] drives one request from raw parameters to a signed
//! [`Response`]. It never fails: every problem ends up as a status line.

pub mod params;
pub mod response;

pub use self::params::{RequestParams, SyncLevels, VerifyRequest};
pub use self::response::{Response, Status};

use crate::{
    counters::{self, CounterOutcome},
    ksm::{DecryptFailurePolicy, Decryptor},
    signing,
    storage::Storage,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

pub struct Validator {
    storage: Arc<dyn Storage>,
    decryptor: Decryptor,
    sync_levels: SyncLevels,
    failure_policy: DecryptFailurePolicy,
}

impl Validator {
    #[must_use]
    pub fn new(
        storage: Arc<dyn Storage>,
        decryptor: Decryptor,
        sync_levels: SyncLevels,
        failure_policy: DecryptFailurePolicy,
    ) -> Self {
        Self {
            storage,
            decryptor,
            sync_levels,
            failure_policy,
        }
    }

    #[instrument(skip_all)]
    pub async fn verify(&self, params: &RequestParams) -> Response {
        let request = match params::validate(params, &self.sync_levels) {
            Ok(request) => request,
            Err(status) => return Response::unsigned(status),
        };

        let client = match self.storage.client(request.client_id).await {
            Ok(Some(client)) if client.active => client,
            Ok(_) => {
                info!("Invalid client id {}", request.client_id);
                return Response::unsigned(Status::NoSuchClient);
            }
            Err(err) => {
                error!("client lookup failed: {err}");
                return Response::unsigned(Status::BackendError);
            }
        };

        let key = match client.secret_bytes() {
            Ok(key) => key,
            Err(err) => {
                error!("Error decoding client's API Key: {err}");
                return Response::unsigned(Status::BackendError);
            }
        };
        let answer =
            |status: Status, extra: Vec<String>| Response::signed(status, extra, &key, Utc::now());

        if let Some(provided) = request.signature.as_deref() {
            match signing::verify(&params.pairs(), provided, &key) {
                Ok(true) => {}
                Ok(false) => {
                    debug!("client h={provided} does not match");
                    return answer(Status::BadSignature, Vec::new());
                }
                Err(err) => {
                    error!("signature check failed: {err}");
                    return answer(Status::BackendError, Vec::new());
                }
            }
        }

        let decrypted = match self.decryptor.decrypt(&request.otp, request.client_id).await {
            Ok(decrypted) => decrypted,
            Err(err) => {
                error!("{err}");
                let status = match self.failure_policy {
                    DecryptFailurePolicy::Distinguish if err.is_backend() => Status::BackendError,
                    _ => Status::BadOtp,
                };
                return answer(status, Vec::new());
            }
        };
        debug!(?decrypted, "Decrypted OTP");

        let public_name = request.public_name();
        let local = match self.storage.device(public_name).await {
            Ok(local) => local,
            Err(err) => {
                error!("Invalid Yubikey {public_name}: {err}");
                return answer(Status::BackendError, Vec::new());
            }
        };
        if !local.active {
            info!("De-activated Yubikey {public_name}");
            return answer(Status::BadOtp, Vec::new());
        }

        let mut extra = vec![
            format!("otp={}", request.otp),
            format!("nonce={}", request.nonce),
        ];

        let outcome = counters::evaluate(
            self.storage.as_ref(),
            &local,
            &decrypted,
            &request.nonce,
            Utc::now().timestamp(),
        )
        .await;

        match outcome {
            CounterOutcome::ReplayedRequest => answer(Status::ReplayedRequest, extra),
            CounterOutcome::ReplayedOtp => answer(Status::ReplayedOtp, extra),
            CounterOutcome::BackendError => answer(Status::BackendError, Vec::new()),
            CounterOutcome::Accepted => {
                // peer sync is not implemented, so no level is ever reached
                extra.push("sl=0".to_string());
                if request.timestamp {
                    extra.push(format!(
                        "timestamp={}",
                        (decrypted.timestamp_high << 16) + decrypted.timestamp_low
                    ));
                    extra.push(format!("sessioncounter={}", decrypted.session_counter));
                    extra.push(format!("sessionuse={}", decrypted.use_counter));
                }
                answer(Status::Ok, extra)
            }
        }
    }
}
