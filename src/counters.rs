//! Replay detection and counter advance.
//!
//! A decrypted OTP is compared with the last accepted state of its device. Only a
//! strictly newer `(session_counter, use_counter)` pair is written back, and the
//! write itself repeats the comparison so racing requests cannot both win.

use crate::{
    ksm::DecryptedOtp,
    storage::{CounterUpdate, DeviceRecord, Storage},
};
use tracing::{error, info, warn};

/// Seconds per token timestamp tick.
pub const TS_SEC: f64 = 1.0 / 8.0;
/// Relative deviation above which timing is suspicious.
pub const TS_REL_TOLERANCE: f64 = 0.3;
/// Absolute deviation, in seconds, above which timing is suspicious.
pub const TS_ABS_TOLERANCE: f64 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Same counters and same nonce: this exact request was already answered.
    ReplayedRequest,
    /// Counters did not move forward.
    ReplayedOtp,
    /// Counters are strictly newer.
    Advance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterOutcome {
    ReplayedRequest,
    ReplayedOtp,
    /// The device state was advanced, or a racing request advanced it first.
    Accepted,
    BackendError,
}

#[must_use]
pub fn classify(local: &DeviceRecord, incoming: &DecryptedOtp, nonce: &str) -> Classification {
    let seen = (local.session_counter, local.use_counter);
    let this = (incoming.session_counter, incoming.use_counter);

    if seen == this && local.nonce == nonce {
        Classification::ReplayedRequest
    } else if seen >= this {
        Classification::ReplayedOtp
    } else {
        Classification::Advance
    }
}

/// Classify the OTP and, when it is newer, persist the new counters.
///
/// `now` is the Unix time recorded as `modified_at`.
pub async fn evaluate(
    storage: &dyn Storage,
    local: &DeviceRecord,
    incoming: &DecryptedOtp,
    nonce: &str,
    now: i64,
) -> CounterOutcome {
    match classify(local, incoming, nonce) {
        Classification::ReplayedRequest => {
            info!("Replayed request");
            return CounterOutcome::ReplayedRequest;
        }
        Classification::ReplayedOtp => {
            info!(
                local.session_counter = local.session_counter,
                local.use_counter = local.use_counter,
                otp.session_counter = incoming.session_counter,
                otp.use_counter = incoming.use_counter,
                "replayed OTP: local counters higher"
            );
            return CounterOutcome::ReplayedOtp;
        }
        Classification::Advance => {}
    }

    if local.public_name.is_empty() {
        error!("refusing to update counters without a public name");
        return CounterOutcome::BackendError;
    }

    let update = CounterUpdate {
        public_name: local.public_name.clone(),
        modified_at: now,
        session_counter: incoming.session_counter,
        use_counter: incoming.use_counter,
        timestamp_low: incoming.timestamp_low,
        timestamp_high: incoming.timestamp_high,
        nonce: nonce.to_string(),
    };

    match storage.advance_counters(&update).await {
        Ok(0) => info!(
            "counters of {} were not updated, a concurrent request got there first",
            update.public_name
        ),
        Ok(_) => {}
        Err(err) => {
            error!("Failed to update yubikey counters in database: {err}");
            return CounterOutcome::BackendError;
        }
    }

    if let Some(report) = assess_timing(local, incoming, now) {
        report.log(&local.public_name);
    }

    CounterOutcome::Accepted
}

/// Comparison of server wall time against the token's own clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingReport {
    /// Previous token timestamp, in ticks.
    pub seen: i64,
    /// Current token timestamp, in ticks.
    pub this: i64,
    /// Seconds elapsed according to the token.
    pub token_delta: f64,
    /// Seconds elapsed according to the server.
    pub elapsed: f64,
    pub deviation: f64,
    /// `deviation / elapsed`, 1.0 when no time elapsed.
    pub percent: f64,
    pub suspicious: bool,
}

impl TimingReport {
    fn log(&self, public_name: &str) {
        info!(
            public_name,
            seen = self.seen,
            this = self.this,
            delta = self.this - self.seen,
            secs = self.token_delta,
            elapsed = self.elapsed,
            deviation = self.deviation,
            percent = (self.percent * 100.0).round(),
            "Timestamp"
        );
        if self.suspicious {
            warn!(
                target: "ykval::timing",
                public_name,
                deviation = self.deviation,
                elapsed = self.elapsed,
                "OTP failed phishing test"
            );
        }
    }
}

/// Delay heuristic for a use within the same session.
///
/// Returns `None` unless the session counter is unchanged and the use counter
/// increased. The result is informational and never changes the answer.
#[must_use]
pub fn assess_timing(local: &DeviceRecord, incoming: &DecryptedOtp, now: i64) -> Option<TimingReport> {
    if incoming.session_counter != local.session_counter
        || incoming.use_counter <= local.use_counter
    {
        return None;
    }

    let this = (i64::from(incoming.timestamp_high) << 16) + i64::from(incoming.timestamp_low);
    let seen = (i64::from(local.timestamp_high) << 16) + i64::from(local.timestamp_low);

    #[allow(clippy::cast_precision_loss)]
    let token_delta = (this - seen) as f64 * TS_SEC;
    #[allow(clippy::cast_precision_loss)]
    let elapsed = (now - local.modified_at) as f64;
    let deviation = (elapsed - token_delta).abs();
    let percent = if elapsed == 0.0 { 1.0 } else { deviation / elapsed };

    Some(TimingReport {
        seen,
        this,
        token_delta,
        elapsed,
        deviation,
        percent,
        suspicious: deviation > TS_ABS_TOLERANCE && percent > TS_REL_TOLERANCE,
    })
}
