//! Client and device persistence.
//!
//! The validation core only talks to [`Storage`]. Every mutation is a single
//! statement at the backend: device discovery is an insert-if-absent, and the
//! counter advance is an `UPDATE` guarded by the counter ordering so concurrent
//! requests for the same device settle in the database, not in process memory.

use base64ct::{Base64, Encoding};
use std::{future::Future, pin::Pin};
use thiserror::Error;

pub mod memory;
pub mod postgres;

pub use self::memory::MemoryStorage;
pub use self::postgres::PgStorage;

/// Nonce stored on freshly discovered devices.
pub const DISCOVERED_NONCE: &str = "0000000000000000";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("invalid record: {0}")]
    InvalidRecord(String),
}

pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StorageError>> + Send + 'a>>;

/// API client allowed to call the verify endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    pub id: i32,
    pub active: bool,
    /// Base64 encoded HMAC key.
    pub secret: String,
}

impl Client {
    /// Decode the shared HMAC key.
    ///
    /// # Errors
    /// Returns an error if the stored secret is not valid base64.
    pub fn secret_bytes(&self) -> Result<Vec<u8>, StorageError> {
        Base64::decode_vec(&self.secret).map_err(|err| {
            StorageError::InvalidRecord(format!("client {} secret: {err}", self.id))
        })
    }
}

/// Last accepted state of one token, keyed by its public name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub active: bool,
    pub created_at: i64,
    pub modified_at: i64,
    pub public_name: String,
    pub session_counter: i32,
    pub use_counter: i32,
    pub timestamp_low: i32,
    pub timestamp_high: i32,
    pub nonce: String,
    pub notes: String,
}

impl DeviceRecord {
    /// Record for a public name seen for the first time.
    ///
    /// All counters are `-1` so the first real OTP always compares as newer.
    #[must_use]
    pub fn discovered(public_name: &str, now: i64) -> Self {
        Self {
            active: true,
            created_at: now,
            modified_at: -1,
            public_name: public_name.to_string(),
            session_counter: -1,
            use_counter: -1,
            timestamp_low: -1,
            timestamp_high: -1,
            nonce: DISCOVERED_NONCE.to_string(),
            notes: String::new(),
        }
    }
}

/// New counter state written by a valid advance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterUpdate {
    pub public_name: String,
    pub modified_at: i64,
    pub session_counter: i32,
    pub use_counter: i32,
    pub timestamp_low: i32,
    pub timestamp_high: i32,
    pub nonce: String,
}

impl CounterUpdate {
    /// Whether `record` is strictly older than this update, i.e. the guard of the
    /// conditional write.
    #[must_use]
    pub fn is_newer_than(&self, record: &DeviceRecord) -> bool {
        (record.session_counter, record.use_counter) < (self.session_counter, self.use_counter)
    }
}

pub trait Storage: Send + Sync {
    /// Look up a client by id; `None` when no such client exists.
    fn client(&self, id: i32) -> StorageFuture<'_, Option<Client>>;

    /// Fetch the device record, creating it with sentinel counters if absent.
    fn device<'a>(&'a self, public_name: &'a str) -> StorageFuture<'a, DeviceRecord>;

    /// Apply `update` only where the stored counters are strictly lower.
    /// Returns the number of rows affected.
    fn advance_counters<'a>(&'a self, update: &'a CounterUpdate) -> StorageFuture<'a, u64>;

    /// Raw AES key of a device for built-in decryption; `None` when not on file.
    fn device_secret_key<'a>(&'a self, public_name: &'a str)
        -> StorageFuture<'a, Option<Vec<u8>>>;

    /// Connectivity check used by the health endpoint.
    fn ping(&self) -> StorageFuture<'_, ()>;
}
