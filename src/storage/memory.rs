//! Process-local store with the same conditional-write rules as the database.
//!
//! Used by the test-suite and handy for running the validator without Postgres.

use crate::storage::{
    Client, CounterUpdate, DeviceRecord, Storage, StorageError, StorageFuture,
};
use chrono::Utc;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard,
    },
};

#[derive(Debug, Default)]
pub struct MemoryStorage {
    clients: Mutex<HashMap<i32, Client>>,
    devices: Mutex<HashMap<String, DeviceRecord>>,
    secret_keys: Mutex<HashMap<String, Vec<u8>>>,
    unavailable: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, StorageError> {
    mutex
        .lock()
        .map_err(|_| StorageError::Unavailable("memory storage lock poisoned".to_string()))
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a client.
    ///
    /// # Errors
    /// Returns an error if the store lock is poisoned.
    pub fn insert_client(&self, client: Client) -> Result<(), StorageError> {
        lock(&self.clients)?.insert(client.id, client);
        Ok(())
    }

    /// Add or replace a device record.
    ///
    /// # Errors
    /// Returns an error if the store lock is poisoned.
    pub fn insert_device(&self, record: DeviceRecord) -> Result<(), StorageError> {
        lock(&self.devices)?.insert(record.public_name.clone(), record);
        Ok(())
    }

    /// Store the AES key used for built-in decryption.
    ///
    /// # Errors
    /// Returns an error if the store lock is poisoned.
    pub fn insert_secret_key(&self, public_name: &str, key: Vec<u8>) -> Result<(), StorageError> {
        lock(&self.secret_keys)?.insert(public_name.to_string(), key);
        Ok(())
    }

    /// Snapshot of a device record without creating it.
    ///
    /// # Errors
    /// Returns an error if the store lock is poisoned.
    pub fn get_device(&self, public_name: &str) -> Result<Option<DeviceRecord>, StorageError> {
        Ok(lock(&self.devices)?.get(public_name).cloned())
    }

    /// Make every subsequent call fail, emulating a backend outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("memory storage offline".to_string()));
        }
        Ok(())
    }
}

impl Storage for MemoryStorage {
    fn client(&self, id: i32) -> StorageFuture<'_, Option<Client>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(lock(&self.clients)?.get(&id).cloned())
        })
    }

    fn device<'a>(&'a self, public_name: &'a str) -> StorageFuture<'a, DeviceRecord> {
        Box::pin(async move {
            self.check_available()?;
            let mut devices = lock(&self.devices)?;
            let record = devices
                .entry(public_name.to_string())
                .or_insert_with(|| DeviceRecord::discovered(public_name, Utc::now().timestamp()));
            Ok(record.clone())
        })
    }

    fn advance_counters<'a>(&'a self, update: &'a CounterUpdate) -> StorageFuture<'a, u64> {
        Box::pin(async move {
            self.check_available()?;
            let mut devices = lock(&self.devices)?;
            let Some(record) = devices.get_mut(&update.public_name) else {
                return Ok(0);
            };
            if !update.is_newer_than(record) {
                return Ok(0);
            }

            record.modified_at = update.modified_at;
            record.session_counter = update.session_counter;
            record.use_counter = update.use_counter;
            record.timestamp_low = update.timestamp_low;
            record.timestamp_high = update.timestamp_high;
            record.nonce.clone_from(&update.nonce);
            Ok(1)
        })
    }

    fn device_secret_key<'a>(
        &'a self,
        public_name: &'a str,
    ) -> StorageFuture<'a, Option<Vec<u8>>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(lock(&self.secret_keys)?.get(public_name).cloned())
        })
    }

    fn ping(&self) -> StorageFuture<'_, ()> {
        Box::pin(async move { self.check_available() })
    }
}
