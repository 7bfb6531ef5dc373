use crate::storage::{Client, CounterUpdate, DeviceRecord, Storage, StorageError, StorageFuture};
use chrono::Utc;
use sqlx::{
    postgres::{PgPoolOptions, PgRow},
    FromRow, PgPool, Row,
};
use std::time::Duration;
use tracing::{debug, info, info_span, Instrument};

const SELECT_CLIENT: &str = "SELECT id, active, secret FROM clients WHERE id = $1";

const SELECT_DEVICE: &str = r"
    SELECT active, created_at, modified_at, public_name, session_counter, use_counter,
           timestamp_low, timestamp_high, nonce, notes
    FROM yubikeys WHERE public_name = $1";

const SELECT_DEVICES: &str = r"
    SELECT active, created_at, modified_at, public_name, session_counter, use_counter,
           timestamp_low, timestamp_high, nonce, notes
    FROM yubikeys";

const INSERT_DEVICE: &str = r"
    INSERT INTO yubikeys
    (public_name, active, created_at, modified_at, session_counter, use_counter,
     timestamp_low, timestamp_high, nonce, notes)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
    ON CONFLICT (public_name) DO NOTHING";

const UPDATE_COUNTERS: &str = r"
    UPDATE yubikeys
    SET modified_at = $2, session_counter = $3, use_counter = $4,
        timestamp_low = $5, timestamp_high = $6, nonce = $7
    WHERE public_name = $1
      AND (session_counter < $3 OR (session_counter = $3 AND use_counter < $4))";

const SELECT_SECRET_KEY: &str = "SELECT secret_key FROM yubikeys WHERE public_name = $1";

const SELECT_CLIENT_RECORDS: &str = r"
    SELECT id, active, created, secret,
           COALESCE(email, '') AS email, COALESCE(notes, '') AS notes, COALESCE(otp, '') AS otp
    FROM clients ORDER BY id";

// Known keys are only updated to strictly newer counters.
const IMPORT_DEVICE: &str = r"
    INSERT INTO yubikeys
    (public_name, active, created_at, modified_at, session_counter, use_counter,
     timestamp_low, timestamp_high, nonce, notes)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
    ON CONFLICT (public_name) DO UPDATE
    SET active = EXCLUDED.active, created_at = EXCLUDED.created_at,
        modified_at = EXCLUDED.modified_at, session_counter = EXCLUDED.session_counter,
        use_counter = EXCLUDED.use_counter, timestamp_low = EXCLUDED.timestamp_low,
        timestamp_high = EXCLUDED.timestamp_high, nonce = EXCLUDED.nonce, notes = EXCLUDED.notes
    WHERE yubikeys.session_counter < EXCLUDED.session_counter
       OR (yubikeys.session_counter = EXCLUDED.session_counter
           AND yubikeys.use_counter < EXCLUDED.use_counter)";

const IMPORT_CLIENT: &str = r"
    INSERT INTO clients (id, active, created, secret, email, notes, otp)
    VALUES ($1, $2, $3, $4, $5, $6, $7)
    ON CONFLICT (id) DO NOTHING";

impl<'r> FromRow<'r, PgRow> for Client {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            active: row.try_get("active")?,
            secret: row.try_get("secret")?,
        })
    }
}

impl<'r> FromRow<'r, PgRow> for DeviceRecord {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            active: row.try_get("active")?,
            created_at: row.try_get("created_at")?,
            modified_at: row.try_get("modified_at")?,
            public_name: row.try_get("public_name")?,
            session_counter: row.try_get("session_counter")?,
            use_counter: row.try_get("use_counter")?,
            timestamp_low: row.try_get("timestamp_low")?,
            timestamp_high: row.try_get("timestamp_high")?,
            nonce: row.try_get("nonce")?,
            notes: row
                .try_get::<Option<String>, _>("notes")?
                .unwrap_or_default(),
        })
    }
}

impl<'r> FromRow<'r, PgRow> for ClientRecord {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            active: row.try_get("active")?,
            created: row.try_get("created")?,
            secret: row.try_get("secret")?,
            email: row.try_get("email")?,
            notes: row.try_get("notes")?,
            otp: row.try_get("otp")?,
        })
    }
}

/// Decode the hex AES key stored for `public_name`.
fn parse_secret_key(public_name: &str, key: &str) -> Result<Vec<u8>, StorageError> {
    hex::decode(key).map_err(|err| {
        StorageError::InvalidRecord(format!("secret key of {public_name} is not hex: {err}"))
    })
}

/// Postgres-backed store, built once at startup and shared by every request.
#[derive(Debug, Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a connection pool.
    ///
    /// # Errors
    /// Returns an error if the database cannot be reached.
    pub async fn connect(dsn: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(10)
            .max_lifetime(Duration::from_secs(60 * 2))
            .test_before_acquire(true)
            .connect(dsn)
            .await?;

        Ok(Self::new(pool))
    }

    async fn fetch_device(&self, public_name: &str) -> Result<Option<DeviceRecord>, StorageError> {
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = SELECT_DEVICE
        );
        let record = sqlx::query_as::<_, DeviceRecord>(SELECT_DEVICE)
            .bind(public_name)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await?;
        Ok(record)
    }

    async fn get_or_create_device(&self, public_name: &str) -> Result<DeviceRecord, StorageError> {
        debug!("searching for public name {public_name} in local db");
        if let Some(record) = self.fetch_device(public_name).await? {
            return Ok(record);
        }

        info!("Discovered new identity {public_name}");
        let fresh = DeviceRecord::discovered(public_name, Utc::now().timestamp());
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = INSERT_DEVICE
        );
        sqlx::query(INSERT_DEVICE)
            .bind(&fresh.public_name)
            .bind(fresh.active)
            .bind(fresh.created_at)
            .bind(fresh.modified_at)
            .bind(fresh.session_counter)
            .bind(fresh.use_counter)
            .bind(fresh.timestamp_low)
            .bind(fresh.timestamp_high)
            .bind(&fresh.nonce)
            .bind(&fresh.notes)
            .execute(&self.pool)
            .instrument(span)
            .await?;

        // A racing request may have inserted first; either way the row exists now.
        self.fetch_device(public_name).await?.ok_or_else(|| {
            StorageError::InvalidRecord(format!("params for public name {public_name} not found"))
        })
    }

    async fn update_counters(&self, update: &CounterUpdate) -> Result<u64, StorageError> {
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = UPDATE_COUNTERS
        );
        let result = sqlx::query(UPDATE_COUNTERS)
            .bind(&update.public_name)
            .bind(update.modified_at)
            .bind(update.session_counter)
            .bind(update.use_counter)
            .bind(update.timestamp_low)
            .bind(update.timestamp_high)
            .bind(&update.nonce)
            .execute(&self.pool)
            .instrument(span)
            .await?;
        Ok(result.rows_affected())
    }

    async fn secret_key(&self, public_name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let row = sqlx::query(SELECT_SECRET_KEY)
            .bind(public_name)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let secret_key: Option<String> = row.try_get("secret_key")?;
        match secret_key.filter(|key| !key.is_empty()) {
            Some(key) => parse_secret_key(public_name, &key).map(Some),
            None => Ok(None),
        }
    }

    /// All clients ordered by id.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn clients(&self) -> Result<Vec<Client>, StorageError> {
        let clients =
            sqlx::query_as::<_, Client>("SELECT id, active, secret FROM clients ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        Ok(clients)
    }

    /// Deactivated devices ordered by public name.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn deactivated_devices(&self) -> Result<Vec<DeviceRecord>, StorageError> {
        let query = format!("{SELECT_DEVICES} WHERE active = FALSE ORDER BY public_name");
        let devices = sqlx::query_as::<_, DeviceRecord>(&query)
            .fetch_all(&self.pool)
            .await?;
        Ok(devices)
    }

    /// Every device ordered by public name.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn devices(&self) -> Result<Vec<DeviceRecord>, StorageError> {
        let query = format!("{SELECT_DEVICES} ORDER BY public_name");
        let devices = sqlx::query_as::<_, DeviceRecord>(&query)
            .fetch_all(&self.pool)
            .await?;
        Ok(devices)
    }

    /// Every client with its descriptive columns, ordered by id.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn client_records(&self) -> Result<Vec<ClientRecord>, StorageError> {
        let clients = sqlx::query_as::<_, ClientRecord>(SELECT_CLIENT_RECORDS)
            .fetch_all(&self.pool)
            .await?;
        Ok(clients)
    }

    /// Insert unknown devices and advance known ones whose imported counters
    /// are newer, all in one transaction. Returns the number of rows written.
    ///
    /// # Errors
    /// Returns an error if any statement fails; nothing is written then.
    pub async fn import_devices(&self, devices: &[DeviceRecord]) -> Result<u64, StorageError> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0;

        for device in devices {
            let span = info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "INSERT",
                db.statement = IMPORT_DEVICE
            );
            let result = sqlx::query(IMPORT_DEVICE)
                .bind(&device.public_name)
                .bind(device.active)
                .bind(device.created_at)
                .bind(device.modified_at)
                .bind(device.session_counter)
                .bind(device.use_counter)
                .bind(device.timestamp_low)
                .bind(device.timestamp_high)
                .bind(&device.nonce)
                .bind(&device.notes)
                .execute(&mut *tx)
                .instrument(span)
                .await?;
            written += result.rows_affected();
        }

        tx.commit().await?;

        Ok(written)
    }

    /// Insert clients whose id is not taken yet, all in one transaction.
    /// Returns the number of rows inserted.
    ///
    /// # Errors
    /// Returns an error if any statement fails; nothing is written then.
    pub async fn import_clients(&self, clients: &[ClientRecord]) -> Result<u64, StorageError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for client in clients {
            let result = sqlx::query(IMPORT_CLIENT)
                .bind(client.id)
                .bind(client.active)
                .bind(client.created)
                .bind(&client.secret)
                .bind(&client.email)
                .bind(&client.notes)
                .bind(&client.otp)
                .execute(&mut *tx)
                .await?;
            inserted += result.rows_affected();
        }

        tx.commit().await?;

        Ok(inserted)
    }

    /// Insert new active clients with ids following the current highest id.
    ///
    /// # Errors
    /// Returns an error if the transaction fails.
    pub async fn insert_clients(
        &self,
        secrets: &[String],
        profile: &ClientProfile,
    ) -> Result<Vec<Client>, StorageError> {
        let mut tx = self.pool.begin().await?;

        let last_id: Option<i32> = sqlx::query_scalar("SELECT MAX(id) FROM clients")
            .fetch_one(&mut *tx)
            .await?;
        let mut next_id = last_id.unwrap_or(0);
        let created = Utc::now().timestamp();

        let mut inserted = Vec::with_capacity(secrets.len());
        for secret in secrets {
            next_id += 1;
            sqlx::query(
                r"
                INSERT INTO clients (id, active, created, secret, email, notes, otp)
                VALUES ($1, TRUE, $2, $3, $4, $5, $6)
                ",
            )
            .bind(next_id)
            .bind(created)
            .bind(secret)
            .bind(profile.email.as_deref())
            .bind(profile.notes.as_deref())
            .bind(profile.otp.as_deref())
            .execute(&mut *tx)
            .await?;

            inserted.push(Client {
                id: next_id,
                active: true,
                secret: secret.clone(),
            });
        }

        tx.commit().await?;

        Ok(inserted)
    }
}

/// Optional descriptive columns of generated clients.
#[derive(Debug, Clone, Default)]
pub struct ClientProfile {
    pub email: Option<String>,
    pub notes: Option<String>,
    pub otp: Option<String>,
}

/// Full client row as moved between servers by export and import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRecord {
    pub id: i32,
    pub active: bool,
    pub created: i64,
    pub secret: String,
    pub email: String,
    pub notes: String,
    pub otp: String,
}

impl Storage for PgStorage {
    fn client(&self, id: i32) -> StorageFuture<'_, Option<Client>> {
        Box::pin(async move {
            let span = info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "SELECT",
                db.statement = SELECT_CLIENT
            );
            let client = sqlx::query_as::<_, Client>(SELECT_CLIENT)
                .bind(id)
                .fetch_optional(&self.pool)
                .instrument(span)
                .await?;
            Ok(client)
        })
    }

    fn device<'a>(&'a self, public_name: &'a str) -> StorageFuture<'a, DeviceRecord> {
        Box::pin(self.get_or_create_device(public_name))
    }

    fn advance_counters<'a>(&'a self, update: &'a CounterUpdate) -> StorageFuture<'a, u64> {
        Box::pin(self.update_counters(update))
    }

    fn device_secret_key<'a>(
        &'a self,
        public_name: &'a str,
    ) -> StorageFuture<'a, Option<Vec<u8>>> {
        Box::pin(self.secret_key(public_name))
    }

    fn ping(&self) -> StorageFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query("SELECT 1").execute(&self.pool).await?;
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use sqlx::postgres::{PgConnectOptions, PgSslMode};

    fn unreachable_storage() -> PgStorage {
        let options = PgConnectOptions::new()
            .host("127.0.0.1")
            .port(1)
            .username("invalid")
            .database("invalid")
            .ssl_mode(PgSslMode::Disable);
        PgStorage::new(
            PgPoolOptions::new()
                .acquire_timeout(Duration::from_millis(200))
                .connect_lazy_with(options),
        )
    }

    #[tokio::test]
    async fn client_lookup_fails_without_db() {
        let storage = unreachable_storage();
        let result = storage.client(1).await;
        assert!(matches!(result, Err(StorageError::Database(_))));
    }

    #[tokio::test]
    async fn device_lookup_fails_without_db() {
        let storage = unreachable_storage();
        let result = storage.device("cccccccccccb").await;
        assert!(matches!(result, Err(StorageError::Database(_))));
    }

    #[test]
    fn secret_key_is_hex() {
        let key = parse_secret_key("cccccccccccb", "000102030405060708090A0b0c0d0e0f").unwrap();
        assert_eq!(key, (0u8..16).collect::<Vec<_>>());
    }

    #[test]
    fn secret_key_rejects_non_hex() {
        for key in ["abc", "zz", "0g"] {
            let err = parse_secret_key("cccccccccccb", key).unwrap_err();
            assert!(matches!(err, StorageError::InvalidRecord(_)));
            assert!(err.to_string().contains("cccccccccccb"));
        }
    }

    #[tokio::test]
    async fn import_fails_without_db() {
        let storage = unreachable_storage();
        let device = DeviceRecord::discovered("cccccccccccb", 0);
        assert!(matches!(
            storage.import_devices(&[device]).await,
            Err(StorageError::Database(_))
        ));
    }

    #[tokio::test]
    async fn ping_fails_without_db() {
        let storage = unreachable_storage();
        assert!(storage.ping().await.is_err());
    }
}
