use crate::config::DatabaseConfig;
use crate::decoder::ImageMessage;
use async_trait::async_trait;
use backoff::backoff::{Backoff, Constant};
use chrono::NaiveDateTime;
use parking_lot::Mutex;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

const CREATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS image_messages (
        id SERIAL PRIMARY KEY,
        topic TEXT,
        image BYTEA,
        width INTEGER,
        height INTEGER,
        timestamp TIMESTAMP
    )
"#;

/// Errors raised while bringing up the store. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("PostgreSQL unreachable after {attempts} attempts: {source}")]
    Unreachable {
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },

    #[error("Failed to provision image_messages table: {0}")]
    Provision(#[source] sqlx::Error),

    #[error("Query failed: {0}")]
    Query(#[from] sqlx::Error),
}

/// A single failed write. The message is dropped by the caller.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("Failed to insert image message: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Row in the image_messages table.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct StoredRecord {
    pub id: i32,
    pub topic: String,
    pub image: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub timestamp: NaiveDateTime,
}

/// Destination for validated messages.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Write one message as a single auto-committed insert, returning its id.
    async fn persist(&self, message: &ImageMessage) -> Result<i64, PersistError>;
}

/// PostgreSQL-backed image store
pub struct PgImageStore {
    pool: PgPool,
}

impl PgImageStore {
    /// Connect with fixed-delay retry, then provision the schema.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.name)
            .username(&config.user)
            .password(&config.password);

        let max_attempts = config.connect_attempts.max(1);
        let mut backoff = Constant::new(config.retry_delay());
        let mut attempt = 0u32;

        let pool = loop {
            attempt += 1;

            let result = PgPoolOptions::new()
                .max_connections(config.max_connections.max(1))
                .acquire_timeout(config.acquire_timeout())
                .connect_with(options.clone())
                .await;

            match result {
                Ok(pool) => break pool,
                Err(e) if attempt >= max_attempts => {
                    return Err(StoreError::Unreachable {
                        attempts: attempt,
                        source: e,
                    });
                }
                Err(e) => {
                    let delay = backoff.next_backoff().unwrap_or_default();
                    warn!(
                        attempt = attempt,
                        max_attempts = max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "PostgreSQL not ready, retrying"
                    );
                    metrics::counter!("bridge.store.connect_retries").increment(1);
                    tokio::time::sleep(delay).await;
                }
            }
        };

        info!(
            host = %config.host,
            database = %config.name,
            attempts = attempt,
            "Connected to PostgreSQL"
        );

        let store = Self { pool };
        store.provision().await?;
        Ok(store)
    }

    /// Wrap an existing pool without provisioning.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the destination table if it does not exist. Safe to repeat.
    pub async fn provision(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_TABLE)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Provision)?;

        debug!("image_messages table ready");
        Ok(())
    }

    /// All stored records in id order.
    pub async fn records(&self) -> Result<Vec<StoredRecord>, StoreError> {
        let records = sqlx::query_as::<_, StoredRecord>(
            r#"
            SELECT id, topic, image, width, height, timestamp
            FROM image_messages
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Close the pool, waiting for checked-out connections to return.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("PostgreSQL connection closed");
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ImageStore for PgImageStore {
    #[instrument(skip(self, message), fields(topic = %message.topic, size_bytes = message.image.len()))]
    async fn persist(&self, message: &ImageMessage) -> Result<i64, PersistError> {
        let (id,): (i32,) = sqlx::query_as(
            r#"
            INSERT INTO image_messages (topic, image, width, height, timestamp)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(&message.topic)
        .bind(message.image.as_slice())
        .bind(message.width)
        .bind(message.height)
        .bind(message.received_at.naive_utc())
        .fetch_one(&self.pool)
        .await?;

        Ok(i64::from(id))
    }
}

/// In-memory store, for running the pipeline without a database.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Vec<StoredRecord>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail (or succeed again).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<StoredRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl ImageStore for MemoryStore {
    async fn persist(&self, message: &ImageMessage) -> Result<i64, PersistError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PersistError::Unavailable("memory store offline".to_string()));
        }

        let mut records = self.records.lock();
        let id = records.len() as i32 + 1;
        records.push(StoredRecord {
            id,
            topic: message.topic.clone(),
            image: message.image.clone(),
            width: message.width,
            height: message.height,
            timestamp: message.received_at.naive_utc(),
        });

        Ok(i64::from(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::{Duration, Instant};

    fn message(topic: &str) -> ImageMessage {
        ImageMessage {
            topic: topic.to_string(),
            image: b"hi".to_vec(),
            width: 10,
            height: 20,
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_memory_store_assigns_increasing_ids() {
        let store = MemoryStore::new();
        let first = store.persist(&message("a")).await.unwrap();
        let second = store.persist(&message("b")).await.unwrap();

        assert!(first < second);
        let records = store.records();
        assert_eq!(records[0].topic, "a");
        assert_eq!(records[1].topic, "b");
        assert_eq!(records[0].image, b"hi");
    }

    #[tokio::test]
    async fn test_memory_store_unavailable() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.persist(&message("a")).await,
            Err(PersistError::Unavailable(_))
        ));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_retry_budget() {
        // Nothing listens on port 1; every attempt is refused immediately.
        let config = DatabaseConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            connect_attempts: 3,
            retry_delay_ms: 10,
            acquire_timeout_secs: 1,
            ..DatabaseConfig::default()
        };

        let started = Instant::now();
        let result = PgImageStore::connect(&config).await;

        assert!(matches!(
            result,
            Err(StoreError::Unreachable { attempts: 3, .. })
        ));
        // Two delays between three attempts.
        assert!(started.elapsed() >= Duration::from_millis(20));
    }
}
