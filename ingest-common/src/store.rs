//! # Store
//!
//! Persistence of canonical records.
//!
//! Stores apply a merge function to the current state of a record as one atomic
//! read-modify-write, so concurrent workers reconciling the same entity cannot lose each other's
//! updates. `PgRecordStore` does this with a row lock inside a transaction; `MemoryRecordStore`
//! with a mutex.
use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::{ClassifiedError, ErrorCode};
use crate::identity::Identity;
use crate::merge::reconcile;
use crate::observation::{Attributes, GeoLocation, Observation, Source};
use crate::record::{CanonicalRecord, RecordKey};

/// Computes the next state of a record from its current state, if any.
pub type MergeFn<'a> = &'a (dyn Fn(Option<&CanonicalRecord>) -> CanonicalRecord + Send + Sync);

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Atomically replace the record keyed by `key` with `merge(current)`, inserting it if absent.
    async fn upsert(
        &self,
        key: &RecordKey,
        merge: MergeFn<'_>,
    ) -> Result<CanonicalRecord, ClassifiedError>;

    async fn get(&self, id: Identity) -> Result<Option<CanonicalRecord>, ClassifiedError>;

    /// Reconcile `observation` into the record keyed by `key`.
    async fn merge_observation(
        &self,
        key: &RecordKey,
        observation: &Observation,
    ) -> Result<CanonicalRecord, ClassifiedError> {
        let now = Utc::now().trunc_subsecs(6);
        let merge = |existing: Option<&CanonicalRecord>| reconcile(existing, key, observation, now);

        self.upsert(key, &merge).await
    }
}

/// Classify a database error where it happened.
/// Transient conditions are retryable, everything else would fail again on redelivery.
pub fn classify_db_error(error: sqlx::Error, operation: &str) -> ClassifiedError {
    let classified = match &error {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::WorkerCrashed => ClassifiedError::retryable(
            ErrorCode::ConnectivityError,
            format!("database unavailable during {operation}"),
        ),
        sqlx::Error::Database(db_error) => {
            let sqlstate = db_error.code().map(|code| code.into_owned()).unwrap_or_default();
            let code = classify_sqlstate(&sqlstate);
            ClassifiedError::from_code(code, format!("{operation} query failed: {db_error}"))
                .with_context("sqlstate", sqlstate)
        }
        sqlx::Error::RowNotFound => {
            ClassifiedError::fatal(ErrorCode::ResourceNotFound, format!("{operation} found no row"))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::TypeNotFound { .. } => {
            ClassifiedError::fatal(
                ErrorCode::SerializationError,
                format!("failed to decode {operation} result"),
            )
        }
        _ => ClassifiedError::fatal(
            ErrorCode::InternalError,
            format!("{operation} query failed: {error}"),
        ),
    };

    classified
        .with_context("operation", operation)
        .with_cause(error)
}

fn classify_sqlstate(sqlstate: &str) -> ErrorCode {
    match sqlstate {
        // serialization_failure, deadlock_detected
        "40001" | "40P01" => ErrorCode::ConnectivityError,
        // connection exceptions, operator intervention (e.g. admin shutdown)
        s if s.starts_with("08") || s.starts_with("57P") => ErrorCode::ConnectivityError,
        // too_many_connections
        "53300" => ErrorCode::ConnectivityError,
        "42501" => ErrorCode::AccessDenied,
        _ => ErrorCode::InternalError,
    }
}

/// A `RecordStore` kept in process memory.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<HashMap<Identity, CanonicalRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn upsert(
        &self,
        key: &RecordKey,
        merge: MergeFn<'_>,
    ) -> Result<CanonicalRecord, ClassifiedError> {
        let mut records = self.records.lock().await;
        let next = merge(records.get(&key.id));
        records.insert(key.id, next.clone());

        Ok(next)
    }

    async fn get(&self, id: Identity) -> Result<Option<CanonicalRecord>, ClassifiedError> {
        Ok(self.records.lock().await.get(&id).cloned())
    }
}

#[derive(sqlx::FromRow)]
struct RecordRow {
    id: Uuid,
    source: String,
    external_id: String,
    username: Option<String>,
    display_name: Option<String>,
    url: Option<String>,
    raw_data_reference: String,
    trace_id: Uuid,
    observed_at: DateTime<Utc>,
    attributes: Json<Attributes>,
    location: Option<Json<GeoLocation>>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RecordRow> for CanonicalRecord {
    type Error = ClassifiedError;

    fn try_from(row: RecordRow) -> Result<Self, Self::Error> {
        Ok(CanonicalRecord {
            id: Identity::from(row.id),
            source: Source::from_str(&row.source)?,
            external_id: row.external_id,
            username: row.username,
            display_name: row.display_name,
            url: row.url,
            raw_data_reference: row.raw_data_reference,
            trace_id: row.trace_id,
            observed_at: row.observed_at,
            attributes: row.attributes.0,
            location: row.location.map(|location| location.0),
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const RECORD_COLUMNS: &str = "id, source, external_id, username, display_name, url, \
    raw_data_reference, trace_id, observed_at, attributes, location, version, created_at, updated_at";

/// A `RecordStore` backed by one PostgreSQL table (see `migrations/`).
pub struct PgRecordStore {
    table: String,
    pool: PgPool,
}

impl PgRecordStore {
    /// Initialize a new `PgRecordStore` with its own connection pool.
    pub async fn new(
        table: &str,
        url: &str,
        max_connections: u32,
    ) -> Result<Self, ClassifiedError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|error| classify_db_error(error, "CONNECT"))?;

        Ok(Self::new_from_pool(table, pool))
    }

    /// Initialize a new `PgRecordStore` sharing an existing pool.
    pub fn new_from_pool(table: &str, pool: PgPool) -> Self {
        Self {
            table: table.to_owned(),
            pool,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    async fn select_for_update(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        id: Identity,
    ) -> Result<Option<CanonicalRecord>, ClassifiedError> {
        let query = format!(
            r#"SELECT {RECORD_COLUMNS} FROM "{0}" WHERE id = $1 FOR UPDATE"#,
            self.table
        );

        let row: Option<RecordRow> = sqlx::query_as(&query)
            .bind(id.as_uuid())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|error| classify_db_error(error, "SELECT"))?;

        row.map(CanonicalRecord::try_from).transpose()
    }

    /// Insert `record` unless a row with its id exists. Returns whether the row was inserted.
    async fn insert_if_absent(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        record: &CanonicalRecord,
    ) -> Result<bool, ClassifiedError> {
        let query = format!(
            r#"
INSERT INTO "{0}"
    ({RECORD_COLUMNS})
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
ON CONFLICT DO NOTHING
RETURNING id
            "#,
            self.table
        );

        let inserted: Option<(Uuid,)> = sqlx::query_as(&query)
            .bind(record.id.as_uuid())
            .bind(record.source.as_str())
            .bind(&record.external_id)
            .bind(&record.username)
            .bind(&record.display_name)
            .bind(&record.url)
            .bind(&record.raw_data_reference)
            .bind(record.trace_id)
            .bind(record.observed_at)
            .bind(Json(&record.attributes))
            .bind(record.location.as_ref().map(Json))
            .bind(record.version)
            .bind(record.created_at)
            .bind(record.updated_at)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|error| classify_db_error(error, "INSERT"))?;

        Ok(inserted.is_some())
    }

    async fn update(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        record: &CanonicalRecord,
    ) -> Result<(), ClassifiedError> {
        let query = format!(
            r#"
UPDATE "{0}"
SET
    username = $2,
    display_name = $3,
    url = $4,
    raw_data_reference = $5,
    trace_id = $6,
    observed_at = $7,
    attributes = $8,
    location = $9,
    version = $10,
    updated_at = $11
WHERE
    id = $1
            "#,
            self.table
        );

        sqlx::query(&query)
            .bind(record.id.as_uuid())
            .bind(&record.username)
            .bind(&record.display_name)
            .bind(&record.url)
            .bind(&record.raw_data_reference)
            .bind(record.trace_id)
            .bind(record.observed_at)
            .bind(Json(&record.attributes))
            .bind(record.location.as_ref().map(Json))
            .bind(record.version)
            .bind(record.updated_at)
            .execute(&mut **tx)
            .await
            .map_err(|error| classify_db_error(error, "UPDATE"))?;

        Ok(())
    }

    /// Merge into the locked row and write it back, skipping the write if nothing changed.
    async fn merge_locked(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        current: &CanonicalRecord,
        merge: MergeFn<'_>,
    ) -> Result<CanonicalRecord, ClassifiedError> {
        let next = merge(Some(current));
        if next.version != current.version {
            self.update(tx, &next).await?;
        }
        Ok(next)
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn upsert(
        &self,
        key: &RecordKey,
        merge: MergeFn<'_>,
    ) -> Result<CanonicalRecord, ClassifiedError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| classify_db_error(error, "BEGIN"))?;

        let stored = match self.select_for_update(&mut tx, key.id).await? {
            Some(current) => self.merge_locked(&mut tx, &current, merge).await?,
            None => {
                let candidate = merge(None);
                if self.insert_if_absent(&mut tx, &candidate).await? {
                    candidate
                } else {
                    // Another worker inserted the same entity between our SELECT and INSERT.
                    // Its row is committed now, lock it and merge into it instead.
                    debug!(table = %self.table, id = %key.id, "lost insert race, merging");
                    let current = self.select_for_update(&mut tx, key.id).await?.ok_or_else(|| {
                        ClassifiedError::retryable(
                            ErrorCode::ConnectivityError,
                            "record vanished after a conflicting insert",
                        )
                        .with_context("id", key.id.to_string())
                    })?;
                    self.merge_locked(&mut tx, &current, merge).await?
                }
            }
        };

        tx.commit()
            .await
            .map_err(|error| classify_db_error(error, "COMMIT"))?;

        Ok(stored)
    }

    async fn get(&self, id: Identity) -> Result<Option<CanonicalRecord>, ClassifiedError> {
        let query = format!(r#"SELECT {RECORD_COLUMNS} FROM "{0}" WHERE id = $1"#, self.table);

        let row: Option<RecordRow> = sqlx::query_as(&query)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| classify_db_error(error, "SELECT"))?;

        row.map(CanonicalRecord::try_from).transpose()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, TimeZone};
    use serde_json::json;

    use super::*;

    fn observation(external_id: &str, offset: i64, attributes: serde_json::Value) -> Observation {
        let observed_at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::seconds(offset);
        let mut observation = Observation::new(
            Source::Telegram,
            external_id,
            &format!("s3://raw/{offset}"),
            Uuid::now_v7(),
            observed_at,
        )
        .unwrap();
        if let serde_json::Value::Object(map) = attributes {
            observation.attributes = map;
        }
        observation
    }

    #[test]
    fn test_transient_database_errors_are_retryable() {
        for error in [sqlx::Error::PoolTimedOut, sqlx::Error::PoolClosed, sqlx::Error::WorkerCrashed] {
            let classified = classify_db_error(error, "SELECT");

            assert!(classified.is_retryable());
            assert_eq!(classified.code(), ErrorCode::ConnectivityError);
            assert_eq!(classified.context()["operation"], "SELECT");
        }
    }

    #[test]
    fn test_io_errors_are_retryable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");

        assert!(classify_db_error(sqlx::Error::Io(io), "INSERT").is_retryable());
    }

    #[test]
    fn test_missing_rows_are_fatal() {
        let classified = classify_db_error(sqlx::Error::RowNotFound, "SELECT");

        assert!(!classified.is_retryable());
        assert_eq!(classified.code(), ErrorCode::ResourceNotFound);
    }

    #[test]
    fn test_sqlstate_classification() {
        assert_eq!(classify_sqlstate("40001"), ErrorCode::ConnectivityError);
        assert_eq!(classify_sqlstate("40P01"), ErrorCode::ConnectivityError);
        assert_eq!(classify_sqlstate("08006"), ErrorCode::ConnectivityError);
        assert_eq!(classify_sqlstate("57P01"), ErrorCode::ConnectivityError);
        assert_eq!(classify_sqlstate("42501"), ErrorCode::AccessDenied);
        assert_eq!(classify_sqlstate("23502"), ErrorCode::InternalError);
        assert_eq!(classify_sqlstate(""), ErrorCode::InternalError);
    }

    #[tokio::test]
    async fn test_memory_store_merges_instead_of_duplicating() {
        let store = MemoryRecordStore::new();
        let key = RecordKey::new(Source::Telegram, "durov").unwrap();

        store
            .merge_observation(&key, &observation("durov", 0, json!({"a": 1})))
            .await
            .unwrap();
        let record = store
            .merge_observation(&key, &observation(" DUROV ", 10, json!({"b": 2})))
            .await
            .unwrap();

        assert_eq!(store.len().await, 1);
        assert_eq!(record.version, 2);
        assert_eq!(serde_json::Value::Object(record.attributes), json!({"a": 1, "b": 2}));
        assert_eq!(store.get(key.id).await.unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_memory_store_serializes_concurrent_writers() {
        let store = Arc::new(MemoryRecordStore::new());
        let key = RecordKey::new(Source::Telegram, "durov").unwrap();

        let handles: Vec<_> = (0..16)
            .map(|index| {
                let store = store.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    let incoming = observation("durov", index, json!({ format!("k{index}"): index }));
                    store.merge_observation(&key, &incoming).await.unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let record = store.get(key.id).await.unwrap().unwrap();
        assert_eq!(record.attributes.len(), 16);
        assert_eq!(record.version, 16);
        assert_eq!(
            record.observed_at,
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 15).unwrap()
        );
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_pg_replay_does_not_bump_version(db: PgPool) {
        let store = PgRecordStore::new_from_pool("profiles", db);
        let key = RecordKey::new(Source::Telegram, "durov").unwrap();
        let observed_at = "2024-03-01T12:00:00.123456789Z".parse::<DateTime<Utc>>().unwrap();
        let incoming = Observation::new(
            Source::Telegram,
            "durov",
            "s3://raw/1",
            Uuid::now_v7(),
            observed_at,
        )
        .unwrap();

        let first = store.merge_observation(&key, &incoming).await.unwrap();
        let stored = store.get(key.id).await.unwrap().unwrap();
        for _ in 0..2 {
            store.merge_observation(&key, &incoming).await.unwrap();
        }
        let replayed = store.get(key.id).await.unwrap().unwrap();

        assert_eq!(first, stored);
        assert_eq!(replayed, stored);
        assert_eq!(replayed.version, 1);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_pg_older_observation_does_not_regress(db: PgPool) {
        let store = PgRecordStore::new_from_pool("profiles", db);
        let key = RecordKey::new(Source::Telegram, "durov").unwrap();
        let mut late = observation("durov", 10, json!({"b": 2}));
        late.username = Some("durov".to_owned());
        let mut early = observation("durov", 0, json!({"a": 1}));
        early.location = Some(GeoLocation {
            latitude: Some(55.75),
            longitude: Some(37.61),
            ..GeoLocation::default()
        });

        store.merge_observation(&key, &late).await.unwrap();
        store.merge_observation(&key, &early).await.unwrap();

        let record = store.get(key.id).await.unwrap().unwrap();
        assert_eq!(record.version, 2);
        assert_eq!(record.username.as_deref(), Some("durov"));
        assert_eq!(record.observed_at, late.observed_at);
        assert_eq!(record.raw_data_reference, "s3://raw/10");
        assert_eq!(record.trace_id, late.trace_id);
        assert_eq!(serde_json::Value::Object(record.attributes), json!({"a": 1, "b": 2}));
        assert_eq!(record.location, early.location);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_pg_concurrent_first_inserts_merge(db: PgPool) {
        let store = Arc::new(PgRecordStore::new_from_pool("profiles", db.clone()));
        let key = RecordKey::new(Source::Telegram, "durov").unwrap();

        let handles: Vec<_> = (0..8)
            .map(|index| {
                let store = store.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    let incoming = observation("durov", index, json!({ format!("k{index}"): index }));
                    store.merge_observation(&key, &incoming).await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let rows: (i64,) = sqlx::query_as("SELECT count(*) FROM profiles")
            .fetch_one(&db)
            .await
            .unwrap();
        let record = store.get(key.id).await.unwrap().unwrap();
        assert_eq!(rows.0, 1);
        assert_eq!(record.attributes.len(), 8);
        assert_eq!(record.version, 8);
        assert_eq!(
            record.observed_at,
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 7).unwrap()
        );
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_pg_tables_are_independent(db: PgPool) {
        let profiles = PgRecordStore::new_from_pool("profiles", db.clone());
        let posts = PgRecordStore::new_from_pool("content_posts", db);
        let key = RecordKey::composite(Source::Telegram, ["chronos_news", "42"]).unwrap();

        posts
            .merge_observation(&key, &observation("chronos_news:42", 0, json!({"text": "hello"})))
            .await
            .unwrap();

        assert!(profiles.get(key.id).await.unwrap().is_none());
        let post = posts.get(key.id).await.unwrap().unwrap();
        assert_eq!(post.external_id, "chronos_news:42");
        assert_eq!(post.attributes["text"], json!("hello"));
    }
}
