//! Entity timezone registry + dedupe ledger backends for Daymark.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use daymark_core::{DedupeRecord, EntityId, EntityTimezone};
use serde::Deserialize;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "daymark-storage";

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("registry file {}: {message}", .path.display())]
    RegistryFile { path: PathBuf, message: String },
    #[error("invalid SQL identifier '{0}'")]
    InvalidIdentifier(String),
    #[error("retention horizon of {requested_minutes} minutes is shorter than one day")]
    HorizonTooShort { requested_minutes: i64 },
}

/// Read-only view of entities that carry a timezone.
#[async_trait]
pub trait TimezoneRegistry: Send + Sync {
    /// Every entity with a non-blank timezone. Names are returned unvalidated.
    async fn list_candidates(&self) -> Result<Vec<EntityTimezone>, StorageError>;
}

/// Set of `(entity_id, local_date)` pairs that have already been triggered.
#[async_trait]
pub trait DedupeLedger: Send + Sync {
    /// Insert the pair if absent. `true` only for the caller that performed the insert.
    async fn claim(&self, entity_id: EntityId, local_date: NaiveDate) -> Result<bool, StorageError>;

    async fn find(
        &self,
        entity_id: EntityId,
        local_date: NaiveDate,
    ) -> Result<Option<DedupeRecord>, StorageError>;

    async fn purge_triggered_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError>;

    async fn purge_older_than(&self, horizon: RetentionHorizon) -> Result<u64, StorageError> {
        self.purge_triggered_before(horizon.cutoff(Utc::now())).await
    }
}

/// Age beyond which ledger rows may be deleted. Never shorter than a day, so
/// a purge cannot drop a row that still absorbs same-day duplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionHorizon(Duration);

impl RetentionHorizon {
    pub fn new(horizon: Duration) -> Result<Self, StorageError> {
        if horizon < Duration::days(1) {
            return Err(StorageError::HorizonTooShort {
                requested_minutes: horizon.num_minutes(),
            });
        }
        Ok(Self(horizon))
    }

    pub fn days(days: u32) -> Result<Self, StorageError> {
        Self::new(Duration::days(i64::from(days)))
    }

    pub fn duration(&self) -> Duration {
        self.0
    }

    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.0)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Only failures that happened before the statement reached the server are
/// safe to retry: a re-sent claim that already committed would report `false`.
pub fn classify_sqlx_error(err: &sqlx::Error) -> RetryDisposition {
    match err {
        sqlx::Error::PoolTimedOut => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: StdDuration,
    pub max_delay: StdDuration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: StdDuration::from_millis(250),
            max_delay: StdDuration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> StdDuration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Accepts `name` or `schema.name`, each part `[A-Za-z_][A-Za-z0-9_]*`.
pub fn validate_identifier(raw: &str) -> Result<&str, StorageError> {
    let valid_part = |part: &str| {
        let mut chars = part.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    };
    let parts: Vec<&str> = raw.split('.').collect();
    if parts.len() > 2 || !parts.iter().all(|p| valid_part(p)) {
        return Err(StorageError::InvalidIdentifier(raw.to_string()));
    }
    Ok(raw)
}

pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, StorageError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(StdDuration::from_secs(10))
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub async fn migrate(pool: &PgPool) -> Result<(), StorageError> {
    MIGRATOR.run(pool).await?;
    info!("database migrations applied");
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PgRegistry {
    pool: PgPool,
    table: String,
}

impl PgRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            table: "entities".to_string(),
        }
    }

    /// Read from another table or view exposing `id uuid` and `timezone text`.
    pub fn with_table(mut self, table: &str) -> Result<Self, StorageError> {
        self.table = validate_identifier(table)?.to_string();
        Ok(self)
    }
}

#[async_trait]
impl TimezoneRegistry for PgRegistry {
    async fn list_candidates(&self) -> Result<Vec<EntityTimezone>, StorageError> {
        // `timezone IS NOT NULL` matches the partial index predicate.
        let sql = format!(
            "SELECT id, timezone FROM {} WHERE timezone IS NOT NULL AND btrim(timezone) <> ''",
            self.table
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let entity_id: EntityId = row.try_get("id")?;
            let timezone: String = row.try_get("timezone")?;
            out.push(EntityTimezone::new(entity_id, timezone));
        }
        Ok(out)
    }
}

#[derive(Debug, Clone)]
pub struct PgLedger {
    pool: PgPool,
    backoff: BackoffPolicy,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}

#[async_trait]
impl DedupeLedger for PgLedger {
    async fn claim(&self, entity_id: EntityId, local_date: NaiveDate) -> Result<bool, StorageError> {
        let mut attempt = 0usize;
        loop {
            let result = sqlx::query(
                r#"
                INSERT INTO midnight_trigger_ledger (entity_id, local_date)
                VALUES ($1, $2)
                ON CONFLICT (entity_id, local_date) DO NOTHING
                "#,
            )
            .bind(entity_id)
            .bind(local_date)
            .execute(&self.pool)
            .await;

            match result {
                Ok(done) => return Ok(done.rows_affected() == 1),
                Err(err)
                    if classify_sqlx_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries =>
                {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    debug!(%entity_id, %local_date, attempt, ?delay, "ledger claim waiting for a connection");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn find(
        &self,
        entity_id: EntityId,
        local_date: NaiveDate,
    ) -> Result<Option<DedupeRecord>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT entity_id, local_date, triggered_at
              FROM midnight_trigger_ledger
             WHERE entity_id = $1 AND local_date = $2
            "#,
        )
        .bind(entity_id)
        .bind(local_date)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(DedupeRecord {
            entity_id: row.try_get("entity_id")?,
            local_date: row.try_get("local_date")?,
            triggered_at: row.try_get("triggered_at")?,
        }))
    }

    async fn purge_triggered_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        let done = sqlx::query("DELETE FROM midnight_trigger_ledger WHERE triggered_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected())
    }
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    entities: Vec<RegistryFileEntry>,
}

#[derive(Debug, Deserialize)]
struct RegistryFileEntry {
    id: EntityId,
    #[serde(default)]
    timezone: Option<String>,
}

/// Registry backed by a YAML file, re-read on every call.
///
/// ```yaml
/// entities:
///   - id: 7f1c2f4e-3f55-4a4e-9d9b-0d7f0c2d1e11
///     timezone: America/New_York
///   - id: 0b5d2a8e-52a6-4d43-8f7e-1f0d92c4c0aa
///     timezone: null
/// ```
#[derive(Debug, Clone)]
pub struct YamlRegistry {
    path: PathBuf,
}

impl YamlRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TimezoneRegistry for YamlRegistry {
    async fn list_candidates(&self) -> Result<Vec<EntityTimezone>, StorageError> {
        let file_error = |message: String| StorageError::RegistryFile {
            path: self.path.clone(),
            message,
        };
        let text = fs::read_to_string(&self.path)
            .await
            .map_err(|err| file_error(err.to_string()))?;
        let parsed: RegistryFile =
            serde_yaml::from_str(&text).map_err(|err| file_error(err.to_string()))?;
        Ok(parsed
            .entities
            .into_iter()
            .filter_map(|entry| {
                let timezone = entry.timezone?;
                (!timezone.trim().is_empty()).then(|| EntityTimezone::new(entry.id, timezone))
            })
            .collect())
    }
}

/// In-process registry for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    entities: Mutex<Vec<(EntityId, Option<String>)>>,
}

impl MemoryRegistry {
    pub fn new(entities: impl IntoIterator<Item = (EntityId, Option<String>)>) -> Self {
        Self {
            entities: Mutex::new(entities.into_iter().collect()),
        }
    }

    pub async fn upsert(&self, entity_id: EntityId, timezone: Option<String>) {
        let mut entities = self.entities.lock().await;
        match entities.iter_mut().find(|(id, _)| *id == entity_id) {
            Some(existing) => existing.1 = timezone,
            None => entities.push((entity_id, timezone)),
        }
    }
}

#[async_trait]
impl TimezoneRegistry for MemoryRegistry {
    async fn list_candidates(&self) -> Result<Vec<EntityTimezone>, StorageError> {
        let entities = self.entities.lock().await;
        Ok(entities
            .iter()
            .filter_map(|(id, tz)| {
                let tz = tz.as_deref()?;
                (!tz.trim().is_empty()).then(|| EntityTimezone::new(*id, tz))
            })
            .collect())
    }
}

/// In-process ledger. The map lock makes check-and-insert a single step.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    records: Mutex<HashMap<(EntityId, NaiveDate), DateTime<Utc>>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn claim_at(
        &self,
        entity_id: EntityId,
        local_date: NaiveDate,
        triggered_at: DateTime<Utc>,
    ) -> bool {
        let mut records = self.records.lock().await;
        match records.entry((entity_id, local_date)) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(triggered_at);
                true
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    pub async fn records(&self) -> Vec<DedupeRecord> {
        let records = self.records.lock().await;
        let mut out = records
            .iter()
            .map(|((entity_id, local_date), triggered_at)| DedupeRecord {
                entity_id: *entity_id,
                local_date: *local_date,
                triggered_at: *triggered_at,
            })
            .collect::<Vec<_>>();
        out.sort_by_key(|r| (r.local_date, r.entity_id));
        out
    }
}

#[async_trait]
impl DedupeLedger for MemoryLedger {
    async fn claim(&self, entity_id: EntityId, local_date: NaiveDate) -> Result<bool, StorageError> {
        Ok(self.claim_at(entity_id, local_date, Utc::now()).await)
    }

    async fn find(
        &self,
        entity_id: EntityId,
        local_date: NaiveDate,
    ) -> Result<Option<DedupeRecord>, StorageError> {
        let records = self.records.lock().await;
        Ok(records
            .get(&(entity_id, local_date))
            .map(|triggered_at| DedupeRecord {
                entity_id,
                local_date,
                triggered_at: *triggered_at,
            }))
    }

    async fn purge_triggered_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, triggered_at| *triggered_at >= cutoff);
        Ok((before - records.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_award_exactly_one_winner() {
        let ledger = Arc::new(MemoryLedger::new());
        let entity = Uuid::new_v4();
        let date = ymd(2026, 3, 8);

        let mut handles = Vec::new();
        for _ in 0..32 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move { ledger.claim(entity, date).await }));
        }
        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() {
                wins += 1;
            }
        }

        assert_eq!(wins, 1);
        assert_eq!(ledger.len().await, 1);
    }

    #[tokio::test]
    async fn claims_are_keyed_by_entity_and_date() {
        let ledger = MemoryLedger::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert!(ledger.claim(a, ymd(2026, 3, 8)).await.unwrap());
        assert!(!ledger.claim(a, ymd(2026, 3, 8)).await.unwrap());
        assert!(ledger.claim(a, ymd(2026, 3, 9)).await.unwrap());
        assert!(ledger.claim(b, ymd(2026, 3, 8)).await.unwrap());

        let found = ledger.find(a, ymd(2026, 3, 8)).await.unwrap().unwrap();
        assert_eq!(found.entity_id, a);
        assert!(ledger.find(b, ymd(2026, 3, 9)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn purge_removes_only_rows_past_the_horizon() {
        let ledger = MemoryLedger::new();
        let now = Utc::now();
        let old = Uuid::new_v4();
        let fresh = Uuid::new_v4();
        ledger
            .claim_at(old, ymd(2026, 1, 1), now - Duration::days(40))
            .await;
        ledger
            .claim_at(fresh, ymd(2026, 2, 9), now - Duration::hours(2))
            .await;

        let purged = ledger
            .purge_older_than(RetentionHorizon::days(30).unwrap())
            .await
            .unwrap();

        assert_eq!(purged, 1);
        assert_eq!(ledger.len().await, 1);
        // The surviving same-day row still blocks a duplicate.
        assert!(!ledger.claim(fresh, ymd(2026, 2, 9)).await.unwrap());
    }

    #[test]
    fn retention_horizon_refuses_sub_day_values() {
        assert!(matches!(
            RetentionHorizon::new(Duration::hours(23)),
            Err(StorageError::HorizonTooShort { requested_minutes: 1380 })
        ));
        assert!(RetentionHorizon::days(0).is_err());
        let horizon = RetentionHorizon::days(1).unwrap();
        let now = Utc::now();
        assert_eq!(horizon.cutoff(now), now - Duration::days(1));
    }

    #[tokio::test]
    async fn yaml_registry_skips_entities_without_timezone() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("entities.yaml");
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        std::fs::write(
            &path,
            format!(
                "entities:\n  - id: {a}\n    timezone: America/New_York\n  - id: {b}\n    timezone: null\n  - id: {c}\n    timezone: \"  \"\n"
            ),
        )
        .unwrap();

        let registry = YamlRegistry::new(&path);
        let listed = registry.list_candidates().await.unwrap();
        assert_eq!(listed, vec![EntityTimezone::new(a, "America/New_York")]);
    }

    #[tokio::test]
    async fn yaml_registry_reports_missing_file() {
        let dir = tempdir().expect("tempdir");
        let registry = YamlRegistry::new(dir.path().join("absent.yaml"));
        let err = registry.list_candidates().await.unwrap_err();
        assert!(matches!(err, StorageError::RegistryFile { .. }));
    }

    #[tokio::test]
    async fn memory_registry_upsert_replaces_timezone() {
        let id = Uuid::new_v4();
        let registry = MemoryRegistry::new([(id, None)]);
        assert!(registry.list_candidates().await.unwrap().is_empty());

        registry.upsert(id, Some("Europe/Berlin".into())).await;
        assert_eq!(
            registry.list_candidates().await.unwrap(),
            vec![EntityTimezone::new(id, "Europe/Berlin")]
        );
    }

    #[test]
    fn identifiers_are_validated() {
        assert!(validate_identifier("entities").is_ok());
        assert!(validate_identifier("public.user_profiles").is_ok());
        assert!(validate_identifier("_v2").is_ok());
        assert!(validate_identifier("1table").is_err());
        assert!(validate_identifier("a.b.c").is_err());
        assert!(validate_identifier("users; DROP TABLE x").is_err());
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn only_pool_timeouts_are_retryable() {
        assert_eq!(
            classify_sqlx_error(&sqlx::Error::PoolTimedOut),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_sqlx_error(&sqlx::Error::RowNotFound),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: StdDuration::from_millis(100),
            max_delay: StdDuration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), StdDuration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), StdDuration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), StdDuration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), StdDuration::from_millis(350));
    }
}
