use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::migration::StepError;
use crate::record::TransformedRecord;

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("Connection to {0} failed")]
    Connection(String),

    #[error("Request to {service} failed: {message}")]
    Request { service: String, message: String },

    #[error("No loader registered for target service '{0}'")]
    Unsupported(String),
}

/// Outcome of loading a single record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationResult {
    pub record_id: String,
    pub entity: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl MigrationResult {
    pub fn success(record: &TransformedRecord, target_id: impl Into<String>) -> Self {
        Self {
            record_id: record.id.clone(),
            entity: record.target_entity.clone(),
            success: true,
            target_id: Some(target_id.into()),
            error: None,
            error_code: None,
        }
    }

    pub fn failure(record: &TransformedRecord, error: impl Into<String>) -> Self {
        Self {
            record_id: record.id.clone(),
            entity: record.target_entity.clone(),
            success: false,
            target_id: None,
            error: Some(error.into()),
            error_code: None,
        }
    }

    pub fn with_error_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }
}

/// Aggregate outcome of loading a batch or a whole entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadResult {
    pub entity: String,
    pub total_attempted: usize,
    pub total_succeeded: usize,
    pub total_failed: usize,
    pub total_skipped: usize,
    pub results: Vec<MigrationResult>,
    pub errors: Vec<StepError>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Ids created in the target, kept for rollback
    pub created_ids: Vec<String>,
}

impl LoadResult {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            total_attempted: 0,
            total_succeeded: 0,
            total_failed: 0,
            total_skipped: 0,
            results: Vec::new(),
            errors: Vec::new(),
            started_at: None,
            completed_at: None,
            created_ids: Vec::new(),
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_attempted == 0 {
            return 0.0;
        }
        self.total_succeeded as f64 / self.total_attempted as f64
    }

    /// Fold one record's outcome into the totals
    pub fn record(&mut self, result: MigrationResult) {
        self.total_attempted += 1;
        if result.success {
            self.total_succeeded += 1;
            if let Some(id) = &result.target_id {
                self.created_ids.push(id.clone());
            }
        } else {
            self.total_failed += 1;
            let message = result.error.clone().unwrap_or_else(|| "Unknown error".to_string());
            self.errors.push(StepError::for_record(&result.record_id, message));
        }
        self.results.push(result);
    }

    pub fn merge(&mut self, other: LoadResult) {
        self.total_attempted += other.total_attempted;
        self.total_succeeded += other.total_succeeded;
        self.total_failed += other.total_failed;
        self.total_skipped += other.total_skipped;
        self.results.extend(other.results);
        self.errors.extend(other.errors);
        self.created_ids.extend(other.created_ids);
    }
}

/// Writes transformed records into a target service
#[async_trait]
pub trait Loader: Send + Sync {
    fn target_service(&self) -> &str;

    /// Load one record. With `upsert` off an existing record is a failure.
    async fn load_record(
        &self,
        record: &TransformedRecord,
        upsert: bool,
    ) -> Result<MigrationResult, LoaderError>;

    /// Load a batch. Bulk implementations can fall back to
    /// [`load_batch_sequential`] when the bulk call fails.
    async fn load_batch(
        &self,
        records: &[TransformedRecord],
        entity: &str,
        upsert: bool,
    ) -> LoadResult {
        load_batch_sequential(self, records, entity, upsert).await
    }

    async fn delete_record(&self, entity: &str, id: &str) -> Result<bool, LoaderError>;

    async fn validate_connection(&self) -> bool {
        true
    }

    /// True when `load_batch` sends the whole batch as one request
    fn loads_in_bulk(&self) -> bool {
        false
    }
}

/// Load every record on its own; one failure never stops the rest of the batch
pub async fn load_batch_sequential<L>(
    loader: &L,
    records: &[TransformedRecord],
    entity: &str,
    upsert: bool,
) -> LoadResult
where
    L: Loader + ?Sized,
{
    let mut result = LoadResult::new(entity);
    result.started_at = Some(Utc::now());

    for record in records {
        match loader.load_record(record, upsert).await {
            Ok(outcome) => result.record(outcome),
            Err(e) => {
                error!(record_id = %record.id, entity, "Failed to load record: {}", e);
                result.record(MigrationResult::failure(record, e.to_string()));
            }
        }
    }

    result.completed_at = Some(Utc::now());
    result
}

/// Enforces a minimum interval between requests
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    /// Limiter for `requests_per_second`; non-positive rates do not throttle
    pub fn from_rate(requests_per_second: f64) -> Self {
        let interval = if requests_per_second > 0.0 {
            Duration::from_secs_f64(1.0 / requests_per_second)
        } else {
            Duration::ZERO
        };
        Self::new(interval)
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait until the next request is allowed
    pub async fn acquire(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Wraps a loader so every request passes through a [`RateLimiter`]
pub struct ThrottledLoader {
    inner: Arc<dyn Loader>,
    limiter: RateLimiter,
}

impl ThrottledLoader {
    pub fn new(inner: Arc<dyn Loader>, requests_per_second: f64) -> Self {
        Self {
            inner,
            limiter: RateLimiter::from_rate(requests_per_second),
        }
    }
}

#[async_trait]
impl Loader for ThrottledLoader {
    fn target_service(&self) -> &str {
        self.inner.target_service()
    }

    async fn load_record(
        &self,
        record: &TransformedRecord,
        upsert: bool,
    ) -> Result<MigrationResult, LoaderError> {
        self.limiter.acquire().await;
        self.inner.load_record(record, upsert).await
    }

    /// Bulk loaders pay one interval per batch; others are throttled per record
    async fn load_batch(
        &self,
        records: &[TransformedRecord],
        entity: &str,
        upsert: bool,
    ) -> LoadResult {
        if self.inner.loads_in_bulk() {
            self.limiter.acquire().await;
            self.inner.load_batch(records, entity, upsert).await
        } else {
            load_batch_sequential(self, records, entity, upsert).await
        }
    }

    async fn delete_record(&self, entity: &str, id: &str) -> Result<bool, LoaderError> {
        self.limiter.acquire().await;
        self.inner.delete_record(entity, id).await
    }

    async fn validate_connection(&self) -> bool {
        self.inner.validate_connection().await
    }

    fn loads_in_bulk(&self) -> bool {
        self.inner.loads_in_bulk()
    }
}

/// Keeps loaded records in memory. Used for dry runs and previews.
pub struct MemoryLoader {
    target_service: String,
    records: Mutex<BTreeMap<String, BTreeMap<String, Map<String, Value>>>>,
}

impl MemoryLoader {
    pub fn new(target_service: impl Into<String>) -> Self {
        Self {
            target_service: target_service.into(),
            records: Mutex::new(BTreeMap::new()),
        }
    }

    /// Snapshot of everything loaded for `entity`, ordered by id
    pub async fn records(&self, entity: &str) -> Vec<Map<String, Value>> {
        self.records
            .lock()
            .await
            .get(entity)
            .map(|by_id| by_id.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn count(&self, entity: &str) -> usize {
        self.records.lock().await.get(entity).map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl Loader for MemoryLoader {
    fn target_service(&self) -> &str {
        &self.target_service
    }

    async fn load_record(
        &self,
        record: &TransformedRecord,
        upsert: bool,
    ) -> Result<MigrationResult, LoaderError> {
        let mut records = self.records.lock().await;
        let entity = records.entry(record.target_entity.clone()).or_default();

        if !upsert && entity.contains_key(&record.id) {
            return Ok(MigrationResult::failure(record, "Record already exists")
                .with_error_code("duplicate"));
        }

        entity.insert(record.id.clone(), record.data.clone());
        debug!(record_id = %record.id, entity = %record.target_entity, "Stored record in memory");
        Ok(MigrationResult::success(record, &record.id))
    }

    async fn delete_record(&self, entity: &str, id: &str) -> Result<bool, LoaderError> {
        let mut records = self.records.lock().await;
        Ok(records
            .get_mut(entity)
            .map_or(false, |by_id| by_id.remove(id).is_some()))
    }
}
