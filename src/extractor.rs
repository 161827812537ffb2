use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

use crate::field_path::{self, value_to_string};
use crate::migration::{DataSource, DataSourceType, StepError};
use crate::record::SourceRecord;

#[derive(Debug, Error)]
pub enum ExtractorError {
    #[error("Failed to read {0}: {1}")]
    Io(String, std::io::Error),

    #[error("Failed to parse {0}: {1}")]
    Parse(String, String),

    #[error("Invalid source configuration: {0}")]
    InvalidSource(String),

    #[error("No extractor registered for source type '{0}'")]
    Unsupported(DataSourceType),

    #[error("Source {0} failed: {1}")]
    Remote(String, String),
}

/// Outcome of a full extraction from one source
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionResult {
    pub source: DataSource,
    #[serde(skip)]
    pub records: Vec<SourceRecord>,
    pub total_extracted: usize,
    pub errors: Vec<StepError>,
    pub warnings: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: Map<String, Value>,
}

impl ExtractionResult {
    pub fn new(source: DataSource) -> Self {
        Self {
            source,
            records: Vec::new(),
            total_extracted: 0,
            errors: Vec::new(),
            warnings: Vec::new(),
            started_at: None,
            completed_at: None,
            metadata: Map::new(),
        }
    }

    pub fn with_records(mut self, records: Vec<SourceRecord>) -> Self {
        self.total_extracted = records.len();
        self.records = records;
        self
    }

    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }
}

/// Pulls records for one entity out of one source
#[async_trait]
pub trait Extractor: Send + Sync {
    fn source(&self) -> &DataSource;

    /// Extract everything the source has
    async fn extract(&self) -> Result<ExtractionResult, ExtractorError>;

    async fn extract_batch(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<SourceRecord>, ExtractorError>;

    /// Page through `extract_batch` until an empty or short page comes back
    fn stream(&self, batch_size: usize) -> BoxStream<'_, Result<Vec<SourceRecord>, ExtractorError>> {
        let batch_size = batch_size.max(1);
        stream::unfold(Some(0usize), move |offset| async move {
            let offset = offset?;
            match self.extract_batch(offset, batch_size).await {
                Ok(batch) if batch.is_empty() => None,
                Ok(batch) => {
                    let next = (batch.len() == batch_size).then(|| offset + batch.len());
                    Some((Ok(batch), next))
                }
                Err(e) => Some((Err(e), None)),
            }
        })
        .boxed()
    }

    /// Configuration problems, empty when the source is usable
    fn validate_source(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.source().service.is_empty() {
            errors.push("Source service name is required".to_string());
        }
        if self.source().entity.is_empty() {
            errors.push("Source entity name is required".to_string());
        }
        errors
    }
}

/// Build a record stamped with the source's service, entity and type
pub fn create_record(source: &DataSource, id: impl Into<String>, data: Value) -> SourceRecord {
    let mut record = SourceRecord::new(id, &source.service, &source.entity, data.clone())
        .with_raw_data(data)
        .with_source_type(source.source_type.as_str());
    if let Some(path) = &source.file_path {
        record = record.with_metadata("source_file", json!(path));
    }
    record
}

/// Keep payloads whose fields equal every configured filter value
fn matches_filters(data: &Value, filters: &Map<String, Value>) -> bool {
    filters
        .iter()
        .all(|(path, expected)| field_path::lookup(data, path) == Some(expected))
}

/// Reads an exported JSON or YAML file.
///
/// The document is either a top-level array of records or an object
/// holding the array under `data` or `records`.
pub struct FileExtractor {
    source: DataSource,
}

impl FileExtractor {
    pub fn new(source: DataSource) -> Result<Self, ExtractorError> {
        if source.file_path.is_none() {
            return Err(ExtractorError::InvalidSource(format!(
                "{} source '{}' has no file_path",
                source.source_type,
                source.key()
            )));
        }
        Ok(Self { source })
    }

    fn path(&self) -> &str {
        self.source.file_path.as_deref().unwrap_or_default()
    }

    async fn read_records(&self) -> Result<Vec<SourceRecord>, ExtractorError> {
        let path = self.path();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ExtractorError::Io(path.to_string(), e))?;

        // serde_yaml accepts JSON documents as well
        let document: Value = serde_yaml::from_str(&content)
            .map_err(|e| ExtractorError::Parse(path.to_string(), e.to_string()))?;

        let items = match document {
            Value::Array(items) => items,
            Value::Object(mut map) => match map.remove("data").or_else(|| map.remove("records")) {
                Some(Value::Array(items)) => items,
                _ => {
                    return Err(ExtractorError::Parse(
                        path.to_string(),
                        "expected an array under 'data' or 'records'".to_string(),
                    ))
                }
            },
            _ => {
                return Err(ExtractorError::Parse(
                    path.to_string(),
                    "expected an array of records".to_string(),
                ))
            }
        };

        let records = items
            .into_iter()
            .enumerate()
            .filter(|(_, item)| matches_filters(item, &self.source.filters))
            .map(|(position, item)| {
                let id = item
                    .get("id")
                    .filter(|v| !v.is_null())
                    .map(value_to_string)
                    .unwrap_or_else(|| position.to_string());
                create_record(&self.source, id, item)
            })
            .collect::<Vec<_>>();

        debug!(path, count = records.len(), "Read records from file");
        Ok(records)
    }
}

#[async_trait]
impl Extractor for FileExtractor {
    fn source(&self) -> &DataSource {
        &self.source
    }

    async fn extract(&self) -> Result<ExtractionResult, ExtractorError> {
        let started_at = Utc::now();
        let records = self.read_records().await?;
        info!(
            service = %self.source.service,
            entity = %self.source.entity,
            count = records.len(),
            "Extracted records from {}",
            self.path()
        );

        let mut result = ExtractionResult::new(self.source.clone()).with_records(records);
        result.started_at = Some(started_at);
        result.completed_at = Some(Utc::now());
        Ok(result)
    }

    async fn extract_batch(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<SourceRecord>, ExtractorError> {
        let records = self.read_records().await?;
        Ok(records.into_iter().skip(offset).take(limit).collect())
    }

    fn validate_source(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.source.service.is_empty() {
            errors.push("Source service name is required".to_string());
        }
        if self.source.entity.is_empty() {
            errors.push("Source entity name is required".to_string());
        }
        if !Path::new(self.path()).is_file() {
            errors.push(format!("File not found: {}", self.path()));
        }
        errors
    }
}

/// Serves records that were handed over directly, e.g. pasted or uploaded data
pub struct InMemoryExtractor {
    source: DataSource,
    records: Vec<SourceRecord>,
}

impl InMemoryExtractor {
    pub fn new(source: DataSource, records: Vec<SourceRecord>) -> Self {
        Self { source, records }
    }

    /// Wrap raw payloads, taking ids from `id` or the position in `payloads`
    pub fn from_values(source: DataSource, payloads: Vec<Value>) -> Self {
        let records = payloads
            .into_iter()
            .enumerate()
            .map(|(position, item)| {
                let id = item
                    .get("id")
                    .filter(|v| !v.is_null())
                    .map(value_to_string)
                    .unwrap_or_else(|| position.to_string());
                create_record(&source, id, item)
            })
            .collect();
        Self { source, records }
    }
}

#[async_trait]
impl Extractor for InMemoryExtractor {
    fn source(&self) -> &DataSource {
        &self.source
    }

    async fn extract(&self) -> Result<ExtractionResult, ExtractorError> {
        let now = Utc::now();
        let mut result = ExtractionResult::new(self.source.clone()).with_records(self.records.clone());
        result.started_at = Some(now);
        result.completed_at = Some(now);
        Ok(result)
    }

    async fn extract_batch(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<SourceRecord>, ExtractorError> {
        Ok(self.records.iter().skip(offset).take(limit).cloned().collect())
    }
}
