use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::field_path;
use crate::validation::{Severity, ValidationError};

/// Lifecycle of a record as it moves through the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    Extracted,
    Transformed,
    Validated,
    Loaded,
    Failed,
    Skipped,
}

/// A record as it was pulled out of a source service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: String,
    pub source_service: String,
    pub source_entity: String,
    pub data: Value,
    /// Unprocessed payload kept for audit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_data: Option<Value>,
    pub extracted_at: DateTime<Utc>,
    #[serde(default = "default_source_type")]
    pub source_type: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

fn default_source_type() -> String {
    "api".to_string()
}

impl SourceRecord {
    pub fn new(
        id: impl Into<String>,
        source_service: impl Into<String>,
        source_entity: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            id: id.into(),
            source_service: source_service.into(),
            source_entity: source_entity.into(),
            data,
            raw_data: None,
            extracted_at: Utc::now(),
            source_type: default_source_type(),
            metadata: Map::new(),
        }
    }

    pub fn with_raw_data(mut self, raw: Value) -> Self {
        self.raw_data = Some(raw);
        self
    }

    pub fn with_source_type(mut self, source_type: impl Into<String>) -> Self {
        self.source_type = source_type.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Resolve a dot-notation path inside the record payload
    pub fn get_field(&self, path: &str) -> Option<&Value> {
        field_path::lookup(&self.data, path)
    }
}

/// Back-reference from a transformed record to one of its sources
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub id: String,
    pub service: String,
    pub entity: String,
}

impl From<&SourceRecord> for SourceRef {
    fn from(record: &SourceRecord) -> Self {
        Self {
            id: record.id.clone(),
            service: record.source_service.clone(),
            entity: record.source_entity.clone(),
        }
    }
}

/// A record shaped for the target service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformedRecord {
    pub id: String,
    pub target_service: String,
    pub target_entity: String,
    pub data: Map<String, Value>,
    pub source_records: Vec<SourceRef>,
    pub transformed_at: DateTime<Utc>,
    pub status: RecordStatus,
    #[serde(default)]
    pub validation_errors: Vec<ValidationError>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl TransformedRecord {
    pub fn new(
        id: impl Into<String>,
        target_service: impl Into<String>,
        target_entity: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            target_service: target_service.into(),
            target_entity: target_entity.into(),
            data: Map::new(),
            source_records: Vec::new(),
            transformed_at: Utc::now(),
            status: RecordStatus::Pending,
            validation_errors: Vec::new(),
            warnings: Vec::new(),
            metadata: Map::new(),
        }
    }

    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }

    /// A record is loadable as long as nothing of error severity was recorded against it
    pub fn is_valid(&self) -> bool {
        !self
            .validation_errors
            .iter()
            .any(|e| e.severity == Severity::Error)
    }

    pub fn source_ids(&self) -> Vec<&str> {
        self.source_records.iter().map(|s| s.id.as_str()).collect()
    }

    /// Service of the first source this record was derived from
    pub fn primary_source_service(&self) -> Option<&str> {
        self.source_records.first().map(|s| s.service.as_str())
    }

    pub fn get_field(&self, path: &str) -> Option<&Value> {
        match path.split_once('.') {
            None => self.data.get(path).filter(|v| !v.is_null()),
            Some((root, rest)) => self
                .data
                .get(root)
                .and_then(|v| field_path::lookup(v, rest)),
        }
    }
}
