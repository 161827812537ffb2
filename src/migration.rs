use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    extractor::ExtractorError, loader::LoaderError, mapping::MappingError,
    schema_registry::RegistryError, transformation_engine::TransformationError,
    validation::ValidationError,
};

/// Status of a migration run or of one of its steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Pending,
    Extracting,
    Transforming,
    Validating,
    Loading,
    Completed,
    Failed,
    Cancelled,
    Paused,
    RollingBack,
    RolledBack,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::Pending => "pending",
            MigrationStatus::Extracting => "extracting",
            MigrationStatus::Transforming => "transforming",
            MigrationStatus::Validating => "validating",
            MigrationStatus::Loading => "loading",
            MigrationStatus::Completed => "completed",
            MigrationStatus::Failed => "failed",
            MigrationStatus::Cancelled => "cancelled",
            MigrationStatus::Paused => "paused",
            MigrationStatus::RollingBack => "rolling_back",
            MigrationStatus::RolledBack => "rolled_back",
        }
    }

    /// Phases during which records are flowing and a pause is possible
    pub fn is_active_phase(&self) -> bool {
        matches!(
            self,
            MigrationStatus::Extracting
                | MigrationStatus::Transforming
                | MigrationStatus::Validating
                | MigrationStatus::Loading
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MigrationStatus::Completed
                | MigrationStatus::Failed
                | MigrationStatus::Cancelled
                | MigrationStatus::RolledBack
        )
    }

    fn next_phase(&self) -> Option<MigrationStatus> {
        match self {
            MigrationStatus::Pending => Some(MigrationStatus::Extracting),
            MigrationStatus::Extracting => Some(MigrationStatus::Transforming),
            MigrationStatus::Transforming => Some(MigrationStatus::Validating),
            MigrationStatus::Validating => Some(MigrationStatus::Loading),
            MigrationStatus::Loading => Some(MigrationStatus::Completed),
            _ => None,
        }
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition {
        from: MigrationStatus,
        to: MigrationStatus,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to read config file {0}: {1}")]
    ConfigIo(String, std::io::Error),

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    #[error("Failed to connect to target service {0}")]
    Connection(String),

    #[error("Max errors ({max}) exceeded during {phase}: {count} errors")]
    MaxErrorsExceeded {
        phase: MigrationStatus,
        count: usize,
        max: usize,
    },

    #[error("Migration cancelled")]
    Cancelled,

    #[error("Failed to write {0}: {1}")]
    Artifact(String, String),

    #[error(transparent)]
    Extractor(#[from] ExtractorError),

    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error(transparent)]
    Transformation(#[from] TransformationError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Mapping(#[from] MappingError),
}

/// Record-level failure attached to a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ValidationError>,
}

impl StepError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            record_id: None,
            message: message.into(),
            errors: Vec::new(),
        }
    }

    pub fn for_record(record_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            record_id: Some(record_id.into()),
            message: message.into(),
            errors: Vec::new(),
        }
    }

    pub fn with_errors(mut self, errors: Vec<ValidationError>) -> Self {
        self.errors = errors;
        self
    }
}

/// Phase-level failure attached to the run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    pub phase: MigrationStatus,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// One entity's pass through one phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationStep {
    pub id: String,
    pub name: String,
    pub entity: String,
    pub status: MigrationStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub records_processed: usize,
    pub records_succeeded: usize,
    pub records_failed: usize,
    pub records_skipped: usize,
    pub errors: Vec<StepError>,
    pub warnings: Vec<String>,
}

impl MigrationStep {
    pub fn new(name: impl Into<String>, entity: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            entity: entity.into(),
            status: MigrationStatus::Pending,
            started_at: None,
            completed_at: None,
            records_processed: 0,
            records_succeeded: 0,
            records_failed: 0,
            records_skipped: 0,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn start(&mut self, phase: MigrationStatus) {
        self.status = phase;
        self.started_at = Some(Utc::now());
    }

    pub fn finish(&mut self, status: MigrationStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }
}

/// Complete record of one migration execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRun {
    pub id: String,
    pub name: String,
    pub description: String,
    pub status: MigrationStatus,
    /// Phase to return to on resume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_from: Option<MigrationStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping_name: Option<String>,
    pub dry_run: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub steps: Vec<MigrationStep>,
    pub current_step: Option<String>,
    pub total_records_processed: usize,
    pub total_records_succeeded: usize,
    pub total_records_failed: usize,
    pub total_records_skipped: usize,
    pub errors: Vec<RunError>,
    /// Target entity to ids created in the target, for rollback
    pub rollback_data: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl MigrationRun {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: String::new(),
            status: MigrationStatus::Pending,
            paused_from: None,
            mapping_name: None,
            dry_run: false,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            steps: Vec::new(),
            current_step: None,
            total_records_processed: 0,
            total_records_succeeded: 0,
            total_records_failed: 0,
            total_records_skipped: 0,
            errors: Vec::new(),
            rollback_data: BTreeMap::new(),
            metadata: Map::new(),
        }
    }

    /// Move the run to `next`, enforcing the run state machine.
    ///
    /// Phases advance strictly in order. `failed` and `cancelled` are reachable
    /// from any non-terminal status, a running phase may pause and a paused run
    /// resumes into the phase it left. Rollback starts only from `completed`.
    pub fn transition(&mut self, next: MigrationStatus) -> Result<(), MigrationError> {
        use MigrationStatus::*;

        let current = self.status;
        let allowed = match (current, next) {
            (from, Failed) | (from, Cancelled) => !from.is_terminal(),
            (from, Paused) => from.is_active_phase(),
            (Paused, to) => self.paused_from == Some(to),
            (Completed, RollingBack) => true,
            (RollingBack, RolledBack) => true,
            (from, to) => from.next_phase() == Some(to),
        };

        if !allowed {
            return Err(MigrationError::InvalidTransition {
                from: current,
                to: next,
            });
        }

        match next {
            Paused => self.paused_from = Some(current),
            _ => self.paused_from = None,
        }
        if current == Pending && next == Extracting {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        self.status = next;
        Ok(())
    }

    pub fn add_step(&mut self, name: impl Into<String>, entity: impl Into<String>) -> &mut MigrationStep {
        let step = MigrationStep::new(name, entity);
        self.current_step = Some(step.id.clone());
        self.steps.push(step);
        let last = self.steps.len() - 1;
        &mut self.steps[last]
    }

    pub fn get_step(&self, id: &str) -> Option<&MigrationStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Recompute aggregate counters from the steps
    pub fn update_totals(&mut self) {
        self.total_records_processed = self.steps.iter().map(|s| s.records_processed).sum();
        self.total_records_succeeded = self.steps.iter().map(|s| s.records_succeeded).sum();
        self.total_records_failed = self.steps.iter().map(|s| s.records_failed).sum();
        self.total_records_skipped = self.steps.iter().map(|s| s.records_skipped).sum();
    }

    pub fn record_error(&mut self, phase: MigrationStatus, message: impl Into<String>) {
        self.errors.push(RunError {
            phase,
            message: message.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn add_rollback_ids(&mut self, entity: &str, ids: impl IntoIterator<Item = String>) {
        self.rollback_data
            .entry(entity.to_string())
            .or_default()
            .extend(ids);
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }
}

/// Kinds of data source an extractor can be built for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSourceType {
    Api,
    Csv,
    Json,
    Yaml,
    Screenshot,
    WebScrape,
    Database,
    Webhook,
    Manual,
}

impl DataSourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSourceType::Api => "api",
            DataSourceType::Csv => "csv",
            DataSourceType::Json => "json",
            DataSourceType::Yaml => "yaml",
            DataSourceType::Screenshot => "screenshot",
            DataSourceType::WebScrape => "web_scrape",
            DataSourceType::Database => "database",
            DataSourceType::Webhook => "webhook",
            DataSourceType::Manual => "manual",
        }
    }
}

impl Default for DataSourceType {
    fn default() -> Self {
        DataSourceType::Api
    }
}

impl fmt::Display for DataSourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where and how to extract one entity from one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
    #[serde(rename = "type", default)]
    pub source_type: DataSourceType,
    #[serde(default)]
    pub name: String,
    pub service: String,
    pub entity: String,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Requests per second
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<f64>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub filters: Map<String, Value>,
}

impl DataSource {
    pub fn new(source_type: DataSourceType, service: impl Into<String>, entity: impl Into<String>) -> Self {
        let service = service.into();
        let entity = entity.into();
        Self {
            source_type,
            name: format!("{}_{}", service, entity),
            service,
            entity,
            api_key: None,
            api_endpoint: None,
            file_path: None,
            url: None,
            batch_size: default_batch_size(),
            rate_limit: None,
            filters: Map::new(),
        }
    }

    pub fn with_file_path(mut self, path: impl Into<String>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    /// `{service}_{entity}`, the key used for persisted artifacts
    pub fn key(&self) -> String {
        format!("{}_{}", self.service, self.entity)
    }
}

fn default_batch_size() -> usize {
    100
}

fn default_parallel_workers() -> usize {
    1
}

fn default_max_errors() -> usize {
    100
}

fn default_output_dir() -> String {
    "./data".to_string()
}

fn default_true() -> bool {
    true
}

/// Migration configuration document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub sources: Vec<DataSource>,
    #[serde(default)]
    pub target_service: String,
    #[serde(default, skip_serializing)]
    pub target_api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_site: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping_file: Option<String>,
    #[serde(default)]
    pub custom_mappings: Map<String, Value>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_parallel_workers")]
    pub parallel_workers: usize,
    #[serde(default = "default_true")]
    pub continue_on_error: bool,
    #[serde(default = "default_max_errors")]
    pub max_errors: usize,
    /// Target entity to dedup key field. Non-empty enables deduplication.
    #[serde(default)]
    pub deduplication: BTreeMap<String, String>,
    #[serde(default)]
    pub dedup_preferred_source: String,
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    #[serde(default = "default_true")]
    pub save_extracted: bool,
    #[serde(default = "default_true")]
    pub save_transformed: bool,
    #[serde(default)]
    pub strict_validation: bool,
    #[serde(default = "default_true")]
    pub upsert: bool,
    /// Target requests per second
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<f64>,
    #[serde(default)]
    pub lookup_tables: BTreeMap<String, Vec<Value>>,
}

impl MigrationConfig {
    pub fn new(name: impl Into<String>, target_service: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            sources: Vec::new(),
            target_service: target_service.into(),
            target_api_key: None,
            target_site: None,
            mapping_file: None,
            custom_mappings: Map::new(),
            dry_run: false,
            batch_size: default_batch_size(),
            parallel_workers: default_parallel_workers(),
            continue_on_error: true,
            max_errors: default_max_errors(),
            deduplication: BTreeMap::new(),
            dedup_preferred_source: String::new(),
            output_dir: default_output_dir(),
            save_extracted: true,
            save_transformed: true,
            strict_validation: false,
            upsert: true,
            rate_limit: None,
            lookup_tables: BTreeMap::new(),
        }
    }

    pub fn from_document(document: &str) -> Result<Self, MigrationError> {
        let config: MigrationConfig = serde_yaml::from_str(document)?;
        config.check()?;
        Ok(config)
    }

    /// Load a YAML or JSON config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, MigrationError> {
        let path = path.as_ref();
        let document = std::fs::read_to_string(path)
            .map_err(|e| MigrationError::ConfigIo(path.display().to_string(), e))?;
        Self::from_document(&document)
    }

    /// Reject settings the orchestrator cannot run with
    pub fn check(&self) -> Result<(), MigrationError> {
        if self.batch_size == 0 {
            return Err(MigrationError::Config("batch_size must be at least 1".to_string()));
        }
        if self.parallel_workers == 0 {
            return Err(MigrationError::Config("parallel_workers must be at least 1".to_string()));
        }
        if let Some(rate) = self.rate_limit {
            if !(rate > 0.0) {
                return Err(MigrationError::Config("rate_limit must be positive".to_string()));
            }
        }
        Ok(())
    }

    /// Dedup key for a target entity, defaulting to `email`
    pub fn dedup_key(&self, entity: &str) -> &str {
        self.deduplication
            .get(entity)
            .map(String::as_str)
            .unwrap_or("email")
    }
}
