// Schema-driven SaaS data migration engine
pub mod schema;
pub mod record;
pub mod field_path;
pub mod transformation_rule;
pub mod mapping;
pub mod transforms;
pub mod transformation_engine;
pub mod validation;
pub mod schema_registry;
pub mod migration;
pub mod extractor;
pub mod loader;
pub mod connectors;
pub mod dedup;
pub mod progress;
pub mod orchestrator;
pub mod reporter;

// Re-export core types for convenience
pub use schema::{EntitySchema, FieldDefinition, FieldType, ServiceSchema};
pub use record::{RecordStatus, SourceRecord, TransformedRecord};
pub use transformation_rule::{FieldMapping, TransformType};
pub use mapping::{EntityMapping, MigrationMapping};
pub use transforms::TransformContext;
pub use transformation_engine::{TransformEngine, TransformationError};
pub use validation::{RecordValidator, Severity, ValidationError, ValidationReport, ValidationWarning};
pub use schema_registry::SchemaRegistry;
pub use migration::{
    DataSource, DataSourceType, MigrationConfig, MigrationError, MigrationRun, MigrationStatus,
    MigrationStep,
};
pub use extractor::{ExtractionResult, Extractor, ExtractorError, FileExtractor, InMemoryExtractor};
pub use loader::{LoadResult, Loader, LoaderError, MemoryLoader, MigrationResult, ThrottledLoader};
pub use connectors::Connectors;
pub use progress::{ProgressEvent, ProgressReporter, RunControl};
pub use orchestrator::MigrationOrchestrator;
pub use reporter::{MigrationReport, MigrationReporter, ReportFormat};
