use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::{
    field_path::{self, value_to_string, PathError},
    mapping::EntityMapping,
    record::{RecordStatus, SourceRecord, SourceRef, TransformedRecord},
    transformation_rule::{FieldMapping, TransformType},
    transforms::{self, SourcePayloads, TransformContext, TransformResult},
    validation::{ErrorType, ValidationError},
};

/// Errors that can occur during transformation
#[derive(Debug, Error)]
pub enum TransformationError {
    #[error("No source records supplied for mapping '{0}'")]
    NoSourceRecords(String),

    #[error("Transform '{transform}' rejected its input: {message}")]
    InvalidInput { transform: String, message: String },

    #[error("Custom transform '{name}' failed: {message}")]
    Custom { name: String, message: String },

    #[error("Cannot write target field: {0}")]
    Path(#[from] PathError),
}

/// User-registered operator, same contract as the built-in ones
pub type CustomTransform = Arc<
    dyn Fn(Option<&Value>, &Map<String, Value>, &SourcePayloads<'_>, &TransformContext) -> TransformResult
        + Send
        + Sync,
>;

/// Applies entity mappings to source records.
///
/// The engine holds no per-run state and can be shared between workers.
#[derive(Clone, Default)]
pub struct TransformEngine {
    custom: HashMap<String, CustomTransform>,
}

impl TransformEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named operator. A name that collides with a built-in replaces it.
    pub fn register_transform<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(Option<&Value>, &Map<String, Value>, &SourcePayloads<'_>, &TransformContext) -> TransformResult
            + Send
            + Sync
            + 'static,
    {
        self.custom.insert(name.into(), Arc::new(f));
    }

    pub fn has_transform(&self, name: &str) -> bool {
        self.custom.contains_key(name) || TransformType::from(name).is_builtin()
    }

    /// Build one target record from one or more source records.
    ///
    /// Field-level failures are recorded on the returned record as `transform`
    /// errors; only a call without any source record is rejected outright.
    pub fn transform(
        &self,
        sources: &[SourceRecord],
        mapping: &EntityMapping,
        target_service: &str,
        target_entity: &str,
        ctx: &TransformContext,
    ) -> Result<TransformedRecord, TransformationError> {
        let first = sources
            .first()
            .ok_or_else(|| TransformationError::NoSourceRecords(mapping.name.clone()))?;
        let payloads = SourcePayloads::from_records(sources);

        let id = self.target_id(first, mapping, &payloads, ctx);
        let mut record = TransformedRecord::new(id, target_service, target_entity);
        record.source_records = sources.iter().map(SourceRef::from).collect();

        for field_mapping in &mapping.field_mappings {
            if !field_mapping.condition_satisfied(payloads.values()) {
                debug!(
                    target_field = %field_mapping.target_field,
                    "Condition not met, skipping field mapping"
                );
                continue;
            }

            let source_value = field_mapping
                .source_field
                .as_deref()
                .and_then(|path| payloads.resolve(path));

            let outcome = self
                .apply(field_mapping, source_value, &payloads, ctx, &mut record.warnings)
                .and_then(|value| {
                    let value = value.or_else(|| {
                        field_mapping.default_value.clone().filter(|d| !d.is_null())
                    });
                    match value {
                        Some(value) => field_path::set_path(&mut record.data, &field_mapping.target_field, value)
                            .map_err(TransformationError::from),
                        None => Ok(()),
                    }
                });

            if let Err(e) = outcome {
                error!(
                    record_id = %record.id,
                    target_field = %field_mapping.target_field,
                    error = %e,
                    "Transform error"
                );
                let mut err = ValidationError::new(
                    field_mapping.target_field.as_str(),
                    format!("Transform error: {}", e),
                    ErrorType::Transform,
                );
                if let Some(source) = &field_mapping.source_field {
                    err = err.with_value(Value::String(source.clone()));
                }
                record.validation_errors.push(err);
            }
        }

        record.status = if record.is_valid() {
            RecordStatus::Transformed
        } else {
            RecordStatus::Failed
        };
        Ok(record)
    }

    /// Run a single field mapping's operator. Unknown operators copy the value and leave a warning.
    fn apply(
        &self,
        field_mapping: &FieldMapping,
        value: Option<&Value>,
        payloads: &SourcePayloads<'_>,
        ctx: &TransformContext,
        warnings: &mut Vec<String>,
    ) -> TransformResult {
        let name = field_mapping.transform.name();
        let config = &field_mapping.transform_config;

        if let Some(custom) = self.custom.get(name) {
            return custom(value, config, payloads, ctx);
        }
        if let Some(builtin) = transforms::builtin(&field_mapping.transform) {
            return builtin(value, config, payloads, ctx);
        }
        if name == "custom" {
            let function = config.get("function").and_then(Value::as_str).unwrap_or("");
            if let Some(custom) = self.custom.get(function) {
                return custom(value, config, payloads, ctx);
            }
        }

        warn!(
            transform = name,
            target_field = %field_mapping.target_field,
            "Unknown transform, using direct copy"
        );
        warnings.push(format!("Unknown transform: {}, using direct copy", name));
        Ok(value.cloned())
    }

    /// Target id comes from the mapping that writes `id`, else `{service}_{source id}`
    fn target_id(
        &self,
        first: &SourceRecord,
        mapping: &EntityMapping,
        payloads: &SourcePayloads<'_>,
        ctx: &TransformContext,
    ) -> String {
        let id_mapping = mapping.field_mappings.iter().find(|fm| fm.target_field == "id");

        if let Some(field_mapping) = id_mapping {
            let raw = field_mapping
                .source_field
                .as_deref()
                .and_then(|path| payloads.resolve(path));
            if let Some(raw) = raw {
                let mut ignored = Vec::new();
                return match self.apply(field_mapping, Some(raw), payloads, ctx, &mut ignored) {
                    Ok(Some(value)) => value_to_string(&value),
                    _ => value_to_string(raw),
                };
            }
        }

        format!("{}_{}", first.source_service, first.id)
    }
}
