use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
    field_path::root_segment,
    mapping::{EntityMapping, MappingError, MigrationMapping},
    schema::{EntitySchema, FieldDefinition, FieldType, SchemaError, ServiceSchema},
    transformation_rule::{Condition, FieldMapping},
    validation::{ErrorType, ValidationError, ValidationReport, ValidationWarning},
};

/// Registry of service schemas and migration mappings.
///
/// Built once before a run and shared read-only with the orchestrator.
/// Names are matched case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, ServiceSchema>,
    mappings: HashMap<String, MigrationMapping>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Schema not found: {0}")]
    SchemaNotFound(String),

    #[error("Mapping not found: {0}")]
    MappingNotFound(String),

    #[error("Failed to access {0}: {1}")]
    Io(String, std::io::Error),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error("Failed to fetch schema from {0}: {1}")]
    Fetch(String, String),

    #[error("Failed to serialize {0}: {1}")]
    Serialize(String, String),
}

const DOCUMENT_EXTENSIONS: &[&str] = &["json", "yaml", "yml"];

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_schema(&mut self, schema: ServiceSchema) {
        self.schemas.insert(schema.name.to_lowercase(), schema);
    }

    pub fn register_mapping(&mut self, mapping: MigrationMapping) {
        self.mappings.insert(mapping.name.to_lowercase(), mapping);
    }

    pub fn get_schema(&self, service: &str) -> Option<&ServiceSchema> {
        self.schemas.get(&service.to_lowercase())
    }

    pub fn get_entity_schema(&self, service: &str, entity: &str) -> Option<&EntitySchema> {
        self.get_schema(service)?.entities.get(entity)
    }

    pub fn get_mapping(&self, name: &str) -> Option<&MigrationMapping> {
        self.mappings.get(&name.to_lowercase())
    }

    /// Find the entity mapping between two entities by scanning every registered mapping
    pub fn get_entity_mapping(
        &self,
        source_service: &str,
        source_entity: &str,
        target_service: &str,
        target_entity: &str,
    ) -> Option<&EntityMapping> {
        let mut names: Vec<&String> = self.mappings.keys().collect();
        names.sort();
        names
            .into_iter()
            .filter_map(|name| self.mappings.get(name))
            .flat_map(|m| m.entity_mappings.iter())
            .find(|em| em.matches(source_service, source_entity, target_service, target_entity))
    }

    pub fn list_schemas(&self) -> Vec<String> {
        let mut names: Vec<String> = self.schemas.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn list_mappings(&self) -> Vec<String> {
        let mut names: Vec<String> = self.mappings.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn list_entities(&self, service: &str) -> Vec<String> {
        self.get_schema(service)
            .map(|s| s.entities.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Load every JSON/YAML schema document below `dir`. Unreadable files are logged and skipped.
    pub fn load_schemas_from_directory(&mut self, dir: impl AsRef<Path>) -> Result<usize, RegistryError> {
        let mut loaded = 0;
        for path in document_files(dir.as_ref())? {
            match ServiceSchema::from_file(&path) {
                Ok(schema) => {
                    info!(schema = %schema.name, path = %path.display(), "Loaded schema");
                    self.register_schema(schema);
                    loaded += 1;
                }
                Err(e) => error!(path = %path.display(), error = %e, "Failed to load schema"),
            }
        }
        Ok(loaded)
    }

    /// Load every JSON/YAML mapping document below `dir`. Unreadable files are logged and skipped.
    pub fn load_mappings_from_directory(&mut self, dir: impl AsRef<Path>) -> Result<usize, RegistryError> {
        let mut loaded = 0;
        for path in document_files(dir.as_ref())? {
            match MigrationMapping::from_file(&path) {
                Ok(mapping) => {
                    info!(mapping = %mapping.name, path = %path.display(), "Loaded mapping");
                    self.register_mapping(mapping);
                    loaded += 1;
                }
                Err(e) => error!(path = %path.display(), error = %e, "Failed to load mapping"),
            }
        }
        Ok(loaded)
    }

    /// Download a schema document and register it. Returns the service name.
    pub async fn fetch_schema(&mut self, url: &str) -> Result<String, RegistryError> {
        let body = reqwest::get(url)
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| RegistryError::Fetch(url.to_string(), e.to_string()))?
            .text()
            .await
            .map_err(|e| RegistryError::Fetch(url.to_string(), e.to_string()))?;

        let schema = ServiceSchema::from_document(&body)?;
        let name = schema.name.clone();
        info!(schema = %name, url, "Fetched schema");
        self.register_schema(schema);
        Ok(name)
    }

    /// Write a registered schema as pretty JSON
    pub fn export_schema(&self, service: &str, path: impl AsRef<Path>) -> Result<(), RegistryError> {
        let schema = self
            .get_schema(service)
            .ok_or_else(|| RegistryError::SchemaNotFound(service.to_string()))?;
        let json = serde_json::to_string_pretty(schema)
            .map_err(|e| RegistryError::Serialize(service.to_string(), e.to_string()))?;
        write_file(path.as_ref(), &json)
    }

    /// Write a registered mapping; `.yaml`/`.yml` paths get YAML, anything else JSON
    pub fn export_mapping(&self, name: &str, path: impl AsRef<Path>) -> Result<(), RegistryError> {
        let path = path.as_ref();
        let mapping = self
            .get_mapping(name)
            .ok_or_else(|| RegistryError::MappingNotFound(name.to_string()))?;

        let rendered = if is_yaml(path) {
            mapping.to_yaml()?
        } else {
            serde_json::to_string_pretty(mapping)
                .map_err(|e| RegistryError::Serialize(name.to_string(), e.to_string()))?
        };
        write_file(path, &rendered)
    }

    /// Infer an entity schema from sample records.
    ///
    /// Nested objects produce dotted field paths; arrays of objects are
    /// described from their first element under `field[]`. A field is required
    /// only when every sample carries a non-null value for it.
    pub fn infer_schema_from_data(&self, samples: &[Value], entity: &str) -> EntitySchema {
        let mut stats: BTreeMap<String, FieldStats> = BTreeMap::new();
        for sample in samples {
            analyze(sample, "", &mut stats);
        }

        let mut schema = EntitySchema::new(entity);
        schema.description = format!("Auto-inferred schema for {}", entity);

        for (path, stat) in stats {
            let name = path.rsplit('.').next().unwrap_or(&path).to_string();
            let mut def = FieldDefinition::new(name, widen(&stat.types));
            def.required = !path.contains("[]") && stat.present == samples.len();
            def.example = stat.example;
            schema.fields.insert(path, def);
        }

        schema
    }

    /// Pre-flight check of an entity mapping against the registered schemas
    pub fn validate_mapping(&self, mapping: &EntityMapping) -> ValidationReport {
        let mut report = ValidationReport::new();

        let source = self.get_entity_schema(&mapping.source_service, &mapping.source_entity);
        let target = self.get_entity_schema(&mapping.target_service, &mapping.target_entity);

        if source.is_none() {
            let name = format!("{}.{}", mapping.source_service, mapping.source_entity);
            report.add_error(ValidationError::new(
                name.as_str(),
                format!("Source schema not found: {}", name),
                ErrorType::Validation,
            ));
        }
        if target.is_none() {
            let name = format!("{}.{}", mapping.target_service, mapping.target_entity);
            report.add_error(ValidationError::new(
                name.as_str(),
                format!("Target schema not found: {}", name),
                ErrorType::Validation,
            ));
        }

        for fm in &mapping.field_mappings {
            if let Some(expr) = &fm.condition {
                if Condition::parse(expr).is_none() {
                    report.add_warning(
                        ValidationWarning::new(fm.target_field.as_str(), format!("Condition cannot be parsed: {}", expr))
                            .with_recommendation("Use '<path> exists', '<path> == <value>' or '<path> != <value>'"),
                    );
                }
            }
        }

        let (Some(source), Some(target)) = (source, target) else {
            return report;
        };

        for fm in &mapping.field_mappings {
            if let Some(source_field) = &fm.source_field {
                let known = source.fields.contains_key(source_field)
                    || source.fields.contains_key(root_segment(source_field));
                if !known {
                    report.add_error(ValidationError::new(
                        source_field.as_str(),
                        format!("Source field not found: {}", source_field),
                        ErrorType::UnknownField,
                    ));
                }
            }

            let root = root_segment(&fm.target_field);
            if !target.fields.contains_key(root) && !fm.target_field.starts_with("meta_data") {
                report.add_error(ValidationError::new(
                    fm.target_field.as_str(),
                    format!("Target field not found: {}", fm.target_field),
                    ErrorType::UnknownField,
                ));
            }
        }

        let mapped: HashSet<&str> = mapping
            .field_mappings
            .iter()
            .map(|fm| fm.target_field.as_str())
            .collect();
        for name in target.required_fields() {
            if !mapped.contains(name) {
                report.add_error(
                    ValidationError::new(
                        name,
                        format!("Required target field has no mapping: {}", name),
                        ErrorType::Required,
                    )
                    .with_suggested_fix(format!("Add a field mapping targeting '{}'", name)),
                );
            }
        }

        report
    }

    /// Draft an entity mapping by pairing fields whose normalised names agree.
    /// Meant as a starting point for a hand-edited mapping document.
    pub fn draft_entity_mapping(
        &self,
        source: (&str, &str),
        target: (&str, &str),
    ) -> Result<EntityMapping, RegistryError> {
        let source_schema = self
            .get_entity_schema(source.0, source.1)
            .ok_or_else(|| RegistryError::SchemaNotFound(format!("{}.{}", source.0, source.1)))?;
        let target_schema = self
            .get_entity_schema(target.0, target.1)
            .ok_or_else(|| RegistryError::SchemaNotFound(format!("{}.{}", target.0, target.1)))?;

        let by_normalized: HashMap<String, &str> = source_schema
            .fields
            .keys()
            .map(|f| (normalize_field_name(f), f.as_str()))
            .collect();

        let field_mappings = target_schema
            .fields
            .keys()
            .filter_map(|target_field| {
                by_normalized
                    .get(&normalize_field_name(target_field))
                    .map(|source_field| {
                        let mut fm = FieldMapping::direct(source_field, target_field.as_str());
                        fm.notes = "Auto-matched by name".to_string();
                        fm
                    })
            })
            .collect();

        Ok(EntityMapping::new(
            format!("{}_{}_to_{}_{}", source.0, source.1, target.0, target.1),
            source,
            target,
            field_mappings,
        ))
    }
}

#[derive(Default)]
struct FieldStats {
    types: BTreeSet<&'static str>,
    present: usize,
    example: Option<Value>,
}

fn analyze(value: &Value, prefix: &str, stats: &mut BTreeMap<String, FieldStats>) {
    let Value::Object(map) = value else { return };

    for (key, value) in map {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        let stat = stats.entry(path.clone()).or_default();
        if value.is_null() {
            continue;
        }

        stat.present += 1;
        stat.types.insert(type_name(value));
        if stat.example.is_none() {
            stat.example = Some(value.clone());
        }

        match value {
            Value::Object(_) => analyze(value, &path, stats),
            Value::Array(items) => {
                if let Some(first @ Value::Object(_)) = items.first() {
                    analyze(first, &format!("{}[]", path), stats);
                }
            }
            _ => {}
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "decimal",
        Value::Number(_) => "integer",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
        _ => "string",
    }
}

/// Common supertype of every type observed for a field
fn widen(types: &BTreeSet<&'static str>) -> FieldType {
    let only = |allowed: &[&str]| !types.is_empty() && types.iter().all(|t| allowed.contains(t));

    if types.contains("object") {
        FieldType::Object
    } else if types.contains("array") {
        FieldType::Array
    } else if only(&["integer"]) {
        FieldType::Integer
    } else if only(&["integer", "decimal"]) {
        FieldType::Decimal
    } else if only(&["boolean"]) {
        FieldType::Boolean
    } else {
        FieldType::String
    }
}

fn normalize_field_name(name: &str) -> String {
    let normalized: String = name
        .chars()
        .filter(|c| *c != '_' && *c != '-')
        .collect::<String>()
        .to_lowercase();

    match normalized.as_str() {
        "emailaddress" => "email".to_string(),
        "phonenumber" => "phone".to_string(),
        "created" | "createddate" => "createdat".to_string(),
        "updated" | "modifieddate" | "lastmodifieddate" => "updatedat".to_string(),
        _ => normalized,
    }
}

fn document_files(dir: &Path) -> Result<Vec<PathBuf>, RegistryError> {
    if !dir.exists() {
        warn!(dir = %dir.display(), "Directory does not exist");
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let entries = std::fs::read_dir(&current)
            .map_err(|e| RegistryError::Io(current.display().to_string(), e))?;
        for entry in entries {
            let path = entry
                .map_err(|e| RegistryError::Io(current.display().to_string(), e))?
                .path();
            if path.is_dir() {
                pending.push(path);
            } else if path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| DOCUMENT_EXTENSIONS.contains(&e.to_lowercase().as_str()))
                .unwrap_or(false)
            {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

fn write_file(path: &Path, contents: &str) -> Result<(), RegistryError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| RegistryError::Io(parent.display().to_string(), e))?;
    }
    std::fs::write(path, contents).map_err(|e| RegistryError::Io(path.display().to_string(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> SchemaRegistry {
        let mut registry = SchemaRegistry::new();
        registry.register_schema(ServiceSchema::new("Stripe").with_entity(
            EntitySchema::new("customer")
                .with_field(FieldDefinition::new("id", FieldType::String).required())
                .with_field(FieldDefinition::new("name", FieldType::String))
                .with_field(FieldDefinition::new("email", FieldType::String))
                .with_field(FieldDefinition::new("address", FieldType::Object)),
        ));
        registry.register_schema(ServiceSchema::new("chargebee").with_entity(
            EntitySchema::new("customer")
                .with_field(FieldDefinition::new("id", FieldType::String).required())
                .with_field(FieldDefinition::new("first_name", FieldType::String).required())
                .with_field(FieldDefinition::new("email", FieldType::String).required())
                .with_field(FieldDefinition::new("billing_address", FieldType::Object)),
        ));
        registry
    }

    fn customer_mapping(field_mappings: Vec<FieldMapping>) -> EntityMapping {
        EntityMapping::new("customers", ("stripe", "customer"), ("chargebee", "customer"), field_mappings)
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let registry = registry();
        assert!(registry.get_schema("STRIPE").is_some());
        assert!(registry.get_entity_schema("stripe", "customer").is_some());
        assert!(registry.get_entity_schema("stripe", "invoice").is_none());
        assert_eq!(registry.list_schemas(), vec!["chargebee", "stripe"]);
        assert_eq!(registry.list_entities("chargebee"), vec!["customer"]);
    }

    #[test]
    fn test_get_entity_mapping_scans_all_mappings() {
        let mut registry = registry();
        registry.register_mapping(
            MigrationMapping::new("stripe_to_chargebee", "chargebee")
                .with_entity_mapping(customer_mapping(vec![])),
        );

        let found = registry.get_entity_mapping("Stripe", "customer", "chargebee", "CUSTOMER");
        assert_eq!(found.map(|m| m.name.as_str()), Some("customers"));
        assert!(registry.get_entity_mapping("stripe", "invoice", "chargebee", "invoice").is_none());
    }

    #[test]
    fn test_validate_mapping_passes_for_complete_mapping() {
        let report = registry().validate_mapping(&customer_mapping(vec![
            FieldMapping::direct("id", "id"),
            FieldMapping::direct("name", "first_name"),
            FieldMapping::direct("email", "email"),
            FieldMapping::direct("address.city", "billing_address.city"),
            FieldMapping::direct("id", "meta_data.stripe_id"),
        ]));

        assert!(report.is_valid, "{}", report.error_summary());
        assert!(!report.has_warnings());
    }

    #[test]
    fn test_missing_required_mapping_yields_exactly_one_error() {
        let report = registry().validate_mapping(&customer_mapping(vec![
            FieldMapping::direct("id", "id"),
            FieldMapping::direct("email", "email"),
        ]));

        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].field, "first_name");
        assert_eq!(report.errors[0].error_type, ErrorType::Required);
        assert!(report.errors[0].message.contains("first_name"));
    }

    #[test]
    fn test_unknown_fields_and_missing_schemas() {
        let registry = registry();
        let report = registry.validate_mapping(&customer_mapping(vec![
            FieldMapping::direct("id", "id"),
            FieldMapping::direct("name", "first_name"),
            FieldMapping::direct("email", "email"),
            FieldMapping::direct("fax", "fax_number").with_condition("fax is set"),
        ]));
        let fields: Vec<&str> = report.errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["fax", "fax_number"]);
        assert_eq!(report.warnings.len(), 1);

        let orphan = EntityMapping::new("x", ("hubspot", "contact"), ("chargebee", "customer"), vec![]);
        let report = registry.validate_mapping(&orphan);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].message, "Source schema not found: hubspot.contact");
    }

    #[test]
    fn test_infer_schema_from_data() {
        let samples = vec![
            json!({"id": "c1", "seats": 3, "price": 10, "active": true, "address": {"city": "Berlin"}, "items": [{"sku": "a"}]}),
            json!({"id": "c2", "seats": 5, "price": 9.5, "active": "yes", "nickname": null}),
        ];

        let schema = SchemaRegistry::new().infer_schema_from_data(&samples, "customer");
        let field = |name: &str| schema.fields.get(name).unwrap();

        assert_eq!(field("id").field_type, FieldType::String);
        assert!(field("id").required);
        assert_eq!(field("seats").field_type, FieldType::Integer);
        assert_eq!(field("price").field_type, FieldType::Decimal);
        assert_eq!(field("active").field_type, FieldType::String);
        assert_eq!(field("address").field_type, FieldType::Object);
        assert!(!field("address").required);
        assert_eq!(field("address.city").name, "city");
        assert_eq!(field("items").field_type, FieldType::Array);
        assert!(!field("items[].sku").required);
        assert!(!field("nickname").required);
        assert_eq!(field("id").example, Some(json!("c1")));
    }

    #[test]
    fn test_load_and_export_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("services");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(
            nested.join("stripe.yaml"),
            "name: stripe\nentities:\n  customer:\n    fields:\n      email: {type: string, required: true}\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.json"), "{not json").unwrap();
        std::fs::write(dir.path().join("README.md"), "ignored").unwrap();

        let mut registry = SchemaRegistry::new();
        assert_eq!(registry.load_schemas_from_directory(dir.path()).unwrap(), 1);
        assert!(registry.get_entity_schema("stripe", "customer").unwrap().fields["email"].required);

        let out = dir.path().join("export/stripe.json");
        registry.export_schema("stripe", &out).unwrap();
        let reloaded = ServiceSchema::from_file(&out).unwrap();
        assert_eq!(&reloaded, registry.get_schema("stripe").unwrap());

        assert_eq!(
            SchemaRegistry::new()
                .load_schemas_from_directory(dir.path().join("missing"))
                .unwrap(),
            0
        );
    }

    #[test]
    fn test_draft_entity_mapping_matches_normalized_names() {
        let mut registry = registry();
        registry.register_schema(ServiceSchema::new("salesforce").with_entity(
            EntitySchema::new("contact")
                .with_field(FieldDefinition::new("Email", FieldType::String))
                .with_field(FieldDefinition::new("First_Name", FieldType::String))
                .with_field(FieldDefinition::new("CreatedDate", FieldType::DateTime)),
        ));

        let draft = registry
            .draft_entity_mapping(("salesforce", "contact"), ("chargebee", "customer"))
            .unwrap();
        let pairs: Vec<(&str, &str)> = draft
            .field_mappings
            .iter()
            .map(|fm| (fm.source_field.as_deref().unwrap(), fm.target_field.as_str()))
            .collect();
        assert_eq!(pairs, vec![("Email", "email"), ("First_Name", "first_name")]);
    }
}
