use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use thiserror::Error;
use tracing::warn;

use crate::transformation_rule::FieldMapping;

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("Failed to read mapping file {0}: {1}")]
    Io(String, std::io::Error),

    #[error("Failed to parse mapping document: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Mapping document is invalid:\n{}", .0.join("\n"))]
    InvalidDocument(Vec<String>),

    #[error("Invalid entity reference '{0}', expected 'service.entity'")]
    InvalidEntityReference(String),

    #[error("Failed to serialize mapping: {0}")]
    Serialize(String),
}

/// Structural contract for mapping documents, checked before decoding
const MAPPING_DOCUMENT_SCHEMA: &str = r#"{
  "type": "object",
  "required": ["name", "mappings"],
  "properties": {
    "name": {"type": "string", "minLength": 1},
    "version": {"type": "string"},
    "description": {"type": "string"},
    "source_services": {"type": "array", "items": {"type": "string"}},
    "target_service": {"type": "string"},
    "migration_order": {"type": "array", "items": {"type": "string"}},
    "transform_functions": {"type": "object"},
    "status_mappings": {
      "type": "object",
      "additionalProperties": {"type": "object"}
    },
    "mappings": {
      "type": "object",
      "additionalProperties": {
        "type": "object",
        "required": ["source", "target"],
        "properties": {
          "source": {"type": "string", "pattern": "^[^.]+\\..+$"},
          "target": {"type": "string", "pattern": "^[^.]+\\..+$"},
          "description": {"type": "string"},
          "notes": {"type": "string"},
          "dependencies": {"type": "array", "items": {"type": "string"}},
          "field_mappings": {
            "type": "array",
            "items": {
              "type": "object",
              "required": ["target_field"],
              "properties": {
                "source_field": {"type": ["string", "null"]},
                "target_field": {"type": "string", "minLength": 1},
                "transform": {"type": "string"},
                "transform_config": {"type": "object"},
                "condition": {"type": ["string", "null"]},
                "required": {"type": "boolean"},
                "notes": {"type": "string"}
              }
            }
          }
        }
      }
    }
  }
}"#;

/// All field mappings between one source entity and one target entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "EntityMappingDocument", into = "EntityMappingDocument")]
pub struct EntityMapping {
    pub name: String,
    pub source_service: String,
    pub source_entity: String,
    pub target_service: String,
    pub target_entity: String,
    pub description: String,
    pub field_mappings: Vec<FieldMapping>,
    /// Names of entity mappings that must be loaded first
    pub dependencies: Vec<String>,
    pub notes: String,
}

/// On-disk shape: `source` / `target` are written as `service.entity`
#[derive(Serialize, Deserialize)]
struct EntityMappingDocument {
    #[serde(default, skip_serializing)]
    name: String,
    source: String,
    target: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    field_mappings: Vec<FieldMapping>,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    notes: String,
}

fn split_entity_ref(reference: &str) -> Result<(String, String), MappingError> {
    match reference.split_once('.') {
        Some((service, entity)) if !service.is_empty() && !entity.is_empty() => {
            Ok((service.to_string(), entity.to_string()))
        }
        _ => Err(MappingError::InvalidEntityReference(reference.to_string())),
    }
}

impl TryFrom<EntityMappingDocument> for EntityMapping {
    type Error = MappingError;

    fn try_from(doc: EntityMappingDocument) -> Result<Self, Self::Error> {
        let (source_service, source_entity) = split_entity_ref(&doc.source)?;
        let (target_service, target_entity) = split_entity_ref(&doc.target)?;
        Ok(Self {
            name: doc.name,
            source_service,
            source_entity,
            target_service,
            target_entity,
            description: doc.description,
            field_mappings: doc.field_mappings,
            dependencies: doc.dependencies,
            notes: doc.notes,
        })
    }
}

impl From<EntityMapping> for EntityMappingDocument {
    fn from(mapping: EntityMapping) -> Self {
        Self {
            source: format!("{}.{}", mapping.source_service, mapping.source_entity),
            target: format!("{}.{}", mapping.target_service, mapping.target_entity),
            name: mapping.name,
            description: mapping.description,
            field_mappings: mapping.field_mappings,
            dependencies: mapping.dependencies,
            notes: mapping.notes,
        }
    }
}

impl EntityMapping {
    pub fn new(
        name: impl Into<String>,
        source: (&str, &str),
        target: (&str, &str),
        field_mappings: Vec<FieldMapping>,
    ) -> Self {
        Self {
            name: name.into(),
            source_service: source.0.to_string(),
            source_entity: source.1.to_string(),
            target_service: target.0.to_string(),
            target_entity: target.1.to_string(),
            description: String::new(),
            field_mappings,
            dependencies: Vec::new(),
            notes: String::new(),
        }
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    /// True when `name` refers to this mapping, either by its own name or by its target entity
    pub fn answers_to(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name) || self.target_entity.eq_ignore_ascii_case(name)
    }

    pub fn matches(
        &self,
        source_service: &str,
        source_entity: &str,
        target_service: &str,
        target_entity: &str,
    ) -> bool {
        self.source_service.eq_ignore_ascii_case(source_service)
            && self.source_entity.eq_ignore_ascii_case(source_entity)
            && self.target_service.eq_ignore_ascii_case(target_service)
            && self.target_entity.eq_ignore_ascii_case(target_entity)
    }
}

/// A complete, named set of entity mappings for one migration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationMapping {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub source_services: Vec<String>,
    #[serde(default)]
    pub target_service: String,
    /// Kept in document order
    #[serde(
        rename = "mappings",
        default,
        deserialize_with = "ordered_entity_mappings",
        serialize_with = "serialize_entity_mappings"
    )]
    pub entity_mappings: Vec<EntityMapping>,
    #[serde(default)]
    pub migration_order: Vec<String>,
    #[serde(default)]
    pub transform_functions: BTreeMap<String, Map<String, Value>>,
    /// Named value tables usable from `enum_map` through `status_mapping: <name>`
    #[serde(default)]
    pub status_mappings: BTreeMap<String, BTreeMap<String, String>>,
}

fn default_version() -> String {
    "1.0".to_string()
}

fn ordered_entity_mappings<'de, D>(deserializer: D) -> Result<Vec<EntityMapping>, D::Error>
where
    D: Deserializer<'de>,
{
    struct OrderedMappings;

    impl<'de> Visitor<'de> for OrderedMappings {
        type Value = Vec<EntityMapping>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a map of entity mapping name to entity mapping")
        }

        fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut mappings = Vec::new();
            while let Some((name, mut mapping)) = access.next_entry::<String, EntityMapping>()? {
                if mapping.name.is_empty() {
                    mapping.name = name;
                }
                mappings.push(mapping);
            }
            Ok(mappings)
        }
    }

    deserializer.deserialize_map(OrderedMappings)
}

fn serialize_entity_mappings<S>(mappings: &[EntityMapping], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let mut map = serializer.serialize_map(Some(mappings.len()))?;
    for mapping in mappings {
        map.serialize_entry(&mapping.name, mapping)?;
    }
    map.end()
}

impl MigrationMapping {
    pub fn new(name: impl Into<String>, target_service: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            description: String::new(),
            source_services: Vec::new(),
            target_service: target_service.into(),
            entity_mappings: Vec::new(),
            migration_order: Vec::new(),
            transform_functions: BTreeMap::new(),
            status_mappings: BTreeMap::new(),
        }
    }

    pub fn with_entity_mapping(mut self, mapping: EntityMapping) -> Self {
        if !self.source_services.contains(&mapping.source_service) {
            self.source_services.push(mapping.source_service.clone());
        }
        self.entity_mappings.push(mapping);
        self
    }

    pub fn with_migration_order<I, S>(mut self, order: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.migration_order = order.into_iter().map(Into::into).collect();
        self
    }

    /// Check a JSON or YAML mapping document against the document contract, then decode it
    pub fn from_document(document: &str) -> Result<Self, MappingError> {
        let instance: Value = serde_yaml::from_str(document)?;
        validate_document(&instance)?;
        Ok(serde_yaml::from_str(document)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, MappingError> {
        let path = path.as_ref();
        let document = std::fs::read_to_string(path)
            .map_err(|e| MappingError::Io(path.display().to_string(), e))?;
        Self::from_document(&document)
    }

    pub fn to_yaml(&self) -> Result<String, MappingError> {
        serde_yaml::to_string(self).map_err(|e| MappingError::Serialize(e.to_string()))
    }

    pub fn entity_mapping(&self, name: &str) -> Option<&EntityMapping> {
        self.entity_mappings.iter().find(|m| m.name == name)
    }

    /// Entity mappings in the order their records should be loaded.
    ///
    /// Entries of `migration_order` (mapping names or target entities) come first;
    /// everything else follows in dependency order.
    pub fn load_order(&self) -> Vec<&EntityMapping> {
        let by_dependency = self.dependency_order();
        let mut ordered: Vec<&EntityMapping> = Vec::with_capacity(by_dependency.len());

        for entry in &self.migration_order {
            for mapping in &by_dependency {
                if mapping.answers_to(entry) && !ordered.iter().any(|m| std::ptr::eq(*m, *mapping)) {
                    ordered.push(*mapping);
                }
            }
        }
        for mapping in by_dependency {
            if !ordered.iter().any(|m| std::ptr::eq(*m, mapping)) {
                ordered.push(mapping);
            }
        }

        ordered
    }

    /// Distinct target entities in load order
    pub fn target_entity_order(&self) -> Vec<String> {
        let mut entities: Vec<String> = Vec::new();
        for mapping in self.load_order() {
            if !entities.contains(&mapping.target_entity) {
                entities.push(mapping.target_entity.clone());
            }
        }
        entities
    }

    fn dependency_order(&self) -> Vec<&EntityMapping> {
        let known = |dep: &str| self.entity_mappings.iter().any(|m| m.answers_to(dep));

        let mut placed: Vec<&EntityMapping> = Vec::with_capacity(self.entity_mappings.len());
        let mut remaining: Vec<&EntityMapping> = self.entity_mappings.iter().collect();

        while !remaining.is_empty() {
            let ready = remaining.iter().position(|candidate| {
                candidate.dependencies.iter().all(|dep| {
                    !known(dep) || placed.iter().any(|p| p.answers_to(dep))
                })
            });

            match ready {
                Some(index) => placed.push(remaining.remove(index)),
                None => {
                    let names: Vec<&str> = remaining.iter().map(|m| m.name.as_str()).collect();
                    warn!(mappings = ?names, "Dependency cycle between entity mappings, using document order");
                    placed.append(&mut remaining);
                }
            }
        }

        placed
    }
}

fn validate_document(instance: &Value) -> Result<(), MappingError> {
    let schema: Value = serde_json::from_str(MAPPING_DOCUMENT_SCHEMA)
        .map_err(|e| MappingError::InvalidDocument(vec![format!("Embedded schema: {}", e)]))?;
    let compiled = jsonschema::JSONSchema::compile(&schema)
        .map_err(|e| MappingError::InvalidDocument(vec![format!("Embedded schema: {}", e)]))?;

    if let Err(errors) = compiled.validate(instance) {
        let messages: Vec<String> = errors
            .map(|error| format!("{}: {}", error.instance_path, error))
            .collect();
        return Err(MappingError::InvalidDocument(messages));
    }

    Ok(())
}
