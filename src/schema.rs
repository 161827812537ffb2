use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Declared type of a field in a service schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FieldType {
    String,
    Integer,
    Decimal,
    Boolean,
    Timestamp,
    Date,
    DateTime,
    Enum,
    Object,
    Array,
    Json,
    Currency,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Decimal => "decimal",
            FieldType::Boolean => "boolean",
            FieldType::Timestamp => "timestamp",
            FieldType::Date => "date",
            FieldType::DateTime => "datetime",
            FieldType::Enum => "enum",
            FieldType::Object => "object",
            FieldType::Array => "array",
            FieldType::Json => "json",
            FieldType::Currency => "currency",
        }
    }
}

// Unrecognised type names degrade to string rather than failing the document.
impl From<String> for FieldType {
    fn from(name: String) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "integer" => FieldType::Integer,
            "decimal" => FieldType::Decimal,
            "boolean" => FieldType::Boolean,
            "timestamp" => FieldType::Timestamp,
            "date" => FieldType::Date,
            "datetime" => FieldType::DateTime,
            "enum" => FieldType::Enum,
            "object" => FieldType::Object,
            "array" => FieldType::Array,
            "json" => FieldType::Json,
            "currency" => FieldType::Currency,
            _ => FieldType::String,
        }
    }
}

impl From<FieldType> for String {
    fn from(field_type: FieldType) -> Self {
        field_type.as_str().to_string()
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contract for a single field of an entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default = "default_field_type")]
    pub field_type: FieldType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example: Option<Value>,
    /// Nested fields, only meaningful for `object`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<BTreeMap<String, FieldDefinition>>,
    /// Element contract, only meaningful for `array`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<FieldDefinition>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub notes: String,
}

fn default_field_type() -> FieldType {
    FieldType::String
}

impl FieldDefinition {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            description: String::new(),
            required: false,
            max_length: None,
            enum_values: None,
            default: None,
            example: None,
            properties: None,
            items: None,
            notes: String::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = Some(max_length);
        self
    }

    pub fn with_enum_values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enum_values = Some(values.into_iter().map(Into::into).collect());
        self
    }

    /// Attach nested properties. Ignored unless the field is an object.
    pub fn with_properties(mut self, properties: Vec<FieldDefinition>) -> Self {
        if self.field_type == FieldType::Object {
            self.properties = Some(
                properties
                    .into_iter()
                    .map(|def| (def.name.clone(), def))
                    .collect(),
            );
        }
        self
    }

    /// Attach the element contract. Ignored unless the field is an array.
    pub fn with_items(mut self, items: FieldDefinition) -> Self {
        if self.field_type == FieldType::Array {
            self.items = Some(Box::new(items));
        }
        self
    }

    pub fn with_example(mut self, example: Value) -> Self {
        self.example = Some(example);
        self
    }

    fn assign_names(&mut self, name: &str) {
        if self.name.is_empty() {
            self.name = name.to_string();
        }
        if self.field_type != FieldType::Object {
            self.properties = None;
        }
        if self.field_type != FieldType::Array {
            self.items = None;
        }
        if let Some(properties) = self.properties.as_mut() {
            for (prop_name, prop) in properties.iter_mut() {
                prop.assign_names(prop_name);
            }
        }
        if let Some(items) = self.items.as_mut() {
            items.assign_names(name);
        }
    }
}

/// Schema for one entity (customer, subscription, ...) of a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySchema {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_endpoint: String,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldDefinition>,
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
}

fn default_primary_key() -> String {
    "id".to_string()
}

impl EntitySchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            api_endpoint: String::new(),
            fields: BTreeMap::new(),
            primary_key: default_primary_key(),
        }
    }

    pub fn with_field(mut self, field: FieldDefinition) -> Self {
        self.add_field(field);
        self
    }

    pub fn add_field(&mut self, field: FieldDefinition) {
        self.fields.insert(field.name.clone(), field);
    }

    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.get(name)
    }

    pub fn required_fields(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|(_, def)| def.required)
            .map(|(name, _)| name.as_str())
    }
}

/// All entity schemas of one external service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSchema {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub entities: BTreeMap<String, EntitySchema>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub base_url: String,
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Failed to read schema file {0}: {1}")]
    Io(String, std::io::Error),

    #[error("Failed to parse schema document: {0}")]
    Parse(#[from] serde_yaml::Error),
}

impl ServiceSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: String::new(),
            description: String::new(),
            entities: BTreeMap::new(),
            api_version: String::new(),
            base_url: String::new(),
        }
    }

    pub fn with_entity(mut self, entity: EntitySchema) -> Self {
        self.entities.insert(entity.name.clone(), entity);
        self
    }

    /// Parse a schema document. YAML is a superset of JSON so both formats are accepted.
    pub fn from_document(document: &str) -> Result<Self, SchemaError> {
        let mut schema: ServiceSchema = serde_yaml::from_str(document)?;
        schema.assign_names();
        Ok(schema)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let path = path.as_ref();
        let document = std::fs::read_to_string(path)
            .map_err(|e| SchemaError::Io(path.display().to_string(), e))?;
        Self::from_document(&document)
    }

    /// Entity and field names default to their map keys in documents
    fn assign_names(&mut self) {
        for (entity_name, entity) in self.entities.iter_mut() {
            if entity.name.is_empty() {
                entity.name = entity_name.clone();
            }
            for (field_name, field) in entity.fields.iter_mut() {
                field.assign_names(field_name);
            }
        }
    }
}
