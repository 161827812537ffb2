use chrono::{DateTime, NaiveDate, NaiveDateTime};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::field_path::value_to_string;
use crate::record::TransformedRecord;
use crate::schema::{EntitySchema, FieldDefinition, FieldType};

/// Report produced by pre-flight checks such as mapping validation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.is_valid = false;
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// One line per error, used when a report has to travel as a plain message
    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(|e| format!("{}: {}", e.field, e.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

impl Default for ValidationReport {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Validation,
    Required,
    Type,
    MaxLength,
    Enum,
    UnknownField,
    Transform,
}

/// A problem found with one field of a record or mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
    pub error_type: ErrorType,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_fix: Option<String>,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>, error_type: ErrorType) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            error_type,
            severity: Severity::Error,
            value: None,
            suggested_fix: None,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_suggested_fix(mut self, fix: impl Into<String>) -> Self {
        self.suggested_fix = Some(fix.into());
        self
    }
}

/// Non-blocking finding in a pre-flight report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
}

impl ValidationWarning {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            recommendation: None,
        }
    }

    pub fn with_recommendation(mut self, recommendation: impl Into<String>) -> Self {
        self.recommendation = Some(recommendation.into());
        self
    }
}

/// Extra per-field check. Returns a message when the value is rejected.
pub type FieldRule = Arc<dyn Fn(&Value) -> Option<String> + Send + Sync>;

/// Checks transformed records against the contract of their target entity
#[derive(Clone, Default)]
pub struct RecordValidator {
    rules: HashMap<String, Vec<FieldRule>>,
}

impl RecordValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an additional rule to a field path (`billing_address.country`, ...)
    pub fn register_rule<F>(&mut self, field: impl Into<String>, rule: F)
    where
        F: Fn(&Value) -> Option<String> + Send + Sync + 'static,
    {
        self.rules.entry(field.into()).or_default().push(Arc::new(rule));
    }

    /// Validate one record. Unknown root fields are reported as warnings, or as
    /// errors when `strict` is set; anything under `meta_data` is exempt.
    pub fn validate(
        &self,
        record: &TransformedRecord,
        schema: &EntitySchema,
        strict: bool,
    ) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        for (name, def) in &schema.fields {
            self.validate_field(name, record.get_field(name), def, &mut errors);
        }

        let mut unknown: Vec<&String> = record
            .data
            .keys()
            .filter(|key| !key.starts_with("meta_data") && !schema.fields.contains_key(*key))
            .collect();
        unknown.sort();

        let severity = if strict {
            Severity::Error
        } else {
            Severity::Warning
        };
        for key in unknown {
            errors.push(
                ValidationError::new(
                    key.as_str(),
                    format!("Unknown field in target schema: {}", key),
                    ErrorType::UnknownField,
                )
                .with_severity(severity)
                .with_suggested_fix(format!("Move it under meta_data.{}", key)),
            );
        }

        errors
    }

    /// Validate many records, keeping only the ones with findings
    pub fn validate_batch(
        &self,
        records: &[TransformedRecord],
        schema: &EntitySchema,
        strict: bool,
    ) -> BTreeMap<String, Vec<ValidationError>> {
        records
            .iter()
            .filter_map(|record| {
                let errors = self.validate(record, schema, strict);
                (!errors.is_empty()).then(|| (record.id.clone(), errors))
            })
            .collect()
    }

    fn validate_field(
        &self,
        path: &str,
        value: Option<&Value>,
        def: &FieldDefinition,
        errors: &mut Vec<ValidationError>,
    ) {
        let value = match value {
            Some(v) => v,
            None => {
                if def.required {
                    errors.push(
                        ValidationError::new(path, "Required field is missing", ErrorType::Required)
                            .with_suggested_fix("Add a field mapping or a default value"),
                    );
                }
                return;
            }
        };

        if !type_matches(value, def.field_type) {
            errors.push(
                ValidationError::new(
                    path,
                    format!(
                        "Invalid type. Expected {}, got {}",
                        def.field_type,
                        json_type_name(value)
                    ),
                    ErrorType::Type,
                )
                .with_value(value.clone()),
            );
        }

        if let (Some(max), Some(s)) = (def.max_length, value.as_str()) {
            let len = s.chars().count();
            if len > max {
                errors.push(
                    ValidationError::new(
                        path,
                        format!("Value exceeds max length of {}", max),
                        ErrorType::MaxLength,
                    )
                    .with_value(json!(len))
                    .with_suggested_fix(format!("Truncate to {} characters", max)),
                );
            }
        }

        if let Some(allowed) = def.enum_values.as_ref().filter(|v| !v.is_empty()) {
            let rendered = value_to_string(value);
            if !allowed.iter().any(|a| *a == rendered) {
                errors.push(
                    ValidationError::new(
                        path,
                        format!("Invalid enum value. Must be one of: {}", allowed.join(", ")),
                        ErrorType::Enum,
                    )
                    .with_value(value.clone())
                    .with_suggested_fix(format!("Use one of: {}", allowed.join(", "))),
                );
            }
        }

        if let (Some(properties), Value::Object(map)) = (&def.properties, value) {
            for (prop_name, prop_def) in properties {
                let nested = map.get(prop_name).filter(|v| !v.is_null());
                self.validate_field(&format!("{}.{}", path, prop_name), nested, prop_def, errors);
            }
        }

        if let (Some(items), Value::Array(elements)) = (&def.items, value) {
            for (i, element) in elements.iter().enumerate() {
                let element = Some(element).filter(|v| !v.is_null());
                self.validate_field(&format!("{}[{}]", path, i), element, items, errors);
            }
        }

        if let Some(rules) = self.rules.get(path) {
            for rule in rules {
                if let Some(message) = rule(value) {
                    errors.push(
                        ValidationError::new(path, message, ErrorType::Validation)
                            .with_value(value.clone()),
                    );
                }
            }
        }
    }
}

fn type_matches(value: &Value, field_type: FieldType) -> bool {
    match field_type {
        FieldType::String | FieldType::Enum => value.is_string(),
        FieldType::Integer => value.is_i64() || value.is_u64(),
        FieldType::Decimal | FieldType::Currency | FieldType::Timestamp => value.is_number(),
        FieldType::Boolean => value.is_boolean(),
        FieldType::Date => value.as_str().map(is_valid_date).unwrap_or(false),
        FieldType::DateTime => value.as_str().map(is_valid_datetime).unwrap_or(false),
        FieldType::Object => value.is_object(),
        FieldType::Array => value.is_array(),
        FieldType::Json => value.is_object() || value.is_array() || value.is_string(),
    }
}

fn is_valid_date(s: &str) -> bool {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
}

fn is_valid_datetime(s: &str) -> bool {
    DateTime::parse_from_rfc3339(s).is_ok()
        || NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").is_ok()
        || NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "decimal",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Reusable field rules for [`RecordValidator::register_rule`]
pub mod rules {
    use super::*;

    static EMAIL: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").expect("email pattern")
    });
    static NON_PHONE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\d+]").expect("phone pattern"));
    static COUNTRY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Z]{2}$").expect("country pattern"));

    const CURRENCIES: &[&str] = &[
        "USD", "EUR", "GBP", "JPY", "AUD", "CAD", "CHF", "CNY", "INR", "MXN", "BRL", "KRW", "HKD",
        "SGD", "SEK", "NOK", "DKK", "NZD",
    ];

    pub fn email(value: &Value) -> Option<String> {
        (!EMAIL.is_match(&value_to_string(value))).then(|| "Invalid email format".to_string())
    }

    pub fn phone(value: &Value) -> Option<String> {
        let digits = NON_PHONE.replace_all(&value_to_string(value), "").len();
        (!(7..=15).contains(&digits)).then(|| "Invalid phone number length".to_string())
    }

    pub fn currency_code(value: &Value) -> Option<String> {
        let code = value_to_string(value).to_uppercase();
        (!CURRENCIES.contains(&code.as_str()))
            .then(|| "Invalid currency code. Common codes: USD, EUR, GBP".to_string())
    }

    pub fn country_code(value: &Value) -> Option<String> {
        (!COUNTRY.is_match(&value_to_string(value).to_uppercase())).then(|| {
            "Country code must be a 2-letter ISO code (e.g., US, GB, DE)".to_string()
        })
    }
}
