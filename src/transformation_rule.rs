use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use tracing::warn;

use crate::field_path::{lookup, value_to_string};

/// Field-level rule: where a value comes from, where it goes and how it is reshaped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Absent when the value is generated (default, lookup, compile_metadata, ...)
    #[serde(default)]
    pub source_field: Option<String>,
    pub target_field: String,
    #[serde(default)]
    pub transform: TransformType,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub transform_config: Map<String, Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub notes: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub required: bool,
    #[serde(
        rename = "default",
        alias = "default_value",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub default_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// Operators understood by the transformation engine.
///
/// Names that are not built in decode as `Custom(name)` and are dispatched to
/// functions registered on the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TransformType {
    #[default]
    Direct,
    PrefixAdd,
    PrefixStrip,
    PrefixStripAndAdd,
    SplitName,
    Truncate,
    Uppercase,
    Lowercase,
    EnumMap,
    BooleanToEnum,
    ToMetadata,
    Merge,
    ArrayMap,
    Default,
    Coalesce,
    CoalesceFields,
    Conditional,
    TierMapping,
    NegateIfPositive,
    NegateIfNegative,
    IsoToUnix,
    UnixToIso,
    Multiply,
    Divide,
    CountryCode,
    CleanPhone,
    AddressMapping,
    Lookup,
    CompileMetadata,
    Custom(String),
}

const BUILTIN_NAMES: &[(&str, TransformType)] = &[
    ("direct", TransformType::Direct),
    ("prefix_add", TransformType::PrefixAdd),
    ("prefix_strip", TransformType::PrefixStrip),
    ("prefix_strip_and_add", TransformType::PrefixStripAndAdd),
    ("split_name", TransformType::SplitName),
    ("truncate", TransformType::Truncate),
    ("uppercase", TransformType::Uppercase),
    ("lowercase", TransformType::Lowercase),
    ("enum_map", TransformType::EnumMap),
    ("boolean_to_enum", TransformType::BooleanToEnum),
    ("to_metadata", TransformType::ToMetadata),
    ("merge", TransformType::Merge),
    ("array_map", TransformType::ArrayMap),
    ("default", TransformType::Default),
    ("coalesce", TransformType::Coalesce),
    ("coalesce_fields", TransformType::CoalesceFields),
    ("conditional", TransformType::Conditional),
    ("tier_mapping", TransformType::TierMapping),
    ("negate_if_positive", TransformType::NegateIfPositive),
    ("negate_if_negative", TransformType::NegateIfNegative),
    ("iso_to_unix", TransformType::IsoToUnix),
    ("unix_to_iso", TransformType::UnixToIso),
    ("multiply", TransformType::Multiply),
    ("divide", TransformType::Divide),
    ("country_code", TransformType::CountryCode),
    ("clean_phone", TransformType::CleanPhone),
    ("address_mapping", TransformType::AddressMapping),
    ("lookup", TransformType::Lookup),
    ("compile_metadata", TransformType::CompileMetadata),
];

impl TransformType {
    pub fn name(&self) -> &str {
        match self {
            TransformType::Custom(name) => name,
            builtin => BUILTIN_NAMES
                .iter()
                .find(|(_, t)| t == builtin)
                .map(|(name, _)| *name)
                .unwrap_or("direct"),
        }
    }

    pub fn is_builtin(&self) -> bool {
        !matches!(self, TransformType::Custom(_))
    }
}

impl From<String> for TransformType {
    fn from(name: String) -> Self {
        BUILTIN_NAMES
            .iter()
            .find(|(builtin, _)| *builtin == name)
            .map(|(_, t)| t.clone())
            .unwrap_or(TransformType::Custom(name))
    }
}

impl From<&str> for TransformType {
    fn from(name: &str) -> Self {
        TransformType::from(name.to_string())
    }
}

impl From<TransformType> for String {
    fn from(transform: TransformType) -> Self {
        transform.name().to_string()
    }
}

impl fmt::Display for TransformType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Parsed form of a mapping condition expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Exists(String),
    Equals(String, String),
    NotEquals(String, String),
}

impl Condition {
    /// Parse `<path> exists`, `<path> == <literal>` or `<path> != <literal>`.
    /// Literals may be wrapped in single or double quotes.
    pub fn parse(expr: &str) -> Option<Condition> {
        let expr = expr.trim();

        if let Some(field) = expr.strip_suffix(" exists") {
            let field = field.trim();
            return (!field.is_empty()).then(|| Condition::Exists(field.to_string()));
        }
        if let Some((field, expected)) = expr.split_once(" == ") {
            return Some(Condition::Equals(field.trim().to_string(), unquote(expected)));
        }
        if let Some((field, expected)) = expr.split_once(" != ") {
            return Some(Condition::NotEquals(field.trim().to_string(), unquote(expected)));
        }

        None
    }

    /// True as soon as any one payload satisfies the condition.
    /// An absent value counts as different from every literal.
    pub fn evaluate<'a, I>(&self, payloads: I) -> bool
    where
        I: IntoIterator<Item = &'a Value>,
    {
        let mut payloads = payloads.into_iter();
        match self {
            Condition::Exists(path) => payloads.any(|p| lookup(p, path).is_some()),
            Condition::Equals(path, expected) => payloads.any(|p| {
                lookup(p, path)
                    .map(|v| value_to_string(v) == *expected)
                    .unwrap_or(false)
            }),
            Condition::NotEquals(path, expected) => payloads.any(|p| {
                lookup(p, path)
                    .map(|v| value_to_string(v) != *expected)
                    .unwrap_or(true)
            }),
        }
    }
}

fn unquote(literal: &str) -> String {
    literal
        .trim()
        .trim_matches(|c| c == '\'' || c == '"')
        .to_string()
}

/// Evaluate a condition expression. Expressions that cannot be parsed are
/// treated as satisfied so a typo never silently drops data.
pub fn evaluate_condition<'a, I>(expr: &str, payloads: I) -> bool
where
    I: IntoIterator<Item = &'a Value>,
{
    match Condition::parse(expr) {
        Some(condition) => condition.evaluate(payloads),
        None => {
            warn!(condition = expr, "Unparsable condition, applying mapping anyway");
            true
        }
    }
}

impl FieldMapping {
    pub fn new(
        source_field: Option<&str>,
        target_field: impl Into<String>,
        transform: TransformType,
    ) -> Self {
        Self {
            source_field: source_field.map(str::to_string),
            target_field: target_field.into(),
            transform,
            transform_config: Map::new(),
            notes: String::new(),
            required: false,
            default_value: None,
            condition: None,
        }
    }

    /// Shorthand for a `direct` copy between two paths
    pub fn direct(source_field: &str, target_field: impl Into<String>) -> Self {
        Self::new(Some(source_field), target_field, TransformType::Direct)
    }

    pub fn with_config(mut self, config: Value) -> Self {
        if let Value::Object(map) = config {
            self.transform_config = map;
        }
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Check if the mapping's condition holds for the given source payloads
    pub fn condition_satisfied<'a, I>(&self, payloads: I) -> bool
    where
        I: IntoIterator<Item = &'a Value>,
    {
        match &self.condition {
            None => true,
            Some(expr) => evaluate_condition(expr, payloads),
        }
    }
}
