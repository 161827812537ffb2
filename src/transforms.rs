//! Built-in field transform operators.
//!
//! Every operator receives the resolved source value (absent when the source
//! path did not resolve), its configuration block, every source payload of the
//! record being built and the run context. Operators never fail on absent
//! input; they return `Ok(None)` or their documented default instead.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Number, Value};
use std::collections::BTreeMap;

use crate::field_path::{lookup, value_to_string};
use crate::record::SourceRecord;
use crate::transformation_engine::TransformationError;
use crate::transformation_rule::{evaluate_condition, TransformType};

pub type TransformResult = Result<Option<Value>, TransformationError>;

/// Signature shared by built-in operators
pub type TransformFn =
    fn(Option<&Value>, &Map<String, Value>, &SourcePayloads<'_>, &TransformContext) -> TransformResult;

/// Run-scoped data that operators may consult but mappings do not carry
#[derive(Debug, Clone, Default)]
pub struct TransformContext {
    /// `lookup` tables: table name to list of records
    pub lookup_tables: BTreeMap<String, Vec<Value>>,
    /// Named value tables for `enum_map`
    pub status_mappings: BTreeMap<String, BTreeMap<String, String>>,
}

/// Ordered per-service payloads of the records feeding one target record
#[derive(Debug, Clone, Default)]
pub struct SourcePayloads<'a> {
    entries: Vec<(&'a str, &'a Value)>,
}

impl<'a> SourcePayloads<'a> {
    pub fn new(entries: Vec<(&'a str, &'a Value)>) -> Self {
        Self { entries }
    }

    pub fn from_records(records: &'a [SourceRecord]) -> Self {
        Self {
            entries: records
                .iter()
                .map(|r| (r.source_service.as_str(), &r.data))
                .collect(),
        }
    }

    pub fn values(&self) -> impl Iterator<Item = &'a Value> + '_ {
        self.entries.iter().map(|(_, data)| *data)
    }

    pub fn service(&self, name: &str) -> Option<&'a Value> {
        self.entries
            .iter()
            .find(|(service, _)| service.eq_ignore_ascii_case(name))
            .map(|(_, data)| *data)
    }

    /// First payload, in supplied order, in which `path` resolves
    pub fn first(&self, path: &str) -> Option<&'a Value> {
        self.values().find_map(|data| lookup(data, path))
    }

    /// Resolve a source path. A leading segment naming one of the source
    /// services restricts the lookup to that service's payload.
    pub fn resolve(&self, path: &str) -> Option<&'a Value> {
        if let Some((head, rest)) = path.split_once('.') {
            if let Some(data) = self.service(head) {
                return lookup(data, rest);
            }
        }
        self.first(path)
    }
}

/// Closed dispatch table from operator tag to implementation
pub fn builtin(transform: &TransformType) -> Option<TransformFn> {
    let f: TransformFn = match transform {
        TransformType::Direct | TransformType::ToMetadata => direct,
        TransformType::PrefixAdd => prefix_add,
        TransformType::PrefixStrip => prefix_strip,
        TransformType::PrefixStripAndAdd => prefix_strip_and_add,
        TransformType::SplitName => split_name,
        TransformType::Truncate => truncate,
        TransformType::Uppercase => uppercase,
        TransformType::Lowercase => lowercase,
        TransformType::EnumMap => enum_map,
        TransformType::BooleanToEnum => boolean_to_enum,
        TransformType::Merge => merge,
        TransformType::ArrayMap => array_map,
        TransformType::Default => default_value,
        TransformType::Coalesce => coalesce,
        TransformType::CoalesceFields => coalesce_fields,
        TransformType::Conditional => conditional,
        TransformType::TierMapping => tier_mapping,
        TransformType::NegateIfPositive => negate_if_positive,
        TransformType::NegateIfNegative => negate_if_negative,
        TransformType::IsoToUnix => iso_to_unix,
        TransformType::UnixToIso => unix_to_iso,
        TransformType::Multiply => multiply,
        TransformType::Divide => divide,
        TransformType::CountryCode => country_code,
        TransformType::CleanPhone => clean_phone,
        TransformType::AddressMapping => address_mapping,
        TransformType::Lookup => lookup_value,
        TransformType::CompileMetadata => compile_metadata,
        TransformType::Custom(_) => return None,
    };
    Some(f)
}

fn config_str<'c>(config: &'c Map<String, Value>, key: &str) -> Option<&'c str> {
    config.get(key).and_then(Value::as_str)
}

fn config_object<'c>(config: &'c Map<String, Value>, key: &str) -> Option<&'c Map<String, Value>> {
    config.get(key).and_then(Value::as_object)
}

fn string_value(s: String) -> Option<Value> {
    Some(Value::String(s))
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn parse(value: &Value) -> Option<Num> {
        match value {
            Value::Number(n) => n
                .as_i64()
                .map(Num::Int)
                .or_else(|| n.as_f64().map(Num::Float)),
            Value::String(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .map(Num::Int)
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(Num::Float))
            }
            _ => None,
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }

    fn into_value(self) -> Option<Value> {
        match self {
            Num::Int(i) => Some(Value::Number(i.into())),
            Num::Float(f) => Number::from_f64(f).map(Value::Number),
        }
    }
}

fn direct(value: Option<&Value>, _: &Map<String, Value>, _: &SourcePayloads<'_>, _: &TransformContext) -> TransformResult {
    Ok(value.cloned())
}

fn prefix_add(value: Option<&Value>, config: &Map<String, Value>, _: &SourcePayloads<'_>, _: &TransformContext) -> TransformResult {
    let prefix = config_str(config, "prefix").unwrap_or("");
    Ok(value.and_then(|v| string_value(format!("{}{}", prefix, value_to_string(v)))))
}

fn replace_prefix(value: &Value, strip: &str, add: &str) -> Option<Value> {
    let s = value_to_string(value);
    let rest = s.strip_prefix(strip).unwrap_or(&s);
    string_value(format!("{}{}", add, rest))
}

fn prefix_strip(value: Option<&Value>, config: &Map<String, Value>, _: &SourcePayloads<'_>, _: &TransformContext) -> TransformResult {
    let prefix = config_str(config, "prefix").unwrap_or("");
    let new_prefix = config_str(config, "new_prefix").unwrap_or("");
    Ok(value.and_then(|v| replace_prefix(v, prefix, new_prefix)))
}

fn prefix_strip_and_add(value: Option<&Value>, config: &Map<String, Value>, _: &SourcePayloads<'_>, _: &TransformContext) -> TransformResult {
    let strip = config_str(config, "strip").unwrap_or("");
    let add = config_str(config, "add").unwrap_or("");
    Ok(value.and_then(|v| replace_prefix(v, strip, add)))
}

fn split_name(value: Option<&Value>, config: &Map<String, Value>, _: &SourcePayloads<'_>, _: &TransformContext) -> TransformResult {
    let name = match value.map(value_to_string) {
        Some(name) if !name.is_empty() => name,
        _ => return Ok(None),
    };

    let mut parts = name.splitn(2, ' ');
    match config_str(config, "part").unwrap_or("first") {
        "first" => Ok(parts.next().and_then(|p| string_value(p.to_string()))),
        "last" => Ok(parts.nth(1).and_then(|p| string_value(p.to_string()))),
        _ => Ok(value.cloned()),
    }
}

fn truncate(value: Option<&Value>, config: &Map<String, Value>, _: &SourcePayloads<'_>, _: &TransformContext) -> TransformResult {
    let max = config
        .get("max_length")
        .and_then(Value::as_u64)
        .unwrap_or(255) as usize;
    Ok(value.and_then(|v| string_value(value_to_string(v).chars().take(max).collect())))
}

fn uppercase(value: Option<&Value>, _: &Map<String, Value>, _: &SourcePayloads<'_>, _: &TransformContext) -> TransformResult {
    Ok(value.and_then(|v| string_value(value_to_string(v).to_uppercase())))
}

fn lowercase(value: Option<&Value>, _: &Map<String, Value>, _: &SourcePayloads<'_>, _: &TransformContext) -> TransformResult {
    Ok(value.and_then(|v| string_value(value_to_string(v).to_lowercase())))
}

fn enum_map(value: Option<&Value>, config: &Map<String, Value>, _: &SourcePayloads<'_>, ctx: &TransformContext) -> TransformResult {
    let default = config.get("default").filter(|d| !d.is_null()).cloned();
    let value = match value {
        Some(v) => v,
        None => return Ok(default),
    };

    let key = value_to_string(value);
    if let Some(mapping) = config_object(config, "mapping") {
        if let Some(mapped) = mapping.get(&key).filter(|m| !m.is_null()) {
            return Ok(Some(mapped.clone()));
        }
    } else if let Some(table) = config_str(config, "status_mapping").and_then(|n| ctx.status_mappings.get(n)) {
        if let Some(mapped) = table.get(&key) {
            return Ok(string_value(mapped.clone()));
        }
    }

    Ok(default)
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => matches!(s.to_lowercase().as_str(), "true" | "1" | "yes"),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn boolean_to_enum(value: Option<&Value>, config: &Map<String, Value>, _: &SourcePayloads<'_>, _: &TransformContext) -> TransformResult {
    let label = |primary: &str, fallback: &str| {
        config
            .get(primary)
            .filter(|v| truthy_label(v))
            .or_else(|| config.get(fallback))
            .filter(|v| !v.is_null())
            .cloned()
    };
    let true_label = label("true_value", "true");
    let false_label = label("false_value", "false");

    Ok(match value {
        Some(v) if truthy(v) => true_label,
        _ => false_label,
    })
}

fn truthy_label(value: &Value) -> bool {
    !matches!(value, Value::Null) && value.as_str().map(|s| !s.is_empty()).unwrap_or(true)
}

fn merge(value: Option<&Value>, config: &Map<String, Value>, payloads: &SourcePayloads<'_>, _: &TransformContext) -> TransformResult {
    let mut merged = match value {
        Some(Value::Object(map)) => map.clone(),
        other => return Ok(other.cloned()),
    };

    if let Some(additional) = config_object(config, "additional_fields") {
        for (key, path) in additional {
            if let Some(found) = path.as_str().and_then(|p| payloads.first(p)) {
                merged.insert(key.clone(), found.clone());
            }
        }
    }

    Ok(Some(Value::Object(merged)))
}

fn array_map(value: Option<&Value>, config: &Map<String, Value>, _: &SourcePayloads<'_>, _: &TransformContext) -> TransformResult {
    let items = match value {
        Some(Value::Array(items)) => items,
        other => return Ok(other.cloned()),
    };

    let empty = Map::new();
    let item_mapping = config_object(config, "item_mapping").unwrap_or(&empty);
    let id_transform = config_object(config, "id_transform").filter(|t| !t.is_empty());

    let mapped = items
        .iter()
        .map(|item| {
            let mut out = Map::new();
            for (source_key, target_key) in item_mapping {
                let Some(target_key) = target_key.as_str() else { continue };
                let Some(found) = lookup(item, source_key) else { continue };

                let rewritten = match id_transform {
                    Some(t) if target_key.ends_with("_id") && truthy_label(found) => replace_prefix(
                        found,
                        config_str(t, "prefix").unwrap_or(""),
                        config_str(t, "new_prefix").unwrap_or(""),
                    ),
                    _ => Some(found.clone()),
                };
                if let Some(v) = rewritten {
                    out.insert(target_key.to_string(), v);
                }
            }
            Value::Object(out)
        })
        .collect();

    Ok(Some(Value::Array(mapped)))
}

fn default_value(value: Option<&Value>, config: &Map<String, Value>, _: &SourcePayloads<'_>, _: &TransformContext) -> TransformResult {
    Ok(value
        .cloned()
        .or_else(|| config.get("value").filter(|v| !v.is_null()).cloned()))
}

fn coalesce(value: Option<&Value>, config: &Map<String, Value>, payloads: &SourcePayloads<'_>, _: &TransformContext) -> TransformResult {
    if let Some(v) = value {
        return Ok(Some(v.clone()));
    }

    let fallback = config_str(config, "fallback_field").and_then(|f| payloads.first(f));
    let suffix = config_str(config, "fallback_suffix").unwrap_or("");
    Ok(fallback.map(|found| {
        if suffix.is_empty() {
            found.clone()
        } else {
            Value::String(format!("{}{}", value_to_string(found), suffix))
        }
    }))
}

fn coalesce_fields(value: Option<&Value>, config: &Map<String, Value>, payloads: &SourcePayloads<'_>, _: &TransformContext) -> TransformResult {
    if let Some(v) = value {
        return Ok(Some(v.clone()));
    }

    let fields = config.get("fallback_fields").and_then(Value::as_array);
    Ok(fields
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .find_map(|path| payloads.first(path))
        .cloned())
}

fn conditional(value: Option<&Value>, config: &Map<String, Value>, payloads: &SourcePayloads<'_>, _: &TransformContext) -> TransformResult {
    let rules = config.get("conditions").and_then(Value::as_array);

    for rule in rules.into_iter().flatten().filter_map(Value::as_object) {
        if let (Some(expected), Some(v)) = (rule.get("value"), value) {
            if value_to_string(v) == value_to_string(expected) {
                return Ok(rule.get("result").filter(|r| !r.is_null()).cloned());
            }
        }
        if let Some(expr) = rule.get("if").and_then(Value::as_str) {
            if evaluate_condition(expr, payloads.values()) {
                return Ok(rule.get("then").filter(|r| !r.is_null()).cloned());
            }
        }
        if let Some(default) = rule.get("default") {
            return Ok(Some(default.clone()).filter(|d| !d.is_null()));
        }
    }

    Ok(value.cloned())
}

fn tier_mapping(value: Option<&Value>, config: &Map<String, Value>, _: &SourcePayloads<'_>, _: &TransformContext) -> TransformResult {
    let tiers = match value {
        Some(Value::Array(tiers)) => tiers,
        other => return Ok(other.cloned()),
    };

    let default_fields = json!({"up_to": "ending_unit", "unit_amount": "price"});
    let field_mapping = config_object(config, "field_mapping")
        .or_else(|| default_fields.as_object())
        .cloned()
        .unwrap_or_default();
    let open_end = config
        .get("null_up_to")
        .cloned()
        .unwrap_or_else(|| json!("inf"));

    let mut bands = Vec::with_capacity(tiers.len());
    let mut starting_unit = Num::Int(1);

    for (index, tier) in tiers.iter().enumerate() {
        let tier = tier.as_object().ok_or_else(|| TransformationError::InvalidInput {
            transform: "tier_mapping".to_string(),
            message: format!("tier {} is not an object", index),
        })?;

        let up_to = tier.get("up_to").filter(|v| !v.is_null());
        let up_to_num = match up_to {
            Some(v) => Some(Num::parse(v).ok_or_else(|| TransformationError::InvalidInput {
                transform: "tier_mapping".to_string(),
                message: format!("tier {} has a non-numeric up_to: {}", index, v),
            })?),
            None => None,
        };

        let mut band = Map::new();
        band.insert("starting_unit".to_string(), starting_unit.into_value().unwrap_or(Value::Null));
        band.insert(
            "ending_unit".to_string(),
            up_to.cloned().unwrap_or_else(|| open_end.clone()),
        );
        for (source_key, target_key) in &field_mapping {
            let (Some(target_key), Some(v)) = (target_key.as_str(), tier.get(source_key)) else {
                continue;
            };
            if !v.is_null() {
                band.insert(target_key.to_string(), v.clone());
            }
        }
        bands.push(Value::Object(band));

        starting_unit = match up_to_num {
            Some(Num::Int(i)) => Num::Int(i + 1),
            Some(Num::Float(f)) => Num::Float(f + 1.0),
            None => Num::Int(1),
        };
    }

    Ok(Some(Value::Array(bands)))
}

fn negate_if_positive(value: Option<&Value>, _: &Map<String, Value>, _: &SourcePayloads<'_>, _: &TransformContext) -> TransformResult {
    Ok(value.map(|v| match Num::parse(v) {
        Some(Num::Int(i)) if i > 0 => json!(-i),
        Some(Num::Float(f)) if f > 0.0 => json!(-f),
        Some(n) => n.into_value().unwrap_or_else(|| v.clone()),
        None => v.clone(),
    }))
}

fn negate_if_negative(value: Option<&Value>, _: &Map<String, Value>, _: &SourcePayloads<'_>, _: &TransformContext) -> TransformResult {
    Ok(value.map(|v| match Num::parse(v) {
        Some(Num::Int(i)) => i.checked_abs().map(|a| json!(a)).unwrap_or_else(|| v.clone()),
        Some(Num::Float(f)) => json!(f.abs()),
        None => v.clone(),
    }))
}

/// `+10000-01-01T00:00:00Z`: signed years outside 0..=9999, as chrono renders them
static EXTENDED_YEAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([+-]\d{4,})(-\d{2}-\d{2}T.+)$").expect("extended year pattern"));

fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Some(caps) = EXTENDED_YEAR.captures(s) {
        // parse against a leap year so 02-29 survives, then move to the real year
        let year: i32 = caps[1].parse().ok()?;
        let dt = DateTime::parse_from_rfc3339(&format!("2000{}", &caps[2])).ok()?;
        return dt.with_year(year).map(|dt| dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn iso_to_unix(value: Option<&Value>, _: &Map<String, Value>, _: &SourcePayloads<'_>, _: &TransformContext) -> TransformResult {
    Ok(value.and_then(|v| match v {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.trunc() as i64))
            .map(|secs| json!(secs)),
        Value::String(s) => parse_datetime(s).map(|dt| json!(dt.timestamp())),
        _ => None,
    }))
}

fn unix_to_iso(value: Option<&Value>, _: &Map<String, Value>, _: &SourcePayloads<'_>, _: &TransformContext) -> TransformResult {
    let Some(n) = value.and_then(Num::parse) else { return Ok(None) };

    let dt = match n {
        Num::Int(secs) => Utc.timestamp_opt(secs, 0).single(),
        Num::Float(f) => {
            let secs = f.floor();
            let nanos = ((f - secs) * 1e9).round() as u32;
            Utc.timestamp_opt(secs as i64, nanos.min(999_999_999)).single()
        }
    };
    Ok(dt.map(|dt| Value::String(dt.to_rfc3339_opts(SecondsFormat::AutoSi, true))))
}

fn multiply(value: Option<&Value>, config: &Map<String, Value>, _: &SourcePayloads<'_>, _: &TransformContext) -> TransformResult {
    let factor = config.get("multiplier").and_then(Num::parse).unwrap_or(Num::Int(1));
    Ok(value.map(|v| {
        let product = match (Num::parse(v), factor) {
            (Some(Num::Int(a)), Num::Int(b)) => Some(
                a.checked_mul(b)
                    .map(Num::Int)
                    .unwrap_or(Num::Float(a as f64 * b as f64)),
            ),
            (Some(a), b) => Some(Num::Float(a.as_f64() * b.as_f64())),
            (None, _) => None,
        };
        product.and_then(Num::into_value).unwrap_or_else(|| v.clone())
    }))
}

fn divide(value: Option<&Value>, config: &Map<String, Value>, _: &SourcePayloads<'_>, _: &TransformContext) -> TransformResult {
    let divisor = config
        .get("divisor")
        .and_then(Num::parse)
        .map(Num::as_f64)
        .unwrap_or(1.0);
    Ok(value.map(|v| match Num::parse(v) {
        Some(n) if divisor != 0.0 => Num::Float(n.as_f64() / divisor)
            .into_value()
            .unwrap_or_else(|| v.clone()),
        _ => v.clone(),
    }))
}

const COUNTRY_CODES: &[(&str, &str)] = &[
    ("united states", "US"),
    ("united states of america", "US"),
    ("usa", "US"),
    ("united kingdom", "GB"),
    ("uk", "GB"),
    ("great britain", "GB"),
    ("germany", "DE"),
    ("france", "FR"),
    ("canada", "CA"),
    ("australia", "AU"),
    ("japan", "JP"),
    ("china", "CN"),
    ("india", "IN"),
    ("brazil", "BR"),
    ("mexico", "MX"),
    ("spain", "ES"),
    ("italy", "IT"),
    ("netherlands", "NL"),
    ("sweden", "SE"),
    ("switzerland", "CH"),
    ("belgium", "BE"),
    ("austria", "AT"),
    ("denmark", "DK"),
    ("norway", "NO"),
    ("finland", "FI"),
    ("ireland", "IE"),
    ("portugal", "PT"),
    ("poland", "PL"),
    ("new zealand", "NZ"),
    ("singapore", "SG"),
];

fn country_code(value: Option<&Value>, _: &Map<String, Value>, _: &SourcePayloads<'_>, _: &TransformContext) -> TransformResult {
    let Some(v) = value else { return Ok(None) };

    let name = value_to_string(v).trim().to_lowercase();
    if name.chars().count() == 2 {
        return Ok(string_value(name.to_uppercase()));
    }

    Ok(Some(
        COUNTRY_CODES
            .iter()
            .find(|(country, _)| *country == name)
            .map(|(_, code)| json!(code))
            .unwrap_or_else(|| v.clone()),
    ))
}

static PHONE_NOISE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\d+]").expect("phone noise pattern"));

fn clean_phone(value: Option<&Value>, _: &Map<String, Value>, _: &SourcePayloads<'_>, _: &TransformContext) -> TransformResult {
    let Some(v) = value else { return Ok(None) };

    let mut phone = PHONE_NOISE.replace_all(&value_to_string(v), "").into_owned();
    if phone.is_empty() {
        return Ok(None);
    }
    if !phone.starts_with('+') && phone.len() > 10 {
        phone.insert(0, '+');
    }
    Ok(string_value(phone))
}

fn address_mapping(value: Option<&Value>, config: &Map<String, Value>, _: &SourcePayloads<'_>, _: &TransformContext) -> TransformResult {
    let address = match value {
        Some(Value::Object(address)) => address,
        other => return Ok(other.cloned()),
    };

    let default_map = json!({
        "line1": "line1",
        "line2": "line2",
        "city": "city",
        "state": "state_code",
        "postal_code": "zip",
        "country": "country",
    });
    let field_map = config_object(config, "field_map")
        .or_else(|| default_map.as_object())
        .cloned()
        .unwrap_or_default();

    let mut out = Map::new();
    for (source_key, target_key) in &field_map {
        if let (Some(v), Some(target_key)) = (address.get(source_key), target_key.as_str()) {
            out.insert(target_key.to_string(), v.clone());
        }
    }
    Ok(Some(Value::Object(out)))
}

fn lookup_value(value: Option<&Value>, config: &Map<String, Value>, _: &SourcePayloads<'_>, ctx: &TransformContext) -> TransformResult {
    let Some(v) = value else { return Ok(None) };
    let Some(table) = config_str(config, "table").and_then(|t| ctx.lookup_tables.get(t)) else {
        return Ok(None);
    };

    let key_field = config_str(config, "key_field").unwrap_or("id");
    let needle = value_to_string(v);
    let found = table.iter().find(|record| {
        record
            .get(key_field)
            .map(|k| k == v || value_to_string(k) == needle)
            .unwrap_or(false)
    });

    Ok(found.and_then(|record| match config_str(config, "value_field") {
        Some(field) => record.get(field).filter(|f| !f.is_null()).cloned(),
        None => Some(record.clone()),
    }))
}

fn compile_metadata(_: Option<&Value>, config: &Map<String, Value>, payloads: &SourcePayloads<'_>, _: &TransformContext) -> TransformResult {
    let mut out = Map::new();
    if let Some(fields) = config_object(config, "source_fields") {
        for (key, path) in fields {
            if let Some(found) = path.as_str().and_then(|p| payloads.first(p)) {
                out.insert(key.clone(), found.clone());
            }
        }
    }
    Ok((!out.is_empty()).then(|| Value::Object(out)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(transform: TransformType, value: Option<Value>, config: Value) -> Option<Value> {
        apply_with(transform, value, config, &[], &TransformContext::default())
    }

    fn apply_with(
        transform: TransformType,
        value: Option<Value>,
        config: Value,
        payloads: &[(&str, &Value)],
        ctx: &TransformContext,
    ) -> Option<Value> {
        let f = builtin(&transform).unwrap();
        let config = config.as_object().cloned().unwrap_or_default();
        let payloads = SourcePayloads::new(payloads.to_vec());
        f(value.as_ref(), &config, &payloads, ctx).unwrap()
    }

    const ALL_BUILTINS: &[&str] = &[
        "direct", "prefix_add", "prefix_strip", "prefix_strip_and_add", "split_name",
        "truncate", "uppercase", "lowercase", "enum_map", "boolean_to_enum", "to_metadata",
        "merge", "array_map", "default", "coalesce", "coalesce_fields", "conditional",
        "tier_mapping", "negate_if_positive", "negate_if_negative", "iso_to_unix",
        "unix_to_iso", "multiply", "divide", "country_code", "clean_phone",
        "address_mapping", "lookup", "compile_metadata",
    ];

    #[test]
    fn test_every_operator_accepts_absent_input() {
        for name in ALL_BUILTINS {
            let transform = TransformType::from(*name);
            assert!(transform.is_builtin(), "{} should be built in", name);
            let f = builtin(&transform).unwrap();
            let result = f(None, &Map::new(), &SourcePayloads::default(), &TransformContext::default());
            assert_eq!(result.unwrap(), None, "{} on absent input", name);
        }
    }

    #[test]
    fn test_absent_input_uses_configured_defaults() {
        assert_eq!(
            apply(TransformType::EnumMap, None, json!({"default": "active"})),
            Some(json!("active"))
        );
        assert_eq!(
            apply(TransformType::BooleanToEnum, None, json!({"true": "on", "false": "off"})),
            Some(json!("off"))
        );
        assert_eq!(
            apply(TransformType::Default, None, json!({"value": "USD"})),
            Some(json!("USD"))
        );
    }

    #[test]
    fn test_prefix_operators() {
        assert_eq!(
            apply(TransformType::PrefixAdd, Some(json!("123")), json!({"prefix": "sf_"})),
            Some(json!("sf_123"))
        );
        assert_eq!(
            apply(TransformType::PrefixStrip, Some(json!("cus_42")), json!({"prefix": "cus_", "new_prefix": "cb_"})),
            Some(json!("cb_42"))
        );
        assert_eq!(
            apply(TransformType::PrefixStrip, Some(json!("42")), json!({"prefix": "cus_"})),
            Some(json!("42"))
        );
        assert_eq!(
            apply(TransformType::PrefixStripAndAdd, Some(json!("price_9")), json!({"strip": "price_", "add": "plan-"})),
            Some(json!("plan-9"))
        );
    }

    #[test]
    fn test_split_name() {
        let first = json!({"part": "first"});
        let last = json!({"part": "last"});
        assert_eq!(apply(TransformType::SplitName, Some(json!("Jane Doe")), first.clone()), Some(json!("Jane")));
        assert_eq!(apply(TransformType::SplitName, Some(json!("Mary Ann Smith")), last.clone()), Some(json!("Ann Smith")));
        assert_eq!(apply(TransformType::SplitName, Some(json!("Cher")), last), None);
        assert_eq!(apply(TransformType::SplitName, Some(json!("")), first), None);
    }

    #[test]
    fn test_truncate_and_case() {
        assert_eq!(
            apply(TransformType::Truncate, Some(json!("abcdef")), json!({"max_length": 3})),
            Some(json!("abc"))
        );
        assert_eq!(apply(TransformType::Uppercase, Some(json!("eur")), json!({})), Some(json!("EUR")));
        assert_eq!(apply(TransformType::Lowercase, Some(json!("A@X.COM")), json!({})), Some(json!("a@x.com")));
    }

    #[test]
    fn test_enum_map() {
        let config = json!({"mapping": {"trialing": "in_trial", "past_due": "active"}});
        assert_eq!(
            apply(TransformType::EnumMap, Some(json!("trialing")), config.clone()),
            Some(json!("in_trial"))
        );
        assert_eq!(apply(TransformType::EnumMap, Some(json!("paused")), config), None);

        let mut ctx = TransformContext::default();
        ctx.status_mappings.insert(
            "subscription".to_string(),
            BTreeMap::from([("canceled".to_string(), "cancelled".to_string())]),
        );
        assert_eq!(
            apply_with(
                TransformType::EnumMap,
                Some(json!("canceled")),
                json!({"status_mapping": "subscription"}),
                &[],
                &ctx
            ),
            Some(json!("cancelled"))
        );
    }

    #[test]
    fn test_boolean_to_enum() {
        let config = json!({"true_value": "on", "false_value": "off"});
        assert_eq!(apply(TransformType::BooleanToEnum, Some(json!(true)), config.clone()), Some(json!("on")));
        assert_eq!(apply(TransformType::BooleanToEnum, Some(json!("YES")), config.clone()), Some(json!("on")));
        assert_eq!(apply(TransformType::BooleanToEnum, Some(json!("no")), config.clone()), Some(json!("off")));
        assert_eq!(apply(TransformType::BooleanToEnum, Some(json!(0)), config), Some(json!("off")));
    }

    #[test]
    fn test_merge_and_compile_metadata() {
        let stripe = json!({"id": "cus_1", "metadata": {"tier": "gold"}});
        let sf = json!({"AccountNumber": "A-9"});
        let payloads = [("stripe", &stripe), ("salesforce", &sf)];
        let ctx = TransformContext::default();

        let merged = apply_with(
            TransformType::Merge,
            Some(json!({"tier": "gold"})),
            json!({"additional_fields": {"account": "AccountNumber"}}),
            &payloads,
            &ctx,
        );
        assert_eq!(merged, Some(json!({"tier": "gold", "account": "A-9"})));

        let compiled = apply_with(
            TransformType::CompileMetadata,
            None,
            json!({"source_fields": {"stripe_id": "id", "sf_account": "AccountNumber", "missing": "nope"}}),
            &payloads,
            &ctx,
        );
        assert_eq!(compiled, Some(json!({"stripe_id": "cus_1", "sf_account": "A-9"})));
    }

    #[test]
    fn test_array_map_rewrites_ids() {
        let items = json!([
            {"price": {"id": "price_1"}, "quantity": 2},
            {"price": {"id": "price_2"}}
        ]);
        let config = json!({
            "item_mapping": {"price.id": "item_price_id", "quantity": "quantity"},
            "id_transform": {"prefix": "price_", "new_prefix": "cb-"}
        });

        assert_eq!(
            apply(TransformType::ArrayMap, Some(items), config),
            Some(json!([
                {"item_price_id": "cb-1", "quantity": 2},
                {"item_price_id": "cb-2"}
            ]))
        );
    }

    #[test]
    fn test_coalesce_variants() {
        let data = json!({"company": "Acme", "name": "Jane"});
        let payloads = [("stripe", &data)];
        let ctx = TransformContext::default();

        assert_eq!(
            apply_with(TransformType::Coalesce, None, json!({"fallback_field": "company", "fallback_suffix": " Inc"}), &payloads, &ctx),
            Some(json!("Acme Inc"))
        );
        assert_eq!(
            apply_with(TransformType::Coalesce, Some(json!("given")), json!({"fallback_field": "company"}), &payloads, &ctx),
            Some(json!("given"))
        );
        assert_eq!(
            apply_with(TransformType::CoalesceFields, None, json!({"fallback_fields": ["nickname", "name"]}), &payloads, &ctx),
            Some(json!("Jane"))
        );
    }

    #[test]
    fn test_conditional_rules_first_match_wins() {
        let data = json!({"cancel_at_period_end": true});
        let payloads = [("stripe", &data)];
        let ctx = TransformContext::default();
        let config = json!({"conditions": [
            {"value": "trialing", "result": "in_trial"},
            {"if": "cancel_at_period_end == true", "then": "non_renewing"},
            {"default": "active"}
        ]});

        assert_eq!(
            apply_with(TransformType::Conditional, Some(json!("trialing")), config.clone(), &payloads, &ctx),
            Some(json!("in_trial"))
        );
        assert_eq!(
            apply_with(TransformType::Conditional, Some(json!("active")), config.clone(), &payloads, &ctx),
            Some(json!("non_renewing"))
        );
        assert_eq!(
            apply_with(TransformType::Conditional, Some(json!("active")), config, &[], &ctx),
            Some(json!("active"))
        );
        assert_eq!(
            apply(TransformType::Conditional, Some(json!("x")), json!({"conditions": [{"value": "y", "result": "z"}]})),
            Some(json!("x"))
        );
    }

    #[test]
    fn test_tier_mapping_bands_are_contiguous() {
        let tiers = json!([
            {"up_to": 10, "unit_amount": 1000},
            {"up_to": 50, "unit_amount": 800},
            {"up_to": null, "unit_amount": 500}
        ]);

        let bands = apply(TransformType::TierMapping, Some(tiers), json!({})).unwrap();
        assert_eq!(
            bands,
            json!([
                {"starting_unit": 1, "ending_unit": 10, "price": 1000},
                {"starting_unit": 11, "ending_unit": 50, "price": 800},
                {"starting_unit": 51, "ending_unit": "inf", "price": 500}
            ])
        );

        let bands = bands.as_array().unwrap();
        for pair in bands.windows(2) {
            let end = pair[0]["ending_unit"].as_i64().unwrap();
            assert_eq!(end + 1, pair[1]["starting_unit"].as_i64().unwrap());
        }
    }

    #[test]
    fn test_tier_mapping_rejects_malformed_tiers() {
        let f = builtin(&TransformType::TierMapping).unwrap();
        let input = json!([{"up_to": "ten"}]);
        let result = f(Some(&input), &Map::new(), &SourcePayloads::default(), &TransformContext::default());
        assert!(result.is_err());
    }

    #[test]
    fn test_sign_operators() {
        assert_eq!(apply(TransformType::NegateIfPositive, Some(json!(500)), json!({})), Some(json!(-500)));
        assert_eq!(apply(TransformType::NegateIfPositive, Some(json!(-5)), json!({})), Some(json!(-5)));
        assert_eq!(apply(TransformType::NegateIfNegative, Some(json!(-2.5)), json!({})), Some(json!(2.5)));
        assert_eq!(apply(TransformType::NegateIfNegative, Some(json!("n/a")), json!({})), Some(json!("n/a")));
    }

    #[test]
    fn test_datetime_conversions() {
        assert_eq!(
            apply(TransformType::IsoToUnix, Some(json!("2024-01-15T10:30:00Z")), json!({})),
            Some(json!(1705314600))
        );
        assert_eq!(
            apply(TransformType::IsoToUnix, Some(json!("2024-01-15")), json!({})),
            Some(json!(1705276800))
        );
        assert_eq!(apply(TransformType::IsoToUnix, Some(json!("yesterday")), json!({})), None);
        assert_eq!(
            apply(TransformType::UnixToIso, Some(json!(1705314600)), json!({})),
            Some(json!("2024-01-15T10:30:00Z"))
        );
    }

    #[test]
    fn test_unix_iso_round_trip() {
        for t in [
            0_i64,
            1,
            59,
            86_399,
            951_782_400,
            1_705_314_600,
            4_102_444_800,
            253_402_300_799,
            253_402_300_800,
            260_000_000_000,
        ] {
            let iso = apply(TransformType::UnixToIso, Some(json!(t)), json!({}));
            let back = apply(TransformType::IsoToUnix, iso, json!({}));
            assert_eq!(back, Some(json!(t)));
        }
    }

    #[test]
    fn test_numeric_scaling() {
        assert_eq!(apply(TransformType::Multiply, Some(json!(19)), json!({"multiplier": 100})), Some(json!(1900)));
        assert_eq!(apply(TransformType::Multiply, Some(json!("1.5")), json!({"multiplier": 2})), Some(json!(3.0)));
        assert_eq!(
            apply(TransformType::Multiply, Some(json!(i64::MAX)), json!({"multiplier": 2})),
            Some(json!(i64::MAX as f64 * 2.0))
        );
        assert_eq!(apply(TransformType::Divide, Some(json!(1999)), json!({"divisor": 100})), Some(json!(19.99)));
        assert_eq!(apply(TransformType::Divide, Some(json!(7)), json!({"divisor": 0})), Some(json!(7)));
    }

    #[test]
    fn test_country_code() {
        assert_eq!(apply(TransformType::CountryCode, Some(json!("de")), json!({})), Some(json!("DE")));
        assert_eq!(apply(TransformType::CountryCode, Some(json!("United Kingdom")), json!({})), Some(json!("GB")));
        assert_eq!(apply(TransformType::CountryCode, Some(json!("Atlantis")), json!({})), Some(json!("Atlantis")));
    }

    #[test]
    fn test_clean_phone() {
        assert_eq!(apply(TransformType::CleanPhone, Some(json!("(555) 123-4567")), json!({})), Some(json!("5551234567")));
        assert_eq!(apply(TransformType::CleanPhone, Some(json!("49 30 1234 5678")), json!({})), Some(json!("+493012345678")));
        assert_eq!(apply(TransformType::CleanPhone, Some(json!("n/a")), json!({})), None);
    }

    #[test]
    fn test_address_mapping_default_fields() {
        let address = json!({"line1": "1 Main St", "state": "CA", "postal_code": "94105", "extra": true});
        assert_eq!(
            apply(TransformType::AddressMapping, Some(address), json!({})),
            Some(json!({"line1": "1 Main St", "state_code": "CA", "zip": "94105"}))
        );
    }

    #[test]
    fn test_lookup_uses_context_tables() {
        let mut ctx = TransformContext::default();
        ctx.lookup_tables.insert(
            "plans".to_string(),
            vec![json!({"id": "price_1", "cb_id": "basic-USD"}), json!({"id": "price_2", "cb_id": "pro-USD"})],
        );
        let config = json!({"table": "plans", "value_field": "cb_id"});

        assert_eq!(
            apply_with(TransformType::Lookup, Some(json!("price_2")), config.clone(), &[], &ctx),
            Some(json!("pro-USD"))
        );
        assert_eq!(apply_with(TransformType::Lookup, Some(json!("price_9")), config, &[], &ctx), None);
        assert_eq!(
            apply_with(TransformType::Lookup, Some(json!("price_1")), json!({"table": "missing"}), &[], &ctx),
            None
        );
    }

    #[test]
    fn test_source_payload_resolution() {
        let stripe = json!({"email": null, "name": "Jane"});
        let sf = json!({"email": "jane@sf.com", "name": "J. Doe"});
        let payloads = SourcePayloads::new(vec![("stripe", &stripe), ("salesforce", &sf)]);

        assert_eq!(payloads.resolve("email"), Some(&json!("jane@sf.com")));
        assert_eq!(payloads.resolve("name"), Some(&json!("Jane")));
        assert_eq!(payloads.resolve("salesforce.name"), Some(&json!("J. Doe")));
        assert_eq!(payloads.resolve("stripe.email"), None);
    }
}
