use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

static INDEXED_SEGMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\w+)\[(\d+)\]$").expect("indexed segment pattern"));

#[derive(Debug, Error, PartialEq)]
pub enum PathError {
    #[error("Empty field path")]
    EmptyPath,

    #[error("Cannot write '{path}': '{segment}' is not an object")]
    NotAnObject { path: String, segment: String },

    #[error("Cannot write '{path}': '{segment}' is not an array")]
    NotAnArray { path: String, segment: String },
}

/// Resolve a dot-notation path inside a payload.
///
/// Segments may address array elements either as `items[0]` or as a bare
/// numeric segment (`items.0`). A JSON `null` is treated as absent.
pub fn lookup<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return None;
    }

    let mut current = data;
    for segment in path.split('.') {
        current = step(current, segment)?;
    }

    if current.is_null() {
        None
    } else {
        Some(current)
    }
}

fn step<'a>(current: &'a Value, segment: &str) -> Option<&'a Value> {
    if let Some(caps) = INDEXED_SEGMENT.captures(segment) {
        let index: usize = caps[2].parse().ok()?;
        return current.get(&caps[1])?.get(index);
    }

    match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}

/// Write `value` at a dot-notation path, creating intermediate objects as needed.
///
/// An `items[2]` segment writes into an array, padding it with `null` up to
/// the index.
pub fn set_path(target: &mut Map<String, Value>, path: &str, value: Value) -> Result<(), PathError> {
    if path.is_empty() {
        return Err(PathError::EmptyPath);
    }

    let segments: Vec<&str> = path.split('.').collect();
    let (last, parents) = segments.split_last().ok_or(PathError::EmptyPath)?;

    let mut current = target;
    for segment in parents {
        let slot = slot_mut(current, segment, path)?;
        if slot.is_null() {
            *slot = Value::Object(Map::new());
        }
        current = match slot {
            Value::Object(map) => map,
            _ => {
                return Err(PathError::NotAnObject {
                    path: path.to_string(),
                    segment: segment.to_string(),
                })
            }
        };
    }

    *slot_mut(current, last, path)? = value;
    Ok(())
}

/// The value a single segment addresses inside `map`, created as `null` when missing
fn slot_mut<'a>(
    map: &'a mut Map<String, Value>,
    segment: &str,
    path: &str,
) -> Result<&'a mut Value, PathError> {
    let indexed = INDEXED_SEGMENT
        .captures(segment)
        .and_then(|caps| Some((caps.get(1)?.as_str(), caps[2].parse::<usize>().ok()?)));
    let Some((name, index)) = indexed else {
        return Ok(map.entry(segment.to_string()).or_insert(Value::Null));
    };

    let entry = map
        .entry(name.to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    if entry.is_null() {
        *entry = Value::Array(Vec::new());
    }
    match entry {
        Value::Array(items) => {
            if items.len() <= index {
                items.resize(index + 1, Value::Null);
            }
            Ok(&mut items[index])
        }
        _ => Err(PathError::NotAnArray {
            path: path.to_string(),
            segment: name.to_string(),
        }),
    }
}

/// First segment of a dot path, with any `[index]` suffix removed
pub fn root_segment(path: &str) -> &str {
    let root = path.split('.').next().unwrap_or(path);
    match root.find('[') {
        Some(pos) => &root[..pos],
        None => root,
    }
}

/// Render a scalar the way it would appear in a document, without JSON quoting
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
