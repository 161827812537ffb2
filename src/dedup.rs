use serde_json::Value;
use std::collections::HashMap;

use crate::field_path::value_to_string;
use crate::record::TransformedRecord;

const METADATA_KEY: &str = "meta_data";

/// Collapse records sharing the same lower-cased `key_field` value.
///
/// The first record seen for a key holds its position in the output. A later
/// duplicate from `preferred_source` replaces it unless the holder already came
/// from that source. The surviving record takes over the loser's `meta_data`
/// keys it does not already have, along with its source references. Records
/// without a key value are always kept.
pub fn deduplicate(
    records: Vec<TransformedRecord>,
    key_field: &str,
    preferred_source: &str,
) -> Vec<TransformedRecord> {
    let mut kept: Vec<TransformedRecord> = Vec::with_capacity(records.len());
    let mut positions: HashMap<String, usize> = HashMap::new();

    for record in records {
        let Some(key) = dedup_key(&record, key_field) else {
            kept.push(record);
            continue;
        };

        match positions.get(&key) {
            None => {
                positions.insert(key, kept.len());
                kept.push(record);
            }
            Some(&index) => {
                let existing = &kept[index];
                let replace = !preferred_source.is_empty()
                    && is_from(&record, preferred_source)
                    && !is_from(existing, preferred_source);

                if replace {
                    let loser = std::mem::replace(&mut kept[index], record);
                    absorb(&mut kept[index], loser);
                } else {
                    absorb(&mut kept[index], record);
                }
            }
        }
    }

    kept
}

fn dedup_key(record: &TransformedRecord, key_field: &str) -> Option<String> {
    let key = value_to_string(record.get_field(key_field)?).trim().to_lowercase();
    (!key.is_empty()).then_some(key)
}

fn is_from(record: &TransformedRecord, service: &str) -> bool {
    record.primary_source_service() == Some(service)
}

fn absorb(winner: &mut TransformedRecord, loser: TransformedRecord) {
    if let Some(Value::Object(loser_meta)) = loser.data.get(METADATA_KEY) {
        match winner.data.get_mut(METADATA_KEY) {
            Some(Value::Object(winner_meta)) => {
                for (key, value) in loser_meta {
                    winner_meta.entry(key.clone()).or_insert_with(|| value.clone());
                }
            }
            None => {
                winner
                    .data
                    .insert(METADATA_KEY.to_string(), Value::Object(loser_meta.clone()));
            }
            Some(_) => {}
        }
    }

    for source in loser.source_records {
        if !winner.source_records.contains(&source) {
            winner.source_records.push(source);
        }
    }
}
