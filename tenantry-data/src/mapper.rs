//! Conversion between typed schemas and [`Record`]s.
//!
//! `to_record` walks the serialized form of a schema. Unpopulated optional
//! fields are dropped, nested structures become nested records and any value
//! that looks like an epoch-millisecond timestamp is stored as an integer with
//! an RFC 3339 companion under `<field>_string`.
//!
//! `from_record` reverses that rule where the schema asks for it: a stamped
//! integer that the target type rejects in favour of a string is handed back
//! as its digit string, so `String` fields holding long numbers (barcodes,
//! phone numbers) survive the round trip.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::DataError;
use crate::record::{fields, Record, Value};

/// Numbers above this are treated as epoch milliseconds (2001-09-09 onward).
pub const EPOCH_MILLIS_THRESHOLD: i64 = 1_000_000_000_000;

/// Largest millisecond value chrono can represent.
const MAX_EPOCH_MILLIS: i64 = 8_210_266_876_799_999;

/// Serialize a typed schema into a record.
pub fn to_record<T: Serialize + ?Sized>(value: &T) -> Result<Record, DataError> {
    match serde_json::to_value(value).map_err(DataError::mapping)? {
        serde_json::Value::Object(map) => Ok(record_from_object(map)),
        other => Err(DataError::Mapping(format!(
            "expected a struct or map, got {other}"
        ))),
    }
}

/// Deserialize a record into a typed schema.
///
/// Fields the schema does not declare are ignored unless the schema itself
/// denies unknown fields.
pub fn from_record<T: DeserializeOwned>(record: &Record) -> Result<T, DataError> {
    let mut json = record.to_json();
    loop {
        let err = match <T as serde::Deserialize>::deserialize(&json) {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        // Each pass turns at least one number back into text, so this ends.
        match rejected_integer(&err) {
            Some(ms) if restore_digit_strings(&mut json, ms) => continue,
            _ => return Err(DataError::mapping(err)),
        }
    }
}

/// The integer named by an `invalid type: integer` error.
fn rejected_integer(err: &serde_json::Error) -> Option<i64> {
    let message = err.to_string();
    let rest = message.split("invalid type: integer `").nth(1)?;
    rest.split('`').next()?.parse().ok()
}

/// Turn stamped timestamps equal to `ms` back into digit strings.
fn restore_digit_strings(json: &mut serde_json::Value, ms: i64) -> bool {
    match json {
        serde_json::Value::Object(map) => {
            let stamped: Vec<String> = map
                .iter()
                .filter(|(k, v)| {
                    v.as_i64() == Some(ms)
                        && plausible_millis(ms).is_some()
                        && map.contains_key(&fields::string_companion(k))
                })
                .map(|(k, _)| k.clone())
                .collect();
            let mut changed = !stamped.is_empty();
            for key in stamped {
                map.insert(key, serde_json::Value::String(ms.to_string()));
            }
            for value in map.values_mut() {
                changed |= restore_digit_strings(value, ms);
            }
            changed
        }
        serde_json::Value::Array(items) => items
            .iter_mut()
            .fold(false, |changed, item| restore_digit_strings(item, ms) | changed),
        _ => false,
    }
}

fn record_from_object(map: serde_json::Map<String, serde_json::Value>) -> Record {
    let timestamps: Vec<String> = map
        .iter()
        .filter(|(k, v)| !k.ends_with(fields::STRING_SUFFIX) && epoch_millis_json(v).is_some())
        .map(|(k, _)| k.clone())
        .collect();

    let mut record = Record::new();
    for (name, json) in map {
        if json.is_null() {
            continue;
        }
        // The companion is always derived from the numeric value.
        if let Some(base) = name.strip_suffix(fields::STRING_SUFFIX) {
            if timestamps.iter().any(|t| t == base) {
                continue;
            }
        }
        if timestamps.contains(&name) {
            if let Some(ms) = epoch_millis_json(&json) {
                stamp_timestamp(&mut record, &name, ms);
                continue;
            }
        }
        record.insert(name, value_from_json(json));
    }
    record
}

fn value_from_json(json: serde_json::Value) -> Value {
    match json {
        serde_json::Value::Object(map) => Value::Record(record_from_object(map)),
        serde_json::Value::Array(items) => {
            Value::List(items.into_iter().map(value_from_json).collect())
        }
        other => Value::from_json(other),
    }
}

fn epoch_millis_json(json: &serde_json::Value) -> Option<i64> {
    match json {
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => plausible_millis(i),
            None => n.as_f64().and_then(float_millis),
        },
        serde_json::Value::String(s) => numeric_string_millis(s),
        _ => None,
    }
}

/// Interpret a value as epoch milliseconds using the timestamp heuristic.
pub fn epoch_millis_of(value: &Value) -> Option<i64> {
    match value {
        Value::Int(i) => plausible_millis(*i),
        Value::Float(f) => float_millis(*f),
        Value::String(s) => numeric_string_millis(s),
        _ => None,
    }
}

fn plausible_millis(ms: i64) -> Option<i64> {
    (ms > EPOCH_MILLIS_THRESHOLD && ms <= MAX_EPOCH_MILLIS).then_some(ms)
}

fn float_millis(f: f64) -> Option<i64> {
    if f.is_finite() && f > EPOCH_MILLIS_THRESHOLD as f64 && f <= MAX_EPOCH_MILLIS as f64 {
        Some(f as i64)
    } else {
        None
    }
}

fn numeric_string_millis(s: &str) -> Option<i64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok().and_then(plausible_millis)
}

/// Apply the timestamp rule to a record built by hand.
///
/// Top-level fields holding numeric strings or floats above the threshold
/// are rewritten as integers and get their `_string` companion.
pub fn normalize_timestamps(record: &mut Record) {
    let found: Vec<(String, i64)> = record
        .iter()
        .filter(|(k, _)| !k.ends_with(fields::STRING_SUFFIX))
        .filter_map(|(k, v)| epoch_millis_of(v).map(|ms| (k.to_string(), ms)))
        .collect();
    for (name, ms) in found {
        stamp_timestamp(record, &name, ms);
    }
}

/// Store `ms` under `field` together with its RFC 3339 companion.
pub fn stamp_timestamp(record: &mut Record, field: &str, ms: i64) {
    record.insert(field, Value::Int(ms));
    if let Ok(text) = format_millis(ms) {
        record.insert(fields::string_companion(field), Value::String(text));
    }
}

pub fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>, DataError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| DataError::Mapping(format!("timestamp out of range: {ms}")))
}

pub fn datetime_to_millis(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

/// RFC 3339 in UTC with millisecond precision, e.g. `2024-03-01T10:00:00.000Z`.
pub fn format_millis(ms: i64) -> Result<String, DataError> {
    Ok(millis_to_datetime(ms)?.to_rfc3339_opts(SecondsFormat::Millis, true))
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Serde adapter for `i64` timestamp fields that accepts numbers and numeric strings.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Customer {
///     #[serde(with = "tenantry_data::mapper::epoch_millis")]
///     date_created: i64,
/// }
/// ```
pub mod epoch_millis {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    pub(super) enum Wire {
        Int(i64),
        Float(f64),
        Text(String),
    }

    impl Wire {
        pub(super) fn into_millis<E: serde::de::Error>(self) -> Result<i64, E> {
            match self {
                Wire::Int(i) => Ok(i),
                Wire::Float(f) if f.is_finite() => Ok(f as i64),
                Wire::Float(f) => Err(E::custom(format!("invalid timestamp: {f}"))),
                Wire::Text(s) => s
                    .trim()
                    .parse()
                    .map_err(|_| E::custom(format!("invalid timestamp: {s}"))),
            }
        }
    }

    pub fn serialize<S: Serializer>(ms: &i64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(*ms)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        Wire::deserialize(deserializer)?.into_millis()
    }
}

/// Like [`epoch_millis`] for `Option<i64>` fields. Pair with `#[serde(default)]`.
pub mod optional_epoch_millis {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::epoch_millis::Wire;

    pub fn serialize<S: Serializer>(ms: &Option<i64>, serializer: S) -> Result<S::Ok, S::Error> {
        match ms {
            Some(ms) => serializer.serialize_some(ms),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
        Option::<Wire>::deserialize(deserializer)?
            .map(Wire::into_millis)
            .transpose()
    }
}
