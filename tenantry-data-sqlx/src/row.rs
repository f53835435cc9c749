use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row, TypeInfo, ValueRef};
use tenantry_data::mapper::{datetime_to_millis, millis_to_datetime, stamp_timestamp};
use tenantry_data::record::fields;
use tenantry_data::{DataError, Record, Value};

use crate::error::SqlxErrorExt;

/// Column values of one entity row.
pub(crate) struct EntityRow {
    pub id: String,
    pub tenant_id: Option<String>,
    pub active: bool,
    pub date_created: DateTime<Utc>,
    pub date_modified: DateTime<Utc>,
    pub data: String,
}

impl EntityRow {
    /// Split a prepared record into columns and the JSON document.
    pub fn from_record(record: &Record) -> Result<Self, DataError> {
        let id = record
            .id()
            .ok_or_else(|| DataError::Mapping("record has no id".into()))?
            .to_string();
        let time = |name: &str| -> Result<DateTime<Utc>, DataError> {
            let ms = record
                .get_i64(name)
                .ok_or_else(|| DataError::Mapping(format!("record has no {name}")))?;
            millis_to_datetime(ms)
        };
        let document: Record = record
            .iter()
            .filter(|(k, _)| !fields::is_protected(k))
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        Ok(Self {
            id,
            tenant_id: record.tenant_id().map(str::to_string),
            active: record.is_active(),
            date_created: time(fields::DATE_CREATED)?,
            date_modified: time(fields::DATE_MODIFIED)?,
            data: document.to_json().to_string(),
        })
    }

    pub fn decode(row: &SqliteRow) -> Result<Self, DataError> {
        let get_err = <sqlx::Error as SqlxErrorExt>::into_data_error;
        Ok(Self {
            id: row.try_get("id").map_err(get_err)?,
            tenant_id: row.try_get("tenant_id").map_err(get_err)?,
            active: row.try_get("active").map_err(get_err)?,
            date_created: row.try_get("date_created").map_err(get_err)?,
            date_modified: row.try_get("date_modified").map_err(get_err)?,
            data: row.try_get("data").map_err(get_err)?,
        })
    }

    pub fn into_record(self) -> Result<Record, DataError> {
        let document: serde_json::Value =
            serde_json::from_str(&self.data).map_err(SqlxErrorExt::into_data_error)?;
        let mut record = Record::new().with(fields::ID, self.id);
        for (name, value) in Record::from_json(document)? {
            record.insert(name, value);
        }
        if let Some(tenant) = self.tenant_id {
            record.insert(fields::TENANT_ID, tenant);
        }
        record.insert(fields::ACTIVE, self.active);
        stamp_timestamp(
            &mut record,
            fields::DATE_CREATED,
            datetime_to_millis(&self.date_created),
        );
        stamp_timestamp(
            &mut record,
            fields::DATE_MODIFIED,
            datetime_to_millis(&self.date_modified),
        );
        Ok(record)
    }
}

/// Decode an arbitrary result row, column by column.
pub(crate) fn dynamic_record(row: &SqliteRow) -> Result<Record, DataError> {
    let mut record = Record::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(idx).map_err(SqlxErrorExt::into_data_error)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            let type_name = raw.type_info().name().to_ascii_uppercase();
            match type_name.as_str() {
                "INTEGER" | "INT" | "BIGINT" | "BOOLEAN" => {
                    Value::Int(row.try_get_unchecked::<i64, _>(idx).map_err(SqlxErrorExt::into_data_error)?)
                }
                "REAL" | "FLOAT" | "DOUBLE" | "NUMERIC" => {
                    Value::Float(row.try_get_unchecked::<f64, _>(idx).map_err(SqlxErrorExt::into_data_error)?)
                }
                "BLOB" => {
                    let bytes: Vec<u8> = row
                        .try_get_unchecked(idx)
                        .map_err(SqlxErrorExt::into_data_error)?;
                    Value::String(String::from_utf8_lossy(&bytes).into_owned())
                }
                _ => Value::String(
                    row.try_get_unchecked::<String, _>(idx)
                        .map_err(SqlxErrorExt::into_data_error)?,
                ),
            }
        };
        record.insert(column.name(), value);
    }
    Ok(record)
}
