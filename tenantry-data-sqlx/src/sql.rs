//! SQL text for the entity table layout.
//!
//! Every entity lives in its own table:
//!
//! ```sql
//! id TEXT PRIMARY KEY, tenant_id TEXT, active INTEGER,
//! date_created TEXT, date_modified TEXT, data TEXT  -- JSON document
//! ```
//!
//! Bookkeeping fields map to columns, everything else is reached through
//! `json_extract(data, '$.path')`.

use chrono::{DateTime, Utc};
use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;
use sqlx::Sqlite;
use tenantry_data::mapper::{epoch_millis_of, millis_to_datetime};
use tenantry_data::query::{check_identifier, Condition, QueryError};
use tenantry_data::record::fields;
use tenantry_data::{DataError, Value};

pub(crate) const COLUMNS: &str = "id, tenant_id, active, date_created, date_modified, data";

/// A bound parameter.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Bind {
    Text(String),
    Int(i64),
    Float(f64),
    Time(DateTime<Utc>),
    Null,
}

pub(crate) fn bind_all<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    binds: &'q [Bind],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for bind in binds {
        query = match bind {
            Bind::Text(s) => query.bind(s.as_str()),
            Bind::Int(i) => query.bind(*i),
            Bind::Float(f) => query.bind(*f),
            Bind::Time(t) => query.bind(*t),
            Bind::Null => query.bind(Option::<String>::None),
        };
    }
    query
}

/// Validate and quote a table name. Only single identifiers are accepted.
pub(crate) fn table_ident(name: &str) -> Result<String, DataError> {
    check_identifier(name, "table")?;
    if name.contains('.') {
        return Err(QueryError::InvalidIdentifier {
            kind: "table",
            ident: name.to_string(),
        }
        .into());
    }
    Ok(format!("\"{name}\""))
}

pub(crate) fn create_table(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS \"{table}\" (\
            id TEXT PRIMARY KEY NOT NULL, \
            tenant_id TEXT, \
            active INTEGER NOT NULL DEFAULT 1, \
            date_created TEXT NOT NULL, \
            date_modified TEXT NOT NULL, \
            data TEXT NOT NULL DEFAULT '{{}}')"
    )
}

pub(crate) fn create_index(table: &str) -> String {
    format!(
        "CREATE INDEX IF NOT EXISTS \"{table}_tenant_active\" ON \"{table}\" (tenant_id, active)"
    )
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Kind {
    Text,
    Active,
    Time,
    Json,
}

struct Field {
    expr: String,
    kind: Kind,
    /// `json_type(...)` expression for JSON fields.
    json_type: Option<String>,
}

fn field(name: &str) -> Result<Field, DataError> {
    check_identifier(name, "field")?;
    let column = |expr: &str, kind| Field {
        expr: expr.to_string(),
        kind,
        json_type: None,
    };
    Ok(match name {
        fields::ID => column("id", Kind::Text),
        fields::TENANT_ID => column("tenant_id", Kind::Text),
        fields::ACTIVE => column("active", Kind::Active),
        fields::DATE_CREATED => column("date_created", Kind::Time),
        fields::DATE_MODIFIED => column("date_modified", Kind::Time),
        // Companions are not stored; render the column as `format_millis` does.
        fields::DATE_CREATED_STRING => column(&companion_expr("date_created"), Kind::Text),
        fields::DATE_MODIFIED_STRING => column(&companion_expr("date_modified"), Kind::Text),
        path => Field {
            expr: format!("json_extract(data, '$.{path}')"),
            kind: Kind::Json,
            json_type: Some(format!("json_type(data, '$.{path}')")),
        },
    })
}

fn companion_expr(column: &str) -> String {
    format!("strftime('%Y-%m-%dT%H:%M:%fZ', {column})")
}

fn bind_for(field: &Field, value: &Value) -> Result<Bind, DataError> {
    Ok(match (field.kind, value) {
        (Kind::Time, v) => match epoch_millis_of(v).or_else(|| v.as_i64()) {
            Some(ms) => Bind::Time(millis_to_datetime(ms)?),
            None => match v.as_str().map(DateTime::parse_from_rfc3339) {
                Some(Ok(dt)) => Bind::Time(dt.with_timezone(&Utc)),
                _ => return Err(DataError::Mapping(format!("not a timestamp: {v}"))),
            },
        },
        (_, Value::Bool(b)) => Bind::Int(i64::from(*b)),
        (_, Value::Int(i)) => Bind::Int(*i),
        (_, Value::Float(f)) => Bind::Float(*f),
        (_, Value::String(s)) => Bind::Text(s.clone()),
        (_, other) => Bind::Text(other.to_json().to_string()),
    })
}

/// Type guard keeping range comparisons between like types, as SQLite
/// orders every number below every string.
fn type_guard(field: &Field, value: &Value) -> Option<String> {
    let json_type = field.json_type.as_ref()?;
    match value {
        Value::Int(_) | Value::Float(_) => Some(format!("{json_type} IN ('integer', 'real')")),
        Value::String(_) => Some(format!("{json_type} = 'text'")),
        _ => None,
    }
}

fn like_pattern(needle: &str) -> String {
    let mut out = String::with_capacity(needle.len() + 2);
    out.push('%');
    for c in needle.to_lowercase().chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

fn like_clause(expr: &str) -> String {
    format!("LOWER(CAST({expr} AS TEXT)) LIKE ? ESCAPE '\\'")
}

/// Accumulates `WHERE` predicates and their binds.
#[derive(Debug, Default)]
pub(crate) struct Filter {
    clauses: Vec<String>,
    pub(crate) binds: Vec<Bind>,
}

impl Filter {
    /// Visibility predicates: active rows and the context's tenant.
    pub(crate) fn visible(tenant: Option<&str>, include_inactive: bool) -> Self {
        let mut filter = Filter::default();
        if !include_inactive {
            filter.clauses.push("active = 1".into());
        }
        if let Some(tenant) = tenant {
            filter.clauses.push("tenant_id = ?".into());
            filter.binds.push(Bind::Text(tenant.to_string()));
        }
        filter
    }

    pub(crate) fn id(mut self, id: &str) -> Self {
        self.clauses.push("id = ?".into());
        self.binds.push(Bind::Text(id.to_string()));
        self
    }

    pub(crate) fn condition(&mut self, condition: &Condition) -> Result<(), DataError> {
        let f = field(condition.field())?;
        let expr = f.expr.clone();
        let clause = match condition {
            Condition::Eq(_, Value::Null) | Condition::IsNull(_) => format!("{expr} IS NULL"),
            Condition::NotEq(_, Value::Null) | Condition::IsNotNull(_) => {
                format!("{expr} IS NOT NULL")
            }
            Condition::Eq(_, v) => {
                self.binds.push(bind_for(&f, v)?);
                format!("{expr} = ?")
            }
            Condition::NotEq(_, v) => {
                self.binds.push(bind_for(&f, v)?);
                format!("{expr} != ?")
            }
            Condition::Like(_, needle) => {
                self.binds.push(Bind::Text(like_pattern(needle)));
                like_clause(&expr)
            }
            Condition::Gt(_, v) | Condition::Lt(_, v) => {
                let op = if matches!(condition, Condition::Gt(..)) { ">" } else { "<" };
                self.binds.push(bind_for(&f, v)?);
                match type_guard(&f, v) {
                    Some(guard) => format!("({guard} AND {expr} {op} ?)"),
                    None => format!("{expr} {op} ?"),
                }
            }
            Condition::In(_, values) if values.is_empty() => "0 = 1".to_string(),
            Condition::In(_, values) => {
                for v in values {
                    self.binds.push(bind_for(&f, v)?);
                }
                let placeholders = vec!["?"; values.len()].join(", ");
                format!("{expr} IN ({placeholders})")
            }
        };
        self.clauses.push(clause);
        Ok(())
    }

    pub(crate) fn conditions(&mut self, conditions: &[Condition]) -> Result<(), DataError> {
        conditions.iter().try_for_each(|c| self.condition(c))
    }

    /// Case-insensitive substring search over `search_fields`.
    pub(crate) fn search(&mut self, term: &str, search_fields: &[String]) -> Result<(), DataError> {
        if search_fields.is_empty() {
            self.clauses.push("0 = 1".into());
            return Ok(());
        }
        let mut alternatives = Vec::with_capacity(search_fields.len());
        for name in search_fields {
            let f = field(name)?;
            alternatives.push(like_clause(&f.expr));
            self.binds.push(Bind::Text(like_pattern(term)));
        }
        self.clauses.push(format!("({})", alternatives.join(" OR ")));
        Ok(())
    }

    pub(crate) fn to_sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }
}

/// `ORDER BY` over the given keys with `id` as tie-breaker. Without keys,
/// rows come back in insertion order.
pub(crate) fn order_by(order: &[(String, bool)]) -> Result<String, DataError> {
    if order.is_empty() {
        return Ok(" ORDER BY rowid ASC".into());
    }
    let mut clauses = Vec::with_capacity(order.len() + 1);
    for (name, ascending) in order {
        let f = field(name)?;
        clauses.push(format!("{} {}", f.expr, if *ascending { "ASC" } else { "DESC" }));
    }
    clauses.push("id ASC".into());
    Ok(format!(" ORDER BY {}", clauses.join(", ")))
}

pub(crate) fn limit_offset(limit: Option<u64>, offset: Option<u64>) -> String {
    match (limit, offset) {
        (None, None) => String::new(),
        (Some(limit), None) => format!(" LIMIT {limit}"),
        (limit, Some(offset)) => format!(
            " LIMIT {} OFFSET {offset}",
            limit.map_or(-1, |l| l.min(i64::MAX as u64) as i64)
        ),
    }
}

#[cfg(test)]
mod tests {
    use tenantry_data::QueryBuilder;

    use super::*;

    #[test]
    fn test_visibility_and_conditions() {
        let q = QueryBuilder::new()
            .where_eq("status", "open")
            .where_gt("amount", 100)
            .where_in("id", ["a", "b"]);
        let mut filter = Filter::visible(Some("acme"), false);
        filter.conditions(q.conditions()).unwrap();
        assert_eq!(
            filter.to_sql(),
            " WHERE active = 1 AND tenant_id = ? \
             AND json_extract(data, '$.status') = ? \
             AND (json_type(data, '$.amount') IN ('integer', 'real') AND json_extract(data, '$.amount') > ?) \
             AND id IN (?, ?)"
        );
        assert_eq!(
            filter.binds,
            vec![
                Bind::Text("acme".into()),
                Bind::Text("open".into()),
                Bind::Int(100),
                Bind::Text("a".into()),
                Bind::Text("b".into()),
            ]
        );
    }

    #[test]
    fn test_timestamp_columns_bind_datetimes() {
        let mut filter = Filter::default();
        filter
            .condition(&Condition::Gt("date_created".into(), Value::Int(1_709_287_200_000)))
            .unwrap();
        assert_eq!(filter.to_sql(), " WHERE date_created > ?");
        assert!(matches!(filter.binds[0], Bind::Time(_)));
    }

    #[test]
    fn test_timestamp_companions_render_their_column() {
        let mut filter = Filter::default();
        filter
            .condition(&Condition::Eq(
                "date_created_string".into(),
                Value::from("2024-03-01T10:00:00.000Z"),
            ))
            .unwrap();
        assert_eq!(
            filter.to_sql(),
            " WHERE strftime('%Y-%m-%dT%H:%M:%fZ', date_created) = ?"
        );
        assert_eq!(filter.binds, vec![Bind::Text("2024-03-01T10:00:00.000Z".into())]);
        assert_eq!(
            order_by(&[("date_modified_string".into(), true)]).unwrap(),
            " ORDER BY strftime('%Y-%m-%dT%H:%M:%fZ', date_modified) ASC, id ASC"
        );
    }

    #[test]
    fn test_search_escapes_wildcards() {
        let mut filter = Filter::visible(None, true);
        filter.search("50%_off", &["name".into(), "code".into()]).unwrap();
        assert_eq!(
            filter.to_sql(),
            " WHERE (LOWER(CAST(json_extract(data, '$.name') AS TEXT)) LIKE ? ESCAPE '\\' \
             OR LOWER(CAST(json_extract(data, '$.code') AS TEXT)) LIKE ? ESCAPE '\\')"
        );
        assert_eq!(filter.binds[0], Bind::Text("%50\\%\\_off%".into()));
    }

    #[test]
    fn test_invalid_names_are_rejected() {
        assert!(table_ident("customers; drop").is_err());
        assert!(table_ident("main.customers").is_err());
        assert_eq!(table_ident("customers").unwrap(), "\"customers\"");
        let mut filter = Filter::default();
        assert!(filter.condition(&Condition::IsNull("a') or 1=1 --".into())).is_err());
    }

    #[test]
    fn test_order_and_paging() {
        assert_eq!(
            order_by(&[("amount".into(), false)]).unwrap(),
            " ORDER BY json_extract(data, '$.amount') DESC, id ASC"
        );
        assert_eq!(order_by(&[]).unwrap(), " ORDER BY rowid ASC");
        assert_eq!(limit_offset(Some(50), Some(100)), " LIMIT 50 OFFSET 100");
        assert_eq!(limit_offset(None, Some(5)), " LIMIT -1 OFFSET 5");
    }
}
