use crate::record::{Record, Value};

/// A fluent, backend-neutral filter over record fields.
///
/// Backends either evaluate it in memory ([`QueryBuilder::matches`]) or
/// translate it to their native query language. Field names may be dotted
/// paths into nested records.
///
/// # Example
///
/// ```ignore
/// let q = QueryBuilder::new()
///     .where_eq("status", "open")
///     .where_like("name", "acme")
///     .order_by("date_created", false)
///     .limit(10);
/// let rows = repo.query(&ctx, &q).await?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct QueryBuilder {
    conditions: Vec<Condition>,
    order: Vec<(String, bool)>,
    limit_val: Option<u64>,
    offset_val: Option<u64>,
    include_inactive: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(String, Value),
    NotEq(String, Value),
    /// Case-insensitive substring match.
    Like(String, String),
    Gt(String, Value),
    Lt(String, Value),
    In(String, Vec<Value>),
    IsNull(String),
    IsNotNull(String),
}

impl Condition {
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Condition::Eq(field.to_string(), value.into())
    }

    pub fn field(&self) -> &str {
        match self {
            Condition::Eq(f, _)
            | Condition::NotEq(f, _)
            | Condition::Like(f, _)
            | Condition::Gt(f, _)
            | Condition::Lt(f, _)
            | Condition::In(f, _)
            | Condition::IsNull(f)
            | Condition::IsNotNull(f) => f,
        }
    }

    /// Evaluate against a record. Missing fields behave like nulls.
    pub fn matches(&self, record: &Record) -> bool {
        let value = record.get_path(self.field()).unwrap_or(&Value::Null);
        match self {
            Condition::Eq(_, expected) => value.loose_eq(expected),
            Condition::NotEq(_, expected) => !value.is_null() && !value.loose_eq(expected),
            Condition::Like(_, needle) => value
                .search_text()
                .is_some_and(|text| text.to_lowercase().contains(&needle.to_lowercase())),
            Condition::Gt(_, bound) => comparable(value, bound) && value.sort_cmp(bound).is_gt(),
            Condition::Lt(_, bound) => comparable(value, bound) && value.sort_cmp(bound).is_lt(),
            Condition::In(_, options) => options.iter().any(|o| value.loose_eq(o)),
            Condition::IsNull(_) => value.is_null(),
            Condition::IsNotNull(_) => !value.is_null(),
        }
    }
}

fn comparable(a: &Value, b: &Value) -> bool {
    matches!(
        (a, b),
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_))
            | (Value::String(_), Value::String(_))
            | (Value::Bool(_), Value::Bool(_))
    )
}

impl QueryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn where_eq(self, field: &str, value: impl Into<Value>) -> Self {
        self.condition(Condition::Eq(field.to_string(), value.into()))
    }

    pub fn where_not_eq(self, field: &str, value: impl Into<Value>) -> Self {
        self.condition(Condition::NotEq(field.to_string(), value.into()))
    }

    pub fn where_like(self, field: &str, needle: &str) -> Self {
        self.condition(Condition::Like(field.to_string(), needle.to_string()))
    }

    pub fn where_gt(self, field: &str, value: impl Into<Value>) -> Self {
        self.condition(Condition::Gt(field.to_string(), value.into()))
    }

    pub fn where_lt(self, field: &str, value: impl Into<Value>) -> Self {
        self.condition(Condition::Lt(field.to_string(), value.into()))
    }

    pub fn where_in<V: Into<Value>>(self, field: &str, values: impl IntoIterator<Item = V>) -> Self {
        self.condition(Condition::In(
            field.to_string(),
            values.into_iter().map(Into::into).collect(),
        ))
    }

    pub fn where_null(self, field: &str) -> Self {
        self.condition(Condition::IsNull(field.to_string()))
    }

    pub fn where_not_null(self, field: &str) -> Self {
        self.condition(Condition::IsNotNull(field.to_string()))
    }

    pub fn order_by(mut self, field: &str, ascending: bool) -> Self {
        self.order.push((field.to_string(), ascending));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit_val = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset_val = Some(offset);
        self
    }

    /// Also return soft-deleted records.
    pub fn include_inactive(mut self) -> Self {
        self.include_inactive = true;
        self
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn order(&self) -> &[(String, bool)] {
        &self.order
    }

    pub fn limit_value(&self) -> Option<u64> {
        self.limit_val
    }

    pub fn offset_value(&self) -> Option<u64> {
        self.offset_val
    }

    pub fn includes_inactive(&self) -> bool {
        self.include_inactive
    }

    /// `true` when every condition holds. Visibility rules are left to the backend.
    pub fn matches(&self, record: &Record) -> bool {
        self.conditions.iter().all(|c| c.matches(record))
    }

    /// Reject field names that are not plain (optionally dotted) identifiers.
    pub fn validate(&self) -> Result<(), QueryError> {
        let fields = self
            .conditions
            .iter()
            .map(Condition::field)
            .chain(self.order.iter().map(|(f, _)| f.as_str()));
        for field in fields {
            check_identifier(field, "field")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum QueryError {
    InvalidIdentifier { kind: &'static str, ident: String },
}

impl std::fmt::Display for QueryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryError::InvalidIdentifier { kind, ident } => {
                write!(f, "Invalid {kind} identifier: {ident}")
            }
        }
    }
}

impl std::error::Error for QueryError {}

impl From<QueryError> for crate::error::DataError {
    fn from(err: QueryError) -> Self {
        crate::error::DataError::Other(err.to_string())
    }
}

pub fn check_identifier(ident: &str, kind: &'static str) -> Result<(), QueryError> {
    if is_valid_identifier(ident) {
        Ok(())
    } else {
        Err(QueryError::InvalidIdentifier {
            kind,
            ident: ident.to_string(),
        })
    }
}

/// Dotted identifiers such as `address.city`.
pub fn is_valid_identifier(ident: &str) -> bool {
    !ident.is_empty() && ident.split('.').all(is_valid_segment)
}

fn is_valid_segment(segment: &str) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
