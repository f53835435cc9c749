//! Bookkeeping fields shared by all backends.

use uuid::Uuid;

use crate::context::Context;
use crate::mapper::{normalize_timestamps, now_millis, stamp_timestamp};
use crate::record::{fields, Record, Value};

/// Prepare a record for insertion: id, `active`, tenant and both timestamps.
///
/// A caller-supplied id is kept (as a string). The context's tenant wins over
/// a `tenant_id` in the record.
pub fn prepare_insert(ctx: &Context, mut record: Record) -> Record {
    normalize_timestamps(&mut record);

    let id = match record.get(fields::ID) {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(v) if !v.is_null() && v.search_text().is_some() => v.to_string(),
        _ => Uuid::new_v4().to_string(),
    };
    record.insert(fields::ID, id);
    record.insert(fields::ACTIVE, true);
    if let Some(tenant) = ctx.tenant() {
        record.insert(fields::TENANT_ID, tenant);
    }

    let now = now_millis();
    stamp_timestamp(&mut record, fields::DATE_CREATED, now);
    stamp_timestamp(&mut record, fields::DATE_MODIFIED, now);
    record
}

/// Merge `changes` into `stored`. Protected fields in `changes` are ignored
/// and `date_modified` is restamped.
pub fn apply_update(stored: &mut Record, mut changes: Record) {
    normalize_timestamps(&mut changes);
    for (name, value) in changes {
        if fields::is_protected(&name) {
            continue;
        }
        stored.insert(name, value);
    }
    touch(stored);
}

/// Mark a record soft-deleted.
pub fn deactivate(stored: &mut Record) {
    stored.insert(fields::ACTIVE, false);
    touch(stored);
}

fn touch(stored: &mut Record) {
    let created = stored.get_i64(fields::DATE_CREATED).unwrap_or_default();
    stamp_timestamp(stored, fields::DATE_MODIFIED, now_millis().max(created));
}

/// Visibility rule: active unless `include_inactive`, and owned by the
/// context's tenant when one is set.
pub fn is_visible(ctx: &Context, record: &Record, include_inactive: bool) -> bool {
    (include_inactive || record.is_active())
        && ctx
            .tenant()
            .is_none_or(|tenant| record.tenant_id() == Some(tenant))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_assigns_bookkeeping_fields() {
        let ctx = Context::background().with_tenant("acme");
        let record = prepare_insert(&ctx, Record::new().with("name", "Ada").with("active", false));
        assert!(!record.id().unwrap().is_empty());
        assert!(record.is_active());
        assert_eq!(record.tenant_id(), Some("acme"));
        assert_eq!(
            record.get_i64(fields::DATE_CREATED),
            record.get_i64(fields::DATE_MODIFIED)
        );
        assert!(record.contains(fields::DATE_CREATED_STRING));
    }

    #[test]
    fn numeric_ids_are_kept_as_strings() {
        let record = prepare_insert(&Context::background(), Record::new().with("id", 42));
        assert_eq!(record.id(), Some("42"));
    }

    #[test]
    fn update_ignores_protected_fields() {
        let mut stored = prepare_insert(&Context::background(), Record::new().with("name", "Ada"));
        let id = stored.id().unwrap().to_string();
        let created = stored.get_i64(fields::DATE_CREATED);

        apply_update(
            &mut stored,
            Record::new()
                .with("id", "other")
                .with("active", false)
                .with("date_created", 1)
                .with("name", "Ada Lovelace"),
        );

        assert_eq!(stored.id(), Some(id.as_str()));
        assert!(stored.is_active());
        assert_eq!(stored.get_i64(fields::DATE_CREATED), created);
        assert_eq!(stored.get_str("name"), Some("Ada Lovelace"));
        assert!(stored.get_i64(fields::DATE_MODIFIED) >= created);
    }

    #[test]
    fn visibility_respects_tenant_and_active() {
        let ctx = Context::background().with_tenant("acme");
        let mut record = prepare_insert(&ctx, Record::new());
        assert!(is_visible(&ctx, &record, false));
        assert!(!is_visible(&Context::background().with_tenant("globex"), &record, false));
        assert!(is_visible(&Context::background(), &record, false));

        deactivate(&mut record);
        assert!(!is_visible(&ctx, &record, false));
        assert!(is_visible(&ctx, &record, true));
    }
}
