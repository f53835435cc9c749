use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::backend::Repository;
use crate::context::Context;
use crate::error::DataError;
use crate::mapper::from_record;
use crate::page::{ListParams, Page, DEFAULT_PAGE_SIZE};
use crate::query::QueryBuilder;
use crate::record::{fields, Record, Value};

/// Copy fields from a related entity onto each listed record.
///
/// Behaves like a left outer join on `local_field = related.id`: records
/// whose reference is missing or points at an inactive row get nulls.
#[derive(Clone)]
pub struct Enrichment {
    local_field: String,
    related: Arc<dyn Repository>,
    /// `(field on the related record, field written on the listed record)`
    fields: Vec<(String, String)>,
}

impl Enrichment {
    pub fn new(local_field: &str, related: Arc<dyn Repository>) -> Self {
        Self {
            local_field: local_field.to_string(),
            related,
            fields: Vec::new(),
        }
    }

    /// Copy `source` from the related record into `target`.
    pub fn field(mut self, source: &str, target: &str) -> Self {
        self.fields.push((source.to_string(), target.to_string()));
        self
    }

    /// One batched lookup for all references on the page.
    async fn apply(&self, ctx: &Context, items: &mut [Record]) -> Result<(), DataError> {
        let mut ids: Vec<String> = items
            .iter()
            .filter_map(|r| r.get(&self.local_field))
            .filter(|v| !v.is_null())
            .map(Value::to_string)
            .collect();
        ids.sort_unstable();
        ids.dedup();

        let related: HashMap<String, Record> = if ids.is_empty() {
            HashMap::new()
        } else {
            let query = QueryBuilder::new().where_in(fields::ID, ids);
            self.related
                .query(ctx, &query)
                .await?
                .into_iter()
                .filter_map(|r| r.id().map(str::to_string).map(|id| (id, r)))
                .collect()
        };
        tracing::trace!(
            entity = self.related.entity(),
            found = related.len(),
            "Enriched page"
        );

        for item in items.iter_mut() {
            let target = item
                .get(&self.local_field)
                .filter(|v| !v.is_null())
                .and_then(|v| related.get(&v.to_string()));
            for (source, dest) in &self.fields {
                let value = target
                    .and_then(|r| r.get(source))
                    .cloned()
                    .unwrap_or(Value::Null);
                item.insert(dest.clone(), value);
            }
        }
        Ok(())
    }
}

/// A paged list request with optional enrichments.
///
/// ```ignore
/// let page = PageQuery::new(ListParams::new().search("acme").page(2))
///     .enrich(Enrichment::new("customer_id", customers).field("name", "customer_name"))
///     .fetch(&ctx, invoices.as_ref())
///     .await?;
/// ```
#[derive(Clone, Default)]
pub struct PageQuery {
    params: ListParams,
    enrichments: Vec<Enrichment>,
    default_page_size: Option<u64>,
}

impl PageQuery {
    pub fn new(params: ListParams) -> Self {
        Self {
            params,
            ..Self::default()
        }
    }

    pub fn enrich(mut self, enrichment: Enrichment) -> Self {
        self.enrichments.push(enrichment);
        self
    }

    /// Page size used when the request does not specify one.
    pub fn default_page_size(mut self, size: u64) -> Self {
        self.default_page_size = Some(size);
        self
    }

    pub fn params(&self) -> ListParams {
        self.params
            .normalized_with(self.default_page_size.unwrap_or(DEFAULT_PAGE_SIZE))
    }

    pub async fn fetch(&self, ctx: &Context, repo: &dyn Repository) -> Result<Page<Record>, DataError> {
        let params = self.params();
        let (mut items, total) = repo.list(ctx, &params).await?;
        for enrichment in &self.enrichments {
            enrichment.apply(ctx, &mut items).await?;
        }
        tracing::debug!(
            entity = repo.entity(),
            page = params.page,
            returned = items.len(),
            total,
            "Listed page"
        );
        Ok(Page::new(items, &params, total))
    }

    /// Fetch and decode every item into `T`.
    pub async fn fetch_as<T: DeserializeOwned>(
        &self,
        ctx: &Context,
        repo: &dyn Repository,
    ) -> Result<Page<T>, DataError> {
        self.fetch(ctx, repo).await?.try_map(|r| from_record(&r))
    }
}
