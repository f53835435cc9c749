use serde::{Deserialize, Serialize};

use crate::query::Condition;
use crate::record::{fields, Record};

pub const DEFAULT_PAGE_SIZE: u64 = 50;
pub const MAX_PAGE_SIZE: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    pub field: String,
    pub direction: SortDirection,
}

impl Sort {
    pub fn asc(field: &str) -> Self {
        Self {
            field: field.to_string(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(field: &str) -> Self {
        Self {
            field: field.to_string(),
            direction: SortDirection::Desc,
        }
    }

    pub fn is_ascending(&self) -> bool {
        self.direction == SortDirection::Asc
    }
}

impl Default for Sort {
    fn default() -> Self {
        Sort::desc(fields::DATE_CREATED)
    }
}

/// Parameters of a list request.
///
/// `page` is 1-based. Zero or negative `page`/`page_size` mean "unspecified";
/// [`ListParams::normalized`] applies the defaults.
#[derive(Debug, Clone, Default)]
pub struct ListParams {
    pub search: Option<String>,
    /// Fields the search term is matched against. Repositories fill this in
    /// from their registration when it is empty.
    pub search_fields: Vec<String>,
    pub filters: Vec<Condition>,
    pub sort: Option<Sort>,
    pub page: i64,
    pub page_size: i64,
    pub include_inactive: bool,
}

impl ListParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn search(mut self, term: &str) -> Self {
        self.search = Some(term.to_string());
        self
    }

    pub fn filter(mut self, condition: Condition) -> Self {
        self.filters.push(condition);
        self
    }

    pub fn sort(mut self, sort: Sort) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn page(mut self, page: i64) -> Self {
        self.page = page;
        self
    }

    pub fn page_size(mut self, page_size: i64) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn include_inactive(mut self) -> Self {
        self.include_inactive = true;
        self
    }

    /// Apply defaults: page 1, page size 50 capped at 1000, newest first,
    /// and drop blank search terms.
    pub fn normalized(&self) -> ListParams {
        self.normalized_with(DEFAULT_PAGE_SIZE)
    }

    /// Like [`normalized`](Self::normalized) with a configured default page size.
    pub fn normalized_with(&self, default_page_size: u64) -> ListParams {
        let default_page_size = default_page_size.clamp(1, MAX_PAGE_SIZE) as i64;
        let page_size = match self.page_size {
            n if n <= 0 => default_page_size,
            n => n.min(MAX_PAGE_SIZE as i64),
        };
        let mut params = self.clone();
        params.page = self.page.max(1);
        params.page_size = page_size;
        params.sort = Some(self.sort.clone().unwrap_or_default());
        params.search = self
            .search
            .as_deref()
            .map(str::trim)
            .filter(|term| !term.is_empty())
            .map(str::to_string);
        params
    }

    /// Number of records skipped before this page. Expects normalized params.
    ///
    /// Saturates at `i64::MAX`, so a page far past the end is simply empty.
    pub fn offset(&self) -> u64 {
        let skipped_pages = (self.page.max(1) - 1) as u64;
        skipped_pages
            .saturating_mul(self.limit())
            .min(i64::MAX as u64)
    }

    pub fn limit(&self) -> u64 {
        self.page_size.max(1) as u64
    }

    /// Search and filter predicate shared by in-memory evaluation.
    pub fn matches(&self, record: &Record) -> bool {
        self.filters.iter().all(|c| c.matches(record)) && self.matches_search(record)
    }

    fn matches_search(&self, record: &Record) -> bool {
        let Some(term) = self.search.as_deref() else {
            return true;
        };
        let term = term.to_lowercase();
        self.search_fields.iter().any(|field| {
            record
                .get_path(field)
                .and_then(|v| v.search_text())
                .is_some_and(|text| text.to_lowercase().contains(&term))
        })
    }
}

/// A page of results with pagination metadata.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total_count: u64,
    pub page: u64,
    pub page_size: u64,
    pub total_pages: u64,
    pub has_next: bool,
    pub has_prev: bool,
}

impl<T> Page<T> {
    /// `params` must be normalized.
    pub fn new(items: Vec<T>, params: &ListParams, total_count: u64) -> Self {
        let page = params.page.max(1) as u64;
        let page_size = params.limit();
        let total_pages = total_count.div_ceil(page_size);
        Self {
            items,
            total_count,
            page,
            page_size,
            total_pages,
            has_next: page < total_pages,
            has_prev: page > 1,
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total_count: self.total_count,
            page: self.page,
            page_size: self.page_size,
            total_pages: self.total_pages,
            has_next: self.has_next,
            has_prev: self.has_prev,
        }
    }

    pub fn try_map<U, E>(self, f: impl FnMut(T) -> Result<U, E>) -> Result<Page<U>, E> {
        let items = self.items.into_iter().map(f).collect::<Result<Vec<_>, E>>()?;
        Ok(Page {
            items,
            total_count: self.total_count,
            page: self.page,
            page_size: self.page_size,
            total_pages: self.total_pages,
            has_next: self.has_next,
            has_prev: self.has_prev,
        })
    }
}
