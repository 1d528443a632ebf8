//! Catalog service boundary.
//!
//! The ingest pipeline only needs create, update and paged query. The
//! in-memory implementation backs the binary and the tests.

pub mod memory;

pub use memory::InMemoryCatalog;

use crate::record::{Record, RecordId};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("Catalog source unavailable: {0}")]
    Unavailable(String),

    #[error("Record not found: {0}")]
    NotFound(RecordId),

    #[error("Ingest rejected: {0}")]
    Rejected(String),
}

/// Query predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// Record identifier equals the given id
    IdEquals(RecordId),
    /// Record's parent association points at the given id
    AssociatedWith(RecordId),
    /// Any of the nested filters matches; an empty list matches nothing
    AnyOf(Vec<Filter>),
}

impl Filter {
    pub fn matches(&self, record: &Record) -> bool {
        use crate::record::attribute;
        match self {
            Filter::IdEquals(id) => record.id == *id,
            Filter::AssociatedWith(parent) => record.text(attribute::PARENT) == Some(parent.as_str()),
            Filter::AnyOf(filters) => filters.iter().any(|f| f.matches(record)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// A page request. `start_index` is 1-based.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub filter: Filter,
    pub start_index: usize,
    pub page_size: usize,
    pub sort_by: String,
    pub order: SortOrder,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryResponse {
    /// Total matches across all pages
    pub hits: u64,
    pub results: Vec<Record>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateRequest {
    pub record: Record,
}

/// Before and after state of one updated record.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub old: Record,
    pub new: Record,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateResponse {
    pub updates: Vec<Update>,
}

impl UpdateResponse {
    /// The persisted version of the first updated record.
    pub fn updated(&self) -> Option<&Record> {
        self.updates.first().map(|u| &u.new)
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CatalogService: Send + Sync {
    /// Persist a new record and return it as stored.
    async fn create(&self, record: Record) -> Result<Record, CatalogError>;

    /// Replace the stored record with the same id.
    async fn update(&self, request: UpdateRequest) -> Result<UpdateResponse, CatalogError>;

    async fn query(&self, request: QueryRequest) -> Result<QueryResponse, CatalogError>;
}
