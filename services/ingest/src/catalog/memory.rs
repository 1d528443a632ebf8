use super::{
    CatalogError, CatalogService, QueryRequest, QueryResponse, SortOrder, Update, UpdateRequest,
    UpdateResponse,
};
use crate::record::{attribute, AttributeValue, Record};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
use tracing::debug;

/// Process-local catalog.
///
/// Records keep insertion order. Failures can be injected for the next N
/// updates or queries.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    records: RwLock<Vec<Record>>,
    failing_updates: AtomicU32,
    failing_queries: AtomicU32,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Record> {
        self.records.read().iter().find(|r| r.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn records(&self) -> Vec<Record> {
        self.records.read().clone()
    }

    /// Fail the next `count` update calls.
    pub fn fail_next_updates(&self, count: u32) {
        self.failing_updates.store(count, AtomicOrdering::SeqCst);
    }

    /// Fail the next `count` query calls.
    pub fn fail_next_queries(&self, count: u32) {
        self.failing_queries.store(count, AtomicOrdering::SeqCst);
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |n| {
                n.checked_sub(1)
            })
            .is_ok()
    }
}

fn compare_values(a: Option<&AttributeValue>, b: Option<&AttributeValue>) -> Ordering {
    match (a, b) {
        (Some(AttributeValue::Timestamp(a)), Some(AttributeValue::Timestamp(b))) => a.cmp(b),
        (Some(AttributeValue::Text(a)), Some(AttributeValue::Text(b))) => a.cmp(b),
        (Some(a), Some(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a.total_cmp(&b),
            _ => Ordering::Equal,
        },
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[async_trait]
impl CatalogService for InMemoryCatalog {
    async fn create(&self, mut record: Record) -> Result<Record, CatalogError> {
        let mut records = self.records.write();
        if records.iter().any(|r| r.id == record.id) {
            return Err(CatalogError::Rejected(format!(
                "duplicate record id {}",
                record.id
            )));
        }
        if !record.has(attribute::CREATED) {
            record.set_single(attribute::CREATED, Utc::now());
        }
        debug!(record_id = %record.id, "Record created");
        records.push(record.clone());
        Ok(record)
    }

    async fn update(&self, request: UpdateRequest) -> Result<UpdateResponse, CatalogError> {
        if Self::take_failure(&self.failing_updates) {
            return Err(CatalogError::Unavailable("injected update failure".to_string()));
        }

        let mut records = self.records.write();
        let slot = records
            .iter_mut()
            .find(|r| r.id == request.record.id)
            .ok_or_else(|| CatalogError::NotFound(request.record.id.clone()))?;

        let mut new = request.record;
        new.set_single(attribute::MODIFIED, Utc::now());
        let old = std::mem::replace(slot, new.clone());

        Ok(UpdateResponse {
            updates: vec![Update { old, new }],
        })
    }

    async fn query(&self, request: QueryRequest) -> Result<QueryResponse, CatalogError> {
        if Self::take_failure(&self.failing_queries) {
            return Err(CatalogError::Unavailable("injected query failure".to_string()));
        }

        let mut matches: Vec<Record> = self
            .records
            .read()
            .iter()
            .filter(|r| request.filter.matches(r))
            .cloned()
            .collect();

        matches.sort_by(|a, b| {
            let ordering = compare_values(a.value(&request.sort_by), b.value(&request.sort_by));
            match request.order {
                SortOrder::Ascending => ordering,
                SortOrder::Descending => ordering.reverse(),
            }
        });

        let hits = matches.len() as u64;
        let results = matches
            .into_iter()
            .skip(request.start_index.saturating_sub(1))
            .take(request.page_size)
            .collect();

        Ok(QueryResponse { hits, results })
    }
}
