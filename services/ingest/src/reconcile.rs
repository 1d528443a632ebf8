//! Parent/child reconciliation.
//!
//! A pass runs only when the stream context says the parent is stale. It
//! pages through every child of the parent in creation order, folds each
//! page into a set of [`UpdateField`]s, commits them onto the parent and
//! submits the parent with retry. Any failure leaves the parent marked
//! stale so the next pass starts over.

use crate::catalog::{
    CatalogError, CatalogService, Filter, QueryRequest, SortOrder, UpdateRequest,
};
use crate::config::ReconcileConfig;
use crate::context::StreamContext;
use crate::geometry::algorithm::merge_footprints;
use crate::geometry::{parse_wkt, Coordinate, Geometry, GeometryContext, GeometryOperator};
use crate::record::{attribute, AttributeValue, Record, RecordId};
use crate::retry::{submit_update_with_retry, RetryPolicy};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Unable to query children of {parent_id}: {source}")]
    Query {
        parent_id: RecordId,
        #[source]
        source: CatalogError,
    },

    #[error("Unable to update parent {parent_id}: {source}")]
    Update {
        parent_id: RecordId,
        #[source]
        source: CatalogError,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// The parent was up to date
    Skipped,
    /// The parent was rewritten; carries the persisted version
    Updated(Record),
    /// The update was interrupted before it could be submitted
    Abandoned,
}

/// Folds batches of children into one parent attribute.
pub trait UpdateField: Send {
    /// Accumulate one batch of children, in creation order.
    fn handle(&mut self, children: &[Record]);

    /// Commit the accumulated value onto `parent`. Called once per pass.
    fn end(&mut self, parent: &mut Record);
}

/// Builds the fresh update fields used by one reconciliation pass.
pub trait UpdateFieldFactory: Send + Sync {
    fn build(&self) -> Box<dyn UpdateField>;
}

/// Distinct values of one attribute across the parent and all children.
#[derive(Debug, Clone)]
pub struct UnionField {
    attribute: &'static str,
    values: Vec<AttributeValue>,
}

impl UnionField {
    pub fn new(attribute: &'static str) -> Self {
        Self {
            attribute,
            values: Vec::new(),
        }
    }
}

impl UpdateField for UnionField {
    fn handle(&mut self, children: &[Record]) {
        for value in children.iter().flat_map(|c| c.values(self.attribute)) {
            if !self.values.contains(value) {
                self.values.push(value.clone());
            }
        }
    }

    fn end(&mut self, parent: &mut Record) {
        let mut merged: Vec<AttributeValue> = parent.values(self.attribute).to_vec();
        for value in self.values.drain(..) {
            if !merged.contains(&value) {
                merged.push(value);
            }
        }
        if !merged.is_empty() {
            parent.set(self.attribute, merged);
        }
    }
}

fn geometry_of(record: &Record, name: &str) -> Option<Geometry> {
    let wkt = record.text(name)?;
    match parse_wkt(wkt) {
        Ok(geometry) => Some(geometry),
        Err(e) => {
            trace!(record_id = %record.id, attribute = name, error = %e, "Ignoring unparsable geometry");
            None
        }
    }
}

/// Links every child found by association into the parent's derived list.
#[derive(Debug, Clone, Default)]
pub struct DerivedField {
    children: Vec<RecordId>,
}

impl UpdateField for DerivedField {
    fn handle(&mut self, children: &[Record]) {
        self.children.extend(children.iter().map(|c| c.id.clone()));
    }

    fn end(&mut self, parent: &mut Record) {
        for id in self.children.drain(..) {
            parent.add_distinct(attribute::DERIVED, id);
        }
    }
}

/// Joins the children's frame-center tracks into one track.
#[derive(Debug, Clone)]
pub struct FrameCenterField {
    operator: GeometryOperator,
    context: GeometryContext,
    track: Vec<Coordinate>,
}

impl FrameCenterField {
    pub fn new(operator: GeometryOperator, context: GeometryContext) -> Self {
        Self {
            operator,
            context,
            track: Vec::new(),
        }
    }
}

impl UpdateField for FrameCenterField {
    fn handle(&mut self, children: &[Record]) {
        for geometry in children
            .iter()
            .filter_map(|c| geometry_of(c, attribute::FRAME_CENTER))
        {
            match geometry {
                Geometry::Point(_) | Geometry::LineString(_) => {
                    self.track.extend(geometry.coordinates())
                }
                _ => trace!("Ignoring non-linear frame center"),
            }
        }
    }

    fn end(&mut self, parent: &mut Record) {
        if self.track.is_empty() {
            return;
        }
        let track = Geometry::path(std::mem::take(&mut self.track));
        if let Some(reduced) = self.operator.apply(Some(track), &self.context) {
            parent.set_single(attribute::FRAME_CENTER, reduced.to_wkt());
        }
    }
}

/// Merges child footprints into the parent footprint.
#[derive(Debug, Clone)]
pub struct LocationField {
    child_operator: GeometryOperator,
    operator: GeometryOperator,
    context: GeometryContext,
    footprints: Vec<Geometry>,
}

impl LocationField {
    pub fn new(
        child_operator: GeometryOperator,
        operator: GeometryOperator,
        context: GeometryContext,
    ) -> Self {
        Self {
            child_operator,
            operator,
            context,
            footprints: Vec::new(),
        }
    }
}

impl UpdateField for LocationField {
    fn handle(&mut self, children: &[Record]) {
        for child in children {
            let footprint = self
                .child_operator
                .apply(geometry_of(child, attribute::LOCATION), &self.context);
            self.footprints.extend(footprint);
        }
    }

    fn end(&mut self, parent: &mut Record) {
        if self.footprints.is_empty() {
            return;
        }
        let mut footprints = std::mem::take(&mut self.footprints);
        footprints.extend(geometry_of(parent, attribute::LOCATION));

        let merged = self.operator.apply(merge_footprints(&footprints), &self.context);
        if let Some(merged) = merged {
            parent.set_single(attribute::LOCATION, merged.to_wkt());
        }
    }
}

/// Widens the parent's time span to cover every child.
#[derive(Debug, Clone, Default)]
pub struct TemporalField {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

fn earliest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn latest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

fn timestamp(record: &Record, name: &str) -> Option<DateTime<Utc>> {
    record.value(name).and_then(AttributeValue::as_timestamp)
}

impl UpdateField for TemporalField {
    fn handle(&mut self, children: &[Record]) {
        for child in children {
            self.start = earliest(self.start, timestamp(child, attribute::TEMPORAL_START));
            self.end = latest(self.end, timestamp(child, attribute::TEMPORAL_END));
        }
    }

    fn end(&mut self, parent: &mut Record) {
        if let Some(start) = earliest(self.start, timestamp(parent, attribute::TEMPORAL_START)) {
            parent.set_single(attribute::TEMPORAL_START, start);
        }
        if let Some(end) = latest(self.end, timestamp(parent, attribute::TEMPORAL_END)) {
            parent.set_single(attribute::TEMPORAL_END, end);
        }
    }
}

/// Fans every call out to each member in order.
#[derive(Default)]
pub struct UpdateFieldList {
    fields: Vec<Box<dyn UpdateField>>,
}

impl UpdateFieldList {
    pub fn new(fields: Vec<Box<dyn UpdateField>>) -> Self {
        Self { fields }
    }
}

impl UpdateField for UpdateFieldList {
    fn handle(&mut self, children: &[Record]) {
        for field in &mut self.fields {
            field.handle(children);
        }
    }

    fn end(&mut self, parent: &mut Record) {
        for field in &mut self.fields {
            field.end(parent);
        }
    }
}

/// The parent attributes maintained for every stream.
#[derive(Debug, Clone)]
pub struct StandardUpdateFields {
    pub operator: GeometryOperator,
    pub context: GeometryContext,
}

impl UpdateFieldFactory for StandardUpdateFields {
    fn build(&self) -> Box<dyn UpdateField> {
        Box::new(UpdateFieldList::new(vec![
            Box::new(DerivedField::default()),
            Box::new(UnionField::new(attribute::CLASSIFYING_COUNTRY)),
            Box::new(UnionField::new(attribute::MEDIA_ENCODING)),
            Box::new(FrameCenterField::new(
                self.operator.clone(),
                self.context.clone(),
            )),
            Box::new(LocationField::new(
                GeometryOperator::Identity,
                GeometryOperator::Identity,
                self.context.clone(),
            )),
            Box::new(TemporalField::default()),
        ]))
    }
}

/// Every record that is a child of `parent`, by association or by the
/// parent's derived links.
pub fn children_filter(parent: &Record) -> Filter {
    let mut filters = vec![Filter::AssociatedWith(parent.id.clone())];
    filters.extend(
        parent
            .values(attribute::DERIVED)
            .iter()
            .filter_map(AttributeValue::as_str)
            .map(|id| Filter::IdEquals(id.to_string())),
    );
    Filter::AnyOf(filters)
}

pub struct Reconciler {
    catalog: Arc<dyn CatalogService>,
    factory: Arc<dyn UpdateFieldFactory>,
    batch_size: usize,
    max_query_errors: u32,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl Reconciler {
    pub fn new(
        catalog: Arc<dyn CatalogService>,
        factory: Arc<dyn UpdateFieldFactory>,
        config: &ReconcileConfig,
        policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            catalog,
            factory,
            batch_size: config.batch_size.max(1),
            max_query_errors: config.max_query_errors.max(1),
            policy,
            cancel,
        }
    }

    /// Bring the parent in `context` up to date with its children.
    #[instrument(skip(self, context), fields(stream = %context.title()))]
    pub async fn reconcile(
        &self,
        context: &StreamContext,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let Some(mut parent) = context.take_dirty_parent() else {
            debug!("Parent is up to date, skipping reconciliation");
            return Ok(ReconcileOutcome::Skipped);
        };

        let mut field = self.factory.build();
        let children = match self.fold_children(&parent, field.as_mut()).await {
            Ok(children) => children,
            Err(e) => {
                context.mark_dirty();
                return Err(e);
            }
        };
        field.end(&mut parent);

        let parent_id = parent.id.clone();
        let result = submit_update_with_retry(
            self.catalog.as_ref(),
            UpdateRequest { record: parent },
            &self.policy,
            &self.cancel,
            |response| {
                if let Some(updated) = response.updated() {
                    context.refresh_parent(updated.clone());
                }
            },
        )
        .await;

        match result {
            Ok(Some(response)) => {
                info!(parent_id = %parent_id, children, "Parent reconciled");
                let updated = response
                    .updated()
                    .cloned()
                    .or_else(|| context.parent())
                    .unwrap_or_else(|| Record::with_id(parent_id));
                Ok(ReconcileOutcome::Updated(updated))
            }
            Ok(None) => {
                context.mark_dirty();
                debug!(parent_id = %parent_id, "Reconciliation interrupted");
                Ok(ReconcileOutcome::Abandoned)
            }
            Err(source) => {
                context.mark_dirty();
                Err(ReconcileError::Update { parent_id, source })
            }
        }
    }

    /// Page through the children of `parent`, oldest first. Returns the
    /// number of children folded.
    async fn fold_children(
        &self,
        parent: &Record,
        field: &mut dyn UpdateField,
    ) -> Result<usize, ReconcileError> {
        let filter = children_filter(parent);
        let mut start_index = 1usize;
        let mut expected_hits: Option<u64> = None;
        let mut consecutive_errors = 0u32;
        let mut folded = 0usize;

        loop {
            let request = QueryRequest {
                filter: filter.clone(),
                start_index,
                page_size: self.batch_size,
                sort_by: attribute::CREATED.to_string(),
                order: SortOrder::Ascending,
            };

            match self.catalog.query(request).await {
                Ok(response) => {
                    consecutive_errors = 0;
                    let hits = *expected_hits.get_or_insert(response.hits);
                    if response.results.is_empty() {
                        break;
                    }

                    field.handle(&response.results);
                    folded += response.results.len();
                    start_index += response.results.len();

                    if start_index as u64 > hits {
                        break;
                    }
                }
                Err(source) => {
                    consecutive_errors += 1;
                    warn!(
                        parent_id = %parent.id,
                        start_index,
                        errors = consecutive_errors,
                        error = %source,
                        "Child query failed"
                    );
                    if consecutive_errors >= self.max_query_errors {
                        return Err(ReconcileError::Query {
                            parent_id: parent.id.clone(),
                            source,
                        });
                    }
                }
            }
        }

        Ok(folded)
    }
}
