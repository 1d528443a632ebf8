//! Turning a closed segment into a child record.

use crate::buffer::Segment;
use crate::catalog::{CatalogError, CatalogService};
use crate::record::{attribute, Record};
use crate::security::Subject;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument};

/// Media type of ingested segments.
pub const SEGMENT_MEDIA_ENCODING: &str = "video/mp2t";

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Segment {0} has no content")]
    EmptySegment(u64),

    #[error("Catalog rejected segment: {0}")]
    Catalog(#[from] CatalogError),
}

/// Creates one child record per segment.
#[async_trait]
pub trait SegmentIngester: Send + Sync {
    /// Store `segment` as a child of `parent`, carrying the reduced
    /// `attributes`. Returns the child as persisted.
    async fn ingest(
        &self,
        segment: &Segment,
        attributes: Record,
        parent: &Record,
        subject: Option<&Subject>,
    ) -> Result<Record, IngestError>;
}

/// Ingests segments by creating records through the catalog service.
pub struct CatalogSegmentIngester {
    catalog: Arc<dyn CatalogService>,
}

impl CatalogSegmentIngester {
    pub fn new(catalog: Arc<dyn CatalogService>) -> Self {
        Self { catalog }
    }
}

/// Build the child record for `segment` without persisting it.
pub fn child_record(
    segment: &Segment,
    mut attributes: Record,
    parent: &Record,
    subject: Option<&Subject>,
) -> Record {
    attributes.set_single(attribute::PARENT, parent.id.clone());
    attributes.set_single(attribute::SEGMENT_SEQUENCE, segment.sequence as i64);
    attributes.set_single(attribute::MEDIA_ENCODING, SEGMENT_MEDIA_ENCODING);
    if let Some(title) = parent.text(attribute::TITLE) {
        attributes.set_single(
            attribute::TITLE,
            format!("{} - {}", title, segment.sequence),
        );
    }
    if let Some(subject) = subject {
        attributes.set_single(attribute::SUBJECT, subject.principal());
    }
    attributes.set_resource(segment.data.clone());
    attributes
}

#[async_trait]
impl SegmentIngester for CatalogSegmentIngester {
    #[instrument(skip(self, segment, attributes, parent, subject), fields(sequence = segment.sequence))]
    async fn ingest(
        &self,
        segment: &Segment,
        attributes: Record,
        parent: &Record,
        subject: Option<&Subject>,
    ) -> Result<Record, IngestError> {
        if segment.is_empty() {
            return Err(IngestError::EmptySegment(segment.sequence));
        }

        let child = child_record(segment, attributes, parent, subject);
        let created = self.catalog.create(child).await?;

        debug!(
            child_id = %created.id,
            parent_id = %parent.id,
            bytes = segment.len(),
            "Segment ingested"
        );
        Ok(created)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::buffer::RotateReason;
    use crate::catalog::InMemoryCatalog;
    use bytes::Bytes;
    use tokio::time::Instant;

    pub(crate) fn create_test_segment(sequence: u64, data: &'static [u8]) -> Segment {
        let now = Instant::now();
        Segment {
            sequence,
            data: Bytes::from_static(data),
            reason: RotateReason::Size,
            started_at: now,
            closed_at: now,
        }
    }

    #[tokio::test]
    async fn test_child_links_to_parent() {
        let catalog = Arc::new(InMemoryCatalog::new());
        let ingester = CatalogSegmentIngester::new(catalog.clone());

        let mut parent = Record::with_id("parent");
        parent.set_single(attribute::TITLE, "Flight 7");

        let mut attributes = Record::new();
        attributes.set_single(attribute::MISSION_ID, "M-1");

        let subject = Subject::new("videographer@10.0.0.7");
        let child = ingester
            .ingest(
                &create_test_segment(3, b"\x47\x00\x00\x10"),
                attributes,
                &parent,
                Some(&subject),
            )
            .await
            .unwrap();

        assert_eq!(child.text(attribute::PARENT), Some("parent"));
        assert_eq!(child.text(attribute::MISSION_ID), Some("M-1"));
        assert_eq!(child.text(attribute::TITLE), Some("Flight 7 - 3"));
        assert_eq!(child.text(attribute::SUBJECT), Some("videographer@10.0.0.7"));
        assert_eq!(
            child.value(attribute::RESOURCE_SIZE).and_then(|v| v.as_f64()),
            Some(4.0)
        );
        assert!(child.created().is_some());
        assert_eq!(catalog.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_segment_rejected() {
        let catalog = Arc::new(InMemoryCatalog::new());
        let ingester = CatalogSegmentIngester::new(catalog.clone());

        let result = ingester
            .ingest(
                &create_test_segment(0, b""),
                Record::new(),
                &Record::with_id("parent"),
                None,
            )
            .await;

        assert!(matches!(result, Err(IngestError::EmptySegment(0))));
        assert!(catalog.is_empty());
    }
}
