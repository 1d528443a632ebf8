//! Rollover coordination: a bounded worker pool plus the action each
//! closed segment goes through (ensure parent, ingest child, link child).

use crate::buffer::Segment;
use crate::catalog::{CatalogError, CatalogService, UpdateRequest};
use crate::context::StreamContext;
use crate::ingest::{IngestError, SegmentIngester};
use crate::record::{attribute, Record};
use crate::retry::{submit_update_with_retry, RetryPolicy};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Error)]
pub enum RolloverError {
    #[error("Rollover pool is not running")]
    PoolClosed,

    #[error("Unable to create parent record: {0}")]
    ParentCreation(#[source] CatalogError),

    #[error("Unable to link child {child_id} to parent: {source}")]
    ParentUpdate {
        child_id: String,
        #[source]
        source: CatalogError,
    },

    #[error("Segment ingestion failed: {0}")]
    Ingest(#[from] IngestError),

    #[error("Rollover task failed: {0}")]
    Task(String),
}

/// Bounded pool running rollover work off the decode path.
///
/// `submit` waits for a free worker, then returns as soon as the task is
/// spawned. `shutdown` refuses new work and waits for in-flight tasks.
#[derive(Debug)]
pub struct RolloverPool {
    workers: Arc<Semaphore>,
    closed: AtomicBool,
    size: usize,
}

impl RolloverPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            workers: Arc::new(Semaphore::new(size)),
            closed: AtomicBool::new(false),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of tasks currently holding a worker.
    pub fn active(&self) -> usize {
        self.size - self.workers.available_permits()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn submit<F>(&self, task: F) -> Result<JoinHandle<F::Output>, RolloverError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.is_closed() {
            return Err(RolloverError::PoolClosed);
        }
        let permit = self
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RolloverError::PoolClosed)?;

        Ok(tokio::spawn(async move {
            let _permit = permit;
            task.await
        }))
    }

    /// Submissions already waiting for a worker still run; the semaphore
    /// queue is fair, so they are ahead of the drain.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(in_flight = self.active(), "Waiting for rollover tasks");
        let drained = self.workers.acquire_many(self.size as u32).await;
        self.workers.close();
        drop(drained);
    }
}

/// The work done for one closed segment.
#[derive(Clone)]
pub struct RolloverAction {
    context: Arc<StreamContext>,
    catalog: Arc<dyn CatalogService>,
    ingester: Arc<dyn SegmentIngester>,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl RolloverAction {
    pub fn new(
        context: Arc<StreamContext>,
        catalog: Arc<dyn CatalogService>,
        ingester: Arc<dyn SegmentIngester>,
        policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            context,
            catalog,
            ingester,
            policy,
            cancel,
        }
    }

    /// Ingest `segment` as a child of the stream's parent, creating the
    /// parent first if needed. Returns the child record.
    #[instrument(skip(self, segment, attributes), fields(sequence = segment.sequence, reason = ?segment.reason))]
    pub async fn execute(
        &self,
        segment: Segment,
        attributes: Record,
    ) -> Result<Record, RolloverError> {
        let parent = self.ensure_parent().await?;
        let subject = self.context.subject();

        let child = self
            .ingester
            .ingest(&segment, attributes, &parent, subject.as_ref())
            .await?;

        self.link_child(&child).await?;
        Ok(child)
    }

    async fn ensure_parent(&self) -> Result<Record, RolloverError> {
        if let Some(parent) = self.context.parent() {
            return Ok(parent);
        }

        let _creating = self.context.lock_creation().await;
        if let Some(parent) = self.context.parent() {
            return Ok(parent);
        }

        let mut parent = Record::new();
        parent.set_single(attribute::TITLE, self.context.title());
        if let Some(subject) = self.context.subject() {
            parent.set_single(attribute::SUBJECT, subject.principal());
        }

        let parent = self
            .catalog
            .create(parent)
            .await
            .map_err(RolloverError::ParentCreation)?;

        info!(parent_id = %parent.id, title = %self.context.title(), "Parent record created");
        self.context.set_parent(parent.clone());
        Ok(parent)
    }

    /// Add the child to the parent's derived links. No lock is held across
    /// the update; a link lost to a concurrent update is restored by the
    /// next reconciliation, which finds children by association.
    async fn link_child(&self, child: &Record) -> Result<(), RolloverError> {
        let Some(parent) = self.context.add_derived(&child.id) else {
            warn!(child_id = %child.id, "Parent disappeared before child could be linked");
            self.context.mark_dirty();
            return Ok(());
        };

        let context = &self.context;
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

        // The parent is stale whether or not the link made it.
        self.context.mark_dirty();

        match result {
            Ok(Some(_)) => {
                debug!(child_id = %child.id, "Child linked to parent");
                Ok(())
            }
            Ok(None) => {
                debug!(child_id = %child.id, "Child link interrupted");
                Ok(())
            }
            Err(source) => Err(RolloverError::ParentUpdate {
                child_id: child.id.clone(),
                source,
            }),
        }
    }
}
