//! Per-stream datagram processing.
//!
//! Datagrams are framed into transport packets, mirrored into the packet
//! buffer and fed to the metadata decoder under one decode lock. Segments
//! the buffer closes are handed to the rollover pool after the lock is
//! released, so decoding never waits on catalog I/O.

use crate::buffer::{PacketBuffer, RolloverLimits, Segment};
use crate::catalog::CatalogService;
use crate::config::{IngestConfig, ReconcileConfig};
use crate::context::StreamContext;
use crate::geometry::{GeometryContext, GeometryOperator};
use crate::ingest::SegmentIngester;
use crate::klv::{DecodeError, MetadataDecoder, MetadataSet};
use crate::lifecycle::{LifecycleChain, StreamCreationError, StreamShutdownError};
use crate::reconcile::{Reconciler, StandardUpdateFields};
use crate::record::Record;
use crate::reduce::AttributePipeline;
use crate::retry::RetryPolicy;
use crate::rollover::{RolloverAction, RolloverError, RolloverPool};
use crate::security::SubjectProvider;
use crate::ts::FrameSynchronizer;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Runtime settings for one stream.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub title: String,
    pub limits: RolloverLimits,
    pub idle_check_interval: Duration,
    pub pool_size: usize,
    pub geometry: GeometryContext,
    pub retry: RetryPolicy,
    pub reconcile: ReconcileConfig,
}

impl From<&IngestConfig> for StreamSettings {
    fn from(config: &IngestConfig) -> Self {
        Self {
            title: config.stream.title.clone(),
            limits: RolloverLimits::from(&config.rollover),
            idle_check_interval: config.rollover.idle_check_interval(),
            pool_size: config.rollover.worker_pool_size,
            geometry: GeometryContext {
                subsample_count: Some(config.geometry.subsample_count),
                distance_tolerance: config.geometry.distance_tolerance,
            },
            retry: RetryPolicy::from(&config.retry),
            reconcile: config.reconcile.clone(),
        }
    }
}

/// Statistics for one stream.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    pub datagrams: u64,
    pub bytes_received: u64,
    pub packets: u64,
    pub bytes_discarded: u64,
    pub parse_failures: u64,
    pub metadata_sets: u64,
    pub metadata_errors: u64,
    pub rollovers: u64,
    pub children_created: u64,
    pub rollover_failures: u64,
    pub reconciliations: u64,
}

/// Everything the decode lock guards.
struct DecodeState {
    synchronizer: FrameSynchronizer,
    decoder: MetadataDecoder,
    buffer: PacketBuffer,
    pipeline: AttributePipeline,
}

/// A closed segment with the attributes reduced from its metadata.
type PendingRollover = (Segment, Record);

impl DecodeState {
    fn new(limits: RolloverLimits) -> Self {
        Self {
            synchronizer: FrameSynchronizer::new(),
            decoder: MetadataDecoder::new(),
            buffer: PacketBuffer::new(limits),
            pipeline: AttributePipeline::standard(GeometryOperator::standard()),
        }
    }

    fn observe(&mut self, results: Vec<Result<MetadataSet, DecodeError>>, delta: &mut StreamStats) {
        for result in results {
            match result {
                Ok(set) => {
                    self.pipeline.observe(&set);
                    delta.metadata_sets += 1;
                }
                Err(e) => {
                    debug!(error = %e, "Dropping metadata access unit");
                    delta.metadata_errors += 1;
                }
            }
        }
    }

    fn close(&mut self, segment: Segment, geometry: &GeometryContext) -> PendingRollover {
        let attributes = self.pipeline.drain(geometry);
        (segment, attributes)
    }
}

pub struct StreamProcessor {
    settings: StreamSettings,
    context: Arc<StreamContext>,
    decode: Mutex<DecodeState>,
    stats: RwLock<StreamStats>,
    pool: RwLock<Option<Arc<RolloverPool>>>,
    action: RolloverAction,
    lifecycle: LifecycleChain,
    subjects: Arc<dyn SubjectProvider>,
    abort: CancellationToken,
    running: AtomicBool,
}

impl StreamProcessor {
    /// Build a stream with the standard lifecycle hooks.
    pub fn standard(
        settings: StreamSettings,
        catalog: Arc<dyn CatalogService>,
        ingester: Arc<dyn SegmentIngester>,
        subjects: Arc<dyn SubjectProvider>,
    ) -> Arc<Self> {
        let abort = CancellationToken::new();
        let factory = StandardUpdateFields {
            operator: GeometryOperator::standard(),
            context: settings.geometry.clone(),
        };
        let reconciler = Reconciler::new(
            catalog.clone(),
            Arc::new(factory),
            &settings.reconcile,
            settings.retry,
            abort.clone(),
        );
        let lifecycle = LifecycleChain::standard(settings.pool_size, Arc::new(reconciler));
        Self::new(settings, catalog, ingester, subjects, lifecycle, abort)
    }

    pub fn new(
        settings: StreamSettings,
        catalog: Arc<dyn CatalogService>,
        ingester: Arc<dyn SegmentIngester>,
        subjects: Arc<dyn SubjectProvider>,
        lifecycle: LifecycleChain,
        abort: CancellationToken,
    ) -> Arc<Self> {
        let context = Arc::new(StreamContext::new(settings.title.clone()));
        let action = RolloverAction::new(
            context.clone(),
            catalog,
            ingester,
            settings.retry,
            abort.clone(),
        );

        Arc::new(Self {
            decode: Mutex::new(DecodeState::new(settings.limits)),
            settings,
            context,
            stats: RwLock::new(StreamStats::default()),
            pool: RwLock::new(None),
            action,
            lifecycle,
            subjects,
            abort,
            running: AtomicBool::new(false),
        })
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    pub fn context(&self) -> &StreamContext {
        &self.context
    }

    pub fn stats(&self) -> StreamStats {
        self.stats.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Token that interrupts retry sleeps when cancelled. Graceful shutdown
    /// leaves it alone.
    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    pub fn pool(&self) -> Option<Arc<RolloverPool>> {
        self.pool.read().clone()
    }

    /// Install the rollover pool. Returns false if one is already present.
    pub fn install_pool(&self, pool: RolloverPool) -> bool {
        let mut slot = self.pool.write();
        if slot.is_some() {
            return false;
        }
        *slot = Some(Arc::new(pool));
        true
    }

    pub(crate) fn record_reconciliation(&self) {
        self.stats.write().reconciliations += 1;
    }

    /// Run the creation hooks and start accepting datagrams.
    pub async fn start(self: &Arc<Self>) -> Result<(), StreamCreationError> {
        self.lifecycle.run_creation(self).await?;
        self.running.store(true, Ordering::SeqCst);
        info!(stream = %self.settings.title, "Stream started");
        Ok(())
    }

    /// Decode one datagram and dispatch any segments it closes.
    pub async fn handle_datagram(self: &Arc<Self>, sender: SocketAddr, datagram: &[u8]) {
        if !self.is_running() {
            trace!(bytes = datagram.len(), "Stream not running, datagram dropped");
            return;
        }

        if self.context.subject().is_none() {
            let subject = self.subjects.subject_for(sender);
            if self.context.set_subject_if_absent(subject.clone()) {
                info!(stream = %self.settings.title, %sender, %subject, "Stream subject resolved");
            }
        }

        let pending = self.decode(datagram);
        for (segment, attributes) in pending {
            self.dispatch(segment, attributes).await;
        }
    }

    fn decode(&self, datagram: &[u8]) -> Vec<PendingRollover> {
        let mut delta = StreamStats {
            datagrams: 1,
            bytes_received: datagram.len() as u64,
            ..Default::default()
        };
        let mut pending = Vec::new();

        let sync_stats = {
            let mut state = self.decode.lock();
            let now = Instant::now();

            for synced in state.synchronizer.push(datagram) {
                let results = state.decoder.push(&synced.packet);
                state.observe(results, &mut delta);
                if let Some(segment) = state.buffer.write_at(&synced.raw, now) {
                    pending.push(state.close(segment, &self.settings.geometry));
                }
            }
            state.synchronizer.stats()
        };

        delta.packets = sync_stats.packets;
        delta.bytes_discarded = sync_stats.bytes_discarded;
        delta.parse_failures = sync_stats.parse_failures;
        self.absorb(&delta);

        pending
    }

    /// Add decode counters; framing counters are cumulative and replaced.
    fn absorb(&self, delta: &StreamStats) {
        let mut stats = self.stats.write();
        stats.datagrams += delta.datagrams;
        stats.bytes_received += delta.bytes_received;
        stats.metadata_sets += delta.metadata_sets;
        stats.metadata_errors += delta.metadata_errors;
        if delta.packets > 0 {
            stats.packets = delta.packets;
            stats.bytes_discarded = delta.bytes_discarded;
            stats.parse_failures = delta.parse_failures;
        }
    }

    /// Close the segment if the stream has been idle long enough. A segment
    /// closed this way also ends the stream once it is ingested.
    pub async fn check_idle(self: &Arc<Self>) {
        let mut delta = StreamStats::default();
        let pending = {
            let mut state = self.decode.lock();
            match state.buffer.check_idle() {
                Some(segment) => {
                    let results = state.decoder.flush();
                    state.observe(results, &mut delta);
                    Some(state.close(segment, &self.settings.geometry))
                }
                None => None,
            }
        };
        self.absorb(&delta);

        if let Some((segment, attributes)) = pending {
            info!(stream = %self.settings.title, sequence = segment.sequence, "Stream idle, closing segment");
            self.dispatch(segment, attributes).await;
        }
    }

    /// Close whatever is buffered, ingest it and wait for the result.
    pub async fn flush(self: &Arc<Self>) -> Result<Option<Record>, RolloverError> {
        let mut delta = StreamStats::default();
        let pending = {
            let mut state = self.decode.lock();
            let results = state.decoder.flush();
            state.observe(results, &mut delta);
            match state.buffer.flush_and_rotate() {
                Some(segment) => Some(state.close(segment, &self.settings.geometry)),
                None => None,
            }
        };
        self.absorb(&delta);

        let Some((segment, attributes)) = pending else {
            debug!(stream = %self.settings.title, "Nothing buffered to flush");
            return Ok(None);
        };

        let handle = self.submit_rollover(segment, attributes).await?;
        match handle.await {
            Ok(Ok(child)) => Ok(Some(child)),
            Ok(Err(e)) => {
                warn!(error = %e, "Final rollover failed");
                Ok(None)
            }
            Err(e) => Err(RolloverError::Task(e.to_string())),
        }
    }

    async fn dispatch(self: &Arc<Self>, segment: Segment, attributes: Record) {
        let sequence = segment.sequence;
        if let Err(e) = self.submit_rollover(segment, attributes).await {
            warn!(sequence, error = %e, "Unable to schedule rollover, segment dropped");
            self.stats.write().rollover_failures += 1;
        }
    }

    /// Hand a closed segment to the rollover pool.
    pub async fn submit_rollover(
        self: &Arc<Self>,
        segment: Segment,
        attributes: Record,
    ) -> Result<JoinHandle<Result<Record, RolloverError>>, RolloverError> {
        let pool = self.pool().ok_or(RolloverError::PoolClosed)?;
        debug!(
            sequence = segment.sequence,
            bytes = segment.len(),
            reason = ?segment.reason,
            "Submitting rollover"
        );

        let stream = Arc::clone(self);
        let handle = pool
            .submit(async move { stream.run_rollover(segment, attributes).await })
            .await?;
        self.stats.write().rollovers += 1;
        Ok(handle)
    }

    async fn run_rollover(
        self: Arc<Self>,
        segment: Segment,
        attributes: Record,
    ) -> Result<Record, RolloverError> {
        let ends_stream = segment.is_timeout();
        let result = self.action.execute(segment, attributes).await;

        match &result {
            Ok(_) => self.stats.write().children_created += 1,
            Err(e) => {
                warn!(error = %e, "Rollover failed");
                self.stats.write().rollover_failures += 1;
            }
        }

        if ends_stream {
            self.lifecycle.run_stream_end(&self).await;
        }
        result
    }

    /// Stop accepting datagrams, drain the stream and reconcile the parent.
    pub async fn shutdown(self: &Arc<Self>) -> Result<(), StreamShutdownError> {
        self.running.store(false, Ordering::SeqCst);
        info!(stream = %self.settings.title, "Stream shutting down");

        let result = self.lifecycle.run_shutdown(self).await;
        self.lifecycle.run_stream_end(self).await;
        result
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::catalog::InMemoryCatalog;
    use crate::ingest::CatalogSegmentIngester;
    use crate::klv::decoder::tests::metadata_transport_stream;
    use crate::klv::local_set::tests::encode_local_set;
    use crate::record::attribute;
    use crate::security::AddressSubjectProvider;
    use crate::ts::packet::tests::build_packet;

    pub(crate) fn create_test_settings() -> StreamSettings {
        StreamSettings {
            title: "Test Stream".to_string(),
            limits: RolloverLimits {
                max_bytes: 1024 * 1024,
                max_duration: Duration::from_secs(3600),
                idle_timeout: Duration::from_millis(100),
            },
            idle_check_interval: Duration::from_millis(10),
            pool_size: 2,
            geometry: GeometryContext {
                subsample_count: Some(1000),
                distance_tolerance: None,
            },
            retry: RetryPolicy {
                initial_delay: Duration::ZERO,
                initial_wait: Duration::from_millis(10),
                max_wait: Duration::from_millis(100),
            },
            reconcile: ReconcileConfig::default(),
        }
    }

    pub(crate) fn create_test_processor(
        settings: StreamSettings,
    ) -> (Arc<StreamProcessor>, Arc<InMemoryCatalog>) {
        let catalog = Arc::new(InMemoryCatalog::new());
        let processor = StreamProcessor::standard(
            settings,
            catalog.clone(),
            Arc::new(CatalogSegmentIngester::new(catalog.clone())),
            Arc::new(AddressSubjectProvider::default()),
        );
        (processor, catalog)
    }

    fn sender() -> SocketAddr {
        "10.0.0.7:5000".parse().unwrap()
    }

    fn mission_klv(mission: &str) -> Vec<u8> {
        encode_local_set(&[(3, mission.as_bytes().to_vec())])
    }

    #[tokio::test]
    async fn test_datagrams_ignored_before_start() {
        let (processor, _catalog) = create_test_processor(create_test_settings());
        processor
            .handle_datagram(sender(), &build_packet(0x100, true, 0, &[0u8; 10]))
            .await;
        assert_eq!(processor.stats().datagrams, 0);
    }

    #[tokio::test]
    async fn test_decode_counts_packets_and_metadata() {
        let (processor, _catalog) = create_test_processor(create_test_settings());
        processor.start().await.unwrap();

        let mut datagram = vec![0xAA, 0xBB];
        datagram.extend(metadata_transport_stream(&[mission_klv("M-1")]));
        processor.handle_datagram(sender(), &datagram).await;

        let stats = processor.stats();
        assert_eq!(stats.datagrams, 1);
        assert_eq!(stats.bytes_discarded, 2);
        assert_eq!(stats.packets, 3);
        assert_eq!(stats.metadata_sets, 1);
        assert_eq!(stats.rollovers, 0);
        assert_eq!(
            processor.context().subject().unwrap().principal(),
            "videographer@10.0.0.7"
        );
    }

    #[tokio::test]
    async fn test_oversized_klv_length_does_not_stop_decoding() {
        let (processor, _catalog) = create_test_processor(create_test_settings());
        processor.start().await.unwrap();

        let mut corrupt = crate::klv::local_set::UAS_LOCAL_SET_KEY.to_vec();
        corrupt.push(0x88);
        corrupt.extend_from_slice(&[0xFF; 8]);

        let stream = metadata_transport_stream(&[corrupt, mission_klv("M-2")]);
        processor.handle_datagram(sender(), &stream).await;

        let stats = processor.stats();
        assert!(processor.is_running());
        assert_eq!(stats.packets, 4);
        assert_eq!(stats.metadata_errors, 1);
        assert_eq!(stats.metadata_sets, 1);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_and_reconciles() {
        let (processor, catalog) = create_test_processor(create_test_settings());
        processor.start().await.unwrap();

        let stream = metadata_transport_stream(&[mission_klv("M-1")]);
        processor.handle_datagram(sender(), &stream).await;
        processor.shutdown().await.unwrap();

        let stats = processor.stats();
        assert_eq!(stats.rollovers, 1);
        assert_eq!(stats.children_created, 1);
        assert_eq!(stats.reconciliations, 1);

        let parent = processor.context().parent().unwrap();
        assert!(!processor.context().is_dirty());
        assert_eq!(catalog.len(), 2);

        let child = catalog
            .records()
            .into_iter()
            .find(|r| r.id != parent.id)
            .unwrap();
        assert_eq!(child.text(attribute::MISSION_ID), Some("M-1"));
        assert_eq!(child.text(attribute::PARENT), Some(parent.id.as_str()));
        assert_eq!(child.resource().map(|r| r.len()), Some(stream.len()));
        assert_eq!(parent.text(attribute::MEDIA_ENCODING), Some("video/mp2t"));
        assert!(processor.pool().unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_size_rollover_dispatched() {
        let mut settings = create_test_settings();
        settings.limits.max_bytes = 188 * 2;
        let (processor, catalog) = create_test_processor(settings);
        processor.start().await.unwrap();

        let mut datagram = Vec::new();
        for counter in 0..5u8 {
            datagram.extend(build_packet(0x100, false, counter, &[0u8; 20]));
        }
        processor.handle_datagram(sender(), &datagram).await;
        assert_eq!(processor.stats().rollovers, 2);

        processor.shutdown().await.unwrap();
        let stats = processor.stats();
        assert_eq!(stats.rollovers, 3);
        assert_eq!(stats.children_created, 3);
        assert_eq!(catalog.len(), 4);
        assert_eq!(
            processor
                .context()
                .parent()
                .unwrap()
                .values(attribute::DERIVED)
                .len(),
            3
        );
    }

    #[tokio::test]
    async fn test_idle_rollover_ends_stream() {
        let (processor, catalog) = create_test_processor(create_test_settings());
        processor.start().await.unwrap();

        processor
            .handle_datagram(sender(), &build_packet(0x100, false, 0, &[1u8; 20]))
            .await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        processor.check_idle().await;

        processor.pool().unwrap().shutdown().await;

        let stats = processor.stats();
        assert_eq!(stats.children_created, 1);
        assert_eq!(stats.reconciliations, 1);
        assert!(!processor.context().is_dirty());
        assert_eq!(catalog.len(), 2);
    }

    #[tokio::test]
    async fn test_flush_with_empty_buffer() {
        let (processor, catalog) = create_test_processor(create_test_settings());
        processor.start().await.unwrap();

        assert!(processor.flush().await.unwrap().is_none());
        processor.shutdown().await.unwrap();

        assert_eq!(processor.stats().rollovers, 0);
        assert!(catalog.is_empty());
    }

    #[tokio::test]
    async fn test_second_start_fails() {
        let (processor, _catalog) = create_test_processor(create_test_settings());
        processor.start().await.unwrap();
        assert!(matches!(
            processor.start().await,
            Err(StreamCreationError::PoolAlreadyInstalled)
        ));
    }
}
