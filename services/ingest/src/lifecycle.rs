//! Stream lifecycle hooks.
//!
//! Three ordered plugin lists are composed when a stream is built: creation
//! hooks run on start, stream-end hooks run when the stream goes idle or is
//! stopped, and shutdown hooks drain the stream before it is discarded.

use crate::reconcile::{ReconcileOutcome, Reconciler};
use crate::rollover::{RolloverError, RolloverPool};
use crate::stream_processor::StreamProcessor;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum StreamCreationError {
    #[error("Rollover pool already installed")]
    PoolAlreadyInstalled,

    #[error("Creation hook {plugin} failed: {message}")]
    Plugin {
        plugin: &'static str,
        message: String,
    },
}

#[derive(Debug, Error)]
pub enum StreamShutdownError {
    #[error("Unable to rotate and ingest final data during shutdown: {0}")]
    Flush(#[source] RolloverError),

    #[error("Shutdown hook {plugin} failed: {message}")]
    Plugin {
        plugin: &'static str,
        message: String,
    },
}

#[async_trait]
pub trait StreamCreationPlugin: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_create(&self, stream: &Arc<StreamProcessor>) -> Result<(), StreamCreationError>;
}

/// Runs when the stream stops producing data. Failures are the plugin's to
/// log; they never stop the stream.
#[async_trait]
pub trait StreamEndPlugin: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_stream_end(&self, stream: &Arc<StreamProcessor>);
}

#[async_trait]
pub trait StreamShutdownPlugin: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_shutdown(&self, stream: &Arc<StreamProcessor>) -> Result<(), StreamShutdownError>;
}

#[derive(Default)]
pub struct LifecycleChain {
    creation: Vec<Box<dyn StreamCreationPlugin>>,
    stream_end: Vec<Box<dyn StreamEndPlugin>>,
    shutdown: Vec<Box<dyn StreamShutdownPlugin>>,
}

impl LifecycleChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool creation on start, reconciliation on stream end, flush then
    /// pool drain on shutdown.
    pub fn standard(pool_size: usize, reconciler: Arc<Reconciler>) -> Self {
        Self::new()
            .with_creation(RolloverPoolCreation::new(pool_size))
            .with_stream_end(FindChildrenStreamEnd::new(reconciler))
            .with_shutdown(FlushPacketBuffer)
            .with_shutdown(ShutdownRolloverPool)
    }

    pub fn with_creation(mut self, plugin: impl StreamCreationPlugin + 'static) -> Self {
        self.creation.push(Box::new(plugin));
        self
    }

    pub fn with_stream_end(mut self, plugin: impl StreamEndPlugin + 'static) -> Self {
        self.stream_end.push(Box::new(plugin));
        self
    }

    pub fn with_shutdown(mut self, plugin: impl StreamShutdownPlugin + 'static) -> Self {
        self.shutdown.push(Box::new(plugin));
        self
    }

    /// Run creation hooks in order, stopping at the first failure.
    pub async fn run_creation(&self, stream: &Arc<StreamProcessor>) -> Result<(), StreamCreationError> {
        for plugin in &self.creation {
            debug!(plugin = plugin.name(), "Running creation hook");
            plugin.on_create(stream).await?;
        }
        Ok(())
    }

    pub async fn run_stream_end(&self, stream: &Arc<StreamProcessor>) {
        for plugin in &self.stream_end {
            debug!(plugin = plugin.name(), "Running stream-end hook");
            plugin.on_stream_end(stream).await;
        }
    }

    /// Run every shutdown hook in order. The first failure is returned after
    /// the remaining hooks have run.
    pub async fn run_shutdown(&self, stream: &Arc<StreamProcessor>) -> Result<(), StreamShutdownError> {
        let mut first_error = None;
        for plugin in &self.shutdown {
            debug!(plugin = plugin.name(), "Running shutdown hook");
            if let Err(e) = plugin.on_shutdown(stream).await {
                warn!(plugin = plugin.name(), error = %e, "Shutdown hook failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Installs the stream's rollover worker pool.
pub struct RolloverPoolCreation {
    size: usize,
}

impl RolloverPoolCreation {
    pub fn new(size: usize) -> Self {
        Self { size }
    }
}

#[async_trait]
impl StreamCreationPlugin for RolloverPoolCreation {
    fn name(&self) -> &'static str {
        "rollover-pool"
    }

    async fn on_create(&self, stream: &Arc<StreamProcessor>) -> Result<(), StreamCreationError> {
        if !stream.install_pool(RolloverPool::new(self.size)) {
            return Err(StreamCreationError::PoolAlreadyInstalled);
        }
        info!(workers = self.size, "Rollover pool started");
        Ok(())
    }
}

/// Reconciles the parent with every child ingested so far.
pub struct FindChildrenStreamEnd {
    reconciler: Arc<Reconciler>,
}

impl FindChildrenStreamEnd {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self { reconciler }
    }
}

#[async_trait]
impl StreamEndPlugin for FindChildrenStreamEnd {
    fn name(&self) -> &'static str {
        "find-children"
    }

    async fn on_stream_end(&self, stream: &Arc<StreamProcessor>) {
        match self.reconciler.reconcile(stream.context()).await {
            Ok(ReconcileOutcome::Updated(parent)) => {
                stream.record_reconciliation();
                debug!(parent_id = %parent.id, "Parent updated at stream end");
            }
            Ok(ReconcileOutcome::Skipped) | Ok(ReconcileOutcome::Abandoned) => {}
            Err(e) => warn!(error = %e, "Parent reconciliation failed"),
        }
    }
}

/// Ingests whatever is still buffered and waits for it to finish.
pub struct FlushPacketBuffer;

#[async_trait]
impl StreamShutdownPlugin for FlushPacketBuffer {
    fn name(&self) -> &'static str {
        "flush-packet-buffer"
    }

    async fn on_shutdown(&self, stream: &Arc<StreamProcessor>) -> Result<(), StreamShutdownError> {
        stream
            .flush()
            .await
            .map(|_| ())
            .map_err(StreamShutdownError::Flush)
    }
}

/// Stops accepting rollovers and waits for in-flight ones.
pub struct ShutdownRolloverPool;

#[async_trait]
impl StreamShutdownPlugin for ShutdownRolloverPool {
    fn name(&self) -> &'static str {
        "shutdown-rollover-pool"
    }

    async fn on_shutdown(&self, stream: &Arc<StreamProcessor>) -> Result<(), StreamShutdownError> {
        if let Some(pool) = stream.pool() {
            pool.shutdown().await;
            info!("Rollover pool stopped");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryCatalog;
    use crate::ingest::CatalogSegmentIngester;
    use crate::security::AddressSubjectProvider;
    use crate::stream_processor::tests::create_test_settings;
    use parking_lot::Mutex;
    use tokio_util::sync::CancellationToken;

    type Log = Arc<Mutex<Vec<&'static str>>>;

    struct Recorder {
        name: &'static str,
        log: Log,
        fail: bool,
    }

    impl Recorder {
        fn new(name: &'static str, log: &Log, fail: bool) -> Self {
            Self {
                name,
                log: log.clone(),
                fail,
            }
        }

        fn record(&self) -> Result<(), String> {
            self.log.lock().push(self.name);
            if self.fail {
                Err("injected".to_string())
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl StreamCreationPlugin for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn on_create(&self, _stream: &Arc<StreamProcessor>) -> Result<(), StreamCreationError> {
            self.record().map_err(|message| StreamCreationError::Plugin {
                plugin: self.name,
                message,
            })
        }
    }

    #[async_trait]
    impl StreamEndPlugin for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn on_stream_end(&self, _stream: &Arc<StreamProcessor>) {
            let _ = self.record();
        }
    }

    #[async_trait]
    impl StreamShutdownPlugin for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn on_shutdown(&self, _stream: &Arc<StreamProcessor>) -> Result<(), StreamShutdownError> {
            self.record().map_err(|message| StreamShutdownError::Plugin {
                plugin: self.name,
                message,
            })
        }
    }

    fn create_test_stream(lifecycle: LifecycleChain) -> Arc<StreamProcessor> {
        let catalog = Arc::new(InMemoryCatalog::new());
        StreamProcessor::new(
            create_test_settings(),
            catalog.clone(),
            Arc::new(CatalogSegmentIngester::new(catalog)),
            Arc::new(AddressSubjectProvider::default()),
            lifecycle,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_creation_stops_at_first_failure() {
        let log = Log::default();
        let stream = create_test_stream(
            LifecycleChain::new()
                .with_creation(Recorder::new("a", &log, false))
                .with_creation(Recorder::new("b", &log, true))
                .with_creation(Recorder::new("c", &log, false)),
        );

        let result = stream.start().await;

        assert!(matches!(
            result,
            Err(StreamCreationError::Plugin { plugin: "b", .. })
        ));
        assert_eq!(*log.lock(), vec!["a", "b"]);
        assert!(!stream.is_running());
    }

    #[tokio::test]
    async fn test_shutdown_runs_every_hook_then_stream_end() {
        let log = Log::default();
        let stream = create_test_stream(
            LifecycleChain::new()
                .with_shutdown(Recorder::new("flush", &log, true))
                .with_shutdown(Recorder::new("pool", &log, false))
                .with_stream_end(Recorder::new("end", &log, false)),
        );

        let result = stream.shutdown().await;

        assert!(matches!(
            result,
            Err(StreamShutdownError::Plugin { plugin: "flush", .. })
        ));
        assert_eq!(*log.lock(), vec!["flush", "pool", "end"]);
    }

    #[tokio::test]
    async fn test_flush_into_closed_pool_is_shutdown_error() {
        let stream = create_test_stream(LifecycleChain::new().with_shutdown(FlushPacketBuffer));
        stream.install_pool(RolloverPool::new(1));
        stream.start().await.unwrap();
        stream
            .handle_datagram(
                "10.0.0.7:5000".parse().unwrap(),
                &crate::ts::packet::tests::build_packet(0x100, false, 0, &[0u8; 8]),
            )
            .await;
        if let Some(pool) = stream.pool() {
            pool.shutdown().await;
        }

        let result = stream.shutdown().await;
        assert!(matches!(
            result,
            Err(StreamShutdownError::Flush(RolloverError::PoolClosed))
        ));
    }
}
