//! Kestrel motion imagery ingest.
//!
//! Receives MPEG transport streams over UDP, decodes the embedded KLV
//! telemetry, splits the stream into segments and catalogs each segment as
//! a child record of one parent record per stream. The parent's aggregate
//! attributes (track, footprint, time span, countries) are reconciled from
//! its children when the stream ends.
//!
//! # Architecture
//!
//! ```text
//! UDP -> StreamListener -> StreamProcessor -> FrameSynchronizer -> PacketBuffer
//!                                          \-> MetadataDecoder -> AttributePipeline
//! PacketBuffer rollover -> RolloverPool -> RolloverAction -> CatalogService
//! stream end -> Reconciler -> UpdateFields -> CatalogService
//! ```

pub mod buffer;
pub mod catalog;
pub mod config;
pub mod context;
pub mod geometry;
pub mod ingest;
pub mod klv;
pub mod lifecycle;
pub mod reconcile;
pub mod record;
pub mod reduce;
pub mod retry;
pub mod rollover;
pub mod security;
pub mod stream_processor;
pub mod ts;
pub mod udp_listener;

pub use config::IngestConfig;
pub use stream_processor::{StreamProcessor, StreamSettings, StreamStats};
pub use udp_listener::StreamListener;
