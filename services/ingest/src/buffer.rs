//! Segment accumulation and rollover triggers.

use crate::config::RolloverConfig;
use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Thresholds that close the current segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RolloverLimits {
    /// Roll over once the segment holds at least this many bytes
    pub max_bytes: usize,

    /// Roll over once this much time has passed since the first byte
    pub max_duration: Duration,

    /// Roll over (as a timeout) when nothing was written for this long
    pub idle_timeout: Duration,
}

impl From<&RolloverConfig> for RolloverLimits {
    fn from(config: &RolloverConfig) -> Self {
        Self {
            max_bytes: config.max_segment_bytes,
            max_duration: config.max_segment_duration(),
            idle_timeout: config.idle_timeout(),
        }
    }
}

/// Why a segment was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotateReason {
    Size,
    Duration,
    Idle,
    Flush,
}

/// A closed segment handed to the rollover coordinator.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Sequence number within the stream, starting at 0
    pub sequence: u64,

    pub data: Bytes,

    pub reason: RotateReason,

    /// Time of the first write into this segment
    pub started_at: Instant,

    pub closed_at: Instant,
}

impl Segment {
    /// Whether the segment was closed by the idle timer.
    ///
    /// A timeout rollover also signals that the stream has ended.
    pub fn is_timeout(&self) -> bool {
        self.reason == RotateReason::Idle
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Append-only byte accumulator that decides when to close a segment.
///
/// At most one segment is produced per call. Callers serialise access; the
/// stream processor keeps the buffer behind its decode lock so writes, idle
/// checks and flushes never interleave.
#[derive(Debug)]
pub struct PacketBuffer {
    limits: RolloverLimits,
    current: BytesMut,
    first_write: Option<Instant>,
    last_write: Option<Instant>,
    next_sequence: u64,
}

impl PacketBuffer {
    pub fn new(limits: RolloverLimits) -> Self {
        Self {
            limits,
            current: BytesMut::new(),
            first_write: None,
            last_write: None,
            next_sequence: 0,
        }
    }

    pub fn limits(&self) -> RolloverLimits {
        self.limits
    }

    /// Bytes accumulated in the open segment.
    pub fn len(&self) -> usize {
        self.current.len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }

    pub fn write(&mut self, bytes: &[u8]) -> Option<Segment> {
        self.write_at(bytes, Instant::now())
    }

    /// Append `bytes` and close the segment if a size or duration threshold
    /// is reached.
    pub fn write_at(&mut self, bytes: &[u8], now: Instant) -> Option<Segment> {
        if bytes.is_empty() {
            return None;
        }

        self.current.extend_from_slice(bytes);
        let started = *self.first_write.get_or_insert(now);
        self.last_write = Some(now);

        if self.current.len() >= self.limits.max_bytes {
            return self.rotate(RotateReason::Size, now);
        }
        if now.saturating_duration_since(started) >= self.limits.max_duration {
            return self.rotate(RotateReason::Duration, now);
        }
        None
    }

    pub fn check_idle(&mut self) -> Option<Segment> {
        self.check_idle_at(Instant::now())
    }

    /// Close the segment as a timeout if nothing was written for the idle
    /// period.
    pub fn check_idle_at(&mut self, now: Instant) -> Option<Segment> {
        let last = self.last_write?;
        if now.saturating_duration_since(last) < self.limits.idle_timeout {
            return None;
        }
        self.rotate(RotateReason::Idle, now)
    }

    /// Unconditionally close the current segment, if it holds any bytes.
    pub fn flush_and_rotate(&mut self) -> Option<Segment> {
        self.rotate(RotateReason::Flush, Instant::now())
    }

    fn rotate(&mut self, reason: RotateReason, now: Instant) -> Option<Segment> {
        let started_at = self.first_write.take()?;
        self.last_write = None;
        if self.current.is_empty() {
            return None;
        }

        let segment = Segment {
            sequence: self.next_sequence,
            data: self.current.split().freeze(),
            reason,
            started_at,
            closed_at: now,
        };
        self.next_sequence += 1;

        debug!(
            sequence = segment.sequence,
            bytes = segment.len(),
            reason = ?reason,
            "Segment rotated"
        );
        Some(segment)
    }
}
