//! PES packet reassembly for a single elementary stream.

use super::packet::TsPacket;
use bytes::{Bytes, BytesMut};
use thiserror::Error;

const PES_START_CODE: [u8; 3] = [0x00, 0x00, 0x01];
const PES_BASE_HEADER_LEN: usize = 9;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PesError {
    #[error("PES packet too short: {0} bytes")]
    TooShort(usize),

    #[error("Missing PES start code prefix")]
    MissingStartCode,

    #[error("PES header length {header} exceeds packet length {available}")]
    HeaderOverrun { header: usize, available: usize },
}

/// A reassembled PES packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PesPacket {
    pub stream_id: u8,

    /// Presentation timestamp in 90 kHz ticks
    pub pts: Option<u64>,

    pub payload: Bytes,
}

impl PesPacket {
    pub fn parse(data: Bytes) -> Result<Self, PesError> {
        if data.len() < PES_BASE_HEADER_LEN {
            return Err(PesError::TooShort(data.len()));
        }
        if data[..3] != PES_START_CODE {
            return Err(PesError::MissingStartCode);
        }

        let stream_id = data[3];
        let packet_length = u16::from_be_bytes([data[4], data[5]]) as usize;
        let header_data_length = data[8] as usize;
        let header_end = PES_BASE_HEADER_LEN + header_data_length;
        if header_end > data.len() {
            return Err(PesError::HeaderOverrun {
                header: header_end,
                available: data.len(),
            });
        }

        let pts = if data[7] & 0x80 != 0 && header_data_length >= 5 {
            Some(decode_timestamp(&data[9..14]))
        } else {
            None
        };

        // A zero length field means "unbounded"; otherwise the length counts
        // the three optional header bytes, the header data and the payload.
        let payload_end = if packet_length == 0 {
            data.len()
        } else {
            let payload_length = packet_length.saturating_sub(3 + header_data_length);
            (header_end + payload_length).min(data.len())
        };

        Ok(Self {
            stream_id,
            pts,
            payload: data.slice(header_end..payload_end),
        })
    }
}

fn decode_timestamp(b: &[u8]) -> u64 {
    (((b[0] as u64) >> 1) & 0x07) << 30
        | (b[1] as u64) << 22
        | ((b[2] as u64) >> 1) << 15
        | (b[3] as u64) << 7
        | (b[4] as u64) >> 1
}

/// Collects transport packet payloads for one PID into PES packets.
///
/// A packet completes when its declared length has arrived or when the next
/// payload-unit-start packet begins.
#[derive(Debug, Default)]
pub struct PesAssembler {
    buffer: BytesMut,
    expected: Option<usize>,
    started: bool,
}

impl PesAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one transport packet, returning any PES packets it completes.
    pub fn push(&mut self, packet: &TsPacket) -> Vec<Bytes> {
        let mut completed = Vec::new();

        if packet.payload_unit_start {
            completed.extend(self.flush());
            self.started = true;
        } else if !self.started {
            return completed;
        }

        self.buffer.extend_from_slice(&packet.payload);

        if self.expected.is_none() && self.buffer.len() >= 6 {
            let declared = u16::from_be_bytes([self.buffer[4], self.buffer[5]]) as usize;
            self.expected = (declared > 0).then_some(6 + declared);
        }
        if matches!(self.expected, Some(total) if self.buffer.len() >= total) {
            completed.extend(self.flush());
        }

        completed
    }

    /// Emit whatever is buffered as a final packet.
    pub fn flush(&mut self) -> Option<Bytes> {
        self.started = false;
        self.expected = None;
        if self.buffer.is_empty() {
            return None;
        }
        Some(self.buffer.split().freeze())
    }
}
