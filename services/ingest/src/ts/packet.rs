//! Transport stream packet header parsing.

use bytes::Bytes;
use thiserror::Error;

/// Size of a transport stream packet in bytes.
pub const TS_PACKET_SIZE: usize = 188;

/// Marker byte at the start of every packet.
pub const TS_SYNC_BYTE: u8 = 0x47;

/// PID reserved for null (stuffing) packets.
pub const NULL_PID: u16 = 0x1FFF;

/// Errors raised when a candidate packet is malformed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Packet length {0} does not match {TS_PACKET_SIZE}")]
    InvalidLength(usize),

    #[error("Invalid sync byte: {0:#04x}")]
    InvalidSyncByte(u8),

    #[error("Reserved adaptation field control value")]
    ReservedAdaptationControl,

    #[error("Adaptation field length {0} overruns packet")]
    AdaptationOverrun(usize),
}

/// A parsed transport stream packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsPacket {
    /// Packet identifier (13 bits)
    pub pid: u16,

    /// Set when a PES packet or PSI section starts in this payload
    pub payload_unit_start: bool,

    /// Transport error indicator
    pub transport_error: bool,

    /// Transport scrambling control (2 bits)
    pub scrambling: u8,

    /// Continuity counter (4 bits)
    pub continuity_counter: u8,

    /// Whether an adaptation field precedes the payload
    pub has_adaptation_field: bool,

    /// Payload bytes following the header and adaptation field
    pub payload: Bytes,
}

impl TsPacket {
    /// Parse a packet from exactly [`TS_PACKET_SIZE`] bytes.
    ///
    /// The payload is a zero-copy slice of `data`.
    pub fn parse(data: Bytes) -> Result<Self, PacketError> {
        if data.len() != TS_PACKET_SIZE {
            return Err(PacketError::InvalidLength(data.len()));
        }
        if data[0] != TS_SYNC_BYTE {
            return Err(PacketError::InvalidSyncByte(data[0]));
        }

        let transport_error = data[1] & 0x80 != 0;
        let payload_unit_start = data[1] & 0x40 != 0;
        let pid = u16::from_be_bytes([data[1] & 0x1F, data[2]]);
        let scrambling = (data[3] >> 6) & 0x03;
        let adaptation_control = (data[3] >> 4) & 0x03;
        let continuity_counter = data[3] & 0x0F;

        let (has_adaptation_field, has_payload) = match adaptation_control {
            0b01 => (false, true),
            0b10 => (true, false),
            0b11 => (true, true),
            _ => return Err(PacketError::ReservedAdaptationControl),
        };

        let mut offset = 4;
        if has_adaptation_field {
            let length = data[4] as usize;
            offset = 5 + length;
            if offset > TS_PACKET_SIZE {
                return Err(PacketError::AdaptationOverrun(length));
            }
        }

        let payload = if has_payload {
            data.slice(offset..)
        } else {
            Bytes::new()
        };

        Ok(Self {
            pid,
            payload_unit_start,
            transport_error,
            scrambling,
            continuity_counter,
            has_adaptation_field,
            payload,
        })
    }

    pub fn is_null(&self) -> bool {
        self.pid == NULL_PID
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a payload-only packet on `pid`, padding the payload with 0xFF.
    pub(crate) fn build_packet(pid: u16, pusi: bool, counter: u8, payload: &[u8]) -> Vec<u8> {
        let mut packet = vec![0xFF; TS_PACKET_SIZE];
        packet[0] = TS_SYNC_BYTE;
        packet[1] = ((pid >> 8) as u8 & 0x1F) | if pusi { 0x40 } else { 0 };
        packet[2] = pid as u8;
        packet[3] = 0x10 | (counter & 0x0F);
        packet[4..4 + payload.len()].copy_from_slice(payload);
        packet
    }

    #[test]
    fn test_parse_header_fields() {
        let raw = build_packet(0x0100, true, 7, &[1, 2, 3]);
        let packet = TsPacket::parse(Bytes::from(raw)).unwrap();

        assert_eq!(packet.pid, 0x0100);
        assert!(packet.payload_unit_start);
        assert!(!packet.transport_error);
        assert_eq!(packet.continuity_counter, 7);
        assert_eq!(packet.payload.len(), TS_PACKET_SIZE - 4);
        assert_eq!(&packet.payload[..3], &[1, 2, 3]);
    }

    #[test]
    fn test_parse_adaptation_field() {
        let mut raw = build_packet(0x0101, false, 0, &[]);
        raw[3] = 0x30;
        raw[4] = 10;
        let packet = TsPacket::parse(Bytes::from(raw)).unwrap();

        assert!(packet.has_adaptation_field);
        assert_eq!(packet.payload.len(), TS_PACKET_SIZE - 15);
    }

    #[test]
    fn test_adaptation_only_has_no_payload() {
        let mut raw = build_packet(0x0101, false, 0, &[]);
        raw[3] = 0x20;
        raw[4] = 183;
        let packet = TsPacket::parse(Bytes::from(raw)).unwrap();
        assert!(packet.payload.is_empty());
    }

    #[test]
    fn test_rejects_bad_sync() {
        let mut raw = build_packet(0x0100, false, 0, &[]);
        raw[0] = 0x48;
        assert_eq!(
            TsPacket::parse(Bytes::from(raw)),
            Err(PacketError::InvalidSyncByte(0x48))
        );
    }

    #[test]
    fn test_rejects_reserved_adaptation_control() {
        let mut raw = build_packet(0x0100, false, 0, &[]);
        raw[3] = 0x00;
        assert_eq!(
            TsPacket::parse(Bytes::from(raw)),
            Err(PacketError::ReservedAdaptationControl)
        );
    }

    #[test]
    fn test_rejects_adaptation_overrun() {
        let mut raw = build_packet(0x0100, false, 0, &[]);
        raw[3] = 0x30;
        raw[4] = 184;
        assert_eq!(
            TsPacket::parse(Bytes::from(raw)),
            Err(PacketError::AdaptationOverrun(184))
        );
    }

    #[test]
    fn test_rejects_short_input() {
        assert_eq!(
            TsPacket::parse(Bytes::from_static(&[TS_SYNC_BYTE, 0, 0])),
            Err(PacketError::InvalidLength(3))
        );
    }
}
