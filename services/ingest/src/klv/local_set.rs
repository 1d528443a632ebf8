//! UAS datalink local set framing: universal key, BER lengths, BER-OID tags
//! and the running 16-bit checksum.

use bytes::Bytes;
use thiserror::Error;

/// Universal label of the UAS datalink local set.
pub const UAS_LOCAL_SET_KEY: [u8; 16] = [
    0x06, 0x0E, 0x2B, 0x34, 0x02, 0x0B, 0x01, 0x01, 0x0E, 0x01, 0x03, 0x01, 0x01, 0x00, 0x00, 0x00,
];

/// Tag of the checksum item; its value is always two bytes.
pub const CHECKSUM_TAG: u64 = 1;

const KEY_LENGTH: usize = 16;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KlvError {
    #[error("Packet does not start with the UAS local set key")]
    UnknownKey,

    #[error("Truncated KLV: needed {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Invalid BER length encoding")]
    InvalidLength,

    #[error("Invalid BER-OID tag encoding")]
    InvalidTag,

    #[error("Local set has no checksum")]
    MissingChecksum,

    #[error("Checksum mismatch: computed {computed:#06x}, embedded {embedded:#06x}")]
    ChecksumMismatch { computed: u16, embedded: u16 },

    #[error("Invalid value for tag {tag}: {reason}")]
    InvalidValue { tag: u64, reason: String },
}

/// One tag/value pair of a local set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSetItem {
    pub tag: u64,
    pub value: Bytes,
    /// Offset of the value within the enclosing set body
    offset: usize,
}

impl LocalSetItem {
    pub fn new(tag: u64, value: Bytes) -> Self {
        Self {
            tag,
            value,
            offset: 0,
        }
    }
}

/// A checksum-validated local set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSet {
    pub items: Vec<LocalSetItem>,
    pub checksum: u16,
}

/// Running 16-bit sum over `bytes`; even offsets land in the high byte.
pub fn checksum(bytes: &[u8]) -> u16 {
    bytes.iter().enumerate().fold(0u16, |sum, (i, &b)| {
        sum.wrapping_add((b as u16) << (8 * ((i + 1) % 2)))
    })
}

/// Read a BER short- or long-form length.
pub fn read_ber_length(bytes: &[u8], pos: &mut usize) -> Result<usize, KlvError> {
    let first = *bytes.get(*pos).ok_or(KlvError::Truncated {
        needed: *pos + 1,
        available: bytes.len(),
    })?;
    *pos += 1;

    if first & 0x80 == 0 {
        return Ok(first as usize);
    }

    let count = (first & 0x7F) as usize;
    if count == 0 || count > 8 {
        return Err(KlvError::InvalidLength);
    }
    let field = bytes.get(*pos..*pos + count).ok_or(KlvError::Truncated {
        needed: *pos + count,
        available: bytes.len(),
    })?;
    *pos += count;

    let length = field.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64);
    usize::try_from(length).map_err(|_| KlvError::InvalidLength)
}

/// End offset of a `length`-byte value starting at `pos`, if it fits in
/// `available` bytes.
fn value_end(pos: usize, length: usize, available: usize) -> Result<usize, KlvError> {
    let end = pos.checked_add(length).ok_or(KlvError::InvalidLength)?;
    if end > available {
        return Err(KlvError::Truncated {
            needed: end,
            available,
        });
    }
    Ok(end)
}

fn read_ber_oid(bytes: &[u8], pos: &mut usize) -> Result<u64, KlvError> {
    let mut tag = 0u64;
    for _ in 0..9 {
        let b = *bytes.get(*pos).ok_or(KlvError::Truncated {
            needed: *pos + 1,
            available: bytes.len(),
        })?;
        *pos += 1;
        tag = (tag << 7) | (b & 0x7F) as u64;
        if b & 0x80 == 0 {
            return Ok(tag);
        }
    }
    Err(KlvError::InvalidTag)
}

/// Split a local set body into its items.
///
/// Also used for nested sets, which carry no key and no checksum.
pub fn parse_items(body: &Bytes) -> Result<Vec<LocalSetItem>, KlvError> {
    let mut items = Vec::new();
    let mut pos = 0;

    while pos < body.len() {
        let tag = read_ber_oid(body, &mut pos)?;
        let length = read_ber_length(body, &mut pos)?;
        let end = value_end(pos, length, body.len())?;
        items.push(LocalSetItem {
            tag,
            value: body.slice(pos..end),
            offset: pos,
        });
        pos = end;
    }

    Ok(items)
}

/// Total encoded length of the KLV packet starting at `bytes[0]`.
fn packet_length(bytes: &[u8]) -> Result<usize, KlvError> {
    if bytes.len() < KEY_LENGTH {
        return Err(KlvError::Truncated {
            needed: KEY_LENGTH,
            available: bytes.len(),
        });
    }
    let mut pos = KEY_LENGTH;
    let length = read_ber_length(bytes, &mut pos)?;
    pos.checked_add(length).ok_or(KlvError::InvalidLength)
}

/// Split a buffer holding back-to-back KLV packets.
///
/// Splitting stops at the first packet whose length runs past the buffer.
pub fn split_packets(bytes: &Bytes) -> Vec<Bytes> {
    let mut packets = Vec::new();
    let mut rest = bytes.clone();
    while !rest.is_empty() {
        match packet_length(&rest) {
            Ok(length) if length <= rest.len() => {
                packets.push(rest.split_to(length));
            }
            _ => {
                packets.push(rest);
                break;
            }
        }
    }
    packets
}

/// Decode and validate a UAS datalink local set.
///
/// The embedded checksum covers every byte from the start of the key up to
/// and including the checksum item's tag and length.
pub fn decode_local_set(packet: Bytes) -> Result<LocalSet, KlvError> {
    if packet.len() < KEY_LENGTH || packet[..KEY_LENGTH] != UAS_LOCAL_SET_KEY {
        return Err(KlvError::UnknownKey);
    }

    let mut pos = KEY_LENGTH;
    let length = read_ber_length(&packet, &mut pos)?;
    let body_start = pos;
    let body_end = value_end(body_start, length, packet.len())?;

    let body = packet.slice(body_start..body_end);
    let items = parse_items(&body)?;

    let checksum_item = items
        .iter()
        .rev()
        .find(|item| item.tag == CHECKSUM_TAG && item.value.len() == 2)
        .ok_or(KlvError::MissingChecksum)?;

    let embedded = u16::from_be_bytes([checksum_item.value[0], checksum_item.value[1]]);
    let computed = checksum(&packet[..body_start + checksum_item.offset]);
    if computed != embedded {
        return Err(KlvError::ChecksumMismatch { computed, embedded });
    }

    Ok(LocalSet {
        items: items
            .into_iter()
            .filter(|item| item.tag != CHECKSUM_TAG)
            .collect(),
        checksum: embedded,
    })
}
