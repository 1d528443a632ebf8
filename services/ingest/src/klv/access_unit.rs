//! Extraction of KLV bytes from metadata PES payloads.

use crate::ts::MetadataFraming;
use bytes::Bytes;

/// Size of the metadata access unit header on synchronous streams.
pub const ACCESS_UNIT_HEADER_LEN: usize = 5;

/// Return the KLV bytes carried by a PES payload.
///
/// Synchronous payloads start with a 5-byte access unit header whose last two
/// bytes give the cell length. When the payload is exactly header plus cell
/// the header is stripped; otherwise the payload is taken from its start, cut
/// at the declared length.
pub fn klv_bytes(payload: &Bytes, framing: MetadataFraming) -> Option<Bytes> {
    if payload.is_empty() {
        return None;
    }

    match framing {
        MetadataFraming::Asynchronous => Some(payload.clone()),
        MetadataFraming::Synchronous => {
            if payload.len() < ACCESS_UNIT_HEADER_LEN {
                return None;
            }
            let cell_length = u16::from_be_bytes([payload[3], payload[4]]) as usize;
            let declared = ACCESS_UNIT_HEADER_LEN + cell_length;

            if payload.len() == declared {
                Some(payload.slice(ACCESS_UNIT_HEADER_LEN..))
            } else {
                Some(payload.slice(..payload.len().min(declared)))
            }
        }
    }
}
