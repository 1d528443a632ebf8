//! Program-specific information: just enough PAT/PMT parsing to find the
//! KLV metadata elementary stream.

use thiserror::Error;

/// PID carrying the program association table.
pub const PAT_PID: u16 = 0x0000;

const TABLE_ID_PAT: u8 = 0x00;
const TABLE_ID_PMT: u8 = 0x02;

/// Metadata carried in PES packets with a metadata access unit header.
pub const STREAM_TYPE_SYNCHRONOUS_METADATA: u8 = 0x15;

/// Private data stream; KLV when tagged with a `KLVA` registration descriptor.
pub const STREAM_TYPE_PRIVATE_DATA: u8 = 0x06;

const REGISTRATION_DESCRIPTOR_TAG: u8 = 0x05;
const KLVA_FORMAT_IDENTIFIER: &[u8; 4] = b"KLVA";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PsiError {
    #[error("Section truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Unexpected table id {actual:#04x}, expected {expected:#04x}")]
    UnexpectedTable { expected: u8, actual: u8 },
}

/// How KLV bytes are framed inside the PES payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataFraming {
    /// Stream type 0x15: each PES payload is a metadata access unit
    Synchronous,
    /// Stream type 0x06: the PES payload is raw KLV
    Asynchronous,
}

/// The elementary stream carrying KLV metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataStream {
    pub pid: u16,
    pub framing: MetadataFraming,
}

/// Locate the section body in a PUSI payload and check its table id.
///
/// Returns the bytes between the end of the fixed 8-byte header and the CRC.
fn section_body(payload: &[u8], table_id: u8) -> Result<&[u8], PsiError> {
    let pointer = *payload.first().ok_or(PsiError::Truncated {
        needed: 1,
        available: 0,
    })? as usize;
    let section = payload.get(1 + pointer..).unwrap_or_default();
    require(section, 8)?;

    if section[0] != table_id {
        return Err(PsiError::UnexpectedTable {
            expected: table_id,
            actual: section[0],
        });
    }

    let section_length = (u16::from_be_bytes([section[1], section[2]]) & 0x0FFF) as usize;
    let end = 3 + section_length;
    require(section, end)?;
    // Drop the trailing CRC_32.
    Ok(&section[8..end.saturating_sub(4).max(8)])
}

fn require(bytes: &[u8], needed: usize) -> Result<(), PsiError> {
    if bytes.len() < needed {
        return Err(PsiError::Truncated {
            needed,
            available: bytes.len(),
        });
    }
    Ok(())
}

/// Parse a PAT section and return the PMT PID of the first program.
pub fn parse_pat(payload: &[u8]) -> Result<Option<u16>, PsiError> {
    let body = section_body(payload, TABLE_ID_PAT)?;
    Ok(body.chunks_exact(4).find_map(|entry| {
        let program_number = u16::from_be_bytes([entry[0], entry[1]]);
        // Program 0 points at the network information table.
        (program_number != 0).then(|| u16::from_be_bytes([entry[2], entry[3]]) & 0x1FFF)
    }))
}

/// Parse a PMT section and return the first KLV metadata stream it lists.
pub fn parse_pmt(payload: &[u8]) -> Result<Option<MetadataStream>, PsiError> {
    let body = section_body(payload, TABLE_ID_PMT)?;
    require(body, 4)?;

    let program_info_length = (u16::from_be_bytes([body[2], body[3]]) & 0x0FFF) as usize;
    let mut pos = 4 + program_info_length;

    while pos + 5 <= body.len() {
        let stream_type = body[pos];
        let pid = u16::from_be_bytes([body[pos + 1], body[pos + 2]]) & 0x1FFF;
        let info_length = (u16::from_be_bytes([body[pos + 3], body[pos + 4]]) & 0x0FFF) as usize;
        let descriptors = body
            .get(pos + 5..pos + 5 + info_length)
            .ok_or(PsiError::Truncated {
                needed: pos + 5 + info_length,
                available: body.len(),
            })?;

        let framing = match stream_type {
            STREAM_TYPE_SYNCHRONOUS_METADATA => Some(MetadataFraming::Synchronous),
            STREAM_TYPE_PRIVATE_DATA if has_klva_registration(descriptors) => {
                Some(MetadataFraming::Asynchronous)
            }
            _ => None,
        };
        if let Some(framing) = framing {
            return Ok(Some(MetadataStream { pid, framing }));
        }

        pos += 5 + info_length;
    }

    Ok(None)
}

fn has_klva_registration(mut descriptors: &[u8]) -> bool {
    while descriptors.len() >= 2 {
        let tag = descriptors[0];
        let length = descriptors[1] as usize;
        let Some(body) = descriptors.get(2..2 + length) else {
            return false;
        };
        if tag == REGISTRATION_DESCRIPTOR_TAG && body.starts_with(KLVA_FORMAT_IDENTIFIER) {
            return true;
        }
        descriptors = &descriptors[2 + length..];
    }
    false
}
