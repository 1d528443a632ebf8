//! Transport packets in, decoded metadata sets out.

use super::access_unit::klv_bytes;
use super::fields::{decode_metadata_set, MetadataSet};
use super::local_set::{split_packets, KlvError};
use crate::ts::packet::TsPacket;
use crate::ts::pes::{PesAssembler, PesError, PesPacket};
use crate::ts::psi::{self, MetadataStream, PsiError, PAT_PID};
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("PSI error: {0}")]
    Psi(#[from] PsiError),

    #[error("PES error: {0}")]
    Pes(#[from] PesError),

    #[error("KLV error: {0}")]
    Klv(#[from] KlvError),
}

/// Follows PAT and PMT to the KLV elementary stream and decodes every
/// metadata packet found on it.
#[derive(Debug, Default)]
pub struct MetadataDecoder {
    pmt_pid: Option<u16>,
    stream: Option<MetadataStream>,
    assembler: PesAssembler,
    last_pts: Option<u64>,
}

impl MetadataDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metadata_stream(&self) -> Option<MetadataStream> {
        self.stream
    }

    /// Feed one transport packet.
    ///
    /// Each returned item is one KLV packet; failures are reported per packet
    /// so a corrupt set never hides its neighbours.
    pub fn push(&mut self, packet: &TsPacket) -> Vec<Result<MetadataSet, DecodeError>> {
        if packet.transport_error || packet.is_null() {
            return Vec::new();
        }

        if packet.pid == PAT_PID {
            if packet.payload_unit_start {
                if let Err(e) = self.handle_pat(&packet.payload) {
                    return vec![Err(e)];
                }
            }
            return Vec::new();
        }

        if Some(packet.pid) == self.pmt_pid {
            if packet.payload_unit_start {
                if let Err(e) = self.handle_pmt(&packet.payload) {
                    return vec![Err(e)];
                }
            }
            return Vec::new();
        }

        match self.stream {
            Some(stream) if stream.pid == packet.pid => self
                .assembler
                .push(packet)
                .into_iter()
                .flat_map(|pes| self.decode_pes(stream, pes))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Decode whatever PES data is still buffered.
    pub fn flush(&mut self) -> Vec<Result<MetadataSet, DecodeError>> {
        match (self.stream, self.assembler.flush()) {
            (Some(stream), Some(pes)) => self.decode_pes(stream, pes),
            _ => Vec::new(),
        }
    }

    fn handle_pat(&mut self, payload: &[u8]) -> Result<(), DecodeError> {
        let pmt_pid = psi::parse_pat(payload)?;
        if pmt_pid != self.pmt_pid {
            debug!(pmt_pid = ?pmt_pid, "Program map PID changed");
            self.pmt_pid = pmt_pid;
        }
        Ok(())
    }

    fn handle_pmt(&mut self, payload: &[u8]) -> Result<(), DecodeError> {
        let stream = psi::parse_pmt(payload)?;
        if stream != self.stream {
            info!(stream = ?stream, "Metadata stream selected");
            self.stream = stream;
            self.assembler = PesAssembler::new();
        }
        Ok(())
    }

    fn decode_pes(
        &mut self,
        stream: MetadataStream,
        data: Bytes,
    ) -> Vec<Result<MetadataSet, DecodeError>> {
        let pes = match PesPacket::parse(data) {
            Ok(pes) => pes,
            Err(e) => return vec![Err(e.into())],
        };

        let pts = pes.pts.or(self.last_pts.map(|pts| pts + 1));
        self.last_pts = pts;

        let Some(klv) = klv_bytes(&pes.payload, stream.framing) else {
            return Vec::new();
        };

        split_packets(&klv)
            .into_iter()
            .map(|packet| decode_metadata_set(packet, pts).map_err(DecodeError::from))
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::klv::fields::field;
    use crate::klv::local_set::tests::encode_local_set;
    use crate::ts::packet::tests::build_packet;
    use crate::ts::pes::tests::pes_bytes;
    use crate::ts::psi::tests::{pat_payload, pmt_payload};

    pub(crate) const PMT_PID: u16 = 0x0020;
    pub(crate) const KLV_PID: u16 = 0x0101;

    /// Raw transport packets for PAT, PMT and one synchronous KLV access unit
    /// per entry of `klv_packets`.
    pub(crate) fn metadata_transport_stream(klv_packets: &[Vec<u8>]) -> Vec<u8> {
        let mut stream = build_packet(PAT_PID, true, 0, &pat_payload(PMT_PID));
        stream.extend(build_packet(
            PMT_PID,
            true,
            0,
            &pmt_payload(&[(0x15, KLV_PID, &[])]),
        ));

        for (i, klv) in klv_packets.iter().enumerate() {
            let mut access_unit = vec![0x00, 0x00, 0x00];
            access_unit.extend_from_slice(&(klv.len() as u16).to_be_bytes());
            access_unit.extend_from_slice(klv);
            let pes = pes_bytes(0xFC, 90_000 * (i as u64 + 1), &access_unit);
            assert!(pes.len() <= 184, "test helper only builds single-packet PES");
            stream.extend(build_packet(KLV_PID, true, i as u8, &pes));
        }
        stream
    }

    fn packets(bytes: &[u8]) -> Vec<TsPacket> {
        bytes
            .chunks(188)
            .map(|chunk| TsPacket::parse(Bytes::copy_from_slice(chunk)).unwrap())
            .collect()
    }

    #[test]
    fn test_decodes_sets_from_transport_stream() {
        let klv = encode_local_set(&[(3, b"MISSION01".to_vec())]);
        let stream = metadata_transport_stream(&[klv.clone(), klv]);

        let mut decoder = MetadataDecoder::new();
        let sets: Vec<_> = packets(&stream)
            .iter()
            .flat_map(|p| decoder.push(p))
            .collect();

        assert_eq!(sets.len(), 2);
        let first = sets[0].as_ref().unwrap();
        assert!(first.contains(field::MISSION_ID));
        assert_eq!(first.pts, Some(90_000));
        assert_eq!(sets[1].as_ref().unwrap().pts, Some(180_000));
        assert_eq!(
            decoder.metadata_stream().map(|s| s.pid),
            Some(KLV_PID)
        );
    }

    #[test]
    fn test_bad_checksum_reported_per_set() {
        let good = encode_local_set(&[(3, b"GOOD".to_vec())]);
        let mut bad = encode_local_set(&[(3, b"BAD!".to_vec())]);
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;
        let stream = metadata_transport_stream(&[bad, good]);

        let mut decoder = MetadataDecoder::new();
        let results: Vec<_> = packets(&stream)
            .iter()
            .flat_map(|p| decoder.push(p))
            .collect();

        assert_eq!(results.len(), 2);
        assert!(matches!(
            results[0],
            Err(DecodeError::Klv(KlvError::ChecksumMismatch { .. }))
        ));
        assert!(results[1].is_ok());
    }

    #[test]
    fn test_ignores_packets_before_pmt() {
        let klv = encode_local_set(&[(3, b"EARLY".to_vec())]);
        let stream = metadata_transport_stream(&[klv]);
        let all = packets(&stream);

        let mut decoder = MetadataDecoder::new();
        assert!(decoder.push(&all[2]).is_empty());
        assert!(decoder.flush().is_empty());
    }
}
