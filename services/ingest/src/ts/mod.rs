//! MPEG transport stream framing.
//!
//! Datagrams arrive with no alignment guarantees. The [`FrameSynchronizer`]
//! recovers 188-byte packet boundaries, [`psi`] locates the metadata
//! elementary stream and [`pes`] reassembles its PES packets.

pub mod packet;
pub mod pes;
pub mod psi;
pub mod sync;

pub use packet::{PacketError, TsPacket, TS_PACKET_SIZE, TS_SYNC_BYTE};
pub use pes::{PesAssembler, PesError, PesPacket};
pub use psi::{MetadataFraming, MetadataStream, PsiError};
pub use sync::{FrameSynchronizer, SyncStats, SyncedPacket};
