//! KLV motion imagery metadata.
//!
//! Access units are pulled out of the metadata PES stream, validated against
//! the UAS local set checksum and decoded into [`MetadataSet`]s keyed by
//! standard field names.

pub mod access_unit;
pub mod decoder;
pub mod fields;
pub mod local_set;

pub use decoder::{DecodeError, MetadataDecoder};
pub use fields::{decode_metadata_set, field, MetadataSet, MetadataValue};
pub use local_set::{checksum, decode_local_set, KlvError, LocalSet, LocalSetItem};
