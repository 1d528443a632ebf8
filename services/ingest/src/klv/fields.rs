//! Typed decoding of UAS datalink local set items.

use super::local_set::{decode_local_set, parse_items, KlvError, LocalSetItem};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::trace;

/// Standard field names produced by the decoder.
pub mod field {
    pub const PRECISION_TIME_STAMP: &str = "Precision Time Stamp";
    pub const MISSION_ID: &str = "Mission ID";
    pub const PLATFORM_TAIL_NUMBER: &str = "Platform Tail Number";
    pub const PLATFORM_HEADING_ANGLE: &str = "Platform Heading Angle";
    pub const PLATFORM_DESIGNATION: &str = "Platform Designation";
    pub const IMAGE_SOURCE_SENSOR: &str = "Image Source Sensor";
    pub const SENSOR_LATITUDE: &str = "Sensor Latitude";
    pub const SENSOR_LONGITUDE: &str = "Sensor Longitude";
    pub const SENSOR_TRUE_ALTITUDE: &str = "Sensor True Altitude";
    pub const FRAME_CENTER_LATITUDE: &str = "Frame Center Latitude";
    pub const FRAME_CENTER_LONGITUDE: &str = "Frame Center Longitude";
    pub const FRAME_CENTER_ELEVATION: &str = "Frame Center Elevation";
    pub const OFFSET_CORNER_LATITUDE_1: &str = "Offset Corner Latitude Point 1";
    pub const OFFSET_CORNER_LONGITUDE_1: &str = "Offset Corner Longitude Point 1";
    pub const OFFSET_CORNER_LATITUDE_2: &str = "Offset Corner Latitude Point 2";
    pub const OFFSET_CORNER_LONGITUDE_2: &str = "Offset Corner Longitude Point 2";
    pub const OFFSET_CORNER_LATITUDE_3: &str = "Offset Corner Latitude Point 3";
    pub const OFFSET_CORNER_LONGITUDE_3: &str = "Offset Corner Longitude Point 3";
    pub const OFFSET_CORNER_LATITUDE_4: &str = "Offset Corner Latitude Point 4";
    pub const OFFSET_CORNER_LONGITUDE_4: &str = "Offset Corner Longitude Point 4";
    pub const PLATFORM_CALL_SIGN: &str = "Platform Call Sign";
    pub const UAS_LS_VERSION_NUMBER: &str = "UAS LS Version Number";
    pub const CORNER_LATITUDE_1: &str = "Corner Latitude Point 1";
    pub const CORNER_LONGITUDE_1: &str = "Corner Longitude Point 1";
    pub const CORNER_LATITUDE_2: &str = "Corner Latitude Point 2";
    pub const CORNER_LONGITUDE_2: &str = "Corner Longitude Point 2";
    pub const CORNER_LATITUDE_3: &str = "Corner Latitude Point 3";
    pub const CORNER_LONGITUDE_3: &str = "Corner Longitude Point 3";
    pub const CORNER_LATITUDE_4: &str = "Corner Latitude Point 4";
    pub const CORNER_LONGITUDE_4: &str = "Corner Longitude Point 4";

    // Security metadata local set
    pub const SECURITY_CLASSIFICATION: &str = "Security Classification";
    pub const CLASSIFYING_COUNTRY: &str = "Classifying Country";
    pub const OBJECT_COUNTRY_CODES: &str = "Object Country Codes";
}

/// A decoded metadata value.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    Text(String),
    Double(f64),
    Unsigned(u64),
    Timestamp(DateTime<Utc>),
}

impl MetadataValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetadataValue::Double(v) => Some(*v),
            MetadataValue::Unsigned(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Encoding {
    Text,
    /// Microseconds since the Unix epoch
    Timestamp,
    Unsigned,
    /// Signed 32-bit integer mapped onto +/- range/2; `i32::MIN` is the error indicator
    Signed32 { range: f64 },
    /// Signed 16-bit integer mapped onto +/- range/2; `i16::MIN` is the error indicator
    Signed16 { range: f64 },
    /// Unsigned 16-bit integer mapped onto [offset, offset + range]
    Unsigned16 { range: f64, offset: f64 },
    Classification,
}

struct FieldSpec {
    tag: u64,
    name: &'static str,
    encoding: Encoding,
}

const LATITUDE: Encoding = Encoding::Signed32 { range: 180.0 };
const LONGITUDE: Encoding = Encoding::Signed32 { range: 360.0 };
const ALTITUDE: Encoding = Encoding::Unsigned16 {
    range: 19_900.0,
    offset: -900.0,
};
const CORNER_OFFSET: Encoding = Encoding::Signed16 { range: 0.15 };

const SECURITY_LOCAL_SET_TAG: u64 = 48;

const UAS_FIELDS: &[FieldSpec] = &[
    FieldSpec { tag: 2, name: field::PRECISION_TIME_STAMP, encoding: Encoding::Timestamp },
    FieldSpec { tag: 3, name: field::MISSION_ID, encoding: Encoding::Text },
    FieldSpec { tag: 4, name: field::PLATFORM_TAIL_NUMBER, encoding: Encoding::Text },
    FieldSpec {
        tag: 5,
        name: field::PLATFORM_HEADING_ANGLE,
        encoding: Encoding::Unsigned16 { range: 360.0, offset: 0.0 },
    },
    FieldSpec { tag: 10, name: field::PLATFORM_DESIGNATION, encoding: Encoding::Text },
    FieldSpec { tag: 11, name: field::IMAGE_SOURCE_SENSOR, encoding: Encoding::Text },
    FieldSpec { tag: 13, name: field::SENSOR_LATITUDE, encoding: LATITUDE },
    FieldSpec { tag: 14, name: field::SENSOR_LONGITUDE, encoding: LONGITUDE },
    FieldSpec { tag: 15, name: field::SENSOR_TRUE_ALTITUDE, encoding: ALTITUDE },
    FieldSpec { tag: 23, name: field::FRAME_CENTER_LATITUDE, encoding: LATITUDE },
    FieldSpec { tag: 24, name: field::FRAME_CENTER_LONGITUDE, encoding: LONGITUDE },
    FieldSpec { tag: 25, name: field::FRAME_CENTER_ELEVATION, encoding: ALTITUDE },
    FieldSpec { tag: 26, name: field::OFFSET_CORNER_LATITUDE_1, encoding: CORNER_OFFSET },
    FieldSpec { tag: 27, name: field::OFFSET_CORNER_LONGITUDE_1, encoding: CORNER_OFFSET },
    FieldSpec { tag: 28, name: field::OFFSET_CORNER_LATITUDE_2, encoding: CORNER_OFFSET },
    FieldSpec { tag: 29, name: field::OFFSET_CORNER_LONGITUDE_2, encoding: CORNER_OFFSET },
    FieldSpec { tag: 30, name: field::OFFSET_CORNER_LATITUDE_3, encoding: CORNER_OFFSET },
    FieldSpec { tag: 31, name: field::OFFSET_CORNER_LONGITUDE_3, encoding: CORNER_OFFSET },
    FieldSpec { tag: 32, name: field::OFFSET_CORNER_LATITUDE_4, encoding: CORNER_OFFSET },
    FieldSpec { tag: 33, name: field::OFFSET_CORNER_LONGITUDE_4, encoding: CORNER_OFFSET },
    FieldSpec { tag: 59, name: field::PLATFORM_CALL_SIGN, encoding: Encoding::Text },
    FieldSpec { tag: 65, name: field::UAS_LS_VERSION_NUMBER, encoding: Encoding::Unsigned },
    FieldSpec { tag: 82, name: field::CORNER_LATITUDE_1, encoding: LATITUDE },
    FieldSpec { tag: 83, name: field::CORNER_LONGITUDE_1, encoding: LONGITUDE },
    FieldSpec { tag: 84, name: field::CORNER_LATITUDE_2, encoding: LATITUDE },
    FieldSpec { tag: 85, name: field::CORNER_LONGITUDE_2, encoding: LONGITUDE },
    FieldSpec { tag: 86, name: field::CORNER_LATITUDE_3, encoding: LATITUDE },
    FieldSpec { tag: 87, name: field::CORNER_LONGITUDE_3, encoding: LONGITUDE },
    FieldSpec { tag: 88, name: field::CORNER_LATITUDE_4, encoding: LATITUDE },
    FieldSpec { tag: 89, name: field::CORNER_LONGITUDE_4, encoding: LONGITUDE },
];

const SECURITY_FIELDS: &[FieldSpec] = &[
    FieldSpec { tag: 1, name: field::SECURITY_CLASSIFICATION, encoding: Encoding::Classification },
    FieldSpec { tag: 3, name: field::CLASSIFYING_COUNTRY, encoding: Encoding::Text },
    FieldSpec { tag: 12, name: field::OBJECT_COUNTRY_CODES, encoding: Encoding::Text },
];

fn fixed<const N: usize>(tag: u64, value: &[u8]) -> Result<[u8; N], KlvError> {
    value.try_into().map_err(|_| KlvError::InvalidValue {
        tag,
        reason: format!("expected {N} bytes, found {}", value.len()),
    })
}

/// Decode one item. `Ok(None)` means the value was present but carried the
/// error indicator or was blank.
fn decode_value(spec: &FieldSpec, value: &[u8]) -> Result<Option<MetadataValue>, KlvError> {
    let tag = spec.tag;
    let decoded = match spec.encoding {
        Encoding::Text => {
            let text = String::from_utf8_lossy(value);
            let text = text.trim_matches(|c: char| c.is_whitespace() || c == '\0');
            (!text.is_empty()).then(|| MetadataValue::Text(text.to_string()))
        }
        Encoding::Timestamp => {
            let micros = u64::from_be_bytes(fixed::<8>(tag, value)?);
            let micros = i64::try_from(micros).map_err(|_| KlvError::InvalidValue {
                tag,
                reason: "timestamp out of range".to_string(),
            })?;
            DateTime::<Utc>::from_timestamp_micros(micros).map(MetadataValue::Timestamp)
        }
        Encoding::Unsigned => {
            if value.is_empty() || value.len() > 8 {
                return Err(KlvError::InvalidValue {
                    tag,
                    reason: format!("unsigned length {}", value.len()),
                });
            }
            let v = value.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64);
            Some(MetadataValue::Unsigned(v))
        }
        Encoding::Signed32 { range } => {
            let raw = i32::from_be_bytes(fixed::<4>(tag, value)?);
            (raw != i32::MIN)
                .then(|| MetadataValue::Double(raw as f64 * range / (u32::MAX - 1) as f64))
        }
        Encoding::Signed16 { range } => {
            let raw = i16::from_be_bytes(fixed::<2>(tag, value)?);
            (raw != i16::MIN)
                .then(|| MetadataValue::Double(raw as f64 * range / (u16::MAX - 1) as f64))
        }
        Encoding::Unsigned16 { range, offset } => {
            let raw = u16::from_be_bytes(fixed::<2>(tag, value)?);
            Some(MetadataValue::Double(
                raw as f64 * range / u16::MAX as f64 + offset,
            ))
        }
        Encoding::Classification => {
            let level = match value.first() {
                Some(1) => "UNCLASSIFIED",
                Some(2) => "RESTRICTED",
                Some(3) => "CONFIDENTIAL",
                Some(4) => "SECRET",
                Some(5) => "TOP SECRET",
                _ => {
                    return Err(KlvError::InvalidValue {
                        tag,
                        reason: "unknown classification".to_string(),
                    })
                }
            };
            Some(MetadataValue::Text(level.to_string()))
        }
    };
    Ok(decoded)
}

/// Field values decoded from one KLV packet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataSet {
    /// Presentation timestamp of the carrying PES packet
    pub pts: Option<u64>,

    fields: BTreeMap<&'static str, MetadataValue>,
}

impl MetadataSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &'static str, value: MetadataValue) {
        self.fields.insert(name, value);
    }

    pub fn with(mut self, name: &'static str, value: MetadataValue) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&MetadataValue> {
        self.fields.get(name)
    }

    pub fn double(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(MetadataValue::as_f64)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

fn decode_items(items: &[LocalSetItem], specs: &[FieldSpec], set: &mut MetadataSet) {
    for item in items {
        let Some(spec) = specs.iter().find(|spec| spec.tag == item.tag) else {
            trace!(tag = item.tag, "Skipping unmapped tag");
            continue;
        };
        match decode_value(spec, &item.value) {
            Ok(Some(value)) => set.insert(spec.name, value),
            Ok(None) => trace!(field = spec.name, "Field carries no value"),
            Err(e) => trace!(field = spec.name, error = %e, "Dropping undecodable field"),
        }
    }
}

/// Validate and decode one UAS datalink KLV packet.
pub fn decode_metadata_set(packet: Bytes, pts: Option<u64>) -> Result<MetadataSet, KlvError> {
    let local_set = decode_local_set(packet)?;
    let mut set = MetadataSet {
        pts,
        ..Default::default()
    };

    decode_items(&local_set.items, UAS_FIELDS, &mut set);

    for item in local_set
        .items
        .iter()
        .filter(|item| item.tag == SECURITY_LOCAL_SET_TAG)
    {
        match parse_items(&item.value) {
            Ok(nested) => decode_items(&nested, SECURITY_FIELDS, &mut set),
            Err(e) => trace!(error = %e, "Dropping malformed security local set"),
        }
    }

    Ok(set)
}
