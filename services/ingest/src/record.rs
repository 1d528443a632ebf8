//! Catalog records and their attribute values.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

pub type RecordId = String;

/// Attribute names used on parent and child records.
pub mod attribute {
    pub const TITLE: &str = "title";
    pub const CREATED: &str = "metacard.created";
    pub const MODIFIED: &str = "metacard.modified";
    pub const MEDIA_ENCODING: &str = "media.encoding";
    pub const RESOURCE_SIZE: &str = "resource.size";
    pub const LOCATION: &str = "location";
    pub const FRAME_CENTER: &str = "media.frame-center";
    pub const CLASSIFYING_COUNTRY: &str = "security.classifying-country";
    pub const CLASSIFICATION: &str = "security.classification";
    pub const SUBJECT: &str = "security.subject";
    pub const ALTITUDE: &str = "location.altitude-meters";
    pub const MISSION_ID: &str = "ext.mission-id";
    pub const PLATFORM: &str = "platform.name";
    pub const SENSOR: &str = "sensor.name";
    pub const TEMPORAL_START: &str = "media.start";
    pub const TEMPORAL_END: &str = "media.end";
    pub const DERIVED: &str = "associations.derived";
    pub const PARENT: &str = "associations.parent";
    pub const SEGMENT_SEQUENCE: &str = "ext.segment-sequence";
}

/// A typed attribute value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Text(String),
    Double(f64),
    Integer(i64),
    Timestamp(DateTime<Utc>),
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Double(v) => Some(*v),
            AttributeValue::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            AttributeValue::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::Text(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::Text(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Double(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Integer(value)
    }
}

impl From<DateTime<Utc>> for AttributeValue {
    fn from(value: DateTime<Utc>) -> Self {
        AttributeValue::Timestamp(value)
    }
}

/// A catalog entry: an identifier, multi-valued attributes and optional
/// content bytes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub id: RecordId,

    attributes: BTreeMap<String, Vec<AttributeValue>>,

    #[serde(skip)]
    resource: Option<Bytes>,
}

impl Default for Record {
    fn default() -> Self {
        Self::new()
    }
}

impl Record {
    /// An empty record with a fresh identifier.
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4().simple().to_string())
    }

    pub fn with_id(id: impl Into<RecordId>) -> Self {
        Self {
            id: id.into(),
            attributes: BTreeMap::new(),
            resource: None,
        }
    }

    pub fn values(&self, name: &str) -> &[AttributeValue] {
        self.attributes.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn value(&self, name: &str) -> Option<&AttributeValue> {
        self.values(name).first()
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.value(name).and_then(AttributeValue::as_str)
    }

    pub fn has(&self, name: &str) -> bool {
        !self.values(name).is_empty()
    }

    /// Replace all values of `name`. An empty list removes the attribute.
    pub fn set(&mut self, name: &str, values: Vec<AttributeValue>) {
        if values.is_empty() {
            self.attributes.remove(name);
        } else {
            self.attributes.insert(name.to_string(), values);
        }
    }

    pub fn set_single(&mut self, name: &str, value: impl Into<AttributeValue>) {
        self.set(name, vec![value.into()]);
    }

    /// Append `value` unless it is already present.
    pub fn add_distinct(&mut self, name: &str, value: impl Into<AttributeValue>) {
        let value = value.into();
        let values = self.attributes.entry(name.to_string()).or_default();
        if !values.contains(&value) {
            values.push(value);
        }
    }

    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(String::as_str)
    }

    /// Copy every attribute of `other` onto this record.
    pub fn merge_from(&mut self, other: &Record) {
        for (name, values) in &other.attributes {
            self.attributes.insert(name.clone(), values.clone());
        }
    }

    pub fn resource(&self) -> Option<&Bytes> {
        self.resource.as_ref()
    }

    pub fn set_resource(&mut self, content: Bytes) {
        self.set_single(attribute::RESOURCE_SIZE, content.len() as i64);
        self.resource = Some(content);
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        self.value(attribute::CREATED)
            .and_then(AttributeValue::as_timestamp)
    }
}
