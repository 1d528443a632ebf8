//! Per-attribute accumulation and reduction.

use crate::geometry::algorithm::merge_footprints;
use crate::geometry::{parse_wkt, Coordinate, Geometry, GeometryContext, GeometryOperator};
use crate::klv::{field, MetadataSet, MetadataValue};
use crate::record::{AttributeValue, Record};
use tracing::trace;

/// Smallest subsample count the path reducer accepts.
pub const MIN_SUBSAMPLE_COUNT: usize = 2;

/// Values gathered for one source field.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub field: &'static str,
    pub values: Vec<AttributeValue>,
}

/// Which decoded fields feed a strategy, and how.
#[derive(Debug, Clone, PartialEq)]
pub enum Sources {
    /// Every listed field contributes
    All(Vec<&'static str>),

    /// Only the first listed field holding any value contributes
    FirstAvailable(Vec<&'static str>),

    /// Latitude and longitude from the same set form one point
    Coordinate {
        latitude: &'static str,
        longitude: &'static str,
    },

    /// The four image corners from the same set form one polygon
    Corners,
}

const FULL_CORNERS: [(&str, &str); 4] = [
    (field::CORNER_LATITUDE_1, field::CORNER_LONGITUDE_1),
    (field::CORNER_LATITUDE_2, field::CORNER_LONGITUDE_2),
    (field::CORNER_LATITUDE_3, field::CORNER_LONGITUDE_3),
    (field::CORNER_LATITUDE_4, field::CORNER_LONGITUDE_4),
];

const OFFSET_CORNERS: [(&str, &str); 4] = [
    (field::OFFSET_CORNER_LATITUDE_1, field::OFFSET_CORNER_LONGITUDE_1),
    (field::OFFSET_CORNER_LATITUDE_2, field::OFFSET_CORNER_LONGITUDE_2),
    (field::OFFSET_CORNER_LATITUDE_3, field::OFFSET_CORNER_LONGITUDE_3),
    (field::OFFSET_CORNER_LATITUDE_4, field::OFFSET_CORNER_LONGITUDE_4),
];

fn point(set: &MetadataSet, latitude: &str, longitude: &str) -> Option<Coordinate> {
    Some(Coordinate::new(set.double(longitude)?, set.double(latitude)?))
}

/// Corner polygon from full-precision corners, or from frame center plus
/// offsets when only offsets were sent.
fn corner_polygon(set: &MetadataSet) -> Option<Geometry> {
    let full: Option<Vec<Coordinate>> = FULL_CORNERS
        .iter()
        .map(|(lat, lon)| point(set, lat, lon))
        .collect();
    if let Some(ring) = full {
        return Some(Geometry::polygon(ring));
    }

    let center = point(set, field::FRAME_CENTER_LATITUDE, field::FRAME_CENTER_LONGITUDE)?;
    let ring: Option<Vec<Coordinate>> = OFFSET_CORNERS
        .iter()
        .map(|(lat, lon)| {
            point(set, lat, lon).map(|offset| Coordinate::new(center.x + offset.x, center.y + offset.y))
        })
        .collect();
    ring.map(Geometry::polygon)
}

/// Convert a decoded value into an attribute candidate value.
fn convert(name: &str, value: &MetadataValue) -> Option<AttributeValue> {
    match value {
        MetadataValue::Text(text)
            if name == field::CLASSIFYING_COUNTRY || name == field::OBJECT_COUNTRY_CODES =>
        {
            let code = text.trim_start_matches('/').trim();
            (!code.is_empty()).then(|| AttributeValue::Text(code.to_string()))
        }
        MetadataValue::Text(text) => Some(AttributeValue::Text(text.clone())),
        MetadataValue::Double(v) => Some(AttributeValue::Double(*v)),
        MetadataValue::Unsigned(v) => i64::try_from(*v).ok().map(AttributeValue::Integer),
        MetadataValue::Timestamp(ts) => Some(AttributeValue::Timestamp(*ts)),
    }
}

impl Sources {
    pub fn fields(&self) -> Vec<&'static str> {
        match self {
            Sources::All(fields) | Sources::FirstAvailable(fields) => fields.clone(),
            Sources::Coordinate {
                latitude,
                longitude,
            } => vec![*latitude, *longitude],
            Sources::Corners => FULL_CORNERS
                .iter()
                .chain(OFFSET_CORNERS.iter())
                .flat_map(|(lat, lon)| [*lat, *lon])
                .chain([field::FRAME_CENTER_LATITUDE, field::FRAME_CENTER_LONGITUDE])
                .collect(),
        }
    }

    /// Extract `(field, value)` pairs from one metadata set.
    fn extract(&self, set: &MetadataSet) -> Vec<(&'static str, AttributeValue)> {
        match self {
            Sources::All(fields) | Sources::FirstAvailable(fields) => fields
                .iter()
                .filter_map(|&name| Some((name, convert(name, set.get(name)?)?)))
                .collect(),
            Sources::Coordinate {
                latitude,
                longitude,
            } => point(set, latitude, longitude)
                .map(|c| (*latitude, AttributeValue::Text(Geometry::Point(c).to_wkt())))
                .into_iter()
                .collect(),
            Sources::Corners => corner_polygon(set)
                .map(|polygon| (field::CORNER_LATITUDE_1, AttributeValue::Text(polygon.to_wkt())))
                .into_iter()
                .collect(),
        }
    }

    /// Values the reducer sees, in source priority order.
    fn select<'a>(&self, candidates: &'a [Candidate]) -> Vec<&'a AttributeValue> {
        let for_field =
            |name: &str| candidates.iter().find(|c| c.field == name).map(|c| &c.values);
        match self {
            Sources::FirstAvailable(fields) => fields
                .iter()
                .find_map(|name| for_field(*name).filter(|values| !values.is_empty()))
                .map(|values| values.iter().collect())
                .unwrap_or_default(),
            _ => {
                let mut ordered = self.fields();
                ordered.dedup();
                ordered
                    .iter()
                    .filter_map(|name| for_field(*name))
                    .flatten()
                    .collect()
            }
        }
    }
}

/// How accumulated values collapse into the committed attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum Reducer {
    /// Distinct values in first-seen order
    Union,
    /// Arithmetic mean of numeric values
    Average,
    /// First value observed
    Earliest,
    /// Last value observed
    Latest,
    /// Points joined into a path, then passed through the operator chain
    Path(GeometryOperator),
    /// Polygons merged into one footprint, then passed through the chain
    Footprint(GeometryOperator),
}

fn parse_geometries(values: &[&AttributeValue]) -> Vec<Geometry> {
    values
        .iter()
        .filter_map(|v| v.as_str())
        .filter_map(|wkt| match parse_wkt(wkt) {
            Ok(geometry) => Some(geometry),
            Err(e) => {
                trace!(error = %e, "Skipping unparsable geometry candidate");
                None
            }
        })
        .collect()
}

impl Reducer {
    fn reduce(&self, values: &[&AttributeValue], context: &GeometryContext) -> Vec<AttributeValue> {
        match self {
            Reducer::Union => {
                let mut distinct: Vec<AttributeValue> = Vec::new();
                for value in values {
                    if !distinct.contains(value) {
                        distinct.push((*value).clone());
                    }
                }
                distinct
            }
            Reducer::Average => {
                let numbers: Vec<f64> = values.iter().filter_map(|v| v.as_f64()).collect();
                if numbers.is_empty() {
                    return Vec::new();
                }
                let mean = numbers.iter().sum::<f64>() / numbers.len() as f64;
                vec![AttributeValue::Double(mean)]
            }
            Reducer::Earliest => values.first().map(|v| (*v).clone()).into_iter().collect(),
            Reducer::Latest => values.last().map(|v| (*v).clone()).into_iter().collect(),
            Reducer::Path(operator) => {
                match context.subsample_count {
                    Some(count) if count >= MIN_SUBSAMPLE_COUNT => {}
                    _ => {
                        trace!("Subsample count missing or too small, frame center skipped");
                        return Vec::new();
                    }
                }
                let coords: Vec<Coordinate> = parse_geometries(values)
                    .iter()
                    .flat_map(Geometry::coordinates)
                    .collect();
                if coords.is_empty() {
                    return Vec::new();
                }
                operator
                    .apply(Some(Geometry::path(coords)), context)
                    .map(|g| AttributeValue::Text(g.to_wkt()))
                    .into_iter()
                    .collect()
            }
            Reducer::Footprint(operator) => {
                let footprint = merge_footprints(&parse_geometries(values));
                operator
                    .apply(footprint, context)
                    .map(|g| AttributeValue::Text(g.to_wkt()))
                    .into_iter()
                    .collect()
            }
        }
    }
}

/// One target attribute backed by one reduction strategy.
#[derive(Debug, Clone)]
pub struct AttributeStrategy {
    attribute: &'static str,
    sources: Sources,
    reducer: Reducer,
    candidates: Vec<Candidate>,
}

impl AttributeStrategy {
    pub fn new(attribute: &'static str, sources: Sources, reducer: Reducer) -> Self {
        Self {
            attribute,
            sources,
            reducer,
            candidates: Vec::new(),
        }
    }

    pub fn attribute(&self) -> &'static str {
        self.attribute
    }

    pub fn fields(&self) -> Vec<&'static str> {
        self.sources.fields()
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    /// Accumulate the candidate values found in one metadata set.
    pub fn observe(&mut self, set: &MetadataSet) {
        for (name, value) in self.sources.extract(set) {
            match self.candidates.iter_mut().find(|c| c.field == name) {
                Some(candidate) => candidate.values.push(value),
                None => self.candidates.push(Candidate {
                    field: name,
                    values: vec![value],
                }),
            }
        }
    }

    /// Reduce the accumulated candidates onto `record`.
    ///
    /// Returns whether anything was committed; an empty reduction leaves the
    /// record untouched.
    pub fn commit(&self, record: &mut Record, context: &GeometryContext) -> bool {
        let selected = self.sources.select(&self.candidates);
        if selected.is_empty() {
            return false;
        }
        let reduced = self.reducer.reduce(&selected, context);
        if reduced.is_empty() {
            return false;
        }
        record.set(self.attribute, reduced);
        true
    }

    pub fn reset(&mut self) {
        self.candidates.clear();
    }
}
