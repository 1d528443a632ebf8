//! Attribute reduction: decoded metadata sets in, record attributes out.
//!
//! Each [`AttributeStrategy`] owns one target attribute. The pipeline routes
//! every metadata set to the strategies that listen to its fields, calling
//! each strategy at most once per set, and commits all strategies onto a
//! record when a segment closes.

pub mod strategy;

pub use strategy::{AttributeStrategy, Candidate, Reducer, Sources, MIN_SUBSAMPLE_COUNT};

use crate::geometry::{GeometryContext, GeometryOperator};
use crate::klv::{field, MetadataSet};
use crate::record::{attribute, Record};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct AttributePipeline {
    strategies: Vec<AttributeStrategy>,
    interest: HashMap<&'static str, Vec<usize>>,
    sets_observed: u64,
}

impl AttributePipeline {
    pub fn new(strategies: Vec<AttributeStrategy>) -> Self {
        let mut interest: HashMap<&'static str, Vec<usize>> = HashMap::new();
        for (index, strategy) in strategies.iter().enumerate() {
            for name in strategy.fields() {
                let listeners = interest.entry(name).or_default();
                if !listeners.contains(&index) {
                    listeners.push(index);
                }
            }
        }
        Self {
            strategies,
            interest,
            sets_observed: 0,
        }
    }

    /// The attributes carried by every child segment record.
    pub fn standard(operator: GeometryOperator) -> Self {
        Self::new(vec![
            AttributeStrategy::new(
                attribute::FRAME_CENTER,
                Sources::Coordinate {
                    latitude: field::FRAME_CENTER_LATITUDE,
                    longitude: field::FRAME_CENTER_LONGITUDE,
                },
                Reducer::Path(operator.clone()),
            ),
            AttributeStrategy::new(
                attribute::LOCATION,
                Sources::Corners,
                Reducer::Footprint(operator),
            ),
            AttributeStrategy::new(
                attribute::CLASSIFYING_COUNTRY,
                Sources::All(vec![field::CLASSIFYING_COUNTRY, field::OBJECT_COUNTRY_CODES]),
                Reducer::Union,
            ),
            AttributeStrategy::new(
                attribute::CLASSIFICATION,
                Sources::All(vec![field::SECURITY_CLASSIFICATION]),
                Reducer::Latest,
            ),
            AttributeStrategy::new(
                attribute::ALTITUDE,
                Sources::All(vec![field::SENSOR_TRUE_ALTITUDE]),
                Reducer::Average,
            ),
            AttributeStrategy::new(
                attribute::MISSION_ID,
                Sources::All(vec![field::MISSION_ID]),
                Reducer::Latest,
            ),
            AttributeStrategy::new(
                attribute::PLATFORM,
                Sources::FirstAvailable(vec![
                    field::PLATFORM_TAIL_NUMBER,
                    field::PLATFORM_DESIGNATION,
                    field::PLATFORM_CALL_SIGN,
                ]),
                Reducer::Latest,
            ),
            AttributeStrategy::new(
                attribute::SENSOR,
                Sources::All(vec![field::IMAGE_SOURCE_SENSOR]),
                Reducer::Latest,
            ),
            AttributeStrategy::new(
                attribute::TEMPORAL_START,
                Sources::All(vec![field::PRECISION_TIME_STAMP]),
                Reducer::Earliest,
            ),
            AttributeStrategy::new(
                attribute::TEMPORAL_END,
                Sources::All(vec![field::PRECISION_TIME_STAMP]),
                Reducer::Latest,
            ),
        ])
    }

    pub fn strategies(&self) -> &[AttributeStrategy] {
        &self.strategies
    }

    pub fn sets_observed(&self) -> u64 {
        self.sets_observed
    }

    /// Route one metadata set to every interested strategy, once each.
    pub fn observe(&mut self, set: &MetadataSet) {
        let selected: BTreeSet<usize> = set
            .field_names()
            .filter_map(|name| self.interest.get(name))
            .flatten()
            .copied()
            .collect();

        for index in selected {
            self.strategies[index].observe(set);
        }
        self.sets_observed += 1;
    }

    /// Commit every strategy onto `record`. Returns the number of attributes
    /// written.
    pub fn commit(&self, record: &mut Record, context: &GeometryContext) -> usize {
        self.strategies
            .iter()
            .filter(|strategy| strategy.commit(record, context))
            .count()
    }

    /// Commit onto a fresh record and start accumulating the next segment.
    pub fn drain(&mut self, context: &GeometryContext) -> Record {
        let mut record = Record::new();
        let committed = self.commit(&mut record, context);
        debug!(
            sets = self.sets_observed,
            attributes = committed,
            "Reduced segment metadata"
        );
        self.reset();
        record
    }

    pub fn reset(&mut self) {
        for strategy in &mut self.strategies {
            strategy.reset();
        }
        self.sets_observed = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::klv::MetadataValue;

    fn context() -> GeometryContext {
        GeometryContext {
            subsample_count: Some(1000),
            distance_tolerance: None,
        }
    }

    #[test]
    fn test_multi_field_strategy_observes_once_per_set() {
        let mut pipeline = AttributePipeline::new(vec![AttributeStrategy::new(
            attribute::CLASSIFYING_COUNTRY,
            Sources::All(vec![field::CLASSIFYING_COUNTRY, field::OBJECT_COUNTRY_CODES]),
            Reducer::Union,
        )]);

        pipeline.observe(
            &MetadataSet::new()
                .with(field::CLASSIFYING_COUNTRY, MetadataValue::Text("USA".into()))
                .with(field::OBJECT_COUNTRY_CODES, MetadataValue::Text("CAN".into())),
        );

        let candidates = pipeline.strategies()[0].candidates();
        assert_eq!(candidates.len(), 2);
        assert!(candidates.iter().all(|c| c.values.len() == 1));
    }

    #[test]
    fn test_unrelated_sets_are_not_routed() {
        let mut pipeline = AttributePipeline::standard(GeometryOperator::Identity);
        pipeline.observe(&MetadataSet::new().with(
            field::UAS_LS_VERSION_NUMBER,
            MetadataValue::Unsigned(11),
        ));

        assert_eq!(pipeline.sets_observed(), 1);
        assert!(pipeline
            .strategies()
            .iter()
            .all(|s| s.candidates().is_empty()));
    }

    #[test]
    fn test_drain_commits_and_resets() {
        let mut pipeline = AttributePipeline::standard(GeometryOperator::standard());
        pipeline.observe(
            &MetadataSet::new()
                .with(field::MISSION_ID, MetadataValue::Text("M1".into()))
                .with(field::SENSOR_TRUE_ALTITUDE, MetadataValue::Double(1500.0))
                .with(field::FRAME_CENTER_LATITUDE, MetadataValue::Double(35.0))
                .with(field::FRAME_CENTER_LONGITUDE, MetadataValue::Double(-117.0)),
        );

        let record = pipeline.drain(&context());
        assert_eq!(record.text(attribute::MISSION_ID), Some("M1"));
        assert_eq!(record.text(attribute::FRAME_CENTER), Some("POINT (-117 35)"));
        assert!(record.has(attribute::ALTITUDE));
        assert!(!record.has(attribute::LOCATION));

        let next = pipeline.drain(&context());
        assert!(!next.has(attribute::MISSION_ID));
        assert_eq!(pipeline.sets_observed(), 0);
    }
}
