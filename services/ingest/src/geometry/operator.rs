//! Composable geometry reduction steps.

use super::algorithm::{reduce_precision, simplify_preserving_topology};
use super::Geometry;
use tracing::trace;

/// Parameters shared by every operator in a chain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeometryContext {
    /// Target point count for line strings
    pub subsample_count: Option<usize>,

    /// Simplification tolerance; `None` removes only redundant vertices
    pub distance_tolerance: Option<f64>,
}

/// One geometry reduction step, or an ordered chain of them.
///
/// Every operator maps "no geometry" to "no geometry".
#[derive(Debug, Clone, PartialEq)]
pub enum GeometryOperator {
    Identity,
    /// Evenly thin line strings to the context's subsample count
    Subsample,
    /// Topology-preserving simplification
    Simplify,
    /// Snap coordinates and drop repeated vertices
    ReducePrecision,
    /// Turn empty geometries into no geometry
    NonEmpty,
    Chain(Vec<GeometryOperator>),
}

impl GeometryOperator {
    /// Subsample, simplify, snap, and discard anything left empty.
    pub fn standard() -> Self {
        GeometryOperator::Chain(vec![
            GeometryOperator::Subsample,
            GeometryOperator::Simplify,
            GeometryOperator::ReducePrecision,
            GeometryOperator::NonEmpty,
        ])
    }

    /// Run `next` after this operator.
    pub fn then(self, next: GeometryOperator) -> Self {
        match self {
            GeometryOperator::Identity => next,
            GeometryOperator::Chain(mut steps) => {
                steps.push(next);
                GeometryOperator::Chain(steps)
            }
            other => GeometryOperator::Chain(vec![other, next]),
        }
    }

    pub fn apply(&self, geometry: Option<Geometry>, context: &GeometryContext) -> Option<Geometry> {
        let geometry = geometry?;
        match self {
            GeometryOperator::Identity => Some(geometry),
            GeometryOperator::Subsample => Some(subsample(geometry, context.subsample_count)),
            GeometryOperator::Simplify => Some(simplify(geometry, context.distance_tolerance)),
            GeometryOperator::ReducePrecision if geometry.is_empty() => Some(geometry),
            GeometryOperator::ReducePrecision => Some(reduce_precision(&geometry)),
            GeometryOperator::NonEmpty => (!geometry.is_empty()).then_some(geometry),
            GeometryOperator::Chain(steps) => steps
                .iter()
                .try_fold(geometry, |current, step| step.apply(Some(current), context)),
        }
    }
}

/// Keep `target` evenly spaced points of a line string, always including the
/// first. Other geometry kinds pass through.
fn subsample(geometry: Geometry, target: Option<usize>) -> Geometry {
    match (geometry, target) {
        (Geometry::LineString(coords), Some(target)) if target > 0 && coords.len() > target => {
            let len = coords.len();
            trace!(from = len, to = target, "Subsampling line string");
            Geometry::LineString((0..target).map(|i| coords[i * len / target]).collect())
        }
        (geometry, _) => geometry,
    }
}

fn simplify(geometry: Geometry, tolerance: Option<f64>) -> Geometry {
    if geometry.is_empty() {
        return geometry;
    }
    let tolerance = tolerance.unwrap_or(0.0);
    match geometry {
        Geometry::Point(_) => geometry,
        Geometry::LineString(coords) => {
            Geometry::LineString(simplify_preserving_topology(&coords, tolerance))
        }
        Geometry::Polygon(ring) => Geometry::Polygon(simplify_preserving_topology(&ring, tolerance)),
        Geometry::MultiPolygon(rings) => Geometry::MultiPolygon(
            rings
                .iter()
                .map(|ring| simplify_preserving_topology(ring, tolerance))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Coordinate;

    fn line(count: usize) -> Geometry {
        Geometry::LineString(
            (0..count)
                .map(|i| Coordinate::new(i as f64, (i % 7) as f64))
                .collect(),
        )
    }

    fn context(count: usize) -> GeometryContext {
        GeometryContext {
            subsample_count: Some(count),
            distance_tolerance: None,
        }
    }

    #[test]
    fn test_subsample_below_target_unchanged() {
        let input = line(999);
        let output = GeometryOperator::Subsample
            .apply(Some(input.clone()), &context(1000))
            .unwrap();
        assert_eq!(output, input);
    }

    #[test]
    fn test_subsample_above_target() {
        let input = line(1001);
        let output = GeometryOperator::Subsample
            .apply(Some(input.clone()), &context(1000))
            .unwrap();

        assert_eq!(output.num_points(), 1000);
        let (Geometry::LineString(inp), Geometry::LineString(out)) = (&input, &output) else {
            panic!("expected line strings");
        };
        assert_eq!(out[0], inp[0]);
        assert_eq!(out[999], inp[999 * 1001 / 1000]);
    }

    #[test]
    fn test_subsample_ignores_polygons() {
        let polygon = Geometry::polygon(vec![
            Coordinate::new(0.0, 0.0),
            Coordinate::new(1.0, 0.0),
            Coordinate::new(1.0, 1.0),
        ]);
        let output = GeometryOperator::Subsample
            .apply(Some(polygon.clone()), &context(2))
            .unwrap();
        assert_eq!(output, polygon);
    }

    #[test]
    fn test_none_passes_through_every_operator() {
        let operators = [
            GeometryOperator::Identity,
            GeometryOperator::Subsample,
            GeometryOperator::Simplify,
            GeometryOperator::ReducePrecision,
            GeometryOperator::NonEmpty,
            GeometryOperator::standard(),
        ];
        for operator in operators {
            assert_eq!(operator.apply(None, &context(10)), None);
        }
    }

    #[test]
    fn test_empty_geometry_unchanged_until_non_empty() {
        let empty = Geometry::LineString(vec![]);
        assert_eq!(
            GeometryOperator::Simplify.apply(Some(empty.clone()), &context(10)),
            Some(empty.clone())
        );
        assert_eq!(
            GeometryOperator::ReducePrecision.apply(Some(empty.clone()), &context(10)),
            Some(empty.clone())
        );
        assert_eq!(GeometryOperator::NonEmpty.apply(Some(empty), &context(10)), None);
    }

    #[test]
    fn test_then_builds_chain() {
        let chain = GeometryOperator::Identity
            .then(GeometryOperator::Subsample)
            .then(GeometryOperator::NonEmpty);
        assert_eq!(
            chain,
            GeometryOperator::Chain(vec![GeometryOperator::Subsample, GeometryOperator::NonEmpty])
        );
    }

    #[test]
    fn test_standard_chain_reduces_line() {
        let output = GeometryOperator::standard()
            .apply(Some(line(50)), &context(10))
            .unwrap();
        assert!(output.num_points() <= 10);
    }
}
