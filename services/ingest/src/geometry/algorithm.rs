//! Line simplification, convex hulls and coordinate cleanup.

use super::{Coordinate, Geometry};

/// Coordinates are snapped to this many units per degree.
pub const PRECISION_SCALE: f64 = 1e9;

fn cross(o: Coordinate, a: Coordinate, b: Coordinate) -> f64 {
    (a.x - o.x) * (b.y - o.y) - (a.y - o.y) * (b.x - o.x)
}

fn distance(a: Coordinate, b: Coordinate) -> f64 {
    (a.x - b.x).hypot(a.y - b.y)
}

fn segment_distance(p: Coordinate, a: Coordinate, b: Coordinate) -> f64 {
    let length_sq = (b.x - a.x).powi(2) + (b.y - a.y).powi(2);
    if length_sq == 0.0 {
        return distance(p, a);
    }
    let t = (((p.x - a.x) * (b.x - a.x) + (p.y - a.y) * (b.y - a.y)) / length_sq).clamp(0.0, 1.0);
    distance(p, Coordinate::new(a.x + t * (b.x - a.x), a.y + t * (b.y - a.y)))
}

fn within_box(a: Coordinate, b: Coordinate, p: Coordinate) -> bool {
    p.x >= a.x.min(b.x) && p.x <= a.x.max(b.x) && p.y >= a.y.min(b.y) && p.y <= a.y.max(b.y)
}

/// Whether segments `p1-p2` and `q1-q2` share any point.
pub fn segments_intersect(p1: Coordinate, p2: Coordinate, q1: Coordinate, q2: Coordinate) -> bool {
    let d1 = cross(q1, q2, p1);
    let d2 = cross(q1, q2, p2);
    let d3 = cross(p1, p2, q1);
    let d4 = cross(p1, p2, q2);

    if ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
    {
        return true;
    }

    (d1 == 0.0 && within_box(q1, q2, p1))
        || (d2 == 0.0 && within_box(q1, q2, p2))
        || (d3 == 0.0 && within_box(p1, p2, q1))
        || (d4 == 0.0 && within_box(p1, p2, q2))
}

/// Index and distance of the point in `(start, end)` farthest from the
/// segment joining the endpoints.
fn farthest(coords: &[Coordinate], start: usize, end: usize) -> Option<(usize, f64)> {
    (start + 1..end)
        .map(|i| (i, segment_distance(coords[i], coords[start], coords[end])))
        .max_by(|a, b| a.1.total_cmp(&b.1))
}

fn douglas_peucker(coords: &[Coordinate], tolerance: f64, keep: &mut [bool]) {
    let mut stack = vec![(0, coords.len() - 1)];
    while let Some((start, end)) = stack.pop() {
        if let Some((index, d)) = farthest(coords, start, end) {
            if d > tolerance {
                keep[index] = true;
                stack.push((start, index));
                stack.push((index, end));
            }
        }
    }
}

/// First pair of non-adjacent simplified segments that touch, as indices
/// into `kept`.
fn first_crossing(coords: &[Coordinate], kept: &[usize], closed: bool) -> Option<(usize, usize)> {
    let segments = kept.len().saturating_sub(1);
    for i in 0..segments {
        for j in i + 2..segments {
            if closed && i == 0 && j == segments - 1 {
                continue;
            }
            let (a1, a2) = (coords[kept[i]], coords[kept[i + 1]]);
            let (b1, b2) = (coords[kept[j]], coords[kept[j + 1]]);
            if segments_intersect(a1, a2, b1, b2) {
                return Some((i, j));
            }
        }
    }
    None
}

/// Douglas-Peucker simplification that refuses to introduce
/// self-intersections.
///
/// Whenever two simplified segments cross, the farthest dropped vertex of one
/// of them is restored, until the result is simple or nothing is left to
/// restore. Rings that would collapse below four points are returned as-is.
pub fn simplify_preserving_topology(coords: &[Coordinate], tolerance: f64) -> Vec<Coordinate> {
    if coords.len() < 3 {
        return coords.to_vec();
    }
    let closed = coords.first() == coords.last();

    let mut keep = vec![false; coords.len()];
    keep[0] = true;
    keep[coords.len() - 1] = true;
    douglas_peucker(coords, tolerance, &mut keep);

    loop {
        let kept: Vec<usize> = (0..coords.len()).filter(|&i| keep[i]).collect();
        let Some((i, j)) = first_crossing(coords, &kept, closed) else {
            break;
        };
        let restored = [i, j].into_iter().find_map(|segment| {
            farthest(coords, kept[segment], kept[segment + 1]).map(|(index, _)| index)
        });
        match restored {
            Some(index) => keep[index] = true,
            None => break,
        }
    }

    let simplified: Vec<Coordinate> = coords
        .iter()
        .zip(&keep)
        .filter_map(|(c, &k)| k.then_some(*c))
        .collect();

    if closed && simplified.len() < 4 {
        return coords.to_vec();
    }
    simplified
}

/// Convex hull as a closed counter-clockwise ring.
///
/// Fewer than three distinct points cannot enclose an area; those are
/// returned deduplicated and unclosed.
pub fn convex_hull(points: &[Coordinate]) -> Vec<Coordinate> {
    let mut sorted = points.to_vec();
    sorted.sort_by(|a, b| a.x.total_cmp(&b.x).then(a.y.total_cmp(&b.y)));
    sorted.dedup();
    if sorted.len() < 3 {
        return sorted;
    }

    fn half(points: impl Iterator<Item = Coordinate>) -> Vec<Coordinate> {
        let mut chain: Vec<Coordinate> = Vec::new();
        for p in points {
            while chain.len() >= 2 && cross(chain[chain.len() - 2], chain[chain.len() - 1], p) <= 0.0
            {
                chain.pop();
            }
            chain.push(p);
        }
        chain.pop();
        chain
    }

    let mut hull = half(sorted.iter().copied());
    hull.extend(half(sorted.iter().rev().copied()));
    if hull.len() < 3 {
        // All points collinear.
        return vec![sorted[0], sorted[sorted.len() - 1]];
    }
    hull.push(hull[0]);
    hull
}

/// Merge footprints into the smallest convex polygon covering all of them.
pub fn merge_footprints(geometries: &[Geometry]) -> Option<Geometry> {
    let points: Vec<Coordinate> = geometries.iter().flat_map(Geometry::coordinates).collect();
    let hull = convex_hull(&points);
    (hull.len() >= 4).then(|| Geometry::Polygon(hull))
}

fn snap(value: f64) -> f64 {
    (value * PRECISION_SCALE).round() / PRECISION_SCALE
}

fn snap_sequence(coords: &[Coordinate]) -> Vec<Coordinate> {
    let mut snapped: Vec<Coordinate> = coords
        .iter()
        .map(|c| Coordinate::new(snap(c.x), snap(c.y)))
        .collect();
    snapped.dedup();
    snapped
}

/// Snap coordinates to [`PRECISION_SCALE`] and drop repeated vertices.
pub fn reduce_precision(geometry: &Geometry) -> Geometry {
    match geometry {
        Geometry::Point(c) => Geometry::Point(Coordinate::new(snap(c.x), snap(c.y))),
        Geometry::LineString(coords) => Geometry::LineString(snap_sequence(coords)),
        Geometry::Polygon(coords) => Geometry::Polygon(snap_sequence(coords)),
        Geometry::MultiPolygon(polygons) => {
            Geometry::MultiPolygon(polygons.iter().map(|ring| snap_sequence(ring)).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(x: f64, y: f64) -> Coordinate {
        Coordinate::new(x, y)
    }

    #[test]
    fn test_collinear_points_removed_at_zero_tolerance() {
        let line = vec![c(0.0, 0.0), c(1.0, 0.0), c(2.0, 0.0), c(2.0, 1.0)];
        assert_eq!(
            simplify_preserving_topology(&line, 0.0),
            vec![c(0.0, 0.0), c(2.0, 0.0), c(2.0, 1.0)]
        );
    }

    #[test]
    fn test_tolerance_drops_small_deviation() {
        let line = vec![c(0.0, 0.0), c(5.0, 0.1), c(10.0, 0.0)];
        assert_eq!(
            simplify_preserving_topology(&line, 0.5),
            vec![c(0.0, 0.0), c(10.0, 0.0)]
        );
        assert_eq!(simplify_preserving_topology(&line, 0.05).len(), 3);
    }

    #[test]
    fn test_simplification_keeps_line_simple() {
        // The tail hooks up under the tent; the plain shortcut from (0, 0) to
        // (10, 0) would cross it.
        let line = vec![
            c(0.0, 0.0),
            c(5.0, 1.0),
            c(10.0, 0.0),
            c(10.0, -3.0),
            c(3.0, -3.0),
            c(3.0, 0.3),
        ];
        let simplified = simplify_preserving_topology(&line, 2.0);
        let kept: Vec<usize> = (0..simplified.len()).collect();

        assert!(simplified.contains(&c(5.0, 1.0)));
        assert!(first_crossing(&simplified, &kept, false).is_none());
    }

    #[test]
    fn test_ring_never_collapses() {
        let ring = vec![c(0.0, 0.0), c(1.0, 0.0), c(1.0, 0.001), c(0.0, 0.0)];
        assert_eq!(simplify_preserving_topology(&ring, 10.0), ring);
    }

    #[test]
    fn test_hull_of_adjacent_squares() {
        let squares: Vec<Geometry> = (0..3)
            .map(|i| {
                let x = 10.0 * i as f64;
                Geometry::polygon(vec![c(x, 0.0), c(x + 10.0, 0.0), c(x + 10.0, 10.0), c(x, 10.0)])
            })
            .collect();

        let merged = merge_footprints(&squares).unwrap();
        assert_eq!(merged.to_wkt(), "POLYGON ((0 0, 30 0, 30 10, 0 10, 0 0))");
    }

    #[test]
    fn test_hull_of_collinear_points() {
        assert!(merge_footprints(&[Geometry::LineString(vec![c(0.0, 0.0), c(1.0, 1.0), c(2.0, 2.0)])]).is_none());
    }

    #[test]
    fn test_reduce_precision_snaps_noise() {
        let line = Geometry::LineString(vec![c(1.0, 2.0), c(1.0 + 1e-12, 2.0), c(3.0, 4.0)]);
        assert_eq!(
            reduce_precision(&line),
            Geometry::LineString(vec![c(1.0, 2.0), c(3.0, 4.0)])
        );
    }
}
