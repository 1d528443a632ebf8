//! Planar geometry for footprint and frame-center attributes.
//!
//! Geometries are exchanged with the catalog as WKT text and reduced by the
//! composable [`GeometryOperator`] chain.

pub mod algorithm;
pub mod operator;
pub mod wkt;

pub use operator::{GeometryContext, GeometryOperator};
pub use wkt::{parse_wkt, WktError};

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinate {
    pub x: f64,
    pub y: f64,
}

impl Coordinate {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

impl From<(f64, f64)> for Coordinate {
    fn from((x, y): (f64, f64)) -> Self {
        Self { x, y }
    }
}

/// Supported geometry kinds. Polygons are described by their exterior ring,
/// closed (first coordinate repeated at the end).
#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Point(Coordinate),
    LineString(Vec<Coordinate>),
    Polygon(Vec<Coordinate>),
    MultiPolygon(Vec<Vec<Coordinate>>),
}

impl Geometry {
    /// Polygon from an open or closed ring.
    pub fn polygon(mut ring: Vec<Coordinate>) -> Self {
        if let (Some(first), Some(last)) = (ring.first().copied(), ring.last().copied()) {
            if first != last {
                ring.push(first);
            }
        }
        Geometry::Polygon(ring)
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Geometry::Point(_) => false,
            Geometry::LineString(coords) | Geometry::Polygon(coords) => coords.is_empty(),
            Geometry::MultiPolygon(polygons) => polygons.iter().all(Vec::is_empty),
        }
    }

    /// Number of coordinates, counting ring closures.
    pub fn num_points(&self) -> usize {
        match self {
            Geometry::Point(_) => 1,
            Geometry::LineString(coords) | Geometry::Polygon(coords) => coords.len(),
            Geometry::MultiPolygon(polygons) => polygons.iter().map(Vec::len).sum(),
        }
    }

    pub fn coordinates(&self) -> Vec<Coordinate> {
        match self {
            Geometry::Point(c) => vec![*c],
            Geometry::LineString(coords) | Geometry::Polygon(coords) => coords.clone(),
            Geometry::MultiPolygon(polygons) => polygons.iter().flatten().copied().collect(),
        }
    }

    /// Apply `f` to every coordinate, preserving structure.
    pub fn map_coordinates(&self, f: impl Fn(Coordinate) -> Coordinate) -> Geometry {
        match self {
            Geometry::Point(c) => Geometry::Point(f(*c)),
            Geometry::LineString(coords) => {
                Geometry::LineString(coords.iter().copied().map(&f).collect())
            }
            Geometry::Polygon(coords) => Geometry::Polygon(coords.iter().copied().map(&f).collect()),
            Geometry::MultiPolygon(polygons) => Geometry::MultiPolygon(
                polygons
                    .iter()
                    .map(|ring| ring.iter().copied().map(&f).collect())
                    .collect(),
            ),
        }
    }

    /// Point for a single coordinate, line string otherwise.
    pub fn path(coords: Vec<Coordinate>) -> Geometry {
        match coords.as_slice() {
            [single] => Geometry::Point(*single),
            _ => Geometry::LineString(coords),
        }
    }

    pub fn to_wkt(&self) -> String {
        self.to_string()
    }
}

fn write_coords(f: &mut fmt::Formatter<'_>, coords: &[Coordinate]) -> fmt::Result {
    write!(f, "(")?;
    for (i, c) in coords.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{} {}", c.x, c.y)?;
    }
    write!(f, ")")
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Geometry::Point(c) => write!(f, "POINT ({} {})", c.x, c.y),
            Geometry::LineString(coords) if coords.is_empty() => write!(f, "LINESTRING EMPTY"),
            Geometry::LineString(coords) => {
                write!(f, "LINESTRING ")?;
                write_coords(f, coords)
            }
            Geometry::Polygon(coords) if coords.is_empty() => write!(f, "POLYGON EMPTY"),
            Geometry::Polygon(coords) => {
                write!(f, "POLYGON (")?;
                write_coords(f, coords)?;
                write!(f, ")")
            }
            Geometry::MultiPolygon(polygons) if polygons.is_empty() => {
                write!(f, "MULTIPOLYGON EMPTY")
            }
            Geometry::MultiPolygon(polygons) => {
                write!(f, "MULTIPOLYGON (")?;
                for (i, ring) in polygons.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "(")?;
                    write_coords(f, ring)?;
                    write!(f, ")")?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wkt_output() {
        let line = Geometry::LineString(vec![
            Coordinate::new(30.0, 10.0),
            Coordinate::new(10.0, 30.0),
            Coordinate::new(40.5, 40.0),
        ]);
        assert_eq!(line.to_wkt(), "LINESTRING (30 10, 10 30, 40.5 40)");
        assert_eq!(Geometry::LineString(vec![]).to_wkt(), "LINESTRING EMPTY");
        assert_eq!(
            Geometry::Point(Coordinate::new(-1.25, 2.0)).to_wkt(),
            "POINT (-1.25 2)"
        );
    }

    #[test]
    fn test_polygon_closes_ring() {
        let polygon = Geometry::polygon(vec![
            Coordinate::new(0.0, 0.0),
            Coordinate::new(1.0, 0.0),
            Coordinate::new(1.0, 1.0),
        ]);
        assert_eq!(polygon.num_points(), 4);
        assert_eq!(polygon.to_wkt(), "POLYGON ((0 0, 1 0, 1 1, 0 0))");
    }

    #[test]
    fn test_path_for_single_point() {
        assert_eq!(
            Geometry::path(vec![Coordinate::new(1.0, 2.0)]),
            Geometry::Point(Coordinate::new(1.0, 2.0))
        );
    }
}
