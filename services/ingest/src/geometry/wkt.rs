//! Minimal WKT reader for the geometry kinds stored on records.

use super::{Coordinate, Geometry};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WktError {
    #[error("Unsupported geometry type: {0}")]
    UnsupportedType(String),

    #[error("Unexpected end of input")]
    UnexpectedEnd,

    #[error("Expected '{expected}' at offset {offset}")]
    Expected { expected: char, offset: usize },

    #[error("Invalid number at offset {0}")]
    InvalidNumber(usize),

    #[error("Trailing input at offset {0}")]
    TrailingInput(usize),
}

struct Cursor<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn skip_whitespace(&mut self) {
        let rest = &self.text[self.pos..];
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_whitespace();
        self.text[self.pos..].chars().next()
    }

    fn expect(&mut self, expected: char) -> Result<(), WktError> {
        match self.peek() {
            Some(c) if c == expected => {
                self.pos += c.len_utf8();
                Ok(())
            }
            Some(_) => Err(WktError::Expected {
                expected,
                offset: self.pos,
            }),
            None => Err(WktError::UnexpectedEnd),
        }
    }

    fn word(&mut self) -> &'a str {
        self.skip_whitespace();
        let text = self.text;
        let rest = &text[self.pos..];
        let len = rest
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(rest.len());
        self.pos += len;
        &rest[..len]
    }

    fn number(&mut self) -> Result<f64, WktError> {
        self.skip_whitespace();
        let start = self.pos;
        let rest = &self.text[start..];
        let len = rest
            .find(|c: char| !(c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E')))
            .unwrap_or(rest.len());
        self.pos += len;
        rest[..len]
            .parse()
            .map_err(|_| WktError::InvalidNumber(start))
    }

    /// `( x y, x y, ... )`
    fn coordinates(&mut self) -> Result<Vec<Coordinate>, WktError> {
        self.expect('(')?;
        let mut coords = Vec::new();
        loop {
            let x = self.number()?;
            let y = self.number()?;
            // Z and M ordinates are ignored.
            while matches!(self.peek(), Some(c) if c != ',' && c != ')') {
                self.number()?;
            }
            coords.push(Coordinate::new(x, y));
            if self.peek() == Some(',') {
                self.pos += 1;
            } else {
                break;
            }
        }
        self.expect(')')?;
        Ok(coords)
    }

    /// `( (ring), (ring), ... )`
    fn rings(&mut self) -> Result<Vec<Vec<Coordinate>>, WktError> {
        self.expect('(')?;
        let mut rings = vec![self.coordinates()?];
        while self.peek() == Some(',') {
            self.pos += 1;
            rings.push(self.coordinates()?);
        }
        self.expect(')')?;
        Ok(rings)
    }

    fn empty(&mut self) -> bool {
        let save = self.pos;
        if self.word().eq_ignore_ascii_case("EMPTY") {
            return true;
        }
        self.pos = save;
        false
    }
}

/// Parse POINT, LINESTRING, POLYGON or MULTIPOLYGON text.
///
/// Only the exterior ring of each polygon is kept.
pub fn parse_wkt(text: &str) -> Result<Geometry, WktError> {
    let mut cursor = Cursor { text, pos: 0 };
    let kind = cursor.word().to_ascii_uppercase();

    let geometry = match kind.as_str() {
        "POINT" => {
            let coords = cursor.coordinates()?;
            let point = coords.first().copied().ok_or(WktError::UnexpectedEnd)?;
            Geometry::Point(point)
        }
        "LINESTRING" if cursor.empty() => Geometry::LineString(Vec::new()),
        "LINESTRING" => Geometry::LineString(cursor.coordinates()?),
        "POLYGON" if cursor.empty() => Geometry::Polygon(Vec::new()),
        "POLYGON" => {
            let mut rings = cursor.rings()?;
            Geometry::Polygon(rings.swap_remove(0))
        }
        "MULTIPOLYGON" if cursor.empty() => Geometry::MultiPolygon(Vec::new()),
        "MULTIPOLYGON" => {
            cursor.expect('(')?;
            let mut polygons = vec![cursor.rings()?.swap_remove(0)];
            while cursor.peek() == Some(',') {
                cursor.pos += 1;
                polygons.push(cursor.rings()?.swap_remove(0));
            }
            cursor.expect(')')?;
            Geometry::MultiPolygon(polygons)
        }
        _ => return Err(WktError::UnsupportedType(kind)),
    };

    if cursor.peek().is_some() {
        return Err(WktError::TrailingInput(cursor.pos));
    }
    Ok(geometry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_linestring() {
        let geometry = parse_wkt("LINESTRING (30 10, 10 30, 40 40)").unwrap();
        assert_eq!(
            geometry,
            Geometry::LineString(vec![
                Coordinate::new(30.0, 10.0),
                Coordinate::new(10.0, 30.0),
                Coordinate::new(40.0, 40.0),
            ])
        );
    }

    #[test]
    fn test_parse_tolerates_spacing_and_case() {
        let geometry = parse_wkt("polygon((0  0,10 0, 10 10 ,0 10, 0 0))").unwrap();
        assert_eq!(geometry.num_points(), 5);
    }

    #[test]
    fn test_parse_point_with_z() {
        assert_eq!(
            parse_wkt("POINT (1.5 -2 100)").unwrap(),
            Geometry::Point(Coordinate::new(1.5, -2.0))
        );
    }

    #[test]
    fn test_parse_multipolygon() {
        let geometry =
            parse_wkt("MULTIPOLYGON (((0 0, 1 0, 1 1, 0 0)), ((5 5, 6 5, 6 6, 5 5)))").unwrap();
        match geometry {
            Geometry::MultiPolygon(polygons) => assert_eq!(polygons.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_empty() {
        assert!(parse_wkt("LINESTRING EMPTY").unwrap().is_empty());
    }

    #[test]
    fn test_round_trip_display() {
        let text = "POLYGON ((0 0, 30 0, 30 10, 0 10, 0 0))";
        assert_eq!(parse_wkt(text).unwrap().to_wkt(), text);
    }

    #[test]
    fn test_rejects_unknown_type() {
        assert_eq!(
            parse_wkt("CIRCLE (0 0)"),
            Err(WktError::UnsupportedType("CIRCLE".to_string()))
        );
    }

    #[test]
    fn test_rejects_trailing_input() {
        assert!(matches!(
            parse_wkt("POINT (1 2) extra"),
            Err(WktError::TrailingInput(_))
        ));
    }
}
