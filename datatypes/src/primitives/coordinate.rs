use serde::{Deserialize, Serialize};

/// A WGS84 point as `(east, north)` in degrees.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Coordinate2D {
    pub east: f64,
    pub north: f64,
}

impl Coordinate2D {
    pub fn new(east: f64, north: f64) -> Self {
        Self { east, north }
    }

    pub fn distance(&self, other: &Self) -> f64 {
        let de = self.east - other.east;
        let dn = self.north - other.north;
        (de * de + dn * dn).sqrt()
    }
}

impl From<(f64, f64)> for Coordinate2D {
    fn from((east, north): (f64, f64)) -> Self {
        Self { east, north }
    }
}

impl From<Coordinate2D> for geo::Coordinate<f64> {
    fn from(c: Coordinate2D) -> Self {
        Self {
            x: c.east,
            y: c.north,
        }
    }
}

impl From<geo::Coordinate<f64>> for Coordinate2D {
    fn from(c: geo::Coordinate<f64>) -> Self {
        Self {
            east: c.x,
            north: c.y,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::approx_eq;

    #[test]
    fn distance() {
        let a = Coordinate2D::new(0., 0.);
        let b = Coordinate2D::new(3., 4.);
        assert!(approx_eq!(f64, a.distance(&b), 5.));
    }
}
