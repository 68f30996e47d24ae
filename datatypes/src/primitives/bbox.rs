use crate::error::{self, Error, Result};
use crate::primitives::Coordinate2D;
use serde::{Deserialize, Serialize};
use snafu::ensure;

pub const EPSG_4326: u32 = 4326;

/// An axis-aligned WGS84 rectangle given by its lower-left and upper-right
/// corners.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bbox {
    pub ll: Coordinate2D,
    pub ur: Coordinate2D,
}

impl Bbox {
    /// # Errors
    ///
    /// Fails with `UnsupportedBbox` if the corners are not ordered
    /// `ll.east <= ur.east` and `ll.north <= ur.north`.
    pub fn new(ll: Coordinate2D, ur: Coordinate2D) -> Result<Self> {
        ensure!(
            ll.east <= ur.east && ll.north <= ur.north,
            error::UnsupportedBbox {
                reason: format!("ll={ll:?} ur={ur:?}"),
            }
        );
        Ok(Self { ll, ur })
    }

    /// Builds a bbox from two corner strings as they appear in
    /// `gml:lowerCorner`/`gml:upperCorner`. `x_first` tells whether the
    /// strings are `east north` or `north east`.
    pub fn from_corner_strings(lower: &str, upper: &str, x_first: bool) -> Result<Self> {
        let ll = parse_corner(lower, x_first)?;
        let ur = parse_corner(upper, x_first)?;
        Self::new(ll, ur)
    }

    /// Converts the bbox from the given EPSG code into WGS84. Only the
    /// identity conversion from EPSG:4326 is supported.
    pub fn to_wgs84(self, epsg: u32) -> Result<Self> {
        ensure!(epsg == EPSG_4326, error::UnsupportedEpsgCode { epsg });
        Ok(self)
    }

    pub fn overlaps(&self, other: &Bbox) -> bool {
        self.ll.east <= other.ur.east
            && self.ur.east >= other.ll.east
            && self.ll.north <= other.ur.north
            && self.ur.north >= other.ll.north
    }

    /// Closed-interval point containment.
    pub fn contains(&self, pt: &Coordinate2D) -> bool {
        pt.east >= self.ll.east
            && pt.east <= self.ur.east
            && pt.north >= self.ll.north
            && pt.north <= self.ur.north
    }

    pub fn corners(&self) -> [Coordinate2D; 4] {
        [
            self.ll,
            Coordinate2D::new(self.ll.east, self.ur.north),
            self.ur,
            Coordinate2D::new(self.ur.east, self.ll.north),
        ]
    }

    /// The bbox as a closed `geo` polygon ring.
    pub fn to_polygon(&self) -> geo::Polygon<f64> {
        geo::Polygon::new(
            geo::LineString::from(vec![
                (self.ll.east, self.ll.north),
                (self.ll.east, self.ur.north),
                (self.ur.east, self.ur.north),
                (self.ur.east, self.ll.north),
                (self.ll.east, self.ll.north),
            ]),
            vec![],
        )
    }
}

fn parse_corner(input: &str, x_first: bool) -> Result<Coordinate2D> {
    let mut parts = input.split_whitespace();
    let (first, second) = match (parts.next(), parts.next()) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            return Err(Error::CornerParse {
                input: input.to_owned(),
            })
        }
    };
    let first: f64 = first.parse().map_err(|_| Error::CornerParse {
        input: input.to_owned(),
    })?;
    let second: f64 = second.parse().map_err(|_| Error::CornerParse {
        input: input.to_owned(),
    })?;

    if x_first {
        Ok(Coordinate2D::new(first, second))
    } else {
        Ok(Coordinate2D::new(second, first))
    }
}

/// Extracts the numeric EPSG code from an OGC SRS URL like
/// `http://www.opengis.net/def/crs/EPSG/0/4326`.
pub fn srs_name_to_epsg(srs_name: &str) -> Result<u32> {
    if !srs_name.starts_with("http://www.opengis.net/def/crs/EPSG") {
        return Err(Error::NoEpsgCode {
            srs_string: srs_name.to_owned(),
        });
    }
    srs_name
        .rsplit('/')
        .next()
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| Error::NoEpsgCode {
            srs_string: srs_name.to_owned(),
        })
}
