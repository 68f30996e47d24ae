//! Land-polygon cache used by the coastline ingestion predicate.
//!
//! The cache is built once per scenario run from a land shapefile: every
//! outer ring is clipped to the area of interest and the clipped polygons
//! that still relate to the AOI rectangle are kept in memory as a WGS84
//! multi-polygon. Coverage footprints are then tested against the cached
//! polygons only, which keeps the per-coverage test cheap even for global
//! land data.

use crate::clip::clip_ring;
use crate::error::{self, Result};
use crate::primitives::{Bbox, Coordinate2D};
use geo::algorithm::contains::Contains;
use geo::algorithm::intersects::Intersects;
use geo::{LineString, MultiPolygon, Polygon};
use log::warn;
use snafu::ResultExt;

#[derive(Clone, Debug)]
pub struct CoastlineCache {
    polygons: MultiPolygon<f64>,
}

impl CoastlineCache {
    /// Reads the land shapefile and builds the clipped cache for `aoi`.
    ///
    /// # Errors
    ///
    /// Fails with `ShapefileRead` if the shapefile cannot be opened or
    /// parsed.
    pub fn from_shapefile(path: &std::path::Path, aoi: &Bbox) -> Result<Self> {
        let shapes = shapefile::read_shapes(path).context(error::ShapefileRead {
            path: path.display().to_string(),
        })?;

        let mut rings = Vec::new();
        for shape in shapes {
            match shape {
                shapefile::Shape::Polygon(polygon) => {
                    for ring in polygon.rings() {
                        // outer rings only; holes are irrelevant for the
                        // intersect-or-contain test
                        if let shapefile::PolygonRing::Outer(points) = ring {
                            rings.push(
                                points
                                    .iter()
                                    .map(|p| Coordinate2D::new(p.x, p.y))
                                    .collect::<Vec<_>>(),
                            );
                        }
                    }
                }
                other => {
                    warn!(
                        "Ignoring non-polygon shape {} in {}",
                        other.shapetype(),
                        path.display()
                    );
                }
            }
        }

        Ok(Self::from_rings(&rings, aoi))
    }

    /// Builds the cache from already extracted outer rings: clips each ring
    /// to `aoi` and keeps the clipped polygons that contain, intersect or
    /// are contained by the AOI rectangle.
    pub fn from_rings(rings: &[Vec<Coordinate2D>], aoi: &Bbox) -> Self {
        let aoi_poly = aoi.to_polygon();

        let mut clipped_polys = Vec::new();
        let mut total_vertices = 0;
        for ring in rings {
            if envelope_outside_aoi(ring, aoi) {
                continue;
            }
            let clipped = clip_ring(aoi, ring);
            if clipped.len() < 4 {
                // fewer than three distinct vertices cannot form an area
                continue;
            }
            total_vertices += clipped.len();
            clipped_polys.push(Polygon::new(
                LineString::from(
                    clipped
                        .iter()
                        .map(|c| (c.east, c.north))
                        .collect::<Vec<(f64, f64)>>(),
                ),
                vec![],
            ));
        }

        if total_vertices == 0 {
            warn!("Clipping coastline to AOI results in an empty cache.");
        }

        let retained: Vec<Polygon<f64>> = clipped_polys
            .into_iter()
            .filter(|poly| {
                poly.contains(&aoi_poly)
                    || poly.intersects(&aoi_poly)
                    || aoi_poly.contains(poly)
            })
            .collect();

        Self {
            polygons: MultiPolygon(retained),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.polygons.0.is_empty()
    }

    pub fn polygon_count(&self) -> usize {
        self.polygons.0.len()
    }

    /// Tests a coverage footprint against the cached land polygons.
    ///
    /// An empty cache accepts every footprint: an unusable coastline data
    /// set must not exclude coverages.
    pub fn matches_footprint(&self, footprint: &Polygon<f64>) -> bool {
        if self.is_empty() {
            warn!("Coastline cache is empty, accepting footprint without check.");
            return true;
        }

        self.polygons.0.iter().any(|land| {
            land.intersects(footprint) || land.contains(footprint) || footprint.contains(land)
        })
    }
}

fn envelope_outside_aoi(ring: &[Coordinate2D], aoi: &Bbox) -> bool {
    let mut min_e = f64::INFINITY;
    let mut max_e = f64::NEG_INFINITY;
    let mut min_n = f64::INFINITY;
    let mut max_n = f64::NEG_INFINITY;
    for c in ring {
        min_e = min_e.min(c.east);
        max_e = max_e.max(c.east);
        min_n = min_n.min(c.north);
        max_n = max_n.max(c.north);
    }

    min_e > aoi.ur.east || max_e < aoi.ll.east || min_n > aoi.ur.north || max_n < aoi.ll.north
}
