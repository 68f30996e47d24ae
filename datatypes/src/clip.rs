//! Clipping of polygon rings against an axis-aligned rectangle.
//!
//! The clipper walks the outer ring edge by edge. Edges fully inside the
//! rectangle are taken over verbatim. For edges that cross the rectangle's
//! boundary lines the crossing points are emitted, and where an edge passes
//! a corner region outside the rectangle the nearest rectangle corner is
//! emitted instead, provided it lies inside the source polygon. Inner holes
//! do not participate; the coastline data this was written for does not
//! need them.

use crate::primitives::{Bbox, Coordinate2D};
use geo::algorithm::contains::Contains;

/// Guards divisions by near-parallel segment deltas.
pub const NEAR_ZERO_TOL: f64 = 2.0e-9;

/// A crossing of a segment with one of the four infinite boundary lines of a
/// rectangle. `on_boundary` is true iff the point lies on the rectangle edge
/// itself rather than on the line's extension beyond the rectangle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Intersection {
    pub point: Coordinate2D,
    pub on_boundary: bool,
}

/// Easting of the crossing of segment `(p0, p1)` with the horizontal line at
/// `northing`. Falls back to the segment's midpoint easting when the segment
/// is nearly horizontal.
pub fn easting_at_northing(p0: Coordinate2D, p1: Coordinate2D, northing: f64) -> f64 {
    let dn = p1.north - p0.north;
    if dn.abs() < NEAR_ZERO_TOL {
        (p1.east + p0.east) / 2.0
    } else {
        let de = p1.east - p0.east;
        p0.east + (northing - p0.north) * (de / dn)
    }
}

/// Northing of the crossing of segment `(p0, p1)` with the vertical line at
/// `easting`. Falls back to the segment's midpoint northing when the segment
/// is nearly vertical.
pub fn northing_at_easting(p0: Coordinate2D, p1: Coordinate2D, easting: f64) -> f64 {
    let de = p1.east - p0.east;
    if de.abs() < NEAR_ZERO_TOL {
        (p1.north + p0.north) / 2.0
    } else {
        let dn = p1.north - p0.north;
        p0.north + (easting - p0.east) * (dn / de)
    }
}

fn insert_by_distance(target: &mut Vec<Intersection>, ipt: Intersection, p0: Coordinate2D) {
    let d = p0.distance(&ipt.point);
    let at = target
        .iter()
        .position(|existing| p0.distance(&existing.point) > d)
        .unwrap_or(target.len());
    target.insert(at, ipt);
}

/// All crossings of the segment `(p0, p1)` with the four boundary lines of
/// `bb`, ordered by increasing distance from `p0`. Up to four crossings, of
/// which at most two can be `on_boundary`.
pub fn find_intersections(bb: &Bbox, p0: Coordinate2D, p1: Coordinate2D) -> Vec<Intersection> {
    let mut ipoints = Vec::new();

    let min_e = bb.ll.east;
    let min_n = bb.ll.north;
    let max_e = bb.ur.east;
    let max_n = bb.ur.north;

    for northing in [min_n, max_n] {
        let crosses = (p0.north < northing && p1.north > northing)
            || (p0.north > northing && p1.north < northing);
        if crosses {
            let easting = easting_at_northing(p0, p1, northing);
            let on_boundary = easting >= min_e && easting <= max_e;
            insert_by_distance(
                &mut ipoints,
                Intersection {
                    point: Coordinate2D::new(easting, northing),
                    on_boundary,
                },
                p0,
            );
        }
    }

    for easting in [min_e, max_e] {
        let crosses = (p0.east < easting && p1.east > easting)
            || (p0.east > easting && p1.east < easting);
        if crosses {
            let northing = northing_at_easting(p0, p1, easting);
            let on_boundary = northing >= min_n && northing <= max_n;
            insert_by_distance(
                &mut ipoints,
                Intersection {
                    point: Coordinate2D::new(easting, northing),
                    on_boundary,
                },
                p0,
            );
        }
    }

    ipoints
}

/// The rectangle corner nearest to `pt`, chosen per axis.
pub fn nearest_corner(bb: &Bbox, pt: Coordinate2D) -> Coordinate2D {
    fn closest(p: f64, lo: f64, hi: f64) -> f64 {
        if (p - lo).abs() < (p - hi).abs() {
            lo
        } else {
            hi
        }
    }

    Coordinate2D::new(
        closest(pt.east, bb.ll.east, bb.ur.east),
        closest(pt.north, bb.ll.north, bb.ur.north),
    )
}

fn ring_to_polygon(ring: &[Coordinate2D]) -> geo::Polygon<f64> {
    geo::Polygon::new(
        geo::LineString::from(
            ring.iter()
                .map(|c| (c.east, c.north))
                .collect::<Vec<(f64, f64)>>(),
        ),
        vec![],
    )
}

fn same_point(a: Coordinate2D, b: Coordinate2D) -> bool {
    a.east == b.east && a.north == b.north
}

/// Appends `pt` unless it repeats the last or second-to-last emitted point.
fn push_if_not_same(clipped: &mut Vec<Coordinate2D>, pt: Coordinate2D) {
    match clipped.len() {
        0 => clipped.push(pt),
        1 => {
            if !same_point(clipped[0], pt) {
                clipped.push(pt);
            }
        }
        n => {
            if !same_point(clipped[n - 1], pt) && !same_point(clipped[n - 2], pt) {
                clipped.push(pt);
            }
        }
    }
}

/// Clips the closed outer ring `ring` against the rectangle `bb` and returns
/// the resulting closed ring. An empty result means the ring does not touch
/// the rectangle; a ring enclosing the whole rectangle yields the rectangle's
/// corners.
pub fn clip_ring(bb: &Bbox, ring: &[Coordinate2D]) -> Vec<Coordinate2D> {
    let mut clipped: Vec<Coordinate2D> = Vec::new();
    if ring.len() < 2 {
        return clipped;
    }

    // corner candidates are tested against the unclipped source ring
    let source_poly = ring_to_polygon(ring);

    let mut p0 = ring[0];
    let mut p0_inside = bb.contains(&p0);
    if p0_inside {
        clipped.push(p0);
    }

    for &p1 in &ring[1..] {
        if same_point(p0, p1) {
            continue;
        }
        let p1_inside = bb.contains(&p1);

        if p0_inside && p1_inside {
            push_if_not_same(&mut clipped, p1);
        } else {
            for ipt in find_intersections(bb, p0, p1) {
                if ipt.on_boundary {
                    push_if_not_same(&mut clipped, ipt.point);
                } else {
                    // The segment crosses a boundary line beyond the
                    // rectangle's extent, so a corner of the rectangle may
                    // belong to the clipped ring. It does iff it lies inside
                    // the source polygon.
                    let corner = nearest_corner(bb, ipt.point);
                    if source_poly.contains(&geo::Point::new(corner.east, corner.north)) {
                        push_if_not_same(&mut clipped, corner);
                    }
                }
            }
        }

        p0 = p1;
        p0_inside = p1_inside;
    }

    if clipped.len() > 1 && !same_point(clipped[0], clipped[clipped.len() - 1]) {
        clipped.push(clipped[0]);
    }

    clipped
}
