//! Extraction of EO-WCS metadata from capabilities and coverage-description
//! documents.
//!
//! Matching is namespace-aware for the well-known EO/WCS paths. User-supplied
//! condition paths are matched by local name when their prefix is not one of
//! the well-known ones, so conditions keep working against feeds that bind
//! other prefixes.

use crate::error::{Error, Result};
use eoingest_datatypes::primitives::{bbox::srs_name_to_epsg, Bbox, TimePeriod};
use log::{error, warn};
use roxmltree::{Document, Node};

pub const WCS_NS: &str = "http://www.opengis.net/wcs/2.0";
pub const WCSEO_NS: &str = "http://www.opengis.net/wcseo/1.0";
pub const OWS_NS: &str = "http://www.opengis.net/ows/2.0";
pub const GML_NS: &str = "http://www.opengis.net/gml/3.2";
pub const GMLCOV_NS: &str = "http://www.opengis.net/gmlcov/1.0";
pub const EOP_NS: &str = "http://www.opengis.net/eop/2.0";
pub const OM_NS: &str = "http://www.opengis.net/om/2.0";
pub const OPT_NS: &str = "http://www.opengis.net/opt/2.0";

pub const EXCEPTION_TAG: &str = "ExceptionReport";
pub const DEFAULT_SERVICE_VERSION: &str = "2.0.1";

/// One element step of a fully qualified metadata path.
#[derive(Clone, Copy, Debug)]
pub struct Step {
    pub ns: &'static str,
    pub local: &'static str,
}

const fn step(ns: &'static str, local: &'static str) -> Step {
    Step { ns, local }
}

const EO_METADATA: [Step; 3] = [
    step(GMLCOV_NS, "metadata"),
    step(GMLCOV_NS, "Extension"),
    step(WCSEO_NS, "EOMetadata"),
];

pub const PHENOMENON_TIME_PATH: [Step; 5] = [
    EO_METADATA[0],
    EO_METADATA[1],
    EO_METADATA[2],
    step(EOP_NS, "EarthObservation"),
    step(OM_NS, "phenomenonTime"),
];

pub const SENSOR_PATH: [Step; 9] = [
    EO_METADATA[0],
    EO_METADATA[1],
    EO_METADATA[2],
    step(EOP_NS, "EarthObservation"),
    step(OM_NS, "procedure"),
    step(EOP_NS, "EarthObservationEquipment"),
    step(EOP_NS, "sensor"),
    step(EOP_NS, "Sensor"),
    step(EOP_NS, "sensorType"),
];

pub const INCIDENCE_ANGLE_PATH: [Step; 9] = [
    EO_METADATA[0],
    EO_METADATA[1],
    EO_METADATA[2],
    step(EOP_NS, "EarthObservation"),
    step(OM_NS, "procedure"),
    step(EOP_NS, "EarthObservationEquipment"),
    step(EOP_NS, "acquisitionParameters"),
    step(EOP_NS, "Acquisition"),
    step(EOP_NS, "incidenceAngle"),
];

pub const CLOUD_COVER_PATH: [Step; 7] = [
    EO_METADATA[0],
    EO_METADATA[1],
    EO_METADATA[2],
    step(EOP_NS, "EarthObservation"),
    step(OM_NS, "result"),
    step(OPT_NS, "EarthObservationResult"),
    step(OPT_NS, "cloudCoverPercentage"),
];

pub const FOOTPRINT_PATH: [Step; 12] = [
    EO_METADATA[0],
    EO_METADATA[1],
    EO_METADATA[2],
    step(EOP_NS, "EarthObservation"),
    step(OM_NS, "featureOfInterest"),
    step(EOP_NS, "Footprint"),
    step(EOP_NS, "multiExtentOf"),
    step(GML_NS, "MultiSurface"),
    step(GML_NS, "surfaceMember"),
    step(GML_NS, "Polygon"),
    step(GML_NS, "exterior"),
    step(GML_NS, "LinearRing"),
];

fn ns_for_prefix(prefix: &str) -> Option<&'static str> {
    match prefix {
        "wcs" => Some(WCS_NS),
        "wcseo" => Some(WCSEO_NS),
        "ows" => Some(OWS_NS),
        "gml" => Some(GML_NS),
        "gmlcov" => Some(GMLCOV_NS),
        "eop" => Some(EOP_NS),
        "om" => Some(OM_NS),
        "opt" => Some(OPT_NS),
        _ => None,
    }
}

fn is_named(node: Node, ns: &str, local: &str) -> bool {
    node.is_element() && node.tag_name().name() == local && node.tag_name().namespace() == Some(ns)
}

pub fn child_element<'a, 'd>(node: Node<'a, 'd>, ns: &str, local: &str) -> Option<Node<'a, 'd>> {
    node.children().find(|c| is_named(*c, ns, local))
}

pub fn find_path<'a, 'd>(node: Node<'a, 'd>, path: &[Step]) -> Option<Node<'a, 'd>> {
    let mut current = node;
    for s in path {
        current = child_element(current, s.ns, s.local)?;
    }
    Some(current)
}

pub fn path_text(node: Node, path: &[Step]) -> Option<String> {
    find_path(node, path)
        .and_then(|leaf| leaf.text())
        .map(|t| t.trim().to_owned())
}

pub fn is_exception_report(doc: &Document) -> bool {
    doc.root_element().tag_name().name() == EXCEPTION_TAG
}

/// `wcs:CoverageDescription` elements of a DescribeEOCoverageSet response.
pub fn coverage_descriptions<'a, 'd>(root: Node<'a, 'd>) -> Vec<Node<'a, 'd>> {
    child_element(root, WCS_NS, "CoverageDescriptions")
        .map(|container| {
            container
                .children()
                .filter(|c| is_named(*c, WCS_NS, "CoverageDescription"))
                .collect()
        })
        .unwrap_or_default()
}

/// `wcs:CoverageId` child, falling back to the `gml:id` attribute.
pub fn extract_coverage_id(cd: Node) -> Option<String> {
    if let Some(id) = child_element(cd, WCS_NS, "CoverageId").and_then(|n| n.text()) {
        return Some(id.trim().to_owned());
    }
    cd.attribute((GML_NS, "id")).map(|id| id.to_owned())
}

fn is_x_axis_first(axis_labels: &str) -> bool {
    let labels: Vec<String> = axis_labels
        .trim()
        .to_lowercase()
        .split_whitespace()
        .map(ToOwned::to_owned)
        .collect();
    if labels.len() != 2 {
        error!("Cannot parse axisLabels '{axis_labels}'");
        return false;
    }
    match labels[0].as_str() {
        "lat" | "y" => false,
        "long" | "x" => true,
        _ => {
            error!("Cannot parse axisLabels '{axis_labels}'");
            false
        }
    }
}

/// The coverage's `gml:boundedBy/gml:Envelope`, converted to WGS84. `None`
/// (with a logged reason) when the envelope is missing, unparseable or in an
/// unsupported SRS.
pub fn extract_gml_bbox(cd: Node) -> Option<Bbox> {
    let envelope = child_element(cd, GML_NS, "boundedBy")
        .and_then(|bounded| child_element(bounded, GML_NS, "Envelope"))?;

    let (axis_labels, srs_name) = match (envelope.attribute("axisLabels"), envelope.attribute("srsName")) {
        (Some(a), Some(s)) => (a, s),
        _ => {
            error!("srsName or axisLabels not found in envelope");
            return None;
        }
    };
    let epsg = match srs_name_to_epsg(srs_name) {
        Ok(epsg) => epsg,
        Err(e) => {
            error!("{e}");
            return None;
        }
    };

    let lc = child_element(envelope, GML_NS, "lowerCorner").and_then(|n| n.text());
    let uc = child_element(envelope, GML_NS, "upperCorner").and_then(|n| n.text());
    let (lc, uc) = match (lc, uc) {
        (Some(lc), Some(uc)) => (lc, uc),
        _ => {
            error!("lowerCorner or upperCorner not found in envelope");
            return None;
        }
    };

    let bb = match Bbox::from_corner_strings(lc, uc, is_x_axis_first(axis_labels)) {
        Ok(bb) => bb,
        Err(e) => {
            error!("Cannot parse envelope corners: {e}");
            return None;
        }
    };
    match bb.to_wgs84(epsg) {
        Ok(bb) => Some(bb),
        Err(e) => {
            error!("{e}");
            None
        }
    }
}

/// `gml:TimePeriod` child with begin/end positions.
pub fn extract_time_period(parent: Node) -> Option<TimePeriod> {
    let tp = child_element(parent, GML_NS, "TimePeriod")?;
    let begin = child_element(tp, GML_NS, "beginPosition").and_then(|n| n.text())?;
    let end = child_element(tp, GML_NS, "endPosition").and_then(|n| n.text())?;
    match TimePeriod::from_strings(begin, end) {
        Ok(period) => Some(period),
        Err(e) => {
            warn!("Cannot parse TimePeriod: {e}");
            None
        }
    }
}

/// The coverage's acquisition time from `om:phenomenonTime`.
pub fn extract_om_time(cd: Node) -> Option<TimePeriod> {
    let phenomenon_time = match find_path(cd, &PHENOMENON_TIME_PATH) {
        Some(node) => node,
        None => {
            error!("Failed to find 'phenomenonTime'");
            return None;
        }
    };
    extract_time_period(phenomenon_time)
}

/// The coverage footprint polygon in `(east, north)` order. The feed carries
/// `(lat, long)` pairs, swapped here on ingest.
pub fn extract_footprint(cd: Node) -> Option<geo::Polygon<f64>> {
    let ring = find_path(cd, &FOOTPRINT_PATH)?;
    let pos_list = child_element(ring, GML_NS, "posList").and_then(|n| n.text())?;

    let values: Vec<f64> = pos_list
        .split_whitespace()
        .map(str::parse)
        .collect::<std::result::Result<_, _>>()
        .ok()?;
    if values.len() < 6 || values.len() % 2 != 0 {
        warn!("Footprint posList has {} values, ignoring it", values.len());
        return None;
    }

    let coords: Vec<(f64, f64)> = values.chunks(2).map(|pair| (pair[1], pair[0])).collect();
    Some(geo::Polygon::new(geo::LineString::from(coords), vec![]))
}

// --- capabilities ---------------------------------------------------------

pub fn extract_service_type_version(caps: Node) -> String {
    let version = child_element(caps, OWS_NS, "ServiceIdentification")
        .and_then(|si| child_element(si, OWS_NS, "ServiceTypeVersion"))
        .and_then(|n| n.text());
    match version {
        Some(v) => v.trim().to_owned(),
        None => {
            warn!("ServiceTypeVersion not found, assuming {DEFAULT_SERVICE_VERSION}");
            DEFAULT_SERVICE_VERSION.to_owned()
        }
    }
}

pub fn dataset_series_summaries<'a, 'd>(caps: Node<'a, 'd>) -> Vec<Node<'a, 'd>> {
    let extension = child_element(caps, WCS_NS, "Contents")
        .and_then(|contents| child_element(contents, WCS_NS, "Extension"));
    match extension {
        Some(ext) => ext
            .children()
            .filter(|c| is_named(*c, WCSEO_NS, "DatasetSeriesSummary"))
            .collect(),
        None => {
            error!("Contents/Extension not found in capabilities");
            Vec::new()
        }
    }
}

pub fn extract_dataset_series_id(dss: Node) -> Option<String> {
    match child_element(dss, WCSEO_NS, "DatasetSeriesId").and_then(|n| n.text()) {
        Some(id) => Some(id.trim().to_owned()),
        None => {
            error!("'DatasetSeriesId' not found in DatasetSeriesSummary");
            None
        }
    }
}

/// `ows:WGS84BoundingBox` of a dataset series summary; corners are x-first.
pub fn extract_wgs84_bbox(dss: Node) -> Option<Bbox> {
    let bbox = match child_element(dss, OWS_NS, "WGS84BoundingBox") {
        Some(node) => node,
        None => {
            error!("'WGS84BoundingBox' not found in DatasetSeriesSummary");
            return None;
        }
    };
    let lc = child_element(bbox, OWS_NS, "LowerCorner").and_then(|n| n.text());
    let uc = child_element(bbox, OWS_NS, "UpperCorner").and_then(|n| n.text());
    let (lc, uc) = match (lc, uc) {
        (Some(lc), Some(uc)) => (lc, uc),
        _ => {
            error!("LowerCorner or UpperCorner not found in WGS84BoundingBox");
            return None;
        }
    };
    match Bbox::from_corner_strings(lc, uc, true) {
        Ok(bb) => Some(bb),
        Err(e) => {
            error!("Cannot parse WGS84BoundingBox: {e}");
            None
        }
    }
}

// --- user-supplied condition paths ----------------------------------------

struct UserStep {
    ns: Option<&'static str>,
    local: String,
}

fn parse_user_path(path: &str) -> Result<Vec<UserStep>> {
    let mut steps = Vec::new();
    for raw in path.split('/') {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::Ingestion {
                message: format!("Malformed condition path '{path}'"),
            });
        }
        let (prefix, local) = match raw.split_once(':') {
            Some((prefix, local)) => (Some(prefix), local),
            None => (None, raw),
        };
        if local.is_empty() {
            return Err(Error::Ingestion {
                message: format!("Malformed condition path '{path}'"),
            });
        }
        steps.push(UserStep {
            ns: prefix.and_then(ns_for_prefix),
            local: local.to_owned(),
        });
    }
    Ok(steps)
}

fn matches_user_step(node: Node, s: &UserStep) -> bool {
    if !node.is_element() || node.tag_name().name() != s.local {
        return false;
    }
    match s.ns {
        Some(ns) => node.tag_name().namespace() == Some(ns),
        None => true,
    }
}

/// All nodes below `cd` matching the user-supplied path. The first step is
/// searched among all descendants, the remaining steps are child steps,
/// mirroring a `.//a/b/c` lookup.
///
/// # Errors
///
/// Fails with `Ingestion` if the path is syntactically malformed.
pub fn find_descendant_paths<'a, 'd>(cd: Node<'a, 'd>, path: &str) -> Result<Vec<Node<'a, 'd>>> {
    let steps = parse_user_path(path)?;

    let mut matches: Vec<Node> = cd
        .descendants()
        .filter(|n| *n != cd && matches_user_step(*n, &steps[0]))
        .collect();

    for s in &steps[1..] {
        matches = matches
            .into_iter()
            .flat_map(|n| n.children().filter(|c| matches_user_step(*c, s)))
            .collect();
    }

    Ok(matches)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const COVERAGE_DESCRIPTION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<wcs:CoverageDescription
    xmlns:wcs="http://www.opengis.net/wcs/2.0"
    xmlns:wcseo="http://www.opengis.net/wcseo/1.0"
    xmlns:gml="http://www.opengis.net/gml/3.2"
    xmlns:gmlcov="http://www.opengis.net/gmlcov/1.0"
    xmlns:om="http://www.opengis.net/om/2.0"
    xmlns:opt="http://www.opengis.net/opt/2.0"
    xmlns:eop="http://www.opengis.net/eop/2.0"
    gml:id="cov_fallback_id">
  <gml:boundedBy>
    <gml:Envelope axisLabels="lat long" srsDimension="2"
        srsName="http://www.opengis.net/def/crs/EPSG/0/4326" uomLabels="deg deg">
      <gml:lowerCorner>52.5 8.3</gml:lowerCorner>
      <gml:upperCorner>53.1 8.9</gml:upperCorner>
    </gml:Envelope>
  </gml:boundedBy>
  <wcs:CoverageId>cov_20110119_199_030</wcs:CoverageId>
  <gmlcov:metadata>
    <gmlcov:Extension>
      <wcseo:EOMetadata>
        <eop:EarthObservation gml:id="eop_1">
          <om:phenomenonTime>
            <gml:TimePeriod gml:id="tp_1">
              <gml:beginPosition>2011-01-19T00:00:00</gml:beginPosition>
              <gml:endPosition>2011-01-19T00:10:00</gml:endPosition>
            </gml:TimePeriod>
          </om:phenomenonTime>
          <om:procedure>
            <eop:EarthObservationEquipment gml:id="eq_1">
              <eop:sensor>
                <eop:Sensor>
                  <eop:sensorType>OPTICAL</eop:sensorType>
                </eop:Sensor>
              </eop:sensor>
              <eop:acquisitionParameters>
                <eop:Acquisition>
                  <eop:incidenceAngle uom="deg">+7.23391641</eop:incidenceAngle>
                </eop:Acquisition>
              </eop:acquisitionParameters>
            </eop:EarthObservationEquipment>
          </om:procedure>
          <om:result>
            <opt:EarthObservationResult gml:id="res_1">
              <opt:cloudCoverPercentage uom="%">13.25</opt:cloudCoverPercentage>
            </opt:EarthObservationResult>
          </om:result>
          <om:featureOfInterest>
            <eop:Footprint gml:id="fp_1">
              <eop:multiExtentOf>
                <gml:MultiSurface srsName="urn:ogc:def:crs:EPSG:6.3:4326" gml:id="ms_1">
                  <gml:surfaceMember>
                    <gml:Polygon gml:id="poly_1">
                      <gml:exterior>
                        <gml:LinearRing>
                          <gml:posList>52.6 8.4 52.6 8.7 53.0 8.7 53.0 8.4 52.6 8.4</gml:posList>
                        </gml:LinearRing>
                      </gml:exterior>
                    </gml:Polygon>
                  </gml:surfaceMember>
                </gml:MultiSurface>
              </eop:multiExtentOf>
            </eop:Footprint>
          </om:featureOfInterest>
        </eop:EarthObservation>
      </wcseo:EOMetadata>
    </gmlcov:Extension>
  </gmlcov:metadata>
</wcs:CoverageDescription>
"#;

    #[test]
    fn extracts_coverage_id() {
        let doc = Document::parse(COVERAGE_DESCRIPTION).unwrap();
        assert_eq!(
            extract_coverage_id(doc.root_element()).as_deref(),
            Some("cov_20110119_199_030")
        );
    }

    #[test]
    fn falls_back_to_gml_id() {
        let xml = r#"<wcs:CoverageDescription
            xmlns:wcs="http://www.opengis.net/wcs/2.0"
            xmlns:gml="http://www.opengis.net/gml/3.2"
            gml:id="the_fallback"/>"#;
        let doc = Document::parse(xml).unwrap();
        assert_eq!(
            extract_coverage_id(doc.root_element()).as_deref(),
            Some("the_fallback")
        );
    }

    #[test]
    fn extracts_envelope_with_lat_first_axes() {
        let doc = Document::parse(COVERAGE_DESCRIPTION).unwrap();
        let bb = extract_gml_bbox(doc.root_element()).unwrap();
        assert_eq!(bb.ll.east, 8.3);
        assert_eq!(bb.ll.north, 52.5);
        assert_eq!(bb.ur.east, 8.9);
        assert_eq!(bb.ur.north, 53.1);
    }

    #[test]
    fn extracts_phenomenon_time() {
        let doc = Document::parse(COVERAGE_DESCRIPTION).unwrap();
        let tp = extract_om_time(doc.root_element()).unwrap();
        assert!(tp.begin < tp.end);
    }

    #[test]
    fn extracts_path_texts() {
        let doc = Document::parse(COVERAGE_DESCRIPTION).unwrap();
        let cd = doc.root_element();
        assert_eq!(path_text(cd, &SENSOR_PATH).as_deref(), Some("OPTICAL"));
        assert_eq!(
            path_text(cd, &INCIDENCE_ANGLE_PATH).as_deref(),
            Some("+7.23391641")
        );
        assert_eq!(path_text(cd, &CLOUD_COVER_PATH).as_deref(), Some("13.25"));
    }

    #[test]
    fn extracts_footprint_with_swapped_axes() {
        let doc = Document::parse(COVERAGE_DESCRIPTION).unwrap();
        let footprint = extract_footprint(doc.root_element()).unwrap();
        let first = footprint.exterior().coords().next().unwrap();
        assert_eq!(first.x, 8.4); // east from the second posList value
        assert_eq!(first.y, 52.6);
    }

    #[test]
    fn user_paths_match_by_local_name() {
        let doc = Document::parse(COVERAGE_DESCRIPTION).unwrap();
        let cd = doc.root_element();

        let nodes = find_descendant_paths(cd, "eop:Sensor/eop:sensorType").unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].text(), Some("OPTICAL"));

        // unknown prefixes fall back to local-name matching
        let nodes = find_descendant_paths(cd, "x:Sensor/x:sensorType").unwrap();
        assert_eq!(nodes.len(), 1);

        assert!(find_descendant_paths(cd, "eop:NoSuchElement").unwrap().is_empty());
        assert!(find_descendant_paths(cd, "a//b").is_err());
    }
}
