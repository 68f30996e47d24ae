//! The per-coverage filter chain.
//!
//! Filters run in a fixed order and short-circuit on the first failure.
//! Missing metadata never excludes a coverage for the value filters (sensor,
//! angle, cloud cover): a condition that cannot be disproved passes. A
//! malformed user condition path, on the other hand, drops the coverage.

use crate::ingestion::metadata::{
    self, CLOUD_COVER_PATH, INCIDENCE_ANGLE_PATH, SENSOR_PATH, Step,
};
use crate::scenarios::{ExtraCondition, Scenario, ScenarioDb};
use eoingest_datatypes::coastline::CoastlineCache;
use eoingest_datatypes::primitives::{Bbox, TimePeriod};
use log::{debug, error, info, warn};
use roxmltree::Node;

/// True iff the coverage's envelope exists, is WGS84-convertible and
/// overlaps the requested AOI.
pub fn check_bbox(cd: Node, req_bbox: &Bbox) -> bool {
    match metadata::extract_gml_bbox(cd) {
        Some(bb) => bb.overlaps(req_bbox),
        None => false,
    }
}

pub fn check_time_period(cd: Node, req_toi: &TimePeriod, md_src: &str) -> bool {
    match metadata::extract_om_time(cd) {
        Some(time_period) => time_period.overlaps(req_toi),
        None => {
            warn!("timePeriod not found in EO metadata, src='{md_src}'");
            false
        }
    }
}

/// Exact-match text condition; passes when not requested or when the
/// metadata carries no value to compare.
pub fn check_text_condition(cd: Node, requested: Option<&str>, path: &[Step]) -> bool {
    let requested = match requested {
        Some(r) if !r.is_empty() => r,
        _ => return true,
    };
    match metadata::path_text(cd, path) {
        Some(md_value) => requested == md_value,
        None => true,
    }
}

/// Upper-bound condition on a numeric metadata value; passes when not
/// requested, when the metadata has no value, or when the value does not
/// parse (logged).
pub fn check_float_max(cd: Node, requested: Option<f64>, name: &str, path: &[Step]) -> bool {
    let requested = match requested {
        Some(r) => r,
        None => return true,
    };
    let md_value = match metadata::path_text(cd, path) {
        Some(v) => v,
        None => return true,
    };
    match md_value.trim_start_matches('+').parse::<f64>() {
        Ok(md_float) => md_float <= requested,
        Err(e) => {
            warn!("Unexpected error converting metadata value for {name}: {e}");
            true
        }
    }
}

/// Tests the coverage footprint against the per-run coastline cache. Fails
/// open: no cache, an empty cache or an unreadable footprint all accept.
pub fn check_coastline(cd: Node, cache: Option<&CoastlineCache>) -> bool {
    let cache = match cache {
        Some(cache) => cache,
        None => return true,
    };
    match metadata::extract_footprint(cd) {
        Some(footprint) => cache.matches_footprint(&footprint),
        None => {
            warn!("No footprint polygon in coverage description, not checking coastline.");
            true
        }
    }
}

/// AND over the scenario's user conditions. Each condition needs at least
/// one matching node; a non-empty expected text additionally needs one
/// matching node with exactly that text.
pub fn check_custom_conditions(cd: Node, conditions: &[ExtraCondition]) -> bool {
    for condition in conditions {
        if condition.xpath.is_empty() {
            continue;
        }
        let nodes = match metadata::find_descendant_paths(cd, &condition.xpath) {
            Ok(nodes) => nodes,
            Err(e) => {
                error!("Error in custom condition '{}': {e}", condition.xpath);
                return false;
            }
        };
        if nodes.is_empty() {
            return false;
        }
        if !condition.text.is_empty()
            && !nodes
                .iter()
                .any(|n| n.text().map(str::trim) == Some(condition.text.as_str()))
        {
            return false;
        }
        // a matching node without expected text suffices
    }
    true
}

/// Runs the full chain over one coverage description and returns the
/// coverage id when every filter passes.
pub fn evaluate(
    db: &ScenarioDb,
    scenario: &Scenario,
    cache: Option<&CoastlineCache>,
    cd: Node,
    md_src: &str,
) -> Option<String> {
    let coverage_id = match metadata::extract_coverage_id(cd) {
        Some(id) => id,
        None => {
            error!("Cannot find CoverageId in '{md_src}'");
            return None;
        }
    };

    if db.is_archived(scenario.id, &coverage_id) {
        info!("coverage_id='{coverage_id}' is archived, not downloading.");
        return None;
    }

    if !check_bbox(cd, &scenario.aoi_bbox) {
        debug!("  bbox check failed for {coverage_id}");
        return None;
    }
    if !check_time_period(cd, &scenario.toi(), md_src) {
        debug!("  TimePeriod check failed for {coverage_id}");
        return None;
    }
    if !check_text_condition(cd, scenario.sensor_type.as_deref(), &SENSOR_PATH) {
        debug!("  sensor type check failed for {coverage_id}");
        return None;
    }
    if !check_float_max(cd, scenario.view_angle, "view_angle", &INCIDENCE_ANGLE_PATH) {
        debug!("  incidence angle check failed for {coverage_id}");
        return None;
    }
    if !check_float_max(cd, scenario.cloud_cover, "cloud_cover", &CLOUD_COVER_PATH) {
        debug!("  cloud cover check failed for {coverage_id}");
        return None;
    }
    if !check_coastline(cd, cache) {
        debug!("  coastline check failed for {coverage_id}");
        return None;
    }
    if !check_custom_conditions(cd, &scenario.extraconditions) {
        debug!("  custom conditions check failed for {coverage_id}");
        return None;
    }

    Some(coverage_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::metadata::tests::COVERAGE_DESCRIPTION;
    use crate::scenarios::DataSourceType;
    use chrono::TimeZone;
    use roxmltree::Document;

    fn scenario() -> Scenario {
        Scenario {
            id: 0,
            ncn_id: "sc42".to_owned(),
            dsrc: "http://pf.example.com/eowcs".to_owned(),
            dsrc_type: DataSourceType::Eowcs,
            aoi_bbox: Bbox::new((8., 50.).into(), (12.3, 55.).into()).unwrap(),
            from_date: chrono::Utc.with_ymd_and_hms(2011, 1, 1, 0, 0, 0).unwrap(),
            to_date: chrono::Utc.with_ymd_and_hms(2011, 2, 1, 0, 0, 0).unwrap(),
            starting_date: chrono::Utc.with_ymd_and_hms(2011, 1, 1, 0, 0, 0).unwrap(),
            repeat_interval: 0,
            cat_registration: false,
            eoids: vec![],
            extraconditions: vec![],
            scripts: vec![],
            view_angle: None,
            cloud_cover: None,
            sensor_type: None,
            coastline_check: false,
        }
    }

    #[test]
    fn accepts_matching_coverage() {
        let db = ScenarioDb::new();
        let doc = Document::parse(COVERAGE_DESCRIPTION).unwrap();
        let mut sc = scenario();
        sc.id = db.add_scenario(sc.clone());

        let id = evaluate(&db, &sc, None, doc.root_element(), "test");
        assert_eq!(id.as_deref(), Some("cov_20110119_199_030"));
    }

    #[test]
    fn archived_coverages_are_dropped() {
        let db = ScenarioDb::new();
        let doc = Document::parse(COVERAGE_DESCRIPTION).unwrap();
        let mut sc = scenario();
        sc.id = db.add_scenario(sc.clone());
        db.archive_product(sc.id, "cov_20110119_199_030");

        assert!(evaluate(&db, &sc, None, doc.root_element(), "test").is_none());
    }

    #[test]
    fn bbox_and_time_mismatch_drop() {
        let db = ScenarioDb::new();
        let doc = Document::parse(COVERAGE_DESCRIPTION).unwrap();

        let mut far = scenario();
        far.aoi_bbox = Bbox::new((100., 10.).into(), (101., 11.).into()).unwrap();
        far.id = db.add_scenario(far.clone());
        assert!(evaluate(&db, &far, None, doc.root_element(), "test").is_none());

        let mut late = scenario();
        late.from_date = chrono::Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        late.to_date = chrono::Utc.with_ymd_and_hms(2020, 2, 1, 0, 0, 0).unwrap();
        late.id = db.add_scenario(late.clone());
        assert!(evaluate(&db, &late, None, doc.root_element(), "test").is_none());
    }

    #[test]
    fn value_filters_compare_metadata() {
        let doc = Document::parse(COVERAGE_DESCRIPTION).unwrap();
        let cd = doc.root_element();

        assert!(check_text_condition(cd, Some("OPTICAL"), &SENSOR_PATH));
        assert!(!check_text_condition(cd, Some("RADAR"), &SENSOR_PATH));
        assert!(check_text_condition(cd, None, &SENSOR_PATH));
        assert!(check_text_condition(cd, Some(""), &SENSOR_PATH));

        // metadata value is 13.25
        assert!(check_float_max(cd, Some(20.), "cloud_cover", &CLOUD_COVER_PATH));
        assert!(!check_float_max(cd, Some(10.), "cloud_cover", &CLOUD_COVER_PATH));

        // metadata value is +7.23391641
        assert!(check_float_max(cd, Some(8.), "view_angle", &INCIDENCE_ANGLE_PATH));
        assert!(!check_float_max(cd, Some(5.), "view_angle", &INCIDENCE_ANGLE_PATH));
    }

    #[test]
    fn missing_metadata_passes_value_filters() {
        let xml = r#"<wcs:CoverageDescription
            xmlns:wcs="http://www.opengis.net/wcs/2.0"
            xmlns:gml="http://www.opengis.net/gml/3.2"
            gml:id="bare"/>"#;
        let doc = Document::parse(xml).unwrap();
        let cd = doc.root_element();

        assert!(check_text_condition(cd, Some("OPTICAL"), &SENSOR_PATH));
        assert!(check_float_max(cd, Some(5.), "cloud_cover", &CLOUD_COVER_PATH));
    }

    #[test]
    fn custom_conditions_and_semantics() {
        let doc = Document::parse(COVERAGE_DESCRIPTION).unwrap();
        let cd = doc.root_element();

        let exists = ExtraCondition {
            xpath: "eop:Sensor/eop:sensorType".to_owned(),
            text: String::new(),
        };
        let matches = ExtraCondition {
            xpath: "eop:Sensor/eop:sensorType".to_owned(),
            text: "OPTICAL".to_owned(),
        };
        let wrong_text = ExtraCondition {
            xpath: "eop:Sensor/eop:sensorType".to_owned(),
            text: "RADAR".to_owned(),
        };
        let missing = ExtraCondition {
            xpath: "eop:NoSuchElement".to_owned(),
            text: String::new(),
        };
        let malformed = ExtraCondition {
            xpath: "a//b".to_owned(),
            text: String::new(),
        };

        assert!(check_custom_conditions(cd, &[exists.clone(), matches.clone()]));
        assert!(!check_custom_conditions(cd, &[matches, wrong_text]));
        assert!(!check_custom_conditions(cd, &[exists.clone(), missing]));
        assert!(!check_custom_conditions(cd, &[exists, malformed]));
    }

    #[test]
    fn coastline_gate_uses_footprint() {
        let doc = Document::parse(COVERAGE_DESCRIPTION).unwrap();
        let cd = doc.root_element();
        let aoi = Bbox::new((8., 50.).into(), (12.3, 55.).into()).unwrap();

        // land mass covering the footprint region
        let land: Vec<eoingest_datatypes::primitives::Coordinate2D> =
            [(6., 49.), (11.5, 49.), (11.5, 54.2), (6., 54.2), (6., 49.)]
                .iter()
                .map(|&p| p.into())
                .collect();
        let cache = CoastlineCache::from_rings(&[land], &aoi);
        assert!(check_coastline(cd, Some(&cache)));
        assert!(check_coastline(cd, None));

        // land mass elsewhere in the AOI, away from the footprint
        let offshore_land: Vec<eoingest_datatypes::primitives::Coordinate2D> =
            [(11., 54.), (12., 54.), (12., 54.9), (11., 54.9), (11., 54.)]
                .iter()
                .map(|&p| p.into())
                .collect();
        let cache = CoastlineCache::from_rings(&[offshore_land], &aoi);
        assert!(!check_coastline(cd, Some(&cache)));
    }
}
