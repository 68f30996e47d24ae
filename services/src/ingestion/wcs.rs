//! EO-WCS 2.0 request building and fetching.
//!
//! Requests are plain GETs against the scenario's `dsrc` endpoint. Transport
//! errors, OGC exception reports and unexpected root elements are logged and
//! surface as `None`; the caller decides whether a missing document is fatal
//! for the run.

use crate::ingestion::metadata;
use eoingest_datatypes::primitives::{Bbox, TimePeriod};
use log::{error, warn};

const SERVICE_WCS: &str = "service=wcs";
const WCS_GET_CAPS: &str = "request=GetCapabilities";
const EOWCS_DESCRIBE_CS: &str = "request=DescribeEOCoverageSet";
const WCS_GET_COVERAGE: &str = "request=GetCoverage";
const WCS_IMAGE_FORMAT: &str = "format=image/tiff&mediatype=multipart/mixed";

const EPSG_4326_URL: &str = "http://www.opengis.net/def/crs/EPSG/0/4326";

pub const CAPABILITIES_TAG: &str = "Capabilities";
pub const EOCS_DESCRIPTION_TAG: &str = "EOCoverageSetDescription";

const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

pub fn capabilities_url(endpoint: &str) -> String {
    format!("{endpoint}?{SERVICE_WCS}&{WCS_GET_CAPS}")
}

pub fn describe_eo_coverage_set_url(
    endpoint: &str,
    service_version: &str,
    eoid: &str,
    aoi: &Bbox,
    toi: &TimePeriod,
) -> String {
    format!(
        "{endpoint}?{SERVICE_WCS}&version={service_version}&{EOWCS_DESCRIBE_CS}\
         &subset=phenomenonTime(\"{from}\",\"{to}\")\
         &containment=overlaps\
         &subset=Lat({ll_n},{ur_n})\
         &subset=Long({ll_e},{ur_e})\
         &EOId={eoid}",
        from = toi.begin.format(TIME_FORMAT),
        to = toi.end.format(TIME_FORMAT),
        ll_n = aoi.ll.north,
        ur_n = aoi.ur.north,
        ll_e = aoi.ll.east,
        ur_e = aoi.ur.east,
    )
}

pub fn get_coverage_url(
    endpoint: &str,
    service_version: &str,
    coverage_id: &str,
    aoi: &Bbox,
) -> String {
    format!(
        "{endpoint}?{SERVICE_WCS}&version={service_version}&{WCS_GET_COVERAGE}\
         &CoverageId={coverage_id}\
         &subset=Lat,{EPSG_4326_URL}({ll_n},{ur_n})\
         &subset=Long,{EPSG_4326_URL}({ll_e},{ur_e})\
         &{WCS_IMAGE_FORMAT}",
        ll_n = aoi.ll.north,
        ur_n = aoi.ur.north,
        ll_e = aoi.ll.east,
        ur_e = aoi.ur.east,
    )
}

#[derive(Debug, Default, Clone)]
pub struct WcsClient {
    http: reqwest::Client,
}

impl WcsClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetches `url` and returns the body when it parses as XML, is not an
    /// OGC exception report, and carries the expected root element.
    pub async fn fetch_xml(&self, url: &str, expected_root: &str) -> Option<String> {
        let response = match self.http.get(url).send().await {
            Ok(response) => response,
            Err(e) => {
                error!("Error accessing data source with url '{url}': {e}");
                return None;
            }
        };
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                error!("Error reading response from '{url}': {e}");
                return None;
            }
        };

        match roxmltree::Document::parse(&body) {
            Ok(doc) => {
                if metadata::is_exception_report(&doc) {
                    warn!("'{url}' returned an exception report");
                    return None;
                }
                let root = doc.root_element().tag_name().name();
                if root != expected_root {
                    error!("'{url}' does not contain expected root '{expected_root}', got '{root}'");
                    return None;
                }
            }
            Err(e) => {
                error!("Cannot parse response from '{url}': {e}");
                return None;
            }
        }

        Some(body)
    }

    /// GetCapabilities for `endpoint`; `None` when unavailable or invalid.
    pub async fn fetch_capabilities(&self, endpoint: &str) -> Option<String> {
        let url = capabilities_url(endpoint);
        let caps = self.fetch_xml(&url, CAPABILITIES_TAG).await;
        if caps.is_none() {
            error!("Cannot get capabilities, url={url}");
        }
        caps
    }
}
