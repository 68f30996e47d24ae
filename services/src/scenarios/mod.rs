use chrono::{DateTime, Utc};
use eoingest_datatypes::primitives::{Bbox, TimePeriod};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

mod store;

pub use store::ScenarioDb;

/// Status sentinel written by the control surface and polled at every
/// cancellation checkpoint. Part of the external contract.
pub const STOP_REQUEST: &str = "STOP_REQUEST";

/// Status strings matched by the UI.
pub mod status {
    pub const QUEUED: &str = "QUEUED";
    pub const GENERATING_URLS: &str = "GENERATING URLS";
    pub const CREATE_DAR_GET_MD: &str = "Create DAR: get MD";
    pub const INGESTING: &str = "INGESTING";
    pub const IDLE: &str = "IDLE";
    pub const INGEST_ERROR: &str = "INGEST ERROR";
    pub const NOT_DELETED_ERROR: &str = "NOT DELETED - ERROR.";
    pub const DELETE_DEREG: &str = "DELETE: De-reg products.";
    pub const DELETING: &str = "DELETING";
    pub const LOCAL_FILE_INGESTION: &str = "LOCAL FILE INGESTION";

    pub fn downloading(done: usize, total: usize) -> String {
        format!("Downloading ({done}/{total})")
    }

    pub fn finished_download(total: usize) -> String {
        format!("Finished Dl. ({total})")
    }

    pub fn download_errors(errors: usize) -> String {
        format!("{errors} errors during Dl.")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataSourceType {
    Eowcs,
    /// OpenSearch catalogue; reserved, triggers an ingestion error.
    OsCatalogue,
    BackgroundMap,
}

/// One user-supplied metadata condition: an element path and, optionally,
/// the exact text at least one matching node must carry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraCondition {
    pub xpath: String,
    pub text: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Scenario {
    pub id: i64,
    /// Stable ASCII identifier; appears in download paths and script args.
    pub ncn_id: String,
    /// EO-WCS endpoint URL.
    pub dsrc: String,
    pub dsrc_type: DataSourceType,
    pub aoi_bbox: Bbox,
    pub from_date: DateTime<Utc>,
    pub to_date: DateTime<Utc>,
    pub starting_date: DateTime<Utc>,
    /// Seconds between automatic runs; 0 disables the auto-trigger.
    pub repeat_interval: u64,
    pub cat_registration: bool,
    pub eoids: Vec<String>,
    pub extraconditions: Vec<ExtraCondition>,
    pub scripts: Vec<PathBuf>,
    pub view_angle: Option<f64>,
    pub cloud_cover: Option<f64>,
    pub sensor_type: Option<String>,
    pub coastline_check: bool,
}

impl Scenario {
    pub fn toi(&self) -> TimePeriod {
        TimePeriod::new(self.from_date, self.to_date)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScenarioStatusRow {
    pub status: String,
    /// Logical scenario lock; 0/false while a worker owns the scenario.
    pub is_available: bool,
    /// Percent done, 0..100.
    pub done: f32,
    /// Uuid of the active DAR; empty when none.
    pub active_dar: String,
    /// Process id of the owning worker; 0 when none.
    pub ingestion_pid: u32,
}

impl Default for ScenarioStatusRow {
    fn default() -> Self {
        Self {
            status: status::IDLE.to_owned(),
            is_available: true,
            done: 0.,
            active_dar: String::new(),
            ingestion_pid: 0,
        }
    }
}
