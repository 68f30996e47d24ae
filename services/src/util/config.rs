use crate::error::Result;
use serde::Deserialize;
use std::path::PathBuf;

/// Engine settings, layered from built-in defaults, an optional
/// `Settings.toml` next to the working directory, and environment variables
/// (`IE_SERVER_PORT`, `DAR_STATUS_INTERVAL`, ...).
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Port of the inbound HTTP surface (DAR responses, scenario control).
    pub ie_server_port: u16,
    /// Ceiling for waiting on the Download Manager's listening socket.
    pub max_port_wait_secs: u64,
    /// Seconds between two DAR status polls.
    pub dar_status_interval: u64,
    /// Size of the ingest worker pool.
    pub ie_n_workflow_workers: usize,
    /// Directory holding the site's ingestion scripts.
    pub ie_scripts_dir: PathBuf,
    pub ie_default_catreg_script: String,
    pub ie_default_catdereg_script: String,
    /// The Download Manager's own configuration file (port, download dir).
    pub dm_conf_fn: PathBuf,
    /// Land polygons for the coastline predicate.
    pub ie_coastline_data: PathBuf,
}

impl Settings {
    /// # Errors
    ///
    /// Fails if a settings file or environment override cannot be parsed.
    pub fn load() -> Result<Self> {
        let cfg = config::Config::builder()
            .set_default("ie_server_port", 8000_i64)?
            .set_default("max_port_wait_secs", 25_i64)?
            .set_default("dar_status_interval", 10_i64)?
            .set_default("ie_n_workflow_workers", 2_i64)?
            .set_default("ie_scripts_dir", "./ingest_scripts")?
            .set_default("ie_default_catreg_script", "default_catreg.sh")?
            .set_default("ie_default_catdereg_script", "default_catdereg.sh")?
            .set_default("dm_conf_fn", "./dm.properties")?
            .set_default("ie_coastline_data", "./coastline_data/ne_10m_land.shp")?
            .add_source(config::File::with_name("Settings").required(false))
            .add_source(config::Environment::default())
            .build()?;

        Ok(cfg.try_deserialize()?)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ie_server_port: 8000,
            max_port_wait_secs: 25,
            dar_status_interval: 10,
            ie_n_workflow_workers: 2,
            ie_scripts_dir: PathBuf::from("./ingest_scripts"),
            ie_default_catreg_script: "default_catreg.sh".into(),
            ie_default_catdereg_script: "default_catdereg.sh".into(),
            dm_conf_fn: PathBuf::from("./dm.properties"),
            ie_coastline_data: PathBuf::from("./coastline_data/ne_10m_land.shp"),
        }
    }
}
