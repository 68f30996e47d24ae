//! The scenario ingestion run: discovery, filtering, download and status
//! tracking against the Download Manager.

use crate::dm::{
    build_dar, DownloadManagerController, SubmitOutcome, PRODUCT_STATUS_COMPLETED,
    PRODUCT_STATUS_IN_ERROR,
};
use crate::error::{Error, Result};
use crate::ingestion::{metadata, predicates, wcs};
use crate::scenarios::{status, DataSourceType, Scenario, ScenarioDb};
use crate::util::{self, config::Settings};
use eoingest_datatypes::coastline::CoastlineCache;
use eoingest_datatypes::primitives::{Bbox, TimePeriod};
use log::{info, warn};
use roxmltree::Document;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutcomeCode {
    Ok,
    /// No GetCoverage request qualified; nothing was submitted.
    NoAction,
}

#[derive(Debug)]
pub struct IngestionOutcome {
    pub error_count: usize,
    pub dl_dir: Option<PathBuf>,
    pub dar_url: Option<String>,
    pub dar_id: Option<String>,
    pub code: OutcomeCode,
}

impl IngestionOutcome {
    fn no_action() -> Self {
        Self {
            error_count: 0,
            dl_dir: None,
            dar_url: None,
            dar_id: None,
            code: OutcomeCode::NoAction,
        }
    }
}

/// Cancellation checkpoint.
pub fn ensure_not_stopping(db: &ScenarioDb, scenario_id: i64) -> Result<()> {
    if db.stop_requested(scenario_id) {
        return Err(Error::Cancelled);
    }
    Ok(())
}

fn set_status(db: &ScenarioDb, scenario_id: i64, text: &str, percent: f32) {
    db.set_scenario_status(scenario_id, false, text, percent);
}

/// Width of the product directory counter, grown with the request count.
fn id_digits(n_requests: usize) -> usize {
    if n_requests > 10_000 {
        5
    } else if n_requests > 1_000 {
        4
    } else {
        3
    }
}

/// Creates the per-run download subtree `YYYY/MM[/extra]/<leaf>` under
/// `root` and returns the absolute leaf path and its root-relative path.
pub fn create_dl_dir(
    root: &Path,
    leaf_name_root: &str,
    extradir: Option<&str>,
) -> Result<(PathBuf, PathBuf)> {
    let now = chrono::Utc::now();
    let year = now.format("%Y").to_string();
    let month = now.format("%-m").to_string();
    let leaf = util::mk_fname(leaf_name_root);

    let mut segments = vec![year, month];
    if let Some(extra) = extradir {
        segments.push(extra.to_owned());
    }

    let mut full_path = root.to_path_buf();
    let mut rel_path = PathBuf::new();
    for segment in &segments {
        full_path = full_path.join(segment);
        rel_path = rel_path.join(segment);
        util::check_or_make_dir(&full_path)?;
    }
    full_path = full_path.join(&leaf);
    rel_path = rel_path.join(&leaf);
    util::make_new_dir(&full_path)?;

    Ok((full_path, rel_path))
}

/// Dataset series ids whose summary overlaps the AOI and TOI.
fn dataset_series_ids(
    db: &ScenarioDb,
    scenario_id: i64,
    caps: roxmltree::Node,
    aoi: &Bbox,
    toi: &TimePeriod,
) -> Result<Vec<String>> {
    let mut ids = Vec::new();
    for dss in metadata::dataset_series_summaries(caps) {
        ensure_not_stopping(db, scenario_id)?;

        let time_period = match metadata::extract_time_period(dss) {
            Some(tp) => tp,
            None => {
                warn!("Failed to extract time range from DatasetSeriesSummary");
                continue;
            }
        };
        if !toi.overlaps(&time_period) {
            continue;
        }

        let bbox = match metadata::extract_wgs84_bbox(dss) {
            Some(bb) => bb,
            None => {
                warn!("Failed to extract bbox from DatasetSeriesSummary");
                continue;
            }
        };
        if bbox.overlaps(aoi) {
            if let Some(id) = metadata::extract_dataset_series_id(dss) {
                ids.push(id);
            }
        }
    }
    Ok(ids)
}

/// EO-WCS discovery: capabilities, dataset series resolution, per-series
/// DescribeEOCoverageSet, predicate chain, GetCoverage URL emission.
async fn urls_from_eowcs(
    db: &ScenarioDb,
    scenario: &Scenario,
    cache: Option<&CoastlineCache>,
) -> Result<Vec<String>> {
    let client = wcs::WcsClient::new();
    let caps_body =
        client
            .fetch_capabilities(&scenario.dsrc)
            .await
            .ok_or_else(|| Error::Ingestion {
                message: format!("cannot get Capabilities from '{}'", scenario.dsrc),
            })?;
    ensure_not_stopping(db, scenario.id)?;

    let aoi = scenario.aoi_bbox;
    let toi = scenario.toi();

    let caps = Document::parse(&caps_body)?;
    let service_version = metadata::extract_service_type_version(caps.root_element());
    let id_list = if scenario.eoids.is_empty() {
        // find all dataset series that match the AOI and TOI
        dataset_series_ids(db, scenario.id, caps.root_element(), &aoi, &toi)?
    } else {
        // use only the series the scenario names, don't look for more
        scenario.eoids.clone()
    };
    drop(caps);

    info!(
        "Processing {} EOCoverageSetDescription urls.",
        id_list.len()
    );

    let mut gc_requests = Vec::new();
    let total = id_list.len() as f32;
    for (i, eoid) in id_list.iter().enumerate() {
        ensure_not_stopping(db, scenario.id)?;

        let mut percent_done = (i as f32 / total) * 100.;
        if percent_done < 0.5 {
            percent_done = 1.;
        }
        set_status(db, scenario.id, status::CREATE_DAR_GET_MD, percent_done);

        info!("Processing MD for EOID '{eoid}'");
        let md_url =
            wcs::describe_eo_coverage_set_url(&scenario.dsrc, &service_version, eoid, &aoi, &toi);
        let body = match client.fetch_xml(&md_url, wcs::EOCS_DESCRIPTION_TAG).await {
            Some(body) => body,
            None => continue,
        };
        ensure_not_stopping(db, scenario.id)?;

        let doc = Document::parse(&body)?;
        let cds = metadata::coverage_descriptions(doc.root_element());
        if cds.is_empty() {
            warn!("No CoverageDescriptions found in '{md_url}'");
        }

        let mut passed = 0;
        let total_cds = cds.len();
        for cd in cds {
            ensure_not_stopping(db, scenario.id)?;
            if let Some(coverage_id) = predicates::evaluate(db, scenario, cache, cd, &md_url) {
                passed += 1;
                gc_requests.push(wcs::get_coverage_url(
                    &scenario.dsrc,
                    &service_version,
                    &coverage_id,
                    &aoi,
                ));
            }
            ensure_not_stopping(db, scenario.id)?;
        }
        info!("EOID '{eoid}' conditions passed: {passed} / {total_cds}");
    }

    set_status(db, scenario.id, status::CREATE_DAR_GET_MD, 100.);
    Ok(gc_requests)
}

async fn coverage_urls(
    db: &ScenarioDb,
    scenario: &Scenario,
    cache: Option<&CoastlineCache>,
) -> Result<Vec<String>> {
    if !scenario.dsrc.starts_with("http") {
        return Err(Error::Ingestion {
            message: format!("unsupported data source protocol in '{}'", scenario.dsrc),
        });
    }
    match scenario.dsrc_type {
        DataSourceType::Eowcs => urls_from_eowcs(db, scenario, cache).await,
        DataSourceType::OsCatalogue => Err(Error::Ingestion {
            message: "Catalogues are not yet implemented".to_owned(),
        }),
        DataSourceType::BackgroundMap => Err(Error::Ingestion {
            message: "bad dsrc_type: BackgroundMap".to_owned(),
        }),
    }
}

/// Runs a full scenario ingestion. Blocks until the DM has finished all
/// product downloads of the submitted DAR.
pub async fn ingest_scenario(
    db: &ScenarioDb,
    dm: &DownloadManagerController,
    settings: &Settings,
    scenario: &Scenario,
) -> Result<IngestionOutcome> {
    let root_dl_dir = dm.download_dir();
    if !root_dl_dir.is_dir()
        || std::fs::metadata(root_dl_dir)?.permissions().readonly()
    {
        return Err(Error::Ingestion {
            message: format!("Cannot write/read {}", root_dl_dir.display()),
        });
    }

    let cache = if scenario.coastline_check {
        Some(CoastlineCache::from_shapefile(
            &settings.ie_coastline_data,
            &scenario.aoi_bbox,
        )?)
    } else {
        None
    };

    let gc_requests = coverage_urls(db, scenario, cache.as_ref()).await?;
    if gc_requests.is_empty() {
        warn!("'{}': no GetCoverage requests generated", scenario.ncn_id);
        return Ok(IngestionOutcome::no_action());
    }
    ensure_not_stopping(db, scenario.id)?;

    let nreqs = gc_requests.len();
    info!(
        "'{}': Submitting {nreqs} URLs to the Download Manager",
        scenario.ncn_id
    );

    let (full_path, rel_path) = create_dl_dir(root_dl_dir, &format!("{}_", scenario.ncn_id), None)?;
    let digits = id_digits(nreqs);
    let urls_with_dirs: Vec<(String, String)> = gc_requests
        .into_iter()
        .enumerate()
        .map(|(i, url)| {
            let dir = rel_path
                .join(format!("p_{}_{:0digits$}", scenario.ncn_id, i + 1))
                .to_string_lossy()
                .into_owned();
            (dir, url)
        })
        .collect();

    let dar = build_dar(&urls_with_dirs);
    let (dar_url, dar_id) = match dm.submit_dar(dar).await? {
        SubmitOutcome::Accepted { dar_url, dar_uuid } => (dar_url, dar_uuid.unwrap_or_default()),
        SubmitOutcome::AlreadyExists => {
            return Err(Error::Dm {
                message: "DAR submit problem, status: DAR_EXISTS".to_owned(),
            })
        }
    };
    if !dar_id.is_empty() {
        db.set_active_dar(scenario.id, &dar_id);
    }

    let dl_errors = wait_for_download(db, dm, settings, scenario.id, &dar_url).await?;
    info!(
        "Products for scenario {} downloaded to {}",
        scenario.ncn_id,
        full_path.display()
    );

    Ok(IngestionOutcome {
        error_count: dl_errors,
        dl_dir: Some(full_path),
        dar_url: Some(dar_url),
        dar_id: Some(dar_id),
        code: OutcomeCode::Ok,
    })
}

/// Cancels the remaining product downloads of `request`, unless someone got
/// there first.
async fn stop_download(
    db: &ScenarioDb,
    dm: &DownloadManagerController,
    scenario_id: i64,
    request: &crate::dm::DarStatus,
) {
    if !db.set_active_dar(scenario_id, "") {
        // already cleared by a concurrent stop
        warn!("stop download: dar had been cleared.");
        return;
    }
    dm.stop_products(&request.product_list).await;
}

/// Polls the DM until every product of the DAR is terminal and publishes
/// progress to the scenario status row. Returns the number of products that
/// ended `IN_ERROR`.
pub async fn wait_for_download(
    db: &ScenarioDb,
    dm: &DownloadManagerController,
    settings: &Settings,
    scenario_id: i64,
    dar_url: &str,
) -> Result<usize> {
    let result = wait_for_download_inner(db, dm, settings, scenario_id, dar_url).await;
    db.set_active_dar(scenario_id, "");
    result
}

async fn wait_for_download_inner(
    db: &ScenarioDb,
    dm: &DownloadManagerController,
    settings: &Settings,
    scenario_id: i64,
    dar_url: &str,
) -> Result<usize> {
    let interval = Duration::from_secs(settings.dar_status_interval);
    set_status(db, scenario_id, "Downloading", 1.);

    let mut request = dm.dar_status(dar_url).await?;
    if request.is_none() {
        // the DM may not list a fresh DAR immediately
        tokio::time::sleep(interval).await;
        request = dm.dar_status(dar_url).await?;
        for _ in 0..2 {
            if request.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
            request = dm.dar_status(dar_url).await?;
        }
    }
    let mut request = request.ok_or_else(|| Error::Dm {
        message: "Bad DAR status from DM; no 'dataAccessRequests' found.".to_owned(),
    })?;

    if db.stop_requested(scenario_id) {
        stop_download(db, dm, scenario_id, &request).await;
        return Err(Error::Cancelled);
    }

    let n_products = request.product_list.len();
    let total_percent = (n_products * 100) as f64;
    let mut product_list = request.product_list.clone();
    let mut n_errors;

    loop {
        let mut all_done = true;
        let mut part_percent = 0.;
        let mut n_done = 0;
        let mut total_size: u64 = 0;
        n_errors = 0;

        for product in &product_list {
            let progress = match &product.product_progress {
                Some(progress) => progress,
                None => continue,
            };
            if progress.status == PRODUCT_STATUS_IN_ERROR {
                n_errors += 1;
                n_done += 1;
                info!(
                    "Dl Manager reports 'IN_ERROR' for uuid {}, message: {}\n url: {}",
                    product.uuid.as_deref().unwrap_or("(unknown)"),
                    progress.message.as_deref().unwrap_or("(none)"),
                    product.product_access_url.as_deref().unwrap_or("(unknown)"),
                );
            } else if progress.status == PRODUCT_STATUS_COMPLETED {
                n_done += 1;
            } else {
                all_done = false;
            }
            part_percent += progress.progress_percentage.unwrap_or(100.);
            total_size += progress.downloaded_size.unwrap_or(0);
        }

        let mut percent_done = ((part_percent / total_percent) * 100.) as i64;
        if percent_done < 1 {
            percent_done = 1;
        }

        if all_done {
            if n_errors > 0 {
                set_status(
                    db,
                    scenario_id,
                    &status::download_errors(n_errors),
                    percent_done as f32,
                );
                info!("Completed download with {n_errors} errors");
            } else {
                set_status(
                    db,
                    scenario_id,
                    &status::finished_download(n_products),
                    percent_done as f32,
                );
            }
            let ts = if total_size < 102_400 {
                format!("{total_size} bytes")
            } else {
                format!("{} kb", total_size / 1024)
            };
            info!("Dl Manager reports downloaded {ts} in {n_products} products");
            return Ok(n_errors);
        }

        if db.stop_requested(scenario_id) {
            stop_download(db, dm, scenario_id, &request).await;
            return Err(Error::Cancelled);
        }
        set_status(
            db,
            scenario_id,
            &status::downloading(n_done, n_products),
            percent_done as f32,
        );

        tokio::time::sleep(interval).await;
        request = dm
            .dar_status(dar_url)
            .await?
            .ok_or_else(|| Error::Dm {
                message: "DAR disappeared from DM status".to_owned(),
            })?;
        if db.stop_requested(scenario_id) {
            stop_download(db, dm, scenario_id, &request).await;
            return Err(Error::Cancelled);
        }
        product_list = request.product_list.clone();
    }
}
