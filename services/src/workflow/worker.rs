//! Task dispatch and the per-task handlers run by the workers.
//!
//! A handler never lets an error escape: failures end in a terminal status
//! on the scenario row and the worker returns to the queue.

use super::{Task, WorkflowManager};
use crate::error::{Error, Result};
use crate::ingestion::logic::{self, ensure_not_stopping, OutcomeCode};
use crate::products;
use crate::scenarios::status;
use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};

pub(super) async fn dispatch(wfm: &WorkflowManager, worker_id: usize, task: Task) {
    debug!("Worker-{worker_id} do_task: {}", task.kind());
    match task {
        Task::IngestScenario {
            scenario_id,
            scripts,
        } => ingest_task(wfm, scenario_id, &scripts).await,
        Task::IngestLocalProduct {
            scenario_id,
            ncn_id,
            dir_path,
            metadata,
            data,
            scripts,
            cat_registration,
        } => {
            local_product_task(
                wfm,
                scenario_id,
                &ncn_id,
                &dir_path,
                &metadata,
                &data,
                &scripts,
                cat_registration,
            )
            .await
        }
        Task::DeleteScenario {
            scenario_id,
            scripts,
        } => delete_task(wfm, scenario_id, &scripts).await,
        Task::AddProduct {
            scenario_id,
            product_paths,
        } => add_product_task(wfm, scenario_id, &product_paths).await,
    }
}

/// Runs each prepared argument vector as a subprocess, counting non-zero
/// exits. Checks for a stop request before every invocation.
pub(super) async fn run_scripts(
    wfm: &WorkflowManager,
    scenario_id: i64,
    ncn_id: &str,
    scripts_args: &[Vec<String>],
) -> Result<usize> {
    let mut nerrors = 0;
    for args in scripts_args {
        ensure_not_stopping(&wfm.db, scenario_id)?;

        info!("Running script: {}", args[0]);
        match tokio::process::Command::new(&args[0])
            .args(&args[1..])
            .status()
            .await
        {
            Ok(exit) if exit.success() => {}
            Ok(exit) => {
                nerrors += 1;
                error!("'{ncn_id}': ingest script returned status: {exit}");
            }
            Err(e) => {
                nerrors += 1;
                error!("'{ncn_id}': cannot run script {}: {e}", args[0]);
            }
        }
    }
    Ok(nerrors)
}

fn catreg_helper(wfm: &WorkflowManager, cat_registration: bool) -> Option<PathBuf> {
    cat_registration.then(|| {
        wfm.settings
            .ie_scripts_dir
            .join(&wfm.settings.ie_default_catreg_script)
    })
}

async fn ingest_task(wfm: &WorkflowManager, scenario_id: i64, scripts: &[PathBuf]) {
    info!("wfm: executing INGEST_SCENARIO, id={scenario_id}");
    wfm.db
        .set_scenario_status(scenario_id, false, status::GENERATING_URLS, 1.);
    wfm.db.set_ingestion_pid(scenario_id, std::process::id());

    let ncn_id = wfm
        .db
        .scenario(scenario_id)
        .map(|s| s.ncn_id)
        .unwrap_or_default();
    match ingest_scenario_steps(wfm, scenario_id, scripts).await {
        Ok(()) => {}
        Err(Error::Cancelled) => {
            info!("'{ncn_id}': Stop request from user: Ingestion Stopped");
            wfm.db
                .set_scenario_status(scenario_id, true, status::IDLE, 0.);
        }
        Err(e) => {
            error!("'{ncn_id}': Error while ingesting: {e}");
            wfm.db
                .set_scenario_status(scenario_id, true, status::INGEST_ERROR, 0.);
        }
    }
    wfm.db.set_ingestion_pid(scenario_id, 0);
}

async fn ingest_scenario_steps(
    wfm: &WorkflowManager,
    scenario_id: i64,
    scripts: &[PathBuf],
) -> Result<()> {
    let scenario = wfm.db.scenario(scenario_id)?;

    // blocks until the DM has finished downloading
    let outcome = logic::ingest_scenario(&wfm.db, &wfm.dm, &wfm.settings, &scenario).await?;
    ensure_not_stopping(&wfm.db, scenario_id)?;

    if outcome.code == OutcomeCode::NoAction {
        info!("'{}': nothing to ingest.", scenario.ncn_id);
        wfm.db
            .set_scenario_status(scenario_id, true, status::IDLE, 0.);
        return Ok(());
    }
    let dl_dir = outcome.dl_dir.ok_or_else(|| Error::Ingestion {
        message: "No download directory from ingestion run".to_owned(),
    })?;

    // Each product was downloaded into its own subdirectory. Generate a
    // product manifest there and run the ODA ingestion scripts on it.
    let mut dir_list: Vec<PathBuf> = std::fs::read_dir(&dl_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_dir())
        .collect();
    dir_list.sort();

    let catreg = catreg_helper(wfm, scenario.cat_registration);
    let n_dirs = dir_list.len();
    let mut nerrors = 0;
    for (i, product_dir) in dir_list.iter().enumerate() {
        let mf_name = match products::split_and_create_mf(product_dir, &scenario.ncn_id) {
            Ok(mf_name) => mf_name,
            Err(e) => {
                warn!("No manifest for {}: {e}", product_dir.display());
                nerrors += 1;
                continue;
            }
        };

        let scripts_args: Vec<Vec<String>> = scripts
            .iter()
            .map(|s| products::script_args(s, &mf_name, catreg.as_deref()))
            .collect();
        nerrors += run_scripts(wfm, scenario_id, &scenario.ncn_id, &scripts_args).await?;

        let mut percent = 100. * ((i + 1) as f32 / n_dirs as f32);
        if percent < 1. {
            percent = 1.;
        }
        wfm.db
            .set_scenario_status(scenario_id, false, status::INGESTING, percent);
    }

    if nerrors > 0 {
        return Err(Error::Ingestion {
            message: format!(
                "'{}': ingestion encountered {nerrors} errors",
                scenario.ncn_id
            ),
        });
    }

    wfm.db
        .set_scenario_status(scenario_id, true, status::IDLE, 0.);
    info!("'{}': ingestion completed.", scenario.ncn_id);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn local_product_task(
    wfm: &WorkflowManager,
    scenario_id: i64,
    ncn_id: &str,
    dir_path: &Path,
    metadata: &Path,
    data: &Path,
    scripts: &[PathBuf],
    cat_registration: bool,
) {
    info!("wfm: executing INGEST_LOCAL_PROD, id={scenario_id}");
    wfm.db
        .set_scenario_status(scenario_id, false, status::LOCAL_FILE_INGESTION, 1.);
    wfm.db.set_ingestion_pid(scenario_id, std::process::id());

    let result = async {
        let mf_name = products::create_manifest(dir_path, ncn_id, metadata, data)?;
        let catreg = catreg_helper(wfm, cat_registration);
        let scripts_args: Vec<Vec<String>> = scripts
            .iter()
            .map(|s| products::script_args(s, &mf_name, catreg.as_deref()))
            .collect();
        let nerrors = run_scripts(wfm, scenario_id, ncn_id, &scripts_args).await?;
        if nerrors > 0 {
            return Err(Error::Ingestion {
                message: format!("Number of errors {nerrors}"),
            });
        }
        Ok(())
    }
    .await;

    match result {
        Ok(()) => {
            wfm.db
                .set_scenario_status(scenario_id, true, status::IDLE, 0.);
        }
        Err(Error::Cancelled) => {
            info!("'{ncn_id}': Stop request from user: Local Ingestion Stopped");
            wfm.db
                .set_scenario_status(scenario_id, true, status::IDLE, 0.);
        }
        Err(e) => {
            error!("'{ncn_id}': Error while ingesting local product: {e}");
            wfm.db
                .set_scenario_status(scenario_id, true, status::INGEST_ERROR, 0.);
        }
    }
    wfm.db.set_ingestion_pid(scenario_id, 0);
}

async fn delete_task(wfm: &WorkflowManager, scenario_id: i64, scripts: &[PathBuf]) {
    let scenario = match wfm.db.scenario(scenario_id) {
        Ok(scenario) => scenario,
        Err(e) => {
            error!("{e}");
            return;
        }
    };
    let ncn_id = &scenario.ncn_id;

    let row = match wfm.db.status(scenario_id) {
        Ok(row) => row,
        Err(e) => {
            error!("{e}");
            return;
        }
    };
    if !row.active_dar.is_empty() {
        error!("'{ncn_id}': Cannot delete, scenario has an active DAR, must be stopped first.");
        wfm.db
            .set_scenario_status(scenario_id, true, status::NOT_DELETED_ERROR, 0.);
        return;
    }

    wfm.db
        .set_scenario_status(scenario_id, false, status::DELETE_DEREG, 1.);

    let mut nerrors = 0;
    for script in scripts {
        info!("'{ncn_id}' del running script {}", script.display());
        match tokio::process::Command::new(script)
            .arg(ncn_id)
            .status()
            .await
        {
            Ok(exit) if exit.success() => {}
            Ok(exit) => {
                nerrors += 1;
                error!("'{ncn_id}': delete script returned status: {exit}");
            }
            Err(e) => {
                nerrors += 1;
                error!("'{ncn_id}': Exception while deleting: {e}");
            }
        }
    }
    if nerrors > 0 {
        wfm.db
            .set_scenario_status(scenario_id, true, status::NOT_DELETED_ERROR, 0.);
        return;
    }

    wfm.db
        .set_scenario_status(scenario_id, false, status::DELETING, 1.);
    if let Err(e) = wfm.db.delete_scenario(scenario_id) {
        error!("{e}");
    }
}

/// Registers already-downloaded product files with the catalogue through
/// the site's default registration script.
async fn add_product_task(wfm: &WorkflowManager, scenario_id: i64, product_paths: &[PathBuf]) {
    info!("wfm: executing ADD_PRODUCT, id={scenario_id}");
    let scenario = match wfm.db.scenario(scenario_id) {
        Ok(scenario) => scenario,
        Err(e) => {
            error!("{e}");
            return;
        }
    };
    wfm.db
        .set_scenario_status(scenario_id, false, status::INGESTING, 1.);

    let script = wfm
        .settings
        .ie_scripts_dir
        .join(&wfm.settings.ie_default_catreg_script);
    let scripts_args: Vec<Vec<String>> = product_paths
        .iter()
        .map(|p| {
            vec![
                script.display().to_string(),
                p.display().to_string(),
                scenario.ncn_id.clone(),
            ]
        })
        .collect();

    match run_scripts(wfm, scenario_id, &scenario.ncn_id, &scripts_args).await {
        Ok(0) => {
            wfm.db
                .set_scenario_status(scenario_id, true, status::IDLE, 0.);
        }
        Ok(nerrors) => {
            error!(
                "'{}': product registration encountered {nerrors} errors",
                scenario.ncn_id
            );
            wfm.db
                .set_scenario_status(scenario_id, true, status::INGEST_ERROR, 0.);
        }
        Err(Error::Cancelled) => {
            info!("'{}': Stop request from user", scenario.ncn_id);
            wfm.db
                .set_scenario_status(scenario_id, true, status::IDLE, 0.);
        }
        Err(e) => {
            error!("{e}");
            wfm.db
                .set_scenario_status(scenario_id, true, status::INGEST_ERROR, 0.);
        }
    }
}
