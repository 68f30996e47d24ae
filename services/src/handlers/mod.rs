//! The engine's inbound HTTP surface: the endpoint the Download Manager
//! pulls DAR documents from, and the scenario control routes used by the
//! operator UI.

use crate::dm::DownloadManagerController;
use crate::scenarios::ScenarioDb;
use crate::workflow::{Task, WorkflowManager};
use actix_web::{get, post, web, HttpResponse};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub struct AppState {
    pub db: Arc<ScenarioDb>,
    pub dm: Arc<DownloadManagerController>,
    pub wfm: Arc<WorkflowManager>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    fn new(error: &str, message: String) -> Self {
        Self {
            error: error.to_owned(),
            message,
        }
    }
}

/// The DM fetches the DAR document previously announced to it under this
/// url (`dm::DAR_RESPONSE_PATH`).
#[get("/ingest/darResponse/{seq_id}")]
async fn dar_response(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let seq_id = path.into_inner();
    match state.dm.next_dar(&seq_id) {
        Some(dar) => HttpResponse::Ok().json(dar),
        None => HttpResponse::NotFound().json(ErrorResponse::new(
            "UnknownDar",
            format!("No queued DAR for sequence id '{seq_id}'"),
        )),
    }
}

#[post("/scenarios/{id}/ingest")]
async fn trigger_ingest(state: web::Data<AppState>, path: web::Path<i64>) -> HttpResponse {
    let scenario_id = path.into_inner();
    let scenario = match state.db.scenario(scenario_id) {
        Ok(scenario) => scenario,
        Err(e) => {
            return HttpResponse::NotFound()
                .json(ErrorResponse::new("UnknownScenario", e.to_string()))
        }
    };
    if !state.wfm.lock_scenario(scenario_id) {
        return HttpResponse::Conflict().json(ErrorResponse::new(
            "ScenarioLocked",
            format!("Scenario {scenario_id} is not available"),
        ));
    }
    state.wfm.enqueue(Task::IngestScenario {
        scenario_id,
        scripts: scenario.scripts,
    });
    HttpResponse::Ok().json(serde_json::json!({ "status": "QUEUED" }))
}

#[post("/scenarios/{id}/stop")]
async fn stop_scenario(state: web::Data<AppState>, path: web::Path<i64>) -> HttpResponse {
    let scenario_id = path.into_inner();
    state.wfm.set_stop_request(scenario_id).await;
    match state.db.status(scenario_id) {
        Ok(row) => HttpResponse::Ok().json(row),
        Err(e) => {
            HttpResponse::NotFound().json(ErrorResponse::new("UnknownScenario", e.to_string()))
        }
    }
}

#[get("/scenarios/{id}/status")]
async fn scenario_status(state: web::Data<AppState>, path: web::Path<i64>) -> HttpResponse {
    match state.db.status(path.into_inner()) {
        Ok(row) => HttpResponse::Ok().json(row),
        Err(e) => {
            HttpResponse::NotFound().json(ErrorResponse::new("UnknownScenario", e.to_string()))
        }
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(dar_response)
        .service(trigger_ingest)
        .service(stop_scenario)
        .service(scenario_status);
}
