use actix_web::{web, App, HttpServer};
use eoingest_services::dm::DownloadManagerController;
use eoingest_services::handlers::{self, AppState};
use eoingest_services::scenarios::ScenarioDb;
use eoingest_services::util::config::Settings;
use eoingest_services::workflow::WorkflowManager;
use log::{info, warn};
use std::sync::Arc;

#[actix_web::main]
async fn main() -> eoingest_services::Result<()> {
    flexi_logger::Logger::try_with_env_or_str("info")?.start()?;

    let settings = Settings::load()?;

    let db = Arc::new(ScenarioDb::new());
    let dm = Arc::new(DownloadManagerController::from_config(&settings)?);
    if !dm.configure().await? {
        warn!("Download Manager port not seen yet, continuing anyway.");
    }

    let wfm = WorkflowManager::new(Arc::clone(&db), Arc::clone(&dm), settings.clone());
    wfm.start();

    let state = web::Data::new(AppState { db, dm, wfm });
    info!("Ingestion engine listening on port {}", settings.ie_server_port);
    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .configure(handlers::configure)
    })
    .bind(("127.0.0.1", settings.ie_server_port))?
    .run()
    .await?;

    Ok(())
}
