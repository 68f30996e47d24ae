//! Download Manager interface and control.
//!
//! The controller owns the queue of pending DAR documents that the DM pulls
//! back over the engine's HTTP surface, allocates the sequence ids those
//! pull URLs carry, and wraps the DM's loopback HTTP API (submit, status,
//! per-product cancel).

use crate::error::{Error, Result};
use crate::util::{self, config::Settings};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub mod port;

const DOWNLOAD_COMMAND: &str = "download";
const DAR_STATUS_COMMAND: &str = "dataAccessRequests";

/// Path under which the engine serves queued DAR documents to the DM.
pub const DAR_RESPONSE_PATH: &str = "ingest/darResponse";

pub const PRODUCT_STATUS_COMPLETED: &str = "COMPLETED";
pub const PRODUCT_STATUS_IN_ERROR: &str = "IN_ERROR";

const DEFAULT_PORT_WAIT_SECS: u64 = 25;

const DM_PORT_KEY: &str = "WEB_INTERFACE_PORT_NO";
const DM_DOWNLOAD_DIR_KEY: &str = "BASE_DOWNLOAD_FOLDER_ABSOLUTE";

/// The document the DM fetches for a submitted darUrl: the products to
/// download and their directories relative to the download root.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DarDocument {
    pub product_list: Vec<DarProduct>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DarProduct {
    pub download_directory: String,
    pub product_access_url: String,
}

/// Builds the DAR document for `(relative directory, GetCoverage url)`
/// pairs, in submission order.
pub fn build_dar(urls_with_dirs: &[(String, String)]) -> DarDocument {
    DarDocument {
        product_list: urls_with_dirs
            .iter()
            .map(|(dir, url)| DarProduct {
                download_directory: dir.clone(),
                product_access_url: url.clone(),
            })
            .collect(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadResponse {
    success: Option<bool>,
    dar_uuid: Option<String>,
    error_type: Option<String>,
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DarStatusList {
    data_access_requests: Vec<DarStatus>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DarStatus {
    pub uuid: Option<String>,
    #[serde(rename = "darURL")]
    pub dar_url: Option<String>,
    #[serde(rename = "productList", default)]
    pub product_list: Vec<ProductStatus>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductStatus {
    pub uuid: Option<String>,
    pub product_access_url: Option<String>,
    pub product_progress: Option<ProductProgress>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductProgress {
    pub status: String,
    pub progress_percentage: Option<f64>,
    pub downloaded_size: Option<u64>,
    pub message: Option<String>,
}

#[derive(Debug)]
pub enum SubmitOutcome {
    Accepted {
        dar_url: String,
        dar_uuid: Option<String>,
    },
    /// The DM already knows a DAR for this url; the caller logs and gives
    /// up.
    AlreadyExists,
}

#[derive(Debug)]
struct DarQueue {
    items: VecDeque<(String, DarDocument)>,
    seq_id: u64,
    id_base: String,
}

#[derive(Debug)]
pub struct DownloadManagerController {
    http: reqwest::Client,
    dm_port: u16,
    dm_url: String,
    download_dir: PathBuf,
    dar_resp_url: String,
    queue: Mutex<DarQueue>,
    max_port_wait_secs: u64,
    pub is_dm_listening: AtomicBool,
}

impl DownloadManagerController {
    /// Builds the controller from the DM's own configuration file named in
    /// the settings.
    ///
    /// # Errors
    ///
    /// Fails with `Config` when the file is unreadable or port/download-dir
    /// entries are missing.
    pub fn from_config(settings: &Settings) -> Result<Self> {
        let (dm_port, download_dir) = read_dm_config(&settings.dm_conf_fn)?;
        Ok(Self::with_endpoints(
            dm_port,
            settings.ie_server_port,
            download_dir,
            settings.max_port_wait_secs,
        ))
    }

    pub fn with_endpoints(
        dm_port: u16,
        ie_port: u16,
        download_dir: PathBuf,
        max_port_wait_secs: u64,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            dm_port,
            dm_url: format!("http://127.0.0.1:{dm_port}/download-manager/"),
            download_dir,
            dar_resp_url: format!("http://127.0.0.1:{ie_port}/{DAR_RESPONSE_PATH}"),
            queue: Mutex::new(DarQueue {
                items: VecDeque::new(),
                seq_id: 0,
                id_base: util::mk_id_base(),
            }),
            max_port_wait_secs,
            is_dm_listening: AtomicBool::new(false),
        }
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Prepares the download tree and waits for the DM's listening socket.
    /// Returns whether the socket was seen within the wait ceiling.
    pub async fn configure(&self) -> Result<bool> {
        if self.download_dir.as_os_str().is_empty() {
            return Err(Error::Config {
                message: "No download directory".to_owned(),
            });
        }
        util::check_or_make_dir(&self.download_dir)?;
        let year = chrono::Utc::now().format("%Y").to_string();
        util::check_or_make_dir(&self.download_dir.join(year))?;

        Ok(self.wait_for_port().await)
    }

    async fn wait_for_port(&self) -> bool {
        info!("Waiting for DM port {}", self.dm_port);
        let start = Instant::now();
        let deadline = start + Duration::from_secs(self.max_port_wait_secs);
        loop {
            match probe_listener(self.dm_port) {
                Ok(true) => {
                    info!(
                        "DM Port OK, waited {:.1} secs.",
                        start.elapsed().as_secs_f64()
                    );
                    self.is_dm_listening.store(true, Ordering::SeqCst);
                    return true;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        "Internal error probing for DM port: {e}; \
                         waiting {DEFAULT_PORT_WAIT_SECS} seconds."
                    );
                    tokio::time::sleep(Duration::from_secs(DEFAULT_PORT_WAIT_SECS)).await;
                    info!("Finished default wait.");
                    return false;
                }
            }
            if Instant::now() > deadline {
                warn!("Wait time elapsed without finding the listening port.");
                return false;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    #[cfg(test)]
    pub(crate) fn set_id_base(&self, base: &str) {
        self.queue.lock().expect("dar queue poisoned").id_base = base.to_owned();
    }

    /// Queues the document and allocates its process-unique sequence id.
    pub fn enqueue_dar(&self, dar: DarDocument) -> String {
        let mut queue = self.queue.lock().expect("dar queue poisoned");
        queue.seq_id = queue.seq_id.wrapping_add(1);
        let dar_seq_id = format!("{}{}", queue.id_base, queue.seq_id);
        queue.items.push_back((dar_seq_id.clone(), dar));
        dar_seq_id
    }

    /// Submits a DAR to the DM: the DM is told the url under which it can
    /// fetch the queued document back from the engine.
    ///
    /// # Errors
    ///
    /// Fails with `Dm` on transport errors, undecodable responses, or a DM
    /// error other than "already exists".
    pub async fn submit_dar(&self, dar: DarDocument) -> Result<SubmitOutcome> {
        let dar_seq_id = self.enqueue_dar(dar);
        let dar_url = format!("{}/{}", self.dar_resp_url, dar_seq_id);
        let dm_dl_url = format!("{}{}", self.dm_url, DOWNLOAD_COMMAND);

        info!("Submitting request to DM to retrieve DAR: darUrl={dar_url}");
        let response = self
            .http
            .post(&dm_dl_url)
            .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(format!("darUrl={dar_url}"))
            .send()
            .await
            .map_err(|e| {
                error!("Download Manager error: {e}");
                Error::Dm {
                    message: format!("HTTPError: {e}"),
                }
            })?;
        let dm_resp: DownloadResponse = response.json().await.map_err(|e| {
            error!("Undecodable response from Download Manager: {e}");
            Error::Dm {
                message: format!("URLError: {e}"),
            }
        })?;

        if dm_resp.success == Some(true) {
            info!("DM accepted DAR.");
            return Ok(SubmitOutcome::Accepted {
                dar_url,
                dar_uuid: dm_resp.dar_uuid,
            });
        }
        if dm_resp.error_type.as_deref() == Some("DataAccessRequestAlreadyExistsException") {
            return Ok(SubmitOutcome::AlreadyExists);
        }
        Err(Error::Dm {
            message: match dm_resp.error_message {
                Some(message) => format!("DM reports error: {message}"),
                None => "Unknown error, no 'errorMessage' found in response".to_owned(),
            },
        })
    }

    /// Hands out the queued document for `dar_seq_id`, usually the head of
    /// the queue; out-of-order fetches are honoured with a warning.
    pub fn next_dar(&self, dar_seq_id: &str) -> Option<DarDocument> {
        let mut queue = self.queue.lock().expect("dar queue poisoned");
        if let Some((head_id, _)) = queue.items.front() {
            if head_id == dar_seq_id {
                return queue.items.pop_front().map(|(_, dar)| dar);
            }
        }
        warn!("Out-of-sequence dar access, dar_seq_id: {dar_seq_id}");
        let at = queue.items.iter().position(|(id, _)| id == dar_seq_id);
        match at {
            Some(at) => queue.items.remove(at).map(|(_, dar)| dar),
            None => {
                warn!("DAR '{dar_seq_id}' not found");
                None
            }
        }
    }

    /// # Errors
    ///
    /// Fails with `Dm` when the status document cannot be fetched or lacks
    /// the request list.
    pub async fn dar_list(&self) -> Result<Vec<DarStatus>> {
        let url = format!("{}{}", self.dm_url, DAR_STATUS_COMMAND);
        let response = self.http.get(&url).send().await.map_err(|e| Error::Dm {
            message: format!("Unable to get DAR status from DM, error={e}"),
        })?;
        let list: DarStatusList = response.json().await.map_err(|_| Error::Dm {
            message: "Bad DAR status from DM; no 'dataAccessRequests' found.".to_owned(),
        })?;
        Ok(list.data_access_requests)
    }

    pub async fn dar_status(&self, dar_url: &str) -> Result<Option<DarStatus>> {
        let list = self.dar_list().await?;
        Ok(list
            .into_iter()
            .find(|r| r.dar_url.as_deref() == Some(dar_url)))
    }

    /// Cancels every product of the list that has not already completed.
    /// The DM has no whole-DAR cancel, so products are cancelled one by one.
    pub async fn stop_products(&self, products: &[ProductStatus]) {
        info!("Stopping products download");
        for product in products {
            if let Some(progress) = &product.product_progress {
                if progress.status == PRODUCT_STATUS_COMPLETED {
                    continue;
                }
            }
            let uuid = match &product.uuid {
                Some(uuid) => uuid,
                None => continue,
            };
            let url = format!("{}products/{uuid}?action=cancel", self.dm_url);
            if let Err(e) = self.http.get(&url).send().await {
                warn!("Error from DM while cancelling download: {e}");
            }
        }
    }

    /// Cancels all unfinished products of the DAR with the given uuid.
    pub async fn cancel_dar(&self, dar_uuid: &str) {
        info!("Stopping active download, dar uuid={dar_uuid}");
        let list = match self.dar_list().await {
            Ok(list) => list,
            Err(e) => {
                warn!("Cannot cancel DAR {dar_uuid}: {e}");
                return;
            }
        };
        let request = list.iter().find(|r| r.uuid.as_deref() == Some(dar_uuid));
        if let Some(request) = request {
            self.stop_products(&request.product_list).await;
        }
    }
}

fn read_dm_config(path: &Path) -> Result<(u16, PathBuf)> {
    let content = std::fs::read_to_string(path).map_err(|e| Error::Config {
        message: format!("Cannot access download manager configuration ({}): {e}", path.display()),
    })?;

    let mut port = None;
    let mut download_dir = None;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            match key.trim() {
                DM_PORT_KEY => port = value.trim().parse::<u16>().ok(),
                DM_DOWNLOAD_DIR_KEY => {
                    let value = value.trim();
                    if !value.is_empty() {
                        download_dir = Some(PathBuf::from(value));
                    }
                }
                _ => {}
            }
        }
    }

    let port = port.ok_or_else(|| Error::Config {
        message: "No DM port".to_owned(),
    })?;
    let download_dir = download_dir.ok_or_else(|| Error::Config {
        message: "No download directory".to_owned(),
    })?;
    Ok((port, download_dir))
}

#[cfg(target_os = "linux")]
fn probe_listener(dm_port: u16) -> std::io::Result<bool> {
    let content = std::fs::read_to_string("/proc/net/tcp")?;
    Ok(port::has_listener(
        &content,
        nix::unistd::getuid().as_raw(),
        dm_port,
    ))
}

#[cfg(not(target_os = "linux"))]
fn probe_listener(dm_port: u16) -> std::io::Result<bool> {
    use std::net::{Ipv4Addr, SocketAddr, TcpStream};
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, dm_port));
    Ok(TcpStream::connect_timeout(&addr, Duration::from_millis(500)).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use httptest::{matchers::*, responders::*, Expectation, Server, ServerBuilder};

    fn run_ipv4_server() -> Server {
        ServerBuilder::new()
            .bind_addr(([127, 0, 0, 1], 0).into())
            .run()
            .unwrap()
    }

    fn controller() -> DownloadManagerController {
        DownloadManagerController::with_endpoints(9999, 8000, PathBuf::from("/tmp/dl"), 1)
    }

    fn controller_for(server: &Server) -> DownloadManagerController {
        DownloadManagerController::with_endpoints(
            server.addr().port(),
            8000,
            PathBuf::from("/tmp/dl"),
            1,
        )
    }

    fn dar(tag: &str) -> DarDocument {
        build_dar(&[(format!("dir/{tag}"), format!("http://pf/{tag}"))])
    }

    #[test]
    fn queue_pops_in_submission_order() {
        let dm = controller();
        let id1 = dm.enqueue_dar(dar("a"));
        let id2 = dm.enqueue_dar(dar("b"));

        assert_eq!(dm.next_dar(&id1), Some(dar("a")));
        assert_eq!(dm.next_dar(&id2), Some(dar("b")));
        assert_eq!(dm.next_dar(&id1), None);
    }

    #[test]
    fn queue_honours_out_of_order_fetches() {
        let dm = controller();
        let id_a = dm.enqueue_dar(dar("a"));
        let id_b = dm.enqueue_dar(dar("b"));
        let id_c = dm.enqueue_dar(dar("c"));

        assert_eq!(dm.next_dar(&id_b), Some(dar("b")));
        assert_eq!(dm.next_dar(&id_a), Some(dar("a")));
        assert_eq!(dm.next_dar(&id_c), Some(dar("c")));
    }

    #[test]
    fn sequence_ids_are_unique() {
        let dm = controller();
        let ids: std::collections::HashSet<String> =
            (0..100).map(|_| dm.enqueue_dar(dar("x"))).collect();
        assert_eq!(ids.len(), 100);
    }

    #[tokio::test]
    async fn submit_accepted() {
        let server = run_ipv4_server();
        server.expect(
            Expectation::matching(request::method_path(
                "POST",
                "/download-manager/download",
            ))
            .respond_with(json_encoded(serde_json::json!({
                "success": true,
                "darUuid": "uuid-123",
            }))),
        );

        let dm = controller_for(&server);
        match dm.submit_dar(dar("a")).await.unwrap() {
            SubmitOutcome::Accepted { dar_url, dar_uuid } => {
                assert!(dar_url.starts_with("http://127.0.0.1:8000/ingest/darResponse/"));
                assert_eq!(dar_uuid.as_deref(), Some("uuid-123"));
            }
            SubmitOutcome::AlreadyExists => panic!("expected acceptance"),
        }
    }

    #[tokio::test]
    async fn submit_reports_existing_dar() {
        let server = run_ipv4_server();
        server.expect(
            Expectation::matching(request::method_path("POST", "/download-manager/download"))
                .respond_with(json_encoded(serde_json::json!({
                    "success": false,
                    "errorType": "DataAccessRequestAlreadyExistsException",
                    "errorMessage": "exists",
                }))),
        );

        let dm = controller_for(&server);
        assert!(matches!(
            dm.submit_dar(dar("a")).await.unwrap(),
            SubmitOutcome::AlreadyExists
        ));
    }

    #[tokio::test]
    async fn submit_surfaces_dm_errors() {
        let server = run_ipv4_server();
        server.expect(
            Expectation::matching(request::method_path("POST", "/download-manager/download"))
                .respond_with(json_encoded(serde_json::json!({
                    "success": false,
                    "errorMessage": "download dir is full",
                }))),
        );

        let dm = controller_for(&server);
        match dm.submit_dar(dar("a")).await {
            Err(Error::Dm { message }) => assert!(message.contains("download dir is full")),
            other => panic!("expected Dm error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dar_status_finds_entry_by_url() {
        let server = run_ipv4_server();
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                "/download-manager/dataAccessRequests",
            ))
            .times(2)
            .respond_with(json_encoded(serde_json::json!({
                "dataAccessRequests": [{
                    "uuid": "u1",
                    "darURL": "http://127.0.0.1:8000/ingest/darResponse/x",
                    "productList": [{
                        "uuid": "p1",
                        "productAccessUrl": "http://pf/a",
                        "productProgress": {
                            "status": "RUNNING",
                            "progressPercentage": 40.0,
                            "downloadedSize": 1024
                        }
                    }]
                }]
            }))),
        );

        let dm = controller_for(&server);
        let status = dm
            .dar_status("http://127.0.0.1:8000/ingest/darResponse/x")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.product_list.len(), 1);
        assert!(dm.dar_status("http://unknown/").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_skips_completed_products() {
        let server = run_ipv4_server();
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                "/download-manager/dataAccessRequests",
            ))
            .respond_with(json_encoded(serde_json::json!({
                "dataAccessRequests": [{
                    "uuid": "dar-1",
                    "darURL": "http://cb/1",
                    "productList": [
                        {
                            "uuid": "done",
                            "productProgress": { "status": "COMPLETED" }
                        },
                        {
                            "uuid": "running",
                            "productProgress": { "status": "RUNNING" }
                        }
                    ]
                }]
            }))),
        );
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/download-manager/products/running"),
                request::query(url_decoded(contains(("action", "cancel")))),
            ])
            .respond_with(json_encoded(serde_json::json!({"success": true}))),
        );

        let dm = controller_for(&server);
        dm.cancel_dar("dar-1").await;
    }

    #[test]
    fn dm_config_parsing() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("dm.properties");
        std::fs::write(
            &path,
            "# download manager\nWEB_INTERFACE_PORT_NO=8082\nBASE_DOWNLOAD_FOLDER_ABSOLUTE=/data/ingest\n",
        )
        .unwrap();
        let (port, dir) = read_dm_config(&path).unwrap();
        assert_eq!(port, 8082);
        assert_eq!(dir, PathBuf::from("/data/ingest"));

        std::fs::write(&path, "BASE_DOWNLOAD_FOLDER_ABSOLUTE=/data/ingest\n").unwrap();
        assert!(read_dm_config(&path).is_err());

        assert!(read_dm_config(Path::new("/nonexistent/dm.properties")).is_err());
    }
}
