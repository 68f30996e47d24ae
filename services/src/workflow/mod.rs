//! The workflow engine: a LIFO task queue drained by a fixed pool of
//! workers, plus the periodic auto-trigger that re-enqueues repeating
//! scenarios.
//!
//! The queue is LIFO so that freshly submitted scenarios preempt a long
//! backlog. Workers perform the blocking parts of a run (HTTP, DM polling,
//! script subprocesses) and never die on a task failure.

use crate::dm::DownloadManagerController;
use crate::scenarios::{status, ScenarioDb};
use crate::util::config::Settings;
use chrono::{DateTime, Utc};
use log::debug;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

mod worker;

const AUTO_TRIGGER_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub enum Task {
    IngestScenario {
        scenario_id: i64,
        scripts: Vec<PathBuf>,
    },
    IngestLocalProduct {
        scenario_id: i64,
        ncn_id: String,
        dir_path: PathBuf,
        metadata: PathBuf,
        data: PathBuf,
        scripts: Vec<PathBuf>,
        cat_registration: bool,
    },
    DeleteScenario {
        scenario_id: i64,
        scripts: Vec<PathBuf>,
    },
    AddProduct {
        scenario_id: i64,
        product_paths: Vec<PathBuf>,
    },
}

impl Task {
    pub fn scenario_id(&self) -> i64 {
        match self {
            Task::IngestScenario { scenario_id, .. }
            | Task::IngestLocalProduct { scenario_id, .. }
            | Task::DeleteScenario { scenario_id, .. }
            | Task::AddProduct { scenario_id, .. } => *scenario_id,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Task::IngestScenario { .. } => "INGEST_SCENARIO",
            Task::IngestLocalProduct { .. } => "INGEST_LOCAL_PROD",
            Task::DeleteScenario { .. } => "DELETE_SCENARIO",
            Task::AddProduct { .. } => "ADD_PRODUCT",
        }
    }
}

/// Thread-safe LIFO queue with an async blocking pop.
#[derive(Debug, Default)]
pub struct TaskQueue {
    items: Mutex<Vec<Task>>,
    notify: Notify,
}

impl TaskQueue {
    pub fn push(&self, task: Task) {
        self.items.lock().expect("task queue poisoned").push(task);
        self.notify.notify_one();
    }

    pub async fn pop(&self) -> Task {
        loop {
            if let Some(task) = self.items.lock().expect("task queue poisoned").pop() {
                return task;
            }
            self.notify.notified().await;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().expect("task queue poisoned").is_empty()
    }
}

pub struct WorkflowManager {
    pub db: Arc<ScenarioDb>,
    pub dm: Arc<DownloadManagerController>,
    pub settings: Settings,
    queue: TaskQueue,
}

impl WorkflowManager {
    pub fn new(
        db: Arc<ScenarioDb>,
        dm: Arc<DownloadManagerController>,
        settings: Settings,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            dm,
            settings,
            queue: TaskQueue::default(),
        })
    }

    /// Spawns the worker pool and the auto-trigger.
    pub fn start(self: &Arc<Self>) {
        for worker_id in 0..self.settings.ie_n_workflow_workers {
            let wfm = Arc::clone(self);
            tokio::spawn(async move { wfm.worker_loop(worker_id).await });
        }
        let wfm = Arc::clone(self);
        tokio::spawn(async move { wfm.auto_trigger_loop().await });
    }

    pub fn enqueue(&self, task: Task) {
        // percent stays above 0 to keep the status page polling
        self.db
            .set_scenario_status(task.scenario_id(), false, status::QUEUED, 1.);
        self.queue.push(task);
    }

    pub fn lock_scenario(&self, scenario_id: i64) -> bool {
        self.db.lock_scenario(scenario_id)
    }

    /// Marks the scenario as stopping and cancels its active DAR, if any.
    /// The DM round-trip happens outside the store mutex.
    pub async fn set_stop_request(&self, scenario_id: i64) {
        if let Some(active_dar) = self.db.request_stop(scenario_id) {
            self.dm.cancel_dar(&active_dar).await;
        }
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        debug!("Worker-{worker_id} of the workflow manager is running.");
        loop {
            let task = self.queue.pop().await;
            worker::dispatch(&self, worker_id, task).await;
            if self.queue.is_empty() {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }

    async fn auto_trigger_loop(self: Arc<Self>) {
        loop {
            for scenario in self.db.all_scenarios() {
                let now = Utc::now();
                if scenario.repeat_interval != 0 && scenario.starting_date <= now {
                    let next =
                        advance_starting_date(scenario.starting_date, scenario.repeat_interval, now);
                    debug!("Scenario {} - new starting date: {next}", scenario.id);
                    self.db.update_starting_date(scenario.id, next);
                    self.enqueue(Task::IngestScenario {
                        scenario_id: scenario.id,
                        scripts: scenario.scripts.clone(),
                    });
                }
            }
            tokio::time::sleep(AUTO_TRIGGER_INTERVAL).await;
        }
    }
}

/// Advances a due starting date by whole repeat intervals until it lies in
/// the future.
pub fn advance_starting_date(
    starting_date: DateTime<Utc>,
    repeat_interval_secs: u64,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let delta = chrono::Duration::seconds(repeat_interval_secs as i64);
    let mut date = starting_date;
    let prev = now - delta;
    if date <= prev {
        date = prev;
    }
    while date <= now {
        date = date + delta;
    }
    date
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::scenarios::{DataSourceType, Scenario};
    use chrono::TimeZone;
    use eoingest_datatypes::primitives::Bbox;
    use httptest::{matchers::*, responders::*, Expectation, Server, ServerBuilder};

    fn run_ipv4_server() -> Server {
        ServerBuilder::new()
            .bind_addr(([127, 0, 0, 1], 0).into())
            .run()
            .unwrap()
    }

    pub(crate) fn sample_scenario(ncn_id: &str) -> Scenario {
        Scenario {
            id: 0,
            ncn_id: ncn_id.to_owned(),
            dsrc: "http://pf.example.com/eowcs".to_owned(),
            dsrc_type: DataSourceType::Eowcs,
            aoi_bbox: Bbox::new((8., 50.).into(), (12.3, 55.).into()).unwrap(),
            from_date: Utc.with_ymd_and_hms(2011, 1, 1, 0, 0, 0).unwrap(),
            to_date: Utc.with_ymd_and_hms(2011, 2, 1, 0, 0, 0).unwrap(),
            starting_date: Utc.with_ymd_and_hms(2011, 1, 1, 0, 0, 0).unwrap(),
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

    fn task(scenario_id: i64) -> Task {
        Task::IngestScenario {
            scenario_id,
            scripts: vec![],
        }
    }

    #[tokio::test]
    async fn queue_is_lifo() {
        let queue = TaskQueue::default();
        queue.push(task(1));
        queue.push(task(2));
        queue.push(task(3));

        assert_eq!(queue.pop().await.scenario_id(), 3);
        assert_eq!(queue.pop().await.scenario_id(), 2);
        assert_eq!(queue.pop().await.scenario_id(), 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn queue_pop_wakes_on_push() {
        let queue = Arc::new(TaskQueue::default());
        let popper = Arc::clone(&queue);
        let handle = tokio::spawn(async move { popper.pop().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.push(task(7));

        let task = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("pop did not wake")
            .unwrap();
        assert_eq!(task.scenario_id(), 7);
    }

    #[test]
    fn starting_date_advances_past_now() {
        let start = Utc.with_ymd_and_hms(2013, 1, 1, 0, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2013, 1, 10, 6, 30, 0).unwrap();
        let next = advance_starting_date(start, 86_400, now);
        assert_eq!(next, Utc.with_ymd_and_hms(2013, 1, 11, 6, 30, 0).unwrap());

        // a date already in the future is left alone
        let due_soon = now + chrono::Duration::seconds(10);
        assert_eq!(advance_starting_date(due_soon, 86_400, now), due_soon);
    }

    const CAPABILITIES_BODY: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<wcs:Capabilities
    xmlns:wcs="http://www.opengis.net/wcs/2.0"
    xmlns:ows="http://www.opengis.net/ows/2.0"
    xmlns:gml="http://www.opengis.net/gml/3.2"
    xmlns:wcseo="http://www.opengis.net/wcseo/1.0" version="2.0.1">
  <ows:ServiceIdentification>
    <ows:ServiceTypeVersion>2.0.1</ows:ServiceTypeVersion>
  </ows:ServiceIdentification>
  <wcs:Contents>
    <wcs:Extension>
      <wcseo:DatasetSeriesSummary>
        <wcseo:DatasetSeriesId>series_1</wcseo:DatasetSeriesId>
        <ows:WGS84BoundingBox>
          <ows:LowerCorner>8 50</ows:LowerCorner>
          <ows:UpperCorner>12.3 55</ows:UpperCorner>
        </ows:WGS84BoundingBox>
        <gml:TimePeriod gml:id="tp_series_1">
          <gml:beginPosition>2011-01-01T00:00:00</gml:beginPosition>
          <gml:endPosition>2011-12-31T00:00:00</gml:endPosition>
        </gml:TimePeriod>
      </wcseo:DatasetSeriesSummary>
    </wcs:Extension>
  </wcs:Contents>
</wcs:Capabilities>"#;

    fn coverage_set_body() -> String {
        let cd = crate::ingestion::metadata::tests::COVERAGE_DESCRIPTION
            .replace(r#"<?xml version="1.0" encoding="UTF-8"?>"#, "");
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<wcseo:EOCoverageSetDescription
    xmlns:wcseo="http://www.opengis.net/wcseo/1.0"
    xmlns:wcs="http://www.opengis.net/wcs/2.0" numberMatched="1" numberReturned="1">
  <wcs:CoverageDescriptions>
    {cd}
  </wcs:CoverageDescriptions>
</wcseo:EOCoverageSetDescription>"#
        )
    }

    /// End-to-end stop: a running download is cancelled, the scenario ends
    /// `IDLE` with no active DAR.
    #[tokio::test]
    async fn stop_request_interrupts_a_running_ingestion() {
        let pf = run_ipv4_server();
        pf.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/eowcs"),
                request::query(url_decoded(contains(("request", "GetCapabilities")))),
            ])
            .respond_with(status_code(200).body(CAPABILITIES_BODY)),
        );
        pf.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/eowcs"),
                request::query(url_decoded(contains(("request", "DescribeEOCoverageSet")))),
            ])
            .respond_with(status_code(200).body(coverage_set_body())),
        );

        let dm_server = run_ipv4_server();
        dm_server.expect(
            Expectation::matching(request::method_path("POST", "/download-manager/download"))
                .respond_with(json_encoded(serde_json::json!({
                    "success": true,
                    "darUuid": "dar-uuid-42",
                }))),
        );
        // the DAR stays in RUNNING state until it is cancelled
        dm_server.expect(
            Expectation::matching(request::method_path(
                "GET",
                "/download-manager/dataAccessRequests",
            ))
            .times(1..)
            .respond_with(json_encoded(serde_json::json!({
                "dataAccessRequests": [{
                    "uuid": "dar-uuid-42",
                    "darURL": "http://127.0.0.1:8000/ingest/darResponse/test-1",
                    "productList": [{
                        "uuid": "p1",
                        "productAccessUrl": "http://pf/cov",
                        "productProgress": {
                            "status": "RUNNING",
                            "progressPercentage": 25.0,
                            "downloadedSize": 1024
                        }
                    }]
                }]
            }))),
        );
        dm_server.expect(
            Expectation::matching(request::method_path("GET", "/download-manager/products/p1"))
                .times(0..)
                .respond_with(json_encoded(serde_json::json!({"success": true}))),
        );

        let tmp = tempfile::tempdir().unwrap();
        let db = Arc::new(ScenarioDb::new());
        let dm = Arc::new(DownloadManagerController::with_endpoints(
            dm_server.addr().port(),
            8000,
            tmp.path().to_path_buf(),
            1,
        ));
        let settings = Settings {
            dar_status_interval: 1,
            ie_n_workflow_workers: 1,
            ..Settings::default()
        };

        dm.set_id_base("test-");

        let mut scenario = sample_scenario("sc42");
        scenario.dsrc = pf.url_str("/eowcs");
        let scenario_id = db.add_scenario(scenario);

        let wfm = WorkflowManager::new(Arc::clone(&db), Arc::clone(&dm), settings);
        wfm.start();
        assert!(wfm.lock_scenario(scenario_id));
        wfm.enqueue(Task::IngestScenario {
            scenario_id,
            scripts: vec![],
        });

        // wait for the worker to reach the download phase
        let mut saw_download = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if !db.status(scenario_id).unwrap().active_dar.is_empty() {
                saw_download = true;
                break;
            }
        }
        assert!(saw_download, "worker never submitted a DAR");

        wfm.set_stop_request(scenario_id).await;

        let mut idle = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let row = db.status(scenario_id).unwrap();
            if row.status == status::IDLE {
                idle = true;
                assert!(row.active_dar.is_empty());
                assert!(row.is_available);
                break;
            }
        }
        assert!(idle, "scenario did not return to IDLE after the stop");
        assert!(!db.stop_requested(scenario_id));
    }
}
