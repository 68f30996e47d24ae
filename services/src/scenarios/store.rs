use super::{status, Scenario, ScenarioStatusRow, STOP_REQUEST};
use crate::error::{Error, Result};
use log::{error, warn};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// The shared scenario store. All scenario, status and archive state lives
/// behind one process-wide mutex; every method is a short critical section
/// and none is held across I/O.
#[derive(Debug, Default)]
pub struct ScenarioDb {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    scenarios: HashMap<i64, Scenario>,
    statuses: HashMap<i64, ScenarioStatusRow>,
    archive: HashSet<(i64, String)>,
    next_id: i64,
}

impl ScenarioDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts the scenario and its initial `IDLE` status row, assigning an
    /// id when the given one is 0.
    pub fn add_scenario(&self, mut scenario: Scenario) -> i64 {
        let mut inner = self.inner.lock().expect("scenario store poisoned");
        if scenario.id == 0 {
            inner.next_id += 1;
            scenario.id = inner.next_id;
        } else {
            inner.next_id = inner.next_id.max(scenario.id);
        }
        let id = scenario.id;
        inner.scenarios.insert(id, scenario);
        inner.statuses.insert(id, ScenarioStatusRow::default());
        id
    }

    pub fn scenario(&self, id: i64) -> Result<Scenario> {
        let inner = self.inner.lock().expect("scenario store poisoned");
        inner
            .scenarios
            .get(&id)
            .cloned()
            .ok_or(Error::UnknownScenario { scenario_id: id })
    }

    pub fn all_scenarios(&self) -> Vec<Scenario> {
        let inner = self.inner.lock().expect("scenario store poisoned");
        let mut scenarios: Vec<Scenario> = inner.scenarios.values().cloned().collect();
        scenarios.sort_by_key(|s| s.id);
        scenarios
    }

    pub fn status(&self, id: i64) -> Result<ScenarioStatusRow> {
        let inner = self.inner.lock().expect("scenario store poisoned");
        inner
            .statuses
            .get(&id)
            .cloned()
            .ok_or(Error::UnknownScenario { scenario_id: id })
    }

    pub fn update_starting_date(&self, id: i64, starting_date: chrono::DateTime<chrono::Utc>) {
        let mut inner = self.inner.lock().expect("scenario store poisoned");
        match inner.scenarios.get_mut(&id) {
            Some(scenario) => scenario.starting_date = starting_date,
            None => warn!("update_starting_date: unknown scenario {id}"),
        }
    }

    /// Removes the scenario, its status row and its archive entries.
    pub fn delete_scenario(&self, id: i64) -> Result<()> {
        let mut inner = self.inner.lock().expect("scenario store poisoned");
        if inner.scenarios.remove(&id).is_none() {
            return Err(Error::UnknownScenario { scenario_id: id });
        }
        inner.statuses.remove(&id);
        inner.archive.retain(|(scenario_id, _)| *scenario_id != id);
        Ok(())
    }

    pub fn set_scenario_status(&self, id: i64, is_available: bool, status: &str, done: f32) {
        let mut inner = self.inner.lock().expect("scenario store poisoned");
        match inner.statuses.get_mut(&id) {
            Some(row) => {
                row.is_available = is_available;
                row.status = status.to_owned();
                row.done = done;
            }
            None => error!("set_scenario_status: unknown scenario {id}"),
        }
    }

    pub fn set_ingestion_pid(&self, id: i64, pid: u32) {
        let mut inner = self.inner.lock().expect("scenario store poisoned");
        match inner.statuses.get_mut(&id) {
            Some(row) => row.ingestion_pid = pid,
            None => error!("set_ingestion_pid: unknown scenario {id}"),
        }
    }

    /// Atomically takes the scenario's availability lock. Returns false when
    /// the scenario is unknown or already taken.
    pub fn lock_scenario(&self, id: i64) -> bool {
        let mut inner = self.inner.lock().expect("scenario store poisoned");
        match inner.statuses.get_mut(&id) {
            Some(row) if row.is_available => {
                row.is_available = false;
                true
            }
            Some(_) => false,
            None => {
                error!("lock_scenario: unknown scenario {id}");
                false
            }
        }
    }

    /// Compare-and-set of the active DAR, used as per-scenario mutual
    /// exclusion: setting over a non-empty value fails, and clearing an
    /// already empty value fails. Both failures return false.
    pub fn set_active_dar(&self, id: i64, dar_id: &str) -> bool {
        let mut inner = self.inner.lock().expect("scenario store poisoned");
        let row = match inner.statuses.get_mut(&id) {
            Some(row) => row,
            None => {
                error!("set_active_dar: unknown scenario {id}");
                return false;
            }
        };
        if !dar_id.is_empty() && !row.active_dar.is_empty() {
            error!("A DAR is already active for scenario {id}");
            return false;
        }
        if dar_id.is_empty() && row.active_dar.is_empty() {
            return false;
        }
        row.active_dar = dar_id.to_owned();
        true
    }

    pub fn stop_requested(&self, id: i64) -> bool {
        let inner = self.inner.lock().expect("scenario store poisoned");
        inner
            .statuses
            .get(&id)
            .map(|row| row.status == STOP_REQUEST)
            .unwrap_or(false)
    }

    /// Marks the scenario as stopping. With an active DAR or a live worker
    /// pid the status becomes `STOP_REQUEST` and the cleared DAR uuid is
    /// returned for cancellation; otherwise the scenario is reset to `IDLE`.
    pub fn request_stop(&self, id: i64) -> Option<String> {
        let mut inner = self.inner.lock().expect("scenario store poisoned");
        let row = match inner.statuses.get_mut(&id) {
            Some(row) => row,
            None => {
                error!("request_stop: unknown scenario {id}");
                return None;
            }
        };

        let mut pid = row.ingestion_pid;
        if pid != std::process::id() {
            pid = 0;
        }
        let active_dar = std::mem::take(&mut row.active_dar);
        if !active_dar.is_empty() || pid != 0 {
            row.status = STOP_REQUEST.to_owned();
            row.is_available = true;
        } else {
            row.status = status::IDLE.to_owned();
            row.is_available = true;
            row.done = 0.;
        }

        if active_dar.is_empty() {
            None
        } else {
            Some(active_dar)
        }
    }

    pub fn is_archived(&self, id: i64, eoid: &str) -> bool {
        let inner = self.inner.lock().expect("scenario store poisoned");
        inner.archive.contains(&(id, eoid.to_owned()))
    }

    pub fn archive_product(&self, id: i64, eoid: &str) {
        let mut inner = self.inner.lock().expect("scenario store poisoned");
        inner.archive.insert((id, eoid.to_owned()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenarios::DataSourceType;
    use chrono::Utc;
    use eoingest_datatypes::primitives::Bbox;
    use std::sync::Arc;

    pub(crate) fn sample_scenario() -> Scenario {
        Scenario {
            id: 0,
            ncn_id: "sc42".to_owned(),
            dsrc: "http://example.com/eowcs".to_owned(),
            dsrc_type: DataSourceType::Eowcs,
            aoi_bbox: Bbox::new((8., 50.).into(), (12.3, 55.).into()).unwrap(),
            from_date: Utc::now(),
            to_date: Utc::now(),
            starting_date: Utc::now(),
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
    fn lock_scenario_takes_the_lock_once() {
        let db = ScenarioDb::new();
        let id = db.add_scenario(sample_scenario());
        assert!(db.lock_scenario(id));
        assert!(!db.lock_scenario(id));
    }

    #[test]
    fn active_dar_is_mutually_exclusive() {
        let db = ScenarioDb::new();
        let id = db.add_scenario(sample_scenario());
        assert!(db.set_active_dar(id, "dar-1"));
        assert!(!db.set_active_dar(id, "dar-2"));
        assert!(db.set_active_dar(id, ""));
        assert!(!db.set_active_dar(id, ""));
    }

    #[test]
    fn concurrent_dar_claims_grant_exactly_one() {
        let db = Arc::new(ScenarioDb::new());
        let id = db.add_scenario(sample_scenario());

        let claims: Vec<bool> = (0..8)
            .map(|_| {
                let db = Arc::clone(&db);
                std::thread::spawn(move || db.set_active_dar(id, "dar-x"))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect();

        assert_eq!(claims.iter().filter(|granted| **granted).count(), 1);
    }

    #[test]
    fn stop_request_with_active_dar_sets_sentinel() {
        let db = ScenarioDb::new();
        let id = db.add_scenario(sample_scenario());
        assert!(db.set_active_dar(id, "dar-1"));
        let cleared = db.request_stop(id);
        assert_eq!(cleared.as_deref(), Some("dar-1"));
        let row = db.status(id).unwrap();
        assert_eq!(row.status, STOP_REQUEST);
        assert!(row.active_dar.is_empty());
        assert!(db.stop_requested(id));
    }

    #[test]
    fn stop_request_without_activity_resets_to_idle() {
        let db = ScenarioDb::new();
        let id = db.add_scenario(sample_scenario());
        assert!(db.request_stop(id).is_none());
        assert_eq!(db.status(id).unwrap().status, status::IDLE);
    }

    #[test]
    fn archive_is_per_scenario() {
        let db = ScenarioDb::new();
        let a = db.add_scenario(sample_scenario());
        let b = db.add_scenario(sample_scenario());
        db.archive_product(a, "cov-1");
        assert!(db.is_archived(a, "cov-1"));
        assert!(!db.is_archived(b, "cov-1"));
        db.delete_scenario(a).unwrap();
        assert!(!db.is_archived(a, "cov-1"));
    }
}
