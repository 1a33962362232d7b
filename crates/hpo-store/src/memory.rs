use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hpo_types::{HpoResult, SweepError, SweepSpec, SweepStage, TrialRecord, TrialReport};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::{not_found, SweepSnapshot, SweepStore};

/// In-process sweep store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    sweeps: DashMap<String, RwLock<SweepSnapshot>>,
    stats: RwLock<StoreStats>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> StoreStats {
        self.stats.read().clone()
    }

    pub fn len(&self) -> usize {
        self.sweeps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sweeps.is_empty()
    }
}

impl SweepStore for MemoryStore {
    fn get(&self, sweep_id: &str) -> HpoResult<Option<SweepSnapshot>> {
        Ok(self.sweeps.get(sweep_id).map(|entry| entry.read().clone()))
    }

    fn put(
        &self,
        spec: &SweepSpec,
        trials: &[TrialRecord],
        expected_revision: u64,
    ) -> HpoResult<u64> {
        let entry = self
            .sweeps
            .get(&spec.sweep_id)
            .ok_or_else(|| not_found(&spec.sweep_id))?;
        let mut snapshot = entry.write();

        match snapshot.commit(spec, trials, expected_revision) {
            Ok(revision) => {
                self.stats.write().commits += 1;
                Ok(revision)
            }
            Err(e) => {
                if e.is_stale_snapshot() {
                    self.stats.write().conflicts += 1;
                    debug!(sweep = %spec.sweep_id, expected_revision, "stale commit rejected");
                }
                Err(e)
            }
        }
    }

    fn insert(&self, spec: SweepSpec) -> HpoResult<u64> {
        spec.validate()?;
        spec.validate_snapshot(&[])?;

        match self.sweeps.entry(spec.sweep_id.clone()) {
            Entry::Occupied(occupied) => {
                let mut snapshot = occupied.get().write();
                if snapshot.is_live() {
                    warn!(sweep = %spec.sweep_id, "refusing to replace running sweep");
                    return Err(SweepError::AlreadyRunning {
                        sweep_id: spec.sweep_id,
                    }
                    .into());
                }
                // Keep counting from the old revision so stale readers of the
                // replaced sweep cannot commit over the new one.
                let revision = snapshot.revision + 1;
                *snapshot = SweepSnapshot::new(spec, revision);
                info!(sweep = %snapshot.spec.sweep_id, revision, "sweep replaced");
                Ok(revision)
            }
            Entry::Vacant(vacant) => {
                info!(sweep = %spec.sweep_id, "sweep registered");
                vacant.insert(RwLock::new(SweepSnapshot::new(spec, 1)));
                Ok(1)
            }
        }
    }

    fn list_by_sweep(&self, sweep_id: &str) -> HpoResult<Vec<TrialRecord>> {
        let entry = self.sweeps.get(sweep_id).ok_or_else(|| not_found(sweep_id))?;
        let trials = entry.read().trials.clone();
        Ok(trials)
    }

    fn list_sweeps(&self) -> HpoResult<Vec<String>> {
        let mut ids: Vec<String> = self.sweeps.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        Ok(ids)
    }

    fn report(&self, report: &TrialReport) -> HpoResult<bool> {
        let entry = self
            .sweeps
            .get(&report.sweep_id)
            .ok_or_else(|| not_found(&report.sweep_id))?;
        let applied = entry.write().apply_report(report)?;
        if applied {
            self.stats.write().reports += 1;
        }
        Ok(applied)
    }

    fn set_desired_stage(&self, sweep_id: &str, stage: SweepStage) -> HpoResult<u64> {
        let entry = self.sweeps.get(sweep_id).ok_or_else(|| not_found(sweep_id))?;
        let revision = entry.write().set_desired_stage(stage);
        info!(sweep = %sweep_id, desired = %stage, "desired stage updated");
        Ok(revision)
    }

    fn delete(&self, sweep_id: &str) -> HpoResult<bool> {
        let removed = self.sweeps.remove(sweep_id).is_some();
        if removed {
            info!(sweep = %sweep_id, "sweep deleted");
        }
        Ok(removed)
    }
}

/// Write counters.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub commits: u64,
    pub conflicts: u64,
    pub reports: u64,
}
