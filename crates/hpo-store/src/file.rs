use std::fs;
use std::path::{Path, PathBuf};

use hpo_types::{
    HpoError, HpoResult, StoreError, SweepError, SweepSpec, SweepStage, TrialRecord, TrialReport,
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{not_found, SweepSnapshot, SweepStore};

const EXTENSION: &str = "json";

/// Sweep store keeping one JSON document per sweep under a root directory.
///
/// Each document holds the spec, all trials and the revision, so a commit is
/// a single file replace. Writes go through a temporary file and a rename.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> HpoResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        info!(root = %root.display(), "file store opened");
        Ok(Self {
            root,
            lock: Mutex::new(()),
        })
    }

    /// Store under the platform data directory, e.g. `~/.local/share/hpo`.
    pub fn default_location() -> HpoResult<Self> {
        let base = dirs::data_dir()
            .ok_or_else(|| StoreError::Backend {
                message: "no platform data directory available".to_string(),
            })?;
        Self::new(base.join("hpo"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, sweep_id: &str) -> HpoResult<PathBuf> {
        if sweep_id.is_empty()
            || sweep_id.starts_with('.')
            || sweep_id.contains(['/', '\\'])
        {
            return Err(HpoError::configuration(
                sweep_id,
                "sweep_id cannot be used as a file name",
            ));
        }
        Ok(self.root.join(format!("{sweep_id}.{EXTENSION}")))
    }

    fn load(&self, sweep_id: &str) -> HpoResult<Option<SweepSnapshot>> {
        let path = self.path_for(sweep_id)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let snapshot: SweepSnapshot =
            serde_json::from_slice(&bytes).map_err(|e| StoreError::Corruption {
                key: sweep_id.to_string(),
                message: e.to_string(),
            })?;
        if snapshot.spec.sweep_id != sweep_id {
            return Err(StoreError::Corruption {
                key: sweep_id.to_string(),
                message: format!("document holds sweep '{}'", snapshot.spec.sweep_id),
            }
            .into());
        }
        Ok(Some(snapshot))
    }

    fn load_existing(&self, sweep_id: &str) -> HpoResult<SweepSnapshot> {
        self.load(sweep_id)?.ok_or_else(|| not_found(sweep_id))
    }

    fn save(&self, snapshot: &SweepSnapshot) -> HpoResult<()> {
        let path = self.path_for(&snapshot.spec.sweep_id)?;
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        debug!(sweep = %snapshot.spec.sweep_id, revision = snapshot.revision, "sweep written");
        Ok(())
    }
}

impl SweepStore for FileStore {
    fn get(&self, sweep_id: &str) -> HpoResult<Option<SweepSnapshot>> {
        let _guard = self.lock.lock();
        self.load(sweep_id)
    }

    fn put(
        &self,
        spec: &SweepSpec,
        trials: &[TrialRecord],
        expected_revision: u64,
    ) -> HpoResult<u64> {
        let _guard = self.lock.lock();
        let mut snapshot = self.load_existing(&spec.sweep_id)?;
        let revision = snapshot.commit(spec, trials, expected_revision)?;
        self.save(&snapshot)?;
        Ok(revision)
    }

    fn insert(&self, spec: SweepSpec) -> HpoResult<u64> {
        spec.validate()?;
        spec.validate_snapshot(&[])?;

        let _guard = self.lock.lock();
        let revision = match self.load(&spec.sweep_id)? {
            Some(existing) if existing.is_live() => {
                warn!(sweep = %spec.sweep_id, "refusing to replace running sweep");
                return Err(SweepError::AlreadyRunning {
                    sweep_id: spec.sweep_id,
                }
                .into());
            }
            Some(existing) => existing.revision + 1,
            None => 1,
        };
        let snapshot = SweepSnapshot::new(spec, revision);
        self.save(&snapshot)?;
        info!(sweep = %snapshot.spec.sweep_id, revision, "sweep registered");
        Ok(revision)
    }

    fn list_by_sweep(&self, sweep_id: &str) -> HpoResult<Vec<TrialRecord>> {
        let _guard = self.lock.lock();
        Ok(self.load_existing(sweep_id)?.trials)
    }

    fn list_sweeps(&self) -> HpoResult<Vec<String>> {
        let _guard = self.lock.lock();
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn report(&self, report: &TrialReport) -> HpoResult<bool> {
        let _guard = self.lock.lock();
        let mut snapshot = self.load_existing(&report.sweep_id)?;
        let applied = snapshot.apply_report(report)?;
        if applied {
            self.save(&snapshot)?;
        }
        Ok(applied)
    }

    fn set_desired_stage(&self, sweep_id: &str, stage: SweepStage) -> HpoResult<u64> {
        let _guard = self.lock.lock();
        let mut snapshot = self.load_existing(sweep_id)?;
        let revision = snapshot.set_desired_stage(stage);
        self.save(&snapshot)?;
        info!(sweep = %sweep_id, desired = %stage, "desired stage updated");
        Ok(revision)
    }

    fn delete(&self, sweep_id: &str) -> HpoResult<bool> {
        let _guard = self.lock.lock();
        let path = self.path_for(sweep_id)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(sweep = %sweep_id, "sweep deleted");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
