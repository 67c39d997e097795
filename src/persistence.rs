//! Job history and disabled jobs storage.
//!
//! Finished instances are stored as [`JobInfo`] snapshots. The `json`
//! backend appends one snapshot per line to a file and keeps the disabled
//! jobs in a JSON document next to it.

use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::TaroConfig;
use crate::error::{Result, TaroError};
use crate::job::{ExecutionStateObserver, JobInfo};

/// A job id, or a regular expression over job ids, excluded from execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisabledJob {
    pub job_id: String,
    #[serde(default)]
    pub regex: bool,
    pub created: DateTime<Utc>,
}

impl DisabledJob {
    /// Fails when `regex` is set and `job_id` is not a valid expression.
    pub fn new(job_id: impl Into<String>, regex: bool) -> Result<Self> {
        let job_id = job_id.into();
        if regex {
            anchored(&job_id)?;
        }
        Ok(Self {
            job_id,
            regex,
            created: Utc::now(),
        })
    }

    /// Exact id comparison, or a match of the whole id against the expression.
    pub fn matches(&self, job_id: &str) -> bool {
        if !self.regex {
            return self.job_id == job_id;
        }
        match anchored(&self.job_id) {
            Ok(re) => re.is_match(job_id),
            Err(e) => {
                tracing::warn!(pattern = %self.job_id, error = %e, "invalid_disabled_pattern");
                false
            }
        }
    }
}

fn anchored(pattern: &str) -> Result<Regex> {
    Ok(Regex::new(&format!("^(?:{pattern})$"))?)
}

pub trait Persistence: Send + Sync {
    /// Stored jobs, oldest first when `chronological`, newest first otherwise.
    fn read_jobs(&self, chronological: bool) -> Result<Vec<JobInfo>>;

    fn store(&self, job_info: &JobInfo) -> Result<()>;

    fn read_disabled_jobs(&self) -> Result<Vec<DisabledJob>>;

    /// Adds the entries not disabled yet and returns them.
    fn add_disabled_jobs(&self, jobs: &[DisabledJob]) -> Result<Vec<DisabledJob>>;

    /// Removes the entries with the given ids and returns the removed ids.
    fn remove_disabled_jobs(&self, job_ids: &[String]) -> Result<Vec<String>>;
}

/// Backend used when persistence is switched off; every call fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledPersistence;

impl Persistence for DisabledPersistence {
    fn read_jobs(&self, _chronological: bool) -> Result<Vec<JobInfo>> {
        Err(TaroError::PersistenceDisabled)
    }

    fn store(&self, _job_info: &JobInfo) -> Result<()> {
        Err(TaroError::PersistenceDisabled)
    }

    fn read_disabled_jobs(&self) -> Result<Vec<DisabledJob>> {
        Err(TaroError::PersistenceDisabled)
    }

    fn add_disabled_jobs(&self, _jobs: &[DisabledJob]) -> Result<Vec<DisabledJob>> {
        Err(TaroError::PersistenceDisabled)
    }

    fn remove_disabled_jobs(&self, _job_ids: &[String]) -> Result<Vec<String>> {
        Err(TaroError::PersistenceDisabled)
    }
}

pub struct JsonLinesPersistence {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonLinesPersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File holding the disabled jobs, `jobs.jsonl` -> `jobs.disabled.json`.
    pub fn disabled_path(&self) -> PathBuf {
        self.path.with_extension("disabled.json")
    }

    fn write_disabled(&self, jobs: &[DisabledJob]) -> Result<()> {
        let path = self.disabled_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(jobs)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

impl Persistence for JsonLinesPersistence {
    fn read_jobs(&self, chronological: bool) -> Result<Vec<JobInfo>> {
        let file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut jobs = Vec::new();
        for (number, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JobInfo>(&line) {
                Ok(info) => jobs.push(info),
                Err(e) => tracing::warn!(
                    path = %self.path.display(),
                    line = number + 1,
                    error = %e,
                    "corrupted_history_record"
                ),
            }
        }

        jobs.sort_by_key(|info| info.lifecycle.first_changed());
        if !chronological {
            jobs.reverse();
        }
        Ok(jobs)
    }

    fn store(&self, job_info: &JobInfo) -> Result<()> {
        let mut line = serde_json::to_vec(job_info)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        Ok(())
    }

    fn read_disabled_jobs(&self) -> Result<Vec<DisabledJob>> {
        match fs::read(self.disabled_path()) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn add_disabled_jobs(&self, jobs: &[DisabledJob]) -> Result<Vec<DisabledJob>> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut stored = self.read_disabled_jobs()?;
        let mut added = Vec::new();
        for job in jobs {
            let known = stored
                .iter()
                .any(|d| d.job_id == job.job_id && d.regex == job.regex);
            if !known {
                stored.push(job.clone());
                added.push(job.clone());
            }
        }
        if !added.is_empty() {
            self.write_disabled(&stored)?;
        }
        Ok(added)
    }

    fn remove_disabled_jobs(&self, job_ids: &[String]) -> Result<Vec<String>> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let stored = self.read_disabled_jobs()?;
        let (removed, kept): (Vec<_>, Vec<_>) =
            stored.into_iter().partition(|d| job_ids.contains(&d.job_id));
        if !removed.is_empty() {
            self.write_disabled(&kept)?;
        }
        Ok(removed.into_iter().map(|d| d.job_id).collect())
    }
}

/// Opens the backend selected by the configuration.
pub fn open(config: &TaroConfig) -> Result<Arc<dyn Persistence>> {
    if !config.persistence_enabled() {
        return Ok(Arc::new(DisabledPersistence));
    }
    match config.persistence_type() {
        "json" => Ok(Arc::new(JsonLinesPersistence::new(
            config.persistence_database(),
        ))),
        other => Err(TaroError::Config(format!(
            "unknown persistence type: {other}"
        ))),
    }
}

/// State observer storing the snapshot of every instance reaching a terminal state.
pub struct PersistingObserver {
    persistence: Arc<dyn Persistence>,
}

impl PersistingObserver {
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }
}

impl ExecutionStateObserver for PersistingObserver {
    fn state_update(&self, job_info: &JobInfo) {
        if !job_info.state().is_terminal() {
            return;
        }
        match self.persistence.store(job_info) {
            Ok(()) => tracing::debug!(instance_id = %job_info.instance_id, "job_persisted"),
            Err(TaroError::PersistenceDisabled) => {}
            Err(e) => tracing::error!(
                instance_id = %job_info.instance_id,
                error = %e,
                "job_persist_failed"
            ),
        }
    }
}
