//! JSON-file-backed cron job storage.
//!
//! The whole job set is rewritten on every save: serialized to a sibling
//! temp file, then renamed over the store, so readers never see a torn file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::CronJob;
use crate::error::CronError;

const STORE_VERSION: u32 = 1;

#[derive(Deserialize)]
struct StoreFile {
    version: u32,
    #[serde(default)]
    jobs: Vec<CronJob>,
}

#[derive(Serialize)]
struct StoreFileRef<'a> {
    version: u32,
    jobs: &'a [CronJob],
}

/// Persistent storage for cron jobs.
#[derive(Debug, Clone)]
pub struct JobStore {
    path: PathBuf,
}

impl JobStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load all jobs in stored order. A missing file is an empty store.
    pub fn load(&self) -> Result<Vec<CronJob>, CronError> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "Cron store not found, starting empty");
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        let file: StoreFile = serde_json::from_str(&content)?;
        if file.version > STORE_VERSION {
            return Err(CronError::Persistence(format!(
                "{} has unsupported version {}",
                self.path.display(),
                file.version
            )));
        }
        Ok(file.jobs)
    }

    /// Replace the stored job set.
    pub fn save(&self, jobs: &[CronJob]) -> Result<(), CronError> {
        self.write(jobs).map_err(|e| {
            CronError::Persistence(format!("writing {}: {e}", self.path.display()))
        })
    }

    fn write(&self, jobs: &[CronJob]) -> Result<(), CronError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let body = serde_json::to_vec_pretty(&StoreFileRef {
            version: STORE_VERSION,
            jobs,
        })?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), jobs = jobs.len(), "Cron store saved");
        Ok(())
    }
}
