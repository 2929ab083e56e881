// Remembers which axes have been explored, so repeated invocations make forward progress.
// One process at a time; there is no locking.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    utils,
};

pub const STATE_VERSION: &str = "1.0";

fn default_version() -> String {
    STATE_VERSION.to_owned()
}

/// On-disk layout of `axis_state.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateDocument {
    #[serde(default = "default_version")]
    version: String,
    #[serde(default)]
    used_axes: Vec<String>,
    #[serde(default)]
    last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    total_used: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progress {
    pub used: usize,
    pub total: usize,
    pub percentage: f64,
    pub remaining: Vec<String>,
    pub used_axes: Vec<String>,
}

#[derive(Debug)]
pub struct StateTracker {
    path: PathBuf,
    used: BTreeSet<String>,
    last_updated: Option<DateTime<Utc>>,
}

impl StateTracker {
    /// Loads the state file. A missing file means nothing has been explored yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut tracker = StateTracker {
            path,
            used: BTreeSet::new(),
            last_updated: None,
        };
        let text = match std::fs::read_to_string(&tracker.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No state file at {}, starting fresh", tracker.path.display());
                return Ok(tracker);
            }
            Err(e) => {
                return Err(Error::io(format!("failed to read {}", tracker.path.display()), e));
            }
        };
        match serde_json::from_str::<StateDocument>(&text) {
            Ok(doc) => {
                if doc.version != STATE_VERSION {
                    warn!(
                        "State file {} has unknown version {}, reading it anyway",
                        tracker.path.display(),
                        doc.version
                    );
                }
                tracker.used = doc.used_axes.into_iter().collect();
                tracker.last_updated = doc.last_updated;
                debug!("Loaded state: {} axes used", tracker.used.len());
            }
            Err(e) => {
                warn!(
                    "State file {} is unreadable ({}); starting fresh, the next save rewrites it",
                    tracker.path.display(),
                    e
                );
            }
        }
        Ok(tracker)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn used_axes(&self) -> impl Iterator<Item = &str> {
        self.used.iter().map(String::as_str)
    }

    pub fn total_used(&self) -> usize {
        self.used.len()
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.last_updated
    }

    pub fn is_used(&self, axis: &str) -> bool {
        self.used.contains(axis)
    }

    /// Marking an axis twice is a no-op; the file is only rewritten on change.
    pub fn mark_used(&mut self, axis: &str) -> Result<()> {
        if !self.used.insert(axis.to_owned()) {
            debug!("Axis '{}' is already marked used", axis);
            return Ok(());
        }
        info!("Marked axis '{}' as used", axis);
        self.save()
    }

    /// Returns `axis` to the unused pool. Returns whether it was used.
    pub fn forget(&mut self, axis: &str) -> Result<bool> {
        if !self.used.remove(axis) {
            warn!("Axis '{}' is not in the used list", axis);
            return Ok(false);
        }
        info!("Axis '{}' returned to the unused pool", axis);
        self.save()?;
        Ok(true)
    }

    pub fn reset(&mut self) -> Result<()> {
        warn!("Resetting exploration state ({} axes were used)", self.total_used());
        self.used.clear();
        self.save()
    }

    /// Axes not used yet, in the order of `all_axes`.
    pub fn unused_axes<S: AsRef<str>>(&self, all_axes: &[S]) -> Vec<String> {
        all_axes
            .iter()
            .map(AsRef::as_ref)
            .filter(|a| !self.is_used(a))
            .map(str::to_owned)
            .collect()
    }

    pub fn is_all_used<S: AsRef<str>>(&self, all_axes: &[S]) -> bool {
        all_axes.iter().all(|a| self.is_used(a.as_ref()))
    }

    pub fn progress<S: AsRef<str>>(&self, all_axes: &[S]) -> Progress {
        for stale in self.used_axes().filter(|u| !all_axes.iter().any(|a| a.as_ref() == *u)) {
            debug!("State lists axis '{}', which the template no longer declares", stale);
        }
        let used_axes: Vec<String> = all_axes
            .iter()
            .map(AsRef::as_ref)
            .filter(|a| self.is_used(a))
            .map(str::to_owned)
            .collect();
        let total = all_axes.len();
        let percentage = if total == 0 {
            0.0
        } else {
            used_axes.len() as f64 * 100.0 / total as f64
        };
        Progress {
            used: used_axes.len(),
            total,
            percentage,
            remaining: self.unused_axes(all_axes),
            used_axes,
        }
    }

    fn save(&mut self) -> Result<()> {
        let now = Utc::now();
        let doc = StateDocument {
            version: default_version(),
            used_axes: self.used.iter().cloned().collect(),
            last_updated: Some(now),
            total_used: self.used.len(),
        };
        utils::write_json(&self.path, &doc)?;
        self.last_updated = Some(now);
        Ok(())
    }
}
