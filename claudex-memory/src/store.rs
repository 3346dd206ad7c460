//! JSON-file persistence for last known pressure scores
//!
//! The store is read on every fallback path and written by callers after a
//! successful live query. It keeps the whole document in memory; the files it
//! tracks number in the hundreds, not millions.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{MemoryError, Result};
use crate::pressure::{ScoredFile, Temperature};

const DOCUMENT_VERSION: u32 = 1;

/// A persisted per-file pressure record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedScore {
    pub path: String,
    /// Project scope the score was recorded under (None = global)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    pub raw_pressure: f64,
    pub temperature: Temperature,
    pub updated_at: DateTime<Utc>,
}

/// Read access to persisted scores.
///
/// This is the only view the degradation cascade has of the store.
pub trait PersistedScoreReader: Send + Sync {
    /// Return records whose temperature is one of `temperatures`, optionally
    /// limited to a single project scope. Highest pressure first.
    fn scores_by_temperature(
        &self,
        temperatures: &[Temperature],
        project: Option<&str>,
    ) -> Result<Vec<PersistedScore>>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    scores: Vec<PersistedScore>,
}

type ScoreKey = (Option<String>, String);

/// File-backed pressure store
pub struct PressureStore {
    path: PathBuf,
    scores: RwLock<HashMap<ScoreKey, PersistedScore>>,
}

impl PressureStore {
    /// Open the store at `path`.
    ///
    /// A missing file yields an empty store. A file that fails to parse is
    /// logged and also treated as empty; the next `save` overwrites it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut scores = HashMap::new();

        match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<StoreDocument>(&text) {
                Ok(doc) => {
                    for score in doc.scores {
                        scores.insert((score.project.clone(), score.path.clone()), score);
                    }
                    log::debug!("Loaded {} pressure scores from {}", scores.len(), path.display());
                }
                Err(e) => {
                    log::warn!(
                        "Pressure store at {} is unreadable ({}). Starting empty.",
                        path.display(),
                        e
                    );
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        Ok(Self {
            path,
            scores: RwLock::new(scores),
        })
    }

    /// Path of the backing document
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Upsert scores for a project scope, stamping them with the current time.
    pub fn record_scores(&self, project: Option<&str>, files: &[ScoredFile]) {
        let now = Utc::now();
        let mut scores = self.scores.write();
        for file in files {
            let record = PersistedScore {
                path: file.path.clone(),
                project: project.map(str::to_string),
                raw_pressure: file.raw_pressure,
                temperature: file.temperature,
                updated_at: now,
            };
            scores.insert((record.project.clone(), record.path.clone()), record);
        }
    }

    /// Drop records not updated within `max_age`. Returns how many were removed.
    pub fn prune_older_than(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let mut scores = self.scores.write();
        let before = scores.len();
        scores.retain(|_, score| score.updated_at >= cutoff);
        let removed = before - scores.len();
        if removed > 0 {
            log::info!("Pruned {} stale pressure scores", removed);
        }
        removed
    }

    /// Number of records held
    pub fn len(&self) -> usize {
        self.scores.read().len()
    }

    /// Whether the store holds no records
    pub fn is_empty(&self) -> bool {
        self.scores.read().is_empty()
    }

    /// Write the store to disk via a sibling temp file and rename.
    pub fn save(&self) -> Result<()> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| MemoryError::invalid_path(self.path.display().to_string()))?;
        std::fs::create_dir_all(parent)?;

        let mut scores: Vec<PersistedScore> = self.scores.read().values().cloned().collect();
        scores.sort_by(|a, b| a.project.cmp(&b.project).then_with(|| a.path.cmp(&b.path)));

        let doc = StoreDocument {
            version: DOCUMENT_VERSION,
            scores,
        };
        let json = serde_json::to_string_pretty(&doc)?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl PersistedScoreReader for PressureStore {
    fn scores_by_temperature(
        &self,
        temperatures: &[Temperature],
        project: Option<&str>,
    ) -> Result<Vec<PersistedScore>> {
        let scores = self.scores.read();
        let mut matched: Vec<PersistedScore> = scores
            .values()
            .filter(|s| temperatures.contains(&s.temperature))
            .filter(|s| match project {
                Some(p) => s.project.as_deref() == Some(p),
                None => true,
            })
            .cloned()
            .collect();

        matched.sort_by(|a, b| {
            b.raw_pressure
                .total_cmp(&a.raw_pressure)
                .then_with(|| a.path.cmp(&b.path))
        });
        Ok(matched)
    }
}
