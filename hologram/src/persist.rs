//! Writing live results back to the pressure store.

use chrono::Duration;
use claudex_memory::error::Result;
use claudex_memory::{PressureStore, ScoredFile};

use crate::cascade::{ScoreSource, ScoringResult};

/// Record a live result under `scope`, prune stale records, then save.
///
/// Fallback results are never written back. Returns whether anything was
/// persisted.
pub fn persist_live_scores(
    store: &PressureStore,
    scope: Option<&str>,
    result: &ScoringResult,
    max_age: Duration,
) -> Result<bool> {
    if result.source != ScoreSource::Live {
        return Ok(false);
    }

    let files: Vec<ScoredFile> = result
        .hot
        .iter()
        .chain(&result.warm)
        .chain(&result.cold)
        .cloned()
        .collect();
    store.record_scores(scope, &files);

    let pruned = store.prune_older_than(max_age);
    tracing::debug!(recorded = files.len(), pruned, "Persisting live scores");
    store.save()?;
    Ok(true)
}
