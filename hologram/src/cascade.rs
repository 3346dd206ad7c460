//! Degradation cascade: live scores, then persisted scores, then recency.
//!
//! The functions here return plain values. Every failure below them ends in
//! a valid result whose `source` names the tier that produced it.

use claudex_memory::{
    bucket_for_pressure, bucket_in_tier, PersistedScoreReader, ScoredFile, Temperature,
};
use serde::Serialize;

use crate::client::{QueryRequest, ScoringService, ScoredTiers};

/// Which tier produced a [`ScoringResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreSource {
    Live,
    Persisted,
    Recency,
}

impl ScoreSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Persisted => "persisted",
            Self::Recency => "recency",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoringResult {
    pub hot: Vec<ScoredFile>,
    pub warm: Vec<ScoredFile>,
    pub cold: Vec<ScoredFile>,
    pub source: ScoreSource,
}

impl ScoringResult {
    fn live(tiers: ScoredTiers) -> Self {
        Self {
            hot: tiers.hot,
            warm: tiers.warm,
            cold: tiers.cold,
            source: ScoreSource::Live,
        }
    }

    /// WARM-only result giving every recent file the neutral score.
    fn recency(recent_files: &[String]) -> Self {
        Self {
            hot: Vec::new(),
            warm: recent_files.iter().map(ScoredFile::neutral).collect(),
            cold: Vec::new(),
            source: ScoreSource::Recency,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RescoreSource {
    Live,
    Persisted,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RescoreOutcome {
    pub source: RescoreSource,
}

/// Everything the fallback tiers draw on.
#[derive(Clone, Copy, Default)]
pub struct FallbackInputs<'a> {
    /// Most recent first, as supplied by the caller
    pub recent_files: &'a [String],
    pub reader: Option<&'a dyn PersistedScoreReader>,
    pub project_scope: Option<&'a str>,
}

/// Score `request`, degrading through the tiers until one produces data.
pub async fn query_with_fallback<S: ScoringService>(
    service: &S,
    request: &QueryRequest,
    fallback: FallbackInputs<'_>,
) -> ScoringResult {
    match service.query(request).await {
        Ok(tiers) => return ScoringResult::live(tiers),
        Err(e) => tracing::debug!(error = %e, "Live query failed"),
    }

    if service.is_addressable() {
        match service.query(request).await {
            Ok(tiers) => return ScoringResult::live(tiers),
            Err(e) => tracing::info!(error = %e, "Live query failed after retry"),
        }
    } else {
        tracing::debug!("Sidecar not addressable, skipping retry");
    }

    if let Some(result) = persisted_result(fallback.reader, fallback.project_scope) {
        return result;
    }

    tracing::debug!(files = fallback.recent_files.len(), "Falling back to recency");
    ScoringResult::recency(fallback.recent_files)
}

/// Ask for a rescore; report where fresh-enough scores can come from.
pub async fn rescore_with_fallback<S: ScoringService>(
    service: &S,
    session_id: &str,
    reader: Option<&dyn PersistedScoreReader>,
    project_scope: Option<&str>,
) -> RescoreOutcome {
    if service.request_rescore(session_id).await
        || (service.is_addressable() && service.request_rescore(session_id).await)
    {
        return RescoreOutcome {
            source: RescoreSource::Live,
        };
    }

    let has_hot = reader.is_some_and(|reader| {
        match reader.scores_by_temperature(&[Temperature::Hot], project_scope) {
            Ok(scores) => !scores.is_empty(),
            Err(e) => {
                tracing::warn!(error = %e, "Persisted score lookup failed");
                false
            }
        }
    });

    RescoreOutcome {
        source: if has_hot {
            RescoreSource::Persisted
        } else {
            RescoreSource::None
        },
    }
}

/// HOT and WARM scores from the store, placed by their stored tag.
fn persisted_result(
    reader: Option<&dyn PersistedScoreReader>,
    project_scope: Option<&str>,
) -> Option<ScoringResult> {
    let reader = reader?;
    let tiers = [Temperature::Hot, Temperature::Warm];
    let scores = match reader.scores_by_temperature(&tiers, project_scope) {
        Ok(scores) => scores,
        Err(e) => {
            tracing::warn!(error = %e, "Persisted score lookup failed");
            return None;
        }
    };

    let mut hot = Vec::new();
    let mut warm = Vec::new();
    for score in scores {
        // The stored tag decides the tier; the bucket is re-derived within it
        let bucket = bucket_in_tier(bucket_for_pressure(score.raw_pressure), score.temperature);
        let file = ScoredFile::new(score.path, score.raw_pressure, bucket);
        match score.temperature {
            Temperature::Hot => hot.push(file),
            Temperature::Warm => warm.push(file),
            Temperature::Cold => {}
        }
    }

    if hot.is_empty() && warm.is_empty() {
        return None;
    }
    tracing::debug!(hot = hot.len(), warm = warm.len(), "Using persisted scores");
    Some(ScoringResult {
        hot,
        warm,
        cold: Vec::new(),
        source: ScoreSource::Persisted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{HologramError, HologramResult};
    use chrono::Utc;
    use claudex_memory::{MemoryError, PersistedScore, NEUTRAL_BUCKET, NEUTRAL_PRESSURE};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted scoring service: replays queued outcomes, then fails.
    struct MockService {
        queries: Mutex<VecDeque<HologramResult<ScoredTiers>>>,
        rescores: Mutex<VecDeque<bool>>,
        addressable: bool,
        query_calls: AtomicUsize,
        rescore_calls: AtomicUsize,
    }

    impl MockService {
        fn new(addressable: bool) -> Self {
            Self {
                queries: Mutex::new(VecDeque::new()),
                rescores: Mutex::new(VecDeque::new()),
                addressable,
                query_calls: AtomicUsize::new(0),
                rescore_calls: AtomicUsize::new(0),
            }
        }

        fn then_query(self, outcome: HologramResult<ScoredTiers>) -> Self {
            self.queries.lock().unwrap().push_back(outcome);
            self
        }

        fn then_rescore(self, accepted: bool) -> Self {
            self.rescores.lock().unwrap().push_back(accepted);
            self
        }

        fn query_calls(&self) -> usize {
            self.query_calls.load(Ordering::SeqCst)
        }
    }

    impl ScoringService for MockService {
        async fn query(&self, _request: &QueryRequest) -> HologramResult<ScoredTiers> {
            self.query_calls.fetch_add(1, Ordering::SeqCst);
            self.queries
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(HologramError::unavailable("mock exhausted")))
        }

        async fn request_rescore(&self, _session_id: &str) -> bool {
            self.rescore_calls.fetch_add(1, Ordering::SeqCst);
            self.rescores.lock().unwrap().pop_front().unwrap_or(false)
        }

        fn is_addressable(&self) -> bool {
            self.addressable
        }
    }

    struct MockReader {
        scores: Vec<PersistedScore>,
    }

    impl MockReader {
        fn with(entries: &[(&str, Option<&str>, f64)]) -> Self {
            let scores = entries
                .iter()
                .map(|(path, project, pressure)| {
                    let file = ScoredFile::from_pressure(*path, *pressure);
                    PersistedScore {
                        path: file.path,
                        project: project.map(str::to_string),
                        raw_pressure: *pressure,
                        temperature: file.temperature,
                        updated_at: Utc::now(),
                    }
                })
                .collect();
            Self { scores }
        }
    }

    impl PersistedScoreReader for MockReader {
        fn scores_by_temperature(
            &self,
            temperatures: &[Temperature],
            project: Option<&str>,
        ) -> claudex_memory::error::Result<Vec<PersistedScore>> {
            Ok(self
                .scores
                .iter()
                .filter(|s| temperatures.contains(&s.temperature))
                .filter(|s| project.is_none() || s.project.as_deref() == project)
                .cloned()
                .collect())
        }
    }

    /// Reader returning records exactly as tagged, whatever their pressure.
    struct TaggedReader {
        scores: Vec<PersistedScore>,
    }

    impl TaggedReader {
        fn with(entries: &[(&str, f64, Temperature)]) -> Self {
            let scores = entries
                .iter()
                .map(|(path, pressure, temperature)| PersistedScore {
                    path: path.to_string(),
                    project: None,
                    raw_pressure: *pressure,
                    temperature: *temperature,
                    updated_at: Utc::now(),
                })
                .collect();
            Self { scores }
        }
    }

    impl PersistedScoreReader for TaggedReader {
        fn scores_by_temperature(
            &self,
            temperatures: &[Temperature],
            _project: Option<&str>,
        ) -> claudex_memory::error::Result<Vec<PersistedScore>> {
            Ok(self
                .scores
                .iter()
                .filter(|s| temperatures.contains(&s.temperature))
                .cloned()
                .collect())
        }
    }

    struct BrokenReader;

    impl PersistedScoreReader for BrokenReader {
        fn scores_by_temperature(
            &self,
            _temperatures: &[Temperature],
            _project: Option<&str>,
        ) -> claudex_memory::error::Result<Vec<PersistedScore>> {
            Err(MemoryError::other("store offline"))
        }
    }

    fn live_tiers() -> ScoredTiers {
        ScoredTiers {
            hot: vec![ScoredFile::new("src/main.rs", 0.9, 45)],
            ..Default::default()
        }
    }

    fn request() -> QueryRequest {
        QueryRequest::new("what next", 2, "session-1")
    }

    fn recent() -> Vec<String> {
        vec!["a.ts".to_string(), "b.ts".to_string()]
    }

    #[tokio::test]
    async fn test_first_attempt_success_is_live() {
        let service = MockService::new(true).then_query(Ok(live_tiers()));
        let result = query_with_fallback(&service, &request(), FallbackInputs::default()).await;
        assert_eq!(result.source, ScoreSource::Live);
        assert_eq!(result.hot[0].path, "src/main.rs");
        assert_eq!(service.query_calls(), 1);
    }

    #[tokio::test]
    async fn test_retry_success_is_live() {
        let service = MockService::new(true)
            .then_query(Err(HologramError::Timeout { timeout_ms: 3000 }))
            .then_query(Ok(live_tiers()));
        let result = query_with_fallback(&service, &request(), FallbackInputs::default()).await;
        assert_eq!(result.source, ScoreSource::Live);
        assert_eq!(service.query_calls(), 2);
    }

    #[tokio::test]
    async fn test_no_retry_when_not_addressable() {
        let service = MockService::new(false)
            .then_query(Err(HologramError::unavailable("refused")))
            .then_query(Ok(live_tiers()));
        let files = recent();
        let inputs = FallbackInputs {
            recent_files: &files,
            ..Default::default()
        };

        let result = query_with_fallback(&service, &request(), inputs).await;
        assert_eq!(result.source, ScoreSource::Recency);
        assert_eq!(service.query_calls(), 1);
    }

    #[tokio::test]
    async fn test_persisted_fallback() {
        let service = MockService::new(true);
        let reader = MockReader::with(&[
            ("hot.rs", Some("proj"), 0.92),
            ("warm.rs", Some("proj"), 0.5),
            ("cold.rs", Some("proj"), 0.1),
            ("elsewhere.rs", Some("other"), 0.99),
        ]);
        let files = recent();
        let inputs = FallbackInputs {
            recent_files: &files,
            reader: Some(&reader),
            project_scope: Some("proj"),
        };

        let result = query_with_fallback(&service, &request(), inputs).await;
        assert_eq!(result.source, ScoreSource::Persisted);
        assert_eq!(result.hot.len(), 1);
        assert_eq!(result.hot[0].path, "hot.rs");
        assert_eq!(result.hot[0].pressure_bucket, 46);
        assert_eq!(result.warm[0].path, "warm.rs");
        assert!(result.cold.is_empty());
        assert_eq!(service.query_calls(), 2);
    }

    #[tokio::test]
    async fn test_persisted_fallback_trusts_stored_tag() {
        let service = MockService::new(false);
        let files = recent();

        for pressure in [0.6, 0.3] {
            let reader = TaggedReader::with(&[
                ("hot.rs", pressure, Temperature::Hot),
                ("warm.rs", 0.95, Temperature::Warm),
            ]);
            let inputs = FallbackInputs {
                recent_files: &files,
                reader: Some(&reader),
                project_scope: None,
            };

            let result = query_with_fallback(&service, &request(), inputs).await;
            assert_eq!(result.source, ScoreSource::Persisted);
            assert_eq!(result.hot.len(), 1);
            assert_eq!(result.hot[0].path, "hot.rs");
            assert_eq!(result.hot[0].temperature, Temperature::Hot);
            assert_eq!(result.hot[0].raw_pressure, pressure);
            assert_eq!(result.hot[0].pressure_bucket, 40);
            assert_eq!(result.warm[0].path, "warm.rs");
            assert_eq!(result.warm[0].temperature, Temperature::Warm);
            assert_eq!(result.warm[0].pressure_bucket, 39);
            assert!(result.cold.is_empty());
        }
    }

    #[tokio::test]
    async fn test_recency_fallback() {
        let service = MockService::new(true);
        let reader = MockReader::with(&[]);
        let files = recent();
        let inputs = FallbackInputs {
            recent_files: &files,
            reader: Some(&reader),
            project_scope: None,
        };

        let result = query_with_fallback(&service, &request(), inputs).await;
        assert_eq!(result.source, ScoreSource::Recency);
        assert!(result.hot.is_empty());
        assert!(result.cold.is_empty());
        let paths: Vec<_> = result.warm.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["a.ts", "b.ts"]);
        for file in &result.warm {
            assert_eq!(file.raw_pressure, NEUTRAL_PRESSURE);
            assert_eq!(file.pressure_bucket, NEUTRAL_BUCKET);
            assert_eq!(file.temperature, Temperature::Warm);
        }
    }

    #[tokio::test]
    async fn test_broken_reader_falls_through_to_recency() {
        let service = MockService::new(false);
        let files = recent();
        let inputs = FallbackInputs {
            recent_files: &files,
            reader: Some(&BrokenReader),
            project_scope: None,
        };
        let result = query_with_fallback(&service, &request(), inputs).await;
        assert_eq!(result.source, ScoreSource::Recency);
        assert_eq!(result.warm.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_recency_is_valid() {
        let service = MockService::new(false);
        let result = query_with_fallback(&service, &request(), FallbackInputs::default()).await;
        assert_eq!(result.source, ScoreSource::Recency);
        assert!(result.hot.is_empty() && result.warm.is_empty() && result.cold.is_empty());
    }

    #[test]
    fn test_result_serializes_source() {
        let result = ScoringResult::recency(&["x.md".to_string()]);
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["source"], "recency");
        assert_eq!(value["warm"][0]["temperature"], "WARM");
    }

    #[tokio::test]
    async fn test_rescore_live() {
        let service = MockService::new(true).then_rescore(true);
        let outcome = rescore_with_fallback(&service, "s", None, None).await;
        assert_eq!(outcome.source, RescoreSource::Live);
    }

    #[tokio::test]
    async fn test_rescore_retries_when_addressable() {
        let service = MockService::new(true).then_rescore(false).then_rescore(true);
        let outcome = rescore_with_fallback(&service, "s", None, None).await;
        assert_eq!(outcome.source, RescoreSource::Live);
        assert_eq!(service.rescore_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rescore_persisted_needs_hot() {
        let service = MockService::new(false);
        let hot = MockReader::with(&[("hot.rs", None, 0.9)]);
        let outcome = rescore_with_fallback(&service, "s", Some(&hot), None).await;
        assert_eq!(outcome.source, RescoreSource::Persisted);

        let warm_only = MockReader::with(&[("warm.rs", None, 0.5)]);
        let outcome = rescore_with_fallback(&service, "s", Some(&warm_only), None).await;
        assert_eq!(outcome.source, RescoreSource::None);

        let outcome = rescore_with_fallback(&service, "s", None, None).await;
        assert_eq!(outcome.source, RescoreSource::None);
        assert_eq!(
            serde_json::to_value(outcome).unwrap(),
            serde_json::json!({"source": "none"})
        );
    }
}
