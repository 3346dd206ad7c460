//! Scoring client: the typed front door to the sidecar.
//!
//! `query` lazily starts the sidecar and fails loudly with a typed error;
//! the degradation cascade is the layer that turns those errors into
//! fallback results. `ping`, `notify_file_changes` and `shutdown` never
//! start anything and never fail.

use claudex_memory::{bucket_for_pressure, ScoredFile, Temperature, MAX_BUCKET};
use serde::Serialize;
use std::path::PathBuf;

use crate::config::{HologramConfig, ProjectScanConfig};
use crate::error::{HologramError, HologramResult};
use crate::lifecycle::LifecycleManager;
use crate::protocol::{
    QueryPayload, Request, Response, ResponseType, ResultPayload, WireFile, RESCORE_SENTINEL,
};
use crate::transport::{localhost, send};

/// Arguments of a scoring query.
#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub prompt: String,
    pub turn: u64,
    pub session_id: String,
    pub project_dir: Option<PathBuf>,
    /// Overrides the configured scan settings when `project_dir` is set
    pub project_config: Option<ProjectScanConfig>,
    pub boost_files: Vec<String>,
}

impl QueryRequest {
    pub fn new(prompt: impl Into<String>, turn: u64, session_id: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            turn,
            session_id: session_id.into(),
            ..Default::default()
        }
    }

    pub fn with_project_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.project_dir = Some(dir.into());
        self
    }

    pub fn with_boost_files(mut self, files: Vec<String>) -> Self {
        self.boost_files = files;
        self
    }
}

/// A live result, classified locally.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScoredTiers {
    pub hot: Vec<ScoredFile>,
    pub warm: Vec<ScoredFile>,
    pub cold: Vec<ScoredFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn: Option<u64>,
}

impl ScoredTiers {
    pub fn files(&self) -> impl Iterator<Item = &ScoredFile> {
        self.hot.iter().chain(self.warm.iter()).chain(self.cold.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.hot.is_empty() && self.warm.is_empty() && self.cold.is_empty()
    }
}

/// What the degradation cascade needs from a scoring backend.
#[allow(async_fn_in_trait)]
pub trait ScoringService {
    async fn query(&self, request: &QueryRequest) -> HologramResult<ScoredTiers>;

    /// Whether the remote accepted a rescore.
    async fn request_rescore(&self, session_id: &str) -> bool;

    /// Cheap marker-based liveness signal. No network probe.
    fn is_addressable(&self) -> bool;
}

pub struct ScoringClient {
    lifecycle: LifecycleManager,
    config: HologramConfig,
}

impl ScoringClient {
    pub fn new(config: HologramConfig) -> Self {
        Self {
            lifecycle: LifecycleManager::new(&config),
            config,
        }
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn config(&self) -> &HologramConfig {
        &self.config
    }

    /// Score `request`, starting the sidecar if needed.
    pub async fn query(&self, request: &QueryRequest) -> HologramResult<ScoredTiers> {
        let port = self.ensure_started().await?;
        let outgoing = Request::query(&self.build_payload(request))?;

        tracing::debug!(
            port,
            request_id = %outgoing.id,
            turn = request.turn,
            boost = request.boost_files.len(),
            "Sending query"
        );
        let response = send(localhost(port), &outgoing, self.config.timeouts.request()).await?;
        tiers_from_response(response)
    }

    /// Whether an addressable sidecar answers `pong`.
    pub async fn ping(&self) -> bool {
        let Some(port) = self.lifecycle.get_port() else {
            return false;
        };
        match send(localhost(port), &Request::ping(), self.config.timeouts.request()).await {
            Ok(response) => response.kind == ResponseType::Pong,
            Err(e) => {
                tracing::debug!(port, error = %e, "Ping failed");
                false
            }
        }
    }

    /// Tell the sidecar which files changed. Best effort.
    pub async fn notify_file_changes(&self, files: &[String]) {
        if files.is_empty() {
            return;
        }
        let Some(port) = self.lifecycle.get_port() else {
            tracing::debug!(files = files.len(), "No sidecar running, skipping update");
            return;
        };
        let request = Request::update(files);
        if let Err(e) = send(localhost(port), &request, self.config.timeouts.request()).await {
            tracing::warn!(port, error = %e, "Failed to notify sidecar of file changes");
        }
    }

    /// Ask the sidecar to refresh scores for `session_id`.
    pub async fn request_rescore(&self, session_id: &str) -> bool {
        let port = match self.ensure_started().await {
            Ok(port) => port,
            Err(e) => {
                tracing::debug!(error = %e, "Rescore skipped, sidecar unavailable");
                return false;
            }
        };

        let payload = QueryPayload {
            prompt: RESCORE_SENTINEL.to_string(),
            session_id: session_id.to_string(),
            claude_dir: self.config.claude_dir.clone(),
            ..Default::default()
        };
        let request = match Request::query(&payload) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to build rescore request");
                return false;
            }
        };

        match send(localhost(port), &request, self.config.timeouts.request()).await {
            Ok(response) if response.kind == ResponseType::Error => {
                tracing::warn!(
                    error = response.error_message().unwrap_or("unknown"),
                    "Sidecar rejected rescore"
                );
                false
            }
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Rescore request failed");
                false
            }
        }
    }

    /// Ask an addressable sidecar to exit. Returns whether it acknowledged.
    pub async fn shutdown(&self) -> bool {
        let Some(port) = self.lifecycle.get_port() else {
            return false;
        };
        match send(localhost(port), &Request::shutdown(), self.config.timeouts.request()).await {
            Ok(response) => response.kind == ResponseType::Result,
            Err(e) => {
                tracing::warn!(port, error = %e, "Shutdown request failed");
                false
            }
        }
    }

    /// Lazy start raced against the startup budget.
    async fn ensure_started(&self) -> HologramResult<u16> {
        let budget = self.config.timeouts.startup();
        match tokio::time::timeout(budget, self.lifecycle.start()).await {
            Ok(result) => result,
            Err(_) => {
                // The abandoned start may have left a spawned child behind
                if let Some(pid) = self.lifecycle.abort_spawn().await {
                    tracing::warn!(pid, "Sidecar startup abandoned");
                }
                Err(HologramError::unavailable(format!(
                    "sidecar did not become ready within {}ms",
                    budget.as_millis()
                )))
            }
        }
    }

    fn build_payload(&self, request: &QueryRequest) -> QueryPayload {
        let project_config = request.project_dir.as_ref().map(|_| {
            request
                .project_config
                .clone()
                .unwrap_or_else(|| self.config.project.clone())
        });

        QueryPayload {
            prompt: request.prompt.clone(),
            turn: request.turn,
            session_id: request.session_id.clone(),
            claude_dir: self.config.claude_dir.clone(),
            project_dir: request
                .project_dir
                .as_ref()
                .map(|dir| dir.display().to_string()),
            project_config,
            boost_files: (!request.boost_files.is_empty()).then(|| request.boost_files.clone()),
        }
    }
}

impl ScoringService for ScoringClient {
    async fn query(&self, request: &QueryRequest) -> HologramResult<ScoredTiers> {
        ScoringClient::query(self, request).await
    }

    async fn request_rescore(&self, session_id: &str) -> bool {
        ScoringClient::request_rescore(self, session_id).await
    }

    fn is_addressable(&self) -> bool {
        self.lifecycle.is_running()
    }
}

fn tiers_from_response(response: Response) -> HologramResult<ScoredTiers> {
    match response.kind {
        ResponseType::Error => Err(HologramError::Remote(
            response
                .error_message()
                .unwrap_or("sidecar returned an error without a message")
                .to_string(),
        )),
        ResponseType::Pong => Err(HologramError::protocol("expected result, got pong")),
        ResponseType::Result => {
            let payload: ResultPayload = serde_json::from_value(response.payload)
                .map_err(|e| HologramError::protocol(format!("malformed result payload: {e}")))?;
            Ok(classify_tiers(payload))
        }
    }
}

/// Re-bucket every entry locally, ignoring which list the sidecar used.
fn classify_tiers(payload: ResultPayload) -> ScoredTiers {
    let mut tiers = ScoredTiers {
        turn: payload.turn,
        ..Default::default()
    };

    for wire in payload.hot.into_iter().chain(payload.warm).chain(payload.cold) {
        let file = scored_from_wire(wire);
        match file.temperature {
            Temperature::Hot => tiers.hot.push(file),
            Temperature::Warm => tiers.warm.push(file),
            Temperature::Cold => tiers.cold.push(file),
        }
    }
    tiers
}

fn scored_from_wire(wire: WireFile) -> ScoredFile {
    let bucket = match wire.pressure_bucket {
        Some(bucket) => bucket.clamp(0, i64::from(MAX_BUCKET)) as u32,
        None => bucket_for_pressure(wire.raw_pressure),
    };
    ScoredFile::new(wire.path, wire.raw_pressure, bucket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markers::MarkerFiles;
    use crate::sidecar::{QueryContext, QueryHandler, ShutdownHandle};
    use crate::test_support::{spawn_sidecar, StubHandler};
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    /// Config whose markers point at an in-process sidecar on `port`.
    ///
    /// The PID marker names the test process itself so it reads as alive.
    /// Nothing here may call `stop()`.
    fn attached_config(dir: &TempDir, port: u16) -> HologramConfig {
        let mut config = HologramConfig::with_data_dir(dir.path());
        config.sidecar.path = dir.path().join("missing-sidecar");
        config.sidecar.interpreter = None;
        config.timeouts.request_ms = 1000;
        let markers = MarkerFiles::from_config(&config);
        markers.write_pid(std::process::id()).unwrap();
        markers.write_port(port).unwrap();
        config
    }

    async fn attached_client<H: QueryHandler>(handler: H) -> (TempDir, ScoringClient, ShutdownHandle) {
        let dir = TempDir::new().unwrap();
        let (port, shutdown) = spawn_sidecar(handler).await;
        let client = ScoringClient::new(attached_config(&dir, port));
        (dir, client, shutdown)
    }

    fn detached_client(dir: &TempDir) -> ScoringClient {
        let mut config = HologramConfig::with_data_dir(dir.path());
        config.sidecar.path = dir.path().join("missing-sidecar");
        config.sidecar.interpreter = None;
        ScoringClient::new(config)
    }

    #[derive(Clone, Default)]
    struct RecordingHandler {
        seen: Arc<Mutex<Vec<QueryPayload>>>,
    }

    impl QueryHandler for RecordingHandler {
        fn handle_query(&self, query: &QueryContext) -> Result<Value, String> {
            self.seen.lock().unwrap().push(query.payload.clone());
            Ok(json!({"hot": [], "warm": [], "cold": [], "turn": query.payload.turn}))
        }
    }

    #[tokio::test]
    async fn test_query_reclassifies_locally() {
        let handler = StubHandler::new(json!({
            "hot": [
                {"path": "a.py", "raw_pressure": 0.9, "pressure_bucket": 45},
                {"path": "b.py", "raw_pressure": 0.2, "pressure_bucket": 10}
            ],
            "warm": [{"path": "c.py", "raw_pressure": 0.5}],
            "cold": [{"path": "d.py", "raw_pressure": 0.95, "pressure_bucket": 99}],
            "turn": 7
        }));
        let (_dir, client, _shutdown) = attached_client(handler).await;

        let tiers = client.query(&QueryRequest::new("fix it", 7, "s-1")).await.unwrap();
        fn paths(files: &[ScoredFile]) -> Vec<String> {
            files.iter().map(|f| f.path.clone()).collect()
        }
        assert_eq!(paths(&tiers.hot), vec!["a.py", "d.py"]);
        assert_eq!(paths(&tiers.warm), vec!["c.py"]);
        assert_eq!(paths(&tiers.cold), vec!["b.py"]);
        assert_eq!(tiers.warm[0].pressure_bucket, 25);
        assert_eq!(tiers.hot[1].pressure_bucket, MAX_BUCKET);
        assert!(tiers.files().all(|f| f.temperature == claudex_memory::classify(f.pressure_bucket)));
        assert_eq!(tiers.turn, Some(7));
    }

    #[tokio::test]
    async fn test_query_remote_error() {
        let (_dir, client, _shutdown) = attached_client(StubHandler::failing("session exploded")).await;
        let err = client.query(&QueryRequest::new("p", 1, "s")).await.unwrap_err();
        match err {
            HologramError::Remote(msg) => assert_eq!(msg, "session exploded"),
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_query_sends_payload_fields() {
        let handler = RecordingHandler::default();
        let seen = Arc::clone(&handler.seen);
        let (dir, client, _shutdown) = attached_client(handler).await;

        let request = QueryRequest::new("refactor", 3, "sess")
            .with_project_dir(dir.path())
            .with_boost_files(vec!["src/lib.rs".to_string()]);
        client.query(&request).await.unwrap();
        client.query(&QueryRequest::new("plain", 4, "sess")).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].prompt, "refactor");
        assert_eq!(seen[0].turn, 3);
        assert_eq!(seen[0].boost_files, Some(vec!["src/lib.rs".to_string()]));
        assert_eq!(seen[0].project_config, Some(ProjectScanConfig::default()));
        assert_eq!(seen[1].boost_files, None);
        assert_eq!(seen[1].project_dir, None);
        assert_eq!(seen[1].project_config, None);
    }

    #[tokio::test]
    async fn test_query_without_sidecar_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let client = detached_client(&dir);
        let err = client.query(&QueryRequest::new("p", 1, "s")).await.unwrap_err();
        assert!(err.is_unavailable(), "got {err:?}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_query_startup_timeout_leaves_no_sidecar() {
        let dir = TempDir::new().unwrap();
        let pid_file = dir.path().join("spawned.pid");
        let script = dir.path().join("sidecar.sh");
        std::fs::write(&script, format!("echo $$ > '{}'\nexec sleep 30\n", pid_file.display())).unwrap();

        let mut config = HologramConfig::with_data_dir(dir.path().join("db"));
        config.sidecar.path = script;
        config.sidecar.interpreter = Some("/bin/sh".to_string());
        config.timeouts.startup_ms = 300;
        config.timeouts.poll_interval_ms = 20;
        let client = ScoringClient::new(config);

        let err = client.query(&QueryRequest::new("p", 1, "s")).await.unwrap_err();
        assert!(err.is_unavailable(), "got {err:?}");
        assert_eq!(client.lifecycle().markers().read_pid(), None);
        assert_eq!(client.lifecycle().markers().read_port(), None);

        let spawned: u32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        assert!(!crate::process::is_alive(spawned));
    }

    #[tokio::test]
    async fn test_ping() {
        let (_dir, client, _shutdown) = attached_client(StubHandler::empty()).await;
        assert!(client.ping().await);

        let dir = TempDir::new().unwrap();
        let detached = detached_client(&dir);
        assert!(!detached.ping().await);
        assert!(!detached.lifecycle().markers().pid_path().exists());
    }

    #[tokio::test]
    async fn test_notify_file_changes() {
        let (_dir, client, _shutdown) = attached_client(StubHandler::empty()).await;
        client.notify_file_changes(&["a.ts".to_string()]).await;
        client.notify_file_changes(&[]).await;

        let dir = TempDir::new().unwrap();
        detached_client(&dir)
            .notify_file_changes(&["a.ts".to_string()])
            .await;
    }

    #[tokio::test]
    async fn test_request_rescore_sends_sentinel() {
        let handler = RecordingHandler::default();
        let seen = Arc::clone(&handler.seen);
        let (_dir, client, _shutdown) = attached_client(handler).await;

        assert!(client.request_rescore("sess-9").await);
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].prompt, RESCORE_SENTINEL);
        assert_eq!(seen[0].session_id, "sess-9");
    }

    #[tokio::test]
    async fn test_request_rescore_rejected() {
        let (_dir, client, _shutdown) = attached_client(StubHandler::failing("no session")).await;
        assert!(!client.request_rescore("s").await);

        let dir = TempDir::new().unwrap();
        assert!(!detached_client(&dir).request_rescore("s").await);
    }

    #[tokio::test]
    async fn test_shutdown_request() {
        let (_dir, client, _shutdown) = attached_client(StubHandler::empty()).await;
        assert!(client.shutdown().await);
    }

    #[test]
    fn test_pong_is_not_a_result() {
        let err = tiers_from_response(Response::pong("x")).unwrap_err();
        assert!(matches!(err, HologramError::Protocol(_)));
    }

    #[test]
    fn test_negative_bucket_clamps_to_cold() {
        let file = scored_from_wire(WireFile {
            path: "x".to_string(),
            raw_pressure: 0.9,
            pressure_bucket: Some(-4),
        });
        assert_eq!(file.pressure_bucket, 0);
        assert_eq!(file.temperature, Temperature::Cold);
    }
}
