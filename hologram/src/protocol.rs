//! Sidecar Protocol Types
//!
//! One JSON object per line. A request is `{id, type, payload}`; the reply
//! echoes the id and adds `timing_ms`. Each connection carries exactly one
//! exchange.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::ProjectScanConfig;
use crate::error::{HologramError, HologramResult};

/// Prompt value asking the sidecar to refresh scores instead of answering.
pub const RESCORE_SENTINEL: &str = "__claudex_rescore__";

/// Fresh correlation id, unique per in-flight request.
pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Request kinds understood by the sidecar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestType {
    Query,
    Ping,
    Update,
    Shutdown,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Ping => "ping",
            Self::Update => "update",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Response kinds sent back by the sidecar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    Result,
    Pong,
    Error,
}

/// Outgoing request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: RequestType,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl Request {
    pub fn new(kind: RequestType, payload: Map<String, Value>) -> Self {
        Self {
            id: new_request_id(),
            kind,
            payload,
        }
    }

    pub fn ping() -> Self {
        Self::new(RequestType::Ping, Map::new())
    }

    pub fn shutdown() -> Self {
        Self::new(RequestType::Shutdown, Map::new())
    }

    /// `update` carrying the changed file paths
    pub fn update(files: &[String]) -> Self {
        let mut payload = Map::new();
        payload.insert("files".to_string(), Value::from(files.to_vec()));
        Self::new(RequestType::Update, payload)
    }

    pub fn query(payload: &QueryPayload) -> HologramResult<Self> {
        match serde_json::to_value(payload) {
            Ok(Value::Object(map)) => Ok(Self::new(RequestType::Query, map)),
            Ok(other) => Err(HologramError::protocol(format!(
                "query payload serialized to non-object: {other}"
            ))),
            Err(e) => Err(HologramError::protocol(format!(
                "failed to serialize query payload: {e}"
            ))),
        }
    }
}

/// Incoming response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ResponseType,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timing_ms: Option<f64>,
}

impl Response {
    pub fn result(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            kind: ResponseType::Result,
            payload,
            timing_ms: None,
        }
    }

    pub fn pong(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: ResponseType::Pong,
            payload: Value::Object(Map::new()),
            timing_ms: None,
        }
    }

    pub fn error(id: impl Into<String>, message: impl Into<String>) -> Self {
        let mut payload = Map::new();
        payload.insert("error_message".to_string(), Value::String(message.into()));
        Self {
            id: id.into(),
            kind: ResponseType::Error,
            payload: Value::Object(payload),
            timing_ms: None,
        }
    }

    /// Message carried by an `error` response, if any
    pub fn error_message(&self) -> Option<&str> {
        self.payload
            .get("error_message")
            .or_else(|| self.payload.get("error"))
            .and_then(Value::as_str)
    }
}

/// Payload of a `query` request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryPayload {
    pub prompt: String,
    pub turn: u64,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claude_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_config: Option<ProjectScanConfig>,
    /// Absent means "no boost"; never sent as an empty list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boost_files: Option<Vec<String>>,
}

/// One file entry in a `result` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireFile {
    #[serde(alias = "file")]
    pub path: String,
    #[serde(default)]
    pub raw_pressure: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pressure_bucket: Option<i64>,
}

/// Payload of a successful `query` result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultPayload {
    #[serde(default)]
    pub hot: Vec<WireFile>,
    #[serde(default)]
    pub warm: Vec<WireFile>,
    #[serde(default)]
    pub cold: Vec<WireFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn: Option<u64>,
}
