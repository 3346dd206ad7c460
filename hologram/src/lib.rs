//! Claudex Hologram Client Library
//!
//! Supervises the hologram scoring sidecar and talks to it over a
//! newline-delimited JSON protocol on localhost. Callers go through the
//! degradation cascade, which always produces a result: live scores when
//! the sidecar answers, persisted scores or plain recency when it does not.

pub mod cascade;
pub mod client;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod markers;
pub mod persist;
pub mod process;
pub mod protocol;
pub mod sidecar;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use cascade::{
    query_with_fallback, rescore_with_fallback, FallbackInputs, RescoreOutcome, RescoreSource,
    ScoreSource, ScoringResult,
};
pub use client::{QueryRequest, ScoredTiers, ScoringClient, ScoringService};
pub use config::HologramConfig;
pub use error::{HologramError, HologramResult};
pub use lifecycle::{Identity, LifecycleManager, StopOutcome};
pub use markers::MarkerFiles;
pub use persist::persist_live_scores;
