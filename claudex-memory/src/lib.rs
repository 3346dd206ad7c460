//! Claudex Memory Layer
//!
//! Pressure model and persisted attention scores for Claudex.
//!
//! ## Features
//!
//! - **Pressure buckets** - Integer-scaled attention scores with a single,
//!   total HOT/WARM/COLD classification
//! - **Persisted scores** - The last known per-file pressure, kept on disk so
//!   callers still get useful context when the scoring sidecar is gone
//!
//! ## Example
//!
//! ```ignore
//! use claudex_memory::{PersistedScoreReader, PressureStore, ScoredFile, Temperature};
//!
//! let store = PressureStore::open(&db_dir.join("pressure.json"))?;
//! store.record_scores(Some("my-project"), &[ScoredFile::from_pressure("src/lib.rs", 0.9)]);
//! store.save()?;
//!
//! let hot = store.scores_by_temperature(&[Temperature::Hot], Some("my-project"))?;
//! ```

pub mod error;
pub mod pressure;
pub mod store;

// Re-exports for convenience
pub use error::MemoryError;
pub use pressure::{
    bucket_for_pressure, bucket_in_tier, classify, ScoredFile, Temperature, HOT_THRESHOLD,
    MAX_BUCKET, NEUTRAL_BUCKET, NEUTRAL_PRESSURE, WARM_THRESHOLD,
};
pub use store::{PersistedScore, PersistedScoreReader, PressureStore};
