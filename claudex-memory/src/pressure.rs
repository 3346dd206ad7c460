//! Pressure buckets and temperature classification
//!
//! Pressure is a per-file attention score in `[0, 1]`. The sidecar and the
//! persisted store both carry it alongside an integer bucket; temperature is
//! always derived from the bucket and never stored on its own.

use serde::{Deserialize, Serialize};

/// Lowest bucket classified as HOT
pub const HOT_THRESHOLD: u32 = 40;

/// Lowest bucket classified as WARM
pub const WARM_THRESHOLD: u32 = 20;

/// Bucket for a pressure of exactly 1.0
///
/// The sidecar pairs pressure 0.45 with bucket 22 when bootstrapping new
/// files and 0.6 with bucket 30 when boosting them; both are `floor(p * 50)`.
pub const MAX_BUCKET: u32 = 50;

/// Pressure given to files that only have recency to go on
pub const NEUTRAL_PRESSURE: f64 = 0.5;

/// Bucket given to files that only have recency to go on (WARM)
pub const NEUTRAL_BUCKET: u32 = 25;

/// Discretized attention tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Temperature {
    Hot,
    Warm,
    Cold,
}

impl Temperature {
    /// Upper-case tag used on disk and in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hot => "HOT",
            Self::Warm => "WARM",
            Self::Cold => "COLD",
        }
    }
}

impl std::fmt::Display for Temperature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Temperature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "HOT" => Ok(Self::Hot),
            "WARM" => Ok(Self::Warm),
            "COLD" => Ok(Self::Cold),
            other => Err(format!("unknown temperature: {other}")),
        }
    }
}

/// Classify a pressure bucket.
///
/// Total over every `u32`: `[0, 20)` is COLD, `[20, 40)` is WARM and
/// everything from 40 up is HOT.
pub fn classify(bucket: u32) -> Temperature {
    if bucket >= HOT_THRESHOLD {
        Temperature::Hot
    } else if bucket >= WARM_THRESHOLD {
        Temperature::Warm
    } else {
        Temperature::Cold
    }
}

/// Re-derive a bucket from a raw pressure value.
///
/// Pressure is clamped to `[0, 1]` and scaled onto `[0, MAX_BUCKET]`,
/// rounding down. NaN maps to bucket 0.
pub fn bucket_for_pressure(pressure: f64) -> u32 {
    if pressure.is_nan() {
        return 0;
    }
    (pressure.clamp(0.0, 1.0) * MAX_BUCKET as f64).floor() as u32
}

/// Clamp `bucket` into the range `temperature` covers.
///
/// Used when a tier is known from elsewhere (a stored tag) and the bucket
/// has to agree with it.
pub fn bucket_in_tier(bucket: u32, temperature: Temperature) -> u32 {
    match temperature {
        Temperature::Hot => bucket.max(HOT_THRESHOLD),
        Temperature::Warm => bucket.clamp(WARM_THRESHOLD, HOT_THRESHOLD - 1),
        Temperature::Cold => bucket.min(WARM_THRESHOLD - 1),
    }
}

/// A file with its pressure and the temperature derived from it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredFile {
    pub path: String,
    pub raw_pressure: f64,
    pub temperature: Temperature,
    pub pressure_bucket: u32,
}

impl ScoredFile {
    /// Build a scored file from an explicit bucket.
    pub fn new(path: impl Into<String>, raw_pressure: f64, pressure_bucket: u32) -> Self {
        Self {
            path: path.into(),
            raw_pressure,
            temperature: classify(pressure_bucket),
            pressure_bucket,
        }
    }

    /// Build a scored file whose bucket is derived from `raw_pressure`.
    pub fn from_pressure(path: impl Into<String>, raw_pressure: f64) -> Self {
        Self::new(path, raw_pressure, bucket_for_pressure(raw_pressure))
    }

    /// Neutral WARM entry for a file known only from recency.
    pub fn neutral(path: impl Into<String>) -> Self {
        Self::new(path, NEUTRAL_PRESSURE, NEUTRAL_BUCKET)
    }
}
