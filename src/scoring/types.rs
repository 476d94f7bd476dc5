//! Data types produced by the scoring stage.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::scoring::grade::QualityBand;

/// Rounds a composite to the three decimals it is exported with.
pub fn round_score(score: f64) -> f64 {
    (score * 1000.0).round() / 1000.0
}

/// Composite score and band for one station in one window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StationScore {
    pub(crate) station_id: String,
    pub(crate) score: f64,
    pub(crate) band: QualityBand,
    /// Normalised 0–100 score per configured parameter.
    pub(crate) parameter_scores: BTreeMap<String, f64>,
    /// Parameters actually observed in the window.
    pub(crate) observed: usize,
    pub(crate) scored_at: DateTime<Utc>,
}

impl StationScore {
    pub fn station_id(&self) -> &str {
        &self.station_id
    }

    /// Composite score as computed, unrounded.
    pub fn score(&self) -> f64 {
        self.score
    }

    /// Composite score rounded to three decimals, as exported.
    pub fn rounded_score(&self) -> f64 {
        round_score(self.score)
    }

    pub fn band(&self) -> QualityBand {
        self.band
    }

    pub fn parameter_score(&self, parameter: &str) -> Option<f64> {
        self.parameter_scores.get(parameter).copied()
    }

    pub fn observed(&self) -> usize {
        self.observed
    }

    pub fn scored_at(&self) -> DateTime<Utc> {
        self.scored_at
    }
}

/// Flat row appended to the score history CSV.
#[derive(Debug, Serialize)]
pub struct ScoreRecord {
    pub(crate) timestamp: DateTime<Utc>,
    pub(crate) station: String,
    pub(crate) score: f64,
    pub(crate) band: QualityBand,
    pub(crate) band_ordinal: u8,
    pub(crate) observed: usize,
}

impl From<&StationScore> for ScoreRecord {
    fn from(s: &StationScore) -> Self {
        Self {
            timestamp: s.scored_at,
            station: s.station_id.clone(),
            score: s.rounded_score(),
            band: s.band,
            band_ordinal: s.band.ordinal(),
            observed: s.observed,
        }
    }
}
