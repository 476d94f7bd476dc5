//! Metrics collaborator.
//!
//! [`MetricsSink`] is the seam the engine emits through. [`PrometheusMetrics`]
//! backs the `/metrics` endpoint with an owned registry; [`MemoryMetrics`]
//! keeps the latest values in memory for offline scoring and tests.

use prometheus::{Encoder, GaugeVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::config::StationSpec;
use crate::error::{EngineError, Result};
use crate::inactivity::InactivityAlert;
use crate::parser::Reading;
use crate::scoring::StationScore;

pub trait MetricsSink: Send + Sync {
    /// Republishes a raw reading keyed by station, parameter and timestamp.
    fn record_reading(&self, reading: &Reading) -> Result<()>;

    /// Publishes a station's composite score and band.
    fn record_score(&self, score: &StationScore) -> Result<()>;

    fn record_inactivity(&self, alert: &InactivityAlert) -> Result<()>;

    fn clear_inactivity(&self, station_id: &str, parameter: &str) -> Result<()>;

    fn record_cycle(&self, _scored: usize, _failed: usize) {}

    fn record_dropped(&self, _reason: &str) {}
}

fn metrics_error(e: prometheus::Error) -> EngineError {
    EngineError::upstream("metrics", e)
}

pub struct PrometheusMetrics {
    registry: Registry,
    readings: GaugeVec,
    scores: GaugeVec,
    bands: GaugeVec,
    inactivity: GaugeVec,
    latitude: GaugeVec,
    longitude: GaugeVec,
    cycles: IntCounter,
    dropped: IntCounterVec,
    /// Timestamp label of the live reading series per (station, parameter).
    reading_timestamps: Mutex<HashMap<(String, String), String>>,
}

impl PrometheusMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let readings = GaugeVec::new(
            Opts::new("water_quality_reading", "Latest raw reading per station sensor"),
            &["station", "parameter", "timestamp"],
        )?;
        let scores = GaugeVec::new(
            Opts::new("water_quality_score", "Composite water-quality score per station"),
            &["station"],
        )?;
        let bands = GaugeVec::new(
            Opts::new(
                "water_quality_band",
                "Quality band per station (1=terrible .. 6=excellent)",
            ),
            &["station"],
        )?;
        let inactivity = GaugeVec::new(
            Opts::new(
                "sensor_inactivity_minutes",
                "Minutes since the last reading, set once above the alert threshold",
            ),
            &["station", "parameter"],
        )?;
        let latitude = GaugeVec::new(
            Opts::new("station_latitude", "Station latitude"),
            &["station"],
        )?;
        let longitude = GaugeVec::new(
            Opts::new("station_longitude", "Station longitude"),
            &["station"],
        )?;
        let cycles = IntCounter::new("scoring_cycles_total", "Completed scoring cycles")?;
        let dropped = IntCounterVec::new(
            Opts::new("readings_dropped_total", "Payloads dropped at ingestion"),
            &["reason"],
        )?;

        registry.register(Box::new(readings.clone()))?;
        registry.register(Box::new(scores.clone()))?;
        registry.register(Box::new(bands.clone()))?;
        registry.register(Box::new(inactivity.clone()))?;
        registry.register(Box::new(latitude.clone()))?;
        registry.register(Box::new(longitude.clone()))?;
        registry.register(Box::new(cycles.clone()))?;
        registry.register(Box::new(dropped.clone()))?;

        Ok(Self {
            registry,
            readings,
            scores,
            bands,
            inactivity,
            latitude,
            longitude,
            cycles,
            dropped,
            reading_timestamps: Mutex::new(HashMap::new()),
        })
    }

    /// Exports coordinates for every station that has them.
    pub fn publish_stations(&self, stations: &[StationSpec]) -> Result<()> {
        for station in stations {
            if let (Some(lat), Some(lon)) = (station.latitude, station.longitude) {
                self.latitude
                    .get_metric_with_label_values(&[station.id.as_str()])
                    .map_err(metrics_error)?
                    .set(lat);
                self.longitude
                    .get_metric_with_label_values(&[station.id.as_str()])
                    .map_err(metrics_error)?
                    .set(lon);
            }
        }
        Ok(())
    }

    /// Encodes the registry in the Prometheus text format.
    pub fn encode(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

impl MetricsSink for PrometheusMetrics {
    fn record_reading(&self, reading: &Reading) -> Result<()> {
        let timestamp = reading.timestamp.to_rfc3339();
        self.readings
            .get_metric_with_label_values(&[
                reading.station_id.as_str(),
                reading.parameter.as_str(),
                timestamp.as_str(),
            ])
            .map_err(metrics_error)?
            .set(reading.value);

        // One live series per pair; the previous timestamp's series is retired.
        let key = (reading.station_id.clone(), reading.parameter.clone());
        let previous = self
            .reading_timestamps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key, timestamp.clone());
        if let Some(previous) = previous.filter(|p| *p != timestamp) {
            let _ = self.readings.remove_label_values(&[
                reading.station_id.as_str(),
                reading.parameter.as_str(),
                previous.as_str(),
            ]);
        }
        Ok(())
    }

    fn record_score(&self, score: &StationScore) -> Result<()> {
        self.scores
            .get_metric_with_label_values(&[score.station_id()])
            .map_err(metrics_error)?
            .set(score.rounded_score());
        self.bands
            .get_metric_with_label_values(&[score.station_id()])
            .map_err(metrics_error)?
            .set(f64::from(score.band().ordinal()));
        Ok(())
    }

    fn record_inactivity(&self, alert: &InactivityAlert) -> Result<()> {
        self.inactivity
            .get_metric_with_label_values(&[alert.station_id.as_str(), alert.parameter.as_str()])
            .map_err(metrics_error)?
            .set(alert.elapsed_minutes);
        Ok(())
    }

    fn clear_inactivity(&self, station_id: &str, parameter: &str) -> Result<()> {
        self.inactivity
            .get_metric_with_label_values(&[station_id, parameter])
            .map_err(metrics_error)?
            .set(0.0);
        Ok(())
    }

    fn record_cycle(&self, _scored: usize, _failed: usize) {
        self.cycles.inc();
    }

    fn record_dropped(&self, reason: &str) {
        if let Ok(counter) = self.dropped.get_metric_with_label_values(&[reason]) {
            counter.inc();
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    readings: Vec<Reading>,
    scores: HashMap<String, StationScore>,
    inactivity: HashMap<(String, String), f64>,
    cycles: usize,
    dropped: usize,
}

/// In-process sink holding the latest emitted values.
#[derive(Debug, Default)]
pub struct MemoryMetrics {
    state: Mutex<MemoryState>,
    reject_station: Option<String>,
}

impl MemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink that refuses score emission for `station_id`.
    pub fn rejecting(station_id: &str) -> Self {
        Self {
            state: Mutex::default(),
            reject_station: Some(station_id.to_string()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn score(&self, station_id: &str) -> Option<StationScore> {
        self.lock().scores.get(station_id).cloned()
    }

    /// All emitted scores, ordered by station id.
    pub fn scores(&self) -> Vec<StationScore> {
        let mut scores: Vec<_> = self.lock().scores.values().cloned().collect();
        scores.sort_by(|a, b| a.station_id().cmp(b.station_id()));
        scores
    }

    pub fn readings(&self) -> Vec<Reading> {
        self.lock().readings.clone()
    }

    pub fn inactivity(&self, station_id: &str, parameter: &str) -> Option<f64> {
        self.lock()
            .inactivity
            .get(&(station_id.to_string(), parameter.to_string()))
            .copied()
    }

    pub fn cycles(&self) -> usize {
        self.lock().cycles
    }

    pub fn dropped(&self) -> usize {
        self.lock().dropped
    }
}

impl MetricsSink for MemoryMetrics {
    fn record_reading(&self, reading: &Reading) -> Result<()> {
        self.lock().readings.push(reading.clone());
        Ok(())
    }

    fn record_score(&self, score: &StationScore) -> Result<()> {
        if self.reject_station.as_deref() == Some(score.station_id()) {
            return Err(EngineError::upstream("metrics", "station rejected by sink"));
        }
        self.lock()
            .scores
            .insert(score.station_id().to_string(), score.clone());
        Ok(())
    }

    fn record_inactivity(&self, alert: &InactivityAlert) -> Result<()> {
        self.lock().inactivity.insert(
            (alert.station_id.clone(), alert.parameter.clone()),
            alert.elapsed_minutes,
        );
        Ok(())
    }

    fn clear_inactivity(&self, station_id: &str, parameter: &str) -> Result<()> {
        self.lock()
            .inactivity
            .insert((station_id.to_string(), parameter.to_string()), 0.0);
        Ok(())
    }

    fn record_cycle(&self, _scored: usize, _failed: usize) {
        self.lock().cycles += 1;
    }

    fn record_dropped(&self, _reason: &str) {
        self.lock().dropped += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::scoring::score_station;
    use crate::state::StationState;
    use chrono::{TimeZone, Utc};

    fn brepon_score() -> StationScore {
        let mut state = StationState::new("BREPON");
        state.parameters.insert("ph".into(), 7.0);
        state.parameters.insert("oxigenio_dissolvido".into(), 7.0);
        score_station(&state, &EngineConfig::default().parameters).unwrap()
    }

    #[test]
    fn test_encode_contains_emitted_metrics() {
        let metrics = PrometheusMetrics::new().unwrap();
        let at = Utc.with_ymd_and_hms(2024, 10, 1, 12, 15, 0).unwrap();

        metrics
            .record_reading(&Reading::new("BREPON", "ph", 7.0, at))
            .unwrap();
        metrics.record_score(&brepon_score()).unwrap();
        metrics.record_cycle(1, 0);

        let output = metrics.encode().unwrap();
        assert!(output.contains("water_quality_reading"));
        assert!(output.contains(r#"station="BREPON""#));
        assert!(output.contains("water_quality_score{station=\"BREPON\"}"));
        assert!(output.contains("water_quality_band{station=\"BREPON\"} 6"));
        assert!(output.contains("scoring_cycles_total 1"));
    }

    #[test]
    fn test_reading_keeps_one_series_per_pair() {
        let metrics = PrometheusMetrics::new().unwrap();
        let start = Utc.with_ymd_and_hms(2024, 10, 1, 12, 0, 0).unwrap();

        for minute in 0..50 {
            let at = start + chrono::Duration::minutes(minute);
            metrics
                .record_reading(&Reading::new("BREPON", "ph", 7.0 + minute as f64 / 100.0, at))
                .unwrap();
        }
        metrics
            .record_reading(&Reading::new("KEWPON", "ph", 7.2, start))
            .unwrap();

        let output = metrics.encode().unwrap();
        let series: Vec<&str> = output
            .lines()
            .filter(|l| l.starts_with("water_quality_reading{"))
            .collect();
        assert_eq!(series.len(), 2);

        let latest = (start + chrono::Duration::minutes(49)).to_rfc3339();
        assert!(series
            .iter()
            .any(|l| l.contains(r#"station="BREPON""#) && l.contains(latest.as_str())));
    }

    #[test]
    fn test_registries_are_independent() {
        let a = PrometheusMetrics::new().unwrap();
        let b = PrometheusMetrics::new().unwrap();
        a.record_score(&brepon_score()).unwrap();
        assert!(!b.encode().unwrap().contains("water_quality_score{"));
    }

    #[test]
    fn test_publish_stations_skips_unknown_coordinates() {
        let metrics = PrometheusMetrics::new().unwrap();
        metrics
            .publish_stations(&EngineConfig::default().stations)
            .unwrap();

        let output = metrics.encode().unwrap();
        assert!(output.contains("station_latitude{station=\"BREPON\"}"));
        assert!(!output.contains("station_latitude{station=\"ERITH1\"}"));
    }

    #[test]
    fn test_inactivity_set_and_cleared() {
        let metrics = MemoryMetrics::new();
        let alert = InactivityAlert {
            station_id: "KEWPON".into(),
            parameter: "ph".into(),
            elapsed_minutes: 42.5,
        };
        metrics.record_inactivity(&alert).unwrap();
        assert_eq!(metrics.inactivity("KEWPON", "ph"), Some(42.5));

        metrics.clear_inactivity("KEWPON", "ph").unwrap();
        assert_eq!(metrics.inactivity("KEWPON", "ph"), Some(0.0));
    }

    #[test]
    fn test_rejecting_sink_refuses_only_that_station() {
        let metrics = MemoryMetrics::rejecting("BREPON");
        assert!(metrics.record_score(&brepon_score()).is_err());
        assert!(metrics.score("BREPON").is_none());
    }
}
