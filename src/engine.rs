//! The processing loop: ingestion → state store → trigger → scoring →
//! metrics emission.
//!
//! Ingestion runs on whichever task delivers readings; the loop itself runs
//! on its own task, waits for the completion trigger, drains the store once
//! and scores each drained station independently. The store lock is never
//! held across scoring, emission or queries.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{EngineConfig, ParameterSpec};
use crate::error::{EngineError, Result};
use crate::metrics::MetricsSink;
use crate::output::append_records;
use crate::parser::{Reading, manifest_station_ids, parse_reading};
use crate::scoring::{ScoreRecord, StationScore, score_station};
use crate::services::TimeSeriesQuery;
use crate::state::{StationState, StationStateStore};
use crate::trigger::{CompletionTrigger, ReadyToScore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopPhase {
    Idle,
    Accumulating,
    Draining,
    Scoring,
    Emitting,
    Stopped,
}

/// Snapshot served by the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct LoopStatus {
    pub phase: LoopPhase,
    pub trigger: &'static str,
    pub cycles_completed: u64,
    pub last_cycle_stations: usize,
    pub last_cycle_at: Option<DateTime<Utc>>,
}

/// What one scoring cycle did.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub drained: usize,
    pub scores: Vec<StationScore>,
    /// Stations that could not be scored.
    pub failed: Vec<String>,
    /// Stations whose score could not be emitted.
    pub emit_failures: Vec<String>,
}

impl CycleReport {
    pub fn score(&self, station_id: &str) -> Option<&StationScore> {
        self.scores.iter().find(|s| s.station_id() == station_id)
    }
}

pub struct ProcessingLoop {
    parameters: Vec<ParameterSpec>,
    pairs: Vec<(String, String)>,
    manifest_topic: String,
    store: Arc<StationStateStore>,
    trigger: Arc<dyn CompletionTrigger>,
    metrics: Arc<dyn MetricsSink>,
    pull_source: Option<Arc<dyn TimeSeriesQuery>>,
    history: Option<String>,
    status: watch::Sender<LoopStatus>,
}

impl ProcessingLoop {
    pub fn new(
        config: &EngineConfig,
        store: Arc<StationStateStore>,
        trigger: Arc<dyn CompletionTrigger>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let pairs = config
            .station_ids()
            .flat_map(|station| {
                config
                    .parameter_names()
                    .map(move |parameter| (station.to_string(), parameter.to_string()))
            })
            .collect();

        let (status, _) = watch::channel(LoopStatus {
            phase: LoopPhase::Idle,
            trigger: trigger.kind().as_str(),
            cycles_completed: 0,
            last_cycle_stations: 0,
            last_cycle_at: None,
        });

        Self {
            parameters: config.parameters.clone(),
            pairs,
            manifest_topic: config.mqtt.topic_root.clone(),
            store,
            trigger,
            metrics,
            pull_source: None,
            history: None,
            status,
        }
    }

    /// Before each drain, pull the latest value of every configured pair
    /// from `source` into the store.
    pub fn with_pull_source(mut self, source: Arc<dyn TimeSeriesQuery>) -> Self {
        self.pull_source = Some(source);
        self
    }

    /// Append every emitted score to the CSV file at `path`.
    pub fn with_history(mut self, path: impl Into<String>) -> Self {
        self.history = Some(path.into());
        self
    }

    pub fn store(&self) -> &StationStateStore {
        &self.store
    }

    pub fn status(&self) -> watch::Receiver<LoopStatus> {
        self.status.subscribe()
    }

    pub fn phase(&self) -> LoopPhase {
        self.status.borrow().phase
    }

    fn set_phase(&self, phase: LoopPhase) {
        self.status.send_if_modified(|status| {
            let changed = status.phase != phase;
            status.phase = phase;
            changed
        });
    }

    /// Accepts one reading: republishes it, records it in the current
    /// window and lets the trigger observe it.
    pub fn ingest(&self, reading: Reading) {
        if let Err(e) = self.metrics.record_reading(&reading) {
            warn!(
                station = %reading.station_id,
                parameter = %reading.parameter,
                error = %e,
                "Failed to republish reading"
            );
        }

        self.store
            .upsert(&reading.station_id, &reading.parameter, reading.value);
        self.trigger.on_reading();

        self.status.send_if_modified(|status| {
            if status.phase == LoopPhase::Idle {
                status.phase = LoopPhase::Accumulating;
                true
            } else {
                false
            }
        });
    }

    /// Decodes a transport message and ingests it. Returns `false` when the
    /// message was not a reading; malformed payloads are logged and dropped
    /// without touching the store.
    pub fn ingest_payload(&self, topic: &str, bytes: &[u8]) -> bool {
        if topic == self.manifest_topic {
            match manifest_station_ids(bytes) {
                Ok(stations) => info!(topic, stations = ?stations, "Station manifest received"),
                Err(e) => debug!(topic, error = %e, "Unreadable message on manifest topic"),
            }
            return false;
        }

        match parse_reading(bytes) {
            Ok(reading) => {
                debug!(
                    topic,
                    station = %reading.station_id,
                    parameter = %reading.parameter,
                    value = reading.value,
                    "Reading received"
                );
                self.ingest(reading);
                true
            }
            Err(e) => {
                warn!(topic, bytes = bytes.len(), error = %e, "Dropping malformed payload");
                self.metrics.record_dropped("malformed");
                false
            }
        }
    }

    /// Upserts the latest stored value of every configured pair. A pair the
    /// source cannot answer is logged and skipped.
    async fn refresh_from_source(&self, source: &dyn TimeSeriesQuery) -> usize {
        let mut pulled = 0;
        for (station, parameter) in &self.pairs {
            match source.most_recent_value(station, parameter).await {
                Ok(Some(sample)) => {
                    self.store.upsert(station, parameter, sample.value);
                    pulled += 1;
                }
                Ok(None) => {
                    debug!(station = %station, parameter = %parameter, "No stored value to pull")
                }
                Err(e) => {
                    let e = EngineError::upstream("timeseries", e);
                    warn!(station = %station, parameter = %parameter, error = %e, "Pull failed");
                }
            }
        }
        pulled
    }

    /// Runs one drain → score → emit cycle over whatever the window holds.
    #[tracing::instrument(skip(self))]
    pub async fn run_cycle(&self) -> CycleReport {
        if let Some(source) = &self.pull_source {
            let pulled = self.refresh_from_source(source.as_ref()).await;
            debug!(pulled, "Pulled latest values");
        }

        self.set_phase(LoopPhase::Draining);
        let window = self.store.snapshot_and_clear();
        let drained = window.len();

        self.set_phase(LoopPhase::Scoring);
        let (scores, failed) = self.score_window(window);

        self.set_phase(LoopPhase::Emitting);
        let emit_failures = self.emit(&scores);
        self.write_history(&scores).await;

        self.metrics.record_cycle(scores.len(), failed.len());
        self.status.send_modify(|status| {
            status.cycles_completed += 1;
            status.last_cycle_stations = scores.len();
            status.last_cycle_at = Some(Utc::now());
            status.phase = if self.store.is_empty() {
                LoopPhase::Idle
            } else {
                LoopPhase::Accumulating
            };
        });

        info!(
            drained,
            scored = scores.len(),
            failed = failed.len(),
            emit_failures = emit_failures.len(),
            "Scoring cycle complete"
        );

        CycleReport {
            drained,
            scores,
            failed,
            emit_failures,
        }
    }

    fn score_window(
        &self,
        window: HashMap<String, StationState>,
    ) -> (Vec<StationScore>, Vec<String>) {
        let mut scores = Vec::with_capacity(window.len());
        let mut failed = Vec::new();

        for (station_id, state) in window {
            match score_station(&state, &self.parameters) {
                Ok(score) => {
                    debug!(
                        station = %station_id,
                        score = score.score(),
                        band = %score.band(),
                        observed = score.observed(),
                        "Station scored"
                    );
                    scores.push(score);
                }
                Err(e) => {
                    error!(station = %station_id, error = %e, "Skipping station this cycle");
                    failed.push(station_id);
                }
            }
        }

        scores.sort_by(|a, b| a.station_id().cmp(b.station_id()));
        failed.sort();
        (scores, failed)
    }

    fn emit(&self, scores: &[StationScore]) -> Vec<String> {
        let mut failures = Vec::new();

        for score in scores {
            if let Err(e) = self.metrics.record_score(score) {
                error!(station = %score.station_id(), error = %e, "Failed to emit score");
                failures.push(score.station_id().to_string());
            }

        }

        failures
    }

    /// Appends the cycle's scores to the history file off the async workers.
    async fn write_history(&self, scores: &[StationScore]) {
        let Some(path) = self.history.clone() else {
            return;
        };
        if scores.is_empty() {
            return;
        }

        let records: Vec<ScoreRecord> = scores.iter().map(ScoreRecord::from).collect();
        let rows = records.len();
        let result =
            tokio::task::spawn_blocking(move || append_records(&path, &records).map(|()| path)).await;
        match result {
            Ok(Ok(path)) => debug!(path = %path, rows, "Score history appended"),
            Ok(Err(e)) => error!(rows, error = %e, "Failed to append score history"),
            Err(e) => error!(rows, error = %e, "Score history task panicked"),
        }
    }

    /// Waits for the trigger and runs cycles until `shutdown` flips to
    /// `true`. A cycle already running is finished before stopping.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(trigger = self.trigger.kind().as_str(), "Processing loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let event: ReadyToScore = tokio::select! {
                event = self.trigger.wait_for_ready() => event,
                _ = shutdown.changed() => break,
            };

            debug!(trigger = event.kind.as_str(), at = %event.at, "Window ready to score");
            self.run_cycle().await;
        }

        self.set_phase(LoopPhase::Stopped);
        let abandoned = self.store.station_count();
        info!(abandoned_stations = abandoned, "Processing loop stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MemoryMetrics;
    use crate::scoring::QualityBand;
    use crate::services::{MemorySeries, Sample};
    use crate::trigger::CountTrigger;

    const PH: &[u8] = br#"{"estacao":"BREPON","sensor":"ph","valor":7.0,"data_hora":"2024-10-01T12:15:00Z"}"#;

    fn engine(metrics: Arc<MemoryMetrics>) -> ProcessingLoop {
        ProcessingLoop::new(
            &EngineConfig::default(),
            Arc::new(StationStateStore::new()),
            Arc::new(CountTrigger::new(2)),
            metrics,
        )
    }

    #[test]
    fn test_ingest_payload_updates_store_and_republishes() {
        let metrics = Arc::new(MemoryMetrics::new());
        let engine = engine(metrics.clone());

        assert!(engine.ingest_payload("/thames/BREPON/ph", PH));
        assert_eq!(engine.store().station_count(), 1);
        assert_eq!(metrics.readings().len(), 1);
        assert_eq!(engine.phase(), LoopPhase::Accumulating);
    }

    #[test]
    fn test_malformed_payload_is_dropped() {
        let metrics = Arc::new(MemoryMetrics::new());
        let engine = engine(metrics.clone());

        assert!(!engine.ingest_payload("/thames/BREPON/ph", b"not json"));
        assert!(!engine.ingest_payload(
            "/thames/BREPON/ph",
            br#"{"estacao":"BREPON","valor":7.0,"data_hora":"2024-10-01T12:15:00Z"}"#
        ));
        assert!(engine.store().is_empty());
        assert_eq!(metrics.dropped(), 2);
        assert_eq!(engine.phase(), LoopPhase::Idle);
    }

    #[test]
    fn test_manifest_is_not_a_reading() {
        let metrics = Arc::new(MemoryMetrics::new());
        let engine = engine(metrics.clone());

        assert!(!engine.ingest_payload("/thames", br#"[{"estacao_01":"BREPON","sensors":[]}]"#));
        assert!(engine.store().is_empty());
        assert_eq!(metrics.dropped(), 0);
    }

    #[tokio::test]
    async fn test_cycle_scores_and_emits() {
        let metrics = Arc::new(MemoryMetrics::new());
        let engine = engine(metrics.clone());
        engine.ingest_payload("/thames/BREPON/ph", PH);

        let report = engine.run_cycle().await;
        assert_eq!(report.drained, 1);
        assert_eq!(report.score("BREPON").unwrap().band(), QualityBand::Excellent);
        assert!(engine.store().is_empty());
        assert_eq!(metrics.cycles(), 1);

        let status = engine.status().borrow().clone();
        assert_eq!(status.cycles_completed, 1);
        assert_eq!(status.last_cycle_stations, 1);
        assert_eq!(status.phase, LoopPhase::Idle);
    }

    #[tokio::test]
    async fn test_empty_cycle_is_harmless() {
        let metrics = Arc::new(MemoryMetrics::new());
        let report = engine(metrics.clone()).run_cycle().await;
        assert_eq!(report.drained, 0);
        assert!(report.scores.is_empty());
        assert_eq!(metrics.cycles(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_history_holds_every_station_of_the_cycle() {
        let path = format!(
            "{}/water_quality_rater_engine_history.csv",
            std::env::temp_dir().display()
        );
        let _ = std::fs::remove_file(&path);

        let metrics = Arc::new(MemoryMetrics::rejecting("KEWPON"));
        let engine = engine(metrics).with_history(path.clone());
        engine.ingest(Reading::new("BREPON", "ph", 7.0, Utc::now()));
        engine.ingest(Reading::new("KEWPON", "ph", 7.4, Utc::now()));

        let report = engine.run_cycle().await;
        assert_eq!(report.emit_failures, vec!["KEWPON".to_string()]);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with(|c: char| c.is_ascii_digit()));
        assert!(lines[1].contains("BREPON"));
        assert!(lines[2].contains("KEWPON"));

        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_scoring_failure_isolated_to_station() {
        let metrics = Arc::new(MemoryMetrics::new());
        let engine = engine(metrics.clone());
        engine.ingest(Reading::new("BREPON", "ph", 7.0, Utc::now()));
        engine.ingest(Reading::new("KEWPON", "ph", f64::NAN, Utc::now()));

        let report = engine.run_cycle().await;
        assert_eq!(report.failed, vec!["KEWPON".to_string()]);
        assert!(metrics.score("BREPON").is_some());
        assert!(metrics.score("KEWPON").is_none());
    }

    #[tokio::test]
    async fn test_pull_mode_fills_window() {
        let series = Arc::new(MemorySeries::new());
        series.insert(
            "PUTNEY",
            "oxigenio_dissolvido",
            Sample {
                value: 7.5,
                timestamp: Utc::now(),
            },
        );
        series.make_unreachable("BREPON");

        let metrics = Arc::new(MemoryMetrics::new());
        let engine = engine(metrics.clone()).with_pull_source(series);

        let report = engine.run_cycle().await;
        assert_eq!(report.drained, 1);
        assert!(report.score("PUTNEY").is_some());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let metrics = Arc::new(MemoryMetrics::new());
        let engine = Arc::new(engine(metrics));
        let (tx, rx) = watch::channel(false);

        let task = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run(rx).await })
        };
        tx.send(true).unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(engine.phase(), LoopPhase::Stopped);
    }
}
