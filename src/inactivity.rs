//! Sensor inactivity monitoring.
//!
//! For every configured (station, parameter) pair the monitor asks the
//! time-series store for the latest sample and raises an alert once the
//! sample is older than the threshold. Pairs are checked one at a time with
//! a pause in between so the query backend is never hit in bursts.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::metrics::MetricsSink;
use crate::services::TimeSeriesQuery;

#[derive(Debug, Clone, PartialEq)]
pub struct InactivityAlert {
    pub station_id: String,
    pub parameter: String,
    pub elapsed_minutes: f64,
}

/// Outcome of checking a single pair.
#[derive(Debug, Clone, PartialEq)]
pub enum PairStatus {
    /// The store has no sample for the pair.
    Missing,
    Active { elapsed_minutes: f64 },
    Inactive(InactivityAlert),
}

pub struct InactivityMonitor {
    query: Arc<dyn TimeSeriesQuery>,
    metrics: Arc<dyn MetricsSink>,
    pairs: Vec<(String, String)>,
    threshold: Duration,
    poll_interval: Duration,
    alerted: Mutex<HashSet<(String, String)>>,
}

impl InactivityMonitor {
    pub fn new(
        config: &EngineConfig,
        query: Arc<dyn TimeSeriesQuery>,
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

        Self {
            query,
            metrics,
            pairs,
            threshold: config.inactivity.threshold(),
            poll_interval: config.inactivity.poll_interval(),
            alerted: Mutex::new(HashSet::new()),
        }
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    /// Compares the pair's latest sample against `now`.
    pub async fn evaluate(
        &self,
        station_id: &str,
        parameter: &str,
        now: DateTime<Utc>,
    ) -> Result<PairStatus> {
        let sample = self
            .query
            .most_recent_value(station_id, parameter)
            .await
            .map_err(|e| EngineError::upstream("timeseries", e))?;

        let Some(sample) = sample else {
            return Ok(PairStatus::Missing);
        };

        let elapsed = now.signed_duration_since(sample.timestamp);
        let elapsed_minutes = elapsed.num_milliseconds() as f64 / 60_000.0;

        // Samples stamped in the future count as fresh.
        let over = elapsed
            .to_std()
            .map(|e| e > self.threshold)
            .unwrap_or(false);

        if over {
            Ok(PairStatus::Inactive(InactivityAlert {
                station_id: station_id.to_string(),
                parameter: parameter.to_string(),
                elapsed_minutes,
            }))
        } else {
            Ok(PairStatus::Active { elapsed_minutes })
        }
    }

    /// Evaluates one pair and pushes the outcome to the metrics sink.
    async fn check_pair(
        &self,
        station_id: &str,
        parameter: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<InactivityAlert>> {
        let key = (station_id.to_string(), parameter.to_string());

        match self.evaluate(station_id, parameter, now).await? {
            PairStatus::Missing => {
                debug!(station = %station_id, parameter = %parameter, "No samples stored yet");
                Ok(None)
            }
            PairStatus::Active { elapsed_minutes } => {
                if self.lock_alerted().remove(&key) {
                    info!(
                        station = %station_id,
                        parameter = %parameter,
                        elapsed_minutes,
                        "Sensor active again"
                    );
                    self.metrics.clear_inactivity(station_id, parameter)?;
                }
                Ok(None)
            }
            PairStatus::Inactive(alert) => {
                warn!(
                    station = %alert.station_id,
                    parameter = %alert.parameter,
                    elapsed_minutes = alert.elapsed_minutes,
                    "Sensor inactive"
                );
                self.metrics.record_inactivity(&alert)?;
                self.lock_alerted().insert(key);
                Ok(Some(alert))
            }
        }
    }

    fn lock_alerted(&self) -> std::sync::MutexGuard<'_, HashSet<(String, String)>> {
        self.alerted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Checks every pair once, without pacing. A failing pair is logged
    /// and the remaining pairs are still checked.
    #[tracing::instrument(skip(self), fields(pairs = self.pairs.len()))]
    pub async fn sweep(&self, now: DateTime<Utc>) -> Vec<InactivityAlert> {
        let mut alerts = Vec::new();
        for (station, parameter) in &self.pairs {
            match self.check_pair(station, parameter, now).await {
                Ok(Some(alert)) => alerts.push(alert),
                Ok(None) => {}
                Err(e) => {
                    error!(station = %station, parameter = %parameter, error = %e, "Inactivity check failed")
                }
            }
        }
        alerts
    }

    /// Cycles through the pairs until shutdown, pausing `poll_interval`
    /// between consecutive queries.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            pairs = self.pairs.len(),
            threshold_secs = self.threshold.as_secs(),
            poll_secs = self.poll_interval.as_secs(),
            "Inactivity monitor started"
        );

        if self.pairs.is_empty() {
            let _ = shutdown.wait_for(|stop| *stop).await;
            return;
        }

        loop {
            for (station, parameter) in &self.pairs {
                if *shutdown.borrow() {
                    info!("Inactivity monitor stopped");
                    return;
                }

                if let Err(e) = self.check_pair(station, parameter, Utc::now()).await {
                    error!(station = %station, parameter = %parameter, error = %e, "Inactivity check failed");
                }

                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    _ = shutdown.changed() => {
                        info!("Inactivity monitor stopped");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ParameterSpec, StationSpec};
    use crate::metrics::MemoryMetrics;
    use crate::services::{MemorySeries, Sample};
    use chrono::TimeZone;

    fn config() -> EngineConfig {
        EngineConfig {
            parameters: vec![
                ParameterSpec::new("ph", 6.5, 9.5, 0.5, "-ph-i-subdaily"),
                ParameterSpec::new("turbidez", 0.0, 4.0, 0.5, "-turb-i-subdaily-ntu"),
            ],
            stations: vec![StationSpec::new("BREPON"), StationSpec::new("KEWPON")],
            ..EngineConfig::default()
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 10, 1, 12, 0, 0).unwrap()
    }

    fn sample_minutes_ago(minutes: i64) -> Sample {
        Sample {
            value: 7.0,
            timestamp: now() - chrono::Duration::minutes(minutes),
        }
    }

    fn monitor(series: Arc<MemorySeries>, metrics: Arc<MemoryMetrics>) -> InactivityMonitor {
        InactivityMonitor::new(&config(), series, metrics)
    }

    #[test]
    fn test_pairs_cover_every_station_and_parameter() {
        let m = monitor(Arc::new(MemorySeries::new()), Arc::new(MemoryMetrics::new()));
        assert_eq!(m.pairs().len(), 4);
        assert!(m.pairs().contains(&("KEWPON".to_string(), "turbidez".to_string())));
    }

    #[tokio::test]
    async fn test_evaluate_threshold() {
        let series = Arc::new(MemorySeries::new());
        series.insert("BREPON", "ph", sample_minutes_ago(25));
        series.insert("KEWPON", "ph", sample_minutes_ago(5));
        let m = monitor(series, Arc::new(MemoryMetrics::new()));

        match m.evaluate("BREPON", "ph", now()).await.unwrap() {
            PairStatus::Inactive(alert) => assert_eq!(alert.elapsed_minutes, 25.0),
            other => panic!("expected inactive, got {other:?}"),
        }
        assert_eq!(
            m.evaluate("KEWPON", "ph", now()).await.unwrap(),
            PairStatus::Active {
                elapsed_minutes: 5.0
            }
        );
        assert_eq!(
            m.evaluate("KEWPON", "turbidez", now()).await.unwrap(),
            PairStatus::Missing
        );
    }

    #[tokio::test]
    async fn test_exactly_at_threshold_is_not_inactive() {
        let series = Arc::new(MemorySeries::new());
        series.insert("BREPON", "ph", sample_minutes_ago(20));
        let m = monitor(series, Arc::new(MemoryMetrics::new()));
        assert!(matches!(
            m.evaluate("BREPON", "ph", now()).await.unwrap(),
            PairStatus::Active { .. }
        ));
    }

    #[tokio::test]
    async fn test_sweep_continues_past_unreachable_pairs() {
        let series = Arc::new(MemorySeries::new());
        series.make_unreachable("BREPON");
        series.insert("KEWPON", "ph", sample_minutes_ago(30));
        series.insert("KEWPON", "turbidez", sample_minutes_ago(45));
        let metrics = Arc::new(MemoryMetrics::new());
        let m = monitor(series, metrics.clone());

        let alerts = m.sweep(now()).await;
        assert_eq!(alerts.len(), 2);
        assert_eq!(metrics.inactivity("KEWPON", "ph"), Some(30.0));
        assert_eq!(metrics.inactivity("KEWPON", "turbidez"), Some(45.0));
        assert_eq!(metrics.inactivity("BREPON", "ph"), None);
    }

    #[tokio::test]
    async fn test_recovered_pair_is_cleared() {
        let series = Arc::new(MemorySeries::new());
        series.insert("BREPON", "ph", sample_minutes_ago(30));
        let metrics = Arc::new(MemoryMetrics::new());
        let m = monitor(series.clone(), metrics.clone());

        m.sweep(now()).await;
        assert_eq!(metrics.inactivity("BREPON", "ph"), Some(30.0));

        series.insert("BREPON", "ph", sample_minutes_ago(1));
        assert!(m.sweep(now()).await.is_empty());
        assert_eq!(metrics.inactivity("BREPON", "ph"), Some(0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let series = Arc::new(MemorySeries::new());
        let m = Arc::new(monitor(series, Arc::new(MemoryMetrics::new())));
        let (tx, rx) = watch::channel(false);

        let task = {
            let m = m.clone();
            tokio::spawn(async move { m.run(rx).await })
        };
        tokio::time::sleep(Duration::from_secs(25)).await;
        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
