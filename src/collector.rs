//! Collector: polls the upstream readings API for every station and
//! parameter and publishes each reading on the transport.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, watch};
use tracing::{Instrument, debug, error, info, warn};

use crate::config::{EngineConfig, ParameterSpec};
use crate::infra::mqtt::reading_topic;
use crate::parser::{Reading, ReadingPayload};
use crate::services::{MessagePublisher, ReadingSource};

/// Outcome of one collection round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundReport {
    pub fetched: usize,
    pub published: usize,
    pub failed_fetches: usize,
}

pub struct Collector {
    source: Arc<dyn ReadingSource>,
    publisher: Arc<dyn MessagePublisher>,
    stations: Vec<String>,
    parameters: Vec<ParameterSpec>,
    topic_root: String,
    concurrency: usize,
    interval: Duration,
    publish_pause: Duration,
}

impl Collector {
    pub fn new(
        config: &EngineConfig,
        source: Arc<dyn ReadingSource>,
        publisher: Arc<dyn MessagePublisher>,
    ) -> Self {
        Self {
            source,
            publisher,
            stations: config.station_ids().map(str::to_string).collect(),
            parameters: config.parameters.clone(),
            topic_root: config.mqtt.topic_root.clone(),
            concurrency: config.collector.concurrency.max(1),
            interval: Duration::from_secs(config.collector.interval_seconds),
            publish_pause: Duration::from_millis(config.collector.publish_pause_millis),
        }
    }

    /// Fetches every station × parameter concurrently, at most
    /// `concurrency` requests in flight. Returns the readings and the
    /// number of failed fetches.
    async fn fetch_all(&self) -> (Vec<Reading>, usize) {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = Vec::with_capacity(self.stations.len() * self.parameters.len());

        for station in &self.stations {
            for parameter in &self.parameters {
                let sem = semaphore.clone();
                let source = self.source.clone();
                let station = station.clone();
                let parameter = parameter.clone();

                let span = tracing::info_span!(
                    "fetch_reading",
                    station = %station,
                    parameter = %parameter.name,
                );

                tasks.push(tokio::spawn(
                    async move {
                        let _permit = sem.acquire_owned().await?;
                        source.latest_readings(&station, &parameter).await
                    }
                    .instrument(span),
                ));
            }
        }

        let mut readings = Vec::new();
        let mut failed = 0;
        for task in tasks {
            match task.await {
                Ok(Ok(batch)) => readings.extend(batch),
                Ok(Err(e)) => {
                    warn!(error = %e, "Reading fetch failed");
                    failed += 1;
                }
                Err(e) => {
                    error!(error = %e, "Fetch task panicked");
                    failed += 1;
                }
            }
        }
        (readings, failed)
    }

    /// Publishes each reading to `{root}/{station}/{parameter}`, pausing
    /// between messages.
    async fn publish_all(&self, readings: &[Reading]) -> usize {
        let mut published = 0;
        for (i, reading) in readings.iter().enumerate() {
            if i > 0 && !self.publish_pause.is_zero() {
                tokio::time::sleep(self.publish_pause).await;
            }

            let topic = reading_topic(&self.topic_root, &reading.station_id, &reading.parameter);
            let payload = match serde_json::to_vec(&ReadingPayload::from(reading)) {
                Ok(p) => p,
                Err(e) => {
                    error!(topic = %topic, error = %e, "Failed to encode reading");
                    continue;
                }
            };

            match self.publisher.publish(&topic, payload).await {
                Ok(()) => {
                    debug!(topic = %topic, value = reading.value, "Reading published");
                    published += 1;
                }
                Err(e) => error!(topic = %topic, error = %e, "Failed to publish reading"),
            }
        }
        published
    }

    #[tracing::instrument(skip(self), fields(stations = self.stations.len(), parameters = self.parameters.len()))]
    pub async fn run_round(&self) -> RoundReport {
        let (readings, failed_fetches) = self.fetch_all().await;
        let published = self.publish_all(&readings).await;

        let report = RoundReport {
            fetched: readings.len(),
            published,
            failed_fetches,
        };
        info!(
            fetched = report.fetched,
            published = report.published,
            failed_fetches = report.failed_fetches,
            "Collection round complete"
        );
        report
    }

    /// Runs `rounds` collection rounds (0 = until shutdown), waiting the
    /// configured interval between rounds.
    pub async fn run(&self, rounds: usize, mut shutdown: watch::Receiver<bool>) {
        if rounds == 0 {
            info!(interval_secs = self.interval.as_secs(), "Collecting until shutdown");
        } else {
            info!(rounds, interval_secs = self.interval.as_secs(), "Starting collection");
        }

        let mut completed = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = self.run_round() => {}
                _ = shutdown.changed() => break,
            }
            completed += 1;

            if rounds > 0 && completed >= rounds {
                break;
            }

            info!(interval_secs = self.interval.as_secs(), "Waiting before next round");
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!(completed, "Collector stopped");
    }
}
