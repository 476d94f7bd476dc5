//! MQTT transport: the ingestion subscriber feeding the processing loop and
//! the publisher used by the collector.
//!
//! Topics are `{root}/{station}/{parameter}` for readings and `{root}` for
//! the station manifest.

use anyhow::Result;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;
use crate::engine::ProcessingLoop;
use crate::services::MessagePublisher;

const KEEP_ALIVE: Duration = Duration::from_secs(60);
const CHANNEL_CAPACITY: usize = 64;

pub fn reading_topic(root: &str, station_id: &str, parameter: &str) -> String {
    format!("{root}/{station_id}/{parameter}")
}

fn options(config: &MqttConfig, role: &str) -> MqttOptions {
    let client_id = format!("{}-{role}-{}", config.client_id, std::process::id());
    let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
    options.set_keep_alive(KEEP_ALIVE);
    options
}

/// Exponential reconnect delay, doubling from `min` up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            current: min,
        }
    }

    /// Returns the delay to wait now and doubles the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

/// Sleeps for the next backoff delay. Returns `false` if shutdown was
/// requested meanwhile.
async fn wait_backoff(backoff: &mut Backoff, shutdown: &mut watch::Receiver<bool>) -> bool {
    let delay = backoff.next_delay();
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown.changed() => false,
    }
}

/// Subscribes to every reading under the topic root and hands each message
/// to the processing loop until shutdown. Connection errors are retried
/// with backoff and the subscription is renewed on every reconnect.
pub async fn run_subscriber(
    config: &MqttConfig,
    engine: Arc<ProcessingLoop>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let (client, mut eventloop) = AsyncClient::new(options(config, "sub"), CHANNEL_CAPACITY);
    let filter = format!("{}/#", config.topic_root);
    let mut backoff = Backoff::default();

    info!(host = %config.host, port = config.port, filter = %filter, "Connecting MQTT subscriber");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let event = tokio::select! {
            event = eventloop.poll() => event,
            _ = shutdown.changed() => break,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!(code = ?ack.code, "MQTT connected");
                backoff.reset();
                if let Err(e) = client.subscribe(filter.as_str(), QoS::AtMostOnce).await {
                    error!(error = %e, "MQTT subscribe request failed");
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                engine.ingest_payload(&publish.topic, &publish.payload);
            }
            Ok(other) => debug!(event = ?other, "MQTT event"),
            Err(e) => {
                warn!(error = %e, "MQTT connection error");
                if !wait_backoff(&mut backoff, &mut shutdown).await {
                    break;
                }
            }
        }
    }

    disconnect(&client, &mut eventloop).await;
    info!("MQTT subscriber stopped");
    Ok(())
}

/// Sends DISCONNECT and gives the event loop a moment to flush it.
async fn disconnect(client: &AsyncClient, eventloop: &mut EventLoop) {
    if client.disconnect().await.is_err() {
        return;
    }
    let _ = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
}

/// Publishing side of the transport. The event loop runs on its own task
/// and re-announces `manifest` on every (re)connect.
pub struct MqttPublisher {
    client: AsyncClient,
}

impl MqttPublisher {
    /// Returns the publisher and the event loop task, which ends once
    /// `shutdown` flips to `true`.
    pub fn connect(
        config: &MqttConfig,
        manifest: Option<Vec<u8>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let (client, mut eventloop) = AsyncClient::new(options(config, "pub"), CHANNEL_CAPACITY);
        let announcer = client.clone();
        let manifest_topic = config.topic_root.clone();

        info!(host = %config.host, port = config.port, "Connecting MQTT publisher");

        let driver = tokio::spawn(async move {
            let mut backoff = Backoff::default();
            loop {
                let event = tokio::select! {
                    event = eventloop.poll() => event,
                    _ = shutdown.changed() => break,
                };

                match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("MQTT publisher connected");
                        backoff.reset();
                        if let Some(manifest) = &manifest {
                            match announcer
                                .publish(manifest_topic.as_str(), QoS::AtLeastOnce, false, manifest.clone())
                                .await
                            {
                                Ok(()) => info!(topic = %manifest_topic, "Station manifest published"),
                                Err(e) => error!(error = %e, "Failed to publish station manifest"),
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "MQTT publisher connection error");
                        if !wait_backoff(&mut backoff, &mut shutdown).await {
                            break;
                        }
                    }
                }
            }
            disconnect(&announcer, &mut eventloop).await;
            info!("MQTT publisher stopped");
        });

        (Self { client }, driver)
    }
}

#[async_trait]
impl MessagePublisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await?;
        Ok(())
    }
}
