//! CLI entry point for the water-quality rater.
//!
//! Provides subcommands for running the scoring engine against the MQTT
//! feed, collecting readings from the hydrology API, and scoring a file of
//! readings offline.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};
use water_quality_rater::{
    collector::Collector,
    config::{EngineConfig, TriggerConfig},
    engine::ProcessingLoop,
    fetch::{BasicClient, fetch_bytes},
    inactivity::InactivityMonitor,
    infra::{
        hydrology::HydrologyClient,
        mqtt::{MqttPublisher, run_subscriber},
        prometheus::PrometheusQueryClient,
    },
    metrics::{MemoryMetrics, PrometheusMetrics},
    output::print_json,
    parser::build_manifest,
    server,
    services::TimeSeriesQuery,
    state::StationStateStore,
    trigger::{CountTrigger, from_config},
};

/// Interval announced for each sensor in the station manifest.
const MANIFEST_DATA_INTERVAL: &str = "15 minutos";

#[derive(Parser)]
#[command(name = "water_quality_rater")]
#[command(about = "Aggregates water-quality readings into per-station scores", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Subscribe to readings and score stations continuously
    Process {
        /// JSON config file; built-in defaults when omitted
        #[arg(short, long)]
        config: Option<String>,

        /// Completion trigger override, e.g. "count:48", "quiescence:40", "periodic:1080"
        #[arg(short, long)]
        trigger: Option<TriggerConfig>,

        /// CSV file to append every emitted score to
        #[arg(long)]
        history: Option<String>,

        /// Pull the latest stored values before every cycle
        #[arg(long, default_value_t = false)]
        pull: bool,

        /// Port for the /metrics, /health and /status endpoints
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Poll the hydrology API and publish readings to the broker
    Collect {
        #[arg(short, long)]
        config: Option<String>,

        /// Number of rounds to collect (0 = until Ctrl+C)
        #[arg(short = 'n', long, default_value_t = 0)]
        rounds: usize,
    },
    /// Score a JSON array of reading payloads from a file or URL
    Score {
        #[arg(value_name = "FILE_OR_URL")]
        source: String,

        #[arg(short, long)]
        config: Option<String>,

        /// CSV file to append results to
        #[arg(short, long)]
        output: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path = std::env::var("LOG_FILE_PATH")
        .unwrap_or_else(|_| "logs/water_quality_rater.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("water_quality_rater.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Process {
            config,
            trigger,
            history,
            pull,
            port,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(trigger) = trigger {
                config.trigger = trigger;
            }
            if let Some(port) = port {
                config.metrics_port = port;
            }
            config.pull_mode |= pull;
            config.validate()?;

            process(config, history).await?;
        }
        Commands::Collect { config, rounds } => {
            let config = load_config(config.as_deref())?;
            config.validate()?;

            collect(config, rounds).await?;
        }
        Commands::Score {
            source,
            config,
            output,
        } => {
            let config = load_config(config.as_deref())?;
            config.validate()?;

            score_file(&config, &source, output).await?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&str>) -> Result<EngineConfig> {
    match path {
        Some(path) => {
            info!(path, "Loading config");
            EngineConfig::load(path).with_context(|| format!("loading config from {path}"))
        }
        None => Ok(EngineConfig::default()),
    }
}

/// Flips `shutdown` on Ctrl+C.
fn spawn_ctrl_c(shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl+C, shutting down"),
        }
        let _ = shutdown.send(true);
    });
}

/// Runs the processing loop, inactivity monitor, MQTT ingestion and metrics
/// server until Ctrl+C.
#[tracing::instrument(skip_all, fields(trigger = ?config.trigger, pull = config.pull_mode))]
async fn process(config: EngineConfig, history: Option<String>) -> Result<()> {
    let metrics = Arc::new(PrometheusMetrics::new()?);
    metrics.publish_stations(&config.stations)?;

    let query: Arc<dyn TimeSeriesQuery> = Arc::new(PrometheusQueryClient::new(
        &config.prometheus_url,
        config.request_timeout(),
    )?);

    let mut engine = ProcessingLoop::new(
        &config,
        Arc::new(StationStateStore::new()),
        Arc::from(from_config(&config.trigger)),
        metrics.clone(),
    );
    if config.pull_mode {
        engine = engine.with_pull_source(query.clone());
    }
    if let Some(path) = history {
        info!(path = %path, "Score history enabled");
        engine = engine.with_history(path);
    }
    let engine = Arc::new(engine);
    let monitor = Arc::new(InactivityMonitor::new(&config, query, metrics.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let engine_task = {
        let engine = engine.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { engine.run(rx).await })
    };
    let monitor_task = {
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { monitor.run(rx).await })
    };
    let server_task = tokio::spawn(server::serve(
        config.metrics_port,
        metrics.clone(),
        engine.status(),
        shutdown_rx.clone(),
    ));
    let mqtt_task = {
        let mqtt = config.mqtt.clone();
        let engine = engine.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { run_subscriber(&mqtt, engine, rx).await })
    };

    spawn_ctrl_c(shutdown_tx);

    match engine_task.await {
        Ok(Err(e)) => error!(error = %e, "Processing loop failed"),
        Err(e) => error!(error = %e, "Processing loop task panicked"),
        Ok(Ok(())) => {}
    }
    if let Err(e) = monitor_task.await {
        error!(error = %e, "Inactivity task panicked");
    }
    for (name, task) in [("metrics server", server_task), ("mqtt subscriber", mqtt_task)] {
        match task.await {
            Ok(Err(e)) => error!(task = name, error = %e, "Worker failed"),
            Err(e) => error!(task = name, error = %e, "Worker panicked"),
            Ok(Ok(())) => {}
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Polls the hydrology API on the configured interval and publishes each
/// reading to the broker.
#[tracing::instrument(skip(config))]
async fn collect(config: EngineConfig, rounds: usize) -> Result<()> {
    let manifest = serde_json::to_vec(&build_manifest(
        &config.stations,
        &config.parameters,
        MANIFEST_DATA_INTERVAL,
    ))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (publisher, driver) = MqttPublisher::connect(&config.mqtt, Some(manifest), shutdown_rx.clone());

    let collector = Collector::new(
        &config,
        Arc::new(HydrologyClient::new(
            &config.collector.base_url,
            config.request_timeout(),
        )?),
        Arc::new(publisher),
    );

    let ctrl_c = shutdown_tx.clone();
    spawn_ctrl_c(ctrl_c);

    collector.run(rounds, shutdown_rx).await;

    let _ = shutdown_tx.send(true);
    if let Err(e) = driver.await {
        error!(error = %e, "MQTT publisher task panicked");
    }
    Ok(())
}

/// Reads a payload file from a local path or fetches it over HTTP.
#[tracing::instrument]
async fn fetcher(source: &str, timeout: Duration) -> Result<Vec<u8>> {
    let bytes = if source.starts_with("http") {
        let client = BasicClient::with_request_timeout(timeout)?;
        fetch_bytes(&client, source).await?
    } else {
        std::fs::read(source).with_context(|| format!("reading {source}"))?
    };
    Ok(bytes)
}

/// Runs every payload in `source` through ingestion and one scoring cycle.
#[tracing::instrument(skip(config, output))]
async fn score_file(config: &EngineConfig, source: &str, output: Option<String>) -> Result<()> {
    let bytes = fetcher(source, config.request_timeout()).await?;
    let payloads: Vec<serde_json::Value> =
        serde_json::from_slice(&bytes).context("expected a JSON array of reading payloads")?;

    let metrics = Arc::new(MemoryMetrics::new());
    let mut engine = ProcessingLoop::new(
        config,
        Arc::new(StationStateStore::new()),
        Arc::new(CountTrigger::new(payloads.len().max(1))),
        metrics.clone(),
    );
    if let Some(path) = output {
        engine = engine.with_history(path);
    }

    let mut accepted = 0;
    for payload in &payloads {
        if engine.ingest_payload(source, &serde_json::to_vec(payload)?) {
            accepted += 1;
        }
    }
    info!(payloads = payloads.len(), accepted, "Payloads ingested");

    let report = engine.run_cycle().await;
    for score in &report.scores {
        info!(
            station = %score.station_id(),
            score = score.rounded_score(),
            band = %score.band(),
            observed = score.observed(),
            "Station score"
        );
    }
    for station in &report.failed {
        error!(station = %station, "Station could not be scored");
    }
    print_json(&report.scores)?;

    Ok(())
}
