//! Static configuration: parameter specs, stations, trigger strategy and
//! collaborator endpoints.
//!
//! Loaded from a JSON file when one is given, otherwise the built-in
//! defaults describe the Thames deployment. Either way the result goes
//! through [`EngineConfig::validate`] before any worker starts.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{EngineError, Result};

const WEIGHT_TOLERANCE: f64 = 1e-6;

/// Acceptable range and weight for one measured parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub range: (f64, f64),
    pub weight: f64,
    /// Measure suffix on the hydrology API, e.g. `-ph-i-subdaily`.
    #[serde(default)]
    pub source_suffix: Option<String>,
}

impl ParameterSpec {
    pub fn new(name: &str, low: f64, high: f64, weight: f64, suffix: &str) -> Self {
        Self {
            name: name.to_string(),
            range: (low, high),
            weight,
            source_suffix: Some(suffix.to_string()),
        }
    }

    pub fn low(&self) -> f64 {
        self.range.0
    }

    pub fn high(&self) -> f64 {
        self.range.1
    }
}

/// A monitoring station, with coordinates when they are known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationSpec {
    pub id: String,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
}

impl StationSpec {
    fn located(id: &str, latitude: f64, longitude: f64) -> Self {
        Self {
            id: id.to_string(),
            latitude: Some(latitude),
            longitude: Some(longitude),
        }
    }

    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            latitude: None,
            longitude: None,
        }
    }
}

/// Which completion strategy decides when a window is scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum TriggerConfig {
    Count { threshold: usize },
    Quiescence { idle_seconds: u64 },
    Periodic { interval_seconds: u64 },
}

impl Default for TriggerConfig {
    fn default() -> Self {
        TriggerConfig::Quiescence { idle_seconds: 40 }
    }
}

impl FromStr for TriggerConfig {
    type Err = EngineError;

    /// Parses `count:48`, `quiescence:40` or `periodic:1080`.
    fn from_str(s: &str) -> Result<Self> {
        let (kind, value) = s.split_once(':').ok_or_else(|| {
            EngineError::Configuration(format!("trigger '{s}' must look like <strategy>:<value>"))
        })?;
        let value: u64 = value.trim().parse().map_err(|_| {
            EngineError::Configuration(format!("trigger value '{value}' is not an integer"))
        })?;

        match kind.trim().to_ascii_lowercase().as_str() {
            "count" => Ok(TriggerConfig::Count {
                threshold: value as usize,
            }),
            "quiescence" | "idle" => Ok(TriggerConfig::Quiescence {
                idle_seconds: value,
            }),
            "periodic" | "interval" => Ok(TriggerConfig::Periodic {
                interval_seconds: value,
            }),
            other => Err(EngineError::Configuration(format!(
                "unknown trigger strategy '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InactivityConfig {
    pub threshold_minutes: u64,
    pub poll_interval_seconds: u64,
}

impl Default for InactivityConfig {
    fn default() -> Self {
        Self {
            threshold_minutes: 20,
            poll_interval_seconds: 10,
        }
    }
}

impl InactivityConfig {
    pub fn threshold(&self) -> Duration {
        Duration::from_secs(self.threshold_minutes * 60)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub topic_root: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "broker.hivemq.com".to_string(),
            port: 1883,
            client_id: "water-quality-rater".to_string(),
            topic_root: "/thames".to_string(),
        }
    }
}

/// Environment Agency hydrology measures endpoint.
pub const DEFAULT_HYDROLOGY_URL: &str = "https://environment.data.gov.uk/hydrology/id/measures";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorConfig {
    pub base_url: String,
    pub interval_seconds: u64,
    pub concurrency: usize,
    pub publish_pause_millis: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_HYDROLOGY_URL.to_string(),
            interval_seconds: 1080,
            concurrency: 8,
            publish_pause_millis: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub parameters: Vec<ParameterSpec>,
    pub stations: Vec<StationSpec>,
    pub trigger: TriggerConfig,
    pub inactivity: InactivityConfig,
    pub mqtt: MqttConfig,
    pub collector: CollectorConfig,
    pub prometheus_url: String,
    /// Upper bound for any single upstream HTTP request.
    pub request_timeout_seconds: u64,
    pub metrics_port: u16,
    /// Pull current readings from the time-series collaborator each cycle.
    pub pull_mode: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parameters: default_parameters(),
            stations: default_stations(),
            trigger: TriggerConfig::default(),
            inactivity: InactivityConfig::default(),
            mqtt: MqttConfig::default(),
            collector: CollectorConfig::default(),
            prometheus_url: "http://localhost:9090".to_string(),
            request_timeout_seconds: 10,
            metrics_port: 8000,
            pull_mode: false,
        }
    }
}

impl EngineConfig {
    /// Loads a config from a JSON file at `path`. Missing sections fall back
    /// to the defaults.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn parameter_names(&self) -> impl Iterator<Item = &str> {
        self.parameters.iter().map(|p| p.name.as_str())
    }

    pub fn station_ids(&self) -> impl Iterator<Item = &str> {
        self.stations.iter().map(|s| s.id.as_str())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    /// Rejects configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        validate_parameters(&self.parameters)?;

        if self.stations.is_empty() {
            return Err(EngineError::Configuration("station list is empty".into()));
        }
        let mut seen = HashSet::new();
        for station in &self.stations {
            if !seen.insert(station.id.as_str()) {
                return Err(EngineError::Configuration(format!(
                    "station '{}' is listed twice",
                    station.id
                )));
            }
        }

        let zero_trigger = match self.trigger {
            TriggerConfig::Count { threshold } => threshold == 0,
            TriggerConfig::Quiescence { idle_seconds } => idle_seconds == 0,
            TriggerConfig::Periodic { interval_seconds } => interval_seconds == 0,
        };
        if zero_trigger {
            return Err(EngineError::Configuration(format!(
                "trigger parameter must be positive: {:?}",
                self.trigger
            )));
        }

        if self.inactivity.threshold_minutes == 0 || self.inactivity.poll_interval_seconds == 0 {
            return Err(EngineError::Configuration(
                "inactivity threshold and poll interval must be positive".into(),
            ));
        }
        if self.request_timeout_seconds == 0 {
            return Err(EngineError::Configuration(
                "request timeout must be positive".into(),
            ));
        }

        Ok(())
    }
}

/// Checks the parameter table on its own; also used by the offline scorer.
pub fn validate_parameters(parameters: &[ParameterSpec]) -> Result<()> {
    if parameters.is_empty() {
        return Err(EngineError::Configuration("parameter list is empty".into()));
    }

    let mut names = HashSet::new();
    let mut weight_sum = 0.0;

    for spec in parameters {
        if !names.insert(spec.name.as_str()) {
            return Err(EngineError::Configuration(format!(
                "parameter '{}' is listed twice",
                spec.name
            )));
        }
        if !spec.weight.is_finite() || spec.weight < 0.0 {
            return Err(EngineError::Configuration(format!(
                "parameter '{}' has invalid weight {}",
                spec.name, spec.weight
            )));
        }
        if !(spec.low().is_finite() && spec.high().is_finite()) || spec.low() > spec.high() {
            return Err(EngineError::Configuration(format!(
                "parameter '{}' has invalid range ({}, {})",
                spec.name,
                spec.low(),
                spec.high()
            )));
        }
        weight_sum += spec.weight;
    }

    if (weight_sum - 1.0).abs() > WEIGHT_TOLERANCE {
        return Err(EngineError::Configuration(format!(
            "parameter weights sum to {weight_sum}, expected 1"
        )));
    }

    Ok(())
}

// Weights adapted from the PNQA water-quality index table.
fn default_parameters() -> Vec<ParameterSpec> {
    vec![
        ParameterSpec::new("oxigenio_dissolvido", 5.0, 9.0, 0.27, "-do-i-subdaily-mgL"),
        ParameterSpec::new("turbidez", 0.0, 4.0, 0.12, "-turb-i-subdaily-ntu"),
        ParameterSpec::new("temperatura", 0.0, 30.0, 0.15, "-temp-i-subdaily-C"),
        ParameterSpec::new("condutividade", 70.0, 750.0, 0.12, "-cond-i-subdaily-mS"),
        ParameterSpec::new("amonio", 0.0, 0.5, 0.15, "-amm-i-subdaily-mgL"),
        ParameterSpec::new("ph", 6.5, 9.5, 0.19, "-ph-i-subdaily"),
    ]
}

fn default_stations() -> Vec<StationSpec> {
    vec![
        StationSpec::located("BREPON", 51.479811, -0.303104),
        StationSpec::located("KEWPON", 51.486026, -0.282838),
        StationSpec::new("GPRSD8A"),
        StationSpec::located("HAMME2", 51.489978, -0.234679),
        StationSpec::located("PUTNEY", 51.467276, -0.215313),
        StationSpec::located("CADOG2", 51.482879, -0.166442),
        StationSpec::new("BARIERA"),
        StationSpec::new("ERITH1"),
        StationSpec::new("E03036A"),
    ]
}
