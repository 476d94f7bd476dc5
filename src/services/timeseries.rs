//! Trait and types for the persisted time-series query collaborator.

use anyhow::Result;
use chrono::{DateTime, Utc};

/// Most recent persisted observation for one station and parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// Read-only access to the time-series store (e.g. Prometheus).
///
/// Used by the inactivity monitor and by pull-mode cycles.
#[async_trait::async_trait]
pub trait TimeSeriesQuery: Send + Sync {
    /// Returns the latest sample for `(station_id, parameter)`, or `None`
    /// when the store has nothing for that pair.
    async fn most_recent_value(&self, station_id: &str, parameter: &str) -> Result<Option<Sample>>;
}

/// In-memory store, used in tests.
#[derive(Debug, Default)]
pub struct MemorySeries {
    samples: std::sync::Mutex<std::collections::HashMap<(String, String), Sample>>,
    unreachable: std::sync::Mutex<std::collections::HashSet<String>>,
}

impl MemorySeries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, station_id: &str, parameter: &str, sample: Sample) {
        self.samples
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert((station_id.to_string(), parameter.to_string()), sample);
    }

    /// Makes every query for `station_id` fail.
    pub fn make_unreachable(&self, station_id: &str) {
        self.unreachable
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(station_id.to_string());
    }
}

#[async_trait::async_trait]
impl TimeSeriesQuery for MemorySeries {
    async fn most_recent_value(&self, station_id: &str, parameter: &str) -> Result<Option<Sample>> {
        if self
            .unreachable
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(station_id)
        {
            anyhow::bail!("connection refused for station {station_id}");
        }
        Ok(self
            .samples
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&(station_id.to_string(), parameter.to_string()))
            .copied())
    }
}
