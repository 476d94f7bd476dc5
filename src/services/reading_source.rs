//! Trait for upstream providers the collector pulls readings from.

use anyhow::Result;

use crate::config::ParameterSpec;
use crate::parser::Reading;

/// Abstraction over a measurement provider (e.g. the EA hydrology API).
#[async_trait::async_trait]
pub trait ReadingSource: Send + Sync {
    /// Returns the latest readings the provider holds for one station and
    /// parameter. An empty vec means the provider had nothing to report.
    async fn latest_readings(&self, station_id: &str, parameter: &ParameterSpec)
    -> Result<Vec<Reading>>;
}
