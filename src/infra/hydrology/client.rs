use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::config::ParameterSpec;
use crate::fetch::{BasicClient, HttpClient, fetch_json};
use crate::parser::{Reading, parse_timestamp};
use crate::services::reading_source::ReadingSource;

#[derive(Debug, Deserialize)]
struct ReadingsResponse {
    #[serde(default)]
    items: Vec<ReadingItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadingItem {
    value: Option<f64>,
    date_time: Option<String>,
}

/// Client for the Environment Agency hydrology readings API.
pub struct HydrologyClient<C: HttpClient = BasicClient> {
    base_url: String,
    http: C,
}

impl HydrologyClient<BasicClient> {
    /// Client whose requests give up after `timeout`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self::with_client(
            base_url,
            BasicClient::with_request_timeout(timeout)?,
        ))
    }
}

impl<C: HttpClient> HydrologyClient<C> {
    pub fn with_client(base_url: &str, http: C) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        }
    }

    /// `{base}/{station}{suffix}/readings.json?latest`
    fn readings_url(&self, station_id: &str, suffix: &str) -> String {
        format!("{}/{station_id}{suffix}/readings.json?latest", self.base_url)
    }
}

fn to_readings(station_id: &str, parameter: &str, response: ReadingsResponse) -> Vec<Reading> {
    response
        .items
        .into_iter()
        .filter_map(|item| {
            let value = item.value?;
            let timestamp = item.date_time.as_deref().and_then(parse_timestamp);
            match timestamp {
                Some(ts) => Some(Reading::new(station_id, parameter, value, ts)),
                None => {
                    debug!(station = %station_id, parameter, raw = ?item.date_time, "Skipping item without a usable dateTime");
                    None
                }
            }
        })
        .collect()
}

#[async_trait]
impl<C: HttpClient> ReadingSource for HydrologyClient<C> {
    async fn latest_readings(
        &self,
        station_id: &str,
        parameter: &ParameterSpec,
    ) -> Result<Vec<Reading>> {
        let suffix = parameter
            .source_suffix
            .as_deref()
            .ok_or_else(|| anyhow!("parameter '{}' has no source suffix", parameter.name))?;

        let url = self.readings_url(station_id, suffix);
        let response: ReadingsResponse = fetch_json(&self.http, &url).await?;

        Ok(to_readings(station_id, &parameter.name, response))
    }
}
