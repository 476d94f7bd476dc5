use anyhow::{Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use std::collections::HashMap;

use crate::fetch::{BasicClient, HttpClient, fetch_json};
use crate::parser::parse_timestamp;
use crate::services::timeseries::{Sample, TimeSeriesQuery};

/// Gauge the engine republishes raw readings under.
const READING_METRIC: &str = "water_quality_reading";

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(default)]
    result: Vec<VectorSample>,
}

#[derive(Debug, Deserialize)]
struct VectorSample {
    metric: HashMap<String, String>,
    /// `[unix_seconds, "value"]`
    value: (f64, String),
}

/// Reads the latest republished reading for a pair from the Prometheus
/// HTTP API.
pub struct PrometheusQueryClient<C: HttpClient = BasicClient> {
    base_url: String,
    http: C,
}

impl PrometheusQueryClient<BasicClient> {
    /// Client whose requests give up after `timeout`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self::with_client(
            base_url,
            BasicClient::with_request_timeout(timeout)?,
        ))
    }
}

impl<C: HttpClient> PrometheusQueryClient<C> {
    pub fn with_client(base_url: &str, http: C) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        }
    }

    fn query_url(&self, station_id: &str, parameter: &str) -> Result<String> {
        let selector = format!(r#"{READING_METRIC}{{station="{station_id}",parameter="{parameter}"}}"#);
        let url = reqwest::Url::parse_with_params(
            &format!("{}/api/v1/query", self.base_url),
            &[("query", selector.as_str())],
        )?;
        Ok(url.to_string())
    }
}

/// Picks the series whose `timestamp` label is the most recent.
fn latest_sample(data: QueryData) -> Option<Sample> {
    data.result
        .into_iter()
        .filter_map(|series| {
            let timestamp = parse_timestamp(series.metric.get("timestamp")?)?;
            let value = series.value.1.parse::<f64>().ok()?;
            Some(Sample { value, timestamp })
        })
        .max_by_key(|sample| sample.timestamp)
}

#[async_trait]
impl<C: HttpClient> TimeSeriesQuery for PrometheusQueryClient<C> {
    async fn most_recent_value(&self, station_id: &str, parameter: &str) -> Result<Option<Sample>> {
        let url = self.query_url(station_id, parameter)?;
        let response: QueryResponse = fetch_json(&self.http, &url).await?;

        if response.status != "success" {
            bail!(
                "query for {station_id}/{parameter} failed: {}",
                response.error.unwrap_or(response.status)
            );
        }

        Ok(response.data.and_then(latest_sample))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_latest_sample_uses_timestamp_label() {
        let body = r#"{
            "status": "success",
            "data": {
                "resultType": "vector",
                "result": [
                    {"metric": {"station": "BREPON", "parameter": "ph", "timestamp": "2024-10-01T12:00:00+00:00"}, "value": [1727784000.0, "7.1"]},
                    {"metric": {"station": "BREPON", "parameter": "ph", "timestamp": "2024-10-01T12:15:00+00:00"}, "value": [1727784000.0, "7.4"]},
                    {"metric": {"station": "BREPON", "parameter": "ph"}, "value": [1727784000.0, "9.9"]}
                ]
            }
        }"#;
        let response: QueryResponse = serde_json::from_str(body).unwrap();
        let sample = latest_sample(response.data.unwrap()).unwrap();

        assert_eq!(sample.value, 7.4);
        assert_eq!(
            sample.timestamp,
            Utc.with_ymd_and_hms(2024, 10, 1, 12, 15, 0).unwrap()
        );
    }

    #[test]
    fn test_empty_result_is_none() {
        let response: QueryResponse =
            serde_json::from_str(r#"{"status":"success","data":{"resultType":"vector","result":[]}}"#)
                .unwrap();
        assert!(latest_sample(response.data.unwrap()).is_none());
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept connections and never answer.
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let client =
            PrometheusQueryClient::new(&format!("http://{addr}"), Duration::from_millis(200)).unwrap();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            client.most_recent_value("BREPON", "ph"),
        )
        .await
        .expect("request should give up on its own");
        assert!(result.is_err());
    }

    #[test]
    fn test_query_url_encodes_selector() {
        let client =
            PrometheusQueryClient::new("http://localhost:9090/", Duration::from_secs(10)).unwrap();
        let url = client.query_url("BREPON", "ph").unwrap();
        assert!(url.starts_with("http://localhost:9090/api/v1/query?query="));
        assert!(url.contains("water_quality_reading"));
        assert!(!url.contains('"'));
    }
}
