//! HTTP fetching behind the [`HttpClient`] seam.

mod basic;
mod client;

pub use basic::BasicClient;
pub use client::HttpClient;

use anyhow::{Context, Result, bail};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::warn;

/// Used when a 429 response carries no usable `Retry-After`.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(30);

fn get(url: &str) -> Result<reqwest::Request> {
    Ok(reqwest::Request::new(reqwest::Method::GET, url.parse()?))
}

fn retry_after(resp: &reqwest::Response) -> Duration {
    resp.headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

pub async fn fetch_bytes<C: HttpClient + ?Sized>(client: &C, url: &str) -> Result<Vec<u8>> {
    let resp = client.execute(get(url)?).await?;
    Ok(resp.bytes().await?.to_vec())
}

/// GETs `url` and decodes the JSON body.
///
/// A `429 Too Many Requests` is retried once after the delay the server
/// asks for; any other non-success status is an error.
pub async fn fetch_json<T, C>(client: &C, url: &str) -> Result<T>
where
    T: DeserializeOwned,
    C: HttpClient + ?Sized,
{
    let mut resp = client.execute(get(url)?).await?;

    if resp.status() == StatusCode::TOO_MANY_REQUESTS {
        let wait = retry_after(&resp);
        warn!(url, wait_secs = wait.as_secs(), "Rate limited, retrying once");
        tokio::time::sleep(wait).await;
        resp = client.execute(get(url)?).await?;
    }

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        bail!("GET {url} returned status {status}: {body}");
    }

    resp.json::<T>()
        .await
        .with_context(|| format!("decoding JSON from {url}"))
}
