use super::client::HttpClient;
use async_trait::async_trait;
use std::time::Duration;

/// Connect timeout used by [`BasicClient::with_request_timeout`].
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct BasicClient(reqwest::Client);

impl BasicClient {
    pub fn new() -> Self {
        Self(reqwest::Client::new())
    }

    /// Client with request and connect timeouts.
    pub fn with_timeouts(request: Duration, connect: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request)
            .connect_timeout(connect)
            .build()?;
        Ok(Self(client))
    }

    /// Client bounded by `request`, connecting within at most five seconds.
    pub fn with_request_timeout(request: Duration) -> anyhow::Result<Self> {
        Self::with_timeouts(request, request.min(CONNECT_TIMEOUT))
    }
}

impl Default for BasicClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for BasicClient {
    async fn execute(&self, req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        self.0.execute(req).await
    }
}
