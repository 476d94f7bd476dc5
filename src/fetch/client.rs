use async_trait::async_trait;
use reqwest::{Request, Response};

/// Executes prepared requests; lets collectors and query clients share
/// one connection pool and be swapped in tests.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, req: Request) -> reqwest::Result<Response>;
}
