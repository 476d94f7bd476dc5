//! Trait for the outbound side of the pub/sub transport.

use anyhow::Result;

#[async_trait::async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
}
