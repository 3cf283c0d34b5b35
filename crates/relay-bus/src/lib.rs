//! Publish/subscribe transport shared by relay instances.

pub mod error;
pub mod memory;
pub mod redis_bus;

pub use error::BusError;
pub use memory::MemoryBus;
pub use redis_bus::{connect_with_retry, BusConfig, RedisBus};

use async_trait::async_trait;

/// A channel-addressed broadcast transport.
#[async_trait]
pub trait MessageBus: Send + Sync {
    fn name(&self) -> &str;

    /// Publish `payload` to every current subscriber of `channel`.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError>;

    /// Open a dedicated subscription to `channel`.
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn BusSubscription>, BusError>;

    async fn ping(&self) -> Result<(), BusError>;
}

#[async_trait]
pub trait BusSubscription: Send {
    /// Wait for the next payload.
    ///
    /// Control traffic (subscribe confirmations) is never surfaced. A transport
    /// error means the subscription is dead; see [`BusError::is_transport`].
    async fn next_payload(&mut self) -> Result<String, BusError>;
}
