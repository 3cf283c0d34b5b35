use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use crate::{BusError, BusSubscription, MessageBus};

#[derive(Clone, Debug)]
pub struct BusConfig {
    pub host: String,
    pub port: u16,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: "redis".into(),
            port: 6379,
            max_retries: 5,
            retry_delay: Duration::from_secs(5),
        }
    }
}

impl BusConfig {
    pub fn url(&self) -> String {
        format!("redis://{}:{}/", self.host, self.port)
    }
}

/// Redis pub/sub. Publishing goes through a shared auto-reconnecting
/// connection; each subscription owns a dedicated pub/sub connection.
pub struct RedisBus {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisBus {
    pub async fn connect(config: &BusConfig) -> Result<Self, BusError> {
        let client = redis::Client::open(config.url())
            .map_err(|e| BusError::Connection(format!("invalid redis url: {e}")))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        let bus = Self { client, conn };
        bus.ping().await?;
        Ok(bus)
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    fn name(&self) -> &str {
        "redis"
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let receivers: i64 = conn
            .publish(channel, payload)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;
        debug!(channel, receivers, "published to bus");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn BusSubscription>, BusError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;
        Ok(Box::new(RedisSubscription {
            stream: Box::pin(pubsub.into_on_message()),
        }))
    }

    async fn ping(&self) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        Ok(())
    }
}

struct RedisSubscription {
    stream: Pin<Box<dyn Stream<Item = redis::Msg> + Send>>,
}

#[async_trait]
impl BusSubscription for RedisSubscription {
    async fn next_payload(&mut self) -> Result<String, BusError> {
        let msg = self.stream.next().await.ok_or(BusError::Closed)?;
        msg.get_payload::<String>()
            .map_err(|e| BusError::Serialization(e.to_string()))
    }
}

/// Connect to Redis, retrying up to `max_retries` times with a fixed delay.
pub async fn connect_with_retry(config: &BusConfig) -> Result<RedisBus, BusError> {
    let attempts = config.max_retries.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match RedisBus::connect(config).await {
            Ok(bus) => {
                info!(host = %config.host, port = config.port, attempt, "connected to message bus");
                return Ok(bus);
            }
            Err(e) => {
                last_error = e.to_string();
                warn!(attempt, max = attempts, error = %e, "message bus connection failed");
            }
        }
        if attempt < attempts {
            tokio::time::sleep(config.retry_delay).await;
        }
    }

    Err(BusError::Unavailable {
        attempts,
        last_error,
    })
}
