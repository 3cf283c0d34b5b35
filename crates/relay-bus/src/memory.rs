//! In-process bus for single-instance deployments and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::warn;

use crate::{BusError, BusSubscription, MessageBus};

const CHANNEL_CAPACITY: usize = 1024;

/// Broadcast-backed bus. `set_available(false)` simulates an outage: every
/// open subscription closes and publish/subscribe fail until restored.
pub struct MemoryBus {
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    available: AtomicBool,
    published: AtomicUsize,
    subscriptions: AtomicUsize,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            published: AtomicUsize::new(0),
            subscriptions: AtomicUsize::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if !available {
            // Dropping the senders closes every receiver.
            self.channels.lock().clear();
        }
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Payloads accepted by `publish`.
    pub fn published_count(&self) -> usize {
        self.published.load(Ordering::SeqCst)
    }

    /// Successful `subscribe` calls over the bus lifetime.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    fn ensure_available(&self) -> Result<(), BusError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(BusError::Connection("memory bus unavailable".into()))
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    fn name(&self) -> &str {
        "memory"
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError> {
        self.ensure_available()
            .map_err(|e| BusError::Publish(e.to_string()))?;
        let sender = self.channels.lock().get(channel).cloned();
        if let Some(sender) = sender {
            // No receivers is not an error, same as a pub/sub server.
            let _ = sender.send(payload.to_owned());
        }
        self.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn BusSubscription>, BusError> {
        self.ensure_available()
            .map_err(|e| BusError::Subscribe(e.to_string()))?;
        let rx = self
            .channels
            .lock()
            .entry(channel.to_owned())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySubscription { rx }))
    }

    async fn ping(&self) -> Result<(), BusError> {
        self.ensure_available()
    }
}

struct MemorySubscription {
    rx: broadcast::Receiver<String>,
}

#[async_trait]
impl BusSubscription for MemorySubscription {
    async fn next_payload(&mut self) -> Result<String, BusError> {
        loop {
            match self.rx.recv().await {
                Ok(payload) => return Ok(payload),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "memory bus subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(BusError::Closed),
            }
        }
    }
}
