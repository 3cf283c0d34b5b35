//! Dual-path delivery: local socket first, then the shared bus.

use std::sync::Arc;

use tracing::{debug, error, warn};

use relay_bus::MessageBus;
use relay_core::{BusEnvelope, InstanceId, MessageDraft, MessageRecord, OutboundFrame};
use relay_store::HistoryStore;
use relay_telemetry::{DELIVERIES_TOTAL, DELIVERY_FAILURES_TOTAL, STORE_WRITE_FAILURES_TOTAL};

use crate::registry::ConnectionRegistry;

pub struct DeliveryEngine {
    registry: Arc<ConnectionRegistry>,
    bus: Option<Arc<dyn MessageBus>>,
    store: Option<HistoryStore>,
    channel: String,
    instance: InstanceId,
}

impl DeliveryEngine {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        bus: Option<Arc<dyn MessageBus>>,
        store: Option<HistoryStore>,
        channel: impl Into<String>,
        instance: InstanceId,
    ) -> Self {
        Self {
            registry,
            bus,
            store,
            channel: channel.into(),
            instance,
        }
    }

    /// Stamp, persist, deliver locally, publish.
    ///
    /// `true` if the direct delivery or the bus publish succeeded.
    pub async fn publish_message(&self, draft: MessageDraft) -> bool {
        let record = draft.stamp();

        self.persist(&record);
        let direct = self.deliver_direct(&record);
        let published = self.publish_to_bus(&record).await;

        if direct {
            metrics::counter!(DELIVERIES_TOTAL, "path" => "direct").increment(1);
        }
        if published {
            metrics::counter!(DELIVERIES_TOTAL, "path" => "bus").increment(1);
        }
        let delivered = direct || published;
        if !delivered {
            metrics::counter!(DELIVERY_FAILURES_TOTAL).increment(1);
            warn!(from = %record.from, to = %record.to, "message neither delivered nor published");
        }
        delivered
    }

    /// Queue the history write without waiting for it.
    fn persist(&self, record: &MessageRecord) {
        let Some(store) = self.store.clone() else {
            debug!("history store absent, skipping persist");
            return;
        };
        let record = record.clone();
        tokio::spawn(async move {
            if let Err(e) = store.append(record).await {
                metrics::counter!(STORE_WRITE_FAILURES_TOTAL).increment(1);
                error!(error = %e, "failed to persist message");
            }
        });
    }

    fn deliver_direct(&self, record: &MessageRecord) -> bool {
        let Some(handle) = self.registry.lookup(&record.to) else {
            return false;
        };
        match handle.send(&OutboundFrame::chat(record)) {
            Ok(()) => {
                debug!(to = %record.to, "delivered directly");
                true
            }
            Err(e) => {
                warn!(to = %record.to, error = %e, "direct delivery failed");
                self.registry.evict(&record.to, &handle);
                false
            }
        }
    }

    async fn publish_to_bus(&self, record: &MessageRecord) -> bool {
        let Some(bus) = &self.bus else {
            return false;
        };
        let payload = match BusEnvelope::from_record(record, &self.instance).to_json() {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "failed to encode bus envelope");
                return false;
            }
        };
        match bus.publish(&self.channel, &payload).await {
            Ok(()) => true,
            Err(e) => {
                error!(channel = %self.channel, error = %e, "bus publish failed");
                false
            }
        }
    }
}
