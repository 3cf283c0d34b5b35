//! Bus listener: receives relayed messages for users connected to this process.
//!
//! A supervisor task owns the subscription lifecycle. The per-subscription
//! read loop runs as its own task so a panic there is observed as a
//! `JoinError` and the loop is rebuilt.
//!
//! ```text
//! Uninitialized --subscribed--> Subscribed --started--> Listening
//! Uninitialized --subscribe failed--> ReconnectPending --subscribed--> Subscribed
//! Listening --transport lost--> ReconnectPending
//! Listening --faulted--> Crashed --subscribed--> Subscribed
//! *         --cancelled--> Stopped
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use relay_bus::{BusSubscription, MessageBus};
use relay_core::{BusPayload, InstanceId, OutboundFrame};
use relay_telemetry::{BUS_RESUBSCRIBES_TOTAL, DELIVERIES_TOTAL};

use crate::registry::ConnectionRegistry;

const SELF_TEST_TEXT: &str = "Redis connection test";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerState {
    Uninitialized,
    Subscribed,
    Listening,
    ReconnectPending,
    Crashed,
    Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenerEvent {
    Subscribed,
    SubscribeFailed,
    Started,
    /// The read loop recovered in place by resubscribing.
    Resubscribed,
    TransportLost,
    Faulted,
    Cancelled,
}

impl ListenerState {
    /// Transition function. Events that do not apply leave the state unchanged.
    pub fn on(self, event: ListenerEvent) -> Self {
        use ListenerEvent as E;
        use ListenerState as S;
        match (self, event) {
            (S::Stopped, _) => S::Stopped,
            (_, E::Cancelled) => S::Stopped,
            (S::Uninitialized | S::ReconnectPending | S::Crashed, E::Subscribed) => S::Subscribed,
            (S::Uninitialized | S::ReconnectPending | S::Crashed, E::SubscribeFailed) => {
                S::ReconnectPending
            }
            (S::Subscribed, E::Started) => S::Listening,
            (S::Listening, E::Resubscribed) => S::Listening,
            (S::Listening, E::TransportLost) => S::ReconnectPending,
            (S::Subscribed | S::Listening, E::Faulted) => S::Crashed,
            (state, _) => state,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Subscribed => "subscribed",
            Self::Listening => "listening",
            Self::ReconnectPending => "reconnect_pending",
            Self::Crashed => "crashed",
            Self::Stopped => "stopped",
        }
    }
}

/// What happened to one bus payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayOutcome {
    Undecodable,
    SkippedSystem,
    SkippedOwnOrigin,
    SkippedLocalSender,
    NoLocalRecipient,
    Delivered,
    DeliveryFailed,
}

#[derive(Clone, Debug)]
pub struct ListenerConfig {
    pub channel: String,
    pub resubscribe_interval: Duration,
    pub error_backoff: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            channel: "chat_messages".into(),
            resubscribe_interval: Duration::from_secs(10),
            error_backoff: Duration::from_secs(1),
        }
    }
}

enum ListenExit {
    Cancelled,
    TransportLost,
}

pub struct BusListener {
    bus: Arc<dyn MessageBus>,
    registry: Arc<ConnectionRegistry>,
    instance: InstanceId,
    config: ListenerConfig,
    state: watch::Sender<ListenerState>,
}

impl BusListener {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        registry: Arc<ConnectionRegistry>,
        instance: InstanceId,
        config: ListenerConfig,
    ) -> Self {
        let (state, _) = watch::channel(ListenerState::Uninitialized);
        Self {
            bus,
            registry,
            instance,
            config,
            state,
        }
    }

    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ListenerState> {
        self.state.subscribe()
    }

    fn apply(&self, event: ListenerEvent) {
        self.state.send_modify(|state| {
            let next = state.on(event);
            if next != *state {
                debug!(from = state.as_str(), to = next.as_str(), ?event, "listener transition");
            }
            *state = next;
        });
    }

    /// Start the supervisor. It runs until `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.supervise(cancel))
    }

    async fn supervise(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let subscribed = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                r = self.bus.subscribe(&self.config.channel) => r,
            };

            let wait = match subscribed {
                Ok(sub) => {
                    self.apply(ListenerEvent::Subscribed);
                    info!(channel = %self.config.channel, bus = self.bus.name(), "subscribed to bus");
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        () = self.publish_self_test() => {}
                    }
                    self.apply(ListenerEvent::Started);

                    let worker = tokio::spawn(Arc::clone(&self).listen(sub, cancel.clone()));
                    match worker.await {
                        Ok(ListenExit::Cancelled) => break,
                        Ok(ListenExit::TransportLost) => {
                            self.apply(ListenerEvent::TransportLost);
                            self.config.resubscribe_interval
                        }
                        Err(e) if e.is_panic() => {
                            error!(error = %e, "bus listener loop crashed, restarting");
                            self.apply(ListenerEvent::Faulted);
                            self.config.error_backoff
                        }
                        Err(e) => {
                            warn!(error = %e, "bus listener loop aborted");
                            break;
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        channel = %self.config.channel,
                        error = %e,
                        retry_in_secs = self.config.resubscribe_interval.as_secs(),
                        "bus subscribe failed"
                    );
                    self.apply(ListenerEvent::SubscribeFailed);
                    self.config.resubscribe_interval
                }
            };

            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(wait) => {}
            }
            metrics::counter!(BUS_RESUBSCRIBES_TOTAL).increment(1);
        }

        self.apply(ListenerEvent::Cancelled);
        info!("bus listener stopped");
    }

    async fn publish_self_test(&self) {
        let notice = BusPayload::system_self_test(SELF_TEST_TEXT);
        if let Err(e) = self.bus.publish(&self.config.channel, &notice).await {
            warn!(error = %e, "bus self-test publish failed");
        }
    }

    async fn listen(
        self: Arc<Self>,
        mut sub: Box<dyn BusSubscription>,
        cancel: CancellationToken,
    ) -> ListenExit {
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return ListenExit::Cancelled,
                next = sub.next_payload() => next,
            };

            match next {
                Ok(payload) => {
                    self.relay(&payload);
                }
                Err(e) if !e.is_transport() => {
                    warn!(error = %e, "dropping undecodable bus message");
                }
                Err(e) => {
                    error!(error = %e, "bus read failed, resubscribing");
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return ListenExit::Cancelled,
                        () = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                    metrics::counter!(BUS_RESUBSCRIBES_TOTAL).increment(1);
                    let resubscribed = tokio::select! {
                        biased;
                        () = cancel.cancelled() => return ListenExit::Cancelled,
                        r = self.bus.subscribe(&self.config.channel) => r,
                    };
                    match resubscribed {
                        Ok(fresh) => {
                            sub = fresh;
                            self.apply(ListenerEvent::Resubscribed);
                            info!(channel = %self.config.channel, "resubscribed to bus");
                        }
                        Err(e) => {
                            error!(error = %e, "resubscribe failed, deferring to supervisor");
                            return ListenExit::TransportLost;
                        }
                    }
                }
            }
        }
    }

    /// Deliver one bus payload to a locally registered recipient, if any.
    pub fn relay(&self, payload: &str) -> RelayOutcome {
        let envelope = match BusPayload::decode(payload) {
            Ok(BusPayload::System { text }) => {
                debug!(text = %text, "skipping system bus message");
                return RelayOutcome::SkippedSystem;
            }
            Ok(BusPayload::Chat(envelope)) => envelope,
            Err(e) => {
                warn!(error = %e, "undecodable bus payload");
                return RelayOutcome::Undecodable;
            }
        };

        if envelope.is_from(&self.instance) {
            return RelayOutcome::SkippedOwnOrigin;
        }
        if envelope.origin.is_none() && self.registry.contains(&envelope.from) {
            return RelayOutcome::SkippedLocalSender;
        }

        let record = envelope.into_record();
        let Some(handle) = self.registry.lookup(&record.to) else {
            return RelayOutcome::NoLocalRecipient;
        };
        match handle.send(&OutboundFrame::chat(&record)) {
            Ok(()) => {
                metrics::counter!(DELIVERIES_TOTAL, "path" => "relayed").increment(1);
                debug!(from = %record.from, to = %record.to, "relayed bus message");
                RelayOutcome::Delivered
            }
            Err(e) => {
                warn!(to = %record.to, error = %e, "relay delivery failed");
                self.registry.evict(&record.to, &handle);
                RelayOutcome::DeliveryFailed
            }
        }
    }
}
