use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relay_core::{FrameError, InboundFrame, OutboundFrame};
use relay_telemetry::{CONNECTIONS_TOTAL, MESSAGES_RECEIVED_TOTAL};

use crate::delivery::DeliveryEngine;
use crate::registry::{ConnectionHandle, ConnectionRegistry, SendError};
use crate::settings::PresenceSettings;

/// What a session needs from the rest of the process.
#[derive(Clone)]
pub struct SessionContext {
    pub registry: Arc<ConnectionRegistry>,
    pub engine: Arc<DeliveryEngine>,
    pub presence: Arc<PresenceSettings>,
    pub max_send_queue: usize,
    pub heartbeat_interval: Duration,
    pub shutdown: CancellationToken,
}

impl SessionContext {
    /// Best-effort notice to the designated counterpart of `user_id`.
    fn notify_counterpart(&self, user_id: &str, frame: &OutboundFrame) {
        let Some(counterpart) = self.presence.counterpart_of(user_id) else {
            return;
        };
        match self.registry.send_to(counterpart, frame) {
            Ok(()) | Err(SendError::NotRegistered) => {}
            Err(e) => warn!(user_id, counterpart, error = %e, "presence notice failed"),
        }
    }
}

/// Drive one WebSocket from handshake to teardown.
pub async fn run_session(socket: WebSocket, user_id: String, ctx: SessionContext) {
    let (tx, rx) = mpsc::channel(ctx.max_send_queue);
    let cancel = ctx.shutdown.child_token();
    let handle = ConnectionHandle::new(tx, cancel.clone());
    let conn_id = handle.id().clone();

    if let Some(prior) = ctx.registry.register(&user_id, handle.clone()) {
        info!(user_id, superseded = %prior.id(), "reconnect supersedes prior session");
        prior.supersede();
    }
    metrics::counter!(CONNECTIONS_TOTAL).increment(1);
    info!(user_id, conn_id = %conn_id, "user connected");

    if let Err(e) = handle.send(&OutboundFrame::welcome(&user_id)) {
        warn!(user_id, error = %e, "welcome send failed");
    }
    ctx.notify_counterpart(&user_id, &OutboundFrame::user_online(&user_id));

    let (ws_tx, mut ws_rx) = socket.split();
    let writer = tokio::spawn(write_loop(
        ws_tx,
        rx,
        cancel.clone(),
        ctx.heartbeat_interval,
    ));

    loop {
        let msg = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            msg = ws_rx.next() => msg,
        };
        match msg {
            Some(Ok(WsMessage::Text(text))) => {
                handle_frame(&ctx, &user_id, &handle, text.as_str()).await;
            }
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Ok(WsMessage::Binary(_))) => {
                warn!(user_id, "ignoring binary frame");
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!(user_id, error = %e, "websocket read failed");
                break;
            }
        }
    }

    cancel.cancel();
    let _ = writer.await;
    finish_session(&ctx, &user_id, &handle);
}

/// Teardown after the socket is gone. Returns whether the offline notice went out.
///
/// Only a session replaced by a reconnect stays silent; evicted sessions
/// were already removed from the registry but still announce.
fn finish_session(ctx: &SessionContext, user_id: &str, handle: &ConnectionHandle) -> bool {
    ctx.registry.unregister_connection(user_id, handle.id());
    if handle.is_superseded() || ctx.registry.contains(user_id) {
        debug!(user_id, conn_id = %handle.id(), "superseded session closed");
        return false;
    }
    info!(user_id, conn_id = %handle.id(), "user disconnected");
    ctx.notify_counterpart(user_id, &OutboundFrame::user_offline(user_id));
    true
}

/// Classify and act on one inbound text frame.
pub async fn handle_frame(
    ctx: &SessionContext,
    user_id: &str,
    handle: &ConnectionHandle,
    raw: &str,
) {
    let chat = match InboundFrame::classify(raw) {
        Ok(InboundFrame::Ping) => {
            if let Err(e) = handle.send(&OutboundFrame::pong()) {
                warn!(user_id, error = %e, "pong send failed");
            }
            return;
        }
        Ok(InboundFrame::Chat(chat)) => chat,
        Err(FrameError::MissingField(field)) => {
            warn!(user_id, field, "invalid message format");
            return;
        }
        Err(e) => {
            warn!(user_id, error = %e, "malformed frame");
            return;
        }
    };

    metrics::counter!(MESSAGES_RECEIVED_TOTAL).increment(1);
    let recipient = chat.to.clone();
    let recipient_connected = ctx.registry.contains(&recipient);
    if !recipient_connected {
        if let Err(e) = handle.send(&OutboundFrame::recipient_offline(&recipient)) {
            warn!(user_id, error = %e, "offline advisory send failed");
        }
    }

    let delivered = ctx.engine.publish_message(chat.into_draft(user_id)).await;
    if !delivered && recipient_connected {
        if let Err(e) = handle.send(&OutboundFrame::delivery_failed(&recipient)) {
            warn!(user_id, error = %e, "failure advisory send failed");
        }
    }
}

/// Forward queued frames to the socket and ping on an interval.
async fn write_loop<S>(
    mut ws_tx: S,
    mut rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
    heartbeat: Duration,
) where
    S: Sink<WsMessage> + Unpin,
{
    let mut ping_interval = tokio::time::interval(heartbeat);
    ping_interval.tick().await;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(text) => {
                    if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = ping_interval.tick() => {
                if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    // Flush what was queued before shutdown, e.g. a final notice.
    while let Ok(text) = rx.try_recv() {
        if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
            break;
        }
    }
    let _ = ws_tx.send(WsMessage::Close(None)).await;
    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_bus::MemoryBus;
    use relay_core::InstanceId;
    use relay_store::HistoryStore;

    struct Harness {
        ctx: SessionContext,
        store: HistoryStore,
    }

    fn harness(with_bus: bool) -> Harness {
        let registry = Arc::new(ConnectionRegistry::new());
        let store = HistoryStore::in_memory().unwrap();
        let bus: Option<Arc<dyn relay_bus::MessageBus>> = if with_bus {
            Some(Arc::new(MemoryBus::new()))
        } else {
            None
        };
        let engine = Arc::new(DeliveryEngine::new(
            Arc::clone(&registry),
            bus,
            Some(store.clone()),
            "chat",
            InstanceId::new(),
        ));
        Harness {
            ctx: SessionContext {
                registry,
                engine,
                presence: Arc::new(PresenceSettings::default()),
                max_send_queue: 8,
                heartbeat_interval: Duration::from_secs(30),
                shutdown: CancellationToken::new(),
            },
            store,
        }
    }

    fn connect(ctx: &SessionContext, user: &str) -> (ConnectionHandle, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(8);
        let handle = ConnectionHandle::new(tx, CancellationToken::new());
        ctx.registry.register(user, handle.clone());
        (handle, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(text) = rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn ping_gets_exactly_one_pong_and_is_not_stored() {
        let h = harness(true);
        let (a, mut rx) = connect(&h.ctx, "A");
        handle_frame(&h.ctx, "A", &a, r#"{"type":"ping"}"#).await;

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "pong");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.store.history_for("A", 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn chat_to_local_peer_is_delivered_once() {
        let h = harness(true);
        let (a, mut rx_a) = connect(&h.ctx, "A");
        let (_b, mut rx_b) = connect(&h.ctx, "B");

        handle_frame(&h.ctx, "A", &a, r#"{"to":"B","text":"hi","timestamp":"T"}"#).await;

        let got = drain(&mut rx_b);
        assert_eq!(got, vec![serde_json::json!({"from": "A", "text": "hi", "timestamp": "T"})]);
        assert!(drain(&mut rx_a).is_empty());
    }

    #[tokio::test]
    async fn client_cannot_spoof_sender() {
        let h = harness(false);
        let (a, _rx_a) = connect(&h.ctx, "A");
        let (_b, mut rx_b) = connect(&h.ctx, "B");

        handle_frame(&h.ctx, "A", &a, r#"{"from":"mallory","to":"B","text":"hi"}"#).await;
        assert_eq!(drain(&mut rx_b)[0]["from"], "A");
    }

    #[tokio::test]
    async fn offline_recipient_triggers_advisory() {
        let h = harness(true);
        let (a, mut rx_a) = connect(&h.ctx, "A");

        handle_frame(&h.ctx, "A", &a, r#"{"to":"Z","text":"hi"}"#).await;
        let frames = drain(&mut rx_a);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["from"], "system");
        assert!(frames[0]["text"].as_str().unwrap().contains("User Z is not currently online"));
    }

    #[tokio::test]
    async fn failed_delivery_to_connected_recipient_triggers_failure_notice() {
        let h = harness(false);
        let (a, mut rx_a) = connect(&h.ctx, "A");
        let (_b, rx_b) = connect(&h.ctx, "B");
        drop(rx_b);

        handle_frame(&h.ctx, "A", &a, r#"{"to":"B","text":"hi"}"#).await;
        let frames = drain(&mut rx_a);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["text"], "Failed to deliver your message to User B");
    }

    #[tokio::test]
    async fn invalid_frames_are_dropped_without_reply() {
        let h = harness(true);
        let (a, mut rx_a) = connect(&h.ctx, "A");
        let (_b, mut rx_b) = connect(&h.ctx, "B");

        for raw in ["not json", r#"{"to":"B"}"#, r#"{"text":"hi"}"#, "[1]"] {
            handle_frame(&h.ctx, "A", &a, raw).await;
        }
        assert!(drain(&mut rx_a).is_empty());
        assert!(drain(&mut rx_b).is_empty());
        assert!(h.ctx.registry.contains("A"));
    }

    #[tokio::test]
    async fn counterpart_notice_is_best_effort() {
        let h = harness(false);
        let (_b, mut rx_b) = connect(&h.ctx, "B");
        h.ctx.notify_counterpart("A", &OutboundFrame::user_online("A"));
        let frames = drain(&mut rx_b);
        assert_eq!(frames.len(), 1);
        assert!(frames[0]["text"].as_str().unwrap().contains("User A"));

        // C announces to A, who is not connected.
        h.ctx.notify_counterpart("C", &OutboundFrame::user_online("C"));
        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn unmapped_identity_announces_to_a() {
        let h = harness(false);
        let (_a, mut rx_a) = connect(&h.ctx, "A");
        h.ctx.notify_counterpart("C", &OutboundFrame::user_online("C"));
        let frames = drain(&mut rx_a);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["text"], "User C is now online and ready to chat!");
    }

    #[tokio::test]
    async fn evicted_session_still_announces_offline() {
        let h = harness(false);
        let (_a, mut rx_a) = connect(&h.ctx, "A");
        let (b, _rx_b) = connect(&h.ctx, "B");

        h.ctx.registry.evict("B", &b);
        assert!(finish_session(&h.ctx, "B", &b));
        let frames = drain(&mut rx_a);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["text"], "User B has gone offline.");
    }

    #[tokio::test]
    async fn superseded_session_stays_silent() {
        let h = harness(false);
        let (_a, mut rx_a) = connect(&h.ctx, "A");
        let (old, _rx_old) = connect(&h.ctx, "B");
        let (_new, _rx_new) = connect(&h.ctx, "B");
        old.supersede();

        assert!(!finish_session(&h.ctx, "B", &old));
        assert!(drain(&mut rx_a).is_empty());
        assert!(h.ctx.registry.contains("B"));
    }

    #[tokio::test]
    async fn closed_session_announces_and_unregisters() {
        let h = harness(false);
        let (_a, mut rx_a) = connect(&h.ctx, "A");
        let (b, _rx_b) = connect(&h.ctx, "B");

        assert!(finish_session(&h.ctx, "B", &b));
        assert!(!h.ctx.registry.contains("B"));
        assert_eq!(drain(&mut rx_a)[0]["text"], "User B has gone offline.");
    }
}
