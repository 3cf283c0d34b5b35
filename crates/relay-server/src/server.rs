use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use relay_bus::MessageBus;
use relay_core::InstanceId;
use relay_store::HistoryStore;
use relay_telemetry::PrometheusHandle;

use crate::delivery::DeliveryEngine;
use crate::health;
use crate::listener::{BusListener, ListenerConfig, ListenerState};
use crate::registry::ConnectionRegistry;
use crate::session::{self, SessionContext};
use crate::settings::RelaySettings;
use crate::shutdown::ShutdownCoordinator;

/// External dependencies; `None` marks one that failed to connect at startup.
#[derive(Default)]
pub struct RelayDeps {
    pub bus: Option<Arc<dyn MessageBus>>,
    pub store: Option<HistoryStore>,
    pub metrics: Option<PrometheusHandle>,
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub session: SessionContext,
    pub store: Option<HistoryStore>,
    pub listener_state: Option<watch::Receiver<ListenerState>>,
    pub history_limit: u32,
    pub metrics: Option<PrometheusHandle>,
    pub started_at: Instant,
}

impl AppState {
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.session.registry
    }

    fn listener_state(&self) -> Option<ListenerState> {
        self.listener_state.as_ref().map(|rx| *rx.borrow())
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(status_handler))
        .route("/messages/{user_id}", get(messages_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws/{user_id}", get(ws_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Wire the registry, delivery engine and bus listener around `deps`.
///
/// The listener (if any) is spawned and tracked on `shutdown`.
pub fn assemble(
    settings: &RelaySettings,
    deps: RelayDeps,
    shutdown: &ShutdownCoordinator,
) -> (AppState, Option<Arc<BusListener>>) {
    let instance = InstanceId::new();
    let registry = Arc::new(ConnectionRegistry::new());
    let engine = Arc::new(DeliveryEngine::new(
        Arc::clone(&registry),
        deps.bus.clone(),
        deps.store.clone(),
        settings.bus.channel.clone(),
        instance.clone(),
    ));

    let listener = deps.bus.map(|bus| {
        let listener = Arc::new(BusListener::new(
            bus,
            Arc::clone(&registry),
            instance.clone(),
            ListenerConfig {
                channel: settings.bus.channel.clone(),
                resubscribe_interval: settings.bus.resubscribe_interval(),
                error_backoff: settings.bus.error_backoff(),
            },
        ));
        shutdown.track("bus-listener", Arc::clone(&listener).spawn(shutdown.token()));
        listener
    });

    info!(instance = %instance, bus = listener.is_some(), store = deps.store.is_some(), "relay assembled");

    let state = AppState {
        session: SessionContext {
            registry,
            engine,
            presence: Arc::new(settings.presence.clone()),
            max_send_queue: settings.server.max_send_queue,
            heartbeat_interval: settings.server.heartbeat_interval(),
            shutdown: shutdown.token(),
        },
        store: deps.store,
        listener_state: listener.as_ref().map(|l| l.watch_state()),
        history_limit: settings.store.history_limit,
        metrics: deps.metrics,
        started_at: Instant::now(),
    };
    (state, listener)
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub local_addr: SocketAddr,
    pub state: AppState,
    pub listener: Option<Arc<BusListener>>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }
}

/// Bind, assemble and serve until `shutdown` is cancelled.
pub async fn start(
    settings: &RelaySettings,
    deps: RelayDeps,
    shutdown: &ShutdownCoordinator,
) -> Result<ServerHandle, std::io::Error> {
    let (state, listener) = assemble(settings, deps, shutdown);

    let tcp = tokio::net::TcpListener::bind(settings.server.bind_addr()).await?;
    let local_addr = tcp.local_addr()?;
    info!(addr = %local_addr, "relay server started");

    let router = build_router(state.clone());
    let token = shutdown.token();
    shutdown.track(
        "http",
        tokio::spawn(async move {
            if let Err(e) = axum::serve(tcp, router)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                error!(error = %e, "http server failed");
            }
        }),
    );

    Ok(ServerHandle {
        local_addr,
        state,
        listener,
    })
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(user_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let ctx = state.session.clone();
    ws.on_upgrade(move |socket| session::run_session(socket, user_id, ctx))
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(health::status(
        state.started_at,
        state.listener_state(),
        state.store.is_some(),
        state.registry().list_ids().into_iter().collect(),
    ))
}

async fn messages_handler(
    Path(user_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    let Some(store) = &state.store else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "detail": "Database not available" })),
        )
            .into_response();
    };

    match store.history_for(&user_id, state.history_limit).await {
        Ok(messages) => Json(json!({ "messages": messages })).into_response(),
        Err(e) => {
            error!(user_id = %user_id, error = %e, "history query failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "detail": format!("Failed to retrieve message history: {e}") })),
            )
                .into_response()
        }
    }
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => relay_telemetry::render(handle).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use relay_bus::MemoryBus;
    use relay_core::MessageDraft;
    use tower::ServiceExt;

    fn state_with(store: Option<HistoryStore>, bus: bool) -> (AppState, ShutdownCoordinator) {
        let shutdown = ShutdownCoordinator::new();
        let deps = RelayDeps {
            bus: bus.then(|| Arc::new(MemoryBus::new()) as Arc<dyn MessageBus>),
            store,
            metrics: None,
        };
        let (state, _listener) = assemble(&RelaySettings::default(), deps, &shutdown);
        (state, shutdown)
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn status_without_dependencies() {
        let (state, _shutdown) = state_with(None, false);
        let (code, body) = get_json(build_router(state), "/").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["status"], health::STATUS_RUNNING);
        assert_eq!(body["bus_status"], "disconnected");
        assert_eq!(body["store_status"], "disconnected");
        assert_eq!(body["active_users"], json!([]));
        assert!(body["listener_state"].is_null());
    }

    #[tokio::test]
    async fn status_lists_registered_users() {
        let (state, _shutdown) = state_with(None, false);
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        state.registry().register(
            "A",
            crate::registry::ConnectionHandle::new(tx, tokio_util::sync::CancellationToken::new()),
        );
        let (_, body) = get_json(build_router(state), "/").await;
        assert_eq!(body["active_users"], json!(["A"]));
    }

    #[tokio::test]
    async fn history_unavailable_without_store() {
        let (state, _shutdown) = state_with(None, false);
        let (code, body) = get_json(build_router(state), "/messages/A").await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["detail"], "Database not available");
    }

    #[tokio::test]
    async fn history_returns_matching_records() {
        let store = HistoryStore::in_memory().unwrap();
        store
            .append(MessageDraft::new("A", "B", "one").with_timestamp("T1").stamp())
            .await
            .unwrap();
        store
            .append(MessageDraft::new("C", "D", "other").with_timestamp("T2").stamp())
            .await
            .unwrap();
        let (state, _shutdown) = state_with(Some(store), false);

        let (code, body) = get_json(build_router(state), "/messages/B").await;
        assert_eq!(code, StatusCode::OK);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["from"], "A");
        assert!(messages[0]["_id"].is_string());
    }

    #[tokio::test]
    async fn history_query_failure_is_500() {
        let store = HistoryStore::in_memory().unwrap();
        store
            .database()
            .with_conn(|conn| Ok(conn.execute_batch("DROP TABLE messages")?))
            .unwrap();
        let (state, _shutdown) = state_with(Some(store), false);

        let (code, body) = get_json(build_router(state), "/messages/A").await;
        assert_eq!(code, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["detail"]
            .as_str()
            .unwrap()
            .starts_with("Failed to retrieve message history"));
    }

    #[tokio::test]
    async fn metrics_disabled_is_404() {
        let (state, _shutdown) = state_with(None, false);
        let resp = build_router(state)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn bus_assembles_listener() {
        let (state, shutdown) = state_with(None, true);
        assert!(state.listener_state.is_some());
        assert_eq!(shutdown.tracked(), 1);
        shutdown
            .graceful_shutdown(std::time::Duration::from_secs(1))
            .await;
    }
}
