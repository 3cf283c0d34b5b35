//! # relay-server
//!
//! Axum WebSocket relay.
//!
//! - `/ws/{user_id}` sessions registered in a process-wide [`registry::ConnectionRegistry`]
//! - [`delivery::DeliveryEngine`]: direct delivery, persistence, bus fan-out
//! - [`listener::BusListener`]: supervised bus subscription relaying to local users
//! - `GET /`, `GET /messages/{user_id}` and `GET /metrics`
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod delivery;
pub mod health;
pub mod listener;
pub mod registry;
pub mod server;
pub mod session;
pub mod settings;
pub mod shutdown;

pub use server::{build_router, start, AppState, RelayDeps, ServerHandle};
pub use settings::RelaySettings;
pub use shutdown::{shutdown_signal, ShutdownCoordinator, DEFAULT_SHUTDOWN_TIMEOUT};
