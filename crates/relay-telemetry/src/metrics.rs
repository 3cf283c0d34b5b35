//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

use crate::TelemetryError;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render the `/metrics` endpoint.
pub fn install_recorder() -> Result<PrometheusHandle, TelemetryError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| TelemetryError::RecorderInstalled(e.to_string()))?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// WebSocket sessions accepted (counter).
pub const CONNECTIONS_TOTAL: &str = "relay_connections_total";
/// Registered sessions (gauge).
pub const CONNECTIONS_ACTIVE: &str = "relay_connections_active";
/// Chat frames accepted from clients (counter).
pub const MESSAGES_RECEIVED_TOTAL: &str = "relay_messages_received_total";
/// Successful deliveries (counter, labels: path = direct | bus | relayed).
pub const DELIVERIES_TOTAL: &str = "relay_deliveries_total";
/// Messages with neither direct delivery nor a bus publish (counter).
pub const DELIVERY_FAILURES_TOTAL: &str = "relay_delivery_failures_total";
/// Bus listener resubscribe attempts (counter).
pub const BUS_RESUBSCRIBES_TOTAL: &str = "relay_bus_resubscribes_total";
/// History writes that failed (counter).
pub const STORE_WRITE_FAILURES_TOTAL: &str = "relay_store_write_failures_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_without_global_install() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = render(&handle);
        assert!(output.is_empty() || output.contains('#') || output.contains('\n'));
    }

    #[test]
    fn metric_names_are_prefixed_snake_case() {
        for name in [
            CONNECTIONS_TOTAL,
            CONNECTIONS_ACTIVE,
            MESSAGES_RECEIVED_TOTAL,
            DELIVERIES_TOTAL,
            DELIVERY_FAILURES_TOTAL,
            BUS_RESUBSCRIBES_TOTAL,
            STORE_WRITE_FAILURES_TOTAL,
        ] {
            assert!(name.starts_with("relay_"), "{name}");
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
