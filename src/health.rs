//! Prometheus health metrics for the backend.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, Encoder, Gauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Operational counters, all in the "stagehand" namespace.
pub struct HealthMetrics {
    registry: Registry,

    /// Total listener events received from the intake.
    pub events_received: Counter,
    /// Events skipped because their kind is unknown.
    pub events_ignored: Counter,
    /// Status transitions outside the expected machine.
    pub anomalies: Counter,
    /// Events aborted by a property conflict.
    pub conflicts: Counter,
    /// Store upserts applied.
    pub store_upserts: Counter,
    /// Store upserts that failed and were dropped.
    pub store_failures: Counter,
    /// Relay connections currently open.
    pub connections: Gauge,
}

impl HealthMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let events_received = counter(
            &registry,
            "events_received_total",
            "Total listener events received from the intake.",
        )?;
        let events_ignored = counter(
            &registry,
            "events_ignored_total",
            "Events skipped because their kind is unknown.",
        )?;
        let anomalies = counter(
            &registry,
            "anomalies_total",
            "Status transitions outside the expected machine.",
        )?;
        let conflicts = counter(
            &registry,
            "conflicts_total",
            "Events aborted by a property conflict.",
        )?;
        let store_upserts = counter(
            &registry,
            "store_upserts_total",
            "Store upserts applied.",
        )?;
        let store_failures = counter(
            &registry,
            "store_failures_total",
            "Store upserts that failed and were dropped.",
        )?;

        let connections = Gauge::with_opts(
            Opts::new("connections", "Relay connections currently open.")
                .namespace("stagehand"),
        )?;
        registry.register(Box::new(connections.clone()))?;

        Ok(Self {
            registry,
            events_received,
            events_ignored,
            anomalies,
            conflicts,
            store_upserts,
            store_failures,
            connections,
        })
    }

    /// Binds the health server and serves `/metrics` and `/healthz` until
    /// cancellation.
    pub async fn start(self: &Arc<Self>, addr: &str, cancel: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding health server on {addr}"))?;

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(|| async { "ok" }))
            .with_state(Arc::clone(self));

        info!(addr, "health server listening");
        tokio::spawn(async move {
            let shutdown = async move { cancel.cancelled().await };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                warn!(error = %e, "health server error");
            }
        });
        Ok(())
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<Counter> {
    let c = Counter::with_opts(Opts::new(name, help).namespace("stagehand"))?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

async fn metrics_handler(State(health): State<Arc<HealthMetrics>>) -> impl IntoResponse {
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    match encoder.encode(&health.registry.gather(), &mut buf) {
        Ok(()) => (StatusCode::OK, buf).into_response(),
        Err(e) => {
            warn!(error = %e, "encoding metrics failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_register_and_count() {
        let health = HealthMetrics::new().expect("metrics build");
        health.events_received.inc();
        health.events_received.inc();
        health.anomalies.inc();
        assert_eq!(health.events_received.get(), 2.0);
        assert_eq!(health.anomalies.get(), 1.0);
        assert_eq!(health.store_upserts.get(), 0.0);
    }
}
