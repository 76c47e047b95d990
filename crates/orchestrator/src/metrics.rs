//! A container for all Prometheus metric collectors, mirroring the shape of
//! this codebase's `sim_orchestrator::metrics::Metrics`: a custom registry,
//! exposed over `axum` on `/metrics`.

use axum::{response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

pub struct Metrics {
    pub registry: Registry,
    pub agents_registered_total: IntCounter,
    pub agents_active: IntGauge,
    pub heartbeats_total: IntCounter,
    pub sandboxes_active: IntGauge,
    pub commands_dispatched_total: IntCounter,
    pub commands_completed_total: IntCounter,
    pub commands_timed_out_total: IntCounter,
    pub grpc_requests_total: IntCounter,
    pub rest_requests_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("orchestrator".into()), None).expect("Failed to create custom metrics registry");

        macro_rules! reg {
            ($metric:expr) => {{
                let collector = $metric;
                registry.register(Box::new(collector.clone())).expect("Failed to register metric");
                collector
            }};
        }

        Self {
            agents_registered_total: reg!(IntCounter::new("agents_registered_total", "Total number of agents that have ever registered").unwrap()),
            agents_active: reg!(IntGauge::new("agents_active", "Number of currently active agents").unwrap()),
            heartbeats_total: reg!(IntCounter::new("heartbeats_total", "Total number of heartbeats received").unwrap()),
            sandboxes_active: reg!(IntGauge::new("sandboxes_active", "Number of sandboxes not yet deleted").unwrap()),
            commands_dispatched_total: reg!(IntCounter::new("commands_dispatched_total", "Total number of commands dispatched to an agent").unwrap()),
            commands_completed_total: reg!(IntCounter::new("commands_completed_total", "Total number of commands that received an agent result").unwrap()),
            commands_timed_out_total: reg!(IntCounter::new("commands_timed_out_total", "Total number of commands that hit the dispatcher timeout").unwrap()),
            grpc_requests_total: reg!(IntCounter::new("grpc_requests_total", "Total number of agent-facing gRPC requests received").unwrap()),
            rest_requests_total: reg!(IntCounter::new("rest_requests_total", "Total number of client-facing REST requests received").unwrap()),
            registry,
        }
    }

    pub fn router(&self) -> Router {
        let registry = self.registry.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let registry = registry.clone();
                async move {
                    let metric_families = registry.gather();
                    let mut buffer = Vec::new();
                    let encoder = TextEncoder::new();
                    encoder.encode(&metric_families, &mut buffer).expect("Failed to encode metrics");
                    String::from_utf8(buffer).expect("Metrics buffer is not valid UTF-8").into_response()
                }
            }),
        )
    }

    pub fn update_active_agents(&self, count: i64) {
        self.agents_active.set(count);
    }

    pub fn update_active_sandboxes(&self, count: i64) {
        self.sandboxes_active.set(count);
    }
}
