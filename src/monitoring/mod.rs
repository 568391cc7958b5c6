//! Metrics and the monitoring listener.
//!
//! The gateway records per-application response-time summaries and error
//! counts, rendered in Prometheus text exposition format on `/metrics`.
//! `/status` doubles as the Consul health check endpoint; the controller
//! registers the gateway as a Consul service on startup and deregisters
//! it on shutdown.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use axum::Router;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use log::{error, info};

use crate::consul::{ConsulClient, ServiceRegistration};

const METRIC_NAMESPACE: &str = "servicegateway_proxy";

#[derive(Default, Clone, Copy)]
struct Summary {
    count: u64,
    sum: f64,
}

/// Gateway metrics registry.
pub struct Metrics {
    total_times: Mutex<BTreeMap<String, Summary>>,
    upstream_times: Mutex<BTreeMap<String, Summary>>,
    errors: Mutex<BTreeMap<(String, String), u64>>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Metrics {
            total_times: Mutex::new(BTreeMap::new()),
            upstream_times: Mutex::new(BTreeMap::new()),
            errors: Mutex::new(BTreeMap::new()),
        }
    }

    /// Records the total handling time of a request, in seconds.
    pub fn observe_total(&self, application: &str, seconds: f64) {
        let mut times = self.total_times.lock().unwrap();
        let summary = times.entry(application.to_string()).or_default();
        summary.count += 1;
        summary.sum += seconds;
    }

    /// Records the upstream response time of a request, in seconds.
    pub fn observe_upstream(&self, application: &str, seconds: f64) {
        let mut times = self.upstream_times.lock().unwrap();
        let summary = times.entry(application.to_string()).or_default();
        summary.count += 1;
        summary.sum += seconds;
    }

    /// Counts a proxy error for an application.
    pub fn inc_error(&self, application: &str, reason: &str) {
        let mut errors = self.errors.lock().unwrap();
        *errors
            .entry((application.to_string(), reason.to_string()))
            .or_insert(0) += 1;
    }

    /// Renders all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();

        render_summary(
            &mut out,
            &format!("{}_total_times_seconds", METRIC_NAMESPACE),
            "HTTP total response times",
            &self.total_times.lock().unwrap(),
        );
        render_summary(
            &mut out,
            &format!("{}_upstream_times_seconds", METRIC_NAMESPACE),
            "HTTP upstream response times",
            &self.upstream_times.lock().unwrap(),
        );

        let name = format!("{}_errors", METRIC_NAMESPACE);
        let _ = writeln!(out, "# HELP {} HTTP proxy errors", name);
        let _ = writeln!(out, "# TYPE {} counter", name);
        for ((application, reason), count) in self.errors.lock().unwrap().iter() {
            let _ = writeln!(
                out,
                "{}{{application=\"{}\",reason=\"{}\"}} {}",
                name, application, reason, count
            );
        }

        out
    }
}

fn render_summary(out: &mut String, name: &str, help: &str, values: &BTreeMap<String, Summary>) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} summary", name);
    for (application, summary) in values {
        let _ = writeln!(
            out,
            "{}_sum{{application=\"{}\"}} {}",
            name, application, summary.sum
        );
        let _ = writeln!(
            out,
            "{}_count{{application=\"{}\"}} {}",
            name, application, summary.count
        );
    }
}

/// Builds the monitoring listener router (`/status`, `/metrics`).
pub fn monitoring_router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/status", get(|| async { "ok" }))
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics.render(),
    )
}

/// Consul lifecycle for the gateway's own service registration.
pub struct MonitoringController {
    consul: Option<Arc<ConsulClient>>,
    service_id: String,
    monitor_port: u16,
}

impl MonitoringController {
    pub fn new(consul: Option<Arc<ConsulClient>>, monitor_port: u16) -> Self {
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        MonitoringController {
            consul,
            service_id: format!("servicegateway-{}", hostname),
            monitor_port,
        }
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// Registers the gateway in Consul. A no-op without Consul
    /// integration.
    pub async fn register(&self) -> Result<()> {
        let Some(consul) = &self.consul else {
            return Ok(());
        };

        info!("registering node in Consul");

        let registration = ServiceRegistration {
            id: self.service_id.clone(),
            name: "servicegateway".to_string(),
            port: self.monitor_port,
            check_url: format!("http://localhost:{}/status", self.monitor_port),
            check_interval: "30s".to_string(),
        };

        match consul.register_service(&registration).await {
            Ok(()) => {
                info!("successfully registered node in Consul");
                Ok(())
            }
            Err(e) => {
                error!("error while registering node in Consul: {}", e);
                Err(e)
            }
        }
    }

    /// Removes the gateway's registration from Consul.
    pub async fn deregister(&self) -> Result<()> {
        let Some(consul) = &self.consul else {
            return Ok(());
        };

        match consul.deregister_service(&self.service_id).await {
            Ok(()) => {
                info!("successfully deregistered service in Consul");
                Ok(())
            }
            Err(e) => {
                error!("error while deregistering service in Consul: {}", e);
                Err(e)
            }
        }
    }
}
