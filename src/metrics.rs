// Scribe API metrics
//
// A small facade over pluggable exporters. The Prometheus exporter backs
// the `GET /metrics` endpoint; the null exporter keeps every call site
// unconditional when metrics are disabled.

use std::collections::HashMap;
use std::env;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use prometheus::{CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use thiserror::Error;
use tokio::sync::Mutex;

/// Errors from metric registration or export.
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("failed to register metric {name}: {reason}")]
    Registration { name: String, reason: String },

    #[error("failed to export metrics: {0}")]
    Export(String),
}

/// Backend-agnostic exporter interface.
#[async_trait]
pub trait MetricsExporter: Send + Sync {
    async fn increment(&self, name: &str, help: &str, labels: &[(&str, &str)]);
    async fn set_gauge(&self, name: &str, help: &str, value: f64, labels: &[(&str, &str)]);
    async fn observe(&self, name: &str, help: &str, value: f64, labels: &[(&str, &str)]);
    async fn export(&self) -> Result<Vec<u8>, MetricsError>;
}

/// Exporter that drops everything.
pub struct NullExporter;

#[async_trait]
impl MetricsExporter for NullExporter {
    async fn increment(&self, _name: &str, _help: &str, _labels: &[(&str, &str)]) {}
    async fn set_gauge(&self, _name: &str, _help: &str, _value: f64, _labels: &[(&str, &str)]) {}
    async fn observe(&self, _name: &str, _help: &str, _value: f64, _labels: &[(&str, &str)]) {}
    async fn export(&self) -> Result<Vec<u8>, MetricsError> {
        Ok(Vec::new())
    }
}

/// Prometheus-backed exporter with lazily registered collectors.
pub struct PrometheusExporter {
    registry: Registry,
    counters: Mutex<HashMap<String, CounterVec>>,
    gauges: Mutex<HashMap<String, GaugeVec>>,
    histograms: Mutex<HashMap<String, HistogramVec>>,
}

impl PrometheusExporter {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            counters: Mutex::new(HashMap::new()),
            gauges: Mutex::new(HashMap::new()),
            histograms: Mutex::new(HashMap::new()),
        }
    }

    async fn counter(
        &self,
        name: &str,
        help: &str,
        label_names: &[&str],
    ) -> Result<CounterVec, MetricsError> {
        let mut counters = self.counters.lock().await;
        if let Some(counter) = counters.get(name) {
            return Ok(counter.clone());
        }

        let counter = CounterVec::new(Opts::new(name, help), label_names).map_err(|e| {
            MetricsError::Registration {
                name: name.to_string(),
                reason: e.to_string(),
            }
        })?;
        self.registry
            .register(Box::new(counter.clone()))
            .map_err(|e| MetricsError::Registration {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        counters.insert(name.to_string(), counter.clone());
        Ok(counter)
    }

    async fn gauge(
        &self,
        name: &str,
        help: &str,
        label_names: &[&str],
    ) -> Result<GaugeVec, MetricsError> {
        let mut gauges = self.gauges.lock().await;
        if let Some(gauge) = gauges.get(name) {
            return Ok(gauge.clone());
        }

        let gauge = GaugeVec::new(Opts::new(name, help), label_names).map_err(|e| {
            MetricsError::Registration {
                name: name.to_string(),
                reason: e.to_string(),
            }
        })?;
        self.registry
            .register(Box::new(gauge.clone()))
            .map_err(|e| MetricsError::Registration {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        gauges.insert(name.to_string(), gauge.clone());
        Ok(gauge)
    }

    async fn histogram(
        &self,
        name: &str,
        help: &str,
        label_names: &[&str],
    ) -> Result<HistogramVec, MetricsError> {
        let mut histograms = self.histograms.lock().await;
        if let Some(histogram) = histograms.get(name) {
            return Ok(histogram.clone());
        }

        let histogram =
            HistogramVec::new(HistogramOpts::new(name, help), label_names).map_err(|e| {
                MetricsError::Registration {
                    name: name.to_string(),
                    reason: e.to_string(),
                }
            })?;
        self.registry
            .register(Box::new(histogram.clone()))
            .map_err(|e| MetricsError::Registration {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        histograms.insert(name.to_string(), histogram.clone());
        Ok(histogram)
    }
}

impl Default for PrometheusExporter {
    fn default() -> Self {
        Self::new()
    }
}

fn label_parts<'a>(labels: &'a [(&'a str, &'a str)]) -> (Vec<&'a str>, Vec<&'a str>) {
    let names = labels.iter().map(|(k, _)| *k).collect();
    let values = labels.iter().map(|(_, v)| *v).collect();
    (names, values)
}

#[async_trait]
impl MetricsExporter for PrometheusExporter {
    async fn increment(&self, name: &str, help: &str, labels: &[(&str, &str)]) {
        let (names, values) = label_parts(labels);
        match self.counter(name, help, &names).await {
            Ok(counter) => counter.with_label_values(&values).inc(),
            Err(e) => warn!("metrics: {}", e),
        }
    }

    async fn set_gauge(&self, name: &str, help: &str, value: f64, labels: &[(&str, &str)]) {
        let (names, values) = label_parts(labels);
        match self.gauge(name, help, &names).await {
            Ok(gauge) => gauge.with_label_values(&values).set(value),
            Err(e) => warn!("metrics: {}", e),
        }
    }

    async fn observe(&self, name: &str, help: &str, value: f64, labels: &[(&str, &str)]) {
        let (names, values) = label_parts(labels);
        match self.histogram(name, help, &names).await {
            Ok(histogram) => histogram.with_label_values(&values).observe(value),
            Err(e) => warn!("metrics: {}", e),
        }
    }

    async fn export(&self) -> Result<Vec<u8>, MetricsError> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::Export(e.to_string()))?;
        Ok(buffer)
    }
}

/// Facade the rest of the system records through.
#[derive(Clone)]
pub struct Metrics {
    exporter: Arc<dyn MetricsExporter>,
}

impl Metrics {
    pub fn new(exporter: Arc<dyn MetricsExporter>) -> Self {
        Self { exporter }
    }

    pub async fn record_task_submitted(&self, source_type: &str, priority: &str) {
        self.exporter
            .increment(
                "scribe_tasks_submitted_total",
                "Tasks admitted",
                &[("source_type", source_type), ("priority", priority)],
            )
            .await;
    }

    pub async fn record_task_completed(&self, engine: &str, outcome: &str, duration_secs: f64) {
        self.exporter
            .increment(
                "scribe_tasks_completed_total",
                "Tasks that reached a terminal state",
                &[("engine", engine), ("outcome", outcome)],
            )
            .await;
        self.exporter
            .observe(
                "scribe_task_duration_seconds",
                "Wall-clock task execution time",
                duration_secs,
                &[("engine", engine)],
            )
            .await;
    }

    pub async fn set_queue_depth(&self, depth: f64) {
        self.exporter
            .set_gauge(
                "scribe_queue_depth",
                "Jobs waiting in the dispatcher queue",
                depth,
                &[],
            )
            .await;
    }

    pub async fn record_provider_request(&self, provider: &str, outcome: &str) {
        self.exporter
            .increment(
                "scribe_provider_requests_total",
                "Outbound provider requests",
                &[("provider", provider), ("outcome", outcome)],
            )
            .await;
    }

    pub async fn record_webhook(&self, kind: &str, outcome: &str) {
        self.exporter
            .increment(
                "scribe_webhooks_total",
                "Webhook deliveries",
                &[("kind", kind), ("outcome", outcome)],
            )
            .await;
    }

    pub async fn record_tasks_swept(&self, count: u64) {
        if count == 0 {
            return;
        }
        for _ in 0..count {
            self.exporter
                .increment(
                    "scribe_tasks_swept_total",
                    "Tasks failed by the stuck-task sweeper",
                    &[],
                )
                .await;
        }
    }

    pub async fn export(&self) -> Result<Vec<u8>, MetricsError> {
        self.exporter.export().await
    }
}

/// Build the exporter selected by `METRICS_EXPORTER` (`prometheus` or `none`).
pub fn create_exporter_from_env() -> Arc<dyn MetricsExporter> {
    match env::var("METRICS_EXPORTER").as_deref() {
        Ok("prometheus") => Arc::new(PrometheusExporter::new()),
        Ok("none") | Err(_) => Arc::new(NullExporter),
        Ok(other) => {
            debug!("unknown METRICS_EXPORTER {:?}, metrics disabled", other);
            Arc::new(NullExporter)
        }
    }
}
