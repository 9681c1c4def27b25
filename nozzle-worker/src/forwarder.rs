use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time;

use async_trait::async_trait;
use nozzle_common::event::{Event, Payload};
use nozzle_common::metric_point::{sanitize_metric_name, MetricPoint};
use tracing::warn;

use crate::counters::{PipelineCounters, FORWARD_DURATION};
use crate::enricher::EnrichedEvent;
use crate::error::ForwardError;
use crate::proxy::ProxyClient;

/// Delivers enriched events downstream. Failures are returned, never retried.
#[async_trait]
pub trait Forwarder: Send + Sync + 'static {
    async fn forward(&self, event: &EnrichedEvent) -> Result<(), ForwardError>;
}

#[derive(Clone, Debug)]
pub struct ForwarderConfig {
    pub prefix: String,
    pub source: String,
    pub timeout: time::Duration,
    /// Consecutive failures after which the forwarder is degraded. Zero disables the check.
    pub failure_threshold: u64,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            prefix: "pcf".to_owned(),
            source: "pcf-nozzle".to_owned(),
            timeout: time::Duration::from_secs(5),
            failure_threshold: 10,
        }
    }
}

/// Translates enriched events into metric points and sends them to the metrics proxy.
pub struct ProxyForwarder {
    client: Arc<dyn ProxyClient>,
    config: ForwarderConfig,
    counters: Arc<PipelineCounters>,
    failure_streak: AtomicU64,
}

impl ProxyForwarder {
    pub fn new(
        client: Arc<dyn ProxyClient>,
        config: ForwarderConfig,
        counters: Arc<PipelineCounters>,
    ) -> Self {
        Self {
            client,
            config,
            counters,
            failure_streak: AtomicU64::new(0),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.config.prefix
    }

    pub fn source(&self) -> &str {
        &self.config.source
    }

    pub fn is_degraded(&self) -> bool {
        self.config.failure_threshold > 0
            && self.failure_streak.load(Ordering::Relaxed) >= self.config.failure_threshold
    }

    /// Send pre-built points under the forward timeout. Event counters are left alone.
    pub async fn report(&self, points: &[MetricPoint]) -> Result<(), ForwardError> {
        self.send(points).await
    }

    async fn send(&self, points: &[MetricPoint]) -> Result<(), ForwardError> {
        match tokio::time::timeout(self.config.timeout, self.client.send(points)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ForwardError::Timeout(self.config.timeout)),
        }
    }

    /// Build the metric points for one event.
    pub fn translate(&self, enriched: &EnrichedEvent) -> Vec<MetricPoint> {
        let event = &enriched.event;
        let prefix = &self.config.prefix;
        let origin = &event.origin;
        let timestamp = event.timestamp_seconds();
        let point_source = if event.ip.is_empty() {
            self.config.source.as_str()
        } else {
            event.ip.as_str()
        };
        let point = |name: String, value: f64| {
            MetricPoint::new(sanitize_metric_name(&name), value, timestamp, point_source)
        };

        let points = match &event.payload {
            Payload::CounterEvent { name, delta, total } => vec![
                point(format!("{prefix}.{origin}.{name}.total"), *total as f64),
                point(format!("{prefix}.{origin}.{name}.delta"), *delta as f64),
            ],
            Payload::ValueMetric { name, value, unit } => {
                vec![point(format!("{prefix}.{origin}.{name}"), *value).tag("unit", unit.as_str())]
            }
            Payload::ContainerMetric {
                application_id,
                instance_index,
                cpu_percentage,
                memory_bytes,
                disk_bytes,
                memory_bytes_quota,
                disk_bytes_quota,
            } => [
                ("cpu_percentage", *cpu_percentage),
                ("memory_bytes", *memory_bytes as f64),
                ("disk_bytes", *disk_bytes as f64),
                ("memory_bytes_quota", *memory_bytes_quota as f64),
                ("disk_bytes_quota", *disk_bytes_quota as f64),
            ]
            .into_iter()
            .map(|(metric, value)| {
                point(format!("{prefix}.container.{origin}.{metric}"), value)
                    .tag("applicationId", application_id.as_str())
                    .tag("instanceIndex", instance_index.to_string())
            })
            .collect(),
            Payload::HttpStartStop {
                start_timestamp,
                stop_timestamp,
                peer_type,
                method,
                status_code,
                ..
            } => {
                let duration_ms =
                    stop_timestamp.saturating_sub(*start_timestamp) as f64 / 1_000_000.0;
                vec![point(format!("{prefix}.http.{origin}.duration_ms"), duration_ms)
                    .tag("method", method.as_str())
                    .tag("statusCode", status_code.to_string())
                    .tag("peerType", peer_type.as_str())]
            }
            Payload::LogMessage { message_type, .. } => {
                vec![point(format!("{prefix}.log.{origin}.count"), 1.0)
                    .tag("messageType", message_type.as_str())]
            }
            Payload::Error { source, code, .. } => {
                vec![point(format!("{prefix}.error.{origin}.count"), 1.0)
                    .tag("errorSource", source.as_str())
                    .tag("errorCode", code.to_string())]
            }
        };

        points
            .into_iter()
            .map(|point| with_common_tags(point, enriched))
            .collect()
    }
}

fn with_common_tags(point: MetricPoint, enriched: &EnrichedEvent) -> MetricPoint {
    let Event {
        deployment,
        job,
        index,
        ip,
        tags,
        ..
    } = &enriched.event;

    let mut point = point
        .tag("deployment", deployment.as_str())
        .tag("job", job.as_str())
        .tag("index", index.as_str())
        .tag("ip", ip.as_str())
        .tags(tags.iter().map(|(k, v)| (k.as_str(), v.as_str())));

    if let Some(app) = &enriched.app {
        if point.get_tag("applicationId").is_none() {
            point = point.tag("applicationId", app.app_id.as_str());
        }
        point = point
            .tag("applicationName", app.name.as_str())
            .tag("space", app.space.as_str())
            .tag("org", app.org.as_str());
    }
    point
}

#[async_trait]
impl Forwarder for ProxyForwarder {
    async fn forward(&self, event: &EnrichedEvent) -> Result<(), ForwardError> {
        let points = self.translate(event);
        let started = tokio::time::Instant::now();
        let result = self.send(&points).await;
        metrics::histogram!(FORWARD_DURATION).record(started.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                self.failure_streak.store(0, Ordering::Relaxed);
                self.counters.event_forwarded();
                Ok(())
            }
            Err(error) => {
                let streak = self.failure_streak.fetch_add(1, Ordering::Relaxed) + 1;
                self.counters.forward_error();
                warn!(
                    kind = %event.event.kind(),
                    streak,
                    "failed to forward event: {error}"
                );
                Err(error)
            }
        }
    }
}
