use std::sync::Arc;
use std::time::Duration;

use health::HealthHandle;
use nozzle_common::metric_point::MetricPoint;
use time::OffsetDateTime;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::counters::PipelineCounters;
use crate::error::ForwardError;
use crate::forwarder::ProxyForwarder;

/// Periodically forwards the nozzle's own counters to the metrics proxy.
pub struct SelfMetricsReporter {
    forwarder: Arc<ProxyForwarder>,
    counters: Arc<PipelineCounters>,
    subscription_id: String,
    interval: Duration,
    liveness: Option<HealthHandle>,
}

impl SelfMetricsReporter {
    pub fn new(
        forwarder: Arc<ProxyForwarder>,
        counters: Arc<PipelineCounters>,
        subscription_id: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            forwarder,
            counters,
            subscription_id: subscription_id.into(),
            interval,
            liveness: None,
        }
    }

    /// Relay the forwarder's health to `liveness` on every tick.
    pub fn with_liveness(mut self, liveness: HealthHandle) -> Self {
        self.liveness = Some(liveness);
        self
    }

    pub fn points(&self, timestamp: i64) -> Vec<MetricPoint> {
        let prefix = self.forwarder.prefix();
        let source = self.forwarder.source();

        self.counters
            .snapshot()
            .entries()
            .into_iter()
            .map(|(counter, value)| {
                MetricPoint::new(format!("{prefix}.nozzle.{counter}"), value as f64, timestamp, source)
                    .tag("subscriptionId", self.subscription_id.as_str())
                    .tag("component", "nozzle")
            })
            .collect()
    }

    pub async fn report_once(&self) -> Result<(), ForwardError> {
        let points = self.points(OffsetDateTime::now_utc().unix_timestamp());
        self.forwarder.report(&points).await
    }

    async fn relay_health(&self) {
        let Some(liveness) = &self.liveness else {
            return;
        };
        if self.forwarder.is_degraded() {
            liveness.report_unhealthy().await;
        } else {
            liveness.report_healthy().await;
        }
    }

    /// Report on every tick until `shutdown` is cancelled. Failures are logged and skipped.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.relay_health().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.relay_health().await;
                    match self.report_once().await {
                        Ok(()) => debug!("reported nozzle self metrics"),
                        Err(error) => warn!("failed to report nozzle self metrics: {error}"),
                    }
                }
            }
        }
    }
}
