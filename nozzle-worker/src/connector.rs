//! The stream connector: owns the firehose subscription and drives every event
//! through filter, enrich and forward on a bounded pool of workers.
//!
//! ```text
//! Disconnected -> Subscribing -> Streaming -> Reconnecting -> Subscribing ...
//!                       \______________\____________\_________-> Stopped
//! ```
//!
//! `Stopped` is terminal and only reached through [`FirehoseConnector::disconnect`].
use std::sync::Arc;
use std::time;

use futures::StreamExt;
use health::HealthHandle;
use nozzle_common::event::{Event, EventKind};
use nozzle_common::retry::RetryPolicy;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::counters::{PipelineCounters, WORKER_SATURATION};
use crate::enricher::EventEnricher;
use crate::error::{ConnectorError, FirehoseError};
use crate::filter::EventTypeFilter;
use crate::firehose::{EventStream, FirehoseClient};
use crate::forwarder::Forwarder;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectorState {
    Disconnected,
    Subscribing,
    Streaming,
    Reconnecting,
    Stopped,
}

/// What happened to a single event.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Disposition {
    Dropped,
    Forwarded { enriched: bool },
    ForwardFailed,
}

/// Emitted once per processed event when an outcome sender is attached.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EventOutcome {
    pub kind: EventKind,
    pub disposition: Disposition,
}

#[derive(Clone, Debug)]
pub struct ConnectorConfig {
    pub subscription_id: String,
    /// Maximum number of events processed concurrently.
    pub parallelism: usize,
    pub retry_policy: RetryPolicy,
    /// How long in-flight events may keep running after `disconnect`.
    pub shutdown_grace_period: time::Duration,
    pub liveness_interval: time::Duration,
}

impl ConnectorConfig {
    pub fn new(subscription_id: impl Into<String>) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            parallelism: 4,
            retry_policy: RetryPolicy::default(),
            shutdown_grace_period: time::Duration::from_secs(5),
            liveness_interval: time::Duration::from_secs(10),
        }
    }
}

/// Per-event processing. Shared by all workers.
struct Pipeline {
    filter: EventTypeFilter,
    enricher: Arc<EventEnricher>,
    forwarder: Arc<dyn Forwarder>,
    counters: Arc<PipelineCounters>,
    outcomes: Option<mpsc::UnboundedSender<EventOutcome>>,
}

impl Pipeline {
    async fn process(&self, event: Event) {
        let kind = event.kind();

        if !self.filter.accepts(kind) {
            self.counters.event_dropped();
            self.emit(kind, Disposition::Dropped);
            return;
        }

        let enriched = self.enricher.enrich(event).await;
        let disposition = match self.forwarder.forward(&enriched).await {
            Ok(()) => Disposition::Forwarded {
                enriched: enriched.app.is_some(),
            },
            Err(_) => Disposition::ForwardFailed,
        };
        self.emit(kind, disposition);
    }

    fn emit(&self, kind: EventKind, disposition: Disposition) {
        if let Some(outcomes) = &self.outcomes {
            // A closed receiver only means nobody is listening anymore.
            outcomes.send(EventOutcome { kind, disposition }).ok();
        }
    }
}

enum StreamEnd {
    Cancelled,
    Failed(FirehoseError),
}

/// The body of the connector task, alive from `connect` until shutdown or an exhausted retry budget.
struct StreamLoop {
    client: Arc<dyn FirehoseClient>,
    pipeline: Arc<Pipeline>,
    config: ConnectorConfig,
    liveness: Option<HealthHandle>,
    state: Arc<watch::Sender<ConnectorState>>,
    shutdown: CancellationToken,
}

impl StreamLoop {
    fn transition(&self, next: ConnectorState) {
        self.state.send_if_modified(|state| {
            if *state == ConnectorState::Stopped || *state == next {
                return false;
            }
            *state = next;
            true
        });
    }

    async fn report_alive(&self) {
        if let Some(liveness) = &self.liveness {
            liveness.report_healthy().await;
        }
    }

    async fn run(self) -> Result<(), ConnectorError> {
        let subscription_id = self.config.subscription_id.as_str();
        let kinds = self.pipeline.filter.kinds();
        let semaphore = Arc::new(Semaphore::new(self.config.parallelism));
        let mut workers = JoinSet::new();
        let mut attempt: u32 = 0;

        let result = loop {
            if self.shutdown.is_cancelled() {
                break Ok(());
            }
            self.transition(ConnectorState::Subscribing);
            self.report_alive().await;

            let subscribed = tokio::select! {
                _ = self.shutdown.cancelled() => break Ok(()),
                subscribed = self.client.subscribe(subscription_id, &kinds) => subscribed,
            };

            let error = match subscribed {
                Ok(events) => {
                    attempt = 0;
                    self.transition(ConnectorState::Streaming);
                    info!(subscription_id, "streaming from the firehose");

                    match self.stream(events, &semaphore, &mut workers).await {
                        StreamEnd::Cancelled => break Ok(()),
                        StreamEnd::Failed(error) => error,
                    }
                }
                Err(error) => error,
            };

            attempt = attempt.saturating_add(1);
            if !self.config.retry_policy.should_retry(attempt) {
                error!(subscription_id, attempt, "reconnect budget exhausted: {error}");
                break Err(ConnectorError::ReconnectBudgetExhausted {
                    attempts: attempt,
                    last_error: error,
                });
            }

            self.transition(ConnectorState::Reconnecting);
            self.pipeline.counters.reconnect();
            let delay = self.config.retry_policy.retry_interval(attempt);
            warn!(
                subscription_id,
                attempt,
                "firehose subscription lost, reconnecting in {delay:?}: {error}"
            );

            if !self.backoff(delay).await {
                break Ok(());
            }
        };

        self.drain(&mut workers).await;
        if result.is_err() {
            self.transition(ConnectorState::Disconnected);
        }
        result
    }

    /// Sleep for `delay`, still reporting liveness. Returns false when shutdown interrupts it.
    async fn backoff(&self, delay: time::Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        let mut liveness = tokio::time::interval(self.config.liveness_interval);
        liveness.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                _ = &mut sleep => return true,
                _ = liveness.tick() => self.report_alive().await,
            }
        }
    }

    async fn stream(
        &self,
        mut events: EventStream,
        semaphore: &Arc<Semaphore>,
        workers: &mut JoinSet<()>,
    ) -> StreamEnd {
        let counters = &self.pipeline.counters;
        let parallelism = self.config.parallelism;
        let mut liveness = tokio::time::interval(self.config.liveness_interval);
        liveness.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => return StreamEnd::Cancelled,

                _ = liveness.tick() => self.report_alive().await,

                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(error) = joined {
                        error!("event worker failed: {error}");
                    }
                }

                next = events.next() => match next {
                    Some(Ok(event)) => {
                        counters.event_received();

                        let permit = tokio::select! {
                            _ = self.shutdown.cancelled() => return StreamEnd::Cancelled,
                            permit = semaphore.clone().acquire_owned() => permit,
                        };
                        let Ok(permit) = permit else {
                            return StreamEnd::Cancelled;
                        };
                        metrics::gauge!(WORKER_SATURATION).set(
                            100.0 * (1.0 - semaphore.available_permits() as f64 / parallelism as f64),
                        );

                        let pipeline = self.pipeline.clone();
                        workers.spawn(async move {
                            pipeline.process(event).await;
                            drop(permit);
                        });
                    }
                    Some(Err(FirehoseError::DecodeError(error))) => {
                        counters.decode_error();
                        debug!("skipping undecodable firehose envelope: {error}");
                    }
                    Some(Err(error)) => return StreamEnd::Failed(error),
                    None => {
                        return StreamEnd::Failed(FirehoseError::StreamError(
                            "subscription closed by the firehose".to_owned(),
                        ))
                    }
                },
            }
        }
    }

    /// Let in-flight events finish within the grace period, then abort the rest.
    async fn drain(&self, workers: &mut JoinSet<()>) {
        if workers.is_empty() {
            return;
        }

        let grace = self.config.shutdown_grace_period;
        let finished = tokio::time::timeout(grace, async {
            while workers.join_next().await.is_some() {}
        })
        .await;

        if finished.is_err() {
            warn!(
                in_flight = workers.len(),
                "grace period of {grace:?} elapsed, cancelling in-flight events"
            );
            workers.abort_all();
            while workers.join_next().await.is_some() {}
        }
    }
}

/// Subscribes to the firehose and relays events through the pipeline, reconnecting on failure.
pub struct FirehoseConnector {
    client: Arc<dyn FirehoseClient>,
    filter: EventTypeFilter,
    enricher: Arc<EventEnricher>,
    forwarder: Arc<dyn Forwarder>,
    counters: Arc<PipelineCounters>,
    config: ConnectorConfig,
    outcomes: Option<mpsc::UnboundedSender<EventOutcome>>,
    liveness: Option<HealthHandle>,
    state: Arc<watch::Sender<ConnectorState>>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<Result<(), ConnectorError>>>>,
}

impl FirehoseConnector {
    pub fn new(
        client: Arc<dyn FirehoseClient>,
        filter: EventTypeFilter,
        enricher: Arc<EventEnricher>,
        forwarder: Arc<dyn Forwarder>,
        counters: Arc<PipelineCounters>,
        config: ConnectorConfig,
    ) -> Self {
        let (state, _) = watch::channel(ConnectorState::Disconnected);

        Self {
            client,
            filter,
            enricher,
            forwarder,
            counters,
            config,
            outcomes: None,
            liveness: None,
            state: Arc::new(state),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Receive one [`EventOutcome`] per processed event.
    pub fn with_outcome_sender(mut self, outcomes: mpsc::UnboundedSender<EventOutcome>) -> Self {
        self.outcomes = Some(outcomes);
        self
    }

    pub fn with_liveness(mut self, liveness: HealthHandle) -> Self {
        self.liveness = Some(liveness);
        self
    }

    pub fn state(&self) -> ConnectorState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectorState> {
        self.state.subscribe()
    }

    /// Start streaming. A no-op while a connection is already being held or
    /// re-established; fails once the connector has been stopped.
    pub async fn connect(&self) -> Result<(), ConnectorError> {
        if self.config.subscription_id.trim().is_empty() {
            return Err(ConnectorError::InvalidConfiguration(
                "subscription id must not be empty".to_owned(),
            ));
        }
        if self.config.parallelism == 0 {
            return Err(ConnectorError::InvalidConfiguration(
                "parallelism must be greater than zero".to_owned(),
            ));
        }

        let mut stopped = false;
        let started = self.state.send_if_modified(|state| match state {
            ConnectorState::Disconnected => {
                *state = ConnectorState::Subscribing;
                true
            }
            ConnectorState::Stopped => {
                stopped = true;
                false
            }
            ConnectorState::Subscribing
            | ConnectorState::Streaming
            | ConnectorState::Reconnecting => false,
        });

        if stopped {
            return Err(ConnectorError::AlreadyStopped);
        }
        if !started {
            debug!(state = ?self.state(), "connect called on an active connector");
            return Ok(());
        }

        let stream_loop = StreamLoop {
            client: self.client.clone(),
            pipeline: Arc::new(Pipeline {
                filter: self.filter,
                enricher: self.enricher.clone(),
                forwarder: self.forwarder.clone(),
                counters: self.counters.clone(),
                outcomes: self.outcomes.clone(),
            }),
            config: self.config.clone(),
            liveness: self.liveness.clone(),
            state: self.state.clone(),
            shutdown: self.shutdown.clone(),
        };

        info!(
            subscription_id = %self.config.subscription_id,
            kinds = ?self.filter.kinds(),
            "connecting to the firehose"
        );
        *self.task.lock().await = Some(tokio::spawn(stream_loop.run()));

        Ok(())
    }

    /// Stop the connector from any state. In-flight events get the grace period to finish.
    pub async fn disconnect(&self) {
        self.state.send_replace(ConnectorState::Stopped);
        self.shutdown.cancel();

        let mut task = self.task.lock().await;
        if let Some(handle) = task.as_mut() {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => warn!("connector stopped after an error: {error}"),
                Err(error) => error!("connector task failed: {error}"),
            }
            *task = None;
        }
        info!(
            subscription_id = %self.config.subscription_id,
            "disconnected from the firehose"
        );
    }

    /// Wait for the connector task to end and return its result.
    ///
    /// Resolves immediately with `Ok(())` if the connector was never started or
    /// its result has already been collected.
    pub async fn wait(&self) -> Result<(), ConnectorError> {
        let mut task = self.task.lock().await;
        let Some(handle) = task.as_mut() else {
            return Ok(());
        };

        let result = handle.await;
        *task = None;
        result?
    }
}
