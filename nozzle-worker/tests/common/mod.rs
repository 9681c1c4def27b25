#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use nozzle_common::event::{Event, EventKind, LogMessageType, Payload, PeerType};
use nozzle_common::retry::RetryPolicy;
use nozzle_worker::cache::{AppMetadataCache, AppMetadataCacheConfig};
use nozzle_worker::connector::{ConnectorConfig, EventOutcome, FirehoseConnector};
use nozzle_worker::counters::PipelineCounters;
use nozzle_worker::directory::{AppDirectory, AppMetadata};
use nozzle_worker::enricher::{EnrichedEvent, EventEnricher, PayloadAppId};
use nozzle_worker::error::{DirectoryError, FirehoseError, ForwardError, ProxyError};
use nozzle_worker::filter::EventTypeFilter;
use nozzle_worker::firehose::{EventStream, FirehoseClient};
use nozzle_worker::forwarder::Forwarder;
use tokio::sync::{mpsc, Notify};

pub const SUBSCRIPTION_ID: &str = "wavefront-nozzle";
pub const APP_ID: &str = "6d254438-cc3b-44a6-b2e6-343ca92deb5f";

/// One answer to a `subscribe` call.
pub enum Subscription {
    Fail,
    /// Yields the items, then ends.
    Finite(Vec<Result<Event, FirehoseError>>),
    /// Yields the items, then stays open.
    Open(Vec<Result<Event, FirehoseError>>),
}

/// Firehose client answering subscriptions from a script. Once the script runs
/// out every subscription is an open, silent stream.
#[derive(Default)]
pub struct ScriptedFirehose {
    script: Mutex<VecDeque<Subscription>>,
    calls: AtomicUsize,
    pub requested_kinds: Mutex<Vec<Vec<EventKind>>>,
}

impl ScriptedFirehose {
    pub fn new(script: impl IntoIterator<Item = Subscription>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FirehoseClient for ScriptedFirehose {
    async fn subscribe(
        &self,
        subscription_id: &str,
        kinds: &[EventKind],
    ) -> Result<EventStream, FirehoseError> {
        assert_eq!(subscription_id, SUBSCRIPTION_ID);
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requested_kinds
            .lock()
            .expect("poisoned")
            .push(kinds.to_vec());

        let next = self.script.lock().expect("poisoned").pop_front();
        match next {
            Some(Subscription::Fail) => Err(FirehoseError::SubscriptionRejected { status: 503 }),
            Some(Subscription::Finite(items)) => Ok(stream::iter(items).boxed()),
            Some(Subscription::Open(items)) => {
                Ok(stream::iter(items).chain(stream::pending()).boxed())
            }
            None => Ok(stream::pending().boxed()),
        }
    }
}

/// Forwarder recording every event it is handed.
#[derive(Default)]
pub struct RecordingForwarder {
    pub forwarded: Mutex<Vec<EnrichedEvent>>,
    pub started: Notify,
    pub delay: Duration,
    pub fail: bool,
}

impl RecordingForwarder {
    pub fn forwarded(&self) -> Vec<EnrichedEvent> {
        self.forwarded.lock().expect("poisoned").clone()
    }
}

#[async_trait]
impl Forwarder for RecordingForwarder {
    async fn forward(&self, event: &EnrichedEvent) -> Result<(), ForwardError> {
        self.started.notify_one();
        tokio::time::sleep(self.delay).await;
        if self.fail {
            return Err(ForwardError::ProxyError(ProxyError::IoError(
                std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "proxy down"),
            )));
        }
        self.forwarded
            .lock()
            .expect("poisoned")
            .push(event.clone());
        Ok(())
    }
}

/// Directory that knows every application, after an optional delay.
pub struct SlowDirectory {
    pub calls: AtomicUsize,
    pub delay: Duration,
}

impl SlowDirectory {
    pub fn new(delay: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AppDirectory for SlowDirectory {
    async fn fetch_app_metadata(&self, app_id: &str) -> Result<Option<AppMetadata>, DirectoryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(Some(app_metadata(app_id)))
    }
}

pub fn app_metadata(app_id: &str) -> AppMetadata {
    AppMetadata {
        app_id: app_id.to_owned(),
        name: "billing".to_owned(),
        space: "production".to_owned(),
        org: "acme".to_owned(),
    }
}

pub fn enricher(
    directory: Arc<SlowDirectory>,
    lookup_timeout: Duration,
    counters: Arc<PipelineCounters>,
) -> EventEnricher {
    let cache = AppMetadataCache::new(
        directory,
        AppMetadataCacheConfig {
            fetch_timeout: Duration::from_secs(30),
            ..Default::default()
        },
        counters.clone(),
    );
    EventEnricher::new(
        Arc::new(cache),
        Arc::new(PayloadAppId),
        lookup_timeout,
        counters,
    )
}

pub fn connector_config() -> ConnectorConfig {
    ConnectorConfig {
        retry_policy: RetryPolicy::build(2, Duration::from_millis(50))
            .maximum_interval(Duration::from_millis(200))
            .provide(),
        shutdown_grace_period: Duration::from_millis(100),
        ..ConnectorConfig::new(SUBSCRIPTION_ID)
    }
}

pub struct Harness {
    pub connector: FirehoseConnector,
    pub outcomes: mpsc::UnboundedReceiver<EventOutcome>,
    pub counters: Arc<PipelineCounters>,
}

pub fn harness(
    client: Arc<ScriptedFirehose>,
    forwarder: Arc<RecordingForwarder>,
    kinds: &[EventKind],
    enricher: Option<EventEnricher>,
    counters: Arc<PipelineCounters>,
    config: ConnectorConfig,
) -> Harness {
    let (tx, outcomes) = mpsc::unbounded_channel();
    let enricher = enricher.unwrap_or_else(|| EventEnricher::disabled(counters.clone()));
    let connector = FirehoseConnector::new(
        client,
        EventTypeFilter::new(kinds.iter().copied()),
        Arc::new(enricher),
        forwarder,
        counters.clone(),
        config,
    )
    .with_outcome_sender(tx);

    Harness {
        connector,
        outcomes,
        counters,
    }
}

/// Collect exactly `n` outcomes, failing the test if they do not arrive in time.
pub async fn next_outcomes(
    outcomes: &mut mpsc::UnboundedReceiver<EventOutcome>,
    n: usize,
) -> Vec<EventOutcome> {
    let mut collected = Vec::with_capacity(n);
    while collected.len() < n {
        let outcome = tokio::time::timeout(Duration::from_secs(5), outcomes.recv())
            .await
            .expect("timed out waiting for an event outcome")
            .expect("outcome channel closed");
        collected.push(outcome);
    }
    collected
}

pub fn event(payload: Payload) -> Event {
    Event {
        origin: "rep".to_owned(),
        deployment: "cf".to_owned(),
        job: "diego-cell".to_owned(),
        index: "0".to_owned(),
        ip: "10.0.0.7".to_owned(),
        timestamp: 1_700_000_000_000_000_000,
        tags: BTreeMap::new(),
        payload,
    }
}

pub fn container_metric(app_id: &str) -> Event {
    event(Payload::ContainerMetric {
        application_id: app_id.to_owned(),
        instance_index: 0,
        cpu_percentage: 12.5,
        memory_bytes: 1024,
        disk_bytes: 2048,
        memory_bytes_quota: 4096,
        disk_bytes_quota: 8192,
    })
}

/// One event of every kind, in taxonomy order.
pub fn one_of_each_kind() -> Vec<Event> {
    vec![
        event(Payload::CounterEvent {
            name: "requests".to_owned(),
            delta: 1,
            total: 10,
        }),
        event(Payload::ValueMetric {
            name: "latency".to_owned(),
            value: 3.5,
            unit: "ms".to_owned(),
        }),
        container_metric(APP_ID),
        event(Payload::HttpStartStop {
            start_timestamp: 1,
            stop_timestamp: 2,
            peer_type: PeerType::Client,
            method: "GET".to_owned(),
            uri: "/".to_owned(),
            status_code: 200,
            content_length: 0,
            application_id: None,
            instance_index: None,
        }),
        event(Payload::LogMessage {
            message: "hello".to_owned(),
            message_type: LogMessageType::Out,
            app_id: Some(APP_ID.to_owned()),
            source_type: "APP/PROC/WEB".to_owned(),
            source_instance: "0".to_owned(),
        }),
        event(Payload::Error {
            source: "router".to_owned(),
            code: 502,
            message: "bad gateway".to_owned(),
        }),
    ]
}
