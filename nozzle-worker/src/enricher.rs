use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time;

use nozzle_common::event::{Event, Payload};
use tracing::debug;

use crate::cache::AppMetadataCache;
use crate::counters::PipelineCounters;
use crate::directory::AppMetadata;

/// An event paired with the metadata of the application that emitted it, if known.
/// The event itself is never modified by enrichment.
#[derive(Clone, Debug, PartialEq)]
pub struct EnrichedEvent {
    pub event: Event,
    pub app: Option<Arc<AppMetadata>>,
}

impl EnrichedEvent {
    pub fn new(event: Event, app: Option<Arc<AppMetadata>>) -> Self {
        Self { event, app }
    }

    pub fn bare(event: Event) -> Self {
        Self { event, app: None }
    }
}

/// Derives the application id an event belongs to.
///
/// The convention differs between bus versions, so each extractor names the
/// convention it implements.
pub trait AppIdExtractor: Send + Sync {
    fn version(&self) -> &'static str;

    fn extract<'e>(&self, event: &'e Event) -> Option<&'e str>;
}

/// Application id carried in the payload of container, http and log events.
pub struct PayloadAppId;

impl AppIdExtractor for PayloadAppId {
    fn version(&self) -> &'static str {
        "payload-v1"
    }

    fn extract<'e>(&self, event: &'e Event) -> Option<&'e str> {
        let app_id = match &event.payload {
            Payload::ContainerMetric { application_id, .. } => Some(application_id.as_str()),
            Payload::HttpStartStop { application_id, .. } => application_id.as_deref(),
            Payload::LogMessage { app_id, .. } => app_id.as_deref(),
            Payload::CounterEvent { .. } | Payload::ValueMetric { .. } | Payload::Error { .. } => {
                None
            }
        };
        app_id.filter(|id| !id.is_empty())
    }
}

/// `payload-v1`, falling back to an envelope index that is an application GUID.
pub struct PayloadOrIndexAppId;

impl AppIdExtractor for PayloadOrIndexAppId {
    fn version(&self) -> &'static str {
        "payload-index-v1"
    }

    fn extract<'e>(&self, event: &'e Event) -> Option<&'e str> {
        PayloadAppId.extract(event).or_else(|| {
            uuid::Uuid::parse_str(&event.index)
                .ok()
                .map(|_| event.index.as_str())
        })
    }
}

/// Configurable selection of an [`AppIdExtractor`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AppIdConvention {
    PayloadV1,
    PayloadIndexV1,
}

impl AppIdConvention {
    pub fn extractor(&self) -> Arc<dyn AppIdExtractor> {
        match self {
            AppIdConvention::PayloadV1 => Arc::new(PayloadAppId),
            AppIdConvention::PayloadIndexV1 => Arc::new(PayloadOrIndexAppId),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseAppIdConventionError(String);

impl fmt::Display for ParseAppIdConventionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown application id convention: {}", self.0)
    }
}

impl FromStr for AppIdConvention {
    type Err = ParseAppIdConventionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "payload-v1" => Ok(AppIdConvention::PayloadV1),
            "payload-index-v1" => Ok(AppIdConvention::PayloadIndexV1),
            _ => Err(ParseAppIdConventionError(s.to_owned())),
        }
    }
}

/// Attaches application metadata to events on a best-effort basis.
pub struct EventEnricher {
    cache: Option<Arc<AppMetadataCache>>,
    extractor: Arc<dyn AppIdExtractor>,
    lookup_timeout: time::Duration,
    counters: Arc<PipelineCounters>,
}

impl EventEnricher {
    pub fn new(
        cache: Arc<AppMetadataCache>,
        extractor: Arc<dyn AppIdExtractor>,
        lookup_timeout: time::Duration,
        counters: Arc<PipelineCounters>,
    ) -> Self {
        Self {
            cache: Some(cache),
            extractor,
            lookup_timeout,
            counters,
        }
    }

    /// An enricher that never looks anything up.
    pub fn disabled(counters: Arc<PipelineCounters>) -> Self {
        Self {
            cache: None,
            extractor: Arc::new(PayloadAppId),
            lookup_timeout: time::Duration::ZERO,
            counters,
        }
    }

    /// Never waits longer than the lookup timeout; a slow or failed lookup
    /// yields an event without metadata.
    pub async fn enrich(&self, event: Event) -> EnrichedEvent {
        let Some(cache) = &self.cache else {
            return EnrichedEvent::bare(event);
        };
        let Some(app_id) = self.extractor.extract(&event) else {
            return EnrichedEvent::bare(event);
        };

        let lookup = tokio::time::timeout(self.lookup_timeout, cache.lookup(app_id)).await;
        match lookup {
            Ok(app) => EnrichedEvent::new(event, app),
            Err(_) => {
                self.counters.enrichment_error();
                debug!(
                    app_id,
                    convention = self.extractor.version(),
                    "application metadata lookup exceeded {:?}",
                    self.lookup_timeout
                );
                EnrichedEvent::bare(event)
            }
        }
    }
}
