//! Pipeline counters shared by every stage of the nozzle.
//!
//! One `PipelineCounters` instance is created per connector and passed to each
//! component by `Arc`. Increments are lock-free and are mirrored into the
//! `metrics` facade so they also show up on the Prometheus endpoint.
use std::sync::atomic::{AtomicU64, Ordering};

pub const EVENTS_RECEIVED: &str = "nozzle_events_received_total";
pub const EVENTS_DROPPED: &str = "nozzle_events_dropped_total";
pub const EVENTS_FORWARDED: &str = "nozzle_events_forwarded_total";
pub const FORWARD_ERRORS: &str = "nozzle_forward_errors_total";
pub const ENRICHMENT_ERRORS: &str = "nozzle_enrichment_errors_total";
pub const APP_CACHE_HITS: &str = "nozzle_app_cache_hits_total";
pub const APP_CACHE_MISSES: &str = "nozzle_app_cache_misses_total";
pub const RECONNECTS: &str = "nozzle_reconnects_total";
pub const DECODE_ERRORS: &str = "nozzle_decode_errors_total";
pub const WORKER_SATURATION: &str = "nozzle_worker_saturation_percent";
pub const FORWARD_DURATION: &str = "nozzle_forward_duration_seconds";

#[derive(Default, Debug)]
pub struct PipelineCounters {
    received: AtomicU64,
    dropped: AtomicU64,
    forwarded: AtomicU64,
    forward_errors: AtomicU64,
    enrichment_errors: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    reconnects: AtomicU64,
    decode_errors: AtomicU64,
}

/// A point-in-time copy of every counter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CountersSnapshot {
    pub received: u64,
    pub dropped: u64,
    pub forwarded: u64,
    pub forward_errors: u64,
    pub enrichment_errors: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub reconnects: u64,
    pub decode_errors: u64,
}

impl CountersSnapshot {
    /// Counter name and value pairs, in reporting order.
    pub fn entries(&self) -> [(&'static str, u64); 9] {
        [
            ("received", self.received),
            ("dropped", self.dropped),
            ("forwarded", self.forwarded),
            ("errors", self.forward_errors),
            ("enrichment_errors", self.enrichment_errors),
            ("app_cache_hits", self.cache_hits),
            ("app_cache_misses", self.cache_misses),
            ("reconnects", self.reconnects),
            ("decode_errors", self.decode_errors),
        ]
    }
}

fn bump(counter: &AtomicU64, name: &'static str) {
    counter.fetch_add(1, Ordering::Relaxed);
    metrics::counter!(name).increment(1);
}

impl PipelineCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_received(&self) {
        bump(&self.received, EVENTS_RECEIVED)
    }

    pub fn event_dropped(&self) {
        bump(&self.dropped, EVENTS_DROPPED)
    }

    pub fn event_forwarded(&self) {
        bump(&self.forwarded, EVENTS_FORWARDED)
    }

    pub fn forward_error(&self) {
        bump(&self.forward_errors, FORWARD_ERRORS)
    }

    pub fn enrichment_error(&self) {
        bump(&self.enrichment_errors, ENRICHMENT_ERRORS)
    }

    pub fn cache_hit(&self) {
        bump(&self.cache_hits, APP_CACHE_HITS)
    }

    pub fn cache_miss(&self) {
        bump(&self.cache_misses, APP_CACHE_MISSES)
    }

    pub fn reconnect(&self) {
        bump(&self.reconnects, RECONNECTS)
    }

    pub fn decode_error(&self) {
        bump(&self.decode_errors, DECODE_ERRORS)
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            received: self.received.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            forward_errors: self.forward_errors.load(Ordering::Relaxed),
            enrichment_errors: self.enrichment_errors.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
        }
    }
}
