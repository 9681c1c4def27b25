use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::future::Cache;
use moka::Expiry;
use tracing::{debug, warn};

use crate::counters::PipelineCounters;
use crate::directory::{AppDirectory, AppMetadata};
use crate::error::DirectoryError;

type CachedMetadata = Option<Arc<AppMetadata>>;

/// Found entries live for the full TTL, not-found entries for the shorter negative TTL.
struct MetadataExpiry {
    ttl: Duration,
    not_found_ttl: Duration,
}

impl Expiry<String, CachedMetadata> for MetadataExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedMetadata,
        _created_at: Instant,
    ) -> Option<Duration> {
        match value {
            Some(_) => Some(self.ttl),
            None => Some(self.not_found_ttl),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppMetadataCacheConfig {
    pub capacity: u64,
    pub ttl: Duration,
    pub not_found_ttl: Duration,
    pub fetch_timeout: Duration,
}

impl Default for AppMetadataCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 5000,
            ttl: Duration::from_secs(6 * 60 * 60),
            not_found_ttl: Duration::from_secs(5 * 60),
            fetch_timeout: Duration::from_secs(2),
        }
    }
}

/// Bounded, lazily populated cache of application metadata.
///
/// - **TTL**: entries expire after the configured freshness deadline; entries
///   for unknown applications expire sooner.
/// - **Capacity**: least recently used entries are evicted past `capacity`.
/// - **Per-key coalescing**: misses go through moka's `try_get_with`, so
///   concurrent lookups of one application share a single directory call
///   while lookups of different applications proceed in parallel.
/// - **Failures are absorbed**: a directory error or timeout yields `None`,
///   bumps the enrichment error counter, and is not cached.
pub struct AppMetadataCache {
    directory: Arc<dyn AppDirectory>,
    cache: Cache<String, CachedMetadata>,
    fetch_timeout: Duration,
    counters: Arc<PipelineCounters>,
}

impl AppMetadataCache {
    pub fn new(
        directory: Arc<dyn AppDirectory>,
        config: AppMetadataCacheConfig,
        counters: Arc<PipelineCounters>,
    ) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.capacity)
            .expire_after(MetadataExpiry {
                ttl: config.ttl,
                not_found_ttl: config.not_found_ttl,
            })
            .build();

        Self {
            directory,
            cache,
            fetch_timeout: config.fetch_timeout,
            counters,
        }
    }

    /// Resolve `app_id`, fetching it on a miss.
    ///
    /// The fetch runs on its own task, so a caller that stops waiting does not
    /// cancel it for the other waiters and the result still lands in the cache.
    pub async fn lookup(&self, app_id: &str) -> Option<Arc<AppMetadata>> {
        if let Some(cached) = self.cache.get(app_id).await {
            self.counters.cache_hit();
            return cached;
        }

        self.counters.cache_miss();

        let fetch = tokio::spawn(fetch_into(
            self.cache.clone(),
            self.directory.clone(),
            app_id.to_owned(),
            self.fetch_timeout,
            self.counters.clone(),
        ));

        match fetch.await {
            Ok(metadata) => metadata,
            Err(error) => {
                self.counters.enrichment_error();
                warn!(app_id, "application metadata fetch task failed: {error}");
                None
            }
        }
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Apply pending evictions and expirations now.
    pub async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }
}

async fn fetch_into(
    cache: Cache<String, CachedMetadata>,
    directory: Arc<dyn AppDirectory>,
    app_id: String,
    fetch_timeout: Duration,
    counters: Arc<PipelineCounters>,
) -> CachedMetadata {
    let key = app_id.clone();
    let result = cache
        .try_get_with(app_id.clone(), async move {
            match tokio::time::timeout(fetch_timeout, directory.fetch_app_metadata(&key)).await {
                Ok(Ok(found)) => Ok(found.map(Arc::new)),
                Ok(Err(error)) => Err(error),
                Err(_) => Err(DirectoryError::Timeout(fetch_timeout)),
            }
        })
        .await;

    match result {
        Ok(metadata) => {
            debug!(app_id = %app_id, found = metadata.is_some(), "resolved application metadata");
            metadata
        }
        Err(error) => {
            counters.enrichment_error();
            warn!(app_id = %app_id, "application metadata lookup failed: {error}");
            None
        }
    }
}
