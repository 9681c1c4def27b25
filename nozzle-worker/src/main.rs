//! Relay firehose events to the metrics proxy.
use std::future::ready;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use envconfig::Envconfig;
use health::HealthRegistry;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use nozzle_common::metrics::{serve, setup_metrics_routes};
use nozzle_worker::cache::{AppMetadataCache, AppMetadataCacheConfig};
use nozzle_worker::config::Config;
use nozzle_worker::connector::{ConnectorConfig, FirehoseConnector};
use nozzle_worker::counters::PipelineCounters;
use nozzle_worker::directory::HttpAppDirectory;
use nozzle_worker::enricher::EventEnricher;
use nozzle_worker::error::ConnectorError;
use nozzle_worker::filter::EventTypeFilter;
use nozzle_worker::firehose::HttpFirehoseClient;
use nozzle_worker::forwarder::{ForwarderConfig, ProxyForwarder};
use nozzle_worker::proxy::TcpProxyClient;
use nozzle_worker::reporter::SelfMetricsReporter;

const LIVENESS_INTERVAL: Duration = Duration::from_secs(10);
const FIREHOSE_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    info!("Shutting down gracefully...");
}

pub async fn index() -> &'static str {
    "firehose nozzle"
}

fn build_enricher(
    config: &Config,
    counters: &Arc<PipelineCounters>,
) -> Result<EventEnricher, ConnectorError> {
    let app_info = &config.app_info;
    let Some(api_url) = &app_info.cf_api_url else {
        info!("CF_API_URL is not set, application enrichment is disabled");
        return Ok(EventEnricher::disabled(counters.clone()));
    };

    let directory = HttpAppDirectory::new(
        api_url,
        app_info.cf_api_token.as_deref(),
        app_info.app_info_fetch_timeout.0,
    )
    .map_err(|error| ConnectorError::SetupError(format!("application directory: {error}")))?;

    let cache = AppMetadataCache::new(
        Arc::new(directory),
        AppMetadataCacheConfig {
            capacity: app_info.app_info_cache_size,
            ttl: app_info.app_info_cache_ttl.0,
            not_found_ttl: app_info.app_info_not_found_ttl.0,
            fetch_timeout: app_info.app_info_fetch_timeout.0,
        },
        counters.clone(),
    );

    Ok(EventEnricher::new(
        Arc::new(cache),
        app_info.app_id_convention.extractor(),
        app_info.app_info_lookup_timeout.0,
        counters.clone(),
    ))
}

#[tokio::main]
async fn main() -> Result<(), ConnectorError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env().expect("Invalid configuration:");
    config.validate()?;

    let liveness = HealthRegistry::new("liveness");
    let connector_liveness = liveness
        .register("firehose_connector", LIVENESS_INTERVAL * 3)
        .await;
    let forwarder_liveness = liveness
        .register("proxy_forwarder", config.self_report_interval.0 * 2)
        .await;

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let router = setup_metrics_routes(router)
        .map_err(|error| ConnectorError::SetupError(format!("metrics recorder: {error}")))?;
    let bind = config.bind();
    tokio::task::spawn(async move {
        if let Err(error) = serve(router, &bind).await {
            error!("failed to serve health and metrics on {bind}: {error}");
        }
    });

    let counters = Arc::new(PipelineCounters::new());
    let forwarder = Arc::new(ProxyForwarder::new(
        Arc::new(TcpProxyClient::new(config.proxy.address())),
        ForwarderConfig {
            prefix: config.proxy.metric_prefix.clone(),
            source: config.proxy.metric_source.clone(),
            timeout: config.proxy.proxy_forward_timeout.0,
            failure_threshold: config.proxy.proxy_failure_threshold,
        },
        counters.clone(),
    ));
    let enricher = build_enricher(&config, &counters)?;
    let client = HttpFirehoseClient::new(
        &config.firehose_url,
        config.firehose_token.as_deref(),
        FIREHOSE_CONNECT_TIMEOUT,
    )
    .map_err(|error| ConnectorError::SetupError(format!("firehose client: {error}")))?;

    let subscription_id = config.firehose_subscription_id.as_str().to_owned();
    let connector = FirehoseConnector::new(
        Arc::new(client),
        EventTypeFilter::new(config.firehose_event_types.0.iter().copied()),
        Arc::new(enricher),
        forwarder.clone(),
        counters.clone(),
        ConnectorConfig {
            subscription_id: subscription_id.clone(),
            parallelism: config.firehose_parallelism,
            retry_policy: config.reconnect.retry_policy(),
            shutdown_grace_period: config.shutdown_grace_period.0,
            liveness_interval: LIVENESS_INTERVAL,
        },
    )
    .with_liveness(connector_liveness);

    let reporter_shutdown = CancellationToken::new();
    let reporter = SelfMetricsReporter::new(
        forwarder,
        counters,
        subscription_id,
        config.self_report_interval.0,
    )
    .with_liveness(forwarder_liveness);
    let reporter = tokio::spawn(reporter.run(reporter_shutdown.clone()));

    connector.connect().await?;

    let result = tokio::select! {
        result = connector.wait() => result,
        _ = shutdown() => {
            connector.disconnect().await;
            Ok(())
        }
    };

    reporter_shutdown.cancel();
    if let Err(error) = reporter.await {
        error!("self metrics reporter failed: {error}");
    }

    result
}
