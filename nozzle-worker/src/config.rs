use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use nozzle_common::event::{EventKind, ParseEventKindError};
use nozzle_common::retry::RetryPolicy;

use crate::enricher::AppIdConvention;
use crate::error::ConfigError;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3301")]
    pub port: u16,

    #[envconfig(default = "http://localhost:8081")]
    pub firehose_url: String,

    pub firehose_subscription_id: NonEmptyString,

    pub firehose_token: Option<String>,

    #[envconfig(default = "CounterEvent,ValueMetric,ContainerMetric")]
    pub firehose_event_types: EventKinds,

    #[envconfig(default = "4")]
    pub firehose_parallelism: usize,

    #[envconfig(nested = true)]
    pub app_info: AppInfoConfig,

    #[envconfig(nested = true)]
    pub proxy: ProxyConfig,

    #[envconfig(nested = true)]
    pub reconnect: ReconnectConfig,

    #[envconfig(default = "60000")]
    pub self_report_interval: EnvMsDuration,

    #[envconfig(default = "5000")]
    pub shutdown_grace_period: EnvMsDuration,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Reject values that would leave the pipeline unable to make progress.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.firehose_parallelism == 0 {
            return Err(ConfigError::MustBePositive("FIREHOSE_PARALLELISM"));
        }
        for (name, duration) in [
            ("APP_INFO_FETCH_TIMEOUT", self.app_info.app_info_fetch_timeout),
            ("APP_INFO_LOOKUP_TIMEOUT", self.app_info.app_info_lookup_timeout),
            ("PROXY_FORWARD_TIMEOUT", self.proxy.proxy_forward_timeout),
            ("SELF_REPORT_INTERVAL", self.self_report_interval),
            ("RECONNECT_INITIAL_INTERVAL", self.reconnect.reconnect_initial_interval),
            ("RECONNECT_MAXIMUM_INTERVAL", self.reconnect.reconnect_maximum_interval),
        ] {
            if duration.0.is_zero() {
                return Err(ConfigError::MustBePositive(name));
            }
        }
        if self.reconnect.reconnect_backoff_coefficient == 0 {
            return Err(ConfigError::MustBePositive("RECONNECT_BACKOFF_COEFFICIENT"));
        }
        if self.reconnect.reconnect_maximum_interval.0 < self.reconnect.reconnect_initial_interval.0 {
            return Err(ConfigError::MaximumBelowInitial);
        }

        validate_url("FIREHOSE_URL", &self.firehose_url)?;
        if let Some(api_url) = &self.app_info.cf_api_url {
            validate_url("CF_API_URL", api_url)?;
        }

        Ok(())
    }
}

fn validate_url(name: &'static str, value: &str) -> Result<(), ConfigError> {
    url::Url::parse(value)
        .map(|_| ())
        .map_err(|_| ConfigError::InvalidUrl {
            name,
            value: value.to_owned(),
        })
}

#[derive(Envconfig, Clone)]
pub struct AppInfoConfig {
    /// Enrichment is disabled when no directory is configured.
    pub cf_api_url: Option<String>,

    pub cf_api_token: Option<String>,

    #[envconfig(default = "payload-v1")]
    pub app_id_convention: AppIdConvention,

    #[envconfig(default = "5000")]
    pub app_info_cache_size: u64,

    #[envconfig(default = "21600000")]
    pub app_info_cache_ttl: EnvMsDuration,

    #[envconfig(default = "300000")]
    pub app_info_not_found_ttl: EnvMsDuration,

    #[envconfig(default = "2000")]
    pub app_info_fetch_timeout: EnvMsDuration,

    #[envconfig(default = "1000")]
    pub app_info_lookup_timeout: EnvMsDuration,
}

#[derive(Envconfig, Clone)]
pub struct ProxyConfig {
    #[envconfig(default = "localhost")]
    pub proxy_hostname: String,

    #[envconfig(default = "2878")]
    pub proxy_port: u16,

    #[envconfig(default = "5000")]
    pub proxy_forward_timeout: EnvMsDuration,

    #[envconfig(default = "10")]
    pub proxy_failure_threshold: u64,

    #[envconfig(default = "pcf")]
    pub metric_prefix: String,

    #[envconfig(default = "pcf-nozzle")]
    pub metric_source: String,
}

impl ProxyConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.proxy_hostname, self.proxy_port)
    }
}

#[derive(Envconfig, Clone)]
pub struct ReconnectConfig {
    #[envconfig(default = "2")]
    pub reconnect_backoff_coefficient: u32,

    #[envconfig(default = "1000")]
    pub reconnect_initial_interval: EnvMsDuration,

    #[envconfig(default = "60000")]
    pub reconnect_maximum_interval: EnvMsDuration,

    pub reconnect_max_attempts: Option<u32>,
}

impl ReconnectConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::build(
            self.reconnect_backoff_coefficient,
            self.reconnect_initial_interval.0,
        )
        .maximum_interval(self.reconnect_maximum_interval.0)
        .maximum_attempts(self.reconnect_max_attempts)
        .provide()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

/// Comma separated list of event kinds. An empty value is a valid, empty allow-set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventKinds(pub Vec<EventKind>);

impl FromStr for EventKinds {
    type Err = ParseEventKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kinds = s
            .split(',')
            .map(str::trim)
            .filter(|kind| !kind.is_empty())
            .map(EventKind::from_str)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(EventKinds(kinds))
    }
}
