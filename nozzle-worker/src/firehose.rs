//! Telemetry bus subscription.
use std::time;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use nozzle_common::event::{Event, EventKind};
use reqwest::header;
use tokio::io::AsyncBufReadExt;
use tokio_util::io::StreamReader;
use tracing::debug;

use crate::error::FirehoseError;

/// The unbounded sequence of events produced by one subscription.
///
/// An `Err(FirehoseError::DecodeError)` item is a single bad envelope; any other
/// error means the subscription is broken. The stream ending means the bus closed it.
pub type EventStream = BoxStream<'static, Result<Event, FirehoseError>>;

#[async_trait]
pub trait FirehoseClient: Send + Sync + 'static {
    /// Open a subscription. `kinds` may be used by the bus for server-side filtering.
    async fn subscribe(
        &self,
        subscription_id: &str,
        kinds: &[EventKind],
    ) -> Result<EventStream, FirehoseError>;
}

/// Firehose gateway client reading newline-delimited JSON envelopes over HTTP.
pub struct HttpFirehoseClient {
    client: reqwest::Client,
    firehose_url: url::Url,
}

impl HttpFirehoseClient {
    pub fn new(
        firehose_url: &str,
        token: Option<&str>,
        connect_timeout: time::Duration,
    ) -> Result<Self, FirehoseError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/x-ndjson"),
        );
        if let Some(token) = token {
            let value = header::HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| FirehoseError::ConnectionError("invalid firehose token".to_owned()))?;
            headers.insert(header::AUTHORIZATION, value);
        }

        // No overall request timeout: the response body is the subscription.
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("Firehose Nozzle")
            .connect_timeout(connect_timeout)
            .build()?;

        let firehose_url = url::Url::parse(firehose_url)
            .map_err(|error| FirehoseError::ConnectionError(error.to_string()))?;

        Ok(Self {
            client,
            firehose_url,
        })
    }

    fn subscription_url(
        &self,
        subscription_id: &str,
        kinds: &[EventKind],
    ) -> Result<url::Url, FirehoseError> {
        let mut url = self
            .firehose_url
            .join(&format!("firehose/{subscription_id}"))
            .map_err(|error| FirehoseError::ConnectionError(error.to_string()))?;

        if !kinds.is_empty() {
            let event_types = kinds
                .iter()
                .map(EventKind::as_str)
                .collect::<Vec<_>>()
                .join(",");
            url.query_pairs_mut().append_pair("event_types", &event_types);
        }

        Ok(url)
    }
}

#[async_trait]
impl FirehoseClient for HttpFirehoseClient {
    async fn subscribe(
        &self,
        subscription_id: &str,
        kinds: &[EventKind],
    ) -> Result<EventStream, FirehoseError> {
        let url = self.subscription_url(subscription_id, kinds)?;
        let response = self.client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FirehoseError::SubscriptionRejected {
                status: status.as_u16(),
            });
        }
        debug!(subscription_id, "firehose subscription accepted");

        let body = response
            .bytes_stream()
            .map_err(std::io::Error::other)
            .boxed();
        // Split on raw bytes so a line that is not UTF-8 is one bad envelope, not a broken stream.
        let lines = StreamReader::new(body).split(b'\n');

        let events = stream::unfold(lines, |mut lines| async move {
            loop {
                match lines.next_segment().await {
                    Ok(Some(line)) if line.iter().all(u8::is_ascii_whitespace) => continue,
                    Ok(Some(line)) => {
                        let event = serde_json::from_slice::<Event>(&line)
                            .map_err(FirehoseError::from);
                        return Some((event, lines));
                    }
                    Ok(None) => return None,
                    Err(error) => {
                        return Some((Err(FirehoseError::StreamError(error.to_string())), lines))
                    }
                }
            }
        });

        Ok(events.boxed())
    }
}
