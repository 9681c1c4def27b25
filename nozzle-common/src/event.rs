//! # Event
//!
//! The firehose envelope model consumed by the nozzle. Events are produced by a
//! bus client and only ever read by the pipeline.
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The telemetry bus event taxonomy.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    CounterEvent,
    ValueMetric,
    ContainerMetric,
    HttpStartStop,
    LogMessage,
    Error,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::CounterEvent,
        EventKind::ValueMetric,
        EventKind::ContainerMetric,
        EventKind::HttpStartStop,
        EventKind::LogMessage,
        EventKind::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::CounterEvent => "CounterEvent",
            EventKind::ValueMetric => "ValueMetric",
            EventKind::ContainerMetric => "ContainerMetric",
            EventKind::HttpStartStop => "HttpStartStop",
            EventKind::LogMessage => "LogMessage",
            EventKind::Error => "Error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEventKindError(pub String);

impl fmt::Display for ParseEventKindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} is not a valid event type", self.0)
    }
}

impl std::error::Error for ParseEventKindError {}

impl FromStr for EventKind {
    type Err = ParseEventKindError;

    /// Accepts both the envelope spelling (`CounterEvent`) and the
    /// screaming-snake spelling used in configuration (`COUNTER_EVENT`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| *c != '_')
            .map(|c| c.to_ascii_lowercase())
            .collect();

        match normalized.as_str() {
            "counterevent" => Ok(EventKind::CounterEvent),
            "valuemetric" => Ok(EventKind::ValueMetric),
            "containermetric" => Ok(EventKind::ContainerMetric),
            "httpstartstop" => Ok(EventKind::HttpStartStop),
            "logmessage" => Ok(EventKind::LogMessage),
            "error" => Ok(EventKind::Error),
            _ => Err(ParseEventKindError(s.to_owned())),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogMessageType {
    Out,
    Err,
}

impl LogMessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogMessageType::Out => "OUT",
            LogMessageType::Err => "ERR",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PeerType {
    Client,
    Server,
}

impl PeerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerType::Client => "client",
            PeerType::Server => "server",
        }
    }
}

/// Kind-specific event body. The envelope `eventType` field selects the variant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType")]
pub enum Payload {
    #[serde(rename_all = "camelCase")]
    CounterEvent { name: String, delta: u64, total: u64 },
    #[serde(rename_all = "camelCase")]
    ValueMetric {
        name: String,
        value: f64,
        #[serde(default)]
        unit: String,
    },
    #[serde(rename_all = "camelCase")]
    ContainerMetric {
        application_id: String,
        instance_index: i32,
        cpu_percentage: f64,
        memory_bytes: u64,
        disk_bytes: u64,
        #[serde(default)]
        memory_bytes_quota: u64,
        #[serde(default)]
        disk_bytes_quota: u64,
    },
    #[serde(rename_all = "camelCase")]
    HttpStartStop {
        start_timestamp: i64,
        stop_timestamp: i64,
        peer_type: PeerType,
        method: String,
        uri: String,
        status_code: i32,
        #[serde(default)]
        content_length: i64,
        #[serde(default)]
        application_id: Option<String>,
        #[serde(default)]
        instance_index: Option<i32>,
    },
    #[serde(rename_all = "camelCase")]
    LogMessage {
        message: String,
        message_type: LogMessageType,
        #[serde(default)]
        app_id: Option<String>,
        #[serde(default)]
        source_type: String,
        #[serde(default)]
        source_instance: String,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        source: String,
        code: i32,
        message: String,
    },
}

impl Payload {
    pub fn kind(&self) -> EventKind {
        match self {
            Payload::CounterEvent { .. } => EventKind::CounterEvent,
            Payload::ValueMetric { .. } => EventKind::ValueMetric,
            Payload::ContainerMetric { .. } => EventKind::ContainerMetric,
            Payload::HttpStartStop { .. } => EventKind::HttpStartStop,
            Payload::LogMessage { .. } => EventKind::LogMessage,
            Payload::Error { .. } => EventKind::Error,
        }
    }
}

/// A firehose envelope. Its kind is always the kind of its payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub origin: String,
    #[serde(default)]
    pub deployment: String,
    #[serde(default)]
    pub job: String,
    #[serde(default)]
    pub index: String,
    #[serde(default)]
    pub ip: String,
    /// Nanoseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(flatten)]
    pub payload: Payload,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// Event timestamp truncated to whole seconds.
    pub fn timestamp_seconds(&self) -> i64 {
        self.timestamp.div_euclid(1_000_000_000)
    }
}
