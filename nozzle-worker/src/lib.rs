pub mod cache;
pub mod config;
pub mod connector;
pub mod counters;
pub mod directory;
pub mod enricher;
pub mod error;
pub mod filter;
pub mod firehose;
pub mod forwarder;
pub mod proxy;
pub mod reporter;
