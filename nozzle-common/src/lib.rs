pub mod event;
pub mod metric_point;
pub mod metrics;
pub mod retry;
