//! Election metrics, recorded through the `metrics` crate facade.
//!
//! Install any `metrics` recorder (Prometheus exporter, statsd, ...) in the
//! host process to collect them. Every metric carries a `cluster` label.
//!
//! ## Counters
//! - `autoelect_acquired_total` - locks acquired
//! - `autoelect_vetoed_total` - acquisitions refused by the become-master callback
//! - `autoelect_lost_total` - master to candidate transitions
//! - `autoelect_errors_total` - backend errors
//! - `autoelect_session_resets_total` - lock handles rebuilt
//!
//! ## Gauges
//! - `autoelect_is_master` - 1 while this node is master

use metrics::{counter, gauge};

/// Metric names as constants for consistency.
pub mod names {
    pub const ACQUIRED_TOTAL: &str = "autoelect_acquired_total";
    pub const VETOED_TOTAL: &str = "autoelect_vetoed_total";
    pub const LOST_TOTAL: &str = "autoelect_lost_total";
    pub const ERRORS_TOTAL: &str = "autoelect_errors_total";
    pub const SESSION_RESETS_TOTAL: &str = "autoelect_session_resets_total";
    pub const IS_MASTER: &str = "autoelect_is_master";
}

pub fn record_acquired(cluster: &str) {
    counter!(names::ACQUIRED_TOTAL, "cluster" => cluster.to_owned()).increment(1);
}

pub fn record_vetoed(cluster: &str) {
    counter!(names::VETOED_TOTAL, "cluster" => cluster.to_owned()).increment(1);
}

pub fn record_lost(cluster: &str) {
    counter!(names::LOST_TOTAL, "cluster" => cluster.to_owned()).increment(1);
}

pub fn record_error(cluster: &str) {
    counter!(names::ERRORS_TOTAL, "cluster" => cluster.to_owned()).increment(1);
}

pub fn record_session_reset(cluster: &str) {
    counter!(names::SESSION_RESETS_TOTAL, "cluster" => cluster.to_owned()).increment(1);
}

pub fn set_master(cluster: &str, is_master: bool) {
    gauge!(names::IS_MASTER, "cluster" => cluster.to_owned()).set(if is_master { 1.0 } else { 0.0 });
}
