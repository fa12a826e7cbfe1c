#![allow(missing_docs)] // macros dont play nicely with docstrings

//! # metrics
//!
//! process wide statistics. Engine and transport counters live next to the
//! code that bumps them (`floating_ips::metrics`, `host_rpc::metrics`).
use std::time::Instant;

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntGauge, register_int_counter, register_int_gauge};

lazy_static! {
    /// When the daemon started
    pub static ref START_TIME: Instant = Instant::now();
    /// daemon uptime
    pub static ref UPTIME: IntGauge = register_int_gauge!("uptime", "daemon uptime (seconds)").unwrap();

    /// service record heartbeats written
    pub static ref SERVICE_HEARTBEATS: IntCounter = register_int_counter!("service_heartbeats", "count of service heartbeats written to the store").unwrap();
    /// service record heartbeats that failed
    pub static ref SERVICE_HEARTBEAT_ERRORS: IntCounter = register_int_counter!("service_heartbeat_errors", "count of failed service heartbeats").unwrap();
}
