#![allow(missing_docs)] // macros dont play nicely with docstrings

//! engine counters
use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, register_int_counter, register_int_counter_vec};
use prometheus_static_metric::make_static_metric;

make_static_metric! {
    pub label_enum RouteKind {
        local,
        remote,
        suppressed,
    }
    pub struct RouteStats: IntCounter {
        "route" => RouteKind
    }
}

lazy_static! {
    pub static ref ROUTE_COUNT_VEC: IntCounterVec = register_int_counter_vec!(
        "floating_ip_route_counts",
        "where association and disassociation driver work ran",
        &["route"]
    )
    .unwrap();
    /// count of dispatch decisions by route
    pub static ref ROUTE_COUNT: RouteStats = RouteStats::from(&ROUTE_COUNT_VEC);

    pub static ref FLOATING_IPS_ALLOCATED: IntCounter = register_int_counter!("floating_ips_allocated", "count of floating ips allocated").unwrap();
    pub static ref FLOATING_IPS_DEALLOCATED: IntCounter = register_int_counter!("floating_ips_deallocated", "count of floating ips deallocated").unwrap();
    pub static ref FLOATING_IPS_ASSOCIATED: IntCounter = register_int_counter!("floating_ips_associated", "count of floating ips bound by this host").unwrap();
    pub static ref FLOATING_IPS_DISASSOCIATED: IntCounter = register_int_counter!("floating_ips_disassociated", "count of floating ips unbound by this host").unwrap();
    /// allocations refused by quota
    pub static ref QUOTA_REJECTIONS: IntCounter = register_int_counter!("floating_ip_quota_rejections", "count of allocations refused by quota").unwrap();
    /// l3 driver calls that failed
    pub static ref DRIVER_ERRORS: IntCounter = register_int_counter!("floating_ip_driver_errors", "count of failed l3 driver calls").unwrap();
    /// addresses skipped by migration because they went stale
    pub static ref MIGRATION_STALE_SKIPS: IntCounter = register_int_counter!("floating_ip_migration_stale_skips", "count of stale addresses skipped during migration").unwrap();
}
