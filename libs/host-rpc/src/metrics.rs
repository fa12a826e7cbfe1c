#![allow(missing_docs)] // macros dont play nicely with docstrings

//! peer rpc counters
use lazy_static::lazy_static;
use prometheus::{
    HistogramVec, IntCounter, IntCounterVec, register_histogram_vec, register_int_counter,
    register_int_counter_vec,
};
use prometheus_static_metric::make_static_metric;

use crate::models::RpcRequest;

make_static_metric! {
    pub label_enum RpcMethod {
        associate,
        disassociate,
        migrate_start,
        migrate_finish,
    }
    pub struct RpcMethodStats: IntCounter {
        "method" => RpcMethod
    }
}

/// counter of `stats` for the method of `req`
pub fn by_method<'a>(stats: &'a RpcMethodStats, req: &RpcRequest) -> &'a IntCounter {
    match req {
        RpcRequest::AssociateFloatingIp(_) => &stats.associate,
        RpcRequest::DisassociateFloatingIp(_) => &stats.disassociate,
        RpcRequest::MigrateInstanceStart { .. } => &stats.migrate_start,
        RpcRequest::MigrateInstanceFinish { .. } => &stats.migrate_finish,
    }
}

lazy_static! {
    pub static ref RPC_SENT_VEC: IntCounterVec = register_int_counter_vec!(
        "fipd_rpc_sent",
        "requests sent to peer hosts by method",
        &["method"]
    )
    .unwrap();
    pub static ref RPC_SENT: RpcMethodStats = RpcMethodStats::from(&RPC_SENT_VEC);

    pub static ref RPC_HANDLED_VEC: IntCounterVec = register_int_counter_vec!(
        "fipd_rpc_handled",
        "requests served for peer hosts by method",
        &["method"]
    )
    .unwrap();
    pub static ref RPC_HANDLED: RpcMethodStats = RpcMethodStats::from(&RPC_HANDLED_VEC);

    /// round trip of requests to peers, in seconds
    pub static ref RPC_LATENCY: HistogramVec = register_histogram_vec!(
        "fipd_rpc_latency",
        "peer request round trip in seconds",
        &["method"]
    )
    .unwrap();

    pub static ref RPC_UNREACHABLE: IntCounter = register_int_counter!("fipd_rpc_unreachable", "count of peer requests without an answer").unwrap();
    pub static ref RPC_REMOTE_ERRORS: IntCounter = register_int_counter!("fipd_rpc_remote_errors", "count of peer requests answered with an error").unwrap();
    pub static ref RPC_DISPATCH_ERRORS: IntCounter = register_int_counter!("fipd_rpc_dispatch_errors", "count of incoming requests that could not be decoded").unwrap();
    pub static ref NOTIFY_PUBLISH_ERRORS: IntCounter = register_int_counter!("fipd_notify_publish_errors", "count of notifications that failed to publish").unwrap();
}
