//! Which host's L3 driver carries a binding.
//!
//! A single host network has one authoritative host, the network's own. On a
//! multi host network the rule lives on whichever host runs the instance, so it
//! moves with the instance.
use std::time::Duration;

use chrono::{DateTime, Utc};
use fip_store::{Instance, Network, Service};
use thiserror::Error;

/// where driver work for a binding has to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// this host is authoritative
    Local,
    /// forward to the named peer
    Remote(String),
    /// authoritative host is down, change the store here and skip the driver
    Suppressed,
}

/// liveness of the instance host's service, only consulted for multi host networks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceLiveness {
    Up,
    Down,
    Unchecked,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Unroutable {
    #[error("network has no host")]
    NetworkHasNoHost,
    #[error("fixed ip has no instance")]
    NoInstance,
    #[error("instance is not scheduled on a host")]
    InstanceNotScheduled,
}

pub fn authoritative_route(
    local_host: &str,
    network: &Network,
    instance: Option<&Instance>,
    liveness: ServiceLiveness,
) -> Result<Route, Unroutable> {
    let host = if network.multi_host {
        if liveness == ServiceLiveness::Down {
            return Ok(Route::Suppressed);
        }
        instance
            .ok_or(Unroutable::NoInstance)?
            .host
            .as_deref()
            .ok_or(Unroutable::InstanceNotScheduled)?
    } else {
        network.host.as_deref().ok_or(Unroutable::NetworkHasNoHost)?
    };
    Ok(if host == local_host {
        Route::Local
    } else {
        Route::Remote(host.to_owned())
    })
}

/// a service is up while its last heartbeat is at most `down_time` old
pub fn service_is_up(service: &Service, now: DateTime<Utc>, down_time: Duration) -> bool {
    let elapsed = now.signed_duration_since(service.updated_at);
    match chrono::Duration::from_std(down_time) {
        Ok(limit) => elapsed <= limit,
        Err(_) => true,
    }
}
