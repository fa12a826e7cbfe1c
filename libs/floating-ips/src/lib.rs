//! # floating-ips
//!
//! The floating ip lifecycle: allocate an address from a pool to a project,
//! bind it to an instance's fixed ip, unbind it and hand it back, and move the
//! bindings along when an instance migrates between hosts.
//!
//! [`FloatingIpManager`] sits on top of a [`Storage`] and the gateways it calls
//! into (quota, L3 & DNS drivers, peer RPC, notifications). The store is
//! consulted on every call, nothing is cached between operations. The only
//! state the manager keeps is the per-address lock table that serializes L3
//! driver work for one address on this host.
//!
//! Binding changes run on the *authoritative host* of the fixed ip's network,
//! see [`host::authoritative_route`]. When that is a peer the request goes
//! over [`HostRpc`] and the peer runs [`FloatingIpManager::associate_local`] or
//! [`FloatingIpManager::disassociate_local`].
//!
//! [`Storage`]: fip_store::Storage
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::cognitive_complexity, clippy::too_many_arguments)]

use std::{fmt, net::IpAddr, sync::Arc};

use config::ManagerOpts;
use fip_store::{FixedIp, FloatingIp, Network, Storage};
use net_drivers::{DnsDriver, L3Driver};
use quota::QuotaDriver;
use tracing::{debug, warn};

mod allocate;
mod associate;
pub mod context;
mod disassociate;
pub mod dns;
pub mod error;
pub mod host;
mod init;
pub mod instance;
pub mod locks;
pub mod metrics;
mod migrate;
pub mod notify;
mod queries;
pub mod rpc;

#[cfg(test)]
mod testutil;

pub use context::RequestContext;
pub use dns::{DnsDomainManager, DomainInfo};
pub use error::{ErrorKind, FloatingIpError};
pub use host::{Route, ServiceLiveness, authoritative_route};
pub use instance::{FloatingNetworkManager, IpInfo, NetworkAllocator, NetworkInfo, StoreFixedIps};
pub use locks::AddressLocks;
pub use notify::{EventType, LogNotifier, Notification, Notifier, Payload};
pub use rpc::{AssociateRequest, DisassociateRequest, HostRpc, NoPeers, RpcError};

use crate::{host::Unroutable, metrics::ROUTE_COUNT};

pub struct FloatingIpManager<S> {
    host: String,
    store: S,
    opts: ManagerOpts,
    quota: Arc<dyn QuotaDriver>,
    l3: Arc<dyn L3Driver>,
    dns: DnsDomainManager<S>,
    rpc: Arc<dyn HostRpc>,
    notifier: Arc<dyn Notifier>,
    locks: AddressLocks,
}

impl<S: Clone> Clone for FloatingIpManager<S> {
    fn clone(&self) -> Self {
        Self {
            host: self.host.clone(),
            store: self.store.clone(),
            opts: self.opts.clone(),
            quota: self.quota.clone(),
            l3: self.l3.clone(),
            dns: self.dns.clone(),
            rpc: self.rpc.clone(),
            notifier: self.notifier.clone(),
            locks: self.locks.clone(),
        }
    }
}

impl<S> fmt::Debug for FloatingIpManager<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FloatingIpManager")
            .field("host", &self.host)
            .field("opts", &self.opts)
            .field("rpc", &self.rpc)
            .finish()
    }
}

impl<S> FloatingIpManager<S>
where
    S: Storage + Clone,
{
    /// A manager without peers that logs its notifications. Use
    /// [`Self::with_rpc`] & [`Self::with_notifier`] to replace either.
    pub fn new(
        host: impl Into<String>,
        store: S,
        opts: ManagerOpts,
        quota: Arc<dyn QuotaDriver>,
        l3: Arc<dyn L3Driver>,
        floating_dns: Arc<dyn DnsDriver>,
        instance_dns: Arc<dyn DnsDriver>,
    ) -> Self {
        Self {
            host: host.into(),
            dns: DnsDomainManager::new(store.clone(), floating_dns, instance_dns),
            store,
            opts,
            quota,
            l3,
            rpc: Arc::new(NoPeers),
            notifier: Arc::new(LogNotifier),
            locks: AddressLocks::new(),
        }
    }

    pub fn with_rpc(mut self, rpc: Arc<dyn HostRpc>) -> Self {
        self.rpc = rpc;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }
}

impl<S> FloatingIpManager<S>
where
    S: Storage,
{
    /// this manager's host name
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn opts(&self) -> &ManagerOpts {
        &self.opts
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn dns(&self) -> &DnsDomainManager<S> {
        &self.dns
    }

    pub fn locks(&self) -> &AddressLocks {
        &self.locks
    }

    async fn floating_ip_for(
        &self,
        address: IpAddr,
    ) -> Result<FloatingIp, FloatingIpError<S::Error>> {
        self.store
            .floating_ip_get_by_address(address)
            .await?
            .ok_or(FloatingIpError::FloatingIpNotFoundForAddress(address))
    }

    /// Owner check shared by every mutating operation. Admin contexts pass.
    fn check_owner(
        &self,
        ctx: &RequestContext,
        fip: &FloatingIp,
    ) -> Result<(), FloatingIpError<S::Error>> {
        if ctx.is_admin || fip.project_id == ctx.project_id {
            return Ok(());
        }
        match &fip.project_id {
            None => {
                warn!(address = %fip.address, "address is not allocated");
                Err(FloatingIpError::NotAuthorized(format!(
                    "address {} is not allocated",
                    fip.address
                )))
            }
            Some(_) => {
                warn!(address = %fip.address, project_id = ?ctx.project_id, "address is not allocated to this project");
                Err(FloatingIpError::NotAuthorized(format!(
                    "address {} is not allocated to your project",
                    fip.address
                )))
            }
        }
    }

    /// unowned by the caller or no longer bound
    fn is_stale(&self, ctx: &RequestContext, fip: &FloatingIp) -> bool {
        self.check_owner(ctx, fip).is_err() || !fip.is_associated()
    }

    /// The record's override, else the configured public interface. A
    /// per-address interface wins over `public_interface` even when a host
    /// default is configured.
    fn resolve_interface(
        &self,
        interface: Option<&str>,
    ) -> Result<String, FloatingIpError<S::Error>> {
        interface
            .or(self.opts.public_interface.as_deref())
            .map(str::to_owned)
            .ok_or_else(|| FloatingIpError::NoFloatingIpInterface("none configured".into()))
    }

    /// Where driver work for `fixed` has to happen. With `check_liveness` a
    /// multi host binding whose instance host is not heartbeating is routed
    /// [`Route::Suppressed`].
    async fn route_for(
        &self,
        fixed: &FixedIp,
        network: &Network,
        check_liveness: bool,
    ) -> Result<Route, FloatingIpError<S::Error>> {
        let instance = match (network.multi_host, fixed.instance_uuid) {
            (true, Some(uuid)) => Some(
                self.store
                    .instance_get_by_uuid(uuid)
                    .await?
                    .ok_or(FloatingIpError::InstanceNotFound(uuid))?,
            ),
            _ => None,
        };
        let liveness = if check_liveness && network.multi_host {
            self.liveness(instance.as_ref().and_then(|i| i.host.as_deref()))
                .await?
        } else {
            ServiceLiveness::Unchecked
        };
        let route = authoritative_route(&self.host, network, instance.as_ref(), liveness)
            .map_err(|reason: Unroutable| FloatingIpError::NoAuthoritativeHost {
                network: network.id,
                reason: reason.to_string(),
            })?;
        match &route {
            Route::Local => ROUTE_COUNT.local.inc(),
            Route::Remote(_) => ROUTE_COUNT.remote.inc(),
            Route::Suppressed => ROUTE_COUNT.suppressed.inc(),
        }
        debug!(?route, network = network.id, fixed = %fixed.address, "resolved authoritative host");
        Ok(route)
    }

    async fn liveness(
        &self,
        host: Option<&str>,
    ) -> Result<ServiceLiveness, FloatingIpError<S::Error>> {
        let Some(host) = host else {
            return Ok(ServiceLiveness::Down);
        };
        let service = self
            .store
            .service_get_by_host_and_topic(host, &self.opts.network_topic)
            .await?;
        Ok(match service {
            Some(svc)
                if host::service_is_up(
                    &svc,
                    chrono::Utc::now(),
                    self.opts.service_down_time,
                ) =>
            {
                ServiceLiveness::Up
            }
            Some(_) => {
                warn!(host, "network service is down, driver teardown suppressed");
                ServiceLiveness::Down
            }
            None => {
                warn!(host, "no network service registered, driver teardown suppressed");
                ServiceLiveness::Down
            }
        })
    }

    async fn notify(
        &self,
        ctx: &RequestContext,
        event_type: EventType,
        project_id: Option<String>,
        floating_ip: IpAddr,
        instance_id: Option<uuid::Uuid>,
    ) {
        self.notifier
            .notify(Notification::info(
                ctx,
                &self.host,
                event_type,
                Payload {
                    project_id,
                    floating_ip,
                    instance_id,
                },
            ))
            .await;
    }
}
