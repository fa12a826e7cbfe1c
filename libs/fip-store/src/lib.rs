//! # fip-store
//!
//! `fip-store` defines the trait `Storage`: every read and write the floating
//! ip engine makes against floating ips, fixed ips, networks, instances,
//! services and DNS domains.
//!
//! The engine never caches records between calls, so an implementation is the
//! single source of truth. The mutations that race between hosts are
//! conditional: see [`Storage::floating_ip_fixed_ip_associate`],
//! [`Storage::floating_ip_disassociate`] and [`Storage::floating_ip_deallocate`].
//! Together they keep a bound address owned and an unowned address unbound.
//!
//! [`Provision`] loads networks, instances and fixed ips, which the engine
//! only reads.
//!
//! [`memory::MemoryStore`] keeps everything in process.
use std::net::IpAddr;

use async_trait::async_trait;
use uuid::Uuid;

pub mod memory;
pub mod models;

pub use models::{
    BindOutcome, DnsDomain, DomainScope, FixedIp, FixedIpBinding, FloatingIp, Instance, Network,
    NewFloatingIp, ReleaseOutcome, Service,
};

#[async_trait]
pub trait Storage: Send + Sync + 'static {
    // send/sync/static required for async trait bounds
    type Error: std::error::Error + Send + Sync + 'static;

    async fn floating_ip_get(&self, id: u64) -> Result<Option<FloatingIp>, Self::Error>;
    async fn floating_ip_get_by_address(
        &self,
        address: IpAddr,
    ) -> Result<Option<FloatingIp>, Self::Error>;
    async fn floating_ip_get_all_by_host(&self, host: &str)
    -> Result<Vec<FloatingIp>, Self::Error>;
    async fn floating_ip_get_all_by_project(
        &self,
        project_id: &str,
    ) -> Result<Vec<FloatingIp>, Self::Error>;
    async fn floating_ip_get_by_fixed_address(
        &self,
        fixed: IpAddr,
    ) -> Result<Vec<FloatingIp>, Self::Error>;
    async fn floating_ip_get_by_fixed_ip_id(
        &self,
        fixed_ip_id: u64,
    ) -> Result<Vec<FloatingIp>, Self::Error>;
    /// distinct pool names, sorted
    async fn floating_ip_get_pools(&self) -> Result<Vec<String>, Self::Error>;
    /// insert unowned pool entries; all or nothing
    async fn floating_ip_bulk_create(&self, ips: Vec<NewFloatingIp>) -> Result<(), Self::Error>;

    /// Takes the first unowned address in `pool` for `project_id`, setting the
    /// auto-assigned flag in the same write.
    /// Returns `Ok(None)` if the pool has nothing left.
    async fn floating_ip_allocate_address(
        &self,
        project_id: &str,
        pool: &str,
        auto_assigned: bool,
    ) -> Result<Option<IpAddr>, Self::Error>;
    /// Clears owner, host and auto-assigned flag unless the address is bound.
    ///
    /// Returns
    ///     `Released` the address is unowned now
    ///     `StillBound` the address is bound to a fixed ip, nothing written
    ///     `Err` if the address is unknown
    async fn floating_ip_deallocate(&self, address: IpAddr)
    -> Result<ReleaseOutcome, Self::Error>;

    /// Compare-and-swap of the binding from unbound to `fixed`, tagging it with `host`.
    ///
    /// Returns
    ///     `Bound` the swap happened
    ///     `AlreadyBound` the address was bound to `fixed` already, nothing written
    ///     `Conflict` the address is bound to another fixed ip, nothing written
    ///     `NotAllocated` the address has no owner, nothing written
    ///     `Err` if either address is unknown
    async fn floating_ip_fixed_ip_associate(
        &self,
        floating: IpAddr,
        fixed: IpAddr,
        host: &str,
    ) -> Result<BindOutcome, Self::Error>;
    /// Clears the binding and the host tag.
    /// Returns the binding that was cleared, or `Ok(None)` if there was none.
    async fn floating_ip_disassociate(
        &self,
        address: IpAddr,
    ) -> Result<Option<FixedIpBinding>, Self::Error>;
    async fn floating_ip_update_host(
        &self,
        address: IpAddr,
        host: Option<&str>,
    ) -> Result<(), Self::Error>;

    async fn fixed_ip_get(&self, id: u64) -> Result<Option<FixedIp>, Self::Error>;
    async fn fixed_ip_get_with_network(
        &self,
        id: u64,
    ) -> Result<Option<FixedIpBinding>, Self::Error>;
    async fn fixed_ip_get_by_address(&self, address: IpAddr)
    -> Result<Option<FixedIp>, Self::Error>;
    async fn fixed_ip_get_by_instance(&self, instance: Uuid) -> Result<Vec<FixedIp>, Self::Error>;
    async fn network_get(&self, id: u64) -> Result<Option<Network>, Self::Error>;
    async fn instance_get_by_uuid(&self, uuid: Uuid) -> Result<Option<Instance>, Self::Error>;

    async fn service_get_by_host_and_topic(
        &self,
        host: &str,
        topic: &str,
    ) -> Result<Option<Service>, Self::Error>;
    /// creates the service on first call, afterwards bumps `updated_at`
    async fn service_heartbeat(&self, host: &str, topic: &str) -> Result<Service, Self::Error>;

    async fn dnsdomain_register_for_zone(
        &self,
        domain: &str,
        availability_zone: &str,
    ) -> Result<(), Self::Error>;
    async fn dnsdomain_register_for_project(
        &self,
        domain: &str,
        project_id: &str,
    ) -> Result<(), Self::Error>;
    async fn dnsdomain_unregister(&self, domain: &str) -> Result<(), Self::Error>;
    async fn dnsdomain_get(&self, domain: &str) -> Result<Option<DnsDomain>, Self::Error>;
    async fn dnsdomain_list(&self) -> Result<Vec<String>, Self::Error>;
}

/// Writes for the records the engine only reads. Used to load a store at
/// start-up, so every call tolerates records that are already there.
#[async_trait]
pub trait Provision: Storage {
    /// insert or replace a network
    async fn provision_network(&self, network: Network) -> Result<(), Self::Error>;
    /// insert or replace an instance
    async fn provision_instance(&self, instance: Instance) -> Result<(), Self::Error>;
    /// Insert a fixed ip on an existing network. An address that is already
    /// present is returned as it is.
    async fn provision_fixed_ip(
        &self,
        address: IpAddr,
        network_id: u64,
        instance_uuid: Option<Uuid>,
    ) -> Result<FixedIp, Self::Error>;
}
