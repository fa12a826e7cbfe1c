//! instance boot & teardown hooks
//!
//! [`NetworkAllocator`] is the capability the compute side calls when an
//! instance is created or destroyed. [`FloatingNetworkManager`] layers
//! floating ip work over an inner allocator that owns the fixed ips.
use std::{fmt, net::IpAddr};

use anyhow::{Context, Result};
use async_trait::async_trait;
use fip_store::{Instance, Storage};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{ErrorKind, FloatingIpManager, RequestContext};

/// addresses of one instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub instance_uuid: Uuid,
    pub ips: Vec<IpInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpInfo {
    pub address: IpAddr,
    pub network_id: u64,
    pub floating_ips: Vec<IpAddr>,
}

impl NetworkInfo {
    pub fn fixed_ips(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.ips.iter().map(|ip| ip.address)
    }
}

#[async_trait]
pub trait NetworkAllocator: Send + Sync + fmt::Debug + 'static {
    async fn allocate_for_instance(
        &self,
        ctx: &RequestContext,
        instance: &Instance,
    ) -> Result<NetworkInfo>;

    async fn deallocate_for_instance(&self, ctx: &RequestContext, instance_uuid: Uuid)
    -> Result<()>;
}

/// Fixed ips come from the store as they were provisioned; nothing is handed
/// out or reclaimed here.
#[derive(Debug, Clone)]
pub struct StoreFixedIps<S> {
    store: S,
}

impl<S> StoreFixedIps<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S> NetworkAllocator for StoreFixedIps<S>
where
    S: Storage + fmt::Debug,
{
    async fn allocate_for_instance(
        &self,
        _ctx: &RequestContext,
        instance: &Instance,
    ) -> Result<NetworkInfo> {
        let ips = self
            .store
            .fixed_ip_get_by_instance(instance.uuid)
            .await
            .context("failed to look up fixed ips")?
            .into_iter()
            .map(|fixed| IpInfo {
                address: fixed.address,
                network_id: fixed.network_id,
                floating_ips: Vec::new(),
            })
            .collect();
        Ok(NetworkInfo {
            instance_uuid: instance.uuid,
            ips,
        })
    }

    async fn deallocate_for_instance(
        &self,
        _ctx: &RequestContext,
        instance_uuid: Uuid,
    ) -> Result<()> {
        debug!(%instance_uuid, "fixed ips stay with the store");
        Ok(())
    }
}

/// Floating ip handling around an inner fixed ip allocator `A`.
#[derive(Clone)]
pub struct FloatingNetworkManager<A, S> {
    inner: A,
    floating: FloatingIpManager<S>,
}

impl<A: fmt::Debug, S> fmt::Debug for FloatingNetworkManager<A, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FloatingNetworkManager")
            .field("inner", &self.inner)
            .field("floating", &self.floating)
            .finish()
    }
}

impl<A, S> FloatingNetworkManager<A, S>
where
    S: Storage,
{
    pub fn new(inner: A, floating: FloatingIpManager<S>) -> Self {
        Self { inner, floating }
    }

    pub fn floating(&self) -> &FloatingIpManager<S> {
        &self.floating
    }

    async fn with_floating(&self, mut info: NetworkInfo) -> Result<NetworkInfo> {
        for ip in &mut info.ips {
            ip.floating_ips = self
                .floating
                .get_floating_ips_by_fixed_address(ip.address)
                .await
                .context("failed to look up floating ips")?;
        }
        Ok(info)
    }
}

#[async_trait]
impl<A, S> NetworkAllocator for FloatingNetworkManager<A, S>
where
    A: NetworkAllocator,
    S: Storage,
{
    /// Allocate the fixed ips first. With `auto_assign_floating_ip` an
    /// address from the default pool is then bound to the first of them.
    async fn allocate_for_instance(
        &self,
        ctx: &RequestContext,
        instance: &Instance,
    ) -> Result<NetworkInfo> {
        let info = self.inner.allocate_for_instance(ctx, instance).await?;
        if !self.floating.opts().auto_assign_floating_ip {
            return self.with_floating(info).await;
        }
        let Some(fixed) = info.fixed_ips().next() else {
            warn!(instance_uuid = %instance.uuid, "instance has no fixed ip, no floating ip assigned");
            return Ok(info);
        };

        let floating = self
            .floating
            .allocate_floating_ip(ctx, &instance.project_id, true, None)
            .await
            .context("failed to allocate auto assigned floating ip")?;
        debug!(%floating, instance_uuid = %instance.uuid, "floating ip allocated for instance");
        self.floating
            .associate_floating_ip(ctx, floating, fixed, true)
            .await
            .with_context(|| format!("failed to associate {floating} with {fixed}"))?;
        info!(%floating, %fixed, instance_uuid = %instance.uuid, "floating ip auto assigned");
        self.with_floating(info).await
    }

    /// Unbind every floating ip on the instance's fixed ips and release the
    /// auto assigned ones before the inner allocator runs.
    async fn deallocate_for_instance(
        &self,
        ctx: &RequestContext,
        instance_uuid: Uuid,
    ) -> Result<()> {
        let store = self.floating.store();
        let fixed_ips = store
            .fixed_ip_get_by_instance(instance_uuid)
            .await
            .context("failed to look up fixed ips")?;
        for fixed in fixed_ips {
            let floating_ips = store
                .floating_ip_get_by_fixed_ip_id(fixed.id)
                .await
                .context("failed to look up floating ips")?;
            for fip in floating_ips {
                match self
                    .floating
                    .disassociate_floating_ip(ctx, fip.address, true)
                    .await
                {
                    Err(err) if err.kind() == ErrorKind::FloatingIpNotAssociated => {
                        warn!(address = %fip.address, "floating ip is not associated, ignoring");
                    }
                    res => res.with_context(|| {
                        format!("failed to disassociate floating ip {}", fip.address)
                    })?,
                }
                if fip.auto_assigned {
                    self.floating
                        .deallocate_floating_ip(ctx, fip.address, true)
                        .await
                        .with_context(|| {
                            format!("failed to deallocate floating ip {}", fip.address)
                        })?;
                }
            }
        }
        self.inner.deallocate_for_instance(ctx, instance_uuid).await
    }
}
