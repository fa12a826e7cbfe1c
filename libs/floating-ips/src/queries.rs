use std::net::IpAddr;

use fip_store::{FloatingIp, Storage};

use crate::{FloatingIpError, FloatingIpManager, RequestContext};

impl<S> FloatingIpManager<S>
where
    S: Storage,
{
    pub async fn get_floating_ip(&self, id: u64) -> Result<FloatingIp, FloatingIpError<S::Error>> {
        self.store
            .floating_ip_get(id)
            .await?
            .ok_or(FloatingIpError::FloatingIpNotFound(id))
    }

    /// pool names, sorted
    pub async fn get_floating_ip_pools(&self) -> Result<Vec<String>, FloatingIpError<S::Error>> {
        Ok(self.store.floating_ip_get_pools().await?)
    }

    pub async fn get_floating_ip_by_address(
        &self,
        address: IpAddr,
    ) -> Result<FloatingIp, FloatingIpError<S::Error>> {
        self.floating_ip_for(address).await
    }

    /// Addresses owned by the caller's project. Contexts without a project
    /// own nothing.
    pub async fn get_floating_ips_by_project(
        &self,
        ctx: &RequestContext,
    ) -> Result<Vec<FloatingIp>, FloatingIpError<S::Error>> {
        match &ctx.project_id {
            Some(project_id) => Ok(self.store.floating_ip_get_all_by_project(project_id).await?),
            None => Ok(Vec::new()),
        }
    }

    /// floating addresses bound to `fixed`
    pub async fn get_floating_ips_by_fixed_address(
        &self,
        fixed: IpAddr,
    ) -> Result<Vec<IpAddr>, FloatingIpError<S::Error>> {
        Ok(self
            .store
            .floating_ip_get_by_fixed_address(fixed)
            .await?
            .into_iter()
            .map(|fip| fip.address)
            .collect())
    }

    pub async fn get_floating_ips_by_host(
        &self,
        host: &str,
    ) -> Result<Vec<FloatingIp>, FloatingIpError<S::Error>> {
        Ok(self.store.floating_ip_get_all_by_host(host).await?)
    }
}
