use fip_store::Storage;
use tracing::{debug, error, info, instrument, warn};

use crate::{FloatingIpError, FloatingIpManager, metrics::DRIVER_ERRORS};

impl<S> FloatingIpManager<S>
where
    S: Storage,
{
    /// Re-install the L3 rule of every bound floating ip tagged with this host.
    /// Called once on start-up before serving requests.
    #[instrument(level = "debug", skip(self), fields(host = %self.host))]
    pub async fn init_host(&self) -> Result<usize, FloatingIpError<S::Error>> {
        let mut applied = 0;
        for fip in self.store.floating_ip_get_all_by_host(&self.host).await? {
            let Some(fixed_ip_id) = fip.fixed_ip_id else {
                debug!(address = %fip.address, "floating ip is not associated, skipping");
                continue;
            };
            let Some(binding) = self.store.fixed_ip_get_with_network(fixed_ip_id).await? else {
                warn!(address = %fip.address, fixed_ip_id, "fixed ip is gone, skipping");
                continue;
            };
            let interface = self.resolve_interface(fip.interface.as_deref())?;
            let fixed = binding.fixed_ip.address;

            let _guard = self.locks.lock(fip.address).await;
            if let Err(err) = self
                .l3
                .add_floating_ip(fip.address, fixed, &interface, &binding.network)
                .await
            {
                DRIVER_ERRORS.inc();
                error!(?err, address = %fip.address, %fixed, interface, "failed to restore floating ip rule");
                return Err(FloatingIpError::NoFloatingIpInterface(interface));
            }
            applied += 1;
        }
        info!(applied, "floating ip rules restored");
        Ok(applied)
    }
}
