use std::net::IpAddr;

use fip_store::{BindOutcome, Storage};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    DisassociateRequest, EventType, FloatingIpError, FloatingIpManager, RequestContext, Route,
    metrics::{DRIVER_ERRORS, FLOATING_IPS_DISASSOCIATED},
};

impl<S> FloatingIpManager<S>
where
    S: Storage,
{
    /// Unbind `address` from its fixed ip.
    ///
    /// On a multi host network whose instance host is not heartbeating the
    /// store binding is cleared here and the L3 rule on that host is left
    /// behind.
    #[instrument(level = "debug", skip(self, ctx), fields(request_id = %ctx.request_id))]
    pub async fn disassociate_floating_ip(
        &self,
        ctx: &RequestContext,
        address: IpAddr,
        affect_auto_assigned: bool,
    ) -> Result<(), FloatingIpError<S::Error>> {
        let fip = self.floating_ip_for(address).await?;
        if fip.auto_assigned && !affect_auto_assigned {
            return Err(FloatingIpError::CannotDisassociateAutoAssignedFloatingIp(
                address,
            ));
        }
        self.check_owner(ctx, &fip)?;
        let Some(fixed_ip_id) = fip.fixed_ip_id else {
            return Err(FloatingIpError::FloatingIpNotAssociated(address));
        };
        let binding = self
            .store
            .fixed_ip_get_with_network(fixed_ip_id)
            .await?
            .ok_or(FloatingIpError::FixedIpNotFound(fixed_ip_id))?;

        let route = self
            .route_for(&binding.fixed_ip, &binding.network, true)
            .await?;
        let req = DisassociateRequest {
            address,
            interface: fip.interface.clone(),
            teardown: route != Route::Suppressed,
            instance_uuid: binding.fixed_ip.instance_uuid,
        };
        match route {
            Route::Remote(host) => {
                debug!(%address, host, "disassociating on authoritative peer");
                self.rpc
                    .disassociate_floating_ip(ctx, &host, req)
                    .await
                    .map_err(FloatingIpError::Rpc)
            }
            Route::Local | Route::Suppressed => self.disassociate_local(ctx, req).await,
        }
    }

    /// Clear the store binding and remove the L3 rule on this host. Also the
    /// entry point for peers forwarding a disassociation here.
    #[instrument(level = "debug", skip(self, ctx), fields(request_id = %ctx.request_id))]
    pub async fn disassociate_local(
        &self,
        ctx: &RequestContext,
        req: DisassociateRequest,
    ) -> Result<(), FloatingIpError<S::Error>> {
        let DisassociateRequest {
            address,
            interface,
            teardown,
            instance_uuid,
        } = req;
        let interface = if teardown {
            Some(self.resolve_interface(interface.as_deref())?)
        } else {
            None
        };

        let _guard = self.locks.lock(address).await;
        // the store is cleared before the rule is gone, a peer may bind the
        // address again in between
        let Some(prev) = self.store.floating_ip_disassociate(address).await? else {
            debug!(%address, "floating ip was already disassociated");
            return Ok(());
        };
        let fixed = prev.fixed_ip.address;

        if let Some(interface) = &interface
            && let Err(err) = self
                .l3
                .remove_floating_ip(address, fixed, interface, &prev.network)
                .await
        {
            DRIVER_ERRORS.inc();
            error!(?err, %address, %fixed, interface, "failed to remove floating ip rule");
            match self
                .store
                .floating_ip_fixed_ip_associate(address, fixed, &self.host)
                .await
            {
                Ok(BindOutcome::Bound(_) | BindOutcome::AlreadyBound) => {}
                Ok(BindOutcome::Conflict { fixed_ip_id }) => {
                    warn!(%address, fixed_ip_id, "could not restore binding, address was bound again");
                }
                Ok(BindOutcome::NotAllocated) => {
                    warn!(%address, "could not restore binding, address was released");
                }
                Err(undo) => error!(?undo, %address, "failed to restore floating ip binding"),
            }
            return Err(FloatingIpError::from_driver(err, interface));
        }

        info!(%address, %fixed, teardown, "floating ip disassociated");
        FLOATING_IPS_DISASSOCIATED.inc();
        self.notify(
            ctx,
            EventType::Disassociate,
            ctx.project_id.clone(),
            address,
            instance_uuid,
        )
        .await;
        Ok(())
    }
}
