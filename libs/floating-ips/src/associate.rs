use std::net::IpAddr;

use fip_store::{BindOutcome, Storage};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    AssociateRequest, EventType, FloatingIpError, FloatingIpManager, RequestContext, Route,
    metrics::{DRIVER_ERRORS, FLOATING_IPS_ASSOCIATED},
};

impl<S> FloatingIpManager<S>
where
    S: Storage,
{
    /// Bind `floating` to `fixed`, moving it off any fixed ip it is bound to.
    ///
    /// The driver work runs on the authoritative host of `fixed`'s network,
    /// here or on a peer. Returns the instance the address was taken from, if
    /// it was bound elsewhere before.
    ///
    /// The caller is expected to have checked access to `fixed`; only the
    /// floating address's ownership is verified here.
    #[instrument(level = "debug", skip(self, ctx), fields(request_id = %ctx.request_id))]
    pub async fn associate_floating_ip(
        &self,
        ctx: &RequestContext,
        floating: IpAddr,
        fixed: IpAddr,
        affect_auto_assigned: bool,
    ) -> Result<Option<Uuid>, FloatingIpError<S::Error>> {
        let fip = self.floating_ip_for(floating).await?;
        if fip.auto_assigned && !affect_auto_assigned {
            debug!(%floating, "floating ip is auto assigned, not associating");
            return Ok(None);
        }
        self.check_owner(ctx, &fip)?;

        let target = self
            .store
            .fixed_ip_get_by_address(fixed)
            .await?
            .ok_or(FloatingIpError::FixedIpNotFoundForAddress(fixed))?;

        let mut previous = None;
        if let Some(bound_id) = fip.fixed_ip_id {
            if bound_id == target.id {
                debug!(%floating, %fixed, "already associated to this fixed ip");
                return Ok(None);
            }
            previous = self
                .store
                .fixed_ip_get(bound_id)
                .await?
                .and_then(|bound| bound.instance_uuid);
            self.disassociate_floating_ip(ctx, floating, affect_auto_assigned)
                .await?;
        }

        let network = self
            .store
            .network_get(target.network_id)
            .await?
            .ok_or(FloatingIpError::NetworkNotFound(target.network_id))?;
        let req = AssociateRequest {
            floating_address: floating,
            fixed_address: fixed,
            interface: fip.interface.clone(),
            instance_uuid: target.instance_uuid,
        };
        match self.route_for(&target, &network, false).await? {
            Route::Remote(host) => {
                debug!(%floating, %fixed, host, "associating on authoritative peer");
                self.rpc
                    .associate_floating_ip(ctx, &host, req)
                    .await
                    .map_err(FloatingIpError::Rpc)?;
            }
            Route::Local | Route::Suppressed => self.associate_local(ctx, req).await?,
        }
        Ok(previous)
    }

    /// Bind in the store and install the L3 rule on this host. Also the entry
    /// point for peers forwarding an association here.
    #[instrument(level = "debug", skip(self, ctx), fields(request_id = %ctx.request_id))]
    pub async fn associate_local(
        &self,
        ctx: &RequestContext,
        req: AssociateRequest,
    ) -> Result<(), FloatingIpError<S::Error>> {
        let AssociateRequest {
            floating_address: floating,
            fixed_address: fixed,
            interface,
            instance_uuid,
        } = req;
        let interface = self.resolve_interface(interface.as_deref())?;

        let _guard = self.locks.lock(floating).await;
        let binding = match self
            .store
            .floating_ip_fixed_ip_associate(floating, fixed, &self.host)
            .await?
        {
            BindOutcome::Bound(binding) => binding,
            BindOutcome::AlreadyBound => {
                debug!(%floating, %fixed, "floating ip was already associated");
                return Ok(());
            }
            BindOutcome::Conflict { fixed_ip_id } => {
                warn!(%floating, %fixed, fixed_ip_id, "floating ip was bound elsewhere concurrently");
                return Err(FloatingIpError::FloatingIpAssociated(floating));
            }
            BindOutcome::NotAllocated => {
                warn!(%floating, %fixed, "floating ip was released before it could be bound");
                return Err(FloatingIpError::NotAuthorized(format!(
                    "address {floating} is not allocated"
                )));
            }
        };

        if let Err(err) = self
            .l3
            .add_floating_ip(floating, fixed, &interface, &binding.network)
            .await
        {
            DRIVER_ERRORS.inc();
            error!(?err, %floating, %fixed, interface, "failed to add floating ip rule");
            if let Err(undo) = self.store.floating_ip_disassociate(floating).await {
                error!(?undo, %floating, "failed to undo floating ip binding");
            }
            return Err(FloatingIpError::from_driver(err, &interface));
        }

        info!(%floating, %fixed, interface, "floating ip associated");
        FLOATING_IPS_ASSOCIATED.inc();
        self.notify(
            ctx,
            EventType::Associate,
            ctx.project_id.clone(),
            floating,
            instance_uuid,
        )
        .await;
        Ok(())
    }
}
