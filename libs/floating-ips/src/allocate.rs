use std::net::IpAddr;

use fip_store::{ReleaseOutcome, Storage};
use quota::Reservation;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    EventType, FloatingIpError, FloatingIpManager, RequestContext,
    metrics::{FLOATING_IPS_ALLOCATED, FLOATING_IPS_DEALLOCATED, QUOTA_REJECTIONS},
};

impl<S> FloatingIpManager<S>
where
    S: Storage,
{
    /// Take an address from `pool` (or the default pool) for `project_id`.
    ///
    /// Manually allocated addresses count against the project's
    /// `floating_ips` quota, auto assigned ones do not.
    #[instrument(level = "debug", skip(self, ctx), fields(request_id = %ctx.request_id))]
    pub async fn allocate_floating_ip(
        &self,
        ctx: &RequestContext,
        project_id: &str,
        auto_assigned: bool,
        pool: Option<&str>,
    ) -> Result<IpAddr, FloatingIpError<S::Error>> {
        if !ctx.is_admin && ctx.project_id.as_deref() != Some(project_id) {
            warn!(project_id, caller = ?ctx.project_id, "allocation for another project refused");
            return Err(FloatingIpError::NotAuthorized(format!(
                "can not allocate for project {project_id}"
            )));
        }
        let pool = pool.unwrap_or(&self.opts.default_floating_pool);

        let reservation = if auto_assigned {
            None
        } else {
            match Reservation::acquire(self.quota.clone(), project_id, 1).await {
                Ok(res) => Some(res),
                Err(err) => {
                    warn!(?err, project_id, "quota exceeded, tried to allocate floating ip");
                    QUOTA_REJECTIONS.inc();
                    return Err(FloatingIpError::from_quota(err));
                }
            }
        };

        let address = match self
            .store
            .floating_ip_allocate_address(project_id, pool, auto_assigned)
            .await
        {
            Ok(Some(address)) => address,
            Ok(None) => {
                rollback(reservation).await;
                return Err(FloatingIpError::NoMoreFloatingIps(pool.to_owned()));
            }
            Err(err) => {
                rollback(reservation).await;
                return Err(err.into());
            }
        };
        info!(%address, project_id, pool, auto_assigned, "floating ip allocated");
        self.notify(
            ctx,
            EventType::Allocate,
            Some(project_id.to_owned()),
            address,
            None,
        )
        .await;

        if let Some(res) = reservation
            && let Err(err) = res.commit().await
        {
            error!(?err, %address, project_id, "failed to commit floating ip quota reservation");
        }
        FLOATING_IPS_ALLOCATED.inc();
        Ok(address)
    }

    /// Return an unbound address to its pool.
    ///
    /// Auto assigned addresses are left alone unless `affect_auto_assigned`.
    #[instrument(level = "debug", skip(self, ctx), fields(request_id = %ctx.request_id))]
    pub async fn deallocate_floating_ip(
        &self,
        ctx: &RequestContext,
        address: IpAddr,
        affect_auto_assigned: bool,
    ) -> Result<(), FloatingIpError<S::Error>> {
        // binding check & release under the lock (dis)association takes
        let _guard = self.locks.lock(address).await;
        let fip = self.floating_ip_for(address).await?;
        if fip.auto_assigned && !affect_auto_assigned {
            debug!(%address, "floating ip is auto assigned, leaving it allocated");
            return Ok(());
        }
        self.check_owner(ctx, &fip)?;
        if fip.is_associated() {
            return Err(FloatingIpError::FloatingIpAssociated(address));
        }

        self.dns.delete_all_entries_for_address(address).await?;
        self.notify(
            ctx,
            EventType::Deallocate,
            fip.project_id.clone(),
            address,
            None,
        )
        .await;

        // usage is owed by the project holding the address
        let reservation = match (&fip.project_id, fip.auto_assigned) {
            (Some(project_id), false) => {
                match Reservation::acquire(self.quota.clone(), project_id, -1).await {
                    Ok(res) => Some(res),
                    Err(err) => {
                        error!(?err, %address, project_id, "failed to update usages deallocating floating ip");
                        None
                    }
                }
            }
            _ => None,
        };

        match self.store.floating_ip_deallocate(address).await {
            Ok(ReleaseOutcome::Released) => {}
            Ok(ReleaseOutcome::StillBound { fixed_ip_id }) => {
                warn!(%address, fixed_ip_id, "floating ip was bound by another host, not released");
                rollback(reservation).await;
                return Err(FloatingIpError::FloatingIpAssociated(address));
            }
            Err(err) => {
                rollback(reservation).await;
                return Err(err.into());
            }
        }
        if let Some(res) = reservation
            && let Err(err) = res.commit().await
        {
            error!(?err, %address, "failed to commit floating ip quota release");
        }
        info!(%address, "floating ip deallocated");
        FLOATING_IPS_DEALLOCATED.inc();
        Ok(())
    }
}

async fn rollback(reservation: Option<Reservation>) {
    if let Some(res) = reservation {
        let id = res.id();
        if let Err(err) = res.rollback().await {
            error!(?err, %id, "failed to roll back quota reservation");
        }
    }
}
