use std::net::IpAddr;

use fip_store::{FloatingIp, Storage};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    FloatingIpError, FloatingIpManager, RequestContext, metrics::MIGRATION_STALE_SKIPS,
};

impl<S> FloatingIpManager<S>
where
    S: Storage,
{
    /// Tear down the L3 rules for `addresses` on the host the instance is
    /// leaving and clear their host tag.
    #[instrument(level = "debug", skip(self, ctx), fields(request_id = %ctx.request_id))]
    pub async fn migrate_instance_start(
        &self,
        ctx: &RequestContext,
        instance_uuid: Uuid,
        addresses: &[IpAddr],
        source: Option<&str>,
        dest: Option<&str>,
    ) -> Result<(), FloatingIpError<S::Error>> {
        if addresses.is_empty() || (source.is_some() && source == dest) {
            debug!(%instance_uuid, ?source, ?dest, "nothing to migrate");
            return Ok(());
        }
        for &address in addresses {
            let Some(fip) = self.current(ctx, address).await? else {
                continue;
            };
            let Some(fixed_ip_id) = fip.fixed_ip_id else {
                continue;
            };
            let binding = self
                .store
                .fixed_ip_get_with_network(fixed_ip_id)
                .await?
                .ok_or(FloatingIpError::FixedIpNotFound(fixed_ip_id))?;
            let interface = self.resolve_interface(fip.interface.as_deref())?;
            let fixed = binding.fixed_ip.address;

            let _guard = self.locks.lock(address).await;
            self.l3
                .remove_floating_ip(address, fixed, &interface, &binding.network)
                .await
                .map_err(|err| FloatingIpError::from_driver(err, &interface))?;
            self.l3
                .clean_conntrack(fixed)
                .await
                .map_err(|err| FloatingIpError::from_driver(err, &interface))?;
            self.store.floating_ip_update_host(address, None).await?;
            info!(%address, %fixed, %instance_uuid, ?source, "floating ip migration started");
        }
        Ok(())
    }

    /// Point `addresses` at the host the instance landed on and install their
    /// L3 rules here.
    ///
    /// `dest` falls back to `host`, then to this manager's host.
    #[instrument(level = "debug", skip(self, ctx), fields(request_id = %ctx.request_id))]
    pub async fn migrate_instance_finish(
        &self,
        ctx: &RequestContext,
        instance_uuid: Uuid,
        addresses: &[IpAddr],
        host: Option<&str>,
        source: Option<&str>,
        dest: Option<&str>,
    ) -> Result<(), FloatingIpError<S::Error>> {
        let dest = dest.or(host).unwrap_or(&self.host);
        if addresses.is_empty() || source == Some(dest) {
            debug!(%instance_uuid, ?source, dest, "nothing to migrate");
            return Ok(());
        }
        for &address in addresses {
            let Some(fip) = self.current(ctx, address).await? else {
                continue;
            };
            let Some(fixed_ip_id) = fip.fixed_ip_id else {
                continue;
            };
            let interface = self.resolve_interface(fip.interface.as_deref())?;

            let _guard = self.locks.lock(address).await;
            self.store
                .floating_ip_update_host(address, Some(dest))
                .await?;
            let binding = self
                .store
                .fixed_ip_get_with_network(fixed_ip_id)
                .await?
                .ok_or(FloatingIpError::FixedIpNotFound(fixed_ip_id))?;
            let fixed = binding.fixed_ip.address;
            self.l3
                .add_floating_ip(address, fixed, &interface, &binding.network)
                .await
                .map_err(|err| FloatingIpError::from_driver(err, &interface))?;
            info!(%address, %fixed, %instance_uuid, dest, "floating ip migration finished");
        }
        Ok(())
    }

    /// the record for `address`, or `None` when it is gone or stale
    async fn current(
        &self,
        ctx: &RequestContext,
        address: IpAddr,
    ) -> Result<Option<FloatingIp>, FloatingIpError<S::Error>> {
        match self.store.floating_ip_get_by_address(address).await? {
            Some(fip) if !self.is_stale(ctx, &fip) => Ok(Some(fip)),
            _ => {
                warn!(%address, "floating ip is stale, skipping migration");
                MIGRATION_STALE_SKIPS.inc();
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use fip_store::Storage;
    use tracing_test::traced_test;

    use crate::{
        RequestContext,
        testutil::{Call, Harness, INSTANCE_A, ip},
    };

    #[tokio::test]
    async fn start_then_finish_moves_host() {
        let h = Harness::new("net-1").await;
        let ctx = RequestContext::for_project("p1");
        let addr = h.allocate(&ctx).await;
        h.mgr
            .associate_floating_ip(&ctx, addr, ip(10, 0, 0, 5), false)
            .await
            .unwrap();

        h.mgr
            .migrate_instance_start(&ctx, INSTANCE_A, &[addr], Some("net-1"), Some("net-9"))
            .await
            .unwrap();
        let fip = h
            .store
            .floating_ip_get_by_address(addr)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fip.host, None);
        assert!(fip.is_associated());

        h.mgr
            .migrate_instance_finish(
                &ctx,
                INSTANCE_A,
                &[addr],
                None,
                Some("net-1"),
                Some("net-9"),
            )
            .await
            .unwrap();
        let fip = h
            .store
            .floating_ip_get_by_address(addr)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fip.host.as_deref(), Some("net-9"));
        assert_eq!(
            h.l3.calls(),
            vec![
                Call::Add(addr, ip(10, 0, 0, 5), "eth0".into()),
                Call::Remove(addr, ip(10, 0, 0, 5), "eth0".into()),
                Call::Conntrack(ip(10, 0, 0, 5)),
                Call::Add(addr, ip(10, 0, 0, 5), "eth0".into()),
            ]
        );
    }

    #[tokio::test]
    async fn same_host_or_no_addresses_is_a_noop() {
        let h = Harness::new("net-1").await;
        let ctx = RequestContext::for_project("p1");
        let addr = h.allocate(&ctx).await;
        h.mgr
            .associate_floating_ip(&ctx, addr, ip(10, 0, 0, 5), false)
            .await
            .unwrap();

        h.mgr
            .migrate_instance_start(&ctx, INSTANCE_A, &[addr], Some("net-1"), Some("net-1"))
            .await
            .unwrap();
        h.mgr
            .migrate_instance_start(&ctx, INSTANCE_A, &[], Some("net-1"), Some("net-2"))
            .await
            .unwrap();
        // dest defaults to this host
        h.mgr
            .migrate_instance_finish(&ctx, INSTANCE_A, &[addr], None, Some("net-1"), None)
            .await
            .unwrap();
        assert_eq!(h.l3.adds(), 1);
        assert_eq!(h.l3.calls().len(), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn stale_addresses_are_skipped() {
        let h = Harness::new("net-1").await;
        let ctx = RequestContext::for_project("p1");
        let bound = h.allocate(&ctx).await;
        let unbound = h.allocate(&ctx).await;
        h.mgr
            .associate_floating_ip(&ctx, bound, ip(10, 0, 0, 5), false)
            .await
            .unwrap();
        let gone = ip(203, 0, 113, 200);

        h.mgr
            .migrate_instance_start(
                &ctx,
                INSTANCE_A,
                &[unbound, gone, bound],
                Some("net-1"),
                Some("net-2"),
            )
            .await
            .unwrap();
        h.mgr
            .migrate_instance_finish(
                &ctx,
                INSTANCE_A,
                &[unbound, gone, bound],
                Some("net-2"),
                Some("net-1"),
                None,
            )
            .await
            .unwrap();

        assert_eq!(h.l3.adds(), 2);
        assert!(logs_contain("floating ip is stale"));
        let fip = h
            .store
            .floating_ip_get_by_address(bound)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fip.host.as_deref(), Some("net-2"));
    }

    #[tokio::test]
    async fn other_project_addresses_are_stale() {
        let h = Harness::new("net-1").await;
        let owner = RequestContext::for_project("p1");
        let addr = h.allocate(&owner).await;
        h.mgr
            .associate_floating_ip(&owner, addr, ip(10, 0, 0, 5), false)
            .await
            .unwrap();

        h.mgr
            .migrate_instance_start(
                &RequestContext::for_project("p2"),
                INSTANCE_A,
                &[addr],
                Some("net-1"),
                Some("net-2"),
            )
            .await
            .unwrap();
        assert_eq!(h.l3.calls().len(), 1);
        let fip = h
            .store
            .floating_ip_get_by_address(addr)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fip.host.as_deref(), Some("net-1"));
    }
}
