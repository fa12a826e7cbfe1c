//! in-crate test fixtures
use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use config::{ManagerOpts, QuotaLimits};
use fip_store::{
    BindOutcome, DnsDomain, FixedIp, FixedIpBinding, FloatingIp, Instance, Network,
    NewFloatingIp, ReleaseOutcome, Service, Storage,
    memory::{MemoryError, MemoryStore},
};
use net_drivers::{DriverError, L3Driver, MemoryDnsDriver};
use parking_lot::Mutex;
use quota::{MemoryQuota, QuotaDriver, QuotaError};
use uuid::Uuid;

use crate::{EventType, FloatingIpManager, Notification, Notifier, RequestContext};

pub(crate) const INSTANCE_A: Uuid = Uuid::from_u128(0x5b8f0d6e_3c2a_4f7e_9a1d_2f6c1e0b7a11);
pub(crate) const INSTANCE_B: Uuid = Uuid::from_u128(0x9d04c1b2_77e3_4a55_8c0f_61d2a9e4b302);

pub(crate) fn ip(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
    IpAddr::from([a, b, c, d])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Add(IpAddr, IpAddr, String),
    Remove(IpAddr, IpAddr, String),
    Conntrack(IpAddr),
}

/// records successful calls, fails the next call when armed
#[derive(Debug, Default)]
pub(crate) struct RecordingL3 {
    calls: Mutex<Vec<Call>>,
    fail: Mutex<Option<DriverError>>,
}

impl RecordingL3 {
    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub(crate) fn adds(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, Call::Add(..)))
            .count()
    }

    pub(crate) fn fail_next(&self, err: DriverError) {
        *self.fail.lock() = Some(err);
    }

    fn record(&self, call: Call) -> Result<(), DriverError> {
        if let Some(err) = self.fail.lock().take() {
            return Err(err);
        }
        self.calls.lock().push(call);
        Ok(())
    }
}

#[async_trait]
impl L3Driver for RecordingL3 {
    async fn add_floating_ip(
        &self,
        floating: IpAddr,
        fixed: IpAddr,
        interface: &str,
        _network: &Network,
    ) -> Result<(), DriverError> {
        self.record(Call::Add(floating, fixed, interface.to_owned()))
    }

    async fn remove_floating_ip(
        &self,
        floating: IpAddr,
        fixed: IpAddr,
        interface: &str,
        _network: &Network,
    ) -> Result<(), DriverError> {
        self.record(Call::Remove(floating, fixed, interface.to_owned()))
    }

    async fn clean_conntrack(&self, fixed: IpAddr) -> Result<(), DriverError> {
        self.record(Call::Conntrack(fixed))
    }
}

#[derive(Debug, Default)]
pub(crate) struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub(crate) fn events(&self) -> Vec<EventType> {
        self.sent.lock().iter().map(|n| n.event_type).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: Notification) {
        self.sent.lock().push(notification);
    }
}

/// Memory quota that refuses every release while `fail_releases` is set.
#[derive(Debug)]
pub(crate) struct FlakyQuota {
    inner: Arc<MemoryQuota>,
    pub(crate) fail_releases: AtomicBool,
}

#[async_trait]
impl QuotaDriver for FlakyQuota {
    async fn reserve(&self, project_id: &str, floating_ips: i64) -> Result<Uuid, QuotaError> {
        if floating_ips < 0 && self.fail_releases.load(Ordering::SeqCst) {
            return Err(QuotaError::Backend("usage table locked".into()));
        }
        self.inner.reserve(project_id, floating_ips).await
    }

    async fn commit(&self, reservation: Uuid) -> Result<(), QuotaError> {
        self.inner.commit(reservation).await
    }

    async fn rollback(&self, reservation: Uuid) -> Result<(), QuotaError> {
        self.inner.rollback(reservation).await
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum FlakyError {
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error("pool {0} unavailable")]
    PoolUnavailable(String),
}

/// Memory store whose pool allocation errors while `fail_allocations` is set.
#[derive(Debug, Clone, Default)]
pub(crate) struct FlakyStore {
    inner: MemoryStore,
    pub(crate) fail_allocations: Arc<AtomicBool>,
}

#[async_trait]
impl Storage for FlakyStore {
    type Error = FlakyError;

    async fn floating_ip_get(&self, id: u64) -> Result<Option<FloatingIp>, Self::Error> {
        Ok(self.inner.floating_ip_get(id).await?)
    }
    async fn floating_ip_get_by_address(
        &self,
        address: IpAddr,
    ) -> Result<Option<FloatingIp>, Self::Error> {
        Ok(self.inner.floating_ip_get_by_address(address).await?)
    }
    async fn floating_ip_get_all_by_host(
        &self,
        host: &str,
    ) -> Result<Vec<FloatingIp>, Self::Error> {
        Ok(self.inner.floating_ip_get_all_by_host(host).await?)
    }
    async fn floating_ip_get_all_by_project(
        &self,
        project_id: &str,
    ) -> Result<Vec<FloatingIp>, Self::Error> {
        Ok(self.inner.floating_ip_get_all_by_project(project_id).await?)
    }
    async fn floating_ip_get_by_fixed_address(
        &self,
        fixed: IpAddr,
    ) -> Result<Vec<FloatingIp>, Self::Error> {
        Ok(self.inner.floating_ip_get_by_fixed_address(fixed).await?)
    }
    async fn floating_ip_get_by_fixed_ip_id(
        &self,
        fixed_ip_id: u64,
    ) -> Result<Vec<FloatingIp>, Self::Error> {
        Ok(self.inner.floating_ip_get_by_fixed_ip_id(fixed_ip_id).await?)
    }
    async fn floating_ip_get_pools(&self) -> Result<Vec<String>, Self::Error> {
        Ok(self.inner.floating_ip_get_pools().await?)
    }
    async fn floating_ip_bulk_create(&self, ips: Vec<NewFloatingIp>) -> Result<(), Self::Error> {
        Ok(self.inner.floating_ip_bulk_create(ips).await?)
    }
    async fn floating_ip_allocate_address(
        &self,
        project_id: &str,
        pool: &str,
        auto_assigned: bool,
    ) -> Result<Option<IpAddr>, Self::Error> {
        if self.fail_allocations.load(Ordering::SeqCst) {
            return Err(FlakyError::PoolUnavailable(pool.to_owned()));
        }
        Ok(self
            .inner
            .floating_ip_allocate_address(project_id, pool, auto_assigned)
            .await?)
    }
    async fn floating_ip_deallocate(
        &self,
        address: IpAddr,
    ) -> Result<ReleaseOutcome, Self::Error> {
        Ok(self.inner.floating_ip_deallocate(address).await?)
    }
    async fn floating_ip_fixed_ip_associate(
        &self,
        floating: IpAddr,
        fixed: IpAddr,
        host: &str,
    ) -> Result<BindOutcome, Self::Error> {
        Ok(self
            .inner
            .floating_ip_fixed_ip_associate(floating, fixed, host)
            .await?)
    }
    async fn floating_ip_disassociate(
        &self,
        address: IpAddr,
    ) -> Result<Option<FixedIpBinding>, Self::Error> {
        Ok(self.inner.floating_ip_disassociate(address).await?)
    }
    async fn floating_ip_update_host(
        &self,
        address: IpAddr,
        host: Option<&str>,
    ) -> Result<(), Self::Error> {
        Ok(self.inner.floating_ip_update_host(address, host).await?)
    }
    async fn fixed_ip_get(&self, id: u64) -> Result<Option<FixedIp>, Self::Error> {
        Ok(self.inner.fixed_ip_get(id).await?)
    }
    async fn fixed_ip_get_with_network(
        &self,
        id: u64,
    ) -> Result<Option<FixedIpBinding>, Self::Error> {
        Ok(self.inner.fixed_ip_get_with_network(id).await?)
    }
    async fn fixed_ip_get_by_address(
        &self,
        address: IpAddr,
    ) -> Result<Option<FixedIp>, Self::Error> {
        Ok(self.inner.fixed_ip_get_by_address(address).await?)
    }
    async fn fixed_ip_get_by_instance(&self, instance: Uuid) -> Result<Vec<FixedIp>, Self::Error> {
        Ok(self.inner.fixed_ip_get_by_instance(instance).await?)
    }
    async fn network_get(&self, id: u64) -> Result<Option<Network>, Self::Error> {
        Ok(self.inner.network_get(id).await?)
    }
    async fn instance_get_by_uuid(&self, uuid: Uuid) -> Result<Option<Instance>, Self::Error> {
        Ok(self.inner.instance_get_by_uuid(uuid).await?)
    }
    async fn service_get_by_host_and_topic(
        &self,
        host: &str,
        topic: &str,
    ) -> Result<Option<Service>, Self::Error> {
        Ok(self.inner.service_get_by_host_and_topic(host, topic).await?)
    }
    async fn service_heartbeat(&self, host: &str, topic: &str) -> Result<Service, Self::Error> {
        Ok(self.inner.service_heartbeat(host, topic).await?)
    }
    async fn dnsdomain_register_for_zone(
        &self,
        domain: &str,
        availability_zone: &str,
    ) -> Result<(), Self::Error> {
        Ok(self
            .inner
            .dnsdomain_register_for_zone(domain, availability_zone)
            .await?)
    }
    async fn dnsdomain_register_for_project(
        &self,
        domain: &str,
        project_id: &str,
    ) -> Result<(), Self::Error> {
        Ok(self
            .inner
            .dnsdomain_register_for_project(domain, project_id)
            .await?)
    }
    async fn dnsdomain_unregister(&self, domain: &str) -> Result<(), Self::Error> {
        Ok(self.inner.dnsdomain_unregister(domain).await?)
    }
    async fn dnsdomain_get(&self, domain: &str) -> Result<Option<DnsDomain>, Self::Error> {
        Ok(self.inner.dnsdomain_get(domain).await?)
    }
    async fn dnsdomain_list(&self) -> Result<Vec<String>, Self::Error> {
        Ok(self.inner.dnsdomain_list().await?)
    }
}

/// A manager on `host` over a seeded memory store.
///
/// pools: `public` 203.0.113.1-3, `nova` 198.51.100.1-2, `edge`
/// 198.51.100.64-65 on eth1. Network 1 is single host on `net-1` with
/// 10.0.0.5 (instance A) & 10.0.0.6, network 2 is multi host with 10.1.0.5
/// (instance B on `compute-2`).
pub(crate) struct Harness {
    pub(crate) mgr: FloatingIpManager<MemoryStore>,
    pub(crate) store: MemoryStore,
    pub(crate) quota: Arc<MemoryQuota>,
    pub(crate) l3: Arc<RecordingL3>,
    pub(crate) notifier: Arc<RecordingNotifier>,
    pub(crate) dns: Arc<MemoryDnsDriver>,
}

impl Harness {
    pub(crate) async fn new(host: &str) -> Self {
        Self::build(host, None, ManagerOpts::default()).await
    }

    pub(crate) async fn with_limit(host: &str, limit: u32) -> Self {
        Self::build(host, Some(limit), ManagerOpts::default()).await
    }

    pub(crate) async fn with_opts(host: &str, opts: ManagerOpts) -> Self {
        Self::build(host, None, opts).await
    }

    /// quota releases fail while the returned flag is set
    pub(crate) async fn with_flaky_quota(host: &str) -> (Self, Arc<FlakyQuota>) {
        let quota = Arc::new(MemoryQuota::new(QuotaLimits::default()));
        let flaky = Arc::new(FlakyQuota {
            inner: quota.clone(),
            fail_releases: AtomicBool::new(false),
        });
        let h = Self::build_with(host, ManagerOpts::default(), quota, flaky.clone()).await;
        (h, flaky)
    }

    async fn build(host: &str, limit: Option<u32>, opts: ManagerOpts) -> Self {
        let quota = Arc::new(MemoryQuota::new(QuotaLimits {
            default_floating_ips: limit,
            projects: HashMap::new(),
        }));
        Self::build_with(host, opts, quota.clone(), quota).await
    }

    async fn build_with(
        host: &str,
        opts: ManagerOpts,
        quota: Arc<MemoryQuota>,
        driver: Arc<dyn QuotaDriver>,
    ) -> Self {
        let store = seeded_store().await;
        let l3 = Arc::new(RecordingL3::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let dns = Arc::new(MemoryDnsDriver::new());
        let mgr = FloatingIpManager::new(
            host,
            store.clone(),
            opts,
            driver,
            l3.clone(),
            dns.clone(),
            Arc::new(MemoryDnsDriver::new()),
        )
        .with_notifier(notifier.clone());
        Self {
            mgr,
            store,
            quota,
            l3,
            notifier,
            dns,
        }
    }

    /// next address from `public` for project p1
    pub(crate) async fn allocate(&self, ctx: &RequestContext) -> IpAddr {
        self.mgr
            .allocate_floating_ip(ctx, "p1", false, Some("public"))
            .await
            .unwrap()
    }
}

/// manager over a [`FlakyStore`] with the usual seed, plus the quota it charges
pub(crate) async fn flaky_store_manager(
    host: &str,
) -> (FloatingIpManager<FlakyStore>, FlakyStore, Arc<MemoryQuota>) {
    let store = FlakyStore {
        inner: seeded_store().await,
        fail_allocations: Arc::default(),
    };
    let quota = Arc::new(MemoryQuota::new(QuotaLimits::default()));
    let mgr = FloatingIpManager::new(
        host,
        store.clone(),
        ManagerOpts::default(),
        quota.clone(),
        Arc::new(RecordingL3::default()),
        Arc::new(MemoryDnsDriver::new()),
        Arc::new(MemoryDnsDriver::new()),
    );
    (mgr, store, quota)
}

async fn seeded_store() -> MemoryStore {
    let store = MemoryStore::new();
    let pool = |pool: &str, interface: Option<&str>, addrs: &[IpAddr]| {
        addrs
            .iter()
            .map(|&address| NewFloatingIp {
                address,
                pool: pool.to_owned(),
                interface: interface.map(str::to_owned),
            })
            .collect::<Vec<_>>()
    };
    let mut ips = pool(
        "public",
        None,
        &[ip(203, 0, 113, 1), ip(203, 0, 113, 2), ip(203, 0, 113, 3)],
    );
    ips.extend(pool("nova", None, &[ip(198, 51, 100, 1), ip(198, 51, 100, 2)]));
    ips.extend(pool(
        "edge",
        Some("eth1"),
        &[ip(198, 51, 100, 64), ip(198, 51, 100, 65)],
    ));
    store.floating_ip_bulk_create(ips).await.unwrap();

    store.add_network(Network {
        id: 1,
        label: "private".into(),
        multi_host: false,
        host: Some("net-1".into()),
    });
    store.add_network(Network {
        id: 2,
        label: "multi".into(),
        multi_host: true,
        host: None,
    });
    store.add_instance(Instance {
        uuid: INSTANCE_A,
        host: Some("net-1".into()),
        project_id: "p1".into(),
    });
    store.add_instance(Instance {
        uuid: INSTANCE_B,
        host: Some("compute-2".into()),
        project_id: "p1".into(),
    });
    store.add_fixed_ip(ip(10, 0, 0, 5), 1, Some(INSTANCE_A)).unwrap();
    store.add_fixed_ip(ip(10, 0, 0, 6), 1, None).unwrap();
    store.add_fixed_ip(ip(10, 1, 0, 5), 2, Some(INSTANCE_B)).unwrap();
    store
}
