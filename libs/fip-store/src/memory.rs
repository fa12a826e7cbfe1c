use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::{
    BindOutcome, DnsDomain, DomainScope, FixedIp, FixedIpBinding, FloatingIp, Instance, Network,
    NewFloatingIp, Provision, ReleaseOutcome, Service, Storage,
};

/// process-local [`Storage`], cheap to clone
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Tables>>,
}

#[derive(Debug, Default)]
struct Tables {
    floating_ips: BTreeMap<IpAddr, FloatingIp>,
    fixed_ips: BTreeMap<u64, FixedIp>,
    networks: BTreeMap<u64, Network>,
    instances: HashMap<Uuid, Instance>,
    services: HashMap<(String, String), Service>,
    domains: BTreeMap<String, DnsDomain>,
    next_floating_id: u64,
    next_fixed_id: u64,
}

impl Tables {
    fn fixed_by_address(&self, address: IpAddr) -> Option<&FixedIp> {
        self.fixed_ips.values().find(|f| f.address == address)
    }

    fn binding(&self, fixed_ip_id: u64) -> Option<FixedIpBinding> {
        let fixed_ip = self.fixed_ips.get(&fixed_ip_id)?;
        let network = self.networks.get(&fixed_ip.network_id)?;
        Some(FixedIpBinding {
            fixed_ip: fixed_ip.clone(),
            network: network.clone(),
        })
    }

    fn floating_mut(&mut self, address: IpAddr) -> Result<&mut FloatingIp, MemoryError> {
        self.floating_ips
            .get_mut(&address)
            .ok_or(MemoryError::FloatingIpNotFound(address))
    }
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("floating ip already exists in memory store: {0}")]
    AddressExists(IpAddr),
    #[error("no floating ip in memory store for {0}")]
    FloatingIpNotFound(IpAddr),
    #[error("no fixed ip in memory store for {0}")]
    FixedIpNotFound(IpAddr),
    #[error("fixed ip already exists in memory store: {0}")]
    FixedIpExists(IpAddr),
    #[error("no network in memory store with id {0}")]
    NetworkNotFound(u64),
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// insert or replace a network
    pub fn add_network(&self, network: Network) {
        self.inner.lock().networks.insert(network.id, network);
    }

    /// insert a fixed ip on an existing network, returns the new record
    pub fn add_fixed_ip(
        &self,
        address: IpAddr,
        network_id: u64,
        instance_uuid: Option<Uuid>,
    ) -> Result<FixedIp, MemoryError> {
        let mut guard = self.inner.lock();
        if !guard.networks.contains_key(&network_id) {
            return Err(MemoryError::NetworkNotFound(network_id));
        }
        if guard.fixed_by_address(address).is_some() {
            return Err(MemoryError::FixedIpExists(address));
        }
        guard.next_fixed_id += 1;
        let fixed = FixedIp {
            id: guard.next_fixed_id,
            address,
            network_id,
            instance_uuid,
        };
        guard.fixed_ips.insert(fixed.id, fixed.clone());
        Ok(fixed)
    }

    /// insert or replace an instance
    pub fn add_instance(&self, instance: Instance) {
        self.inner.lock().instances.insert(instance.uuid, instance);
    }

    /// move an instance to another host, as the scheduler would
    pub fn set_instance_host(&self, uuid: Uuid, host: Option<&str>) {
        if let Some(instance) = self.inner.lock().instances.get_mut(&uuid) {
            instance.host = host.map(str::to_owned);
        }
    }

    /// insert or replace a service record verbatim, heartbeat time included
    pub fn put_service(&self, service: Service) {
        self.inner
            .lock()
            .services
            .insert((service.host.clone(), service.topic.clone()), service);
    }
}

#[async_trait]
impl Storage for MemoryStore {
    type Error = MemoryError;

    async fn floating_ip_get(&self, id: u64) -> Result<Option<FloatingIp>, Self::Error> {
        let guard = self.inner.lock();
        Ok(guard.floating_ips.values().find(|f| f.id == id).cloned())
    }

    async fn floating_ip_get_by_address(
        &self,
        address: IpAddr,
    ) -> Result<Option<FloatingIp>, Self::Error> {
        Ok(self.inner.lock().floating_ips.get(&address).cloned())
    }

    async fn floating_ip_get_all_by_host(
        &self,
        host: &str,
    ) -> Result<Vec<FloatingIp>, Self::Error> {
        let guard = self.inner.lock();
        Ok(guard
            .floating_ips
            .values()
            .filter(|f| f.host.as_deref() == Some(host))
            .cloned()
            .collect())
    }

    async fn floating_ip_get_all_by_project(
        &self,
        project_id: &str,
    ) -> Result<Vec<FloatingIp>, Self::Error> {
        let guard = self.inner.lock();
        Ok(guard
            .floating_ips
            .values()
            .filter(|f| f.project_id.as_deref() == Some(project_id))
            .cloned()
            .collect())
    }

    async fn floating_ip_get_by_fixed_address(
        &self,
        fixed: IpAddr,
    ) -> Result<Vec<FloatingIp>, Self::Error> {
        let guard = self.inner.lock();
        let Some(fixed_ip) = guard.fixed_by_address(fixed) else {
            return Ok(Vec::new());
        };
        let id = fixed_ip.id;
        Ok(guard
            .floating_ips
            .values()
            .filter(|f| f.fixed_ip_id == Some(id))
            .cloned()
            .collect())
    }

    async fn floating_ip_get_by_fixed_ip_id(
        &self,
        fixed_ip_id: u64,
    ) -> Result<Vec<FloatingIp>, Self::Error> {
        let guard = self.inner.lock();
        Ok(guard
            .floating_ips
            .values()
            .filter(|f| f.fixed_ip_id == Some(fixed_ip_id))
            .cloned()
            .collect())
    }

    async fn floating_ip_get_pools(&self) -> Result<Vec<String>, Self::Error> {
        let guard = self.inner.lock();
        let pools = guard
            .floating_ips
            .values()
            .map(|f| f.pool.clone())
            .collect::<BTreeSet<_>>();
        Ok(pools.into_iter().collect())
    }

    async fn floating_ip_bulk_create(&self, ips: Vec<NewFloatingIp>) -> Result<(), Self::Error> {
        let mut guard = self.inner.lock();
        let mut seen = BTreeSet::new();
        for ip in &ips {
            if guard.floating_ips.contains_key(&ip.address) || !seen.insert(ip.address) {
                return Err(MemoryError::AddressExists(ip.address));
            }
        }
        let count = ips.len();
        for ip in ips {
            guard.next_floating_id += 1;
            let id = guard.next_floating_id;
            guard.floating_ips.insert(
                ip.address,
                FloatingIp {
                    id,
                    address: ip.address,
                    pool: ip.pool,
                    project_id: None,
                    fixed_ip_id: None,
                    auto_assigned: false,
                    host: None,
                    interface: ip.interface,
                },
            );
        }
        debug!(count, "created floating ips");
        Ok(())
    }

    async fn floating_ip_allocate_address(
        &self,
        project_id: &str,
        pool: &str,
        auto_assigned: bool,
    ) -> Result<Option<IpAddr>, Self::Error> {
        let mut guard = self.inner.lock();
        let free = guard
            .floating_ips
            .values_mut()
            .find(|f| f.pool == pool && f.project_id.is_none());
        Ok(free.map(|f| {
            f.project_id = Some(project_id.to_owned());
            f.auto_assigned = auto_assigned;
            f.address
        }))
    }

    async fn floating_ip_deallocate(
        &self,
        address: IpAddr,
    ) -> Result<ReleaseOutcome, Self::Error> {
        let mut guard = self.inner.lock();
        Ok(guard.floating_mut(address)?.try_release())
    }

    async fn floating_ip_fixed_ip_associate(
        &self,
        floating: IpAddr,
        fixed: IpAddr,
        host: &str,
    ) -> Result<BindOutcome, Self::Error> {
        let mut guard = self.inner.lock();
        let binding = guard
            .fixed_by_address(fixed)
            .and_then(|f| guard.binding(f.id))
            .ok_or(MemoryError::FixedIpNotFound(fixed))?;
        Ok(guard.floating_mut(floating)?.try_bind(binding, host))
    }

    async fn floating_ip_disassociate(
        &self,
        address: IpAddr,
    ) -> Result<Option<FixedIpBinding>, Self::Error> {
        let mut guard = self.inner.lock();
        let Some(fixed_ip_id) = guard.floating_mut(address)?.unbind() else {
            return Ok(None);
        };
        Ok(guard.binding(fixed_ip_id))
    }

    async fn floating_ip_update_host(
        &self,
        address: IpAddr,
        host: Option<&str>,
    ) -> Result<(), Self::Error> {
        let mut guard = self.inner.lock();
        guard.floating_mut(address)?.host = host.map(str::to_owned);
        Ok(())
    }

    async fn fixed_ip_get(&self, id: u64) -> Result<Option<FixedIp>, Self::Error> {
        Ok(self.inner.lock().fixed_ips.get(&id).cloned())
    }

    async fn fixed_ip_get_with_network(
        &self,
        id: u64,
    ) -> Result<Option<FixedIpBinding>, Self::Error> {
        Ok(self.inner.lock().binding(id))
    }

    async fn fixed_ip_get_by_address(
        &self,
        address: IpAddr,
    ) -> Result<Option<FixedIp>, Self::Error> {
        Ok(self.inner.lock().fixed_by_address(address).cloned())
    }

    async fn fixed_ip_get_by_instance(&self, instance: Uuid) -> Result<Vec<FixedIp>, Self::Error> {
        let guard = self.inner.lock();
        Ok(guard
            .fixed_ips
            .values()
            .filter(|f| f.instance_uuid == Some(instance))
            .cloned()
            .collect())
    }

    async fn network_get(&self, id: u64) -> Result<Option<Network>, Self::Error> {
        Ok(self.inner.lock().networks.get(&id).cloned())
    }

    async fn instance_get_by_uuid(&self, uuid: Uuid) -> Result<Option<Instance>, Self::Error> {
        Ok(self.inner.lock().instances.get(&uuid).cloned())
    }

    async fn service_get_by_host_and_topic(
        &self,
        host: &str,
        topic: &str,
    ) -> Result<Option<Service>, Self::Error> {
        let guard = self.inner.lock();
        Ok(guard
            .services
            .get(&(host.to_owned(), topic.to_owned()))
            .cloned())
    }

    async fn service_heartbeat(&self, host: &str, topic: &str) -> Result<Service, Self::Error> {
        let mut guard = self.inner.lock();
        let service = guard
            .services
            .entry((host.to_owned(), topic.to_owned()))
            .or_insert_with(|| Service {
                host: host.to_owned(),
                topic: topic.to_owned(),
                updated_at: Utc::now(),
                disabled: false,
            });
        service.updated_at = Utc::now();
        Ok(service.clone())
    }

    async fn dnsdomain_register_for_zone(
        &self,
        domain: &str,
        availability_zone: &str,
    ) -> Result<(), Self::Error> {
        self.inner.lock().domains.insert(
            domain.to_owned(),
            DnsDomain {
                domain: domain.to_owned(),
                scope: DomainScope::Private {
                    availability_zone: availability_zone.to_owned(),
                },
            },
        );
        Ok(())
    }

    async fn dnsdomain_register_for_project(
        &self,
        domain: &str,
        project_id: &str,
    ) -> Result<(), Self::Error> {
        self.inner.lock().domains.insert(
            domain.to_owned(),
            DnsDomain {
                domain: domain.to_owned(),
                scope: DomainScope::Public {
                    project_id: project_id.to_owned(),
                },
            },
        );
        Ok(())
    }

    async fn dnsdomain_unregister(&self, domain: &str) -> Result<(), Self::Error> {
        self.inner.lock().domains.remove(domain);
        Ok(())
    }

    async fn dnsdomain_get(&self, domain: &str) -> Result<Option<DnsDomain>, Self::Error> {
        Ok(self.inner.lock().domains.get(domain).cloned())
    }

    async fn dnsdomain_list(&self) -> Result<Vec<String>, Self::Error> {
        Ok(self.inner.lock().domains.keys().cloned().collect())
    }
}

#[async_trait]
impl Provision for MemoryStore {
    async fn provision_network(&self, network: Network) -> Result<(), Self::Error> {
        self.add_network(network);
        Ok(())
    }

    async fn provision_instance(&self, instance: Instance) -> Result<(), Self::Error> {
        self.add_instance(instance);
        Ok(())
    }

    async fn provision_fixed_ip(
        &self,
        address: IpAddr,
        network_id: u64,
        instance_uuid: Option<Uuid>,
    ) -> Result<FixedIp, Self::Error> {
        if let Some(existing) = self.inner.lock().fixed_by_address(address) {
            return Ok(existing.clone());
        }
        self.add_fixed_ip(address, network_id, instance_uuid)
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use chrono::Duration;
    use uuid::Uuid;

    use super::MemoryStore;
    use crate::{
        BindOutcome, Instance, Network, NewFloatingIp, Provision, ReleaseOutcome, Service, Storage,
    };

    fn ip(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .floating_ip_bulk_create(
                (1..=3)
                    .map(|n| NewFloatingIp {
                        address: ip(203, 0, 113, n),
                        pool: "public".into(),
                        interface: None,
                    })
                    .collect(),
            )
            .await
            .expect("seed pool");
        store.add_network(Network {
            id: 1,
            label: "private".into(),
            multi_host: false,
            host: Some("net-1".into()),
        });
        store
            .add_fixed_ip(ip(10, 0, 0, 5), 1, None)
            .expect("fixed ip 5");
        store
            .add_fixed_ip(ip(10, 0, 0, 6), 1, None)
            .expect("fixed ip 6");
        store
    }

    #[tokio::test]
    async fn allocate_takes_lowest_free_address_until_exhausted() {
        let store = seeded().await;
        let mut got = Vec::new();
        while let Some(addr) = store
            .floating_ip_allocate_address("p1", "public", false)
            .await
            .expect("allocate")
        {
            got.push(addr);
        }
        assert_eq!(
            got,
            vec![ip(203, 0, 113, 1), ip(203, 0, 113, 2), ip(203, 0, 113, 3)]
        );
        assert_eq!(
            store
                .floating_ip_allocate_address("p1", "other-pool", false)
                .await
                .expect("allocate"),
            None
        );
        assert_eq!(
            store
                .floating_ip_get_all_by_project("p1")
                .await
                .expect("by project")
                .len(),
            3
        );
    }

    #[tokio::test]
    async fn bulk_create_is_all_or_nothing() {
        let store = seeded().await;
        let err = store
            .floating_ip_bulk_create(vec![
                NewFloatingIp {
                    address: ip(198, 51, 100, 1),
                    pool: "nova".into(),
                    interface: None,
                },
                NewFloatingIp {
                    address: ip(203, 0, 113, 1),
                    pool: "nova".into(),
                    interface: None,
                },
            ])
            .await;
        assert!(err.is_err());
        assert!(
            store
                .floating_ip_get_by_address(ip(198, 51, 100, 1))
                .await
                .expect("lookup")
                .is_none()
        );
        assert_eq!(
            store.floating_ip_get_pools().await.expect("pools"),
            vec!["public".to_string()]
        );
    }

    #[tokio::test]
    async fn bind_is_compare_and_swap() {
        let store = seeded().await;
        let floating = store
            .floating_ip_allocate_address("p1", "public", false)
            .await
            .expect("allocate")
            .expect("address");

        match store
            .floating_ip_fixed_ip_associate(floating, ip(10, 0, 0, 5), "net-1")
            .await
            .expect("first bind")
        {
            BindOutcome::Bound(binding) => {
                assert_eq!(binding.fixed_ip.address, ip(10, 0, 0, 5));
                assert_eq!(binding.network.id, 1);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(
            store
                .floating_ip_fixed_ip_associate(floating, ip(10, 0, 0, 5), "net-2")
                .await
                .expect("same bind"),
            BindOutcome::AlreadyBound
        );
        assert!(matches!(
            store
                .floating_ip_fixed_ip_associate(floating, ip(10, 0, 0, 6), "net-2")
                .await
                .expect("other bind"),
            BindOutcome::Conflict { .. }
        ));

        // losing writers changed nothing
        let fip = store
            .floating_ip_get_by_address(floating)
            .await
            .expect("lookup")
            .expect("exists");
        assert_eq!(fip.host.as_deref(), Some("net-1"));
        let fixed = store
            .fixed_ip_get_by_address(ip(10, 0, 0, 5))
            .await
            .expect("lookup")
            .expect("exists");
        assert_eq!(fip.fixed_ip_id, Some(fixed.id));
    }

    #[tokio::test]
    async fn unbind_reports_previous_binding_once() {
        let store = seeded().await;
        let floating = store
            .floating_ip_allocate_address("p1", "public", false)
            .await
            .expect("allocate")
            .expect("address");
        store
            .floating_ip_fixed_ip_associate(floating, ip(10, 0, 0, 6), "net-1")
            .await
            .expect("bind");

        let prev = store
            .floating_ip_disassociate(floating)
            .await
            .expect("unbind")
            .expect("was bound");
        assert_eq!(prev.fixed_ip.address, ip(10, 0, 0, 6));
        assert!(
            store
                .floating_ip_disassociate(floating)
                .await
                .expect("second unbind")
                .is_none()
        );
        let fip = store
            .floating_ip_get_by_address(floating)
            .await
            .expect("lookup")
            .expect("exists");
        assert_eq!(fip.host, None);
    }

    #[tokio::test]
    async fn bind_unknown_fixed_address_errors() {
        let store = seeded().await;
        let res = store
            .floating_ip_fixed_ip_associate(ip(203, 0, 113, 1), ip(10, 9, 9, 9), "net-1")
            .await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn deallocate_clears_ownership() {
        let store = seeded().await;
        let addr = store
            .floating_ip_allocate_address("p1", "public", true)
            .await
            .expect("allocate")
            .expect("address");
        assert!(
            store
                .floating_ip_get_by_address(addr)
                .await
                .expect("lookup")
                .expect("exists")
                .auto_assigned
        );
        store
            .floating_ip_update_host(addr, Some("net-1"))
            .await
            .expect("host");
        assert_eq!(
            store.floating_ip_deallocate(addr).await.expect("dealloc"),
            ReleaseOutcome::Released
        );

        let fip = store
            .floating_ip_get_by_address(addr)
            .await
            .expect("lookup")
            .expect("exists");
        assert!(!fip.is_allocated());
        assert!(!fip.auto_assigned);
        assert_eq!(fip.host, None);
    }

    #[tokio::test]
    async fn unowned_address_is_never_bound() {
        let store = seeded().await;
        let floating = ip(203, 0, 113, 3);
        assert_eq!(
            store
                .floating_ip_fixed_ip_associate(floating, ip(10, 0, 0, 5), "net-1")
                .await
                .expect("bind"),
            BindOutcome::NotAllocated
        );
        let fip = store
            .floating_ip_get_by_address(floating)
            .await
            .expect("lookup")
            .expect("exists");
        assert_eq!(fip.fixed_ip_id, None);
        assert_eq!(fip.host, None);
    }

    #[tokio::test]
    async fn bound_address_is_never_released() {
        let store = seeded().await;
        let floating = store
            .floating_ip_allocate_address("p1", "public", false)
            .await
            .expect("allocate")
            .expect("address");
        store
            .floating_ip_fixed_ip_associate(floating, ip(10, 0, 0, 5), "net-1")
            .await
            .expect("bind");

        assert!(matches!(
            store.floating_ip_deallocate(floating).await.expect("dealloc"),
            ReleaseOutcome::StillBound { .. }
        ));
        let fip = store
            .floating_ip_get_by_address(floating)
            .await
            .expect("lookup")
            .expect("exists");
        assert_eq!(fip.project_id.as_deref(), Some("p1"));
        assert!(fip.is_associated());
        assert_eq!(fip.host.as_deref(), Some("net-1"));
    }

    #[tokio::test]
    async fn provisioning_twice_keeps_the_first_fixed_ip() {
        let store = seeded().await;
        let uuid = Uuid::new_v4();
        let first = store
            .provision_fixed_ip(ip(10, 0, 0, 9), 1, Some(uuid))
            .await
            .expect("provision");
        let again = store
            .provision_fixed_ip(ip(10, 0, 0, 9), 1, None)
            .await
            .expect("provision again");
        assert_eq!(first, again);
        assert!(store.provision_fixed_ip(ip(10, 0, 0, 10), 42, None).await.is_err());
    }

    #[tokio::test]
    async fn heartbeat_refreshes_service() {
        let store = MemoryStore::new();
        let stale = chrono::Utc::now() - Duration::minutes(10);
        store.put_service(Service {
            host: "net-1".into(),
            topic: "network".into(),
            updated_at: stale,
            disabled: false,
        });
        let svc = store
            .service_heartbeat("net-1", "network")
            .await
            .expect("heartbeat");
        assert!(svc.updated_at > stale);
        assert!(
            store
                .service_get_by_host_and_topic("net-2", "network")
                .await
                .expect("lookup")
                .is_none()
        );
    }

    #[tokio::test]
    async fn instance_and_fixed_ip_lookups() {
        let store = seeded().await;
        let uuid = Uuid::new_v4();
        store.add_instance(Instance {
            uuid,
            host: Some("compute-1".into()),
            project_id: "p1".into(),
        });
        store
            .add_fixed_ip(ip(10, 0, 0, 7), 1, Some(uuid))
            .expect("fixed ip");
        store.set_instance_host(uuid, Some("compute-2"));

        let inst = store
            .instance_get_by_uuid(uuid)
            .await
            .expect("lookup")
            .expect("exists");
        assert_eq!(inst.host.as_deref(), Some("compute-2"));
        let fixed = store.fixed_ip_get_by_instance(uuid).await.expect("lookup");
        assert_eq!(fixed.len(), 1);
        assert!(store.add_fixed_ip(ip(10, 0, 0, 8), 42, None).is_err());
    }

    #[tokio::test]
    async fn domains_register_and_unregister() {
        let store = MemoryStore::new();
        store
            .dnsdomain_register_for_zone("internal.example", "az1")
            .await
            .expect("zone");
        store
            .dnsdomain_register_for_project("example.org", "p1")
            .await
            .expect("project");
        assert_eq!(
            store.dnsdomain_list().await.expect("list"),
            vec!["example.org".to_string(), "internal.example".to_string()]
        );
        let private = store
            .dnsdomain_get("internal.example")
            .await
            .expect("get")
            .expect("exists");
        assert!(private.is_private());

        store
            .dnsdomain_unregister("example.org")
            .await
            .expect("unregister");
        assert!(
            store
                .dnsdomain_get("example.org")
                .await
                .expect("get")
                .is_none()
        );
    }
}
