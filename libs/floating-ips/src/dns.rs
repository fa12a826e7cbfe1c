//! DNS domains and the entries pointing at floating addresses
//!
//! Domains are recorded in the store with a scope, and mirrored to one of two
//! drivers: private (availability zone) domains live in the instance driver,
//! public (project) domains in the floating driver. Entries always go through
//! the floating driver.
use std::{fmt, net::IpAddr, sync::Arc};

use fip_store::{DnsDomain, DomainScope, Storage};
use net_drivers::{DnsDriver, DnsError, RecordType};
use tracing::{debug, info, warn};

use crate::FloatingIpError;

/// a domain known to both the store and one of the drivers
pub type DomainInfo = DnsDomain;

pub struct DnsDomainManager<S> {
    store: S,
    floating: Arc<dyn DnsDriver>,
    instance: Arc<dyn DnsDriver>,
}

impl<S: Clone> Clone for DnsDomainManager<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            floating: self.floating.clone(),
            instance: self.instance.clone(),
        }
    }
}

impl<S> fmt::Debug for DnsDomainManager<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DnsDomainManager")
            .field("floating", &self.floating)
            .field("instance", &self.instance)
            .finish()
    }
}

impl<S> DnsDomainManager<S>
where
    S: Storage,
{
    pub fn new(store: S, floating: Arc<dyn DnsDriver>, instance: Arc<dyn DnsDriver>) -> Self {
        Self {
            store,
            floating,
            instance,
        }
    }

    /// record `domain` for `availability_zone` and create it in the instance driver
    pub async fn register_private_domain(
        &self,
        domain: &str,
        availability_zone: &str,
    ) -> Result<(), FloatingIpError<S::Error>> {
        self.store
            .dnsdomain_register_for_zone(domain, availability_zone)
            .await?;
        match self.instance.create_domain(domain).await {
            Err(DnsError::Exists(_)) => {
                warn!(domain, availability_zone, "domain already exists, availability zone updated");
                Ok(())
            }
            res => {
                res.map_err(FloatingIpError::Dns)?;
                info!(domain, availability_zone, "private dns domain registered");
                Ok(())
            }
        }
    }

    /// record `domain` for `project_id` and create it in the floating driver
    pub async fn register_public_domain(
        &self,
        domain: &str,
        project_id: &str,
    ) -> Result<(), FloatingIpError<S::Error>> {
        self.store
            .dnsdomain_register_for_project(domain, project_id)
            .await?;
        match self.floating.create_domain(domain).await {
            Err(DnsError::Exists(_)) => {
                warn!(domain, project_id, "domain already exists, project updated");
                Ok(())
            }
            res => {
                res.map_err(FloatingIpError::Dns)?;
                info!(domain, project_id, "public dns domain registered");
                Ok(())
            }
        }
    }

    /// Drop the store record and delete `domain` from the driver serving its
    /// scope. A domain the driver no longer has is not an error.
    pub async fn unregister_domain(&self, domain: &str) -> Result<(), FloatingIpError<S::Error>> {
        let record = self.store.dnsdomain_get(domain).await?;
        self.store.dnsdomain_unregister(domain).await?;
        let driver = match &record {
            Some(d) if d.is_private() => &self.instance,
            _ => &self.floating,
        };
        match driver.delete_domain(domain).await {
            Err(DnsError::DomainNotFound(_)) => {
                debug!(domain, "domain was already gone from the driver");
                Ok(())
            }
            res => {
                res.map_err(FloatingIpError::Dns)?;
                info!(domain, "dns domain unregistered");
                Ok(())
            }
        }
    }

    /// Store domains that one of the drivers also serves. Domains only the
    /// store knows about are left out.
    pub async fn list_domains(&self) -> Result<Vec<DomainInfo>, FloatingIpError<S::Error>> {
        let floating = self
            .floating
            .get_domains()
            .await
            .map_err(FloatingIpError::Dns)?;
        let instance = self
            .instance
            .get_domains()
            .await
            .map_err(FloatingIpError::Dns)?;
        let served = |domain: &str| {
            floating
                .iter()
                .chain(instance.iter())
                .any(|d| d.eq_ignore_ascii_case(domain.trim_end_matches('.')))
        };

        let mut domains = Vec::new();
        for domain in self.store.dnsdomain_list().await? {
            if !served(&domain) {
                warn!(domain, "dns domain is in the store but in neither dns driver, ignoring it");
                continue;
            }
            if let Some(record) = self.store.dnsdomain_get(&domain).await? {
                domains.push(record);
            }
        }
        Ok(domains)
    }

    pub async fn add_entry(
        &self,
        address: IpAddr,
        name: &str,
        domain: &str,
    ) -> Result<(), FloatingIpError<S::Error>> {
        self.floating
            .create_entry(name, address, RecordType::for_address(address), domain)
            .await
            .map_err(FloatingIpError::Dns)
    }

    pub async fn modify_entry(
        &self,
        address: IpAddr,
        name: &str,
        domain: &str,
    ) -> Result<(), FloatingIpError<S::Error>> {
        self.floating
            .modify_address(name, address, domain)
            .await
            .map_err(FloatingIpError::Dns)
    }

    pub async fn delete_entry(&self, name: &str, domain: &str) -> Result<(), FloatingIpError<S::Error>> {
        self.floating
            .delete_entry(name, domain)
            .await
            .map_err(FloatingIpError::Dns)
    }

    pub async fn entries_by_address(
        &self,
        address: IpAddr,
        domain: &str,
    ) -> Result<Vec<String>, FloatingIpError<S::Error>> {
        self.floating
            .get_entries_by_address(address, domain)
            .await
            .map_err(FloatingIpError::Dns)
    }

    pub async fn entries_by_name(
        &self,
        name: &str,
        domain: &str,
    ) -> Result<Vec<IpAddr>, FloatingIpError<S::Error>> {
        self.floating
            .get_entries_by_name(name, domain)
            .await
            .map_err(FloatingIpError::Dns)
    }

    /// Remove every entry pointing at `address` from every listed domain.
    pub async fn delete_all_entries_for_address(
        &self,
        address: IpAddr,
    ) -> Result<(), FloatingIpError<S::Error>> {
        for domain in self.list_domains().await? {
            for name in self.entries_by_address(address, &domain.domain).await? {
                self.delete_entry(&name, &domain.domain).await?;
                debug!(%address, name, domain = domain.domain, "dns entry deleted");
            }
        }
        Ok(())
    }

    /// the project a public domain is registered to
    pub async fn project_for_domain(
        &self,
        domain: &str,
    ) -> Result<Option<String>, FloatingIpError<S::Error>> {
        Ok(self
            .store
            .dnsdomain_get(domain)
            .await?
            .and_then(|d| match d.scope {
                DomainScope::Public { project_id } => Some(project_id),
                DomainScope::Private { .. } => None,
            }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use fip_store::{DomainScope, Storage, memory::MemoryStore};
    use net_drivers::{DnsDriver, MemoryDnsDriver};
    use tracing_test::traced_test;

    use super::DnsDomainManager;
    use crate::{ErrorKind, testutil::ip};

    struct Fixture {
        store: MemoryStore,
        floating: Arc<MemoryDnsDriver>,
        instance: Arc<MemoryDnsDriver>,
        dns: DnsDomainManager<MemoryStore>,
    }

    fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let floating = Arc::new(MemoryDnsDriver::new());
        let instance = Arc::new(MemoryDnsDriver::new());
        let dns = DnsDomainManager::new(store.clone(), floating.clone(), instance.clone());
        Fixture {
            store,
            floating,
            instance,
            dns,
        }
    }

    #[tokio::test]
    async fn domains_go_to_the_driver_for_their_scope() {
        let f = fixture();
        f.dns
            .register_private_domain("internal.example", "az1")
            .await
            .unwrap();
        f.dns
            .register_public_domain("example.org", "p1")
            .await
            .unwrap();

        assert_eq!(
            f.instance.get_domains().await.unwrap(),
            vec!["internal.example".to_owned()]
        );
        assert_eq!(
            f.floating.get_domains().await.unwrap(),
            vec!["example.org".to_owned()]
        );
        let listed = f.dns.list_domains().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().any(|d| d.domain == "internal.example"
            && d.scope
                == DomainScope::Private {
                    availability_zone: "az1".into()
                }));
        assert_eq!(
            f.dns.project_for_domain("example.org").await.unwrap(),
            Some("p1".into())
        );
        assert_eq!(
            f.dns.project_for_domain("internal.example").await.unwrap(),
            None
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn existing_driver_domain_is_not_fatal() {
        let f = fixture();
        f.floating.create_domain("example.org").await.unwrap();
        f.dns
            .register_public_domain("example.org", "p2")
            .await
            .unwrap();
        assert!(logs_contain("domain already exists"));
        assert_eq!(
            f.dns.project_for_domain("example.org").await.unwrap(),
            Some("p2".into())
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn store_only_domains_are_not_listed() {
        let f = fixture();
        f.store
            .dnsdomain_register_for_project("orphan.example", "p1")
            .await
            .unwrap();
        f.dns
            .register_public_domain("example.org", "p1")
            .await
            .unwrap();
        let listed = f.dns.list_domains().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].domain, "example.org");
        assert!(logs_contain("in neither dns driver"));
    }

    #[tokio::test]
    async fn unregister_uses_the_scope_driver() {
        let f = fixture();
        f.dns
            .register_private_domain("internal.example", "az1")
            .await
            .unwrap();
        f.dns.unregister_domain("internal.example").await.unwrap();
        assert!(f.instance.get_domains().await.unwrap().is_empty());
        assert_eq!(f.store.dnsdomain_get("internal.example").await.unwrap(), None);

        // unknown to the store, falls back to the floating driver
        f.floating.create_domain("stray.example").await.unwrap();
        f.dns.unregister_domain("stray.example").await.unwrap();
        assert!(f.floating.get_domains().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn entries_round_through_the_floating_driver() {
        let f = fixture();
        f.dns
            .register_public_domain("example.org", "p1")
            .await
            .unwrap();
        let addr = ip(203, 0, 113, 1);
        f.dns.add_entry(addr, "www", "example.org").await.unwrap();
        f.dns.add_entry(addr, "api", "example.org").await.unwrap();
        assert_eq!(
            f.dns.entries_by_name("www", "example.org").await.unwrap(),
            vec![addr]
        );

        let moved = ip(203, 0, 113, 2);
        f.dns.modify_entry(moved, "api", "example.org").await.unwrap();
        assert_eq!(
            f.dns.entries_by_address(addr, "example.org").await.unwrap(),
            vec!["www".to_owned()]
        );

        let err = f
            .dns
            .add_entry(addr, "www", "example.org")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Dns);
        let err = f
            .dns
            .add_entry(addr, "www", "missing.example")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Dns);
    }

    #[tokio::test]
    async fn delete_all_entries_for_address_sweeps_every_domain() {
        let f = fixture();
        f.dns.register_public_domain("a.example", "p1").await.unwrap();
        f.dns.register_public_domain("b.example", "p1").await.unwrap();
        let addr = ip(203, 0, 113, 1);
        let other = ip(203, 0, 113, 2);
        f.dns.add_entry(addr, "one", "a.example").await.unwrap();
        f.dns.add_entry(addr, "two", "b.example").await.unwrap();
        f.dns.add_entry(other, "three", "b.example").await.unwrap();

        f.dns.delete_all_entries_for_address(addr).await.unwrap();
        assert!(f.dns.entries_by_address(addr, "a.example").await.unwrap().is_empty());
        assert!(f.dns.entries_by_address(addr, "b.example").await.unwrap().is_empty());
        assert_eq!(
            f.floating
                .get_entries_by_address(other, "b.example")
                .await
                .unwrap(),
            vec!["three".to_owned()]
        );
    }
}
