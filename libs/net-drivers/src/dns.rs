//! DNS domain & entry management
use std::{
    collections::{BTreeMap, btree_map::Entry},
    fmt,
    net::IpAddr,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordType {
    A,
    Aaaa,
}

impl RecordType {
    pub fn for_address(address: IpAddr) -> Self {
        match address {
            IpAddr::V4(_) => RecordType::A,
            IpAddr::V6(_) => RecordType::Aaaa,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DnsError {
    /// domain or entry is already present
    #[error("dns entry or domain already exists: {0}")]
    Exists(String),
    #[error("dns domain not found: {0}")]
    DomainNotFound(String),
    #[error("dns entry {name} not found in {domain}")]
    NotFound { name: String, domain: String },
    #[error("dns backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait DnsDriver: Send + Sync + fmt::Debug + 'static {
    async fn create_domain(&self, domain: &str) -> Result<(), DnsError>;
    async fn delete_domain(&self, domain: &str) -> Result<(), DnsError>;
    async fn get_domains(&self) -> Result<Vec<String>, DnsError>;
    async fn create_entry(
        &self,
        name: &str,
        address: IpAddr,
        kind: RecordType,
        domain: &str,
    ) -> Result<(), DnsError>;
    /// point an existing entry at `address`
    async fn modify_address(&self, name: &str, address: IpAddr, domain: &str)
    -> Result<(), DnsError>;
    async fn delete_entry(&self, name: &str, domain: &str) -> Result<(), DnsError>;
    /// names in `domain` pointing at `address`
    async fn get_entries_by_address(
        &self,
        address: IpAddr,
        domain: &str,
    ) -> Result<Vec<String>, DnsError>;
    /// addresses `name` resolves to in `domain`
    async fn get_entries_by_name(&self, name: &str, domain: &str)
    -> Result<Vec<IpAddr>, DnsError>;
}

/// logs every call, owns no domains
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDnsDriver;

#[async_trait]
impl DnsDriver for NoopDnsDriver {
    async fn create_domain(&self, domain: &str) -> Result<(), DnsError> {
        info!(domain, "create dns domain");
        Ok(())
    }

    async fn delete_domain(&self, domain: &str) -> Result<(), DnsError> {
        info!(domain, "delete dns domain");
        Ok(())
    }

    async fn get_domains(&self) -> Result<Vec<String>, DnsError> {
        Ok(Vec::new())
    }

    async fn create_entry(
        &self,
        name: &str,
        address: IpAddr,
        kind: RecordType,
        domain: &str,
    ) -> Result<(), DnsError> {
        info!(name, %address, ?kind, domain, "create dns entry");
        Ok(())
    }

    async fn modify_address(
        &self,
        name: &str,
        address: IpAddr,
        domain: &str,
    ) -> Result<(), DnsError> {
        info!(name, %address, domain, "modify dns entry");
        Ok(())
    }

    async fn delete_entry(&self, name: &str, domain: &str) -> Result<(), DnsError> {
        info!(name, domain, "delete dns entry");
        Ok(())
    }

    async fn get_entries_by_address(
        &self,
        _address: IpAddr,
        _domain: &str,
    ) -> Result<Vec<String>, DnsError> {
        Ok(Vec::new())
    }

    async fn get_entries_by_name(
        &self,
        _name: &str,
        _domain: &str,
    ) -> Result<Vec<IpAddr>, DnsError> {
        Ok(Vec::new())
    }
}

type Zone = BTreeMap<String, (IpAddr, RecordType)>;

/// In process zones. Domain and entry names compare case-insensitively.
#[derive(Debug, Default)]
pub struct MemoryDnsDriver {
    zones: Mutex<BTreeMap<String, Zone>>,
}

impl MemoryDnsDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

fn key(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

#[async_trait]
impl DnsDriver for MemoryDnsDriver {
    async fn create_domain(&self, domain: &str) -> Result<(), DnsError> {
        match self.zones.lock().entry(key(domain)) {
            Entry::Occupied(_) => Err(DnsError::Exists(domain.to_owned())),
            Entry::Vacant(v) => {
                v.insert(Zone::new());
                debug!(domain, "dns domain created");
                Ok(())
            }
        }
    }

    async fn delete_domain(&self, domain: &str) -> Result<(), DnsError> {
        self.zones
            .lock()
            .remove(&key(domain))
            .map(|_| ())
            .ok_or_else(|| DnsError::DomainNotFound(domain.to_owned()))
    }

    async fn get_domains(&self) -> Result<Vec<String>, DnsError> {
        Ok(self.zones.lock().keys().cloned().collect())
    }

    async fn create_entry(
        &self,
        name: &str,
        address: IpAddr,
        kind: RecordType,
        domain: &str,
    ) -> Result<(), DnsError> {
        let mut zones = self.zones.lock();
        let zone = zones
            .get_mut(&key(domain))
            .ok_or_else(|| DnsError::DomainNotFound(domain.to_owned()))?;
        match zone.entry(key(name)) {
            Entry::Occupied(_) => Err(DnsError::Exists(format!("{name}.{domain}"))),
            Entry::Vacant(v) => {
                v.insert((address, kind));
                Ok(())
            }
        }
    }

    async fn modify_address(
        &self,
        name: &str,
        address: IpAddr,
        domain: &str,
    ) -> Result<(), DnsError> {
        let mut zones = self.zones.lock();
        let zone = zones
            .get_mut(&key(domain))
            .ok_or_else(|| DnsError::DomainNotFound(domain.to_owned()))?;
        let entry = zone.get_mut(&key(name)).ok_or_else(|| DnsError::NotFound {
            name: name.to_owned(),
            domain: domain.to_owned(),
        })?;
        *entry = (address, RecordType::for_address(address));
        Ok(())
    }

    async fn delete_entry(&self, name: &str, domain: &str) -> Result<(), DnsError> {
        let mut zones = self.zones.lock();
        let zone = zones
            .get_mut(&key(domain))
            .ok_or_else(|| DnsError::DomainNotFound(domain.to_owned()))?;
        zone.remove(&key(name))
            .map(|_| ())
            .ok_or_else(|| DnsError::NotFound {
                name: name.to_owned(),
                domain: domain.to_owned(),
            })
    }

    async fn get_entries_by_address(
        &self,
        address: IpAddr,
        domain: &str,
    ) -> Result<Vec<String>, DnsError> {
        let zones = self.zones.lock();
        Ok(zones
            .get(&key(domain))
            .map(|zone| {
                zone.iter()
                    .filter(|(_, (addr, _))| *addr == address)
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_entries_by_name(
        &self,
        name: &str,
        domain: &str,
    ) -> Result<Vec<IpAddr>, DnsError> {
        let zones = self.zones.lock();
        Ok(zones
            .get(&key(domain))
            .and_then(|zone| zone.get(&key(name)))
            .map(|(addr, _)| vec![*addr])
            .unwrap_or_default())
    }
}
