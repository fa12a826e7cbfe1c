//! [`Storage`] over a JetStream KV bucket, so every manager host reads and
//! writes the same floating ips, bindings and service heartbeats.
//!
//! Records are JSON values under `fip/<address>`, `fixed/<id>`,
//! `fixed-addr/<address>` (address to id index), `net/<id>`, `inst/<uuid>`,
//! `svc/<host>/<topic>` and `dns/<domain>`. Ids come from counters under
//! `seq/<table>`.
//!
//! Conditional writes are guarded by the key's revision. A write that loses
//! a race re-reads the key and decides again, so the bind, release and
//! allocation rules hold across hosts the same way they do in
//! [`MemoryStore`].
//!
//! [`MemoryStore`]: fip_store::memory::MemoryStore

use std::{collections::BTreeSet, fmt, net::IpAddr};

use async_nats::jetstream::kv::{Operation, Store};
use async_trait::async_trait;
use chrono::Utc;
use fip_store::{
    BindOutcome, DnsDomain, DomainScope, FixedIp, FixedIpBinding, FloatingIp, Instance, Network,
    NewFloatingIp, Provision, ReleaseOutcome, Service, Storage,
};
use futures::TryStreamExt;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{NatsClient, TransportError};

const STORE_HISTORY: i64 = 1;
const MAX_WRITE_ATTEMPTS: usize = 8;

const FLOATING_PREFIX: &str = "fip/";
const FIXED_PREFIX: &str = "fixed/";
const FIXED_ADDRESS_PREFIX: &str = "fixed-addr/";
const DOMAIN_PREFIX: &str = "dns/";
const FLOATING_TABLE: &str = "floating";
const FIXED_TABLE: &str = "fixed";

#[derive(Debug, Error)]
pub enum KvStoreError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("floating ip already exists in kv store: {0}")]
    AddressExists(IpAddr),
    #[error("no floating ip in kv store for {0}")]
    FloatingIpNotFound(IpAddr),
    #[error("no fixed ip in kv store for {0}")]
    FixedIpNotFound(IpAddr),
    #[error("no network in kv store with id {0}")]
    NetworkNotFound(u64),
    #[error("kv key '{key}' kept changing, gave up after {attempts} writes: {last}")]
    Contended {
        key: String,
        attempts: usize,
        last: String,
    },
}

impl From<serde_json::Error> for KvStoreError {
    fn from(err: serde_json::Error) -> Self {
        KvStoreError::Transport(err.into())
    }
}

fn transport(msg: String) -> KvStoreError {
    KvStoreError::Transport(TransportError::Transport(msg))
}

/// [`Storage`] shared by every host connected to the same bucket, cheap to
/// clone
#[derive(Clone)]
pub struct NatsStore {
    kv: Store,
    bucket: String,
}

impl fmt::Debug for NatsStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NatsStore")
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

fn sanitize_key_component(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn floating_key(address: IpAddr) -> String {
    format!(
        "{FLOATING_PREFIX}{}",
        sanitize_key_component(&address.to_string())
    )
}

fn fixed_key(id: u64) -> String {
    format!("{FIXED_PREFIX}{id}")
}

fn fixed_address_key(address: IpAddr) -> String {
    format!(
        "{FIXED_ADDRESS_PREFIX}{}",
        sanitize_key_component(&address.to_string())
    )
}

fn network_key(id: u64) -> String {
    format!("net/{id}")
}

fn instance_key(uuid: Uuid) -> String {
    format!("inst/{uuid}")
}

fn service_key(host: &str, topic: &str) -> String {
    format!(
        "svc/{}/{}",
        sanitize_key_component(host),
        sanitize_key_component(topic)
    )
}

fn domain_key(domain: &str) -> String {
    format!("{DOMAIN_PREFIX}{}", sanitize_key_component(domain))
}

fn counter_key(table: &str) -> String {
    format!("seq/{table}")
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T, KvStoreError> {
    serde_json::from_slice(bytes).map_err(|err| {
        KvStoreError::Transport(TransportError::Codec(format!(
            "bad record at '{key}': {err}"
        )))
    })
}

impl NatsStore {
    /// Open `bucket` on a connected client, creating it if missing.
    pub async fn open(client: &NatsClient, bucket: &str) -> Result<Self, KvStoreError> {
        let kv = client.get_or_create_kv_bucket(bucket, STORE_HISTORY).await?;
        info!(bucket, "using JetStream KV store");
        Ok(Self {
            kv,
            bucket: bucket.to_owned(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, KvStoreError> {
        let value = self
            .kv
            .get(key.to_owned())
            .await
            .map_err(|err| transport(format!("kv read failed for key '{key}': {err}")))?;
        value.map(|bytes| decode(key, &bytes)).transpose()
    }

    async fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), KvStoreError> {
        let payload = serde_json::to_vec(value)?;
        self.kv
            .put(key.to_owned(), payload.into())
            .await
            .map_err(|err| transport(format!("kv write failed for key '{key}': {err}")))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvStoreError> {
        self.kv
            .delete(key.to_owned())
            .await
            .map_err(|err| transport(format!("kv delete failed for key '{key}': {err}")))
    }

    /// every record whose key starts with `prefix`
    async fn scan<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>, KvStoreError> {
        let mut keys = self
            .kv
            .keys()
            .await
            .map_err(|err| transport(format!("failed to list kv keys: {err}")))?;
        let mut matched = Vec::new();
        while let Some(key) = keys
            .try_next()
            .await
            .map_err(|err| transport(format!("failed reading kv keys: {err}")))?
        {
            if key.starts_with(prefix) {
                matched.push(key);
            }
        }
        let mut records = Vec::with_capacity(matched.len());
        for key in matched {
            if let Some(record) = self.get(&key).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Read-modify-write of `key` guarded by its revision. `decide` gets the
    /// current value and returns the value to write (`None` writes nothing)
    /// along with the result. It runs again after every lost race.
    async fn update<T, R, F>(&self, key: &str, mut decide: F) -> Result<R, KvStoreError>
    where
        T: Serialize + DeserializeOwned + Send,
        R: Send,
        F: FnMut(Option<T>) -> Result<(Option<T>, R), KvStoreError> + Send,
    {
        let mut last = String::new();
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let entry = self
                .kv
                .entry(key.to_owned())
                .await
                .map_err(|err| transport(format!("kv read failed for key '{key}': {err}")))?;
            // a deleted key keeps its revision
            let (current, revision) = match entry {
                Some(entry) if matches!(entry.operation, Operation::Put) => {
                    (Some(decode(key, &entry.value)?), Some(entry.revision))
                }
                Some(entry) => (None, Some(entry.revision)),
                None => (None, None),
            };
            let (write, out) = decide(current)?;
            let Some(value) = write else {
                return Ok(out);
            };
            let payload = serde_json::to_vec(&value)?;
            let written = match revision {
                Some(revision) => self
                    .kv
                    .update(key.to_owned(), payload.into(), revision)
                    .await
                    .map_err(|err| err.to_string()),
                None => self
                    .kv
                    .create(key.to_owned(), payload.into())
                    .await
                    .map_err(|err| err.to_string()),
            };
            match written {
                Ok(_) => return Ok(out),
                Err(err) => {
                    debug!(key, attempt, %err, "kv write lost a race, retrying");
                    last = err;
                }
            }
        }
        warn!(key, attempts = MAX_WRITE_ATTEMPTS, "kv key kept changing, giving up");
        Err(KvStoreError::Contended {
            key: key.to_owned(),
            attempts: MAX_WRITE_ATTEMPTS,
            last,
        })
    }

    async fn next_id(&self, table: &str) -> Result<u64, KvStoreError> {
        self.update(&counter_key(table), |current: Option<u64>| {
            let next = current.unwrap_or(0) + 1;
            Ok((Some(next), next))
        })
        .await
    }

    async fn floating_ips(&self) -> Result<Vec<FloatingIp>, KvStoreError> {
        let mut all = self.scan::<FloatingIp>(FLOATING_PREFIX).await?;
        all.sort_by_key(|f| f.address);
        Ok(all)
    }

    async fn binding(&self, fixed_ip_id: u64) -> Result<Option<FixedIpBinding>, KvStoreError> {
        let Some(fixed_ip) = self.get::<FixedIp>(&fixed_key(fixed_ip_id)).await? else {
            return Ok(None);
        };
        let network = self.get(&network_key(fixed_ip.network_id)).await?;
        Ok(network.map(|network| FixedIpBinding { fixed_ip, network }))
    }

    async fn create_floating_ip(&self, ip: NewFloatingIp) -> Result<(), KvStoreError> {
        let address = ip.address;
        let record = FloatingIp {
            id: self.next_id(FLOATING_TABLE).await?,
            address,
            pool: ip.pool,
            project_id: None,
            fixed_ip_id: None,
            auto_assigned: false,
            host: None,
            interface: ip.interface,
        };
        self.update(&floating_key(address), |current: Option<FloatingIp>| {
            match current {
                Some(_) => Err(KvStoreError::AddressExists(address)),
                None => Ok((Some(record.clone()), ())),
            }
        })
        .await
    }
}

#[async_trait]
impl Storage for NatsStore {
    type Error = KvStoreError;

    async fn floating_ip_get(&self, id: u64) -> Result<Option<FloatingIp>, Self::Error> {
        Ok(self.floating_ips().await?.into_iter().find(|f| f.id == id))
    }

    async fn floating_ip_get_by_address(
        &self,
        address: IpAddr,
    ) -> Result<Option<FloatingIp>, Self::Error> {
        self.get(&floating_key(address)).await
    }

    async fn floating_ip_get_all_by_host(
        &self,
        host: &str,
    ) -> Result<Vec<FloatingIp>, Self::Error> {
        let mut all = self.floating_ips().await?;
        all.retain(|f| f.host.as_deref() == Some(host));
        Ok(all)
    }

    async fn floating_ip_get_all_by_project(
        &self,
        project_id: &str,
    ) -> Result<Vec<FloatingIp>, Self::Error> {
        let mut all = self.floating_ips().await?;
        all.retain(|f| f.project_id.as_deref() == Some(project_id));
        Ok(all)
    }

    async fn floating_ip_get_by_fixed_address(
        &self,
        fixed: IpAddr,
    ) -> Result<Vec<FloatingIp>, Self::Error> {
        let Some(fixed_ip) = self.fixed_ip_get_by_address(fixed).await? else {
            return Ok(Vec::new());
        };
        self.floating_ip_get_by_fixed_ip_id(fixed_ip.id).await
    }

    async fn floating_ip_get_by_fixed_ip_id(
        &self,
        fixed_ip_id: u64,
    ) -> Result<Vec<FloatingIp>, Self::Error> {
        let mut all = self.floating_ips().await?;
        all.retain(|f| f.fixed_ip_id == Some(fixed_ip_id));
        Ok(all)
    }

    async fn floating_ip_get_pools(&self) -> Result<Vec<String>, Self::Error> {
        let pools = self
            .floating_ips()
            .await?
            .into_iter()
            .map(|f| f.pool)
            .collect::<BTreeSet<_>>();
        Ok(pools.into_iter().collect())
    }

    async fn floating_ip_bulk_create(&self, ips: Vec<NewFloatingIp>) -> Result<(), Self::Error> {
        let mut seen = BTreeSet::new();
        for ip in &ips {
            if !seen.insert(ip.address)
                || self
                    .get::<FloatingIp>(&floating_key(ip.address))
                    .await?
                    .is_some()
            {
                return Err(KvStoreError::AddressExists(ip.address));
            }
        }
        let count = ips.len();
        let mut created = Vec::with_capacity(count);
        for ip in ips {
            let address = ip.address;
            if let Err(err) = self.create_floating_ip(ip).await {
                warn!(%address, %err, created = created.len(), "bulk create failed, removing what was created");
                for address in created {
                    if let Err(err) = self.delete(&floating_key(address)).await {
                        warn!(%address, %err, "failed to remove floating ip after bulk create failure");
                    }
                }
                return Err(err);
            }
            created.push(address);
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
        let free = self
            .floating_ips()
            .await?
            .into_iter()
            .filter(|f| f.pool == pool && !f.is_allocated());
        for candidate in free {
            let address = candidate.address;
            let taken = self
                .update(&floating_key(address), |current: Option<FloatingIp>| {
                    Ok(match current {
                        Some(mut fip) if !fip.is_allocated() => {
                            fip.project_id = Some(project_id.to_owned());
                            fip.auto_assigned = auto_assigned;
                            (Some(fip), true)
                        }
                        _ => (None, false),
                    })
                })
                .await?;
            if taken {
                return Ok(Some(address));
            }
            debug!(%address, pool, "floating ip taken by another host, trying next");
        }
        Ok(None)
    }

    async fn floating_ip_deallocate(
        &self,
        address: IpAddr,
    ) -> Result<ReleaseOutcome, Self::Error> {
        self.update(&floating_key(address), |current: Option<FloatingIp>| {
            let mut fip = current.ok_or(KvStoreError::FloatingIpNotFound(address))?;
            let outcome = fip.try_release();
            Ok(match outcome {
                ReleaseOutcome::Released => (Some(fip), outcome),
                ReleaseOutcome::StillBound { .. } => (None, outcome),
            })
        })
        .await
    }

    async fn floating_ip_fixed_ip_associate(
        &self,
        floating: IpAddr,
        fixed: IpAddr,
        host: &str,
    ) -> Result<BindOutcome, Self::Error> {
        let binding = match self.fixed_ip_get_by_address(fixed).await? {
            Some(fixed_ip) => self.binding(fixed_ip.id).await?,
            None => None,
        }
        .ok_or(KvStoreError::FixedIpNotFound(fixed))?;
        self.update(&floating_key(floating), |current: Option<FloatingIp>| {
            let mut fip = current.ok_or(KvStoreError::FloatingIpNotFound(floating))?;
            Ok(match fip.try_bind(binding.clone(), host) {
                outcome @ BindOutcome::Bound(_) => (Some(fip), outcome),
                outcome => (None, outcome),
            })
        })
        .await
    }

    async fn floating_ip_disassociate(
        &self,
        address: IpAddr,
    ) -> Result<Option<FixedIpBinding>, Self::Error> {
        let unbound = self
            .update(&floating_key(address), |current: Option<FloatingIp>| {
                let mut fip = current.ok_or(KvStoreError::FloatingIpNotFound(address))?;
                Ok(match fip.unbind() {
                    Some(fixed_ip_id) => (Some(fip), Some(fixed_ip_id)),
                    None => (None, None),
                })
            })
            .await?;
        match unbound {
            Some(fixed_ip_id) => self.binding(fixed_ip_id).await,
            None => Ok(None),
        }
    }

    async fn floating_ip_update_host(
        &self,
        address: IpAddr,
        host: Option<&str>,
    ) -> Result<(), Self::Error> {
        self.update(&floating_key(address), |current: Option<FloatingIp>| {
            let mut fip = current.ok_or(KvStoreError::FloatingIpNotFound(address))?;
            fip.host = host.map(str::to_owned);
            Ok((Some(fip), ()))
        })
        .await
    }

    async fn fixed_ip_get(&self, id: u64) -> Result<Option<FixedIp>, Self::Error> {
        self.get(&fixed_key(id)).await
    }

    async fn fixed_ip_get_with_network(
        &self,
        id: u64,
    ) -> Result<Option<FixedIpBinding>, Self::Error> {
        self.binding(id).await
    }

    async fn fixed_ip_get_by_address(
        &self,
        address: IpAddr,
    ) -> Result<Option<FixedIp>, Self::Error> {
        match self.get::<u64>(&fixed_address_key(address)).await? {
            Some(id) => self.get(&fixed_key(id)).await,
            None => Ok(None),
        }
    }

    async fn fixed_ip_get_by_instance(&self, instance: Uuid) -> Result<Vec<FixedIp>, Self::Error> {
        let mut fixed = self.scan::<FixedIp>(FIXED_PREFIX).await?;
        fixed.retain(|f| f.instance_uuid == Some(instance));
        fixed.sort_by_key(|f| f.id);
        Ok(fixed)
    }

    async fn network_get(&self, id: u64) -> Result<Option<Network>, Self::Error> {
        self.get(&network_key(id)).await
    }

    async fn instance_get_by_uuid(&self, uuid: Uuid) -> Result<Option<Instance>, Self::Error> {
        self.get(&instance_key(uuid)).await
    }

    async fn service_get_by_host_and_topic(
        &self,
        host: &str,
        topic: &str,
    ) -> Result<Option<Service>, Self::Error> {
        self.get(&service_key(host, topic)).await
    }

    async fn service_heartbeat(&self, host: &str, topic: &str) -> Result<Service, Self::Error> {
        self.update(&service_key(host, topic), |current: Option<Service>| {
            let mut service = current.unwrap_or_else(|| Service {
                host: host.to_owned(),
                topic: topic.to_owned(),
                updated_at: Utc::now(),
                disabled: false,
            });
            service.updated_at = Utc::now();
            Ok((Some(service.clone()), service))
        })
        .await
    }

    async fn dnsdomain_register_for_zone(
        &self,
        domain: &str,
        availability_zone: &str,
    ) -> Result<(), Self::Error> {
        let record = DnsDomain {
            domain: domain.to_owned(),
            scope: DomainScope::Private {
                availability_zone: availability_zone.to_owned(),
            },
        };
        self.put(&domain_key(domain), &record).await
    }

    async fn dnsdomain_register_for_project(
        &self,
        domain: &str,
        project_id: &str,
    ) -> Result<(), Self::Error> {
        let record = DnsDomain {
            domain: domain.to_owned(),
            scope: DomainScope::Public {
                project_id: project_id.to_owned(),
            },
        };
        self.put(&domain_key(domain), &record).await
    }

    async fn dnsdomain_unregister(&self, domain: &str) -> Result<(), Self::Error> {
        self.delete(&domain_key(domain)).await
    }

    async fn dnsdomain_get(&self, domain: &str) -> Result<Option<DnsDomain>, Self::Error> {
        self.get(&domain_key(domain)).await
    }

    async fn dnsdomain_list(&self) -> Result<Vec<String>, Self::Error> {
        let mut domains = self
            .scan::<DnsDomain>(DOMAIN_PREFIX)
            .await?
            .into_iter()
            .map(|d| d.domain)
            .collect::<Vec<_>>();
        domains.sort();
        Ok(domains)
    }
}

#[async_trait]
impl Provision for NatsStore {
    async fn provision_network(&self, network: Network) -> Result<(), Self::Error> {
        self.put(&network_key(network.id), &network).await
    }

    async fn provision_instance(&self, instance: Instance) -> Result<(), Self::Error> {
        self.put(&instance_key(instance.uuid), &instance).await
    }

    async fn provision_fixed_ip(
        &self,
        address: IpAddr,
        network_id: u64,
        instance_uuid: Option<Uuid>,
    ) -> Result<FixedIp, Self::Error> {
        if let Some(existing) = self.fixed_ip_get_by_address(address).await? {
            return Ok(existing);
        }
        if self.network_get(network_id).await?.is_none() {
            return Err(KvStoreError::NetworkNotFound(network_id));
        }
        let fixed = FixedIp {
            id: self.next_id(FIXED_TABLE).await?,
            address,
            network_id,
            instance_uuid,
        };
        self.put(&fixed_key(fixed.id), &fixed).await?;

        // the address index picks the record when two hosts insert at once
        let winner = self
            .update(&fixed_address_key(address), |current: Option<u64>| {
                Ok(match current {
                    Some(id) => (None, id),
                    None => (Some(fixed.id), fixed.id),
                })
            })
            .await?;
        if winner == fixed.id {
            return Ok(fixed);
        }
        debug!(%address, winner, "fixed ip provisioned by another host");
        self.delete(&fixed_key(fixed.id)).await?;
        self.get(&fixed_key(winner))
            .await?
            .ok_or(KvStoreError::FixedIpNotFound(address))
    }
}
