//! records held by the store

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An externally routable address from a pool.
///
/// `project_id == None` means the address is unallocated, `fixed_ip_id == None`
/// means it is not associated. An associated address is always allocated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloatingIp {
    pub id: u64,
    pub address: IpAddr,
    pub pool: String,
    pub project_id: Option<String>,
    pub fixed_ip_id: Option<u64>,
    pub auto_assigned: bool,
    /// manager host whose L3 driver currently carries the rule
    pub host: Option<String>,
    /// interface override for L3 rules
    pub interface: Option<String>,
}

impl FloatingIp {
    pub fn is_allocated(&self) -> bool {
        self.project_id.is_some()
    }

    pub fn is_associated(&self) -> bool {
        self.fixed_ip_id.is_some()
    }

    /// Bind to `binding` when the address is owned and unbound. Only
    /// [`BindOutcome::Bound`] changes the record.
    pub fn try_bind(&mut self, binding: FixedIpBinding, host: &str) -> BindOutcome {
        if !self.is_allocated() {
            return BindOutcome::NotAllocated;
        }
        match self.fixed_ip_id {
            None => {
                self.fixed_ip_id = Some(binding.fixed_ip.id);
                self.host = Some(host.to_owned());
                BindOutcome::Bound(binding)
            }
            Some(current) if current == binding.fixed_ip.id => BindOutcome::AlreadyBound,
            Some(current) => BindOutcome::Conflict {
                fixed_ip_id: current,
            },
        }
    }

    /// Drop the owner unless bound. Only [`ReleaseOutcome::Released`] changes
    /// the record.
    pub fn try_release(&mut self) -> ReleaseOutcome {
        if let Some(fixed_ip_id) = self.fixed_ip_id {
            return ReleaseOutcome::StillBound { fixed_ip_id };
        }
        self.project_id = None;
        self.host = None;
        self.auto_assigned = false;
        ReleaseOutcome::Released
    }

    /// clear the binding & host tag, returns the fixed ip id that was bound
    pub fn unbind(&mut self) -> Option<u64> {
        let fixed_ip_id = self.fixed_ip_id.take()?;
        self.host = None;
        Some(fixed_ip_id)
    }
}

/// unowned pool entry for [`Storage::floating_ip_bulk_create`]
///
/// [`Storage::floating_ip_bulk_create`]: crate::Storage::floating_ip_bulk_create
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewFloatingIp {
    pub address: IpAddr,
    pub pool: String,
    pub interface: Option<String>,
}

/// an instance's address on a tenant network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedIp {
    pub id: u64,
    pub address: IpAddr,
    pub network_id: u64,
    pub instance_uuid: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub id: u64,
    pub label: String,
    /// driver work follows the instance's host instead of `host`
    pub multi_host: bool,
    /// authoritative host when not `multi_host`
    pub host: Option<String>,
}

/// a fixed ip joined with its network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedIpBinding {
    pub fixed_ip: FixedIp,
    pub network: Network,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub uuid: Uuid,
    /// `None` until scheduled
    pub host: Option<String>,
    pub project_id: String,
}

/// a running manager process, refreshed by heartbeats
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub host: String,
    pub topic: String,
    pub updated_at: DateTime<Utc>,
    pub disabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "lowercase")]
pub enum DomainScope {
    /// served by the instance DNS driver
    Private { availability_zone: String },
    /// served by the floating DNS driver
    Public { project_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsDomain {
    pub domain: String,
    #[serde(flatten)]
    pub scope: DomainScope,
}

impl DnsDomain {
    pub fn is_private(&self) -> bool {
        matches!(self.scope, DomainScope::Private { .. })
    }
}

/// Result of the compare-and-swap bind in [`Storage::floating_ip_fixed_ip_associate`].
///
/// [`Storage::floating_ip_fixed_ip_associate`]: crate::Storage::floating_ip_fixed_ip_associate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindOutcome {
    /// the address was unbound and is now bound to the returned fixed ip
    Bound(FixedIpBinding),
    /// the address was already bound to the requested fixed ip, nothing changed
    AlreadyBound,
    /// the address is bound to a different fixed ip, nothing changed
    Conflict { fixed_ip_id: u64 },
    /// the address has no owning project, nothing changed
    NotAllocated,
}

/// Result of the conditional release in [`Storage::floating_ip_deallocate`].
///
/// [`Storage::floating_ip_deallocate`]: crate::Storage::floating_ip_deallocate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// owner, host and auto-assigned flag were cleared
    Released,
    /// the address is bound to a fixed ip, nothing changed
    StillBound { fixed_ip_id: u64 },
}
