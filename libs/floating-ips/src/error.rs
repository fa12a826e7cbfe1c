use std::net::IpAddr;

use net_drivers::{DnsError, DriverError};
use quota::QuotaError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::rpc::RpcError;

#[derive(Error, Debug)]
pub enum FloatingIpError<E> {
    #[error("not authorized: {0}")]
    NotAuthorized(String),
    #[error("floating ip quota exceeded for project {project_id}")]
    FloatingIpLimitExceeded { project_id: String },
    #[error("no more floating ips in pool {0}")]
    NoMoreFloatingIps(String),
    #[error("floating ip {0} not found")]
    FloatingIpNotFound(u64),
    #[error("floating ip not found for address {0}")]
    FloatingIpNotFoundForAddress(IpAddr),
    #[error("fixed ip {0} not found")]
    FixedIpNotFound(u64),
    #[error("fixed ip not found for address {0}")]
    FixedIpNotFoundForAddress(IpAddr),
    #[error("network {0} not found")]
    NetworkNotFound(u64),
    #[error("instance {0} not found")]
    InstanceNotFound(Uuid),
    #[error("no authoritative host for network {network}: {reason}")]
    NoAuthoritativeHost { network: u64, reason: String },
    #[error("floating ip {0} is associated")]
    FloatingIpAssociated(IpAddr),
    #[error("floating ip {0} is not associated")]
    FloatingIpNotAssociated(IpAddr),
    #[error("floating ip {0} was auto assigned and can not be disassociated")]
    CannotDisassociateAutoAssignedFloatingIp(IpAddr),
    #[error("interface {0} not found")]
    NoFloatingIpInterface(String),
    #[error("l3 driver error: {0}")]
    Driver(#[source] DriverError),
    #[error("dns driver error: {0}")]
    Dns(#[source] DnsError),
    #[error("quota error: {0}")]
    Quota(#[source] QuotaError),
    #[error("peer rpc error: {0}")]
    Rpc(#[source] RpcError),
    #[error("database error: {0}")]
    DbError(#[from] E),
}

/// Transport-stable category of a [`FloatingIpError`]. Peers send it back over
/// RPC so the caller can rebuild the error's meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotAuthorized,
    QuotaExceeded,
    NoMoreFloatingIps,
    FloatingIpNotFound,
    FixedIpNotFound,
    NetworkNotFound,
    InstanceNotFound,
    NoAuthoritativeHost,
    FloatingIpAssociated,
    FloatingIpNotAssociated,
    CannotDisassociateAutoAssigned,
    NoFloatingIpInterface,
    Driver,
    Dns,
    Quota,
    Dispatch,
    Store,
}

impl ErrorKind {
    /// the caller can fix the request, as opposed to a server side failure
    pub fn is_client_error(&self) -> bool {
        !matches!(
            self,
            ErrorKind::Driver
                | ErrorKind::Dns
                | ErrorKind::Quota
                | ErrorKind::Dispatch
                | ErrorKind::Store
                | ErrorKind::NoAuthoritativeHost
        )
    }
}

impl<E> FloatingIpError<E> {
    pub fn kind(&self) -> ErrorKind {
        use FloatingIpError::*;
        match self {
            NotAuthorized(_) => ErrorKind::NotAuthorized,
            FloatingIpLimitExceeded { .. } => ErrorKind::QuotaExceeded,
            NoMoreFloatingIps(_) => ErrorKind::NoMoreFloatingIps,
            FloatingIpNotFound(_) | FloatingIpNotFoundForAddress(_) => {
                ErrorKind::FloatingIpNotFound
            }
            FixedIpNotFound(_) | FixedIpNotFoundForAddress(_) => ErrorKind::FixedIpNotFound,
            NetworkNotFound(_) => ErrorKind::NetworkNotFound,
            InstanceNotFound(_) => ErrorKind::InstanceNotFound,
            NoAuthoritativeHost { .. } => ErrorKind::NoAuthoritativeHost,
            FloatingIpAssociated(_) => ErrorKind::FloatingIpAssociated,
            FloatingIpNotAssociated(_) => ErrorKind::FloatingIpNotAssociated,
            CannotDisassociateAutoAssignedFloatingIp(_) => {
                ErrorKind::CannotDisassociateAutoAssigned
            }
            NoFloatingIpInterface(_) => ErrorKind::NoFloatingIpInterface,
            Driver(_) => ErrorKind::Driver,
            Dns(_) => ErrorKind::Dns,
            Quota(_) => ErrorKind::Quota,
            Rpc(RpcError::Remote { kind, .. }) => *kind,
            Rpc(_) => ErrorKind::Dispatch,
            DbError(_) => ErrorKind::Store,
        }
    }

    /// quota answers become `FloatingIpLimitExceeded` when over the limit
    pub(crate) fn from_quota(err: QuotaError) -> Self {
        match err {
            QuotaError::OverQuota { project_id, .. } => {
                FloatingIpError::FloatingIpLimitExceeded { project_id }
            }
            other => FloatingIpError::Quota(other),
        }
    }

    /// Driver failures that report a missing device become
    /// `NoFloatingIpInterface`.
    pub(crate) fn from_driver(err: DriverError, interface: &str) -> Self {
        if err.is_missing_device() {
            FloatingIpError::NoFloatingIpInterface(interface.to_owned())
        } else {
            FloatingIpError::Driver(err)
        }
    }
}
