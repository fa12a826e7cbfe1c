//! the seam to peer manager hosts
use std::{fmt, net::IpAddr};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{context::RequestContext, error::ErrorKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociateRequest {
    pub floating_address: IpAddr,
    pub fixed_address: IpAddr,
    /// the floating ip record's interface override
    pub interface: Option<String>,
    pub instance_uuid: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisassociateRequest {
    pub address: IpAddr,
    /// the floating ip record's interface override
    pub interface: Option<String>,
    /// `false` clears the store binding without touching the L3 driver
    pub teardown: bool,
    pub instance_uuid: Option<Uuid>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// the request never got an answer
    #[error("host {host} unreachable: {reason}")]
    Unreachable { host: String, reason: String },
    /// the peer ran the request and it failed
    #[error("host {host} failed with {kind:?}: {message}")]
    Remote {
        host: String,
        kind: ErrorKind,
        message: String,
    },
}

/// Runs the local binding/unbinding step on another manager host.
#[async_trait]
pub trait HostRpc: Send + Sync + fmt::Debug + 'static {
    async fn associate_floating_ip(
        &self,
        ctx: &RequestContext,
        host: &str,
        req: AssociateRequest,
    ) -> Result<(), RpcError>;

    async fn disassociate_floating_ip(
        &self,
        ctx: &RequestContext,
        host: &str,
        req: DisassociateRequest,
    ) -> Result<(), RpcError>;
}

/// for a manager running without peers, every remote host is unreachable
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPeers;

#[async_trait]
impl HostRpc for NoPeers {
    async fn associate_floating_ip(
        &self,
        _ctx: &RequestContext,
        host: &str,
        _req: AssociateRequest,
    ) -> Result<(), RpcError> {
        Err(RpcError::Unreachable {
            host: host.to_owned(),
            reason: "peer rpc is not configured".into(),
        })
    }

    async fn disassociate_floating_ip(
        &self,
        _ctx: &RequestContext,
        host: &str,
        _req: DisassociateRequest,
    ) -> Result<(), RpcError> {
        Err(RpcError::Unreachable {
            host: host.to_owned(),
            reason: "peer rpc is not configured".into(),
        })
    }
}
