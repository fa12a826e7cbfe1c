//! Wire types for requests between manager hosts. JSON on the wire.

use std::net::IpAddr;

use floating_ips::{AssociateRequest, DisassociateRequest, ErrorKind, RequestContext};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::error::TransportResult;

/// one request, sent to `<prefix>.<topic>.<host>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcEnvelope {
    pub context: RequestContext,
    pub request: RpcRequest,
}

impl RpcEnvelope {
    pub fn new(context: &RequestContext, request: RpcRequest) -> Self {
        Self {
            context: context.clone(),
            request,
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.context.request_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "args", rename_all = "snake_case")]
pub enum RpcRequest {
    AssociateFloatingIp(AssociateRequest),
    DisassociateFloatingIp(DisassociateRequest),
    MigrateInstanceStart {
        instance_uuid: Uuid,
        addresses: Vec<IpAddr>,
        source: Option<String>,
        dest: Option<String>,
    },
    MigrateInstanceFinish {
        instance_uuid: Uuid,
        addresses: Vec<IpAddr>,
        host: Option<String>,
        source: Option<String>,
        dest: Option<String>,
    },
}

impl RpcRequest {
    /// method name, also the metric label
    pub fn method(&self) -> &'static str {
        match self {
            RpcRequest::AssociateFloatingIp(_) => "associate",
            RpcRequest::DisassociateFloatingIp(_) => "disassociate",
            RpcRequest::MigrateInstanceStart { .. } => "migrate_start",
            RpcRequest::MigrateInstanceFinish { .. } => "migrate_finish",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RpcReply {
    Ok,
    /// the error kind survives the hop so callers can match on it
    Err { kind: ErrorKind, message: String },
}

pub fn encode<T: Serialize>(value: &T) -> TransportResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

pub fn decode<T: DeserializeOwned>(data: &[u8]) -> TransportResult<T> {
    Ok(serde_json::from_slice(data)?)
}
