//! [`HostRpc`] over NATS request/reply.
use std::{net::IpAddr, time::Instant};

use async_trait::async_trait;
use floating_ips::{AssociateRequest, DisassociateRequest, HostRpc, RequestContext, RpcError};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    client::NatsClient,
    metrics::{self, RPC_LATENCY, RPC_REMOTE_ERRORS, RPC_SENT, RPC_UNREACHABLE},
    models::{RpcEnvelope, RpcReply, RpcRequest, decode, encode},
};

#[derive(Debug, Clone)]
pub struct NatsHostRpc {
    client: NatsClient,
}

impl NatsHostRpc {
    pub fn new(client: NatsClient) -> Self {
        Self { client }
    }

    /// Send `request` to `host` and wait for its reply. No reply, or one
    /// that cannot be read, is [`RpcError::Unreachable`].
    pub async fn call(
        &self,
        ctx: &RequestContext,
        host: &str,
        request: RpcRequest,
    ) -> Result<(), RpcError> {
        let unreachable = |reason: String| {
            RPC_UNREACHABLE.inc();
            RpcError::Unreachable {
                host: host.to_owned(),
                reason,
            }
        };
        let method = request.method();
        metrics::by_method(&RPC_SENT, &request).inc();

        let subject = self
            .client
            .resolver()
            .host_subject(host)
            .map_err(|err| unreachable(err.to_string()))?;
        let payload = encode(&RpcEnvelope::new(ctx, request)).map_err(|err| unreachable(err.to_string()))?;

        let start = Instant::now();
        let reply = self.client.request(&subject, payload).await;
        RPC_LATENCY
            .with_label_values(&[method])
            .observe(start.elapsed().as_secs_f64());
        let reply = reply.map_err(|err| {
            warn!(host, method, %err, "peer request failed");
            unreachable(err.to_string())
        })?;

        match decode::<RpcReply>(&reply).map_err(|err| unreachable(err.to_string()))? {
            RpcReply::Ok => {
                debug!(host, method, request_id = %ctx.request_id, "peer request done");
                Ok(())
            }
            RpcReply::Err { kind, message } => {
                RPC_REMOTE_ERRORS.inc();
                Err(RpcError::Remote {
                    host: host.to_owned(),
                    kind,
                    message,
                })
            }
        }
    }

    pub async fn migrate_instance_start(
        &self,
        ctx: &RequestContext,
        host: &str,
        instance_uuid: Uuid,
        addresses: Vec<IpAddr>,
        source: Option<String>,
        dest: Option<String>,
    ) -> Result<(), RpcError> {
        self.call(
            ctx,
            host,
            RpcRequest::MigrateInstanceStart {
                instance_uuid,
                addresses,
                source,
                dest,
            },
        )
        .await
    }

    pub async fn migrate_instance_finish(
        &self,
        ctx: &RequestContext,
        host: &str,
        instance_uuid: Uuid,
        addresses: Vec<IpAddr>,
        source: Option<String>,
        dest: Option<String>,
    ) -> Result<(), RpcError> {
        self.call(
            ctx,
            host,
            RpcRequest::MigrateInstanceFinish {
                instance_uuid,
                addresses,
                host: Some(host.to_owned()),
                source,
                dest,
            },
        )
        .await
    }
}

#[async_trait]
impl HostRpc for NatsHostRpc {
    async fn associate_floating_ip(
        &self,
        ctx: &RequestContext,
        host: &str,
        req: AssociateRequest,
    ) -> Result<(), RpcError> {
        self.call(ctx, host, RpcRequest::AssociateFloatingIp(req))
            .await
    }

    async fn disassociate_floating_ip(
        &self,
        ctx: &RequestContext,
        host: &str,
        req: DisassociateRequest,
    ) -> Result<(), RpcError> {
        self.call(ctx, host, RpcRequest::DisassociateFloatingIp(req))
            .await
    }
}
