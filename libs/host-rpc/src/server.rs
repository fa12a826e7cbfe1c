//! Serves requests from peer hosts on this host's subject.
use std::fmt;

use fip_store::Storage;
use floating_ips::{ErrorKind, FloatingIpError, FloatingIpManager};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::{
    client::NatsClient,
    error::TransportResult,
    metrics::{self, RPC_DISPATCH_ERRORS, RPC_HANDLED},
    models::{RpcEnvelope, RpcReply, RpcRequest, decode, encode},
};

pub struct RpcServer<S> {
    client: NatsClient,
    mgr: FloatingIpManager<S>,
    token: CancellationToken,
}

impl<S> fmt::Debug for RpcServer<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcServer")
            .field("client", &self.client)
            .field("mgr", &self.mgr)
            .finish_non_exhaustive()
    }
}

impl<S> RpcServer<S>
where
    S: Storage + Clone,
{
    pub fn new(client: NatsClient, mgr: FloatingIpManager<S>, token: CancellationToken) -> Self {
        Self { client, mgr, token }
    }

    /// Subscribe and serve until the token is cancelled. Each request runs
    /// on its own task.
    #[instrument(level = "info", name = "rpc_server", skip(self), fields(host = %self.mgr.host()))]
    pub async fn run(self) -> TransportResult<()> {
        let subject = self.client.resolver().host_subject(self.mgr.host())?;
        let mut sub = self.client.subscribe(&subject).await?;
        info!(subject, "serving peer requests");
        loop {
            tokio::select! {
                _ = self.token.cancelled() => {
                    debug!("rpc server shutting down");
                    break;
                }
                msg = sub.next() => {
                    let Some(msg) = msg else {
                        warn!("rpc subscription closed");
                        break;
                    };
                    let client = self.client.clone();
                    let mgr = self.mgr.clone();
                    tokio::spawn(async move {
                        let reply = dispatch(&mgr, &msg.payload).await;
                        let Some(to) = msg.reply else {
                            trace!("request without reply subject, answer dropped");
                            return;
                        };
                        let sent = match encode(&reply) {
                            Ok(payload) => client.publish(to.as_str(), payload).await,
                            Err(err) => Err(err),
                        };
                        if let Err(err) = sent {
                            error!(?err, "failed to send rpc reply");
                        }
                    });
                }
            }
        }
        if let Err(err) = sub.unsubscribe().await {
            debug!(?err, "unsubscribe failed");
        }
        Ok(())
    }
}

/// Decode one request, run it against `mgr` and build the reply. An
/// undecodable payload is answered with [`ErrorKind::Dispatch`].
pub async fn dispatch<S>(mgr: &FloatingIpManager<S>, payload: &[u8]) -> RpcReply
where
    S: Storage + Clone,
{
    let envelope = match decode::<RpcEnvelope>(payload) {
        Ok(envelope) => envelope,
        Err(err) => {
            RPC_DISPATCH_ERRORS.inc();
            warn!(%err, "undecodable peer request");
            return RpcReply::Err {
                kind: ErrorKind::Dispatch,
                message: err.to_string(),
            };
        }
    };
    let RpcEnvelope { context: ctx, request } = envelope;
    metrics::by_method(&RPC_HANDLED, &request).inc();
    let method = request.method();
    debug!(method, request_id = %ctx.request_id, "peer request");

    let res = match request {
        RpcRequest::AssociateFloatingIp(req) => mgr.associate_local(&ctx, req).await,
        RpcRequest::DisassociateFloatingIp(req) => mgr.disassociate_local(&ctx, req).await,
        RpcRequest::MigrateInstanceStart {
            instance_uuid,
            addresses,
            source,
            dest,
        } => {
            mgr.migrate_instance_start(
                &ctx,
                instance_uuid,
                &addresses,
                source.as_deref(),
                dest.as_deref(),
            )
            .await
        }
        RpcRequest::MigrateInstanceFinish {
            instance_uuid,
            addresses,
            host,
            source,
            dest,
        } => {
            mgr.migrate_instance_finish(
                &ctx,
                instance_uuid,
                &addresses,
                host.as_deref(),
                source.as_deref(),
                dest.as_deref(),
            )
            .await
        }
    };
    reply(method, res)
}

fn reply<E: std::error::Error>(method: &str, res: Result<(), FloatingIpError<E>>) -> RpcReply {
    match res {
        Ok(()) => RpcReply::Ok,
        Err(err) => {
            warn!(method, %err, "peer request failed here");
            RpcReply::Err {
                kind: err.kind(),
                message: err.to_string(),
            }
        }
    }
}
