#![allow(clippy::cognitive_complexity)]
use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow};

mod seed;
mod startup_health;

use config::{DnsDriverKind, FloatingConfig};
use external_api::{ExternalApi, Health};
use fip_core::{
    config::{
        cli::{self, Parser},
        trace,
    },
    metrics::{SERVICE_HEARTBEAT_ERRORS, SERVICE_HEARTBEATS},
    tokio::{self, runtime::Builder, signal, task::JoinHandle},
    tracing::*,
};
use fip_store::{Provision, memory::MemoryStore};
use floating_ips::FloatingIpManager;
use host_rpc::{NatsClient, NatsHostRpc, NatsNotifier, NatsStore, RpcServer, SubjectResolver};
use net_drivers::{DnsDriver, MemoryDnsDriver, NoopDnsDriver, NoopL3Driver};
use quota::MemoryQuota;
use startup_health::verify_startup_subsystems;

#[cfg(not(target_env = "musl"))]
use jemallocator::Jemalloc;
use tokio_util::sync::CancellationToken;

#[cfg(not(target_env = "musl"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

fn main() -> Result<()> {
    // parses from cli or environment var
    let config = cli::Config::parse();
    let trace_config = trace::Config::parse(&config.fipd_log)?;
    debug!(?config, ?trace_config);
    if let Err(err) = dotenv::dotenv() {
        debug!(?err, ".env file not loaded");
    }

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&config.thread_name).enable_all();
    // default num threads will be num logical CPUs
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }
    let rt = builder.build()?;

    rt.block_on(async move {
        match tokio::spawn(async move { start(config).await }).await {
            Err(err) => error!(?err, "failed to start server"),
            Ok(Err(err)) => error!(?err, "exited with error"),
            Ok(_) => debug!("exiting..."),
        }
    });

    Ok(())
}

async fn start(config: cli::Config) -> Result<()> {
    debug!("parsing fipd config");
    let file_cfg = Arc::new(FloatingConfig::parse(&config.config_path)?);
    let host = config.effective_host(file_cfg.host()).to_owned();
    info!(host, "using host");

    match file_cfg.nats() {
        Some(nats_cfg) => {
            let resolver = SubjectResolver::new(
                &nats_cfg.subject_prefix,
                &file_cfg.manager().network_topic,
            )
            .map_err(|err| anyhow!("subject resolver error: {err}"))?;
            let client = NatsClient::new(nats_cfg.clone(), resolver);
            info!("connecting to NATS for peer rpc & shared store");
            client
                .connect()
                .await
                .map_err(|err| anyhow!("NATS connection failed: {err}"))?;
            let store = NatsStore::open(&client, &nats_cfg.store_bucket)
                .await
                .with_context(|| {
                    format!("failed to open store bucket {}", nats_cfg.store_bucket)
                })?;
            run(config, file_cfg, host, store, Some(client)).await
        }
        None => {
            warn!("no nats configured, running standalone on an in-memory store");
            run(config, file_cfg, host, MemoryStore::new(), None).await
        }
    }
}

/// Serve with `store` until shutdown. With a NATS client, bindings owned by
/// other hosts go over peer rpc.
async fn run<S>(
    config: cli::Config,
    file_cfg: Arc<FloatingConfig>,
    host: String,
    store: S,
    nats_client: Option<NatsClient>,
) -> Result<()>
where
    S: Provision + Clone,
{
    seed::populate(&store, file_cfg.seed()).await?;

    let opts = file_cfg.manager().clone();
    let mut mgr = FloatingIpManager::new(
        host.clone(),
        store.clone(),
        opts.clone(),
        Arc::new(MemoryQuota::new(file_cfg.quota().clone())),
        Arc::new(NoopL3Driver),
        dns_driver(file_cfg.dns().floating),
        dns_driver(file_cfg.dns().instance),
    );
    if let Some(client) = &nats_client {
        mgr = mgr
            .with_rpc(Arc::new(NatsHostRpc::new(client.clone())))
            .with_notifier(Arc::new(NatsNotifier::new(client.clone())));
    }

    let restored = mgr
        .init_host()
        .await
        .context("failed to restore floating ip rules")?;
    debug!(restored, "init_host done");

    let token = CancellationToken::new();
    let api = ExternalApi::new(config.external_api, Arc::clone(&file_cfg), mgr.clone());
    let api_sender = api.sender();
    let mut api_task = api.start(token.clone());

    let mut heartbeat_task = spawn_heartbeat_task(
        store,
        host,
        opts.network_topic.clone(),
        file_cfg.report_interval(),
        token.clone(),
    );
    let mut rpc_task = nats_client.clone().map(|client| {
        let server = RpcServer::new(client, mgr.clone(), token.clone());
        tokio::spawn(async move { server.run().await.map_err(anyhow::Error::from) })
    });

    // Keep health BAD until all startup-critical tasks are confirmed running.
    if let Err(err) =
        verify_startup_subsystems(&mut api_task, &mut heartbeat_task, rpc_task.as_mut()).await
    {
        let _ = api_sender.send(Health::Bad).await;
        token.cancel();
        return Err(err);
    }

    debug!("changing health to good after startup checks passed");
    api_sender
        .send(Health::Good)
        .await
        .context("error occurred in changing health status to Good")?;

    tokio::select! {
        res = shutdown_signal(token.clone()) => res?,
        err = rpc_stopped(&mut rpc_task) => {
            let _ = api_sender.send(Health::Bad).await;
            token.cancel();
            return Err(err);
        }
    }

    if let Err(err) = heartbeat_task.await {
        error!(?err, "error waiting for heartbeat task");
    }
    if let Some(task) = rpc_task
        && let Err(err) = task.await
    {
        error!(?err, "error waiting for peer rpc server");
    }
    if let Err(err) = api_task.await {
        error!(?err, "error waiting for web server API");
    }
    if let Some(client) = nats_client {
        client.disconnect().await;
    }
    Ok(())
}

fn dns_driver(kind: DnsDriverKind) -> Arc<dyn DnsDriver> {
    match kind {
        DnsDriverKind::Noop => Arc::new(NoopDnsDriver),
        DnsDriverKind::Memory => Arc::new(MemoryDnsDriver::new()),
    }
}

/// Refresh this host's service record so peers see it as live.
fn spawn_heartbeat_task<S: Provision + Clone>(
    store: S,
    host: String,
    topic: String,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("heartbeat task stopping");
                    return;
                }
                _ = ticker.tick() => {
                    match store.service_heartbeat(&host, &topic).await {
                        Ok(service) => {
                            SERVICE_HEARTBEATS.inc();
                            trace!(host, topic, updated_at = %service.updated_at, "service heartbeat");
                        }
                        Err(err) => {
                            SERVICE_HEARTBEAT_ERRORS.inc();
                            warn!(?err, host, topic, "service heartbeat failed");
                        }
                    }
                }
            }
        }
    })
}

/// Resolves when the rpc server stops before shutdown, never without one.
async fn rpc_stopped(handle: &mut Option<JoinHandle<Result<()>>>) -> anyhow::Error {
    match handle.as_mut() {
        Some(handle) => match handle.await {
            Ok(Ok(())) => anyhow!("peer rpc server stopped"),
            Ok(Err(err)) => err,
            Err(err) => anyhow!(err),
        },
        None => std::future::pending().await,
    }
}

async fn shutdown_signal(token: CancellationToken) -> Result<()> {
    let ret = signal::ctrl_c().await.map_err(|err| anyhow!(err));
    info!("shutting down");
    token.cancel();
    ret
}
