//! # Healthcheck & API
//!
//! http api for healthcheck, metrics and a read-only view of the floating
//! ips this host carries. It exposes the following endpoints:
//!
//! /health
//! /ping
//! /metrics
//! /metrics-text
//! /floating-ips
//! /config
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::cognitive_complexity, clippy::too_many_arguments)]

use std::{net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum::{Router, extract::Extension, routing};
use config::FloatingConfig;
use fip_store::Storage;
use floating_ips::FloatingIpManager;
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace};

pub use crate::models::{Health, State};

/// The task runner for the [`ExternalApi`]
#[derive(Debug)]
pub struct ExternalApiGuard {
    task_handle: JoinHandle<()>,
}

impl Drop for ExternalApiGuard {
    fn drop(&mut self) {
        trace!("ExternalApiGuard drop called");
        self.task_handle.abort();
    }
}

/// Listens for health changes and serves the HTTP API
#[derive(Debug)]
pub struct ExternalApi<S> {
    tx: mpsc::Sender<Health>,
    rx: mpsc::Receiver<Health>,
    addr: SocketAddr,
    state: State,
    mgr: FloatingIpManager<S>,
    cfg: Arc<FloatingConfig>,
}

impl<S> ExternalApi<S>
where
    S: Storage + Clone,
{
    /// Create a new ExternalApi, health starts out BAD
    pub fn new(addr: SocketAddr, cfg: Arc<FloatingConfig>, mgr: FloatingIpManager<S>) -> Self {
        trace!("starting external api");
        let (tx, rx) = mpsc::channel(10);
        Self {
            tx,
            rx,
            addr,
            state: models::blank_health(),
            mgr,
            cfg,
        }
    }

    /// clone the health sender channel
    pub fn sender(&self) -> mpsc::Sender<Health> {
        self.tx.clone()
    }

    /// Set the health
    pub fn set_health(&self, health: Health) {
        *self.state.lock() = health;
    }

    async fn listen_status(&mut self) -> Result<()> {
        while let Some(health) = self.rx.recv().await {
            let mut guard = self.state.lock();
            if *guard != health {
                info!(%health, "health changed");
                *guard = health;
            }
        }
        info!("listen health exited-- nothing listening");
        Ok(())
    }

    async fn run(
        addr: SocketAddr,
        state: State,
        cfg: Arc<FloatingConfig>,
        mgr: FloatingIpManager<S>,
        token: CancellationToken,
    ) -> Result<()> {
        let tcp = TcpListener::bind(&addr).await?;
        let app = Router::new()
            .route("/health", routing::get(handlers::ok))
            .route("/ping", routing::get(handlers::ping))
            .route("/metrics", routing::get(handlers::metrics))
            .route("/metrics-text", routing::get(handlers::metrics_text))
            .route("/floating-ips", routing::get(handlers::host_floating_ips::<S>))
            .route("/config", routing::get(handlers::config))
            .layer(Extension(state))
            .layer(Extension(mgr))
            .layer(Extension(cfg));

        tracing::debug!("external API listening on {}", addr);

        axum::serve(tcp, app)
            .with_graceful_shutdown(token.cancelled_owned())
            .await?;
        info!("external API shut down");
        Ok(())
    }

    /// Kick off the HTTP service and start listening for health changes.
    /// Both stop when `token` is cancelled.
    pub fn start(mut self, token: CancellationToken) -> JoinHandle<()> {
        let state = self.state.clone();
        let addr = self.addr;
        let mgr = self.mgr.clone();
        let cfg = self.cfg.clone();

        tokio::spawn(async move {
            tokio::select! {
                res = ExternalApi::run(addr, state, cfg, mgr, token) => {
                    if let Err(err) = res {
                        error!(?err, "external API failed");
                    }
                }
                res = self.listen_status() => {
                    if let Err(err) = res {
                        error!(?err, "health listener failed");
                    }
                }
            }
        })
    }

    /// Start serving, the task stops when the guard drops
    pub fn serve(self, token: CancellationToken) -> ExternalApiGuard {
        ExternalApiGuard {
            task_handle: self.start(token),
        }
    }
}

mod handlers {

    use std::sync::Arc;

    use anyhow::Context;
    use axum::{
        Json,
        body::Body,
        extract::Extension,
        http::header,
        http::{Response, StatusCode},
        response::IntoResponse,
    };
    use config::FloatingConfig;
    use fip_core::metrics::{START_TIME, UPTIME};
    use fip_store::Storage;
    use floating_ips::FloatingIpManager;
    use prometheus::{Encoder, ProtobufEncoder, TextEncoder};
    use tracing::error;

    use crate::models::{FloatingIpView, Health, ServerResult, State};

    pub(crate) async fn ok(Extension(state): Extension<State>) -> ServerResult<impl IntoResponse> {
        Ok(match *state.lock() {
            Health::Good => StatusCode::OK,
            Health::Bad => StatusCode::INTERNAL_SERVER_ERROR,
        })
    }

    /// floating ips whose L3 rule lives on this host
    pub(crate) async fn host_floating_ips<S: Storage + Clone>(
        Extension(mgr): Extension<FloatingIpManager<S>>,
    ) -> ServerResult<impl IntoResponse> {
        let fips = mgr
            .get_floating_ips_by_host(mgr.host())
            .await
            .map_err(|err| anyhow::anyhow!("failed to list floating ips: {err}"))?;
        Ok(Json(
            fips.into_iter()
                .map(FloatingIpView::from)
                .collect::<Vec<_>>(),
        ))
    }

    pub(crate) async fn config(
        Extension(cfg): Extension<Arc<FloatingConfig>>,
    ) -> ServerResult<impl IntoResponse> {
        // the parsed config does not serialize back, serve the file as read
        let path = cfg.path().context("no path specified for config")?;
        let cfg = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to find config at {}", path.display()))?;
        Ok(cfg)
    }

    pub(crate) async fn metrics() -> ServerResult<impl IntoResponse> {
        UPTIME.set(START_TIME.elapsed().as_secs() as i64);
        let encoder = ProtobufEncoder::new();
        let mut buf = Vec::new();
        let mf = prometheus::gather();
        let resp = Response::builder().header(header::CONTENT_TYPE, encoder.format_type());

        match encoder.encode(&mf, &mut buf) {
            Err(err) => {
                error!(?err, "error protobuf encoding prometheus metrics");
                Ok(resp
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())?)
            }
            Ok(_) => Ok(resp.status(StatusCode::OK).body(Body::from(buf))?),
        }
    }

    pub(crate) async fn metrics_text() -> ServerResult<impl IntoResponse> {
        UPTIME.set(START_TIME.elapsed().as_secs() as i64);
        let encoder = TextEncoder::new();
        let mut buf = String::new();
        let mf = prometheus::gather();
        let resp = Response::builder().header(header::CONTENT_TYPE, encoder.format_type());

        match encoder.encode_utf8(&mf, &mut buf) {
            Err(err) => {
                error!(?err, "error text encoding prometheus metrics");
                Ok(resp
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())?)
            }
            Ok(_) => Ok(resp.status(StatusCode::OK).body(Body::from(buf))?),
        }
    }

    pub(crate) async fn ping() -> impl IntoResponse {
        StatusCode::OK
    }
}

/// Various models for API responses
pub mod models {
    use std::{fmt, net::IpAddr, sync::Arc};

    use axum::response::IntoResponse;
    use fip_store::FloatingIp;
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};

    /// The overall health of the system
    pub type State = Arc<Mutex<Health>>;
    /// Health is binary Good/Bad at the moment
    #[derive(Serialize, Deserialize, Debug, PartialEq, Copy, Clone, Eq)]
    #[serde(rename_all = "UPPERCASE")]
    pub enum Health {
        /// Report good health
        Good,
        /// Report bad health
        Bad,
    }

    impl fmt::Display for Health {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(match *self {
                Health::Good => "GOOD",
                Health::Bad => "BAD",
            })
        }
    }

    pub(crate) fn blank_health() -> State {
        Arc::new(Mutex::new(Health::Bad))
    }

    /// a floating ip as `/floating-ips` reports it
    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
    pub struct FloatingIpView {
        /// the floating address
        pub address: IpAddr,
        /// pool it was allocated from
        pub pool: String,
        /// owning project
        pub project_id: Option<String>,
        /// allocated on instance boot
        pub auto_assigned: bool,
        /// interface override
        pub interface: Option<String>,
    }

    impl From<FloatingIp> for FloatingIpView {
        fn from(fip: FloatingIp) -> Self {
            Self {
                address: fip.address,
                pool: fip.pool,
                project_id: fip.project_id,
                auto_assigned: fip.auto_assigned,
                interface: fip.interface,
            }
        }
    }

    /// Make our own error that wraps `anyhow::Error`.
    #[derive(Debug)]
    pub struct ServerError(anyhow::Error);
    /// return error result
    pub type ServerResult<T> = Result<T, ServerError>;

    impl IntoResponse for ServerError {
        fn into_response(self) -> axum::response::Response {
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                format!("{}", self.0),
            )
                .into_response()
        }
    }

    impl<E> From<E> for ServerError
    where
        E: Into<anyhow::Error>,
    {
        fn from(err: E) -> Self {
            Self(err.into())
        }
    }
}
