//! NATS connection shared by the rpc client, the rpc server and the
//! notifier.
//!
//! The connection is established once with bounded retries. After that
//! async-nats reconnects on its own and [`NatsClient::connection_state`]
//! reports what it sees.

use std::{fmt, path::Path, sync::Arc, time::Duration};

use async_nats::{ConnectOptions, Subscriber, jetstream};
use config::{NatsConfig, NatsSecurityMode};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::{
    error::{TransportError, TransportResult},
    subjects::SubjectResolver,
};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
const CONNECT_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
const MAX_CONNECT_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    /// first connect in progress, or async-nats is reconnecting
    Reconnecting,
    Disconnected,
}

struct Conn {
    client: Option<async_nats::Client>,
    state: ConnectionState,
}

#[derive(Clone)]
pub struct NatsClient {
    conn: Arc<RwLock<Conn>>,
    config: Arc<NatsConfig>,
    resolver: SubjectResolver,
    request_timeout: Duration,
}

/// value of a field the security mode cannot do without
fn required<'a, T: ?Sized>(
    value: Option<&'a T>,
    mode: &str,
    field: &str,
) -> TransportResult<&'a T> {
    value.ok_or_else(|| {
        TransportError::Config(format!("{mode} security mode requires '{field}'"))
    })
}

impl NatsClient {
    /// Does not connect, see [`NatsClient::connect`].
    pub fn new(config: NatsConfig, resolver: SubjectResolver) -> Self {
        let request_timeout = config.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        Self {
            conn: Arc::new(RwLock::new(Conn {
                client: None,
                state: ConnectionState::Disconnected,
            })),
            config: Arc::new(config),
            resolver,
            request_timeout,
        }
    }

    async fn connect_options(config: &NatsConfig) -> TransportResult<ConnectOptions> {
        let mut opts = ConnectOptions::new();
        match config.security_mode {
            NatsSecurityMode::None => {}
            NatsSecurityMode::UserPassword => {
                let user = required(config.username.as_deref(), "user_password", "username")?;
                let pass = required(config.password.as_deref(), "user_password", "password")?;
                opts = opts.user_and_password(user.to_owned(), pass.to_owned());
            }
            NatsSecurityMode::Token => {
                let token = required(config.token.as_deref(), "token", "token")?;
                opts = opts.token(token.to_owned());
            }
            NatsSecurityMode::Nkey => {
                let path = required(config.nkey_seed_path.as_deref(), "nkey", "nkey_seed_path")?;
                opts = opts.nkey(read_seed(path)?);
            }
            NatsSecurityMode::Tls => {
                let cert = required(config.tls_cert_path.as_deref(), "tls", "tls_cert_path")?;
                let key = required(config.tls_key_path.as_deref(), "tls", "tls_key_path")?;
                opts = opts
                    .add_client_certificate(cert.to_path_buf(), key.to_path_buf())
                    .require_tls(true);
            }
            NatsSecurityMode::CredsFile => {
                let path = required(
                    config.creds_file_path.as_deref(),
                    "creds_file",
                    "creds_file_path",
                )?;
                opts = opts.credentials_file(path).await.map_err(|err| {
                    TransportError::Config(format!(
                        "failed to load credentials file '{}': {err}",
                        path.display()
                    ))
                })?;
            }
        }
        // a CA alone still means a TLS server
        if let Some(ca) = &config.tls_ca_path {
            opts = opts.add_root_certificates(ca.clone()).require_tls(true);
        }
        Ok(opts
            .connection_timeout(config.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT))
            .retry_on_initial_connect())
    }

    /// Connect, retrying up to `connect_retry_max` times with exponential
    /// backoff. A no-op when already connected.
    pub async fn connect(&self) -> TransportResult<()> {
        {
            let mut conn = self.conn.write().await;
            if conn.state == ConnectionState::Connected {
                debug!("nats already connected");
                return Ok(());
            }
            conn.client = None;
            conn.state = ConnectionState::Reconnecting;
        }
        let config = &self.config;
        info!(
            servers = ?config.servers,
            security_mode = ?config.security_mode,
            connect_retry_max = config.connect_retry_max,
            "connecting to nats"
        );

        let attempts = config.connect_retry_max.saturating_add(1);
        let mut attempt = 0;
        loop {
            let opts = match Self::connect_options(config).await {
                Ok(opts) => opts,
                Err(err) => {
                    self.conn.write().await.state = ConnectionState::Disconnected;
                    return Err(err);
                }
            };
            match opts.connect(config.servers.clone()).await {
                Ok(client) => {
                    let mut conn = self.conn.write().await;
                    conn.client = Some(client);
                    conn.state = ConnectionState::Connected;
                    info!(attempt = attempt + 1, attempts, "nats connection established");
                    return Ok(());
                }
                Err(err) if attempt + 1 >= attempts => {
                    error!(attempts, %err, "nats connection failed, giving up");
                    self.conn.write().await.state = ConnectionState::Disconnected;
                    return Err(TransportError::Transport(format!(
                        "nats connection failed after {attempts} attempt(s): {err}"
                    )));
                }
                Err(err) => {
                    let delay = CONNECT_RETRY_BASE_DELAY
                        .saturating_mul(2u32.saturating_pow(attempt))
                        .min(MAX_CONNECT_RETRY_DELAY);
                    warn!(
                        attempt = attempt + 1,
                        attempts,
                        retry_in_ms = delay.as_millis(),
                        %err,
                        "nats connection attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    pub async fn connection_state(&self) -> ConnectionState {
        let conn = self.conn.read().await;
        match &conn.client {
            Some(client) => match client.connection_state() {
                async_nats::connection::State::Connected => ConnectionState::Connected,
                async_nats::connection::State::Disconnected
                | async_nats::connection::State::Pending => ConnectionState::Reconnecting,
            },
            None => conn.state,
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.connection_state().await == ConnectionState::Connected
    }

    pub fn resolver(&self) -> &SubjectResolver {
        &self.resolver
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    async fn client(&self) -> TransportResult<async_nats::Client> {
        self.conn
            .read()
            .await
            .client
            .clone()
            .ok_or_else(|| TransportError::NotConnected("nats client not connected".into()))
    }

    pub async fn publish(&self, subject: &str, payload: Vec<u8>) -> TransportResult<()> {
        self.client()
            .await?
            .publish(subject.to_owned(), payload.into())
            .await
            .map_err(|err| TransportError::Transport(format!("publish to '{subject}' failed: {err}")))
    }

    /// Request/reply bounded by the configured request timeout.
    pub async fn request(&self, subject: &str, payload: Vec<u8>) -> TransportResult<Vec<u8>> {
        let client = self.client().await?;
        let reply = tokio::time::timeout(
            self.request_timeout,
            client.request(subject.to_owned(), payload.into()),
        )
        .await
        .map_err(|_| {
            TransportError::Timeout(format!(
                "request to '{subject}' timed out after {:?}",
                self.request_timeout
            ))
        })?
        .map_err(|err| TransportError::Transport(format!("request to '{subject}' failed: {err}")))?;
        Ok(reply.payload.to_vec())
    }

    pub async fn subscribe(&self, subject: &str) -> TransportResult<Subscriber> {
        self.client()
            .await?
            .subscribe(subject.to_owned())
            .await
            .map_err(|err| {
                TransportError::Transport(format!("subscribe to '{subject}' failed: {err}"))
            })
    }

    pub async fn jetstream_context(&self) -> TransportResult<jetstream::Context> {
        Ok(jetstream::new(self.client().await?))
    }

    /// Open `bucket`, creating it with `history` revisions per key if missing.
    pub async fn get_or_create_kv_bucket(
        &self,
        bucket: &str,
        history: i64,
    ) -> TransportResult<jetstream::kv::Store> {
        let js = self.jetstream_context().await?;
        match js.get_key_value(bucket.to_owned()).await {
            Ok(store) => Ok(store),
            Err(get_err) => {
                debug!(bucket, error = %get_err, "creating missing JetStream KV bucket");
                js.create_key_value(jetstream::kv::Config {
                    bucket: bucket.to_owned(),
                    history,
                    ..Default::default()
                })
                .await
                .map_err(|create_err| {
                    TransportError::Transport(format!(
                        "failed to create JetStream KV bucket '{bucket}': {create_err} (get error: {get_err})"
                    ))
                })
            }
        }
    }

    pub async fn disconnect(&self) {
        let mut conn = self.conn.write().await;
        conn.client = None;
        conn.state = ConnectionState::Disconnected;
        info!("nats client disconnected");
    }
}

fn read_seed(path: &Path) -> TransportResult<String> {
    std::fs::read_to_string(path)
        .map(|seed| seed.trim().to_owned())
        .map_err(|err| {
            TransportError::Config(format!(
                "failed to read nkey seed file '{}': {err}",
                path.display()
            ))
        })
}

impl fmt::Debug for NatsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NatsClient")
            .field("servers", &self.config.servers)
            .field("resolver", &self.resolver)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}
