//! # config
//!
//! fipd's file config. The file is read as JSON first and YAML second into the
//! [`wire`] types, then validated and turned into the typed views the other
//! crates consume ([`ManagerOpts`], [`NatsConfig`], [`QuotaLimits`]).
use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use tracing::debug;

pub mod wire;

pub use wire::{DnsDriverKind, NatsSecurityMode};

/// server config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FloatingConfig {
    host: String,
    manager: ManagerOpts,
    report_interval: Duration,
    dns: wire::Dns,
    quota: QuotaLimits,
    nats: Option<NatsConfig>,
    seed: wire::Seed,
    path: Option<PathBuf>,
}

/// the settings the floating ip engine itself reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerOpts {
    /// pool used when an allocation names none
    pub default_floating_pool: String,
    /// allocate and associate an address for every booted instance
    pub auto_assign_floating_ip: bool,
    /// interface for L3 rules when the floating ip record carries none
    pub public_interface: Option<String>,
    /// topic network manager services heartbeat under
    pub network_topic: String,
    /// heartbeat age after which a service counts as down
    pub service_down_time: Duration,
}

impl Default for ManagerOpts {
    fn default() -> Self {
        Self {
            default_floating_pool: wire::default_floating_pool(),
            auto_assign_floating_ip: wire::default_auto_assign(),
            public_interface: wire::default_public_interface(),
            network_topic: wire::default_network_topic(),
            service_down_time: Duration::from_secs(
                wire::default_service_down_time().get() as u64
            ),
        }
    }
}

/// floating ip quota limits
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuotaLimits {
    /// limit for projects without an override, `None` is unlimited
    pub default_floating_ips: Option<u32>,
    /// per-project overrides
    pub projects: HashMap<String, u32>,
}

impl QuotaLimits {
    /// effective limit for `project_id`
    pub fn limit_for(&self, project_id: &str) -> Option<u32> {
        self.projects
            .get(project_id)
            .copied()
            .or(self.default_floating_ips)
    }
}

/// NATS connection settings for peer RPC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatsConfig {
    pub servers: Vec<String>,
    pub subject_prefix: String,
    pub security_mode: NatsSecurityMode,
    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    pub nkey_seed_path: Option<PathBuf>,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
    pub tls_ca_path: Option<PathBuf>,
    pub creds_file_path: Option<PathBuf>,
    pub connect_timeout: Option<Duration>,
    pub request_timeout: Option<Duration>,
    pub connect_retry_max: u32,
    pub store_bucket: String,
}

impl From<wire::Nats> for NatsConfig {
    fn from(nats: wire::Nats) -> Self {
        let secs = |n: std::num::NonZeroU32| Duration::from_secs(n.get() as u64);
        Self {
            servers: nats.servers,
            subject_prefix: nats.subject_prefix,
            security_mode: nats.security_mode,
            username: nats.username,
            password: nats.password,
            token: nats.token,
            nkey_seed_path: nats.nkey_seed_path,
            tls_cert_path: nats.tls_cert_path,
            tls_key_path: nats.tls_key_path,
            tls_ca_path: nats.tls_ca_path,
            creds_file_path: nats.creds_file_path,
            connect_timeout: nats.connect_timeout.map(secs),
            request_timeout: nats.request_timeout.map(secs),
            connect_retry_max: nats.connect_retry_max,
            store_bucket: nats.store_bucket,
        }
    }
}

impl FloatingConfig {
    /// attempts to decode the config first as JSON, then YAML, finally erroring if neither work
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("failed to find config at {}", &path.display()))?;
        let mut config = Self::parse_str(s)?;
        config.path = Some(path.to_path_buf());
        Ok(config)
    }

    /// attempts to decode the config first as JSON, then YAML, finally erroring if neither work
    pub fn parse_str<S: AsRef<str>>(s: S) -> Result<Self> {
        let s = s.as_ref();
        let wire: wire::Config = match serde_json::from_str(s) {
            Ok(cfg) => cfg,
            Err(json_err) => serde_yaml::from_str(s).with_context(|| {
                format!("config is neither valid JSON ({json_err}) nor valid YAML")
            })?,
        };
        debug!(?wire);
        Self::try_from(wire)
    }

    pub fn host(&self) -> &str {
        &self.host
    }
    pub fn manager(&self) -> &ManagerOpts {
        &self.manager
    }
    pub fn report_interval(&self) -> Duration {
        self.report_interval
    }
    pub fn dns(&self) -> &wire::Dns {
        &self.dns
    }
    pub fn quota(&self) -> &QuotaLimits {
        &self.quota
    }
    pub fn nats(&self) -> Option<&NatsConfig> {
        self.nats.as_ref()
    }
    pub fn seed(&self) -> &wire::Seed {
        &self.seed
    }
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl TryFrom<wire::Config> for FloatingConfig {
    type Error = anyhow::Error;

    fn try_from(cfg: wire::Config) -> Result<Self> {
        if cfg.host.trim().is_empty() {
            bail!("`host` must not be empty");
        }
        if cfg.default_floating_pool.trim().is_empty() {
            bail!("`default_floating_pool` must not be empty");
        }
        if let Some(nats) = &cfg.nats
            && nats.servers.is_empty()
        {
            bail!("`nats.servers` must list at least one server");
        }
        validate_seed(&cfg.seed)?;

        Ok(Self {
            host: cfg.host,
            manager: ManagerOpts {
                default_floating_pool: cfg.default_floating_pool,
                auto_assign_floating_ip: cfg.auto_assign_floating_ip,
                public_interface: cfg.public_interface,
                network_topic: cfg.network_topic,
                service_down_time: Duration::from_secs(cfg.service_down_time.get() as u64),
            },
            report_interval: Duration::from_secs(cfg.report_interval.get() as u64),
            dns: cfg.dns,
            quota: QuotaLimits {
                default_floating_ips: cfg.quota.floating_ips,
                projects: cfg.quota.projects,
            },
            nats: cfg.nats.map(NatsConfig::from),
            seed: cfg.seed,
            path: None,
        })
    }
}

fn validate_seed(seed: &wire::Seed) -> Result<()> {
    let mut pools = HashSet::new();
    for pool in &seed.pools {
        if !pools.insert(&pool.name) {
            bail!("pool {} is defined more than once", pool.name);
        }
    }
    let mut networks = HashSet::new();
    let mut fixed = HashSet::new();
    for net in &seed.networks {
        if !networks.insert(net.id) {
            bail!("network id {} is defined more than once", net.id);
        }
        for ip in &net.fixed_ips {
            if !fixed.insert(ip.address) {
                bail!("fixed ip {} is defined more than once", ip.address);
            }
        }
    }
    let instances = seed.instances.iter().map(|i| i.uuid).collect::<HashSet<_>>();
    for net in &seed.networks {
        for ip in &net.fixed_ips {
            if let Some(uuid) = ip.instance
                && !instances.contains(&uuid)
            {
                bail!("fixed ip {} references unknown instance {uuid}", ip.address);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    static EXAMPLE: &str = include_str!("../../../example.yaml");

    #[test]
    fn parses_example() {
        let cfg = FloatingConfig::parse_str(EXAMPLE).unwrap();
        assert_eq!(cfg.host(), "net-1");
        assert_eq!(cfg.manager().default_floating_pool, "nova");
        assert_eq!(cfg.manager().service_down_time, Duration::from_secs(60));
        assert_eq!(cfg.report_interval(), Duration::from_secs(10));
        assert_eq!(cfg.dns().floating, DnsDriverKind::Memory);
        assert_eq!(cfg.quota().limit_for("demo"), Some(2));
        assert_eq!(cfg.quota().limit_for("other"), Some(10));

        let nats = cfg.nats().unwrap();
        assert_eq!(nats.subject_prefix, "fipd");
        assert_eq!(nats.request_timeout, Some(Duration::from_secs(2)));
        assert_eq!(nats.store_bucket, "fipd-store");
        assert_eq!(cfg.seed().networks.len(), 2);
    }

    #[test]
    fn json_is_accepted() {
        let cfg = FloatingConfig::parse_str(r#"{"host": "compute-1"}"#).unwrap();
        assert_eq!(cfg.host(), "compute-1");
        assert_eq!(cfg.manager(), &ManagerOpts::default());
        assert_eq!(cfg.quota().limit_for("anyone"), None);
    }

    #[test]
    fn rejects_empty_host() {
        assert!(FloatingConfig::parse_str("host: ''").is_err());
    }

    #[test]
    fn rejects_duplicate_fixed_ips() {
        let yaml = r#"
host: net-1
seed:
  networks:
    - id: 1
      label: a
      fixed_ips:
        - address: 10.0.0.5
    - id: 2
      label: b
      fixed_ips:
        - address: 10.0.0.5
"#;
        let err = FloatingConfig::parse_str(yaml).unwrap_err();
        assert!(err.to_string().contains("10.0.0.5"));
    }

    #[test]
    fn rejects_dangling_instance() {
        let yaml = r#"
host: net-1
seed:
  networks:
    - id: 1
      label: a
      fixed_ips:
        - address: 10.0.0.5
          instance: 5b8f0d6e-3c2a-4f7e-9a1d-2f6c1e0b7a11
"#;
        assert!(FloatingConfig::parse_str(yaml).is_err());
    }

    #[test]
    fn missing_file_names_path() {
        let err = FloatingConfig::parse("/definitely/not/here.yaml").unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.yaml"));
    }
}
