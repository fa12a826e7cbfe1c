//! on-disk representation of the fipd config file

use std::{collections::HashMap, net::IpAddr, num::NonZeroU32, path::PathBuf};

use anyhow::{Context, Result};
use ipnet::IpNet;
use serde::{Deserialize, Deserializer, Serialize, de};
use uuid::Uuid;

/// default prefix for every NATS subject fipd uses
pub const DEFAULT_SUBJECT_PREFIX: &str = "fipd";
pub const DEFAULT_STORE_BUCKET: &str = "fipd-store";

/// top-level config type
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    pub host: String,
    #[serde(default = "default_floating_pool")]
    pub default_floating_pool: String,
    #[serde(default = "default_auto_assign")]
    pub auto_assign_floating_ip: bool,
    #[serde(default = "default_public_interface")]
    pub public_interface: Option<String>,
    #[serde(default = "default_network_topic")]
    pub network_topic: String,
    #[serde(
        default = "default_service_down_time",
        deserialize_with = "deserialize_duration"
    )]
    pub service_down_time: NonZeroU32,
    #[serde(
        default = "default_report_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub report_interval: NonZeroU32,
    #[serde(default)]
    pub dns: Dns,
    #[serde(default)]
    pub quota: Quota,
    pub nats: Option<Nats>,
    #[serde(default)]
    pub seed: Seed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Dns {
    #[serde(default)]
    pub floating: DnsDriverKind,
    #[serde(default)]
    pub instance: DnsDriverKind,
}

/// which DNS driver backs a domain scope
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsDriverKind {
    #[default]
    Noop,
    Memory,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Quota {
    /// per-project limit on floating ips, absent means unlimited
    pub floating_ips: Option<u32>,
    #[serde(default)]
    pub projects: HashMap<String, u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Nats {
    pub servers: Vec<String>,
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
    #[serde(default)]
    pub security_mode: NatsSecurityMode,
    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    pub nkey_seed_path: Option<PathBuf>,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
    pub tls_ca_path: Option<PathBuf>,
    pub creds_file_path: Option<PathBuf>,
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    pub connect_timeout: Option<NonZeroU32>,
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    pub request_timeout: Option<NonZeroU32>,
    #[serde(default = "default_connect_retry_max")]
    pub connect_retry_max: u32,
    /// JetStream KV bucket holding the shared store
    #[serde(default = "default_store_bucket")]
    pub store_bucket: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NatsSecurityMode {
    #[default]
    None,
    UserPassword,
    Token,
    Nkey,
    Tls,
    CredsFile,
}

/// records loaded into the in-memory store on start
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Seed {
    #[serde(default)]
    pub pools: Vec<Pool>,
    #[serde(default)]
    pub networks: Vec<Network>,
    #[serde(default)]
    pub instances: Vec<Instance>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Pool {
    pub name: String,
    pub cidr: IpNet,
    pub interface: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Network {
    pub id: u64,
    pub label: String,
    #[serde(default)]
    pub multi_host: bool,
    pub host: Option<String>,
    #[serde(default)]
    pub fixed_ips: Vec<FixedIp>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FixedIp {
    pub address: IpAddr,
    pub instance: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Instance {
    pub uuid: Uuid,
    pub host: Option<String>,
    pub project_id: String,
}

pub fn default_floating_pool() -> String {
    "nova".to_owned()
}

pub const fn default_auto_assign() -> bool {
    false
}

pub fn default_public_interface() -> Option<String> {
    Some("eth0".to_owned())
}

pub fn default_network_topic() -> String {
    "network".to_owned()
}

pub const fn default_service_down_time() -> NonZeroU32 {
    NonZeroU32::new(60).unwrap()
}

pub const fn default_report_interval() -> NonZeroU32 {
    NonZeroU32::new(10).unwrap()
}

pub fn default_subject_prefix() -> String {
    DEFAULT_SUBJECT_PREFIX.to_owned()
}

pub const fn default_connect_retry_max() -> u32 {
    5
}

pub fn default_store_bucket() -> String {
    DEFAULT_STORE_BUCKET.to_owned()
}

/// Parse a duration string with optional time units
/// Accepts: "3600", "3600s", "60m", "24h"
/// If no unit is specified, assumes seconds
fn parse_duration(s: &str) -> Result<u32> {
    let s = s.trim();
    if s.is_empty() {
        anyhow::bail!("empty duration string");
    }

    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (num, unit) = s.split_at(end);
    let num = num.parse::<u32>().context("invalid number")?;

    let num_seconds = match unit.trim() {
        "" | "s" => 1,
        "m" => 60,
        "h" => 3600,
        other => anyhow::bail!("unknown time unit '{other}', only 'h', 'm', or 's' are supported"),
    };

    num.checked_mul(num_seconds)
        .context("duration value overflow")
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireDuration {
    Seconds(u64),
    String(String),
}

impl WireDuration {
    fn into_nonzero<E: de::Error>(self) -> Result<NonZeroU32, E> {
        let secs = match self {
            WireDuration::Seconds(val) => {
                u32::try_from(val).map_err(|_| E::custom("duration value too large"))?
            }
            WireDuration::String(s) => parse_duration(&s).map_err(E::custom)?,
        };
        NonZeroU32::new(secs).ok_or_else(|| E::custom("duration cannot be zero"))
    }
}

fn deserialize_duration<'de, D>(de: D) -> Result<NonZeroU32, D::Error>
where
    D: Deserializer<'de>,
{
    WireDuration::deserialize(de)?.into_nonzero()
}

fn deserialize_optional_duration<'de, D>(de: D) -> Result<Option<NonZeroU32>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<WireDuration>::deserialize(de)?
        .map(WireDuration::into_nonzero)
        .transpose()
}
