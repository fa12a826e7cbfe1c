//! L3 forwarding rules
use std::{fmt, net::IpAddr};

use async_trait::async_trait;
use fip_store::Network;
use thiserror::Error;
use tracing::info;

/// stderr fragment a driver reports when the interface does not exist
const MISSING_DEVICE: &str = "Cannot find device";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("`{cmd}` exited with {exit_code:?}: {stderr}")]
    ProcessExecution {
        cmd: String,
        exit_code: Option<i32>,
        stderr: String,
    },
    #[error("driver unavailable: {0}")]
    Unavailable(String),
}

impl DriverError {
    /// the command failed because the network device is missing
    pub fn is_missing_device(&self) -> bool {
        matches!(self, DriverError::ProcessExecution { stderr, .. } if stderr.contains(MISSING_DEVICE))
    }
}

#[async_trait]
pub trait L3Driver: Send + Sync + fmt::Debug + 'static {
    /// forward `floating` to `fixed` on `interface`
    async fn add_floating_ip(
        &self,
        floating: IpAddr,
        fixed: IpAddr,
        interface: &str,
        network: &Network,
    ) -> Result<(), DriverError>;
    /// remove the rule installed by [`L3Driver::add_floating_ip`]
    async fn remove_floating_ip(
        &self,
        floating: IpAddr,
        fixed: IpAddr,
        interface: &str,
        network: &Network,
    ) -> Result<(), DriverError>;
    /// drop connection tracking state for `fixed`
    async fn clean_conntrack(&self, fixed: IpAddr) -> Result<(), DriverError>;
}

/// logs every call and succeeds
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopL3Driver;

#[async_trait]
impl L3Driver for NoopL3Driver {
    async fn add_floating_ip(
        &self,
        floating: IpAddr,
        fixed: IpAddr,
        interface: &str,
        network: &Network,
    ) -> Result<(), DriverError> {
        info!(%floating, %fixed, interface, network = network.id, "add floating ip rule");
        Ok(())
    }

    async fn remove_floating_ip(
        &self,
        floating: IpAddr,
        fixed: IpAddr,
        interface: &str,
        network: &Network,
    ) -> Result<(), DriverError> {
        info!(%floating, %fixed, interface, network = network.id, "remove floating ip rule");
        Ok(())
    }

    async fn clean_conntrack(&self, fixed: IpAddr) -> Result<(), DriverError> {
        info!(%fixed, "clean conntrack");
        Ok(())
    }
}
