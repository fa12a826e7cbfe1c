use std::{net::IpAddr, sync::Arc};

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per floating address mutexes, created on first use and kept for the life
/// of the process. Serializes driver work on one address within this host.
#[derive(Debug, Clone, Default)]
pub struct AddressLocks {
    inner: Arc<DashMap<IpAddr, Arc<Mutex<()>>>>,
}

impl AddressLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, address: IpAddr) -> OwnedMutexGuard<()> {
        let lock = self.inner.entry(address).or_default().clone();
        lock.lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
