//! # quota
//!
//! `quota` defines the `QuotaDriver` trait, the reserve/commit/rollback
//! protocol the floating ip engine uses to account `floating_ips` per project.
//!
//! Callers should not talk to a driver directly. [`Reservation`] wraps a
//! reserved change and makes sure it is settled exactly once: an unsettled
//! reservation is rolled back when it is dropped, so an early return, a panic
//! or a cancelled task can not leak quota.
//!
//! [`MemoryQuota`] enforces [`config::QuotaLimits`] in process.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

mod memory;

pub use memory::MemoryQuota;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuotaError {
    #[error("project {project_id} is over its floating ip quota ({in_use}/{limit} in use)")]
    OverQuota {
        project_id: String,
        limit: u32,
        in_use: i64,
    },
    #[error("unknown quota reservation {0}")]
    UnknownReservation(Uuid),
    #[error("quota backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait QuotaDriver: Send + Sync + fmt::Debug + 'static {
    /// Reserve a change of `floating_ips` for `project_id`. Positive changes
    /// are checked against the project's limit, negative ones always succeed.
    async fn reserve(&self, project_id: &str, floating_ips: i64) -> Result<Uuid, QuotaError>;
    /// apply a reserved change to the project's usage
    async fn commit(&self, reservation: Uuid) -> Result<(), QuotaError>;
    /// discard a reserved change
    async fn rollback(&self, reservation: Uuid) -> Result<(), QuotaError>;
}

/// A reserved quota change that has not been committed or rolled back yet.
pub struct Reservation {
    id: Uuid,
    driver: Arc<dyn QuotaDriver>,
    settled: bool,
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("id", &self.id)
            .field("settled", &self.settled)
            .finish()
    }
}

impl Reservation {
    pub async fn acquire(
        driver: Arc<dyn QuotaDriver>,
        project_id: &str,
        floating_ips: i64,
    ) -> Result<Self, QuotaError> {
        let id = driver.reserve(project_id, floating_ips).await?;
        debug!(%id, project_id, floating_ips, "quota reserved");
        Ok(Self {
            id,
            driver,
            settled: false,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn commit(mut self) -> Result<(), QuotaError> {
        self.settled = true;
        self.driver.commit(self.id).await
    }

    pub async fn rollback(mut self) -> Result<(), QuotaError> {
        self.settled = true;
        self.driver.rollback(self.id).await
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let driver = self.driver.clone();
                handle.spawn(async move {
                    if let Err(err) = driver.rollback(id).await {
                        warn!(?err, %id, "failed to roll back dropped quota reservation");
                    } else {
                        debug!(%id, "rolled back dropped quota reservation");
                    }
                });
            }
            Err(_) => {
                warn!(%id, "quota reservation dropped outside of a runtime, not rolled back");
            }
        }
    }
}
