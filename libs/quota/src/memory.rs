use std::collections::HashMap;

use async_trait::async_trait;
use config::QuotaLimits;
use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{QuotaDriver, QuotaError};

/// in process quota accounting against configured limits
#[derive(Debug, Default)]
pub struct MemoryQuota {
    limits: QuotaLimits,
    inner: Mutex<Usage>,
}

#[derive(Debug, Default)]
struct Usage {
    in_use: HashMap<String, i64>,
    pending: HashMap<Uuid, (String, i64)>,
}

impl Usage {
    fn reserved(&self, project_id: &str) -> i64 {
        self.pending
            .values()
            .filter(|(project, delta)| project == project_id && *delta > 0)
            .map(|(_, delta)| delta)
            .sum()
    }
}

impl MemoryQuota {
    pub fn new(limits: QuotaLimits) -> Self {
        Self {
            limits,
            inner: Mutex::new(Usage::default()),
        }
    }

    /// committed usage of `project_id`
    pub fn usage(&self, project_id: &str) -> i64 {
        self.inner
            .lock()
            .in_use
            .get(project_id)
            .copied()
            .unwrap_or(0)
    }

    /// positive changes reserved but not settled for `project_id`
    pub fn reserved(&self, project_id: &str) -> i64 {
        self.inner.lock().reserved(project_id)
    }
}

#[async_trait]
impl QuotaDriver for MemoryQuota {
    async fn reserve(&self, project_id: &str, floating_ips: i64) -> Result<Uuid, QuotaError> {
        let mut guard = self.inner.lock();
        if floating_ips > 0
            && let Some(limit) = self.limits.limit_for(project_id)
        {
            let in_use = guard.in_use.get(project_id).copied().unwrap_or(0)
                + guard.reserved(project_id);
            if in_use + floating_ips > i64::from(limit) {
                info!(project_id, limit, in_use, "floating ip quota exceeded");
                return Err(QuotaError::OverQuota {
                    project_id: project_id.to_owned(),
                    limit,
                    in_use,
                });
            }
        }
        let id = Uuid::new_v4();
        guard
            .pending
            .insert(id, (project_id.to_owned(), floating_ips));
        Ok(id)
    }

    async fn commit(&self, reservation: Uuid) -> Result<(), QuotaError> {
        let mut guard = self.inner.lock();
        let (project_id, delta) = guard
            .pending
            .remove(&reservation)
            .ok_or(QuotaError::UnknownReservation(reservation))?;
        let in_use = guard.in_use.entry(project_id).or_default();
        *in_use = (*in_use + delta).max(0);
        debug!(%reservation, in_use = *in_use, "quota committed");
        Ok(())
    }

    async fn rollback(&self, reservation: Uuid) -> Result<(), QuotaError> {
        self.inner
            .lock()
            .pending
            .remove(&reservation)
            .map(|_| ())
            .ok_or(QuotaError::UnknownReservation(reservation))
    }
}
