use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{LOCKS_PLACED_TOTAL, LOCKS_REAPED_TOTAL};

use super::booking::check_staff_placement;
use super::conflict::{check_no_conflict, now_ms, validate_span};
use super::{Engine, EngineError};

/// Input to [`Engine::create_lock`].
#[derive(Debug, Clone)]
pub struct NewLock {
    pub tenant_id: Ulid,
    pub branch_id: Ulid,
    pub staff_id: Ulid,
    pub customer_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    /// Hold duration; `None` uses the configured default.
    pub ttl_ms: Option<Ms>,
}

impl Engine {
    /// Place a short-lived hold on a staff member's time. A live hold blocks
    /// other bookings exactly like an appointment does.
    pub async fn create_lock(&self, input: NewLock) -> Result<AppointmentLock, EngineError> {
        if input.tenant_id.is_nil() || input.branch_id.is_nil() || input.customer_id.is_nil() {
            return Err(EngineError::InvalidInput("tenant, branch and customer are required"));
        }
        let span = Span {
            start: input.start,
            end: input.end,
        };
        validate_span(&span)?;
        let ttl = input.ttl_ms.unwrap_or(self.config.lock_ttl_ms);
        if ttl <= 0 {
            return Err(EngineError::InvalidInput("lock ttl must be positive"));
        }
        if ttl > MAX_LOCK_TTL_MS {
            return Err(EngineError::LimitExceeded("lock ttl too long"));
        }
        if !self
            .collaborators
            .customers
            .customer_exists(input.customer_id)
            .await?
        {
            return Err(EngineError::not_found("customer", input.customer_id));
        }

        let info = self.resolve_staff(input.staff_id).await?;
        check_staff_placement(&info, input.tenant_id, input.branch_id)?;
        let entry = self.attach_staff(&info).await?;
        let mut ts = entry.timeline.write_owned().await;
        if ts.intervals.len() >= MAX_INTERVALS_PER_STAFF {
            return Err(EngineError::LimitExceeded("too many intervals on staff member"));
        }
        self.check_schedule(&ts, &span).await?;
        let now = now_ms();
        check_no_conflict(&ts, &span, now, None)?;

        let lock = AppointmentLock {
            id: Ulid::new(),
            tenant_id: input.tenant_id,
            branch_id: input.branch_id,
            staff_id: input.staff_id,
            customer_id: input.customer_id,
            span,
            expires_at: now + ttl,
        };
        let event = Event::LockPlaced { lock: lock.clone() };
        self.commit(Some(&mut *ts), lock.branch_id, vec![event]).await?;
        metrics::counter!(LOCKS_PLACED_TOTAL).increment(1);
        Ok(lock)
    }

    /// Drop a hold, expired or not.
    pub async fn release_lock(&self, id: Ulid) -> Result<AppointmentLock, EngineError> {
        let staff_id = self
            .locks
            .get(&id)
            .map(|l| l.staff_id)
            .ok_or(EngineError::not_found("lock", id))?;
        let entry = self
            .staff_entry(&staff_id)
            .ok_or(EngineError::not_found("staff", staff_id))?;
        let mut ts = entry.timeline.write_owned().await;
        // Re-check under the guard: a booking may have consumed it meanwhile.
        let lock = self
            .locks
            .get(&id)
            .map(|l| l.value().clone())
            .ok_or(EngineError::not_found("lock", id))?;
        let event = Event::LockReleased { id, staff_id };
        self.commit(Some(&mut *ts), lock.branch_id, vec![event]).await?;
        Ok(lock)
    }

    /// A live hold. Expired holds read as absent even before the reaper runs.
    pub fn get_lock(&self, id: Ulid) -> Option<AppointmentLock> {
        let now = now_ms();
        self.locks
            .get(&id)
            .map(|l| l.value().clone())
            .filter(|l| !l.is_expired(now))
    }

    /// Live holds on one staff member, by start.
    pub fn list_locks(&self, staff_id: Ulid) -> Vec<AppointmentLock> {
        let now = now_ms();
        let mut locks: Vec<AppointmentLock> = self
            .locks
            .iter()
            .filter(|l| l.staff_id == staff_id && !l.is_expired(now))
            .map(|l| l.value().clone())
            .collect();
        locks.sort_by_key(|l| (l.span.start, l.id));
        locks
    }

    /// `(lock_id, staff_id)` of every hold that expired at or before `now`.
    pub fn collect_expired_locks(&self, now: Ms) -> Vec<(Ulid, Ulid)> {
        self.locks
            .iter()
            .filter(|l| l.is_expired(now))
            .map(|l| (l.id, l.staff_id))
            .collect()
    }

    /// Release every hold expired at `now`; returns how many were released.
    pub async fn reap_expired_locks(&self, now: Ms) -> usize {
        let mut reaped = 0;
        for (lock_id, staff_id) in self.collect_expired_locks(now) {
            match self.release_lock(lock_id).await {
                Ok(_) => reaped += 1,
                // Consumed or released concurrently.
                Err(EngineError::NotFound { .. }) => {}
                Err(e) => {
                    tracing::warn!(lock = %lock_id, staff = %staff_id, "failed to reap lock: {e}");
                }
            }
        }
        if reaped > 0 {
            metrics::counter!(LOCKS_REAPED_TOTAL).increment(reaped as u64);
        }
        reaped
    }
}
