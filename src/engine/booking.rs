use tokio::sync::{MutexGuard, OwnedRwLockWriteGuard};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{BOOKINGS_TOTAL, CONFLICTS_TOTAL, STATUS_TRANSITIONS_TOTAL};
use crate::registry::{ServiceInfo, StaffInfo};
use crate::state::StaffTimeline;

use super::conflict::{check_no_conflict, now_ms, validate_span};
use super::{Engine, EngineError, ErrorKind};

/// Input to [`Engine::create_appointment`].
#[derive(Debug, Clone)]
pub struct NewAppointment {
    pub tenant_id: Ulid,
    pub branch_id: Ulid,
    pub service_id: Ulid,
    pub customer_id: Ulid,
    pub staff: StaffAssignment,
    pub start: Ms,
    pub notes: Option<String>,
    /// Reservation to convert. Must be held by the same staff member and customer.
    pub lock_id: Option<Ulid>,
    pub actor: Actor,
}

/// Exclusive access to whatever an appointment occupies.
pub(super) enum WriteScope<'a> {
    Staff(OwnedRwLockWriteGuard<StaffTimeline>),
    Unassigned(MutexGuard<'a, ()>),
}

impl WriteScope<'_> {
    pub(super) fn timeline(&mut self) -> Option<&mut StaffTimeline> {
        match self {
            WriteScope::Staff(guard) => Some(&mut **guard),
            WriteScope::Unassigned(_) => None,
        }
    }
}

fn require(id: Ulid, what: &'static str) -> Result<(), EngineError> {
    if id.is_nil() {
        Err(EngineError::InvalidInput(what))
    } else {
        Ok(())
    }
}

fn check_note(note: Option<&str>) -> Result<(), EngineError> {
    match note {
        Some(n) if n.len() > MAX_NOTE_LEN => Err(EngineError::LimitExceeded("note too long")),
        _ => Ok(()),
    }
}

pub(super) fn check_staff_placement(
    staff: &StaffInfo,
    tenant_id: Ulid,
    branch_id: Ulid,
) -> Result<(), EngineError> {
    if staff.tenant_id != tenant_id {
        return Err(EngineError::AccessDenied {
            entity: "staff",
            id: staff.id,
        });
    }
    if staff.branch_id != branch_id {
        return Err(EngineError::StaffBranchMismatch {
            staff_id: staff.id,
            branch_id,
        });
    }
    Ok(())
}

fn record_outcome<T>(op: &'static str, result: &Result<T, EngineError>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) => e.kind().as_str(),
    };
    metrics::counter!(BOOKINGS_TOTAL, "op" => op, "outcome" => outcome).increment(1);
    if let Err(e) = result {
        tracing::debug!(op, "booking rejected: {e}");
    }
    if matches!(result, Err(e) if e.kind() == ErrorKind::Conflict) {
        metrics::counter!(CONFLICTS_TOTAL, "op" => op).increment(1);
    }
}

pub(super) fn status_entry(
    appointment_id: Ulid,
    old_status: Option<AppointmentStatus>,
    new_status: AppointmentStatus,
    actor: Actor,
    note: Option<String>,
    at: Ms,
) -> StatusLogEntry {
    StatusLogEntry {
        id: Ulid::new(),
        appointment_id,
        old_status,
        new_status,
        actor,
        note,
        at,
    }
}

fn status_logged(
    appointment_id: Ulid,
    old_status: Option<AppointmentStatus>,
    new_status: AppointmentStatus,
    actor: Actor,
    note: Option<String>,
    at: Ms,
) -> Event {
    Event::StatusLogged {
        entry: status_entry(appointment_id, old_status, new_status, actor, note, at),
    }
}

/// Workload adjustment for an appointment occupying `span`, scaled by `sign`.
fn workload_delta(staff: StaffAssignment, span: &Span, sign: i64) -> Option<Event> {
    let staff_id = staff.staff_id()?;
    let date = date_of(span.start)?;
    Some(Event::WorkloadAdjusted {
        staff_id,
        date,
        appointments_delta: sign,
        minutes_delta: sign * (span.duration_ms() / MINUTE_MS),
    })
}

/// Move an appointment's workload contribution from `old` to `new`.
fn workload_shift(staff: StaffAssignment, old: &Span, new: &Span) -> Vec<Event> {
    let (Some(old_date), Some(new_date)) = (date_of(old.start), date_of(new.start)) else {
        return Vec::new();
    };
    let Some(staff_id) = staff.staff_id() else {
        return Vec::new();
    };
    if old_date != new_date {
        return [workload_delta(staff, old, -1), workload_delta(staff, new, 1)]
            .into_iter()
            .flatten()
            .collect();
    }
    let minutes_delta = (new.duration_ms() - old.duration_ms()) / MINUTE_MS;
    if minutes_delta == 0 {
        return Vec::new();
    }
    vec![Event::WorkloadAdjusted {
        staff_id,
        date: new_date,
        appointments_delta: 0,
        minutes_delta,
    }]
}

impl Engine {
    /// Active service of `tenant_id`, with a usable duration.
    async fn resolve_service(
        &self,
        tenant_id: Ulid,
        service_id: Ulid,
    ) -> Result<ServiceInfo, EngineError> {
        let service = self
            .collaborators
            .services
            .service(service_id)
            .await?
            .filter(|s| s.lifecycle == Lifecycle::Active && s.tenant_id == tenant_id)
            .ok_or(EngineError::ServiceNotFound(service_id))?;
        if service.duration_minutes <= 0 {
            return Err(EngineError::InvalidDuration(service.duration_minutes));
        }
        if service.duration_minutes > MAX_SERVICE_MINUTES {
            return Err(EngineError::LimitExceeded("service too long"));
        }
        Ok(service)
    }

    /// A live lock the caller may convert into an appointment occupying `span`.
    fn check_lock_claim(
        &self,
        lock_id: Ulid,
        staff_id: Ulid,
        customer_id: Ulid,
        span: &Span,
        now: Ms,
    ) -> Result<(), EngineError> {
        let lock = self
            .locks
            .get(&lock_id)
            .map(|l| l.value().clone())
            .filter(|l| !l.is_expired(now))
            .ok_or(EngineError::not_found("lock", lock_id))?;
        if lock.staff_id != staff_id {
            return Err(EngineError::InvalidInput("lock is held on another staff member"));
        }
        if lock.customer_id != customer_id {
            return Err(EngineError::AccessDenied {
                entity: "lock",
                id: lock_id,
            });
        }
        if !lock.span.contains_span(span) {
            return Err(EngineError::InvalidInput(
                "appointment does not fit inside the held slot",
            ));
        }
        Ok(())
    }

    /// Take the write scope of an active appointment and re-read it under that scope.
    pub(super) async fn lock_appointment(
        &self,
        id: Ulid,
    ) -> Result<(Appointment, WriteScope<'_>), EngineError> {
        let staff = self
            .appointments
            .get(&id)
            .filter(|a| a.is_active())
            .map(|a| a.staff)
            .ok_or(EngineError::not_found("appointment", id))?;
        let scope = match staff {
            StaffAssignment::Staff(staff_id) => {
                let entry = self
                    .staff_entry(&staff_id)
                    .ok_or(EngineError::not_found("staff", staff_id))?;
                WriteScope::Staff(entry.timeline.write_owned().await)
            }
            StaffAssignment::Unassigned => WriteScope::Unassigned(self.unassigned_gate.lock().await),
        };
        let current = self
            .appointments
            .get(&id)
            .filter(|a| a.is_active())
            .map(|a| a.value().clone())
            .ok_or(EngineError::not_found("appointment", id))?;
        Ok((current, scope))
    }

    fn appointment_snapshot(&self, id: Ulid) -> Result<Appointment, EngineError> {
        self.appointments
            .get(&id)
            .map(|a| a.value().clone())
            .ok_or(EngineError::not_found("appointment", id))
    }

    /// Book an appointment. Duration comes from the service catalog; the
    /// overlap check and the write happen under the staff member's write lock.
    pub async fn create_appointment(
        &self,
        input: NewAppointment,
    ) -> Result<Appointment, EngineError> {
        let result = self.create_appointment_inner(input).await;
        record_outcome("create", &result);
        result
    }

    async fn create_appointment_inner(
        &self,
        input: NewAppointment,
    ) -> Result<Appointment, EngineError> {
        require(input.tenant_id, "tenant_id is required")?;
        require(input.branch_id, "branch_id is required")?;
        require(input.service_id, "service_id is required")?;
        require(input.customer_id, "customer_id is required")?;
        check_note(input.notes.as_deref())?;

        let service = self.resolve_service(input.tenant_id, input.service_id).await?;
        let span = Span {
            start: input.start,
            end: input.start.saturating_add(service.duration_minutes * MINUTE_MS),
        };
        validate_span(&span)?;
        if !self
            .collaborators
            .customers
            .customer_exists(input.customer_id)
            .await?
        {
            return Err(EngineError::not_found("customer", input.customer_id));
        }

        let now = now_ms();
        let appointment = Appointment {
            id: Ulid::new(),
            tenant_id: input.tenant_id,
            branch_id: input.branch_id,
            service_id: input.service_id,
            staff: input.staff,
            customer_id: input.customer_id,
            span,
            status: AppointmentStatus::Pending,
            notes: input.notes,
            lifecycle: Lifecycle::Active,
            created_at: now,
            updated_at: now,
        };
        let logged = status_logged(
            appointment.id,
            None,
            AppointmentStatus::Pending,
            input.actor,
            None,
            now,
        );

        match input.staff {
            StaffAssignment::Unassigned => {
                if input.lock_id.is_some() {
                    return Err(EngineError::InvalidInput(
                        "a lock can only be converted with an assigned staff member",
                    ));
                }
                let _gate = self.unassigned_gate.lock().await;
                let events = vec![
                    Event::AppointmentCreated {
                        appointment: appointment.clone(),
                        consumed_lock: None,
                    },
                    logged,
                ];
                self.commit(None, appointment.branch_id, events).await?;
            }
            StaffAssignment::Staff(staff_id) => {
                let info = self.resolve_staff(staff_id).await?;
                check_staff_placement(&info, input.tenant_id, input.branch_id)?;
                let entry = self.attach_staff(&info).await?;
                let mut ts = entry.timeline.write_owned().await;
                if ts.intervals.len() >= MAX_INTERVALS_PER_STAFF {
                    return Err(EngineError::LimitExceeded("too many intervals on staff member"));
                }
                self.check_schedule(&ts, &span).await?;
                // Sampled under the guard: locks may expire while we queue for it.
                let now = now_ms();
                if let Some(lock_id) = input.lock_id {
                    self.check_lock_claim(lock_id, staff_id, input.customer_id, &span, now)?;
                }
                check_no_conflict(&ts, &span, now, input.lock_id)?;

                let mut events = vec![
                    Event::AppointmentCreated {
                        appointment: appointment.clone(),
                        consumed_lock: input.lock_id,
                    },
                    logged,
                ];
                events.extend(workload_delta(input.staff, &span, 1));
                self.commit(Some(&mut *ts), appointment.branch_id, events).await?;
            }
        }

        tracing::info!(
            appointment = %appointment.id,
            staff = ?appointment.staff,
            start = appointment.span.start,
            "appointment created"
        );
        Ok(appointment)
    }

    /// Move an appointment to `new_start`, keeping its staff member.
    pub async fn reschedule_appointment(
        &self,
        id: Ulid,
        new_start: Ms,
        actor: Actor,
    ) -> Result<Appointment, EngineError> {
        let result = self.reschedule_inner(id, new_start, actor).await;
        record_outcome("reschedule", &result);
        result
    }

    async fn reschedule_inner(
        &self,
        id: Ulid,
        new_start: Ms,
        actor: Actor,
    ) -> Result<Appointment, EngineError> {
        let (current, mut scope) = self.lock_appointment(id).await?;
        if current.status.is_terminal() {
            return Err(EngineError::CannotReschedule(current.status));
        }

        // The catalog's current duration wins; a retired service keeps the old length.
        let duration_ms = match self.collaborators.services.service(current.service_id).await? {
            Some(s) if s.lifecycle == Lifecycle::Active && s.duration_minutes > 0 => {
                s.duration_minutes.min(MAX_SERVICE_MINUTES) * MINUTE_MS
            }
            _ => current.span.duration_ms(),
        };
        let span = Span {
            start: new_start,
            end: new_start.saturating_add(duration_ms),
        };
        validate_span(&span)?;

        let now = now_ms();
        if let Some(ts) = scope.timeline() {
            self.check_schedule(ts, &span).await?;
            check_no_conflict(ts, &span, now, Some(id))?;
        }

        let mut events = vec![
            Event::AppointmentRescheduled {
                id,
                staff: current.staff,
                span,
                at: now,
            },
            status_logged(
                id,
                Some(current.status),
                current.status,
                actor,
                Some("rescheduled".into()),
                now,
            ),
        ];
        events.extend(workload_shift(current.staff, &current.span, &span));
        self.commit(scope.timeline(), current.branch_id, events).await?;
        tracing::info!(appointment = %id, start = span.start, "appointment rescheduled");
        self.appointment_snapshot(id)
    }

    /// Cancel a non-terminal appointment, releasing its time.
    pub async fn cancel_appointment(
        &self,
        id: Ulid,
        actor: Actor,
        note: Option<String>,
    ) -> Result<Appointment, EngineError> {
        let result = self.cancel_inner(id, actor, note).await;
        record_outcome("cancel", &result);
        result
    }

    async fn cancel_inner(
        &self,
        id: Ulid,
        actor: Actor,
        note: Option<String>,
    ) -> Result<Appointment, EngineError> {
        check_note(note.as_deref())?;
        let (current, scope) = self.lock_appointment(id).await?;
        if current.status.is_terminal() {
            return Err(EngineError::CannotCancel(current.status));
        }
        self.transition(current, scope, AppointmentStatus::Cancelled, actor, note)
            .await
    }

    /// Move an appointment along the status machine
    /// (`Pending → Confirmed → Completed`, cancellation from either live state).
    pub async fn update_status(
        &self,
        id: Ulid,
        next: AppointmentStatus,
        actor: Actor,
        note: Option<String>,
    ) -> Result<Appointment, EngineError> {
        check_note(note.as_deref())?;
        let (current, scope) = self.lock_appointment(id).await?;
        if !current.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                from: current.status,
                to: next,
            });
        }
        self.transition(current, scope, next, actor, note).await
    }

    async fn transition(
        &self,
        current: Appointment,
        mut scope: WriteScope<'_>,
        next: AppointmentStatus,
        actor: Actor,
        note: Option<String>,
    ) -> Result<Appointment, EngineError> {
        let now = now_ms();
        let mut events = vec![
            Event::AppointmentStatusChanged {
                id: current.id,
                staff: current.staff,
                status: next,
                at: now,
            },
            status_logged(current.id, Some(current.status), next, actor, note, now),
        ];
        if next == AppointmentStatus::Cancelled {
            events.extend(workload_delta(current.staff, &current.span, -1));
        }
        self.commit(scope.timeline(), current.branch_id, events).await?;
        metrics::counter!(STATUS_TRANSITIONS_TOTAL, "to" => next.as_str()).increment(1);
        tracing::info!(appointment = %current.id, from = %current.status, to = %next, "status changed");
        self.appointment_snapshot(current.id)
    }

    /// Retire an appointment. Its time is released and it disappears from
    /// reads; the ledger keeps its history.
    pub async fn delete_appointment(&self, id: Ulid) -> Result<(), EngineError> {
        let (current, mut scope) = self.lock_appointment(id).await?;
        let mut events = vec![Event::AppointmentRetired {
            id,
            staff: current.staff,
            at: now_ms(),
        }];
        if current.status != AppointmentStatus::Cancelled {
            events.extend(workload_delta(current.staff, &current.span, -1));
        }
        self.commit(scope.timeline(), current.branch_id, events).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(start_min: i64, len_min: i64) -> Span {
        // 2024-03-04T00:00Z
        let base = 1_709_510_400_000;
        Span::new(base + start_min * MINUTE_MS, base + (start_min + len_min) * MINUTE_MS)
    }

    #[test]
    fn shift_within_a_day_moves_minutes_only() {
        let staff = StaffAssignment::Staff(Ulid::new());
        assert!(workload_shift(staff, &span(600, 30), &span(700, 30)).is_empty());
        let events = workload_shift(staff, &span(600, 30), &span(700, 45));
        assert!(matches!(
            events.as_slice(),
            [Event::WorkloadAdjusted { appointments_delta: 0, minutes_delta: 15, .. }]
        ));
    }

    #[test]
    fn shift_across_days_moves_both_counters() {
        let staff = StaffAssignment::Staff(Ulid::new());
        let events = workload_shift(staff, &span(600, 30), &span(600 + 24 * 60, 30));
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0],
            Event::WorkloadAdjusted { appointments_delta: -1, minutes_delta: -30, .. }
        ));
        assert!(matches!(
            events[1],
            Event::WorkloadAdjusted { appointments_delta: 1, minutes_delta: 30, .. }
        ));
    }

    #[test]
    fn unassigned_has_no_workload() {
        assert!(workload_delta(StaffAssignment::Unassigned, &span(0, 30), 1).is_none());
        assert!(workload_shift(StaffAssignment::Unassigned, &span(0, 30), &span(60, 30)).is_empty());
    }

    #[test]
    fn placement_checks_tenant_before_branch() {
        let info = StaffInfo {
            id: Ulid::new(),
            branch_id: Ulid::new(),
            tenant_id: Ulid::new(),
            lifecycle: Lifecycle::Active,
        };
        assert!(matches!(
            check_staff_placement(&info, Ulid::new(), info.branch_id),
            Err(EngineError::AccessDenied { .. })
        ));
        assert!(matches!(
            check_staff_placement(&info, info.tenant_id, Ulid::new()),
            Err(EngineError::StaffBranchMismatch { .. })
        ));
        assert!(check_staff_placement(&info, info.tenant_id, info.branch_id).is_ok());
    }
}
