use ulid::Ulid;

use crate::limits::{MAX_VALID_TIMESTAMP_MS, MIN_VALID_TIMESTAMP_MS};
use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    /// An appointment in any status; retired ones read as missing.
    pub fn get_appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        self.appointments
            .get(&id)
            .filter(|a| a.is_active())
            .map(|a| a.value().clone())
            .ok_or(EngineError::not_found("appointment", id))
    }

    /// Appointments of one staff member overlapping `[from, to)`, by start.
    pub fn list_appointments_for_staff(
        &self,
        staff_id: Ulid,
        from: Ms,
        to: Ms,
    ) -> Result<Vec<Appointment>, EngineError> {
        self.list_appointments(from, to, |a| a.staff == StaffAssignment::Staff(staff_id))
    }

    /// Appointments at a branch overlapping `[from, to)`, by start.
    pub fn list_appointments_for_branch(
        &self,
        branch_id: Ulid,
        from: Ms,
        to: Ms,
    ) -> Result<Vec<Appointment>, EngineError> {
        self.list_appointments(from, to, |a| a.branch_id == branch_id)
    }

    fn list_appointments(
        &self,
        from: Ms,
        to: Ms,
        keep: impl Fn(&Appointment) -> bool,
    ) -> Result<Vec<Appointment>, EngineError> {
        let window = Span { start: from, end: to };
        if window.start >= window.end {
            return Err(EngineError::InvalidInput("from must be before to"));
        }
        if window.start < MIN_VALID_TIMESTAMP_MS || window.end > MAX_VALID_TIMESTAMP_MS {
            return Err(EngineError::LimitExceeded("timestamp out of range"));
        }
        let mut found: Vec<Appointment> = self
            .appointments
            .iter()
            .filter(|a| a.is_active() && a.span.overlaps(&window) && keep(a.value()))
            .map(|a| a.value().clone())
            .collect();
        found.sort_by_key(|a| (a.span.start, a.id));
        Ok(found)
    }
}
