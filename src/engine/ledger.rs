use ulid::Ulid;

use crate::limits::MAX_NOTE_LEN;
use crate::model::*;

use super::booking::status_entry;
use super::conflict::now_ms;
use super::{Engine, EngineError};

impl Engine {
    /// Append an audit row for an appointment without touching its status.
    /// Serialized with the appointment's other writes so rows stay in order.
    pub async fn log_status_change(
        &self,
        appointment_id: Ulid,
        old_status: Option<AppointmentStatus>,
        new_status: AppointmentStatus,
        actor: Actor,
        note: Option<String>,
    ) -> Result<StatusLogEntry, EngineError> {
        if note.as_ref().is_some_and(|n| n.len() > MAX_NOTE_LEN) {
            return Err(EngineError::LimitExceeded("note too long"));
        }
        let (current, mut scope) = self.lock_appointment(appointment_id).await?;
        let entry = status_entry(appointment_id, old_status, new_status, actor, note, now_ms());
        let event = Event::StatusLogged {
            entry: entry.clone(),
        };
        self.commit(scope.timeline(), current.branch_id, vec![event])
            .await?;
        Ok(entry)
    }

    /// Every ledger row of an appointment in append order. Retired
    /// appointments keep their history.
    pub fn get_logs_for_appointment(&self, appointment_id: Ulid) -> Vec<StatusLogEntry> {
        self.ledger
            .get(&appointment_id)
            .map(|rows| rows.value().clone())
            .unwrap_or_default()
    }
}
