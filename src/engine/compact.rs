use std::collections::BTreeMap;

use tokio::sync::oneshot;
use ulid::Ulid;

use crate::model::*;
use crate::observability::WAL_COMPACTIONS_TOTAL;

use super::conflict::now_ms;
use super::{Engine, EngineError, WalCommand};

impl Engine {
    /// Rewrite the WAL with only the events needed to recreate the current state.
    /// Commits wait while the snapshot is taken and the file is swapped.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.write().await;
        let events = self.snapshot_events();
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Wal(e.to_string()))?;

        metrics::counter!(WAL_COMPACTIONS_TOTAL).increment(1);
        tracing::info!(events = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Built from the record maps only, so no staff or branch lock is needed.
    fn snapshot_events(&self) -> Vec<Event> {
        let mut events = Vec::new();

        for entry in self.staff.iter() {
            events.push(Event::StaffAttached {
                staff_id: *entry.key(),
                branch_id: entry.branch_id,
                tenant_id: entry.tenant_id,
            });
        }

        let mut weekly: BTreeMap<Ulid, Vec<WorkingHour>> = BTreeMap::new();
        for hour in self.working_hours.iter() {
            weekly.entry(hour.branch_id).or_default().push(hour.value().clone());
        }
        for (branch_id, mut hours) in weekly {
            hours.sort_by_key(|h| h.weekday);
            events.push(Event::WorkingHoursReplaced { branch_id, hours });
        }
        for day in self.overrides.iter() {
            events.push(Event::OverrideAdded {
                day: day.value().clone(),
            });
        }
        for block in self.unavailability.iter() {
            events.push(Event::UnavailabilityAdded {
                block: block.value().clone(),
            });
        }

        let mut appointments: Vec<Appointment> =
            self.appointments.iter().map(|a| a.value().clone()).collect();
        appointments.sort_by_key(|a| a.id);
        events.extend(appointments.into_iter().map(|appointment| Event::AppointmentCreated {
            appointment,
            consumed_lock: None,
        }));

        let now = now_ms();
        for lock in self.locks.iter().filter(|l| !l.is_expired(now)) {
            events.push(Event::LockPlaced {
                lock: lock.value().clone(),
            });
        }

        let mut ledger: Vec<(Ulid, Vec<StatusLogEntry>)> = self
            .ledger
            .iter()
            .map(|rows| (*rows.key(), rows.value().clone()))
            .collect();
        ledger.sort_by_key(|(id, _)| *id);
        for (_, rows) in ledger {
            events.extend(rows.into_iter().map(|entry| Event::StatusLogged { entry }));
        }

        for row in self.workload.iter() {
            if row.appointment_count != 0 || row.booked_minutes != 0 {
                events.push(Event::WorkloadAdjusted {
                    staff_id: row.staff_id,
                    date: row.date,
                    appointments_delta: row.appointment_count,
                    minutes_delta: row.booked_minutes,
                });
            }
        }

        events
    }
}
