use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::{MAX_WORKLOAD_APPOINTMENTS_DELTA, MAX_WORKLOAD_MINUTES_DELTA};
use crate::model::*;

use super::{Engine, EngineError};

/// Per-branch roll-up of one day's workload rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadSummary {
    pub date: NaiveDate,
    pub staff_count: usize,
    pub appointment_count: i64,
    pub booked_minutes: i64,
}

impl Engine {
    /// Apply a manual correction to a staff member's counters for `date`.
    /// Bookings keep the counters current on their own; this is for
    /// reconciliation by an operator. A correction may not push either
    /// counter below zero.
    pub async fn upsert_workload(
        &self,
        staff_id: Ulid,
        date: NaiveDate,
        appointments_delta: i64,
        minutes_delta: i64,
    ) -> Result<BarberWorkload, EngineError> {
        if appointments_delta.unsigned_abs() > MAX_WORKLOAD_APPOINTMENTS_DELTA.unsigned_abs()
            || minutes_delta.unsigned_abs() > MAX_WORKLOAD_MINUTES_DELTA.unsigned_abs()
        {
            return Err(EngineError::LimitExceeded("workload correction too large"));
        }
        // Bookings adjust these counters under the same guard.
        let (entry, mut ts) = self.staff_timeline_write(staff_id).await?;
        let current = self.get_workload_by_barber(staff_id, date);
        let (Some(appointments), Some(minutes)) = (
            current.appointment_count.checked_add(appointments_delta),
            current.booked_minutes.checked_add(minutes_delta),
        ) else {
            return Err(EngineError::LimitExceeded("workload counter overflow"));
        };
        if appointments < 0 || minutes < 0 {
            return Err(EngineError::InvalidInput("workload counters cannot go negative"));
        }
        let event = Event::WorkloadAdjusted {
            staff_id,
            date,
            appointments_delta,
            minutes_delta,
        };
        self.commit(Some(&mut *ts), entry.branch_id, vec![event]).await?;
        Ok(self.get_workload_by_barber(staff_id, date))
    }

    /// Counters for one staff member on one day; zero when nothing was booked.
    pub fn get_workload_by_barber(&self, staff_id: Ulid, date: NaiveDate) -> BarberWorkload {
        self.workload
            .get(&(staff_id, date))
            .map(|row| row.value().clone())
            .unwrap_or_else(|| BarberWorkload::zero(staff_id, date))
    }

    /// Every staff member's row for `date`, by staff id.
    pub fn get_workload_by_date(&self, date: NaiveDate) -> Vec<BarberWorkload> {
        let mut rows: Vec<BarberWorkload> = self
            .workload
            .iter()
            .filter(|row| row.date == date)
            .map(|row| row.value().clone())
            .collect();
        rows.sort_by_key(|row| row.staff_id);
        rows
    }

    /// Totals for `date`, optionally narrowed to a tenant and/or branch.
    /// Staff whose counters net out to zero do not count as contributing.
    pub fn get_workload_summary_by_branch(
        &self,
        date: NaiveDate,
        tenant_id: Option<Ulid>,
        branch_id: Option<Ulid>,
    ) -> WorkloadSummary {
        let mut summary = WorkloadSummary {
            date,
            staff_count: 0,
            appointment_count: 0,
            booked_minutes: 0,
        };
        for row in self.get_workload_by_date(date) {
            if row.appointment_count == 0 && row.booked_minutes == 0 {
                continue;
            }
            let Some(staff) = self.staff_entry(&row.staff_id) else {
                continue;
            };
            if tenant_id.is_some_and(|t| t != staff.tenant_id)
                || branch_id.is_some_and(|b| b != staff.branch_id)
            {
                continue;
            }
            summary.staff_count += 1;
            summary.appointment_count = summary.appointment_count.saturating_add(row.appointment_count);
            summary.booked_minutes = summary.booked_minutes.saturating_add(row.booked_minutes);
        }
        summary
    }
}
