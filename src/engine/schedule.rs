use std::collections::BTreeSet;

use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::limits::MAX_REASON_LEN;
use crate::model::*;

use super::{Engine, EngineError};

fn validate_hours(weekday: u8, start: NaiveTime, end: NaiveTime) -> Result<(), EngineError> {
    if weekday > 6 {
        return Err(EngineError::InvalidInput("weekday must be 0..=6"));
    }
    if start >= end {
        return Err(EngineError::InvalidInput("opening time must be before closing time"));
    }
    Ok(())
}

fn validate_override(rule: &DayOverride) -> Result<(), EngineError> {
    match rule {
        DayOverride::Closed => Ok(()),
        DayOverride::Open { start, end } if start < end => Ok(()),
        DayOverride::Open { .. } => Err(EngineError::InvalidInput(
            "an open override needs opening before closing",
        )),
    }
}

fn require_branch(branch_id: Ulid) -> Result<(), EngineError> {
    if branch_id.is_nil() {
        return Err(EngineError::InvalidInput("branch_id is required"));
    }
    Ok(())
}

impl Engine {
    // ── Weekly hours ─────────────────────────────────────

    /// Replace a branch's whole weekly schedule with one entry per listed weekday.
    pub async fn replace_working_hours(
        &self,
        branch_id: Ulid,
        entries: Vec<(u8, NaiveTime, NaiveTime)>,
    ) -> Result<Vec<WorkingHour>, EngineError> {
        require_branch(branch_id)?;
        let mut seen = BTreeSet::new();
        for &(weekday, start, end) in &entries {
            validate_hours(weekday, start, end)?;
            if !seen.insert(weekday) {
                return Err(EngineError::InvalidInput("weekday listed twice"));
            }
        }
        let hours: Vec<WorkingHour> = entries
            .into_iter()
            .map(|(weekday, start, end)| WorkingHour {
                id: Ulid::new(),
                branch_id,
                weekday,
                start,
                end,
            })
            .collect();

        let rules = self.branch_rules(branch_id);
        let mut guard = rules.write().await;
        let event = Event::WorkingHoursReplaced {
            branch_id,
            hours: hours.clone(),
        };
        self.commit_branch(&mut guard, vec![event]).await?;
        Ok(hours)
    }

    pub async fn add_working_hour(
        &self,
        branch_id: Ulid,
        weekday: u8,
        start: NaiveTime,
        end: NaiveTime,
    ) -> Result<WorkingHour, EngineError> {
        require_branch(branch_id)?;
        validate_hours(weekday, start, end)?;
        let rules = self.branch_rules(branch_id);
        let mut guard = rules.write().await;
        if guard.weekly.contains_key(&weekday) {
            return Err(EngineError::DuplicateRule("working hours already set for weekday"));
        }
        let hour = WorkingHour {
            id: Ulid::new(),
            branch_id,
            weekday,
            start,
            end,
        };
        let event = Event::WorkingHourAdded { hour: hour.clone() };
        self.commit_branch(&mut guard, vec![event]).await?;
        Ok(hour)
    }

    pub async fn remove_working_hour(&self, id: Ulid) -> Result<(), EngineError> {
        let branch_id = self
            .working_hours
            .get(&id)
            .map(|h| h.branch_id)
            .ok_or(EngineError::not_found("working hour", id))?;
        let rules = self.branch_rules(branch_id);
        let mut guard = rules.write().await;
        if !self.working_hours.contains_key(&id) {
            return Err(EngineError::not_found("working hour", id));
        }
        let event = Event::WorkingHourRemoved { id, branch_id };
        self.commit_branch(&mut guard, vec![event]).await
    }

    /// Weekly entries ordered by weekday.
    pub async fn list_working_hours(&self, branch_id: Ulid) -> Vec<WorkingHour> {
        let rules = self.branch_snapshot(branch_id).await;
        rules.weekly.into_values().collect()
    }

    // ── Date overrides ───────────────────────────────────

    pub async fn add_override(
        &self,
        branch_id: Ulid,
        date: NaiveDate,
        rule: DayOverride,
    ) -> Result<WorkingDayOverride, EngineError> {
        require_branch(branch_id)?;
        validate_override(&rule)?;
        let rules = self.branch_rules(branch_id);
        let mut guard = rules.write().await;
        if guard.overrides.contains_key(&date) {
            return Err(EngineError::DuplicateRule("override already exists for date"));
        }
        let day = WorkingDayOverride {
            id: Ulid::new(),
            branch_id,
            date,
            rule,
        };
        let event = Event::OverrideAdded { day: day.clone() };
        self.commit_branch(&mut guard, vec![event]).await?;
        Ok(day)
    }

    /// Change what an existing override says; its date is fixed.
    pub async fn update_override(
        &self,
        id: Ulid,
        rule: DayOverride,
    ) -> Result<WorkingDayOverride, EngineError> {
        validate_override(&rule)?;
        let branch_id = self
            .overrides
            .get(&id)
            .map(|o| o.branch_id)
            .ok_or(EngineError::not_found("override", id))?;
        let rules = self.branch_rules(branch_id);
        let mut guard = rules.write().await;
        let mut day = self
            .overrides
            .get(&id)
            .map(|o| o.value().clone())
            .ok_or(EngineError::not_found("override", id))?;
        day.rule = rule;
        let event = Event::OverrideUpdated { day: day.clone() };
        self.commit_branch(&mut guard, vec![event]).await?;
        Ok(day)
    }

    pub async fn remove_override(&self, id: Ulid) -> Result<(), EngineError> {
        let branch_id = self
            .overrides
            .get(&id)
            .map(|o| o.branch_id)
            .ok_or(EngineError::not_found("override", id))?;
        let rules = self.branch_rules(branch_id);
        let mut guard = rules.write().await;
        let date = self
            .overrides
            .get(&id)
            .map(|o| o.date)
            .ok_or(EngineError::not_found("override", id))?;
        let event = Event::OverrideRemoved {
            id,
            branch_id,
            date,
        };
        self.commit_branch(&mut guard, vec![event]).await
    }

    pub async fn get_override(&self, branch_id: Ulid, date: NaiveDate) -> Option<WorkingDayOverride> {
        let rules = self.branches.get(&branch_id).map(|e| e.value().clone())?;
        let guard = rules.read().await;
        guard.overrides.get(&date).cloned()
    }

    // ── Whole-day unavailability ─────────────────────────

    /// Block a whole day for one staff member or a whole branch. At most one
    /// block per scope and date; the uniqueness check runs under the owning lock.
    pub async fn add_unavailability(
        &self,
        scope: UnavailabilityScope,
        date: NaiveDate,
        reason: String,
    ) -> Result<Unavailability, EngineError> {
        if reason.len() > MAX_REASON_LEN {
            return Err(EngineError::LimitExceeded("reason too long"));
        }
        let block = Unavailability {
            id: Ulid::new(),
            scope,
            date,
            reason,
        };
        let event = Event::UnavailabilityAdded {
            block: block.clone(),
        };
        match scope {
            UnavailabilityScope::Staff(staff_id) => {
                let (entry, mut ts) = self.staff_timeline_write(staff_id).await?;
                if ts.is_off(date) {
                    return Err(EngineError::DuplicateRule("staff already unavailable on date"));
                }
                self.commit(Some(&mut *ts), entry.branch_id, vec![event])
                    .await?;
            }
            UnavailabilityScope::Branch(branch_id) => {
                require_branch(branch_id)?;
                let rules = self.branch_rules(branch_id);
                let mut guard = rules.write().await;
                if guard.is_closed(date) {
                    return Err(EngineError::DuplicateRule("branch already closed on date"));
                }
                self.commit_branch(&mut guard, vec![event]).await?;
            }
        }
        Ok(block)
    }

    pub async fn remove_unavailability(&self, id: Ulid) -> Result<(), EngineError> {
        let scope = self
            .unavailability
            .get(&id)
            .map(|u| u.scope)
            .ok_or(EngineError::not_found("unavailability", id))?;
        let current = |engine: &Self| {
            engine
                .unavailability
                .get(&id)
                .map(|u| u.date)
                .ok_or(EngineError::not_found("unavailability", id))
        };
        match scope {
            UnavailabilityScope::Staff(staff_id) => {
                let entry = self
                    .staff_entry(&staff_id)
                    .ok_or(EngineError::not_found("staff", staff_id))?;
                let mut ts = entry.timeline.write_owned().await;
                let date = current(self)?;
                let event = Event::UnavailabilityRemoved { id, scope, date };
                self.commit(Some(&mut *ts), entry.branch_id, vec![event])
                    .await
            }
            UnavailabilityScope::Branch(branch_id) => {
                let rules = self.branch_rules(branch_id);
                let mut guard = rules.write().await;
                let date = current(self)?;
                let event = Event::UnavailabilityRemoved { id, scope, date };
                self.commit_branch(&mut guard, vec![event]).await
            }
        }
    }

    /// Blocks for `scope` dated within `[from, to]`, by date.
    pub fn list_unavailability(
        &self,
        scope: UnavailabilityScope,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Unavailability>, EngineError> {
        if from > to {
            return Err(EngineError::InvalidInput("from must not be after to"));
        }
        let mut blocks: Vec<Unavailability> = self
            .unavailability
            .iter()
            .filter(|u| u.scope == scope && u.date >= from && u.date <= to)
            .map(|u| u.value().clone())
            .collect();
        blocks.sort_by_key(|u| u.date);
        Ok(blocks)
    }
}
