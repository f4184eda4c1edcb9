use ulid::Ulid;

use crate::model::*;
use crate::state::{BranchRules, StaffTimeline};

use super::{Engine, EngineError};

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start >= span.end {
        return Err(EngineError::InvalidInput("start must be before end"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

/// Fails with the id of the first active occupant overlapping `span`.
/// `exclude` skips one occupant (the appointment being moved, or the lock
/// being converted).
pub(crate) fn check_no_conflict(
    ts: &StaffTimeline,
    span: &Span,
    now: Ms,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    for interval in ts.overlapping(span) {
        if Some(interval.id) == exclude || !interval.is_active(now) {
            continue;
        }
        return Err(EngineError::Conflict(interval.id));
    }
    Ok(())
}

/// Every calendar day `span` touches must be free of staff and branch blocks.
pub(crate) fn check_bookable_days(
    ts: &StaffTimeline,
    rules: &BranchRules,
    span: &Span,
) -> Result<(), EngineError> {
    let (Some(first), Some(last)) = (date_of(span.start), date_of(span.end - 1)) else {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    };
    for date in first.iter_days().take_while(|d| *d <= last) {
        if ts.is_off(date) || rules.is_closed(date) {
            return Err(EngineError::StaffUnavailable(ts.id));
        }
    }
    Ok(())
}

/// `span` must sit inside the opening window of the day it starts on.
pub(crate) fn check_within_hours(
    staff_id: Ulid,
    rules: &BranchRules,
    span: &Span,
) -> Result<(), EngineError> {
    let inside = date_of(span.start)
        .and_then(|date| rules.window(date))
        .is_some_and(|window| window.contains_span(span));
    if inside {
        Ok(())
    } else {
        Err(EngineError::StaffUnavailable(staff_id))
    }
}

impl Engine {
    /// Pure overlap probe against a staff member's live occupants.
    /// Unassigned never conflicts, and neither does a staff member with no
    /// timeline yet.
    pub async fn overlaps(
        &self,
        staff: StaffAssignment,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    ) -> Result<bool, EngineError> {
        let span = Span { start, end };
        validate_span(&span)?;
        let Some(staff_id) = staff.staff_id() else {
            return Ok(false);
        };
        let Some(entry) = self.staff_entry(&staff_id) else {
            return Ok(false);
        };
        let ts = entry.timeline.read().await;
        Ok(check_no_conflict(&ts, &span, now_ms(), exclude).is_err())
    }

    /// Day-block and (optionally) working-hour checks for a booking on `ts`.
    /// Takes the branch read lock while the caller holds the staff write lock.
    pub(super) async fn check_schedule(
        &self,
        ts: &StaffTimeline,
        span: &Span,
    ) -> Result<(), EngineError> {
        let rules = self.branch_rules(ts.branch_id);
        let rules = rules.read().await;
        check_bookable_days(ts, &rules, span)?;
        if self.config.enforce_working_hours {
            check_within_hours(ts.id, &rules, span)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, NaiveTime};

    use super::*;
    use crate::state::{Interval, Occupancy};

    fn timeline() -> StaffTimeline {
        StaffTimeline::new(Ulid::new(), Ulid::new(), Ulid::new())
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()
    }

    fn t(h: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, 0, 0).unwrap()
    }

    #[test]
    fn back_to_back_is_not_a_conflict() {
        let mut ts = timeline();
        ts.insert_interval(Interval {
            id: Ulid::new(),
            span: Span::new(1_000, 2_000),
            kind: Occupancy::Appointment,
        });
        assert!(check_no_conflict(&ts, &Span::new(2_000, 3_000), 0, None).is_ok());
        assert!(check_no_conflict(&ts, &Span::new(0, 1_000), 0, None).is_ok());
        assert!(matches!(
            check_no_conflict(&ts, &Span::new(1_999, 2_500), 0, None),
            Err(EngineError::Conflict(_))
        ));
    }

    #[test]
    fn exclusion_and_expired_locks() {
        let mut ts = timeline();
        let own = Ulid::new();
        ts.insert_interval(Interval {
            id: own,
            span: Span::new(1_000, 2_000),
            kind: Occupancy::Appointment,
        });
        ts.insert_interval(Interval {
            id: Ulid::new(),
            span: Span::new(1_500, 2_500),
            kind: Occupancy::Lock { expires_at: 10 },
        });
        // The lock expired at 10; the only live overlap is excluded.
        assert!(check_no_conflict(&ts, &Span::new(1_200, 2_200), 100, Some(own)).is_ok());
        assert!(check_no_conflict(&ts, &Span::new(1_200, 2_200), 5, Some(own)).is_err());
    }

    #[test]
    fn validate_span_rejects_inverted_and_wide() {
        assert!(matches!(
            validate_span(&Span { start: 10, end: 10 }),
            Err(EngineError::InvalidInput(_))
        ));
        assert!(matches!(
            validate_span(&Span::new(0, DAY_MS + 1)),
            Err(EngineError::LimitExceeded(_))
        ));
        assert!(validate_span(&Span::new(0, HOUR_MS)).is_ok());
    }

    #[test]
    fn day_blocks_cover_every_touched_date() {
        let mut ts = timeline();
        let rules = BranchRules::new(ts.branch_id);
        let next = day().succ_opt().unwrap();
        ts.days_off.insert(
            next,
            Unavailability {
                id: Ulid::new(),
                scope: UnavailabilityScope::Staff(ts.id),
                date: next,
                reason: "training".into(),
            },
        );
        let same_day = Span::new(at(day(), t(10)), at(day(), t(11)));
        assert!(check_bookable_days(&ts, &rules, &same_day).is_ok());

        let overnight = Span::new(at(day(), t(23)), at(next, t(1)));
        assert!(matches!(
            check_bookable_days(&ts, &rules, &overnight),
            Err(EngineError::StaffUnavailable(_))
        ));
    }

    #[test]
    fn within_hours() {
        let branch = Ulid::new();
        let mut rules = BranchRules::new(branch);
        rules.weekly.insert(
            1,
            WorkingHour {
                id: Ulid::new(),
                branch_id: branch,
                weekday: 1,
                start: t(9),
                end: t(17),
            },
        );
        let staff = Ulid::new();
        let inside = Span::new(at(day(), t(9)), at(day(), t(10)));
        let spill = Span::new(at(day(), t(16)), at(day(), t(18)));
        assert!(check_within_hours(staff, &rules, &inside).is_ok());
        assert!(check_within_hours(staff, &rules, &spill).is_err());
    }
}
