use std::collections::BTreeMap;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

/// What occupies a staff member's time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occupancy {
    /// A non-terminal appointment.
    Appointment,
    /// A reservation hold; ignored once `expires_at <= now`.
    Lock { expires_at: Ms },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub id: Ulid,
    pub span: Span,
    pub kind: Occupancy,
}

impl Interval {
    pub fn is_active(&self, now: Ms) -> bool {
        match self.kind {
            Occupancy::Appointment => true,
            Occupancy::Lock { expires_at } => expires_at > now,
        }
    }
}

/// Everything that can make one staff member unbookable.
#[derive(Debug, Clone)]
pub struct StaffTimeline {
    pub id: Ulid,
    pub branch_id: Ulid,
    pub tenant_id: Ulid,
    /// Occupying intervals, sorted by `span.start`.
    pub intervals: Vec<Interval>,
    /// Staff-level whole-day blocks.
    pub days_off: BTreeMap<NaiveDate, Unavailability>,
}

impl StaffTimeline {
    pub fn new(id: Ulid, branch_id: Ulid, tenant_id: Ulid) -> Self {
        Self {
            id,
            branch_id,
            tenant_id,
            intervals: Vec::new(),
            days_off: BTreeMap::new(),
        }
    }

    /// Insert interval maintaining sort order by span.start.
    pub fn insert_interval(&mut self, interval: Interval) {
        let pos = self
            .intervals
            .binary_search_by_key(&interval.span.start, |i| i.span.start)
            .unwrap_or_else(|e| e);
        self.intervals.insert(pos, interval);
    }

    pub fn remove_interval(&mut self, id: Ulid) -> Option<Interval> {
        let pos = self.intervals.iter().position(|i| i.id == id)?;
        Some(self.intervals.remove(pos))
    }

    /// Intervals whose span overlaps the query window.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Interval> {
        let right_bound = self
            .intervals
            .partition_point(|i| i.span.start < query.end);
        self.intervals[..right_bound]
            .iter()
            .filter(move |i| i.span.end > query.start)
    }

    /// Spans of active occupants overlapping `query`, sorted by start.
    pub fn busy_spans(&self, query: &Span, now: Ms) -> Vec<Span> {
        self.overlapping(query)
            .filter(|i| i.is_active(now))
            .map(|i| i.span)
            .collect()
    }

    pub fn is_off(&self, date: NaiveDate) -> bool {
        self.days_off.contains_key(&date)
    }
}

/// Schedule rules for one branch.
#[derive(Debug, Clone, Default)]
pub struct BranchRules {
    pub id: Ulid,
    /// At most one entry per weekday.
    pub weekly: BTreeMap<u8, WorkingHour>,
    pub overrides: BTreeMap<NaiveDate, WorkingDayOverride>,
    /// Branch-wide whole-day blocks.
    pub closures: BTreeMap<NaiveDate, Unavailability>,
}

impl BranchRules {
    pub fn new(id: Ulid) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// Opening window for `date`. An override replaces the weekly rule entirely.
    /// Closures are not applied here.
    pub fn window(&self, date: NaiveDate) -> Option<Span> {
        if let Some(day) = self.overrides.get(&date) {
            return match day.rule {
                DayOverride::Closed => None,
                DayOverride::Open { start, end } => Some(Span::new(at(date, start), at(date, end))),
            };
        }
        let hour = self.weekly.get(&weekday_number(date))?;
        Some(Span::new(at(date, hour.start), at(date, hour.end)))
    }

    pub fn is_closed(&self, date: NaiveDate) -> bool {
        self.closures.contains_key(&date)
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveTime;

    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()
    }

    fn appt(start: Ms, end: Ms) -> Interval {
        Interval {
            id: Ulid::new(),
            span: Span::new(start, end),
            kind: Occupancy::Appointment,
        }
    }

    fn timeline() -> StaffTimeline {
        StaffTimeline::new(Ulid::new(), Ulid::new(), Ulid::new())
    }

    #[test]
    fn interval_ordering() {
        let mut ts = timeline();
        ts.insert_interval(appt(300, 400));
        ts.insert_interval(appt(100, 200));
        ts.insert_interval(Interval {
            id: Ulid::new(),
            span: Span::new(200, 300),
            kind: Occupancy::Lock { expires_at: 9999 },
        });
        let starts: Vec<Ms> = ts.intervals.iter().map(|i| i.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn remove_middle_preserves_order() {
        let mut ts = timeline();
        let ids: Vec<Ulid> = (0..3)
            .map(|i| {
                let iv = appt(i * 100, i * 100 + 50);
                ts.insert_interval(iv);
                iv.id
            })
            .collect();
        assert!(ts.remove_interval(ids[1]).is_some());
        assert!(ts.remove_interval(Ulid::new()).is_none());
        assert_eq!(ts.intervals.len(), 2);
        assert_eq!(ts.intervals[0].id, ids[0]);
        assert_eq!(ts.intervals[1].id, ids[2]);
    }

    #[test]
    fn overlapping_respects_half_open() {
        let mut ts = timeline();
        ts.insert_interval(appt(100, 200));
        ts.insert_interval(appt(450, 600));
        ts.insert_interval(appt(1000, 1100));
        let hits: Vec<_> = ts.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
        assert_eq!(ts.overlapping(&Span::new(200, 450)).count(), 0);
    }

    #[test]
    fn busy_spans_skip_expired_locks() {
        let mut ts = timeline();
        ts.insert_interval(appt(100, 200));
        ts.insert_interval(Interval {
            id: Ulid::new(),
            span: Span::new(300, 400),
            kind: Occupancy::Lock { expires_at: 50 },
        });
        ts.insert_interval(Interval {
            id: Ulid::new(),
            span: Span::new(500, 600),
            kind: Occupancy::Lock { expires_at: 5000 },
        });
        let busy = ts.busy_spans(&Span::new(0, 1000), 1000);
        assert_eq!(busy, vec![Span::new(100, 200), Span::new(500, 600)]);
    }

    #[test]
    fn weekly_window_by_weekday() {
        let branch = Ulid::new();
        let mut rules = BranchRules::new(branch);
        rules.weekly.insert(
            1,
            WorkingHour {
                id: Ulid::new(),
                branch_id: branch,
                weekday: 1,
                start: t(9, 0),
                end: t(17, 0),
            },
        );
        let d = monday();
        assert_eq!(rules.window(d), Some(Span::new(at(d, t(9, 0)), at(d, t(17, 0)))));
        // Tuesday has no entry
        assert_eq!(rules.window(d.succ_opt().unwrap()), None);
    }

    #[test]
    fn override_supersedes_weekly() {
        let branch = Ulid::new();
        let d = monday();
        let mut rules = BranchRules::new(branch);
        rules.weekly.insert(
            1,
            WorkingHour {
                id: Ulid::new(),
                branch_id: branch,
                weekday: 1,
                start: t(9, 0),
                end: t(17, 0),
            },
        );
        rules.overrides.insert(
            d,
            WorkingDayOverride {
                id: Ulid::new(),
                branch_id: branch,
                date: d,
                rule: DayOverride::Open { start: t(12, 0), end: t(14, 0) },
            },
        );
        assert_eq!(rules.window(d), Some(Span::new(at(d, t(12, 0)), at(d, t(14, 0)))));

        rules.overrides.get_mut(&d).unwrap().rule = DayOverride::Closed;
        assert_eq!(rules.window(d), None);
    }
}
