use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::AVAILABILITY_DURATION_SECONDS;
use crate::state::BranchRules;

use super::conflict::{check_no_conflict, now_ms, validate_span};
use super::{Engine, EngineError};

// ── Interval algebra ─────────────────────────────────────────────

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`. Both inputs sorted by start; `to_remove` disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

// ── Slot calendar ────────────────────────────────────────────────

/// Parameters of [`Engine::get_available_slots`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotQuery {
    pub branch_id: Ulid,
    /// One staff member; `None` means everyone at the branch.
    pub staff_id: Option<Ulid>,
    /// Inclusive date range.
    pub from: NaiveDate,
    pub to: NaiveDate,
    /// Split free time into fixed-length slots; `None` yields maximal free runs.
    pub slot_minutes: Option<i64>,
    /// Also emit `Blocked` cells for closed parts of each day.
    pub full_day: bool,
}

impl SlotQuery {
    pub fn new(branch_id: Ulid, from: NaiveDate, to: NaiveDate) -> Self {
        Self {
            branch_id,
            staff_id: None,
            from,
            to,
            slot_minutes: None,
            full_day: false,
        }
    }

    pub fn staff(mut self, staff_id: Ulid) -> Self {
        self.staff_id = Some(staff_id);
        self
    }

    pub fn slot_minutes(mut self, minutes: i64) -> Self {
        self.slot_minutes = Some(minutes);
        self
    }

    pub fn full_day(mut self) -> Self {
        self.full_day = true;
        self
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.branch_id.is_nil() {
            return Err(EngineError::InvalidInput("branch_id is required"));
        }
        if self.from > self.to {
            return Err(EngineError::InvalidInput("from must not be after to"));
        }
        if (self.to - self.from).num_days() >= MAX_QUERY_DAYS {
            return Err(EngineError::LimitExceeded("date range too wide"));
        }
        if let Some(minutes) = self.slot_minutes
            && !(MIN_SLOT_MINUTES..=MAX_SERVICE_MINUTES).contains(&minutes)
        {
            return Err(EngineError::InvalidInput("slot length out of range"));
        }
        Ok(())
    }
}

/// What one staff lane looked like when the query ran.
#[derive(Debug, Clone)]
struct Lane {
    staff_id: Option<Ulid>,
    /// Active occupants, sorted by start.
    busy: Vec<Span>,
    days_off: BTreeSet<NaiveDate>,
}

/// Lazily computed calendar over a snapshot taken at query time.
/// Yields cells day by day, lane by lane within a day, by start within a lane.
#[derive(Debug, Clone)]
pub struct SlotCalendar {
    rules: Arc<BranchRules>,
    lanes: Arc<[Lane]>,
    first: NaiveDate,
    next_date: Option<NaiveDate>,
    last: NaiveDate,
    slot_ms: Option<Ms>,
    full_day: bool,
    pending: VecDeque<CalendarSlot>,
}

impl SlotCalendar {
    fn new(rules: BranchRules, lanes: Vec<Lane>, query: &SlotQuery) -> Self {
        Self {
            rules: Arc::new(rules),
            lanes: lanes.into(),
            first: query.from,
            next_date: Some(query.from),
            last: query.to,
            slot_ms: query.slot_minutes.map(|m| m * MINUTE_MS),
            full_day: query.full_day,
            pending: VecDeque::new(),
        }
    }

    /// A fresh pass over the same snapshot.
    pub fn restart(&self) -> Self {
        Self {
            next_date: Some(self.first),
            pending: VecDeque::new(),
            ..self.clone()
        }
    }

    /// Only the `Available` cells.
    pub fn available(self) -> impl Iterator<Item = CalendarSlot> {
        self.filter(|slot| slot.status == SlotStatus::Available)
    }
}

impl Iterator for SlotCalendar {
    type Item = CalendarSlot;

    fn next(&mut self) -> Option<CalendarSlot> {
        loop {
            if let Some(slot) = self.pending.pop_front() {
                return Some(slot);
            }
            let date = self.next_date.filter(|d| *d <= self.last)?;
            self.next_date = date.succ_opt();
            for lane in self.lanes.iter() {
                day_cells(&self.rules, lane, date, self.slot_ms, self.full_day, &mut self.pending);
            }
        }
    }
}

/// Cells of one lane on one day.
fn day_cells(
    rules: &BranchRules,
    lane: &Lane,
    date: NaiveDate,
    slot_ms: Option<Ms>,
    full_day: bool,
    out: &mut VecDeque<CalendarSlot>,
) {
    let cell = |span: Span, status: SlotStatus| CalendarSlot {
        staff_id: lane.staff_id,
        span,
        status,
    };
    let day = day_span(date);
    let window = if rules.is_closed(date) || lane.days_off.contains(&date) {
        None
    } else {
        rules.window(date)
    };
    let Some(window) = window else {
        if full_day {
            out.push_back(cell(day, SlotStatus::Blocked));
        }
        return;
    };

    if full_day && day.start < window.start {
        out.push_back(cell(Span::new(day.start, window.start), SlotStatus::Blocked));
    }

    let clamped: Vec<Span> = lane.busy.iter().filter_map(|s| s.clamp_to(&window)).collect();
    let booked = merge_overlapping(&clamped);
    let free = subtract_intervals(&[window], &booked);

    let mut segments: Vec<(Span, SlotStatus)> = free
        .into_iter()
        .map(|s| (s, SlotStatus::Available))
        .chain(booked.into_iter().map(|s| (s, SlotStatus::Booked)))
        .collect();
    segments.sort_by_key(|(s, _)| s.start);

    for (span, status) in segments {
        match (status, slot_ms) {
            (SlotStatus::Available, Some(len)) => {
                let mut start = span.start;
                while start + len <= span.end {
                    out.push_back(cell(Span::new(start, start + len), SlotStatus::Available));
                    start += len;
                }
            }
            _ => out.push_back(cell(span, status)),
        }
    }

    if full_day && window.end < day.end {
        out.push_back(cell(Span::new(window.end, day.end), SlotStatus::Blocked));
    }
}

impl Engine {
    /// Free (and optionally booked/blocked) time for a branch over a date range.
    /// State is captured when this returns; cells are computed as the calendar
    /// is iterated.
    pub async fn get_available_slots(&self, query: SlotQuery) -> Result<SlotCalendar, EngineError> {
        let started = std::time::Instant::now();
        query.validate()?;

        let staff_ids: Vec<Option<Ulid>> = match query.staff_id {
            Some(staff_id) => {
                let info = self.resolve_staff(staff_id).await?;
                if info.branch_id != query.branch_id {
                    return Err(EngineError::StaffBranchMismatch {
                        staff_id,
                        branch_id: query.branch_id,
                    });
                }
                vec![Some(staff_id)]
            }
            None => {
                let listed = self.collaborators.staff.staff_at_branch(query.branch_id).await?;
                if listed.is_empty() {
                    vec![None]
                } else {
                    listed.into_iter().map(|s| Some(s.id)).collect()
                }
            }
        };

        // Branch first, released before any staff lock is taken.
        let rules = self.branch_snapshot(query.branch_id).await;
        let range = Span::new(day_span(query.from).start, day_span(query.to).end);
        let now = now_ms();
        let mut lanes = Vec::with_capacity(staff_ids.len());
        for staff_id in staff_ids {
            let mut lane = Lane {
                staff_id,
                busy: Vec::new(),
                days_off: BTreeSet::new(),
            };
            if let Some(entry) = staff_id.and_then(|id| self.staff_entry(&id)) {
                let ts = entry.timeline.read().await;
                lane.busy = ts.busy_spans(&range, now);
                lane.days_off = ts
                    .days_off
                    .range(query.from..=query.to)
                    .map(|(date, _)| *date)
                    .collect();
            }
            lanes.push(lane);
        }

        metrics::histogram!(AVAILABILITY_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        Ok(SlotCalendar::new(rules, lanes, &query))
    }

    /// Whether a staff member could take `[start, end)` right now: inside the
    /// branch's opening window, no day block, no live occupant. Unknown or
    /// retired staff are simply unavailable.
    pub async fn check_barber_availability(
        &self,
        staff_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<bool, EngineError> {
        let span = Span { start, end };
        validate_span(&span)?;
        let Some(info) = self
            .collaborators
            .staff
            .staff(staff_id)
            .await?
            .filter(|s| s.lifecycle == Lifecycle::Active)
        else {
            return Ok(false);
        };
        self.staff_is_free(info.branch_id, staff_id, &span).await
    }

    /// Active staff of a branch who are free for `[start, end)`, by id.
    pub async fn get_available_barbers(
        &self,
        branch_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<Vec<Ulid>, EngineError> {
        let span = Span { start, end };
        validate_span(&span)?;
        let mut free = Vec::new();
        for staff in self.collaborators.staff.staff_at_branch(branch_id).await? {
            if self.staff_is_free(branch_id, staff.id, &span).await? {
                free.push(staff.id);
            }
        }
        Ok(free)
    }

    async fn staff_is_free(
        &self,
        branch_id: Ulid,
        staff_id: Ulid,
        span: &Span,
    ) -> Result<bool, EngineError> {
        let Some(date) = date_of(span.start) else {
            return Err(EngineError::LimitExceeded("timestamp out of range"));
        };
        let rules = self.branch_snapshot(branch_id).await;
        let open = !rules.is_closed(date)
            && rules
                .window(date)
                .is_some_and(|window| window.contains_span(span));
        if !open {
            return Ok(false);
        }
        let Some(entry) = self.staff_entry(&staff_id) else {
            return Ok(true);
        };
        let ts = entry.timeline.read().await;
        Ok(!ts.is_off(date) && check_no_conflict(&ts, span, now_ms(), None).is_ok())
    }
}
