use std::fmt;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds (UTC), the only instant type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Back-to-back spans (`a.end == b.start`) do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Intersection with `other`, or `None` when they do not overlap.
    pub fn clamp_to(&self, other: &Span) -> Option<Span> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then(|| Span::new(start, end))
    }
}

// ── Calendar helpers ─────────────────────────────────────────────

/// The instant `date time` in UTC.
pub fn at(date: NaiveDate, time: NaiveTime) -> Ms {
    date.and_time(time).and_utc().timestamp_millis()
}

/// `[00:00, 24:00)` of `date`.
pub fn day_span(date: NaiveDate) -> Span {
    let start = at(date, NaiveTime::MIN);
    Span::new(start, start + DAY_MS)
}

pub fn date_of(t: Ms) -> Option<NaiveDate> {
    DateTime::from_timestamp_millis(t).map(|dt| dt.date_naive())
}

/// Weekday number with 0 = Sunday.
pub fn weekday_number(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

// ── Enumerations ─────────────────────────────────────────────────

/// Appointment status. `Pending` and `Confirmed` occupy time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
}

impl AppointmentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// `Pending → Confirmed → Completed`, `Pending|Confirmed → Cancelled`.
    pub fn can_transition_to(self, next: AppointmentStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Confirmed)
                | (Self::Confirmed, Self::Completed)
                | (Self::Pending | Self::Confirmed, Self::Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entity lifecycle; retired rows are invisible to every read path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Lifecycle {
    Active,
    Retired,
}

/// Who an appointment is booked with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StaffAssignment {
    Staff(Ulid),
    /// Not staff-exclusive; never conflicts with anything.
    Unassigned,
}

impl StaffAssignment {
    pub fn staff_id(&self) -> Option<Ulid> {
        match self {
            Self::Staff(id) => Some(*id),
            Self::Unassigned => None,
        }
    }
}

/// Whole-day block target: a single staff member or an entire branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnavailabilityScope {
    Staff(Ulid),
    Branch(Ulid),
}

/// Who caused a status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Actor {
    User(Ulid),
    Customer(Ulid),
    System,
}

/// Date-specific replacement for the weekly schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DayOverride {
    Closed,
    Open { start: NaiveTime, end: NaiveTime },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotStatus {
    Available,
    Booked,
    Blocked,
}

// ── Entities ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub tenant_id: Ulid,
    pub branch_id: Ulid,
    pub service_id: Ulid,
    pub staff: StaffAssignment,
    pub customer_id: Ulid,
    pub span: Span,
    pub status: AppointmentStatus,
    pub notes: Option<String>,
    pub lifecycle: Lifecycle,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Appointment {
    pub fn is_active(&self) -> bool {
        self.lifecycle == Lifecycle::Active
    }

    /// Whether this appointment holds its staff member's time.
    pub fn occupies(&self) -> bool {
        self.is_active() && !self.status.is_terminal()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingHour {
    pub id: Ulid,
    pub branch_id: Ulid,
    /// 0 = Sunday … 6 = Saturday.
    pub weekday: u8,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingDayOverride {
    pub id: Ulid,
    pub branch_id: Ulid,
    pub date: NaiveDate,
    pub rule: DayOverride,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unavailability {
    pub id: Ulid,
    pub scope: UnavailabilityScope,
    pub date: NaiveDate,
    pub reason: String,
}

/// Transient hold on a slot, prior to booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentLock {
    pub id: Ulid,
    pub tenant_id: Ulid,
    pub branch_id: Ulid,
    pub staff_id: Ulid,
    pub customer_id: Ulid,
    pub span: Span,
    pub expires_at: Ms,
}

impl AppointmentLock {
    pub fn is_expired(&self, now: Ms) -> bool {
        self.expires_at <= now
    }
}

/// One row of the append-only status ledger. `old_status` is `None` on creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusLogEntry {
    pub id: Ulid,
    pub appointment_id: Ulid,
    pub old_status: Option<AppointmentStatus>,
    pub new_status: AppointmentStatus,
    pub actor: Actor,
    pub note: Option<String>,
    pub at: Ms,
}

/// Derived per-staff, per-day counters. Never consulted for conflicts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarberWorkload {
    pub staff_id: Ulid,
    pub date: NaiveDate,
    pub appointment_count: i64,
    pub booked_minutes: i64,
}

impl BarberWorkload {
    pub fn zero(staff_id: Ulid, date: NaiveDate) -> Self {
        Self {
            staff_id,
            date,
            appointment_count: 0,
            booked_minutes: 0,
        }
    }

    pub fn booked_hours(&self) -> f64 {
        self.booked_minutes as f64 / 60.0
    }
}

/// Computed calendar cell; never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalendarSlot {
    pub staff_id: Option<Ulid>,
    pub span: Span,
    pub status: SlotStatus,
}

// ── WAL records ──────────────────────────────────────────────────

/// Flat event records, one per state change. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    StaffAttached {
        staff_id: Ulid,
        branch_id: Ulid,
        tenant_id: Ulid,
    },
    WorkingHoursReplaced {
        branch_id: Ulid,
        hours: Vec<WorkingHour>,
    },
    WorkingHourAdded {
        hour: WorkingHour,
    },
    WorkingHourRemoved {
        id: Ulid,
        branch_id: Ulid,
    },
    OverrideAdded {
        day: WorkingDayOverride,
    },
    OverrideUpdated {
        day: WorkingDayOverride,
    },
    OverrideRemoved {
        id: Ulid,
        branch_id: Ulid,
        date: NaiveDate,
    },
    UnavailabilityAdded {
        block: Unavailability,
    },
    UnavailabilityRemoved {
        id: Ulid,
        scope: UnavailabilityScope,
        date: NaiveDate,
    },
    AppointmentCreated {
        appointment: Appointment,
        consumed_lock: Option<Ulid>,
    },
    AppointmentRescheduled {
        id: Ulid,
        staff: StaffAssignment,
        span: Span,
        at: Ms,
    },
    AppointmentStatusChanged {
        id: Ulid,
        staff: StaffAssignment,
        status: AppointmentStatus,
        at: Ms,
    },
    AppointmentRetired {
        id: Ulid,
        staff: StaffAssignment,
        at: Ms,
    },
    LockPlaced {
        lock: AppointmentLock,
    },
    LockReleased {
        id: Ulid,
        staff_id: Ulid,
    },
    StatusLogged {
        entry: StatusLogEntry,
    },
    WorkloadAdjusted {
        staff_id: Ulid,
        date: NaiveDate,
        appointments_delta: i64,
        minutes_delta: i64,
    },
}

impl Event {
    /// Staff timeline this event mutates, if any.
    pub fn staff_target(&self) -> Option<Ulid> {
        match self {
            Event::AppointmentCreated { appointment, .. } => appointment.staff.staff_id(),
            Event::AppointmentRescheduled { staff, .. }
            | Event::AppointmentStatusChanged { staff, .. }
            | Event::AppointmentRetired { staff, .. } => staff.staff_id(),
            Event::LockPlaced { lock } => Some(lock.staff_id),
            Event::LockReleased { staff_id, .. } => Some(*staff_id),
            Event::UnavailabilityAdded { block } => match block.scope {
                UnavailabilityScope::Staff(id) => Some(id),
                UnavailabilityScope::Branch(_) => None,
            },
            Event::UnavailabilityRemoved { scope, .. } => match scope {
                UnavailabilityScope::Staff(id) => Some(*id),
                UnavailabilityScope::Branch(_) => None,
            },
            _ => None,
        }
    }

    /// Branch rule book this event mutates, if any.
    pub fn branch_target(&self) -> Option<Ulid> {
        match self {
            Event::WorkingHoursReplaced { branch_id, .. }
            | Event::WorkingHourRemoved { branch_id, .. }
            | Event::OverrideRemoved { branch_id, .. } => Some(*branch_id),
            Event::WorkingHourAdded { hour } => Some(hour.branch_id),
            Event::OverrideAdded { day } | Event::OverrideUpdated { day } => Some(day.branch_id),
            Event::UnavailabilityAdded { block } => match block.scope {
                UnavailabilityScope::Branch(id) => Some(id),
                UnavailabilityScope::Staff(_) => None,
            },
            Event::UnavailabilityRemoved { scope, .. } => match scope {
                UnavailabilityScope::Branch(id) => Some(*id),
                UnavailabilityScope::Staff(_) => None,
            },
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // back-to-back
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn span_contains_and_clamp() {
        let outer = Span::new(100, 400);
        assert!(outer.contains_span(&Span::new(150, 300)));
        assert!(outer.contains_span(&outer));
        assert!(!outer.contains_span(&Span::new(50, 200)));
        assert_eq!(outer.clamp_to(&Span::new(50, 200)), Some(Span::new(100, 200)));
        assert_eq!(outer.clamp_to(&Span::new(400, 500)), None);
    }

    #[test]
    fn calendar_helpers() {
        let d = date(2024, 3, 4); // a Monday
        assert_eq!(weekday_number(d), 1);
        assert_eq!(weekday_number(date(2024, 3, 3)), 0);
        let nine = at(d, NaiveTime::from_hms_opt(9, 0, 0).unwrap());
        assert_eq!(nine - day_span(d).start, 9 * HOUR_MS);
        assert_eq!(date_of(nine), Some(d));
        assert_eq!(day_span(d).duration_ms(), DAY_MS);
    }

    #[test]
    fn status_machine() {
        use AppointmentStatus::*;
        assert!(Pending.can_transition_to(Confirmed));
        assert!(Confirmed.can_transition_to(Completed));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Confirmed.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Pending));
        assert!(Completed.is_terminal() && Cancelled.is_terminal());
        assert!(!Pending.is_terminal() && !Confirmed.is_terminal());
    }

    #[test]
    fn event_targets() {
        let staff = Ulid::new();
        let branch = Ulid::new();
        let staff_block = Event::UnavailabilityAdded {
            block: Unavailability {
                id: Ulid::new(),
                scope: UnavailabilityScope::Staff(staff),
                date: date(2024, 3, 4),
                reason: "sick".into(),
            },
        };
        assert_eq!(staff_block.staff_target(), Some(staff));
        assert_eq!(staff_block.branch_target(), None);

        let closure = Event::UnavailabilityRemoved {
            id: Ulid::new(),
            scope: UnavailabilityScope::Branch(branch),
            date: date(2024, 3, 4),
        };
        assert_eq!(closure.staff_target(), None);
        assert_eq!(closure.branch_target(), Some(branch));

        let unassigned = Event::AppointmentStatusChanged {
            id: Ulid::new(),
            staff: StaffAssignment::Unassigned,
            status: AppointmentStatus::Cancelled,
            at: 0,
        };
        assert_eq!(unassigned.staff_target(), None);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::OverrideAdded {
            day: WorkingDayOverride {
                id: Ulid::new(),
                branch_id: Ulid::new(),
                date: date(2024, 12, 24),
                rule: DayOverride::Open {
                    start: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
                    end: NaiveTime::from_hms_opt(14, 0, 0).unwrap(),
                },
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
