//! The booking core: conflict detection, the booking transaction engine,
//! availability, reservation locks, the status ledger and workload counters.
//!
//! Every mutation is a flat [`Event`] that is appended to the WAL and then
//! applied to three layers:
//! - flat record maps (`DashMap`s), the source of truth for reads and compaction;
//! - a per-staff [`StaffTimeline`] behind an async `RwLock`, whose write guard
//!   serializes check-then-write for that staff member;
//! - a per-branch [`BranchRules`] book behind its own `RwLock`.
//!
//! Lock order is staff timeline before branch rules; nothing takes them the
//! other way round.

mod availability;
mod booking;
mod compact;
mod conflict;
mod error;
mod ledger;
mod locks;
mod queries;
mod schedule;
mod workload;

pub use availability::{SlotCalendar, SlotQuery, merge_overlapping, subtract_intervals};
pub(crate) use conflict::now_ms;
pub use booking::NewAppointment;
pub use error::{EngineError, ErrorKind};
pub use locks::NewLock;
pub use workload::WorkloadSummary;

use std::io;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::config::EngineConfig;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::registry::{Collaborators, StaffInfo};
use crate::state::{BranchRules, Interval, Occupancy, StaffTimeline};
use crate::wal::Wal;

pub type SharedStaffTimeline = Arc<RwLock<StaffTimeline>>;
pub type SharedBranchRules = Arc<RwLock<BranchRules>>;

/// A staff member known to the engine. Branch and tenant never change.
#[derive(Clone)]
pub struct StaffEntry {
    pub branch_id: Ulid,
    pub tenant_id: Ulid,
    pub timeline: SharedStaffTimeline,
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch = vec![(events, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => batch.push((events, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush the batch
                    }
                }

                flush_and_respond(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    let records: usize = batch.iter().map(|(events, _)| events.len()).sum();
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(records as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err = None;
    'outer: for (events, _) in batch {
        for event in events {
            if let Err(e) = wal.append_buffered(event) {
                append_err = Some(e);
                break 'outer;
            }
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { events, response } => {
            let mut batch = vec![(events, response)];
            flush_and_respond(wal, &mut batch);
        }
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    pub(super) config: EngineConfig,
    pub(super) collaborators: Collaborators,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,

    pub(super) staff: DashMap<Ulid, StaffEntry>,
    pub(super) branches: DashMap<Ulid, SharedBranchRules>,

    pub(super) appointments: DashMap<Ulid, Appointment>,
    pub(super) locks: DashMap<Ulid, AppointmentLock>,
    pub(super) working_hours: DashMap<Ulid, WorkingHour>,
    pub(super) overrides: DashMap<Ulid, WorkingDayOverride>,
    pub(super) unavailability: DashMap<Ulid, Unavailability>,
    pub(super) ledger: DashMap<Ulid, Vec<StatusLogEntry>>,
    pub(super) workload: DashMap<(Ulid, NaiveDate), BarberWorkload>,

    /// Serializes mutations of appointments that have no staff timeline.
    pub(super) unassigned_gate: Mutex<()>,
    /// Commits hold it shared; compaction holds it exclusively.
    pub(super) compaction_gate: RwLock<()>,
}

/// Apply a staff-scoped event to a timeline (caller holds the lock).
fn apply_to_staff(ts: &mut StaffTimeline, event: &Event) {
    match event {
        Event::AppointmentCreated {
            appointment,
            consumed_lock,
        } => {
            if let Some(lock_id) = consumed_lock {
                ts.remove_interval(*lock_id);
            }
            if appointment.occupies() {
                ts.insert_interval(Interval {
                    id: appointment.id,
                    span: appointment.span,
                    kind: Occupancy::Appointment,
                });
            }
        }
        Event::AppointmentRescheduled { id, span, .. } => {
            if let Some(mut interval) = ts.remove_interval(*id) {
                interval.span = *span;
                ts.insert_interval(interval);
            }
        }
        Event::AppointmentStatusChanged { id, status, .. } => {
            if status.is_terminal() {
                ts.remove_interval(*id);
            }
        }
        Event::AppointmentRetired { id, .. } | Event::LockReleased { id, .. } => {
            ts.remove_interval(*id);
        }
        Event::LockPlaced { lock } => {
            ts.insert_interval(Interval {
                id: lock.id,
                span: lock.span,
                kind: Occupancy::Lock {
                    expires_at: lock.expires_at,
                },
            });
        }
        Event::UnavailabilityAdded { block } => {
            ts.days_off.insert(block.date, block.clone());
        }
        Event::UnavailabilityRemoved { date, .. } => {
            ts.days_off.remove(date);
        }
        _ => {}
    }
}

/// Apply a branch-scoped event to a rule book (caller holds the lock).
fn apply_to_branch(br: &mut BranchRules, event: &Event) {
    match event {
        Event::WorkingHoursReplaced { hours, .. } => {
            br.weekly = hours.iter().map(|h| (h.weekday, h.clone())).collect();
        }
        Event::WorkingHourAdded { hour } => {
            br.weekly.insert(hour.weekday, hour.clone());
        }
        Event::WorkingHourRemoved { id, .. } => {
            br.weekly.retain(|_, h| h.id != *id);
        }
        Event::OverrideAdded { day } | Event::OverrideUpdated { day } => {
            br.overrides.insert(day.date, day.clone());
        }
        Event::OverrideRemoved { date, .. } => {
            br.overrides.remove(date);
        }
        Event::UnavailabilityAdded { block } => {
            br.closures.insert(block.date, block.clone());
        }
        Event::UnavailabilityRemoved { date, .. } => {
            br.closures.remove(date);
        }
        _ => {}
    }
}

impl Engine {
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> io::Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let wal_path = config.wal_path();
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            config,
            collaborators,
            wal_tx,
            notify: Arc::new(NotifyHub::new()),
            staff: DashMap::new(),
            branches: DashMap::new(),
            appointments: DashMap::new(),
            locks: DashMap::new(),
            working_hours: DashMap::new(),
            overrides: DashMap::new(),
            unavailability: DashMap::new(),
            ledger: DashMap::new(),
            workload: DashMap::new(),
            unassigned_gate: Mutex::new(()),
            compaction_gate: RwLock::new(()),
        };

        // We're the sole owner of every Arc here, so try_write always succeeds.
        // Never use blocking_write: this may run inside an async context.
        for event in &events {
            engine.apply_records(event);
            if let Some(staff_id) = event.staff_target()
                && let Some(entry) = engine.staff_entry(&staff_id)
            {
                let mut guard = entry
                    .timeline
                    .try_write()
                    .map_err(|_| io::Error::other("replay: staff timeline contended"))?;
                apply_to_staff(&mut guard, event);
            }
            if let Some(branch_id) = event.branch_target() {
                let rules = engine.branch_rules(branch_id);
                let mut guard = rules
                    .try_write()
                    .map_err(|_| io::Error::other("replay: branch rules contended"))?;
                apply_to_branch(&mut guard, event);
            }
        }

        tracing::info!(
            events = events.len(),
            appointments = engine.appointments.len(),
            staff = engine.staff.len(),
            "engine state replayed"
        );
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Apply an event to the flat record maps.
    fn apply_records(&self, event: &Event) {
        match event {
            Event::StaffAttached {
                staff_id,
                branch_id,
                tenant_id,
            } => {
                self.staff.entry(*staff_id).or_insert_with(|| StaffEntry {
                    branch_id: *branch_id,
                    tenant_id: *tenant_id,
                    timeline: Arc::new(RwLock::new(StaffTimeline::new(
                        *staff_id, *branch_id, *tenant_id,
                    ))),
                });
            }
            Event::WorkingHoursReplaced { branch_id, hours } => {
                self.working_hours.retain(|_, h| h.branch_id != *branch_id);
                for h in hours {
                    self.working_hours.insert(h.id, h.clone());
                }
            }
            Event::WorkingHourAdded { hour } => {
                self.working_hours.insert(hour.id, hour.clone());
            }
            Event::WorkingHourRemoved { id, .. } => {
                self.working_hours.remove(id);
            }
            Event::OverrideAdded { day } | Event::OverrideUpdated { day } => {
                self.overrides.insert(day.id, day.clone());
            }
            Event::OverrideRemoved { id, .. } => {
                self.overrides.remove(id);
            }
            Event::UnavailabilityAdded { block } => {
                self.unavailability.insert(block.id, block.clone());
            }
            Event::UnavailabilityRemoved { id, .. } => {
                self.unavailability.remove(id);
            }
            Event::AppointmentCreated {
                appointment,
                consumed_lock,
            } => {
                if let Some(lock_id) = consumed_lock {
                    self.locks.remove(lock_id);
                }
                self.appointments.insert(appointment.id, appointment.clone());
            }
            Event::AppointmentRescheduled { id, span, at, .. } => {
                if let Some(mut appt) = self.appointments.get_mut(id) {
                    appt.span = *span;
                    appt.updated_at = *at;
                }
            }
            Event::AppointmentStatusChanged { id, status, at, .. } => {
                if let Some(mut appt) = self.appointments.get_mut(id) {
                    appt.status = *status;
                    appt.updated_at = *at;
                }
            }
            Event::AppointmentRetired { id, at, .. } => {
                if let Some(mut appt) = self.appointments.get_mut(id) {
                    appt.lifecycle = Lifecycle::Retired;
                    appt.updated_at = *at;
                }
            }
            Event::LockPlaced { lock } => {
                self.locks.insert(lock.id, lock.clone());
            }
            Event::LockReleased { id, .. } => {
                self.locks.remove(id);
            }
            Event::StatusLogged { entry } => {
                self.ledger
                    .entry(entry.appointment_id)
                    .or_default()
                    .push(entry.clone());
            }
            Event::WorkloadAdjusted {
                staff_id,
                date,
                appointments_delta,
                minutes_delta,
            } => {
                let mut row = self
                    .workload
                    .entry((*staff_id, *date))
                    .or_insert_with(|| BarberWorkload::zero(*staff_id, *date));
                // Replay must never fail on a logged delta.
                row.appointment_count = row.appointment_count.saturating_add(*appointments_delta);
                row.booked_minutes = row.booked_minutes.saturating_add(*minutes_delta);
            }
        }
    }

    /// Write events to the WAL via the background group-commit writer.
    async fn wal_append(&self, events: Vec<Event>) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Wal(e.to_string()))
    }

    /// WAL-append + apply + notify. `timeline` is the staff guard the caller
    /// holds, if the events touch one.
    pub(super) async fn commit(
        &self,
        mut timeline: Option<&mut StaffTimeline>,
        branch_id: Ulid,
        events: Vec<Event>,
    ) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.read().await;
        self.wal_append(events.clone()).await?;
        for event in &events {
            self.apply_records(event);
            if let Some(ts) = timeline.as_deref_mut() {
                apply_to_staff(ts, event);
            }
            self.notify.send(branch_id, event);
        }
        Ok(())
    }

    /// Like [`commit`](Self::commit) for events scoped to a branch rule book.
    pub(super) async fn commit_branch(
        &self,
        rules: &mut BranchRules,
        events: Vec<Event>,
    ) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.read().await;
        self.wal_append(events.clone()).await?;
        for event in &events {
            self.apply_records(event);
            apply_to_branch(rules, event);
            self.notify.send(rules.id, event);
        }
        Ok(())
    }

    pub fn staff_entry(&self, staff_id: &Ulid) -> Option<StaffEntry> {
        self.staff.get(staff_id).map(|e| e.value().clone())
    }

    /// The shared rule book for a branch, created empty on first use.
    pub(super) fn branch_rules(&self, branch_id: Ulid) -> SharedBranchRules {
        self.branches
            .entry(branch_id)
            .or_insert_with(|| Arc::new(RwLock::new(BranchRules::new(branch_id))))
            .clone()
    }

    /// Copy of a branch's rules, released before returning.
    pub(super) async fn branch_snapshot(&self, branch_id: Ulid) -> BranchRules {
        let Some(rules) = self.branches.get(&branch_id).map(|e| e.value().clone()) else {
            return BranchRules::new(branch_id);
        };
        let guard = rules.read().await;
        guard.clone()
    }

    /// Look up an active staff member in the registry.
    pub(super) async fn resolve_staff(&self, staff_id: Ulid) -> Result<StaffInfo, EngineError> {
        self.collaborators
            .staff
            .staff(staff_id)
            .await?
            .filter(|s| s.lifecycle == Lifecycle::Active)
            .ok_or(EngineError::not_found("staff", staff_id))
    }

    /// Materialize the timeline of a registry-known staff member.
    pub(super) async fn attach_staff(&self, info: &StaffInfo) -> Result<StaffEntry, EngineError> {
        if let Some(entry) = self.staff_entry(&info.id) {
            return Ok(entry);
        }
        let event = Event::StaffAttached {
            staff_id: info.id,
            branch_id: info.branch_id,
            tenant_id: info.tenant_id,
        };
        self.commit(None, info.branch_id, vec![event]).await?;
        self.staff_entry(&info.id)
            .ok_or(EngineError::not_found("staff", info.id))
    }

    /// Resolve and attach in one step.
    pub(super) async fn staff_timeline_write(
        &self,
        staff_id: Ulid,
    ) -> Result<(StaffEntry, OwnedRwLockWriteGuard<StaffTimeline>), EngineError> {
        let entry = match self.staff_entry(&staff_id) {
            Some(entry) => entry,
            None => {
                let info = self.resolve_staff(staff_id).await?;
                self.attach_staff(&info).await?
            }
        };
        let guard = entry.timeline.clone().write_owned().await;
        Ok((entry, guard))
    }
}
