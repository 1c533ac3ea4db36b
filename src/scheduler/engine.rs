//! The scheduling engine: per-machine queues behind their own locks, a
//! read-only snapshot per machine, and the event stream.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex, MutexGuard, RwLock};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{ConfigError, Result, SchedulerError};
use crate::scheduler::assigner::{Candidate, MachineAssigner, Selection};
use crate::scheduler::clock::{Clock, SystemClock};
use crate::scheduler::compat;
use crate::scheduler::entry::{EntryStatus, QueueEntry, RequirementSpec, SubmitRequest};
use crate::scheduler::estimate;
use crate::scheduler::event::QueueEvent;
use crate::scheduler::machine::{Machine, MachineId, MachineStatus};
use crate::scheduler::queue::MachineQueue;
use crate::scheduler::transition::TransitionEvaluator;

/// Last committed view of one machine. Served to readers without locking.
#[derive(Debug, Clone, Serialize)]
pub struct MachineSnapshot {
    pub machine: Machine,
    /// Queued entries in rank order.
    pub queue: Vec<QueueEntry>,
    pub running: Option<QueueEntry>,
    /// Completed and cancelled entries, oldest first.
    pub history: Vec<QueueEntry>,
}

impl MachineSnapshot {
    fn capture(queue: &MachineQueue) -> Self {
        Self {
            machine: queue.machine().clone(),
            queue: queue.queued().cloned().collect(),
            running: queue.running().cloned(),
            history: queue
                .history()
                .into_iter()
                .filter(|e| e.status != EntryStatus::Running)
                .cloned()
                .collect(),
        }
    }

    pub fn find(&self, entry_id: &Uuid) -> Option<&QueueEntry> {
        self.queue
            .iter()
            .chain(self.running.iter())
            .chain(self.history.iter())
            .find(|e| e.id == *entry_id)
    }

    fn queued_durations(&self) -> Vec<f64> {
        self.queue
            .iter()
            .map(|e| e.requirement.duration_hours)
            .collect()
    }
}

struct MachineSlot {
    state: Mutex<MachineQueue>,
    snapshot: watch::Sender<Arc<MachineSnapshot>>,
}

impl MachineSlot {
    fn new(machine: Machine) -> Self {
        let queue = MachineQueue::new(machine);
        let (snapshot, _) = watch::channel(Arc::new(MachineSnapshot::capture(&queue)));
        Self {
            state: Mutex::new(queue),
            snapshot,
        }
    }
}

/// A mutation that passed validation and is ready to be written back.
struct Staged {
    queue: MachineQueue,
    events: Vec<QueueEvent>,
}

/// Owns every machine queue and serializes mutations per machine.
///
/// Mutations lock one machine (two for a reassignment, in ascending id
/// order), work on a copy of its queue and only write the copy back once
/// positions, estimates and invariants check out. Reads go through the
/// machine's snapshot channel and never touch the lock.
pub struct Scheduler {
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    assigner: MachineAssigner,
    machines: BTreeMap<MachineId, MachineSlot>,
    index: RwLock<HashMap<Uuid, MachineId>>,
    evaluator: Mutex<TransitionEvaluator>,
    events: broadcast::Sender<QueueEvent>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, machines: Vec<Machine>) -> std::result::Result<Self, ConfigError> {
        Self::with_clock(config, machines, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: SchedulerConfig,
        machines: Vec<Machine>,
        clock: Arc<dyn Clock>,
    ) -> std::result::Result<Self, ConfigError> {
        if machines.is_empty() {
            return Err(ConfigError::EmptyFleet);
        }
        let mut slots = BTreeMap::new();
        for machine in machines {
            machine.validate()?;
            let id = machine.id;
            if slots.insert(id, MachineSlot::new(machine)).is_some() {
                return Err(ConfigError::DuplicateMachine(id));
            }
        }
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        tracing::info!(machines = slots.len(), "Scheduler initialized");
        Ok(Self {
            assigner: MachineAssigner::new(config.skip_unavailable),
            config,
            clock,
            machines: slots,
            index: RwLock::new(HashMap::new()),
            evaluator: Mutex::new(TransitionEvaluator::new()),
            events,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    pub fn machine_ids(&self) -> Vec<MachineId> {
        self.machines.keys().copied().collect()
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn snapshot(&self, machine_id: MachineId) -> Result<Arc<MachineSnapshot>> {
        Ok(self.slot(machine_id)?.snapshot.borrow().clone())
    }

    /// Every machine's snapshot, in machine-id order.
    pub fn snapshots(&self) -> Vec<Arc<MachineSnapshot>> {
        self.machines
            .values()
            .map(|slot| slot.snapshot.borrow().clone())
            .collect()
    }

    pub async fn entry(&self, entry_id: Uuid) -> Result<QueueEntry> {
        let machine_id = self.locate(entry_id).await?;
        if let Some(entry) = self.snapshot(machine_id)?.find(&entry_id) {
            return Ok(entry.clone());
        }
        // Reassigned between the index read and the snapshot read.
        let moved_to = self.locate(entry_id).await?;
        if moved_to == machine_id {
            return Err(SchedulerError::EntryNotFound(entry_id));
        }
        self.snapshot(moved_to)?
            .find(&entry_id)
            .cloned()
            .ok_or(SchedulerError::EntryNotFound(entry_id))
    }

    /// Ids of every machine whose capabilities satisfy `requirement`,
    /// regardless of availability.
    pub fn compatible_machines(&self, requirement: &RequirementSpec) -> Result<Vec<MachineId>> {
        requirement.validate()?;
        let snapshots = self.snapshots();
        let durations: Vec<Vec<f64>> = snapshots.iter().map(|s| s.queued_durations()).collect();
        Ok(self
            .assigner
            .compatible(requirement, candidates(&snapshots, &durations)))
    }

    /// Where a request would be placed if submitted now. Nothing is queued.
    pub fn preview(&self, requirement: &RequirementSpec) -> Result<Selection> {
        requirement.validate()?;
        let snapshots = self.snapshots();
        let durations: Vec<Vec<f64>> = snapshots.iter().map(|s| s.queued_durations()).collect();
        Ok(self.assigner.select(
            requirement,
            candidates(&snapshots, &durations),
            self.clock.now(),
        )?)
    }

    // =========================================================================
    // Queue Mutations
    // =========================================================================

    /// Validates, picks the machine with the earliest projected start and
    /// queues the request there.
    pub async fn submit(&self, request: SubmitRequest) -> Result<QueueEntry> {
        if request.title.trim().is_empty() {
            return Err(SchedulerError::InvalidRequest(
                "title must not be empty".to_string(),
            ));
        }
        if request.requester.trim().is_empty() {
            return Err(SchedulerError::InvalidRequest(
                "requester must not be empty".to_string(),
            ));
        }
        let selection = self.preview(&request.requirement)?;
        let machine_id = selection.machine_id;

        let mut guard = self.lock(machine_id).await?;
        if self.config.skip_unavailable && !guard.machine().accepts_submissions() {
            // Went unavailable between selection and locking.
            tracing::warn!(machine_id, "Selected machine stopped accepting submissions");
            return Err(SchedulerError::Conflict { machine_id });
        }

        let now = self.clock.now();
        let entry = QueueEntry::new(request, machine_id, now);
        let entry_id = entry.id;
        let mut queue = guard.clone();
        queue.insert(entry)?;
        let staged = self.prepare(&guard, queue, Some(entry_id), Vec::new(), now)?;
        self.index.write().await.insert(entry_id, machine_id);
        self.apply(&mut guard, staged).await;

        let entry = committed(&guard, entry_id)?;
        tracing::info!(
            entry_id = %entry_id,
            machine_id,
            requester = %entry.requester,
            position = ?entry.position,
            rush = entry.is_rush(),
            "Entry submitted"
        );
        Ok(entry)
    }

    /// Cancels a queued entry. `actor` is recorded in the emitted event only.
    pub async fn cancel(&self, entry_id: Uuid, actor: &str) -> Result<QueueEntry> {
        let (machine_id, mut guard) = self.lock_entry(entry_id).await?;
        let now = self.clock.now();
        let mut queue = guard.clone();
        queue.cancel(&entry_id)?;
        let cancelled = committed(&queue, entry_id)?;
        let events = vec![QueueEvent::cancelled(&cancelled, actor)];
        let staged = self.prepare(&guard, queue, None, events, now)?;
        self.apply(&mut guard, staged).await;
        tracing::info!(entry_id = %entry_id, machine_id, actor, "Entry cancelled");
        committed(&guard, entry_id)
    }

    pub async fn move_up(&self, entry_id: Uuid) -> Result<QueueEntry> {
        self.reorder(entry_id, "move_up", |queue| queue.move_up(&entry_id))
            .await
    }

    pub async fn move_down(&self, entry_id: Uuid) -> Result<QueueEntry> {
        self.reorder(entry_id, "move_down", |queue| queue.move_down(&entry_id))
            .await
    }

    /// Places an entry at `target` (1-based). Targets past the end land last.
    pub async fn set_position(&self, entry_id: Uuid, target: u32) -> Result<QueueEntry> {
        self.reorder(entry_id, "set_position", |queue| {
            queue
                .set_position(&entry_id, target)
                .map(|moved| moved.is_some())
        })
        .await
    }

    /// Moves a queued entry to another machine, at its tail (or head for a
    /// rush entry). Never falls back to a different machine.
    pub async fn reassign(&self, entry_id: Uuid, to: MachineId) -> Result<QueueEntry> {
        self.slot(to)?;
        let from = self.locate(entry_id).await?;
        if from == to {
            let guard = self.lock(from).await?;
            return committed(&guard, entry_id);
        }

        let (low, high) = (from.min(to), from.max(to));
        let low_guard = self.lock(low).await?;
        let high_guard = self.lock(high).await?;
        let (mut from_guard, mut to_guard) = if from == low {
            (low_guard, high_guard)
        } else {
            (high_guard, low_guard)
        };
        if from_guard.entry(&entry_id).is_none() {
            tracing::warn!(entry_id = %entry_id, machine_id = from, "Entry relocated while waiting for lock");
            return Err(SchedulerError::Conflict { machine_id: from });
        }

        let now = self.clock.now();
        let mut source = from_guard.clone();
        let entry = source.take(&entry_id)?;
        if let Err(reason) = compat::check(&entry.requirement, &to_guard.machine().capabilities) {
            return Err(SchedulerError::IncompatibleReassignment {
                entry_id,
                machine_id: to,
                reason,
            });
        }
        let mut target = to_guard.clone();
        target.insert(entry)?;

        let source = self.prepare(&from_guard, source, None, Vec::new(), now)?;
        let mut target = self.prepare(&to_guard, target, Some(entry_id), Vec::new(), now)?;
        let moved = committed(&target.queue, entry_id)?;
        target.events.insert(0, QueueEvent::reassigned(&moved, from));

        // The index never points at a snapshot that lacks the entry.
        self.apply(&mut to_guard, target).await;
        self.index.write().await.insert(entry_id, to);
        self.apply(&mut from_guard, source).await;
        tracing::info!(
            entry_id = %entry_id,
            from,
            to,
            position = ?moved.position,
            "Entry reassigned"
        );
        Ok(moved)
    }

    // =========================================================================
    // Machine Lifecycle
    // =========================================================================

    /// Applies a status change reported by the operator or the instrument.
    /// Maintenance always forces the machine unavailable.
    pub async fn on_machine_status_changed(
        &self,
        machine_id: MachineId,
        status: MachineStatus,
        available: bool,
    ) -> Result<Machine> {
        let mut guard = self.lock(machine_id).await?;
        if let Some(running) = guard.running() {
            if matches!(status, MachineStatus::Idle | MachineStatus::Cooldown) {
                return Err(SchedulerError::InvalidTransition {
                    entry_id: running.id,
                    detail: format!(
                        "machine {} cannot become {} while the entry is running, check it out first",
                        machine_id, status
                    ),
                });
            }
        }
        let now = self.clock.now();
        let mut queue = guard.clone();
        let machine = queue.machine_mut();
        if machine.set_status(status, available) {
            tracing::warn!(machine_id, "Maintenance requested as available, forcing unavailable");
        }
        match status {
            MachineStatus::Idle | MachineStatus::Maintenance => {
                machine.set_estimated_available_at(None);
            }
            MachineStatus::Cooldown => {
                let stale = machine
                    .estimated_available_at()
                    .map_or(true, |at| at <= now);
                if stale {
                    let at = estimate::after(now, machine.cooldown_hours)?;
                    machine.set_estimated_available_at(Some(at));
                }
            }
            MachineStatus::Running => {}
        }

        let staged = self.prepare(&guard, queue, None, Vec::new(), now)?;
        self.apply(&mut guard, staged).await;
        let machine = guard.machine().clone();
        tracing::info!(
            machine_id,
            status = %machine.status(),
            available = machine.is_available(),
            "Machine status changed"
        );
        Ok(machine)
    }

    /// Starts the rank-1 entry on its machine.
    pub async fn check_in(&self, entry_id: Uuid) -> Result<QueueEntry> {
        let (machine_id, mut guard) = self.lock_entry(entry_id).await?;
        let machine = guard.machine();
        if machine.status() == MachineStatus::Maintenance {
            return Err(SchedulerError::InvalidTransition {
                entry_id,
                detail: format!("machine {} is in maintenance", machine_id),
            });
        }
        if !machine.is_available() {
            return Err(SchedulerError::InvalidTransition {
                entry_id,
                detail: format!("machine {} is unavailable", machine_id),
            });
        }

        let now = self.clock.now();
        let mut queue = guard.clone();
        queue.start(&entry_id, now)?;
        let duration = queue
            .entry(&entry_id)
            .map(|e| e.requirement.duration_hours)
            .unwrap_or_default();
        let machine = queue.machine_mut();
        let available = machine.is_available();
        machine.set_status(MachineStatus::Running, available);
        let busy_until = estimate::after(estimate::after(now, duration)?, machine.cooldown_hours)?;
        machine.set_estimated_available_at(Some(busy_until));

        let staged = self.prepare(&guard, queue, None, Vec::new(), now)?;
        self.apply(&mut guard, staged).await;
        tracing::info!(entry_id = %entry_id, machine_id, busy_until = %busy_until, "Checked in");
        committed(&guard, entry_id)
    }

    /// Completes a running entry and moves the machine to cooldown, idle or,
    /// if it was marked unavailable meanwhile, maintenance.
    pub async fn check_out(&self, entry_id: Uuid) -> Result<QueueEntry> {
        let (machine_id, mut guard) = self.lock_entry(entry_id).await?;
        let now = self.clock.now();
        let mut queue = guard.clone();
        queue.finish(&entry_id, now)?;
        let machine = queue.machine_mut();
        if !machine.is_available() {
            machine.set_status(MachineStatus::Maintenance, false);
            machine.set_estimated_available_at(None);
        } else if machine.cooldown_hours > 0.0 {
            machine.set_status(MachineStatus::Cooldown, true);
            let at = estimate::after(now, machine.cooldown_hours)?;
            machine.set_estimated_available_at(Some(at));
        } else {
            machine.set_status(MachineStatus::Idle, true);
            machine.set_estimated_available_at(None);
        }
        let status = machine.status();

        let staged = self.prepare(&guard, queue, None, Vec::new(), now)?;
        self.apply(&mut guard, staged).await;
        tracing::info!(entry_id = %entry_id, machine_id, status = %status, "Checked out");
        committed(&guard, entry_id)
    }

    /// Reverts a check-in: the entry goes back to rank 1 and the machine to
    /// idle. Refused while the machine is in maintenance.
    pub async fn undo_check_in(&self, entry_id: Uuid) -> Result<QueueEntry> {
        let (machine_id, mut guard) = self.lock_entry(entry_id).await?;
        if guard.machine().status() == MachineStatus::Maintenance {
            return Err(SchedulerError::InvalidTransition {
                entry_id,
                detail: format!("machine {} is in maintenance", machine_id),
            });
        }
        let now = self.clock.now();
        let mut queue = guard.clone();
        queue.unstart(&entry_id)?;
        let machine = queue.machine_mut();
        let available = machine.is_available();
        machine.set_status(MachineStatus::Idle, available);
        machine.set_estimated_available_at(None);

        let staged = self.prepare(&guard, queue, None, Vec::new(), now)?;
        self.apply(&mut guard, staged).await;
        tracing::info!(entry_id = %entry_id, machine_id, "Check-in undone");
        committed(&guard, entry_id)
    }

    // =========================================================================
    // Rush Appeals
    // =========================================================================

    /// Files a rush appeal for an already queued entry. The entry keeps its
    /// rank until an operator approves.
    pub async fn request_rush(&self, entry_id: Uuid, justification: &str) -> Result<QueueEntry> {
        if justification.trim().is_empty() {
            return Err(SchedulerError::InvalidRequest(
                "rush justification must not be empty".to_string(),
            ));
        }
        let (machine_id, mut guard) = self.lock_entry(entry_id).await?;
        let now = self.clock.now();
        let mut queue = guard.clone();
        queue.set_rush_pending(&entry_id, true, Some(justification.to_string()))?;
        let staged = self.prepare(&guard, queue, None, Vec::new(), now)?;
        self.apply(&mut guard, staged).await;
        tracing::info!(entry_id = %entry_id, machine_id, "Rush requested");
        committed(&guard, entry_id)
    }

    pub async fn approve_rush(&self, entry_id: Uuid) -> Result<QueueEntry> {
        self.settle_rush(entry_id, true).await
    }

    pub async fn reject_rush(&self, entry_id: Uuid) -> Result<QueueEntry> {
        self.settle_rush(entry_id, false).await
    }

    async fn settle_rush(&self, entry_id: Uuid, approved: bool) -> Result<QueueEntry> {
        let (machine_id, mut guard) = self.lock_entry(entry_id).await?;
        let now = self.clock.now();
        let mut queue = guard.clone();
        queue.resolve_rush(&entry_id, approved)?;
        let staged = self.prepare(&guard, queue, None, Vec::new(), now)?;
        self.apply(&mut guard, staged).await;
        tracing::info!(entry_id = %entry_id, machine_id, approved, "Rush appeal settled");
        committed(&guard, entry_id)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Re-derives positions and estimates for one machine and republishes
    /// its snapshot. Returns whether any stored value changed.
    pub async fn repair_queue(&self, machine_id: MachineId) -> Result<bool> {
        let mut guard = self.lock(machine_id).await?;
        let now = self.clock.now();
        let queue = guard.clone();
        let staged = self.prepare(&guard, queue, None, Vec::new(), now)?;
        let changed = guard
            .queued()
            .zip(staged.queue.queued())
            .any(|(old, new)| {
                old.id != new.id
                    || old.position != new.position
                    || old.estimated_start != new.estimated_start
            });
        self.apply(&mut guard, staged).await;
        tracing::info!(machine_id, changed, "Queue repaired");
        Ok(changed)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn slot(&self, machine_id: MachineId) -> Result<&MachineSlot> {
        self.machines
            .get(&machine_id)
            .ok_or(SchedulerError::MachineNotFound(machine_id))
    }

    async fn locate(&self, entry_id: Uuid) -> Result<MachineId> {
        self.index
            .read()
            .await
            .get(&entry_id)
            .copied()
            .ok_or(SchedulerError::EntryNotFound(entry_id))
    }

    async fn lock(&self, machine_id: MachineId) -> Result<MutexGuard<'_, MachineQueue>> {
        let slot = self.slot(machine_id)?;
        match tokio::time::timeout(self.config.lock_timeout, slot.state.lock()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                tracing::warn!(
                    machine_id,
                    timeout_ms = self.config.lock_timeout.as_millis() as u64,
                    "Timed out waiting for machine queue lock"
                );
                Err(SchedulerError::Conflict { machine_id })
            }
        }
    }

    /// Locks the machine currently holding `entry_id`. The index is read
    /// without any machine lock held, so the entry may have moved by the time
    /// the lock is granted; that surfaces as a conflict.
    async fn lock_entry(&self, entry_id: Uuid) -> Result<(MachineId, MutexGuard<'_, MachineQueue>)> {
        let machine_id = self.locate(entry_id).await?;
        let guard = self.lock(machine_id).await?;
        if guard.entry(&entry_id).is_none() {
            tracing::warn!(entry_id = %entry_id, machine_id, "Entry relocated while waiting for lock");
            return Err(SchedulerError::Conflict { machine_id });
        }
        Ok((machine_id, guard))
    }

    async fn reorder<F>(&self, entry_id: Uuid, op: &'static str, mutate: F) -> Result<QueueEntry>
    where
        F: FnOnce(&mut MachineQueue) -> Result<bool>,
    {
        let (machine_id, mut guard) = self.lock_entry(entry_id).await?;
        let mut queue = guard.clone();
        if !mutate(&mut queue)? {
            tracing::debug!(entry_id = %entry_id, machine_id, op, "Ordering unchanged");
            return committed(&guard, entry_id);
        }
        let now = self.clock.now();
        let staged = self.prepare(&guard, queue, None, Vec::new(), now)?;
        self.apply(&mut guard, staged).await;
        let entry = committed(&guard, entry_id)?;
        tracing::info!(
            entry_id = %entry_id,
            machine_id,
            op,
            position = ?entry.position,
            "Entry moved"
        );
        Ok(entry)
    }

    /// Recomputes the staged queue, checks it and collects the position
    /// change events against the currently committed ranks. `inserted` is
    /// left out of those events.
    fn prepare(
        &self,
        current: &MachineQueue,
        mut queue: MachineQueue,
        inserted: Option<Uuid>,
        mut events: Vec<QueueEvent>,
        now: DateTime<Utc>,
    ) -> Result<Staged> {
        queue.recompute(now)?;
        queue.check_invariants()?;

        let before = current.ranks();
        let skip: HashSet<Uuid> = inserted.into_iter().collect();
        for entry in queue.queued() {
            let (Some(&old), Some(new)) = (before.get(&entry.id), entry.position) else {
                continue;
            };
            if old != new && !skip.contains(&entry.id) {
                events.push(QueueEvent::position_changed(entry, old, new));
            }
        }
        Ok(Staged { queue, events })
    }

    /// Writes a prepared queue back, runs the rank-1 evaluation, publishes
    /// the snapshot and emits events. Infallible once reached.
    async fn apply(&self, guard: &mut MachineQueue, staged: Staged) {
        let Staged { queue, mut events } = staged;
        {
            let mut evaluator = self.evaluator.lock().await;
            if let Some(notice) = evaluator.evaluate(queue.machine(), queue.head()) {
                events.push(notice);
            }
        }
        *guard = queue;

        if let Some(slot) = self.machines.get(&guard.machine().id) {
            slot.snapshot
                .send_replace(Arc::new(MachineSnapshot::capture(guard)));
        }
        for event in events {
            // No subscribers is fine; the events are advisory.
            let _ = self.events.send(event);
        }
    }
}

fn candidates<'a>(
    snapshots: &'a [Arc<MachineSnapshot>],
    durations: &'a [Vec<f64>],
) -> impl Iterator<Item = Candidate<'a>> {
    snapshots.iter().zip(durations).map(|(s, d)| Candidate {
        machine: &s.machine,
        queued_durations: d,
    })
}

fn committed(queue: &MachineQueue, entry_id: Uuid) -> Result<QueueEntry> {
    queue
        .entry(&entry_id)
        .cloned()
        .ok_or(SchedulerError::EntryNotFound(entry_id))
}
