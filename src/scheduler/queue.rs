use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::scheduler::entry::{EntryStatus, QueueEntry};
use crate::scheduler::estimate;
use crate::scheduler::machine::Machine;

/// One machine together with every entry ever assigned to it.
///
/// The queued ordering is an explicit list of entry ids; rank is the index
/// plus one. Entries that left the queue (running, completed, cancelled) stay
/// in the arena for audit but are never in `order`.
///
/// Every mutating method either returns an error without touching state or
/// applies completely. Positions and estimates are only written by
/// [`MachineQueue::recompute`].
#[derive(Debug, Clone)]
pub struct MachineQueue {
    machine: Machine,
    order: Vec<Uuid>,
    entries: HashMap<Uuid, QueueEntry>,
}

impl MachineQueue {
    pub fn new(machine: Machine) -> Self {
        Self {
            machine,
            order: Vec::new(),
            entries: HashMap::new(),
        }
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut Machine {
        &mut self.machine
    }

    /// Queued entry ids in rank order.
    pub fn order(&self) -> &[Uuid] {
        &self.order
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn entry(&self, id: &Uuid) -> Option<&QueueEntry> {
        self.entries.get(id)
    }

    /// Queued entries in rank order.
    pub fn queued(&self) -> impl Iterator<Item = &QueueEntry> {
        self.order.iter().filter_map(|id| self.entries.get(id))
    }

    /// Entries no longer in the queue, oldest submission first.
    pub fn history(&self) -> Vec<&QueueEntry> {
        let mut entries: Vec<&QueueEntry> = self
            .entries
            .values()
            .filter(|e| e.status != EntryStatus::Queued)
            .collect();
        entries.sort_by_key(|e| e.submitted_at);
        entries
    }

    pub fn running(&self) -> Option<&QueueEntry> {
        self.entries
            .values()
            .find(|e| e.status == EntryStatus::Running)
    }

    /// The rank-1 entry.
    pub fn head(&self) -> Option<&QueueEntry> {
        self.order.first().and_then(|id| self.entries.get(id))
    }

    /// 1-based rank of a queued entry.
    pub fn rank_of(&self, id: &Uuid) -> Option<u32> {
        self.order
            .iter()
            .position(|candidate| candidate == id)
            .map(|index| index as u32 + 1)
    }

    /// Current rank of every queued entry.
    pub fn ranks(&self) -> HashMap<Uuid, u32> {
        self.order
            .iter()
            .enumerate()
            .map(|(index, id)| (*id, index as u32 + 1))
            .collect()
    }

    /// Durations of queued entries in rank order.
    pub fn queued_durations(&self) -> Vec<f64> {
        self.queued()
            .map(|e| e.requirement.duration_hours)
            .collect()
    }

    fn queued_index(&self, id: &Uuid) -> Result<usize> {
        let entry = self
            .entries
            .get(id)
            .ok_or(SchedulerError::EntryNotFound(*id))?;
        if entry.status != EntryStatus::Queued {
            return Err(SchedulerError::InvalidPosition {
                entry_id: *id,
                detail: format!("entry is {}, not queued", entry.status),
            });
        }
        self.order
            .iter()
            .position(|candidate| candidate == id)
            .ok_or_else(|| {
                SchedulerError::Internal(format!("queued entry {} missing from ordering", id))
            })
    }

    /// Adds a queued entry at the tail, or at the head when it is a rush job.
    /// Returns the entry's rank.
    pub fn insert(&mut self, mut entry: QueueEntry) -> Result<u32> {
        if self.entries.contains_key(&entry.id) {
            return Err(SchedulerError::Internal(format!(
                "entry {} already assigned to machine {}",
                entry.id, self.machine.id
            )));
        }
        entry.machine_id = self.machine.id;
        entry.status = EntryStatus::Queued;
        let id = entry.id;
        let rank = if entry.is_rush() {
            self.order.insert(0, id);
            1
        } else {
            self.order.push(id);
            self.order.len() as u32
        };
        self.entries.insert(id, entry);
        Ok(rank)
    }

    /// Marks a queued entry cancelled and closes the gap it leaves.
    pub fn cancel(&mut self, id: &Uuid) -> Result<()> {
        let entry = self
            .entries
            .get(id)
            .ok_or(SchedulerError::EntryNotFound(*id))?;
        if entry.status != EntryStatus::Queued {
            return Err(SchedulerError::InvalidTransition {
                entry_id: *id,
                detail: format!("cannot cancel an entry that is {}", entry.status),
            });
        }
        let index = self.queued_index(id)?;
        self.order.remove(index);
        if let Some(entry) = self.entries.get_mut(id) {
            entry.status = EntryStatus::Cancelled;
            entry.position = None;
            entry.estimated_start = None;
        }
        Ok(())
    }

    /// Swaps with the entry above. Returns false when already at rank 1.
    pub fn move_up(&mut self, id: &Uuid) -> Result<bool> {
        let index = self.queued_index(id)?;
        if index == 0 {
            return Ok(false);
        }
        self.order.swap(index, index - 1);
        Ok(true)
    }

    /// Swaps with the entry below. Returns false when already last.
    pub fn move_down(&mut self, id: &Uuid) -> Result<bool> {
        let index = self.queued_index(id)?;
        if index + 1 >= self.order.len() {
            return Ok(false);
        }
        self.order.swap(index, index + 1);
        Ok(true)
    }

    /// Moves an entry to `target` (1-based), shifting the entries in between.
    /// Targets past the end are clamped to the last rank. Returns the rank the
    /// entry ended up at, or `None` if nothing moved.
    pub fn set_position(&mut self, id: &Uuid, target: u32) -> Result<Option<u32>> {
        if target == 0 {
            return Err(SchedulerError::InvalidPosition {
                entry_id: *id,
                detail: "target position must be at least 1".to_string(),
            });
        }
        let index = self.queued_index(id)?;
        let target_index = (target as usize).min(self.order.len()) - 1;
        if target_index == index {
            return Ok(None);
        }
        let moved = self.order.remove(index);
        self.order.insert(target_index, moved);
        Ok(Some(target_index as u32 + 1))
    }

    /// Removes a queued entry from this machine entirely, for relocation.
    pub fn take(&mut self, id: &Uuid) -> Result<QueueEntry> {
        let index = self.queued_index(id)?;
        self.order.remove(index);
        let mut entry = self
            .entries
            .remove(id)
            .ok_or(SchedulerError::EntryNotFound(*id))?;
        entry.position = None;
        entry.estimated_start = None;
        Ok(entry)
    }

    /// Moves the rank-1 entry out of the queue into the running state.
    pub fn start(&mut self, id: &Uuid, now: DateTime<Utc>) -> Result<()> {
        let index = self.queued_index(id)?;
        if index != 0 {
            return Err(SchedulerError::InvalidTransition {
                entry_id: *id,
                detail: format!("only rank 1 can check in, entry is at rank {}", index + 1),
            });
        }
        if let Some(running) = self.running() {
            return Err(SchedulerError::InvalidTransition {
                entry_id: *id,
                detail: format!("machine is already running entry {}", running.id),
            });
        }
        self.order.remove(0);
        if let Some(entry) = self.entries.get_mut(id) {
            entry.status = EntryStatus::Running;
            entry.started_at = Some(now);
            entry.estimated_start = Some(now);
            entry.position = None;
        }
        Ok(())
    }

    /// Completes a running entry.
    pub fn finish(&mut self, id: &Uuid, now: DateTime<Utc>) -> Result<()> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or(SchedulerError::EntryNotFound(*id))?;
        if entry.status != EntryStatus::Running {
            return Err(SchedulerError::InvalidTransition {
                entry_id: *id,
                detail: format!("cannot check out an entry that is {}", entry.status),
            });
        }
        entry.status = EntryStatus::Completed;
        entry.completed_at = Some(now);
        Ok(())
    }

    /// Puts a running entry back at rank 1.
    pub fn unstart(&mut self, id: &Uuid) -> Result<()> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or(SchedulerError::EntryNotFound(*id))?;
        if entry.status != EntryStatus::Running {
            return Err(SchedulerError::InvalidTransition {
                entry_id: *id,
                detail: format!("cannot undo check-in of an entry that is {}", entry.status),
            });
        }
        entry.status = EntryStatus::Queued;
        entry.started_at = None;
        self.order.insert(0, *id);
        Ok(())
    }

    /// Sets or clears a pending rush appeal on a queued entry.
    pub fn set_rush_pending(
        &mut self,
        id: &Uuid,
        pending: bool,
        justification: Option<String>,
    ) -> Result<()> {
        self.queued_index(id)?;
        if let Some(entry) = self.entries.get_mut(id) {
            entry.rush_pending = pending;
            if justification.is_some() {
                entry.requirement.rush_justification = justification;
            }
        }
        Ok(())
    }

    /// Settles a pending rush appeal. Approval marks the entry as rush and
    /// moves it to rank 1; rejection only clears the flag.
    pub fn resolve_rush(&mut self, id: &Uuid, approved: bool) -> Result<()> {
        let index = self.queued_index(id)?;
        let entry = self
            .entries
            .get_mut(id)
            .ok_or(SchedulerError::EntryNotFound(*id))?;
        if !entry.rush_pending {
            return Err(SchedulerError::InvalidTransition {
                entry_id: *id,
                detail: "entry has no pending rush appeal".to_string(),
            });
        }
        entry.rush_pending = false;
        if approved {
            entry.requirement.rush = true;
            let moved = self.order.remove(index);
            self.order.insert(0, moved);
        }
        Ok(())
    }

    /// Rewrites every queued entry's position and estimated start from the
    /// ordering. Always covers the whole queue.
    pub fn recompute(&mut self, now: DateTime<Utc>) -> Result<()> {
        let starts = estimate::project_starts(&self.machine, &self.queued_durations(), now)?;
        for (index, (id, start)) in self.order.iter().zip(starts).enumerate() {
            if let Some(entry) = self.entries.get_mut(id) {
                entry.position = Some(index as u32 + 1);
                entry.estimated_start = Some(start);
            }
        }
        Ok(())
    }

    /// Verifies that queued entries and the ordering agree and that positions
    /// form exactly 1..=N.
    pub fn check_invariants(&self) -> Result<()> {
        let queued = self
            .entries
            .values()
            .filter(|e| e.status == EntryStatus::Queued)
            .count();
        if queued != self.order.len() {
            return Err(SchedulerError::Internal(format!(
                "machine {} has {} queued entries but {} ranked",
                self.machine.id,
                queued,
                self.order.len()
            )));
        }
        for (index, id) in self.order.iter().enumerate() {
            let entry = self.entries.get(id).ok_or_else(|| {
                SchedulerError::Internal(format!("ranked entry {} missing from arena", id))
            })?;
            if entry.status != EntryStatus::Queued || entry.position != Some(index as u32 + 1) {
                return Err(SchedulerError::Internal(format!(
                    "entry {} on machine {} has position {:?}, expected {}",
                    id,
                    self.machine.id,
                    entry.position,
                    index + 1
                )));
            }
        }
        Ok(())
    }
}
