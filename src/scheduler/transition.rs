//! Decides what the rank-1 requester of a machine should be told.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::scheduler::entry::QueueEntry;
use crate::scheduler::event::QueueEvent;
use crate::scheduler::machine::{Machine, MachineId, MachineStatus};

/// Why a rank-1 requester cannot start yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum OnDeckReason {
    MachineRunning,
    MachineMaintenance,
    MachineCooldown { available_at: Option<DateTime<Utc>> },
    MachineUnavailable,
}

impl OnDeckReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            OnDeckReason::MachineRunning => "machine_running",
            OnDeckReason::MachineMaintenance => "machine_maintenance",
            OnDeckReason::MachineCooldown { .. } => "machine_cooldown",
            OnDeckReason::MachineUnavailable => "machine_unavailable",
        }
    }

    pub fn available_at(&self) -> Option<DateTime<Utc>> {
        match self {
            OnDeckReason::MachineCooldown { available_at } => *available_at,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Notice {
    ReadyForCheckIn,
    OnDeck(OnDeckReason),
}

/// Maps raw machine state to a notice.
///
/// Takes status and availability separately rather than a [`Machine`] so the
/// maintenance branch wins even if a caller hands in `available = true`.
pub fn classify(
    status: MachineStatus,
    available: bool,
    available_at: Option<DateTime<Utc>>,
) -> Notice {
    match status {
        MachineStatus::Maintenance => Notice::OnDeck(OnDeckReason::MachineMaintenance),
        MachineStatus::Running => Notice::OnDeck(OnDeckReason::MachineRunning),
        MachineStatus::Cooldown => Notice::OnDeck(OnDeckReason::MachineCooldown { available_at }),
        MachineStatus::Idle if available => Notice::ReadyForCheckIn,
        MachineStatus::Idle => Notice::OnDeck(OnDeckReason::MachineUnavailable),
    }
}

/// Owns the single last-notified table, one row per machine.
#[derive(Debug, Default)]
pub struct TransitionEvaluator {
    last_notified: HashMap<MachineId, (Uuid, Notice)>,
}

impl TransitionEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-evaluates a machine after a status change or queue mutation.
    ///
    /// Emits a notice when the rank-1 occupant changed or its notice differs
    /// from the one last sent. An empty queue clears the machine's row.
    pub fn evaluate(&mut self, machine: &Machine, head: Option<&QueueEntry>) -> Option<QueueEvent> {
        let Some(head) = head else {
            self.last_notified.remove(&machine.id);
            return None;
        };

        let notice = classify(
            machine.status(),
            machine.is_available(),
            machine.estimated_available_at(),
        );

        if let Some((entry_id, last)) = self.last_notified.get(&machine.id) {
            if *entry_id == head.id && *last == notice {
                tracing::debug!(
                    machine_id = machine.id,
                    entry_id = %head.id,
                    "Rank-1 notice unchanged, not re-sending"
                );
                return None;
            }
        }

        self.last_notified.insert(machine.id, (head.id, notice));
        tracing::info!(
            machine_id = machine.id,
            entry_id = %head.id,
            notice = ?notice,
            "Rank-1 notice"
        );
        Some(QueueEvent::from_notice(head, &notice))
    }

    pub fn last_notified(&self, machine_id: MachineId) -> Option<(Uuid, Notice)> {
        self.last_notified.get(&machine_id).copied()
    }

    pub fn forget(&mut self, machine_id: MachineId) {
        self.last_notified.remove(&machine_id);
    }
}
