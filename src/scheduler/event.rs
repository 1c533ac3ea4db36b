//! Events handed to the notification collaborator.
//!
//! The engine decides *what* a requester should hear about; rendering,
//! delivery and per-user preferences happen downstream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::scheduler::entry::QueueEntry;
use crate::scheduler::machine::MachineId;
use crate::scheduler::transition::Notice;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ReadyForCheckIn,
    OnDeck,
    QueuePositionChanged,
    Cancelled,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::ReadyForCheckIn => write!(f, "ready_for_check_in"),
            EventKind::OnDeck => write!(f, "on_deck"),
            EventKind::QueuePositionChanged => write!(f, "queue_position_changed"),
            EventKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEvent {
    pub entry_id: Uuid,
    pub requester: String,
    pub kind: EventKind,
    pub reason: String,
    pub machine_id: MachineId,
    pub new_position: Option<u32>,
    pub available_at: Option<DateTime<Utc>>,
    /// False for notices the collaborator must deliver regardless of the
    /// requester's preferences.
    pub suppressible: bool,
}

impl QueueEvent {
    /// The rank-1 notice for `entry`.
    pub fn from_notice(entry: &QueueEntry, notice: &Notice) -> Self {
        let (kind, reason, available_at, suppressible) = match notice {
            Notice::ReadyForCheckIn => (
                EventKind::ReadyForCheckIn,
                "machine_ready".to_string(),
                None,
                false,
            ),
            Notice::OnDeck(reason) => (
                EventKind::OnDeck,
                reason.as_str().to_string(),
                reason.available_at(),
                true,
            ),
        };
        Self {
            entry_id: entry.id,
            requester: entry.requester.clone(),
            kind,
            reason,
            machine_id: entry.machine_id,
            new_position: Some(1),
            available_at,
            suppressible,
        }
    }

    pub fn position_changed(entry: &QueueEntry, old: u32, new: u32) -> Self {
        Self {
            entry_id: entry.id,
            requester: entry.requester.clone(),
            kind: EventKind::QueuePositionChanged,
            reason: format!("moved from position {} to {}", old, new),
            machine_id: entry.machine_id,
            new_position: Some(new),
            available_at: None,
            suppressible: true,
        }
    }

    pub fn reassigned(entry: &QueueEntry, from: MachineId) -> Self {
        Self {
            entry_id: entry.id,
            requester: entry.requester.clone(),
            kind: EventKind::QueuePositionChanged,
            reason: format!(
                "reassigned from machine {} to machine {}",
                from, entry.machine_id
            ),
            machine_id: entry.machine_id,
            new_position: entry.position,
            available_at: None,
            suppressible: true,
        }
    }

    pub fn cancelled(entry: &QueueEntry, actor: &str) -> Self {
        Self {
            entry_id: entry.id,
            requester: entry.requester.clone(),
            kind: EventKind::Cancelled,
            reason: format!("cancelled by {}", actor),
            machine_id: entry.machine_id,
            new_position: None,
            available_at: None,
            suppressible: true,
        }
    }
}

/// Logs every emitted event until shutdown. Stands in for a delivery service.
pub async fn log_events(mut rx: broadcast::Receiver<QueueEvent>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            received = rx.recv() => match received {
                Ok(event) => {
                    tracing::info!(
                        entry_id = %event.entry_id,
                        requester = %event.requester,
                        machine_id = event.machine_id,
                        kind = %event.kind,
                        reason = %event.reason,
                        new_position = ?event.new_position,
                        suppressible = event.suppressible,
                        "Queue event"
                    );
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event logger fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}
