use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::error::Result;
use crate::scheduler::compat::{self, Incompatibility};
use crate::scheduler::entry::RequirementSpec;
use crate::scheduler::estimate;
use crate::scheduler::machine::{Machine, MachineId};

/// A machine as seen by the selector: its live state plus the durations of
/// what is already queued on it, in rank order.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub machine: &'a Machine,
    pub queued_durations: &'a [f64],
}

/// Where a new entry would go.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Selection {
    pub machine_id: MachineId,
    pub estimated_start: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectReason {
    /// Marked unavailable or in maintenance.
    Unavailable,
    Incompatible { detail: Incompatibility },
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::Unavailable => write!(f, "machine is unavailable"),
            RejectReason::Incompatible { detail } => write!(f, "{}", detail),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    pub machine_id: MachineId,
    pub machine_name: String,
    pub reason: RejectReason,
}

/// No machine can take the request. An expected outcome, not a fault.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[error("No compatible machine for request ({} machines rejected)", .rejections.len())]
pub struct NoMatch {
    /// One entry per machine, in machine-id order.
    pub rejections: Vec<Rejection>,
}

/// Picks the machine with the earliest projected start for new requests.
#[derive(Debug, Clone, Copy)]
pub struct MachineAssigner {
    skip_unavailable: bool,
}

impl Default for MachineAssigner {
    fn default() -> Self {
        Self::new(true)
    }
}

impl MachineAssigner {
    pub fn new(skip_unavailable: bool) -> Self {
        Self { skip_unavailable }
    }

    /// Filters every candidate, simulates appending the request to each
    /// compatible queue and keeps the earliest start. Ties go to the lowest
    /// machine id.
    pub fn select<'a>(
        &self,
        requirement: &RequirementSpec,
        candidates: impl IntoIterator<Item = Candidate<'a>>,
        now: DateTime<Utc>,
    ) -> Result<Selection> {
        let mut best: Option<Selection> = None;
        let mut rejections = Vec::new();

        for candidate in candidates {
            let machine = candidate.machine;
            if self.skip_unavailable && !machine.accepts_submissions() {
                rejections.push(Rejection {
                    machine_id: machine.id,
                    machine_name: machine.name.clone(),
                    reason: RejectReason::Unavailable,
                });
                continue;
            }
            if let Err(detail) = compat::check(requirement, &machine.capabilities) {
                rejections.push(Rejection {
                    machine_id: machine.id,
                    machine_name: machine.name.clone(),
                    reason: RejectReason::Incompatible { detail },
                });
                continue;
            }

            let start = estimate::tail_start(machine, candidate.queued_durations, now)?;
            let better = match &best {
                None => true,
                Some(current) => {
                    (start, machine.id) < (current.estimated_start, current.machine_id)
                }
            };
            if better {
                best = Some(Selection {
                    machine_id: machine.id,
                    estimated_start: start,
                });
            }
        }

        match best {
            Some(selection) => {
                tracing::debug!(
                    machine_id = selection.machine_id,
                    estimated_start = %selection.estimated_start,
                    rejected = rejections.len(),
                    "Machine selected"
                );
                Ok(selection)
            }
            None => {
                rejections.sort_by_key(|r| r.machine_id);
                Err(NoMatch { rejections }.into())
            }
        }
    }

    /// Ids of every candidate passing the compatibility filter, ignoring
    /// availability.
    pub fn compatible<'a>(
        &self,
        requirement: &RequirementSpec,
        candidates: impl IntoIterator<Item = Candidate<'a>>,
    ) -> Vec<MachineId> {
        let mut ids: Vec<MachineId> = candidates
            .into_iter()
            .filter(|c| compat::is_compatible(requirement, &c.machine.capabilities))
            .map(|c| c.machine.id)
            .collect();
        ids.sort_unstable();
        ids
    }
}
