use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::scheduler::machine::{Axis, FieldDirection, MachineId, TemperatureRange};

/// Longest measurement a single entry may book: one year.
pub const MAX_DURATION_HOURS: f64 = 24.0 * 365.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Queued,
    Running,
    Completed,
    Cancelled,
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryStatus::Queued => write!(f, "queued"),
            EntryStatus::Running => write!(f, "running"),
            EntryStatus::Completed => write!(f, "completed"),
            EntryStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Field needed along one axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldRequirement {
    pub tesla: f64,
    #[serde(default)]
    pub direction: FieldDirection,
}

impl FieldRequirement {
    pub fn new(tesla: f64, direction: FieldDirection) -> Self {
        Self { tesla, direction }
    }
}

/// What a requester needs from a machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequirementSpec {
    pub min_kelvin: f64,
    /// Upper bound of the measurement range. `None` means only `min_kelvin`.
    #[serde(default)]
    pub max_kelvin: Option<f64>,
    #[serde(default)]
    pub field_x: Option<FieldRequirement>,
    #[serde(default)]
    pub field_y: Option<FieldRequirement>,
    #[serde(default)]
    pub field_z: Option<FieldRequirement>,
    #[serde(default)]
    pub dc_lines: u32,
    #[serde(default)]
    pub rf_lines: u32,
    #[serde(default)]
    pub daughterboard: Option<String>,
    /// Captured for the record; optical access is not matched on.
    #[serde(default)]
    pub requires_optical: bool,
    pub duration_hours: f64,
    #[serde(default)]
    pub rush: bool,
    #[serde(default)]
    pub rush_justification: Option<String>,
}

impl RequirementSpec {
    pub fn new(min_kelvin: f64, duration_hours: f64) -> Self {
        Self {
            min_kelvin,
            max_kelvin: None,
            field_x: None,
            field_y: None,
            field_z: None,
            dc_lines: 0,
            rf_lines: 0,
            daughterboard: None,
            requires_optical: false,
            duration_hours,
            rush: false,
            rush_justification: None,
        }
    }

    pub fn with_max_kelvin(mut self, max_kelvin: f64) -> Self {
        self.max_kelvin = Some(max_kelvin);
        self
    }

    pub fn with_field(mut self, axis: Axis, tesla: f64, direction: FieldDirection) -> Self {
        let requirement = Some(FieldRequirement::new(tesla, direction));
        match axis {
            Axis::X => self.field_x = requirement,
            Axis::Y => self.field_y = requirement,
            Axis::Z => self.field_z = requirement,
        }
        self
    }

    pub fn with_dc_lines(mut self, dc_lines: u32) -> Self {
        self.dc_lines = dc_lines;
        self
    }

    pub fn with_rf_lines(mut self, rf_lines: u32) -> Self {
        self.rf_lines = rf_lines;
        self
    }

    pub fn with_daughterboard(mut self, daughterboard: impl Into<String>) -> Self {
        self.daughterboard = Some(daughterboard.into());
        self
    }

    pub fn with_optical(mut self) -> Self {
        self.requires_optical = true;
        self
    }

    pub fn with_rush(mut self, justification: impl Into<String>) -> Self {
        self.rush = true;
        self.rush_justification = Some(justification.into());
        self
    }

    pub fn field(&self, axis: Axis) -> Option<&FieldRequirement> {
        match axis {
            Axis::X => self.field_x.as_ref(),
            Axis::Y => self.field_y.as_ref(),
            Axis::Z => self.field_z.as_ref(),
        }
    }

    pub fn temperature_range(&self) -> TemperatureRange {
        TemperatureRange::new(
            self.min_kelvin,
            self.max_kelvin.unwrap_or(self.min_kelvin),
        )
    }

    /// Rejects specs that could never be scheduled meaningfully.
    pub fn validate(&self) -> Result<()> {
        if !self.duration_hours.is_finite() || self.duration_hours <= 0.0 {
            return Err(SchedulerError::InvalidRequest(format!(
                "duration must be a positive number of hours, got {}",
                self.duration_hours
            )));
        }
        if self.duration_hours > MAX_DURATION_HOURS {
            return Err(SchedulerError::InvalidRequest(format!(
                "duration of {} hours exceeds the {} hour limit",
                self.duration_hours, MAX_DURATION_HOURS
            )));
        }
        if !self.min_kelvin.is_finite() || self.min_kelvin < 0.0 {
            return Err(SchedulerError::InvalidRequest(format!(
                "minimum temperature must be a non-negative number of Kelvin, got {}",
                self.min_kelvin
            )));
        }
        if let Some(max) = self.max_kelvin {
            if !max.is_finite() || max < self.min_kelvin {
                return Err(SchedulerError::InvalidRequest(format!(
                    "maximum temperature {}K is below minimum {}K",
                    max, self.min_kelvin
                )));
            }
        }
        for axis in Axis::ALL {
            if let Some(field) = self.field(axis) {
                if !field.tesla.is_finite() || field.tesla < 0.0 {
                    return Err(SchedulerError::InvalidRequest(format!(
                        "{} field must be a non-negative number of Tesla, got {}",
                        axis, field.tesla
                    )));
                }
            }
        }
        Ok(())
    }
}

/// A submission as handed to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub requester: String,
    pub title: String,
    pub requirement: RequirementSpec,
}

impl SubmitRequest {
    pub fn new(
        requester: impl Into<String>,
        title: impl Into<String>,
        requirement: RequirementSpec,
    ) -> Self {
        Self {
            requester: requester.into(),
            title: title.into(),
            requirement,
        }
    }
}

/// A requirement spec bound to a machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: Uuid,
    pub requester: String,
    pub title: String,
    pub requirement: RequirementSpec,
    pub machine_id: MachineId,
    pub status: EntryStatus,
    /// 1-based rank among the machine's queued entries. `None` once the entry
    /// leaves the queue.
    pub position: Option<u32>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub estimated_start: Option<DateTime<Utc>>,
    /// A rush appeal filed after submission that an operator has not decided on.
    pub rush_pending: bool,
}

impl QueueEntry {
    pub fn new(request: SubmitRequest, machine_id: MachineId, submitted_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            requester: request.requester,
            title: request.title,
            requirement: request.requirement,
            machine_id,
            status: EntryStatus::Queued,
            position: None,
            submitted_at,
            started_at: None,
            completed_at: None,
            estimated_start: None,
            rush_pending: false,
        }
    }

    pub fn is_queued(&self) -> bool {
        self.status == EntryStatus::Queued
    }

    pub fn is_rush(&self) -> bool {
        self.requirement.rush
    }
}
