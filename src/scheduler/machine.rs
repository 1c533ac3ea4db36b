use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub type MachineId = u64;

/// Operating status of a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineStatus {
    Idle,
    Running,
    Cooldown,
    Maintenance,
}

impl std::fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MachineStatus::Idle => write!(f, "idle"),
            MachineStatus::Running => write!(f, "running"),
            MachineStatus::Cooldown => write!(f, "cooldown"),
            MachineStatus::Maintenance => write!(f, "maintenance"),
        }
    }
}

/// Magnetic field orientation relative to the sample plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldDirection {
    #[default]
    None,
    Parallel,
    Perpendicular,
    ParallelAndPerpendicular,
}

impl FieldDirection {
    /// Whether a machine offering `self` can serve a request for `requested`.
    pub fn satisfies(self, requested: FieldDirection) -> bool {
        match requested {
            FieldDirection::None => true,
            FieldDirection::Parallel => matches!(
                self,
                FieldDirection::Parallel | FieldDirection::ParallelAndPerpendicular
            ),
            FieldDirection::Perpendicular => matches!(
                self,
                FieldDirection::Perpendicular | FieldDirection::ParallelAndPerpendicular
            ),
            FieldDirection::ParallelAndPerpendicular => {
                self == FieldDirection::ParallelAndPerpendicular
            }
        }
    }
}

impl std::fmt::Display for FieldDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldDirection::None => write!(f, "none"),
            FieldDirection::Parallel => write!(f, "parallel"),
            FieldDirection::Perpendicular => write!(f, "perpendicular"),
            FieldDirection::ParallelAndPerpendicular => write!(f, "parallel_and_perpendicular"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];
}

impl std::fmt::Display for Axis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Axis::X => write!(f, "X"),
            Axis::Y => write!(f, "Y"),
            Axis::Z => write!(f, "Z"),
        }
    }
}

/// What a machine can do along one field axis.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AxisCapability {
    pub max_tesla: f64,
    #[serde(default)]
    pub directions: FieldDirection,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FieldCapability {
    #[serde(default)]
    pub x: AxisCapability,
    #[serde(default)]
    pub y: AxisCapability,
    #[serde(default)]
    pub z: AxisCapability,
}

impl FieldCapability {
    pub fn axis(&self, axis: Axis) -> &AxisCapability {
        match axis {
            Axis::X => &self.x,
            Axis::Y => &self.y,
            Axis::Z => &self.z,
        }
    }

    pub fn axis_mut(&mut self, axis: Axis) -> &mut AxisCapability {
        match axis {
            Axis::X => &mut self.x,
            Axis::Y => &mut self.y,
            Axis::Z => &mut self.z,
        }
    }
}

/// Optical access. Recorded for display only; never used when matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpticalCapability {
    #[default]
    None,
    Available,
    WithWork,
    UnderConstruction,
}

/// Closed temperature interval in Kelvin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemperatureRange {
    pub min_kelvin: f64,
    pub max_kelvin: f64,
}

impl TemperatureRange {
    pub fn new(min_kelvin: f64, max_kelvin: f64) -> Self {
        Self {
            min_kelvin,
            max_kelvin,
        }
    }

    /// True when `other` lies entirely within `self`.
    pub fn covers(&self, other: &TemperatureRange) -> bool {
        self.min_kelvin <= other.min_kelvin && other.max_kelvin <= self.max_kelvin
    }
}

impl std::fmt::Display for TemperatureRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}K-{}K", self.min_kelvin, self.max_kelvin)
    }
}

/// Static capabilities of a machine. These never change while the engine runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    pub temperature: TemperatureRange,
    #[serde(default)]
    pub field: FieldCapability,
    #[serde(default)]
    pub dc_lines: u32,
    #[serde(default)]
    pub rf_lines: u32,
    /// Free-text tag, e.g. "QBoard II". Empty when the machine has none.
    #[serde(default)]
    pub daughterboard: String,
    #[serde(default)]
    pub optical: OpticalCapability,
}

impl Capabilities {
    pub fn new(temperature: TemperatureRange) -> Self {
        Self {
            temperature,
            field: FieldCapability::default(),
            dc_lines: 0,
            rf_lines: 0,
            daughterboard: String::new(),
            optical: OpticalCapability::None,
        }
    }

    pub fn with_field(mut self, axis: Axis, max_tesla: f64, directions: FieldDirection) -> Self {
        *self.field.axis_mut(axis) = AxisCapability {
            max_tesla,
            directions,
        };
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
        self.daughterboard = daughterboard.into();
        self
    }

    pub fn with_optical(mut self, optical: OpticalCapability) -> Self {
        self.optical = optical;
        self
    }
}

/// A physical instrument that requests are queued against.
///
/// Status and availability are private so that every write goes through
/// [`Machine::set_status`], which keeps "maintenance implies unavailable"
/// true. Deserialization routes through the same check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "MachineRecord")]
pub struct Machine {
    pub id: MachineId,
    pub name: String,
    pub capabilities: Capabilities,
    pub cooldown_hours: f64,
    status: MachineStatus,
    available: bool,
    estimated_available_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct MachineRecord {
    id: MachineId,
    name: String,
    capabilities: Capabilities,
    #[serde(default)]
    cooldown_hours: f64,
    #[serde(default = "default_status")]
    status: MachineStatus,
    #[serde(default = "default_available")]
    available: bool,
    #[serde(default)]
    estimated_available_at: Option<DateTime<Utc>>,
}

fn default_status() -> MachineStatus {
    MachineStatus::Idle
}

fn default_available() -> bool {
    true
}

impl From<MachineRecord> for Machine {
    fn from(record: MachineRecord) -> Self {
        let mut machine = Machine::new(
            record.id,
            record.name,
            record.capabilities,
            record.cooldown_hours,
        );
        machine.set_status(record.status, record.available);
        machine.estimated_available_at = record.estimated_available_at;
        machine
    }
}

impl Machine {
    /// Creates an idle, available machine.
    pub fn new(
        id: MachineId,
        name: impl Into<String>,
        capabilities: Capabilities,
        cooldown_hours: f64,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            capabilities,
            cooldown_hours,
            status: MachineStatus::Idle,
            available: true,
            estimated_available_at: None,
        }
    }

    /// Checks the static configuration: a non-negative finite cooldown, a
    /// well-ordered temperature range and non-negative field limits.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |detail: String| ConfigError::InvalidMachine {
            id: self.id,
            detail,
        };
        if !self.cooldown_hours.is_finite() || self.cooldown_hours < 0.0 {
            return Err(invalid(format!(
                "cooldown must be a non-negative number of hours, got {}",
                self.cooldown_hours
            )));
        }
        let range = &self.capabilities.temperature;
        if !range.min_kelvin.is_finite() || !range.max_kelvin.is_finite() || range.min_kelvin < 0.0 {
            return Err(invalid(format!("temperature range {} is not physical", range)));
        }
        if range.min_kelvin > range.max_kelvin {
            return Err(invalid(format!(
                "temperature range {} has minimum above maximum",
                range
            )));
        }
        for axis in Axis::ALL {
            let max_tesla = self.capabilities.field.axis(axis).max_tesla;
            if !max_tesla.is_finite() || max_tesla < 0.0 {
                return Err(invalid(format!(
                    "{} field limit must be a non-negative number of Tesla, got {}",
                    axis, max_tesla
                )));
            }
        }
        Ok(())
    }

    /// Builder form of [`Machine::set_status`].
    pub fn with_status(mut self, status: MachineStatus, available: bool) -> Self {
        self.set_status(status, available);
        self
    }

    pub fn with_estimated_available_at(mut self, at: DateTime<Utc>) -> Self {
        self.estimated_available_at = Some(at);
        self
    }

    pub fn status(&self) -> MachineStatus {
        self.status
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn estimated_available_at(&self) -> Option<DateTime<Utc>> {
        self.estimated_available_at
    }

    pub fn set_estimated_available_at(&mut self, at: Option<DateTime<Utc>>) {
        self.estimated_available_at = at;
    }

    /// Sets status and availability together. Maintenance always forces the
    /// machine unavailable; returns true when the requested availability was
    /// overridden for that reason.
    pub fn set_status(&mut self, status: MachineStatus, available: bool) -> bool {
        let coerced = status == MachineStatus::Maintenance && available;
        self.status = status;
        self.available = available && status != MachineStatus::Maintenance;
        coerced
    }

    /// Idle and available: the rank-1 entry may check in right now.
    pub fn is_ready(&self) -> bool {
        self.status == MachineStatus::Idle && self.available
    }

    /// Whether new submissions may be routed here.
    pub fn accepts_submissions(&self) -> bool {
        self.available && self.status != MachineStatus::Maintenance
    }
}
