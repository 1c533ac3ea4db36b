//! Compatibility filter between a requirement spec and a machine.
//!
//! Checks run in a fixed order so the reported failure is reproducible:
//! temperature, then field strength and direction per axis (X, Y, Z), then DC
//! lines, RF lines and finally daughterboard. Optical access is deliberately
//! not checked.

use serde::Serialize;
use thiserror::Error;

use crate::scheduler::entry::RequirementSpec;
use crate::scheduler::machine::{Axis, Capabilities, FieldDirection, TemperatureRange};

/// The first criterion a machine failed.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "criterion", rename_all = "snake_case")]
pub enum Incompatibility {
    #[error("temperature range {available} does not cover requested {requested}")]
    Temperature {
        available: TemperatureRange,
        requested: TemperatureRange,
    },

    #[error("{axis} field of {available} T is below the requested {required} T")]
    FieldStrength {
        axis: Axis,
        available: f64,
        required: f64,
    },

    #[error("{axis} field direction {available} cannot provide {required}")]
    FieldDirection {
        axis: Axis,
        available: FieldDirection,
        required: FieldDirection,
    },

    #[error("{available} DC lines, {required} requested")]
    DcLines { available: u32, required: u32 },

    #[error("{available} RF lines, {required} requested")]
    RfLines { available: u32, required: u32 },

    #[error("daughterboard {available:?} does not match requested {required:?}")]
    Daughterboard { available: String, required: String },
}

impl Incompatibility {
    pub fn criterion(&self) -> &'static str {
        match self {
            Incompatibility::Temperature { .. } => "temperature",
            Incompatibility::FieldStrength { .. } => "field_strength",
            Incompatibility::FieldDirection { .. } => "field_direction",
            Incompatibility::DcLines { .. } => "dc_lines",
            Incompatibility::RfLines { .. } => "rf_lines",
            Incompatibility::Daughterboard { .. } => "daughterboard",
        }
    }
}

/// Returns the first failing criterion, or `Ok` if the machine can serve the request.
pub fn check(requirement: &RequirementSpec, machine: &Capabilities) -> Result<(), Incompatibility> {
    let requested = requirement.temperature_range();
    if !machine.temperature.covers(&requested) {
        return Err(Incompatibility::Temperature {
            available: machine.temperature,
            requested,
        });
    }

    for axis in Axis::ALL {
        let Some(needed) = requirement.field(axis) else {
            continue;
        };
        let offered = machine.field.axis(axis);
        if offered.max_tesla < needed.tesla {
            return Err(Incompatibility::FieldStrength {
                axis,
                available: offered.max_tesla,
                required: needed.tesla,
            });
        }
        if !offered.directions.satisfies(needed.direction) {
            return Err(Incompatibility::FieldDirection {
                axis,
                available: offered.directions,
                required: needed.direction,
            });
        }
    }

    if machine.dc_lines < requirement.dc_lines {
        return Err(Incompatibility::DcLines {
            available: machine.dc_lines,
            required: requirement.dc_lines,
        });
    }

    if machine.rf_lines < requirement.rf_lines {
        return Err(Incompatibility::RfLines {
            available: machine.rf_lines,
            required: requirement.rf_lines,
        });
    }

    if let Some(board) = &requirement.daughterboard {
        if *board != machine.daughterboard {
            return Err(Incompatibility::Daughterboard {
                available: machine.daughterboard.clone(),
                required: board.clone(),
            });
        }
    }

    Ok(())
}

pub fn is_compatible(requirement: &RequirementSpec, machine: &Capabilities) -> bool {
    check(requirement, machine).is_ok()
}
