pub mod assigner;
pub mod clock;
pub mod compat;
pub mod engine;
pub mod entry;
pub mod estimate;
pub mod event;
pub mod machine;
pub mod queue;
pub mod retry;
pub mod transition;

pub use assigner::{MachineAssigner, NoMatch, RejectReason, Rejection, Selection};
pub use clock::{Clock, ManualClock, SystemClock};
pub use compat::Incompatibility;
pub use engine::{MachineSnapshot, Scheduler};
pub use entry::{EntryStatus, FieldRequirement, QueueEntry, RequirementSpec, SubmitRequest};
pub use event::{EventKind, QueueEvent};
pub use machine::{
    Axis, AxisCapability, Capabilities, FieldCapability, FieldDirection, Machine, MachineId,
    MachineStatus, OpticalCapability, TemperatureRange,
};
pub use queue::MachineQueue;
pub use retry::retry_on_conflict;
pub use transition::{Notice, OnDeckReason, TransitionEvaluator};
