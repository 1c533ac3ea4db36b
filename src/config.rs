use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::scheduler::machine::Machine;

/// Tuning knobs for the scheduling engine.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How long a mutation waits for a machine's queue lock before giving up
    /// with a conflict.
    pub lock_timeout: Duration,
    /// Capacity of the event broadcast channel. Slow subscribers past this
    /// lag and miss events.
    pub event_buffer: usize,
    /// Skip unavailable and maintenance machines when placing new requests.
    pub skip_unavailable: bool,
    /// Attempts made by callers that retry conflicting mutations.
    pub conflict_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(2),
            event_buffer: 1024,
            skip_unavailable: true,
            conflict_retries: 3,
        }
    }
}

impl SchedulerConfig {
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    pub fn with_event_buffer(mut self, event_buffer: usize) -> Self {
        self.event_buffer = event_buffer;
        self
    }

    pub fn with_skip_unavailable(mut self, skip_unavailable: bool) -> Self {
        self.skip_unavailable = skip_unavailable;
        self
    }

    pub fn with_conflict_retries(mut self, conflict_retries: u32) -> Self {
        self.conflict_retries = conflict_retries;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub fleet_path: PathBuf,
    pub scheduler: SchedulerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            fleet_path: PathBuf::from("fleet.json"),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn new(listen_addr: SocketAddr, fleet_path: impl Into<PathBuf>) -> Self {
        Self {
            listen_addr,
            fleet_path: fleet_path.into(),
            ..Default::default()
        }
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }
}

/// On-disk shape of a fleet file: `{ "machines": [ ... ] }`.
#[derive(Debug, Deserialize)]
struct FleetFile {
    machines: Vec<Machine>,
}

/// Parses a fleet from JSON text. `path` is only used in error messages.
pub fn parse_fleet(text: &str, path: &Path) -> Result<Vec<Machine>, ConfigError> {
    let fleet: FleetFile = serde_json::from_str(text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    if fleet.machines.is_empty() {
        return Err(ConfigError::EmptyFleet);
    }
    let mut seen = HashSet::new();
    for machine in &fleet.machines {
        if !seen.insert(machine.id) {
            return Err(ConfigError::DuplicateMachine(machine.id));
        }
        machine.validate()?;
    }
    Ok(fleet.machines)
}

/// Reads and validates the machine fleet file.
pub fn load_fleet(path: &Path) -> Result<Vec<Machine>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let machines = parse_fleet(&text, path)?;
    tracing::info!(path = %path.display(), machines = machines.len(), "Loaded fleet");
    Ok(machines)
}
