//! Serde data file structs for layout definitions.
//!
//! These structs define the on-disk format for the track network, engine
//! configuration and timetable. They are deserialized from RON, JSON, or
//! TOML data files and then resolved into engine types by the layout loader.
//! Lengths and distances are plain numbers here; the loader converts them to
//! fixed-point.

use interlock_core::config::TieBreak;
use interlock_core::network::{Direction, SectionKind};
use serde::Deserialize;

fn default_true() -> bool {
    true
}

fn default_ahead() -> Direction {
    Direction::Ahead
}

fn default_kind() -> SectionKind {
    SectionKind::Normal
}

// ===========================================================================
// Network: Sections and links
// ===========================================================================

/// A track section in a data file.
#[derive(Debug, Clone, Deserialize)]
pub struct SectionData {
    pub name: String,
    #[serde(default = "default_kind")]
    pub kind: SectionKind,
    pub length: f64,
    /// Initial alignment of a junction or crossover.
    #[serde(default)]
    pub default_alignment: u8,
}

/// A connection between two section ends.
#[derive(Debug, Clone, Deserialize)]
pub struct LinkData {
    pub from: String,
    #[serde(default = "default_ahead")]
    pub from_dir: Direction,
    pub to: String,
    #[serde(default = "default_ahead")]
    pub to_dir: Direction,
}

/// A section traversed in one direction.
#[derive(Debug, Clone, Deserialize)]
pub struct PinData {
    pub section: String,
    #[serde(default = "default_ahead")]
    pub direction: Direction,
}

// ===========================================================================
// Network: Signals
// ===========================================================================

/// A signal in a data file. Placed at the exit of `section` when
/// travelling in `direction`.
#[derive(Debug, Clone, Deserialize)]
pub struct SignalData {
    pub name: String,
    pub section: String,
    #[serde(default = "default_ahead")]
    pub direction: Direction,
    #[serde(default = "default_true")]
    pub allow_partial_route: bool,
    #[serde(default)]
    pub allow_partial_clear: bool,
    #[serde(default)]
    pub claim_lock: bool,
    #[serde(default)]
    pub approach_control: Option<ApproachData>,
    #[serde(default)]
    pub force_propagation_on_approach_control: bool,
    /// Signals ahead that must be cleared; defaults to one.
    #[serde(default)]
    pub clear_ahead: Option<u8>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApproachData {
    pub distance: f64,
    #[serde(default)]
    pub max_speed: Option<f64>,
}

// ===========================================================================
// Network: Deadlock groups
// ===========================================================================

/// One alternative path through a single-track group.
#[derive(Debug, Clone, Deserialize)]
pub struct AlternativeData {
    pub sections: Vec<PinData>,
    /// Usable length when shorter than the sum of section lengths.
    #[serde(default)]
    pub usable_length: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeadlockGroupData {
    pub name: String,
    pub paths: Vec<AlternativeData>,
}

// ===========================================================================
// Network: Pools
// ===========================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct StorageData {
    pub name: String,
    pub access_path: Vec<PinData>,
    pub length: f64,
    /// Turntable angle (degrees) that lines up with this track.
    #[serde(default)]
    pub turntable_angle: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TurntableData {
    pub section: String,
    pub approach_clearance: f64,
    pub release_clearance: f64,
    /// Degrees per tick.
    pub speed: f64,
    #[serde(default)]
    pub initial_angle: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolData {
    pub name: String,
    pub storage: Vec<StorageData>,
    #[serde(default)]
    pub turntable: Option<TurntableData>,
    #[serde(default)]
    pub access_signal: Option<String>,
}

/// The contents of `network.{ron,json,toml}`.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkData {
    pub sections: Vec<SectionData>,
    #[serde(default)]
    pub links: Vec<LinkData>,
    #[serde(default)]
    pub signals: Vec<SignalData>,
    #[serde(default)]
    pub deadlock_groups: Vec<DeadlockGroupData>,
    #[serde(default)]
    pub pools: Vec<PoolData>,
}

// ===========================================================================
// Config
// ===========================================================================

/// The contents of `config.{ron,json,toml}`. Unset fields keep the engine
/// defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigData {
    /// Fixed step length in ticks. Absent means one step per advance.
    pub fixed_timestep: Option<u64>,
    pub tie_break: Option<TieBreak>,
    pub connection_timeout: Option<u64>,
    pub standard_signal_clearance: Option<f64>,
    pub closeup_signal_clearance: Option<f64>,
    pub max_claim_distance: Option<f64>,
    pub max_propagation: Option<u8>,
    pub event_capacity: Option<usize>,
}

// ===========================================================================
// Timetable
// ===========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopFlagData {
    HoldSignal,
    NoWait,
    NoClaim,
    CloseupSignal,
    Closeup,
    RestrictPlatformToSignal,
    ExtendPlatformToSignal,
    Terminal,
    ExitSignal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionData {
    pub train: String,
    #[serde(default)]
    pub max_wait: Option<u64>,
}

/// A scheduled stop. Times are in ticks.
#[derive(Debug, Clone, Deserialize)]
pub struct StopData {
    pub station: String,
    pub platform: String,
    #[serde(default)]
    pub platform_start: f64,
    /// Defaults to the platform section's length.
    #[serde(default)]
    pub platform_end: Option<f64>,
    #[serde(default)]
    pub exit_signal: Option<String>,
    #[serde(default)]
    pub signal_offset: Option<f64>,
    #[serde(default)]
    pub arrival: u64,
    #[serde(default)]
    pub departure: u64,
    #[serde(default)]
    pub min_stop: u64,
    #[serde(default)]
    pub boarding_time: u64,
    #[serde(default)]
    pub flags: Vec<StopFlagData>,
    #[serde(default)]
    pub connections: Vec<ConnectionData>,
}

/// A train service in `timetable.{ron,json,toml}`.
#[derive(Debug, Clone, Deserialize)]
pub struct TrainData {
    pub name: String,
    pub length: f64,
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub stops: Vec<StopData>,
}
