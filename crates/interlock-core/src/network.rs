//! Track network model: the static topology of track circuit sections and
//! the per-section runtime state (reservation, occupancy, claims, junction
//! alignment) that every other part of the engine relies on for
//! section-level exclusivity.
//!
//! The static side is built once through [`NetworkBuilder`] and frozen into
//! an immutable [`TrackNetwork`]. The mutable side lives in
//! [`NetworkState`]; all reservation changes go through its `reserve` /
//! `release` calls.

use crate::deadlock::DeadlockGroupDef;
use crate::fixed::Fixed64;
use crate::id::*;
use crate::pool::PoolDef;
use crate::signal::SignalDef;
use crate::sim::StateHash;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

// ---------------------------------------------------------------------------
// Topology primitives
// ---------------------------------------------------------------------------

/// Direction of travel through a section, relative to its defined
/// orientation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Direction {
    Ahead,
    Reverse,
}

impl Direction {
    /// The opposite direction.
    #[inline]
    pub fn reverse(self) -> Self {
        match self {
            Direction::Ahead => Direction::Reverse,
            Direction::Reverse => Direction::Ahead,
        }
    }

    #[inline]
    pub fn index(self) -> usize {
        match self {
            Direction::Ahead => 0,
            Direction::Reverse => 1,
        }
    }
}

/// What kind of track circuit a section is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SectionKind {
    Normal,
    /// Points. One direction (the facing side) has two exit pins.
    Junction,
    /// Diamond crossing. Each direction has one pin per crossing lane; the
    /// exit lane equals the entry lane.
    Crossover,
    EndOfTrack,
}

/// A directional connection: the section reached, and the direction of
/// travel through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Pin {
    pub section: SectionId,
    pub direction: Direction,
}

impl Pin {
    pub fn new(section: SectionId, direction: Direction) -> Self {
        Self { section, direction }
    }

    /// The same section traversed the other way.
    pub fn reversed(self) -> Self {
        Self {
            section: self.section,
            direction: self.direction.reverse(),
        }
    }
}

/// Static definition of one track circuit section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionDef {
    pub name: String,
    pub kind: SectionKind,
    pub length: Fixed64,
    /// Exit pins per travel direction (indexed by [`Direction::index`]).
    pub pins: [Vec<Pin>; 2],
    /// Alignment a junction starts in.
    pub default_alignment: u8,
}

impl SectionDef {
    /// The direction in which this junction has two exits, if it is one.
    pub fn facing_direction(&self) -> Option<Direction> {
        if self.kind != SectionKind::Junction {
            return None;
        }
        if self.pins[0].len() > 1 {
            Some(Direction::Ahead)
        } else if self.pins[1].len() > 1 {
            Some(Direction::Reverse)
        } else {
            None
        }
    }

    /// Exit pins when travelling in `direction`.
    pub fn exits(&self, direction: Direction) -> &[Pin] {
        &self.pins[direction.index()]
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Malformed or inconsistent static network. Fatal at load time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopologyError {
    #[error("duplicate name '{0}'")]
    DuplicateName(String),
    #[error("section {section:?} has a pin to unknown section {target:?}")]
    DanglingPin { section: SectionId, target: SectionId },
    #[error("link {from:?} -> {to:?} has no reciprocal pin")]
    NonReciprocalLink { from: SectionId, to: SectionId },
    #[error("section {0:?} must have a positive length")]
    NonPositiveLength(SectionId),
    #[error("junction {section:?} is malformed: {reason}")]
    BadJunction { section: SectionId, reason: String },
    #[error("crossover {section:?} is malformed: {reason}")]
    BadCrossover { section: SectionId, reason: String },
    #[error("signal {signal:?} is invalid: {reason}")]
    BadSignal { signal: SignalId, reason: String },
    #[error("deadlock group {group:?} path {path:?} is invalid: {reason}")]
    BadAlternative {
        group: DeadlockId,
        path: PathId,
        reason: String,
    },
    #[error("section {section:?} is in deadlock groups {first:?} and {second:?}")]
    OverlappingGroups {
        section: SectionId,
        first: DeadlockId,
        second: DeadlockId,
    },
    #[error("pool {pool:?} is invalid: {reason}")]
    BadPool { pool: PoolId, reason: String },
    #[error("unknown section {0:?}")]
    UnknownSection(SectionId),
}

/// Section-ownership violations and runtime lookups that fail.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReservationError {
    #[error("section {0:?} is not part of the network")]
    UnknownSection(SectionId),
    #[error("section {section:?} is already reserved by {holder:?}")]
    AlreadyReserved { section: SectionId, holder: TrainId },
    #[error("section {section:?} is occupied by {occupant:?}")]
    Occupied { section: SectionId, occupant: TrainId },
    #[error("{train:?} does not hold section {section:?} (holder {holder:?})")]
    NotOwner {
        section: SectionId,
        train: TrainId,
        holder: Option<TrainId>,
    },
    #[error("repeated release of section {section:?} by {train:?}")]
    InvalidRelease { section: SectionId, train: TrainId },
    #[error("junction {0:?} is locked")]
    JunctionLocked(SectionId),
    #[error("section {section:?} has no alignment {alignment}")]
    InvalidAlignment { section: SectionId, alignment: u8 },
}

// ---------------------------------------------------------------------------
// NetworkBuilder
// ---------------------------------------------------------------------------

/// Builder for the immutable [`TrackNetwork`].
///
/// Sections, links, signals, deadlock groups and pools are registered first;
/// [`NetworkBuilder::build`] validates everything and freezes it.
#[derive(Debug, Default)]
pub struct NetworkBuilder {
    sections: Vec<SectionDef>,
    section_names: HashMap<String, SectionId>,
    signals: Vec<SignalDef>,
    signal_names: HashMap<String, SignalId>,
    deadlocks: Vec<DeadlockGroupDef>,
    pools: Vec<PoolDef>,
    pool_names: HashMap<String, PoolId>,
    duplicate: Option<String>,
}

impl NetworkBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a section. Returns its id.
    pub fn add_section(&mut self, name: &str, kind: SectionKind, length: Fixed64) -> SectionId {
        let id = SectionId(self.sections.len() as u32);
        self.sections.push(SectionDef {
            name: name.to_string(),
            kind,
            length,
            pins: [Vec::new(), Vec::new()],
            default_alignment: 0,
        });
        if self.section_names.insert(name.to_string(), id).is_some() {
            self.duplicate.get_or_insert_with(|| name.to_string());
        }
        id
    }

    /// Link two sections: travelling `from` in `from_dir` leads into `to`
    /// travelling `to_dir`. The reciprocal pin is added automatically. For
    /// junctions, the order of links on the facing side is the branch index.
    pub fn connect(&mut self, from: SectionId, from_dir: Direction, to: SectionId, to_dir: Direction) {
        if let Some(def) = self.sections.get_mut(from.index()) {
            def.pins[from_dir.index()].push(Pin::new(to, to_dir));
        }
        if let Some(def) = self.sections.get_mut(to.index()) {
            def.pins[to_dir.reverse().index()].push(Pin::new(from, from_dir.reverse()));
        }
    }

    /// Set the alignment a junction starts in.
    pub fn set_default_alignment(&mut self, section: SectionId, alignment: u8) {
        if let Some(def) = self.sections.get_mut(section.index()) {
            def.default_alignment = alignment;
        }
    }

    pub fn add_signal(&mut self, def: SignalDef) -> SignalId {
        let id = SignalId(self.signals.len() as u32);
        if self.signal_names.insert(def.name.clone(), id).is_some() {
            self.duplicate.get_or_insert_with(|| def.name.clone());
        }
        self.signals.push(def);
        id
    }

    pub fn add_deadlock_group(&mut self, def: DeadlockGroupDef) -> DeadlockId {
        let id = DeadlockId(self.deadlocks.len() as u32);
        self.deadlocks.push(def);
        id
    }

    pub fn add_pool(&mut self, def: PoolDef) -> PoolId {
        let id = PoolId(self.pools.len() as u32);
        if self.pool_names.insert(def.name.clone(), id).is_some() {
            self.duplicate.get_or_insert_with(|| def.name.clone());
        }
        self.pools.push(def);
        id
    }

    pub fn section_id(&self, name: &str) -> Option<SectionId> {
        self.section_names.get(name).copied()
    }

    pub fn signal_id(&self, name: &str) -> Option<SignalId> {
        self.signal_names.get(name).copied()
    }

    /// Validate and freeze the network.
    pub fn build(self) -> Result<TrackNetwork, TopologyError> {
        if let Some(name) = self.duplicate {
            return Err(TopologyError::DuplicateName(name));
        }
        self.validate_sections()?;

        let mut signal_at_exit = BTreeMap::new();
        for (i, signal) in self.signals.iter().enumerate() {
            let id = SignalId(i as u32);
            let Some(section) = self.sections.get(signal.section.index()) else {
                return Err(TopologyError::BadSignal {
                    signal: id,
                    reason: format!("unknown section {:?}", signal.section),
                });
            };
            if section.exits(signal.direction).is_empty() {
                return Err(TopologyError::BadSignal {
                    signal: id,
                    reason: "no track beyond the signal".to_string(),
                });
            }
            if section.facing_direction() == Some(signal.direction) {
                return Err(TopologyError::BadSignal {
                    signal: id,
                    reason: "signal stands on the facing side of a junction".to_string(),
                });
            }
            if signal_at_exit
                .insert(Pin::new(signal.section, signal.direction), id)
                .is_some()
            {
                return Err(TopologyError::BadSignal {
                    signal: id,
                    reason: "two signals at the same section exit".to_string(),
                });
            }
        }

        let mut section_groups: BTreeMap<SectionId, DeadlockId> = BTreeMap::new();
        for (g, group) in self.deadlocks.iter().enumerate() {
            let gid = DeadlockId(g as u32);
            if group.paths.is_empty() {
                return Err(TopologyError::BadAlternative {
                    group: gid,
                    path: PathId(0),
                    reason: "group has no alternatives".to_string(),
                });
            }
            for (p, path) in group.paths.iter().enumerate() {
                let pid = PathId(p as u32);
                self.validate_contiguous(&path.sections)
                    .map_err(|reason| TopologyError::BadAlternative {
                        group: gid,
                        path: pid,
                        reason,
                    })?;
            }
            for section in group.sections() {
                if let Some(first) = section_groups.insert(section, gid) {
                    return Err(TopologyError::OverlappingGroups {
                        section,
                        first,
                        second: gid,
                    });
                }
            }
        }

        for (p, pool) in self.pools.iter().enumerate() {
            let pid = PoolId(p as u32);
            let bad = |reason: String| TopologyError::BadPool { pool: pid, reason };
            if pool.storage.is_empty() {
                return Err(bad("pool has no storage tracks".to_string()));
            }
            for storage in &pool.storage {
                self.validate_contiguous(&storage.access_path)
                    .map_err(|r| bad(format!("storage '{}': {r}", storage.name)))?;
                if storage.length <= Fixed64::ZERO {
                    return Err(bad(format!("storage '{}' has no length", storage.name)));
                }
            }
            if let Some(signal) = pool.access_signal {
                if signal.index() >= self.signals.len() {
                    return Err(bad(format!("unknown access signal {signal:?}")));
                }
            }
            if let Some(table) = &pool.turntable {
                if table.section.index() >= self.sections.len() {
                    return Err(bad(format!("unknown turntable section {:?}", table.section)));
                }
                if table.speed <= Fixed64::ZERO {
                    return Err(bad("turntable speed must be positive".to_string()));
                }
            }
        }

        let mut network = TrackNetwork {
            sections: self.sections,
            section_names: self.section_names.into_iter().collect(),
            signals: self.signals,
            signal_names: self.signal_names.into_iter().collect(),
            deadlocks: self.deadlocks,
            pools: self.pools,
            pool_names: self.pool_names.into_iter().collect(),
            signal_at_exit,
            section_groups,
            fingerprint: 0,
        };
        network.fingerprint = network.compute_fingerprint();
        Ok(network)
    }

    fn validate_sections(&self) -> Result<(), TopologyError> {
        for (i, def) in self.sections.iter().enumerate() {
            let id = SectionId(i as u32);
            if def.length <= Fixed64::ZERO {
                return Err(TopologyError::NonPositiveLength(id));
            }
            for dir in [Direction::Ahead, Direction::Reverse] {
                for pin in def.exits(dir) {
                    let Some(target) = self.sections.get(pin.section.index()) else {
                        return Err(TopologyError::DanglingPin {
                            section: id,
                            target: pin.section,
                        });
                    };
                    let back = Pin::new(id, dir.reverse());
                    if !target.exits(pin.direction.reverse()).contains(&back) {
                        return Err(TopologyError::NonReciprocalLink {
                            from: id,
                            to: pin.section,
                        });
                    }
                }
            }
            let (ahead, reverse) = (def.pins[0].len(), def.pins[1].len());
            match def.kind {
                SectionKind::Junction => {
                    let shape_ok = (ahead == 2 && reverse == 1) || (ahead == 1 && reverse == 2);
                    if !shape_ok {
                        return Err(TopologyError::BadJunction {
                            section: id,
                            reason: format!("expected 2 facing and 1 trailing pin, got {ahead}/{reverse}"),
                        });
                    }
                    if def.default_alignment > 1 {
                        return Err(TopologyError::BadJunction {
                            section: id,
                            reason: format!("default alignment {} out of range", def.default_alignment),
                        });
                    }
                }
                SectionKind::Crossover => {
                    if ahead != reverse || ahead == 0 || ahead > 2 {
                        return Err(TopologyError::BadCrossover {
                            section: id,
                            reason: format!("lane counts {ahead}/{reverse} do not match"),
                        });
                    }
                }
                SectionKind::Normal | SectionKind::EndOfTrack => {
                    if ahead > 1 || reverse > 1 {
                        return Err(TopologyError::BadJunction {
                            section: id,
                            reason: "plain section with more than one pin per side".to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn validate_contiguous(&self, path: &[Pin]) -> Result<(), String> {
        if path.is_empty() {
            return Err("empty path".to_string());
        }
        for pin in path {
            if pin.section.index() >= self.sections.len() {
                return Err(format!("unknown section {:?}", pin.section));
            }
        }
        for pair in path.windows(2) {
            let def = &self.sections[pair[0].section.index()];
            if !def.exits(pair[0].direction).contains(&pair[1]) {
                return Err(format!(
                    "{:?} does not lead to {:?}",
                    pair[0].section, pair[1].section
                ));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TrackNetwork (immutable)
// ---------------------------------------------------------------------------

/// The frozen static network: sections, signals, deadlock groups and pools.
/// Shared read-only by the engine for the whole session.
#[derive(Debug, Clone)]
pub struct TrackNetwork {
    sections: Vec<SectionDef>,
    section_names: BTreeMap<String, SectionId>,
    signals: Vec<SignalDef>,
    signal_names: BTreeMap<String, SignalId>,
    deadlocks: Vec<DeadlockGroupDef>,
    pools: Vec<PoolDef>,
    pool_names: BTreeMap<String, PoolId>,
    signal_at_exit: BTreeMap<Pin, SignalId>,
    section_groups: BTreeMap<SectionId, DeadlockId>,
    fingerprint: u64,
}

impl TrackNetwork {
    pub fn section(&self, id: SectionId) -> Option<&SectionDef> {
        self.sections.get(id.index())
    }

    pub fn sections(&self) -> &[SectionDef] {
        &self.sections
    }

    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    pub fn section_id(&self, name: &str) -> Option<SectionId> {
        self.section_names.get(name).copied()
    }

    pub fn signal(&self, id: SignalId) -> Option<&SignalDef> {
        self.signals.get(id.index())
    }

    pub fn signals(&self) -> &[SignalDef] {
        &self.signals
    }

    pub fn signal_id(&self, name: &str) -> Option<SignalId> {
        self.signal_names.get(name).copied()
    }

    pub fn deadlock_group(&self, id: DeadlockId) -> Option<&DeadlockGroupDef> {
        self.deadlocks.get(id.index())
    }

    pub fn deadlock_groups(&self) -> &[DeadlockGroupDef] {
        &self.deadlocks
    }

    pub fn pool(&self, id: PoolId) -> Option<&PoolDef> {
        self.pools.get(id.index())
    }

    pub fn pools(&self) -> &[PoolDef] {
        &self.pools
    }

    pub fn pool_id(&self, name: &str) -> Option<PoolId> {
        self.pool_names.get(name).copied()
    }

    /// The signal standing at the exit of `section` when travelling in
    /// `direction`, if any.
    pub fn signal_at_exit(&self, section: SectionId, direction: Direction) -> Option<SignalId> {
        self.signal_at_exit
            .get(&Pin::new(section, direction))
            .copied()
    }

    /// The deadlock group containing `section`. Groups never overlap.
    pub fn group_of(&self, section: SectionId) -> Option<DeadlockId> {
        self.section_groups.get(&section).copied()
    }

    /// Hash of the static topology. Snapshots record it so they can only be
    /// restored against the network they were taken on.
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    fn compute_fingerprint(&self) -> u64 {
        let mut h = StateHash::new();
        h.write_u64(self.sections.len() as u64);
        for def in &self.sections {
            h.write(def.name.as_bytes());
            h.write_u32(def.kind as u32);
            h.write_fixed64(def.length);
            for dir in &def.pins {
                h.write_u32(dir.len() as u32);
                for pin in dir {
                    h.write_u32(pin.section.0);
                    h.write_u32(pin.direction.index() as u32);
                }
            }
        }
        h.write_u64(self.signals.len() as u64);
        for signal in &self.signals {
            h.write(signal.name.as_bytes());
            h.write_u32(signal.section.0);
            h.write_u32(signal.direction.index() as u32);
        }
        h.write_u64(self.deadlocks.len() as u64);
        for group in &self.deadlocks {
            h.write_u32(group.paths.len() as u32);
            for path in &group.paths {
                for pin in &path.sections {
                    h.write_u32(pin.section.0);
                }
            }
        }
        h.write_u64(self.pools.len() as u64);
        for pool in &self.pools {
            h.write(pool.name.as_bytes());
            h.write_u32(pool.storage.len() as u32);
        }
        h.finish()
    }
}

// ---------------------------------------------------------------------------
// Runtime section state
// ---------------------------------------------------------------------------

/// Exclusive right of one train to enter a section in one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub train: TrainId,
    pub direction: Direction,
}

/// Mutable state of one section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionState {
    pub reservation: Option<Reservation>,
    /// Trains physically present. Never holds two distinct trains.
    pub occupancy: Vec<(TrainId, Direction)>,
    /// Trains queued to reserve this section next, oldest first.
    pub claims: Vec<TrainId>,
    /// Current junction alignment (branch index). Unused for other kinds.
    pub alignment: u8,
    /// Signals whose active routes lock this junction.
    pub junction_locks: Vec<SignalId>,
    last_released: Option<TrainId>,
    retry_used: bool,
}

impl SectionState {
    fn new(def: &SectionDef) -> Self {
        Self {
            reservation: None,
            occupancy: Vec::new(),
            claims: Vec::new(),
            alignment: def.default_alignment,
            junction_locks: Vec::new(),
            last_released: None,
            retry_used: false,
        }
    }

    pub fn reserved_by(&self) -> Option<TrainId> {
        self.reservation.map(|r| r.train)
    }

    /// The train occupying this section, if any.
    pub fn occupant(&self) -> Option<TrainId> {
        self.occupancy.first().map(|(t, _)| *t)
    }

    pub fn is_occupied_by_other(&self, train: TrainId) -> bool {
        self.occupancy.iter().any(|(t, _)| *t != train)
    }

    pub fn is_reserved_by_other(&self, train: TrainId) -> bool {
        matches!(self.reservation, Some(r) if r.train != train)
    }

    /// Whether `train` holds this section (reserved or physically present).
    pub fn is_held_by(&self, train: TrainId) -> bool {
        self.reserved_by() == Some(train) || self.occupancy.iter().any(|(t, _)| *t == train)
    }

    pub fn is_free(&self) -> bool {
        self.reservation.is_none() && self.occupancy.is_empty()
    }
}

/// Result of a successful reserve call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReserveOutcome {
    Reserved,
    /// The train already held the section.
    AlreadyHeld,
}

/// Result of a successful release call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseOutcome {
    Released,
    /// Repeated release by the last holder; nothing changed.
    AlreadyReleased,
}

/// All per-section runtime state, indexed by [`SectionId`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkState {
    sections: Vec<SectionState>,
}

impl NetworkState {
    pub fn new(network: &TrackNetwork) -> Self {
        Self {
            sections: network.sections.iter().map(SectionState::new).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn section(&self, id: SectionId) -> Option<&SectionState> {
        self.sections.get(id.index())
    }

    pub fn iter(&self) -> impl Iterator<Item = (SectionId, &SectionState)> {
        self.sections
            .iter()
            .enumerate()
            .map(|(i, s)| (SectionId(i as u32), s))
    }

    fn get_mut(&mut self, id: SectionId) -> Result<&mut SectionState, ReservationError> {
        self.sections
            .get_mut(id.index())
            .ok_or(ReservationError::UnknownSection(id))
    }

    /// Reserve `id` for `train` travelling in `direction`.
    pub fn reserve(
        &mut self,
        id: SectionId,
        train: TrainId,
        direction: Direction,
    ) -> Result<ReserveOutcome, ReservationError> {
        let section = self.get_mut(id)?;
        if let Some(r) = section.reservation {
            if r.train != train {
                return Err(ReservationError::AlreadyReserved {
                    section: id,
                    holder: r.train,
                });
            }
            section.reservation = Some(Reservation { train, direction });
            return Ok(ReserveOutcome::AlreadyHeld);
        }
        if let Some((occupant, _)) = section.occupancy.iter().find(|(t, _)| *t != train) {
            return Err(ReservationError::Occupied {
                section: id,
                occupant: *occupant,
            });
        }
        section.reservation = Some(Reservation { train, direction });
        section.claims.retain(|t| *t != train);
        section.last_released = None;
        section.retry_used = false;
        Ok(ReserveOutcome::Reserved)
    }

    /// Release `train`'s reservation of `id`. One repeated release by the
    /// same train is tolerated as a no-op; a second repeat is an error.
    pub fn release(
        &mut self,
        id: SectionId,
        train: TrainId,
    ) -> Result<ReleaseOutcome, ReservationError> {
        let section = self.get_mut(id)?;
        match section.reservation {
            Some(r) if r.train == train => {
                section.reservation = None;
                section.last_released = Some(train);
                section.retry_used = false;
                Ok(ReleaseOutcome::Released)
            }
            Some(r) => Err(ReservationError::NotOwner {
                section: id,
                train,
                holder: Some(r.train),
            }),
            None if section.last_released == Some(train) => {
                if section.retry_used {
                    Err(ReservationError::InvalidRelease { section: id, train })
                } else {
                    section.retry_used = true;
                    Ok(ReleaseOutcome::AlreadyReleased)
                }
            }
            None => Err(ReservationError::NotOwner {
                section: id,
                train,
                holder: None,
            }),
        }
    }

    /// Mark `train` as physically present in `id`.
    pub fn occupy(
        &mut self,
        id: SectionId,
        train: TrainId,
        direction: Direction,
    ) -> Result<(), ReservationError> {
        let section = self.get_mut(id)?;
        if let Some((occupant, _)) = section.occupancy.iter().find(|(t, _)| *t != train) {
            return Err(ReservationError::Occupied {
                section: id,
                occupant: *occupant,
            });
        }
        section.occupancy.clear();
        section.occupancy.push((train, direction));
        Ok(())
    }

    /// Remove `train` from `id`'s occupancy. Returns whether it was present.
    pub fn vacate(&mut self, id: SectionId, train: TrainId) -> bool {
        let Ok(section) = self.get_mut(id) else {
            return false;
        };
        let before = section.occupancy.len();
        section.occupancy.retain(|(t, _)| *t != train);
        section.occupancy.len() != before
    }

    /// Queue `train` to reserve `id` next. Returns its queue position.
    pub fn claim(&mut self, id: SectionId, train: TrainId) -> Result<usize, ReservationError> {
        let section = self.get_mut(id)?;
        if let Some(pos) = section.claims.iter().position(|t| *t == train) {
            return Ok(pos);
        }
        section.claims.push(train);
        Ok(section.claims.len() - 1)
    }

    /// Drop `train` from `id`'s claim queue.
    pub fn unclaim(&mut self, id: SectionId, train: TrainId) -> bool {
        let Ok(section) = self.get_mut(id) else {
            return false;
        };
        let before = section.claims.len();
        section.claims.retain(|t| *t != train);
        section.claims.len() != before
    }

    /// Whether a junction may be set to `alignment` on behalf of `train`.
    pub fn can_align(&self, id: SectionId, alignment: u8, train: TrainId) -> bool {
        let Some(section) = self.section(id) else {
            return false;
        };
        if section.alignment == alignment {
            return true;
        }
        section.junction_locks.is_empty()
            && !section.is_reserved_by_other(train)
            && !section.is_occupied_by_other(train)
            && section.occupancy.is_empty()
    }

    /// Set a junction's alignment. Fails when the junction is locked by a
    /// route or held by a train.
    pub fn set_alignment(
        &mut self,
        network: &TrackNetwork,
        id: SectionId,
        alignment: u8,
        train: Option<TrainId>,
    ) -> Result<(), ReservationError> {
        let def = network
            .section(id)
            .ok_or(ReservationError::UnknownSection(id))?;
        let branches = def.facing_direction().map_or(0, |d| def.exits(d).len());
        if alignment as usize >= branches {
            return Err(ReservationError::InvalidAlignment {
                section: id,
                alignment,
            });
        }
        let allowed = match train {
            Some(t) => self.can_align(id, alignment, t),
            None => {
                let s = &self.sections[id.index()];
                s.alignment == alignment || (s.junction_locks.is_empty() && s.is_free())
            }
        };
        if !allowed {
            return Err(ReservationError::JunctionLocked(id));
        }
        self.sections[id.index()].alignment = alignment;
        Ok(())
    }

    /// Record that `signal`'s route passes junction `id`.
    pub fn lock_junction(&mut self, id: SectionId, signal: SignalId) -> Result<(), ReservationError> {
        let section = self.get_mut(id)?;
        section.junction_locks.push(signal);
        Ok(())
    }

    /// Remove one lock held by `signal` on junction `id`. Returns whether a
    /// lock was found.
    pub fn unlock_junction(&mut self, id: SectionId, signal: SignalId) -> bool {
        let Ok(section) = self.get_mut(id) else {
            return false;
        };
        match section.junction_locks.iter().position(|s| *s == signal) {
            Some(pos) => {
                section.junction_locks.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Total junction locks across the network.
    pub fn junction_lock_count(&self) -> usize {
        self.sections.iter().map(|s| s.junction_locks.len()).sum()
    }

    /// Follow the current exit of `id` in `direction`: the next section given
    /// the junction's alignment, or the matching lane of a crossover entered
    /// from `entry_lane`.
    pub fn next_pin(
        &self,
        network: &TrackNetwork,
        id: SectionId,
        direction: Direction,
        entry_lane: u8,
    ) -> Option<Pin> {
        let def = network.section(id)?;
        let exits = def.exits(direction);
        match def.kind {
            SectionKind::Junction if def.facing_direction() == Some(direction) => {
                let state = self.section(id)?;
                exits.get(state.alignment as usize).copied()
            }
            SectionKind::Crossover => exits.get(entry_lane as usize).copied(),
            _ => exits.first().copied(),
        }
    }

    /// Sections currently reserved by `train`, in section order.
    pub fn reserved_by(&self, train: TrainId) -> Vec<SectionId> {
        self.iter()
            .filter(|(_, s)| s.reserved_by() == Some(train))
            .map(|(id, _)| id)
            .collect()
    }

    /// Sections reserved by any train.
    pub fn reserved_sections(&self) -> BTreeSet<SectionId> {
        self.iter()
            .filter(|(_, s)| s.reservation.is_some())
            .map(|(id, _)| id)
            .collect()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
