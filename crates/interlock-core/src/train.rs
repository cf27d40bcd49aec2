//! Trains as the interlocking sees them: a definition, the last position
//! report, and the remaining station stops.
//!
//! Train movement itself is outside the engine. Each report replaces the
//! previous one; the engine diffs the occupied sections to drive
//! occupancy, progressive release and deadlock group entry and exit.

use crate::engine::{Engine, EngineError};
use crate::fixed::Fixed64;
use crate::id::{DeadlockId, SectionId, SignalId, TrainId};
use crate::network::{Pin, ReservationError};
use crate::query::StopReport;
use crate::station::{StationStop, StationStopDef};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainDef {
    pub name: String,
    pub length: Fixed64,
    /// Higher wins under [`TieBreak::TrainPriority`](crate::config::TieBreak).
    pub priority: u8,
    pub stops: Vec<StationStopDef>,
}

impl TrainDef {
    pub fn new(name: &str, length: Fixed64) -> Self {
        Self {
            name: name.to_string(),
            length,
            priority: 0,
            stops: Vec::new(),
        }
    }
}

/// Where a train is, as reported by the movement model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionReport {
    /// Occupied sections, front first, with the direction of travel.
    pub occupied: Vec<Pin>,
    pub speed: Fixed64,
    /// Next signal ahead and the distance to it.
    pub distance_to_signal: Option<(SignalId, Fixed64)>,
}

impl PositionReport {
    /// A stationary train on `occupied`.
    pub fn at(occupied: Vec<Pin>) -> Self {
        Self {
            occupied,
            ..Self::default()
        }
    }

    pub fn moving(mut self, speed: Fixed64) -> Self {
        self.speed = speed;
        self
    }

    pub fn approaching(mut self, signal: SignalId, distance: Fixed64) -> Self {
        self.distance_to_signal = Some((signal, distance));
        self
    }

    pub fn front(&self) -> Option<SectionId> {
        self.occupied.first().map(|p| p.section)
    }

    pub fn sections(&self) -> impl Iterator<Item = SectionId> + '_ {
        self.occupied.iter().map(|p| p.section)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainRecord {
    pub def: TrainDef,
    pub position: PositionReport,
    pub stops: VecDeque<StationStop>,
    /// Finished or skipped stops, for schedule reporting.
    pub completed: Vec<StopReport>,
}

impl TrainRecord {
    fn new(def: TrainDef) -> Self {
        let stops = def.stops.iter().cloned().map(StationStop::new).collect();
        Self {
            def,
            position: PositionReport::default(),
            stops,
            completed: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine: train lifecycle and occupancy
// ---------------------------------------------------------------------------

impl Engine {
    /// Register a train standing on `occupied` (front first).
    pub fn add_train(&mut self, def: TrainDef, occupied: Vec<Pin>) -> Result<TrainId, EngineError> {
        for pin in &occupied {
            let state = self
                .sections
                .section(pin.section)
                .ok_or(EngineError::UnknownSection(pin.section))?;
            if let Some(occupant) = state.occupant() {
                return Err(ReservationError::Occupied {
                    section: pin.section,
                    occupant,
                }
                .into());
            }
        }
        let length = def.length;
        let name = def.name.clone();
        let train = self.trains.insert(TrainRecord::new(def));
        for info in &mut self.deadlocks {
            info.register_train(train, length);
        }
        info!("train {name} registered as {train:?}");
        self.apply_position(train, PositionReport::at(occupied))?;
        Ok(train)
    }

    /// Drop a train, freeing every reservation, claim and storage it holds.
    pub fn remove_train(&mut self, train: TrainId) -> Result<(), EngineError> {
        let record = self
            .trains
            .get(train)
            .ok_or(EngineError::UnknownTrain(train))?;
        let occupied: Vec<SectionId> = record.position.sections().collect();
        self.release_train_signals(train);
        for section in occupied {
            self.sections.vacate(section, train);
        }
        for section in self.sections.reserved_by(train) {
            // Reservations not owned by any signal, e.g. left by a
            // withdrawn route whose signal was reset.
            if let Err(e) = self.sections.release(section, train) {
                warn!("removing {train:?}: could not release {section:?}: {e}");
            }
        }
        for index in 0..self.sections.len() {
            self.sections.unclaim(SectionId(index as u32), train);
        }
        for info in &mut self.deadlocks {
            info.unregister_train(train);
        }
        for pool in &mut self.pools {
            pool.release(train);
        }
        self.trains.remove(train);
        info!("train {train:?} removed");
        Ok(())
    }

    /// Replace a train's position. Occupancy changes drive progressive
    /// release and deadlock group bookkeeping.
    pub fn apply_position(&mut self, train: TrainId, report: PositionReport) -> Result<(), EngineError> {
        let previous: BTreeSet<SectionId> = self
            .trains
            .get(train)
            .ok_or(EngineError::UnknownTrain(train))?
            .position
            .sections()
            .collect();
        for pin in &report.occupied {
            let state = self
                .sections
                .section(pin.section)
                .ok_or(EngineError::UnknownSection(pin.section))?;
            if state.is_occupied_by_other(train) {
                let occupant = state.occupant().unwrap_or(train);
                return Err(ReservationError::Occupied {
                    section: pin.section,
                    occupant,
                }
                .into());
            }
        }

        let current: BTreeSet<SectionId> = report.sections().collect();
        let entered: Vec<SectionId> = report
            .occupied
            .iter()
            .map(|p| p.section)
            .filter(|s| !previous.contains(s))
            .collect();
        let vacated: Vec<SectionId> = previous.difference(&current).copied().collect();

        for pin in &report.occupied {
            self.sections.occupy(pin.section, train, pin.direction)?;
        }
        for &section in &vacated {
            self.sections.vacate(section, train);
        }
        if let Some(record) = self.trains.get_mut(train) {
            record.position = report;
        }
        if !entered.is_empty() || !vacated.is_empty() {
            debug!("{train:?} entered {entered:?}, vacated {vacated:?}");
        }

        self.on_train_moved(train, &entered, &vacated);
        self.update_group_presence(train, &entered, &current);
        Ok(())
    }

    /// Mark deadlock paths entered, and release them once the train has
    /// left every section of the group.
    fn update_group_presence(&mut self, train: TrainId, entered: &[SectionId], current: &BTreeSet<SectionId>) {
        let network = Arc::clone(&self.network);
        let mut inside: BTreeSet<DeadlockId> = BTreeSet::new();
        for &section in current {
            inside.extend(network.group_of(section));
        }
        for &section in entered {
            if let Some(group) = network.group_of(section) {
                if let Some(info) = self.deadlocks.get_mut(group.index()) {
                    info.mark_entered(train);
                }
            }
        }
        for info in &mut self.deadlocks {
            let left = info
                .claim(train)
                .is_some_and(|c| c.entered && !inside.contains(&info.group));
            if left {
                let woken = info.release(train);
                debug!(
                    "{train:?} left deadlock group {:?}; grantable now {woken:?}",
                    info.group
                );
            }
        }
    }

    /// Stop reports for every stop the train has finished or skipped.
    pub fn completed_stops(&self, train: TrainId) -> Option<&[StopReport]> {
        self.trains.get(train).map(|t| t.completed.as_slice())
    }
}
