//! Read-only query API for inspecting interlocking state.
//!
//! Snapshot types are owned copies with no references into engine storage,
//! suitable for displays, dispatcher tools and schedule reporting.

use crate::deadlock::ClaimState;
use crate::engine::Engine;
use crate::fixed::{Fixed64, Ticks};
use crate::id::{DeadlockId, PathId, PoolId, SectionId, SignalId, StorageId, TrainId};
use crate::pool::GateState;
use crate::signal::{Aspect, Permission, SignalFlags, SignalState};
use crate::station::{StopGeometry, StopState};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Snapshot types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalSnapshot {
    pub id: SignalId,
    pub name: String,
    pub state: SignalState,
    pub aspect: Aspect,
    pub permission: Permission,
    pub flags: SignalFlags,
    pub enabled_train: Option<TrainId>,
    /// Reserved sections, front first.
    pub route: Vec<SectionId>,
    /// Sections still waiting to be reserved.
    pub pending: Vec<SectionId>,
    /// Junctions the route holds locked, in locking order.
    pub junctions_passed: Vec<SectionId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionSnapshot {
    pub id: SectionId,
    pub name: String,
    pub reserved_by: Option<TrainId>,
    pub occupied_by: Option<TrainId>,
    pub claims: Vec<TrainId>,
    pub alignment: u8,
    pub locked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainSnapshot {
    pub id: TrainId,
    pub name: String,
    pub occupied: Vec<SectionId>,
    pub reserved: Vec<SectionId>,
    /// Station and state of the current stop.
    pub current_stop: Option<(String, StopState)>,
    /// Stop position and exit-signal distance once berthed.
    pub stop_geometry: Option<StopGeometry>,
    pub storage: Option<(PoolId, StorageId)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadlockSnapshot {
    pub group: DeadlockId,
    pub name: String,
    /// Trains owning a path, with the path.
    pub owners: Vec<(TrainId, PathId)>,
    /// Owners travelling their path against its defined direction.
    pub reversed: Vec<TrainId>,
    /// Waiting trains, oldest first.
    pub waiting: Vec<TrainId>,
}

/// Outcome of one station stop, kept after the train leaves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopReport {
    pub station: String,
    pub platform: SectionId,
    pub scheduled_arrival: Ticks,
    pub scheduled_departure: Ticks,
    pub actual_arrival: Option<Ticks>,
    pub actual_departure: Option<Ticks>,
    /// Stopping point along the platform section; `None` when skipped.
    pub stop_position: Option<Fixed64>,
    pub missed_connections: Vec<String>,
    /// The train passed the platform without stopping.
    pub skipped: bool,
}

impl StopReport {
    /// Ticks late on departure; zero when early or not departed.
    pub fn departure_delay(&self) -> Ticks {
        self.actual_departure
            .map_or(0, |d| d.saturating_sub(self.scheduled_departure))
    }
}

// ---------------------------------------------------------------------------
// Engine queries
// ---------------------------------------------------------------------------

impl Engine {
    pub fn aspect(&self, signal: SignalId) -> Option<Aspect> {
        self.signals.get(signal.index()).map(|r| r.aspect)
    }

    pub fn signal_state(&self, signal: SignalId) -> Option<SignalState> {
        self.signals.get(signal.index()).map(|r| r.state)
    }

    pub fn train_id(&self, name: &str) -> Option<TrainId> {
        self.trains
            .iter()
            .find(|(_, t)| t.def.name == name)
            .map(|(id, _)| id)
    }

    pub fn train_count(&self) -> usize {
        self.trains.len()
    }

    pub fn snapshot_signal(&self, signal: SignalId) -> Option<SignalSnapshot> {
        let record = self.signals.get(signal.index())?;
        let def = self.network.signal(signal)?;
        Some(SignalSnapshot {
            id: signal,
            name: def.name.clone(),
            state: record.state,
            aspect: record.aspect,
            permission: record.permission,
            flags: record.flags,
            enabled_train: record.enabled_train,
            route: record.route.sections().collect(),
            pending: record
                .request
                .iter()
                .flat_map(|r| r.pending.iter().map(|e| e.section))
                .collect(),
            junctions_passed: record.junctions_passed.clone(),
        })
    }

    pub fn snapshot_section(&self, section: SectionId) -> Option<SectionSnapshot> {
        let state = self.sections.section(section)?;
        let def = self.network.section(section)?;
        Some(SectionSnapshot {
            id: section,
            name: def.name.clone(),
            reserved_by: state.reserved_by(),
            occupied_by: state.occupant(),
            claims: state.claims.clone(),
            alignment: state.alignment,
            locked: !state.junction_locks.is_empty(),
        })
    }

    pub fn snapshot_train(&self, train: TrainId) -> Option<TrainSnapshot> {
        let record = self.trains.get(train)?;
        let storage = self
            .pools
            .iter()
            .enumerate()
            .find_map(|(i, p)| p.storage_of(train).map(|s| (PoolId(i as u32), s)));
        Some(TrainSnapshot {
            id: train,
            name: record.def.name.clone(),
            occupied: record.position.sections().collect(),
            reserved: self.sections.reserved_by(train),
            current_stop: record
                .stops
                .front()
                .map(|s| (s.def.station.clone(), s.state)),
            stop_geometry: record.stops.front().and_then(|s| s.geometry),
            storage,
        })
    }

    pub fn snapshot_deadlock(&self, group: DeadlockId) -> Option<DeadlockSnapshot> {
        let info = self.deadlocks.get(group.index())?;
        let def = self.network.deadlock_group(group)?;
        Some(DeadlockSnapshot {
            group,
            name: def.name.clone(),
            owners: info
                .train_own_path
                .iter()
                .filter(|(_, c)| c.state == ClaimState::Owned)
                .map(|(t, c)| (*t, c.path))
                .collect(),
            reversed: info
                .train_own_path
                .iter()
                .filter(|(_, c)| c.state == ClaimState::Owned && c.reversed)
                .map(|(t, _)| *t)
                .collect(),
            waiting: info.waiting(),
        })
    }

    /// Junction locks held across the network, one per locking route.
    pub fn junction_lock_count(&self) -> usize {
        self.sections.junction_lock_count()
    }

    /// Signals currently showing anything but stop.
    pub fn cleared_signals(&self) -> Vec<SignalId> {
        self.signals
            .iter()
            .enumerate()
            .filter(|(_, r)| r.aspect != Aspect::Stop)
            .map(|(i, _)| SignalId(i as u32))
            .collect()
    }

    pub fn turntable_state(&self, pool: PoolId) -> Option<GateState> {
        self.pools
            .get(pool.index())?
            .gate
            .as_ref()
            .map(|g| g.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::station::{StationStopDef, StopFlags};
    use crate::test_utils::*;
    use crate::train::PositionReport;

    #[test]
    fn snapshots_reflect_route() {
        let fx = signalled_line(4, &[0]);
        let mut engine = fx.engine();
        let train = engine.add_train(train_def("t1", 50.0), vec![fx.pin(0)]).unwrap();
        engine.request_route(train, fx.signals[0], &fx.path(1..4), 1).unwrap();

        let signal = engine.snapshot_signal(fx.signals[0]).unwrap();
        assert_eq!(signal.state, SignalState::FullRouteCleared);
        assert_eq!(signal.route, fx.path(1..4));
        assert!(signal.pending.is_empty());

        let section = engine.snapshot_section(SectionId(2)).unwrap();
        assert_eq!(section.reserved_by, Some(train));
        assert_eq!(section.occupied_by, None);

        let snap = engine.snapshot_train(train).unwrap();
        assert_eq!(snap.occupied, vec![SectionId(0)]);
        assert_eq!(snap.reserved, fx.path(1..4));
        assert_eq!(engine.train_id("t1"), Some(train));
    }

    #[test]
    fn berthed_train_exposes_stop_geometry() {
        let fx = signalled_line(3, &[1]);
        let mut engine = fx.engine();
        let mut def = train_def("t1", 50.0);
        let mut stop = StationStopDef::new("Halt", SectionId(1), fixed(100.0));
        stop.exit_signal = Some(fx.signals[0]);
        stop.signal_offset = Some(fixed(100.0));
        stop.flags = StopFlags::EXIT_SIGNAL | StopFlags::CLOSEUP;
        def.stops.push(stop);
        let train = engine.add_train(def, vec![fx.pin(1)]).unwrap();
        assert_eq!(engine.snapshot_train(train).unwrap().stop_geometry, None);

        engine.step();
        let snap = engine.snapshot_train(train).unwrap();
        assert_eq!(snap.current_stop, Some(("Halt".to_string(), StopState::Berthed)));
        assert_eq!(
            snap.stop_geometry,
            Some(StopGeometry {
                stop_position: fixed(80.0),
                claim_distance: Some(fixed(20.0)),
            })
        );

        engine.step();
        engine.apply_position(train, PositionReport::at(vec![fx.pin(2)])).unwrap();
        engine.step();
        let done = engine.completed_stops(train).unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].stop_position, Some(fixed(80.0)));
    }

    #[test]
    fn departure_delay_saturates() {
        let report = StopReport {
            station: "A".to_string(),
            platform: SectionId(0),
            scheduled_arrival: 10,
            scheduled_departure: 50,
            actual_arrival: Some(12),
            actual_departure: Some(40),
            stop_position: Some(Fixed64::from_num(150)),
            missed_connections: Vec::new(),
            skipped: false,
        };
        assert_eq!(report.departure_delay(), 0);
        let late = StopReport {
            actual_departure: Some(65),
            ..report
        };
        assert_eq!(late.departure_delay(), 15);
    }

    #[test]
    fn unknown_ids_give_none() {
        let fx = signalled_line(2, &[0]);
        let engine = fx.engine();
        assert!(engine.snapshot_signal(SignalId(9)).is_none());
        assert!(engine.snapshot_section(SectionId(9)).is_none());
        assert!(engine.snapshot_deadlock(DeadlockId(0)).is_none());
    }
}
