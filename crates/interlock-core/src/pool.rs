//! Storage pools and turntable gates.
//!
//! A pool is a set of storage tracks reached through a common access path.
//! Trains claim space before they enter, are stored once inside, and release
//! the space when they leave. A pool may sit behind a turntable, which is
//! modelled as a timed gate holding the access signal at stop until the
//! table has rotated to the claimed track.

use crate::engine::{Engine, EngineError};
use crate::event::Event;
use crate::fixed::{Fixed64, Ticks, ticks_to_cover};
use crate::id::{PoolId, SectionId, SignalId, StorageId, TrainId};
use crate::network::Pin;
use crate::signal::SignalFlags;
use log::{debug, info};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Static definitions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageDef {
    pub name: String,
    pub access_path: Vec<Pin>,
    pub length: Fixed64,
    /// Table angle that lines up with this track, for turntable pools.
    pub turntable_angle: Option<Fixed64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurntableDef {
    pub section: SectionId,
    /// Distance from the access signal at which rotation starts.
    pub approach_clearance: Fixed64,
    /// Distance the train must clear past the table before it frees.
    pub release_clearance: Fixed64,
    /// Degrees per tick. Also used as distance per tick for clearing.
    pub speed: Fixed64,
    pub initial_angle: Fixed64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolDef {
    pub name: String,
    pub storage: Vec<StorageDef>,
    pub turntable: Option<TurntableDef>,
    pub access_signal: Option<SignalId>,
}

// ---------------------------------------------------------------------------
// Errors and outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("train {0:?} has no claim in this pool")]
    NotClaimed(TrainId),
    #[error("train {0:?} is already stored")]
    AlreadyStored(TrainId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimOutcome {
    Claimed(StorageId),
    AlreadyClaimed(StorageId),
    PoolFull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolRelease {
    Released(StorageId),
    AlreadyReleased,
}

// ---------------------------------------------------------------------------
// Runtime state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageUnit {
    pub train: TrainId,
    pub length: Fixed64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageState {
    pub claimed: Vec<StorageUnit>,
    pub stored: Vec<StorageUnit>,
    pub remaining: Fixed64,
}

impl StorageState {
    fn holds(&self, train: TrainId) -> bool {
        self.claimed.iter().chain(&self.stored).any(|u| u.train == train)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateState {
    Idle,
    Rotating { ready_at: Ticks },
    Aligned,
    Occupied,
    Clearing { free_at: Ticks },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurntableGate {
    pub state: GateState,
    pub angle: Fixed64,
    pub target: Fixed64,
    pub train: Option<TrainId>,
}

impl TurntableGate {
    pub fn new(def: &TurntableDef) -> Self {
        Self {
            state: GateState::Idle,
            angle: def.initial_angle,
            target: def.initial_angle,
            train: None,
        }
    }

    /// Whether the gate lets `train` pass the access signal.
    pub fn open_for(&self, train: Option<TrainId>) -> bool {
        matches!(self.state, GateState::Aligned | GateState::Occupied)
            && self.train.is_some()
            && self.train == train
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolState {
    pub storage: Vec<StorageState>,
    pub gate: Option<TurntableGate>,
}

impl PoolState {
    pub fn new(def: &PoolDef) -> Self {
        Self {
            storage: def
                .storage
                .iter()
                .map(|s| StorageState {
                    claimed: Vec::new(),
                    stored: Vec::new(),
                    remaining: s.length,
                })
                .collect(),
            gate: def.turntable.as_ref().map(TurntableGate::new),
        }
    }

    pub fn storage_of(&self, train: TrainId) -> Option<StorageId> {
        self.storage
            .iter()
            .position(|s| s.holds(train))
            .map(|i| StorageId(i as u32))
    }

    /// Reserve space on the first track, in definition order, with room.
    pub fn claim(&mut self, train: TrainId, length: Fixed64) -> ClaimOutcome {
        if let Some(existing) = self.storage_of(train) {
            return ClaimOutcome::AlreadyClaimed(existing);
        }
        let Some(index) = self.storage.iter().position(|s| s.remaining >= length) else {
            return ClaimOutcome::PoolFull;
        };
        let track = &mut self.storage[index];
        track.remaining -= length;
        track.claimed.push(StorageUnit { train, length });
        ClaimOutcome::Claimed(StorageId(index as u32))
    }

    pub fn store(&mut self, train: TrainId) -> Result<StorageId, PoolError> {
        for (index, track) in self.storage.iter_mut().enumerate() {
            if track.stored.iter().any(|u| u.train == train) {
                return Err(PoolError::AlreadyStored(train));
            }
            if let Some(pos) = track.claimed.iter().position(|u| u.train == train) {
                let unit = track.claimed.remove(pos);
                track.stored.push(unit);
                return Ok(StorageId(index as u32));
            }
        }
        Err(PoolError::NotClaimed(train))
    }

    pub fn release(&mut self, train: TrainId) -> PoolRelease {
        for (index, track) in self.storage.iter_mut().enumerate() {
            let before = track.claimed.len() + track.stored.len();
            let mut freed = Fixed64::ZERO;
            track.claimed.retain(|u| {
                let keep = u.train != train;
                if !keep {
                    freed += u.length;
                }
                keep
            });
            track.stored.retain(|u| {
                let keep = u.train != train;
                if !keep {
                    freed += u.length;
                }
                keep
            });
            if track.claimed.len() + track.stored.len() != before {
                track.remaining += freed;
                return PoolRelease::Released(StorageId(index as u32));
            }
        }
        PoolRelease::AlreadyReleased
    }

    /// Trains with space claimed but not yet stored, in claim order per track.
    fn pending_claims(&self) -> impl Iterator<Item = (StorageId, TrainId)> + '_ {
        self.storage.iter().enumerate().flat_map(|(i, s)| {
            s.claimed.iter().map(move |u| (StorageId(i as u32), u.train))
        })
    }
}

// ---------------------------------------------------------------------------
// Engine: pool operations and gate phase
// ---------------------------------------------------------------------------

impl Engine {
    pub fn claim_storage(&mut self, train: TrainId, pool: PoolId) -> Result<ClaimOutcome, EngineError> {
        let length = self
            .trains
            .get(train)
            .ok_or(EngineError::UnknownTrain(train))?
            .def
            .length;
        let state = self
            .pools
            .get_mut(pool.index())
            .ok_or(EngineError::UnknownPool(pool))?;
        let outcome = state.claim(train, length);
        if let ClaimOutcome::Claimed(storage) = outcome {
            debug!("{train:?} claimed storage {storage:?} in {pool:?}");
            self.event_bus.emit(Event::StorageClaimed {
                pool,
                storage,
                train,
                tick: self.sim_state.tick,
            });
        }
        Ok(outcome)
    }

    pub fn store_train(&mut self, train: TrainId, pool: PoolId) -> Result<StorageId, EngineError> {
        if !self.trains.contains_key(train) {
            return Err(EngineError::UnknownTrain(train));
        }
        let state = self
            .pools
            .get_mut(pool.index())
            .ok_or(EngineError::UnknownPool(pool))?;
        let storage = state.store(train)?;
        info!("{train:?} stored on {storage:?} in {pool:?}");
        self.event_bus.emit(Event::TrainStored {
            pool,
            storage,
            train,
            tick: self.sim_state.tick,
        });
        Ok(storage)
    }

    pub fn release_storage(&mut self, train: TrainId, pool: PoolId) -> Result<PoolRelease, EngineError> {
        let state = self
            .pools
            .get_mut(pool.index())
            .ok_or(EngineError::UnknownPool(pool))?;
        Ok(state.release(train))
    }

    /// Step every turntable gate and refresh the access-signal gating flag.
    pub(crate) fn phase_pools(&mut self) {
        let tick = self.sim_state.tick;
        for (index, def) in self.network.pools().iter().enumerate() {
            let pool_id = PoolId(index as u32);
            let Some(state) = self.pools.get_mut(index) else {
                continue;
            };
            let pending: Vec<(StorageId, TrainId)> = state.pending_claims().collect();
            let (Some(table), Some(gate)) = (def.turntable.as_ref(), state.gate.as_mut()) else {
                continue;
            };
            let on_table = |train: TrainId| {
                self.trains
                    .get(train)
                    .is_some_and(|t| t.position.occupied.iter().any(|p| p.section == table.section))
            };

            match gate.state {
                GateState::Idle => {
                    let approaching = pending.iter().find(|(_, train)| {
                        self.trains.get(*train).is_some_and(|t| {
                            matches!(
                                (t.position.distance_to_signal, def.access_signal),
                                (Some((at, d)), Some(access)) if at == access && d <= table.approach_clearance
                            )
                        })
                    });
                    if let Some(&(storage, train)) = approaching {
                        let target = def.storage[storage.index()]
                            .turntable_angle
                            .unwrap_or(gate.angle);
                        let turn = ticks_to_cover((target - gate.angle).abs(), table.speed).unwrap_or(0);
                        gate.train = Some(train);
                        gate.target = target;
                        if turn == 0 {
                            gate.state = GateState::Aligned;
                        } else {
                            gate.state = GateState::Rotating { ready_at: tick + turn };
                            self.event_bus.emit(Event::TurntableRotating {
                                pool: pool_id,
                                train,
                                ready_at: tick + turn,
                                tick,
                            });
                        }
                    }
                }
                GateState::Rotating { ready_at } => {
                    if tick >= ready_at {
                        gate.angle = gate.target;
                        gate.state = GateState::Aligned;
                    }
                }
                GateState::Aligned => match gate.train {
                    Some(train) if on_table(train) => gate.state = GateState::Occupied,
                    Some(train) if pending.iter().any(|(_, t)| *t == train) => {}
                    _ => {
                        gate.train = None;
                        gate.state = GateState::Idle;
                    }
                },
                GateState::Occupied => {
                    if !gate.train.is_some_and(on_table) {
                        let clear = ticks_to_cover(table.release_clearance, table.speed).unwrap_or(0);
                        gate.state = GateState::Clearing { free_at: tick + clear };
                    }
                }
                GateState::Clearing { free_at } => {
                    if tick >= free_at {
                        gate.train = None;
                        gate.state = GateState::Idle;
                    }
                }
            }

            if let Some(signal) = def.access_signal {
                if let Some(record) = self.signals.get_mut(signal.index()) {
                    let open = gate.open_for(record.enabled_train);
                    record.flags.set(SignalFlags::GATED, !open);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fixed;
    use slotmap::SlotMap;

    fn two_track_pool() -> PoolDef {
        PoolDef {
            name: "yard".to_string(),
            storage: vec![
                StorageDef {
                    name: "road1".to_string(),
                    access_path: vec![Pin::new(SectionId(0), crate::network::Direction::Ahead)],
                    length: fixed(100.0),
                    turntable_angle: None,
                },
                StorageDef {
                    name: "road2".to_string(),
                    access_path: vec![Pin::new(SectionId(1), crate::network::Direction::Ahead)],
                    length: fixed(300.0),
                    turntable_angle: None,
                },
            ],
            turntable: None,
            access_signal: None,
        }
    }

    fn trains(n: usize) -> Vec<TrainId> {
        let mut map: SlotMap<TrainId, ()> = SlotMap::with_key();
        (0..n).map(|_| map.insert(())).collect()
    }

    // -----------------------------------------------------------------------
    // Test 1: claims pick the first track with room
    // -----------------------------------------------------------------------
    #[test]
    fn claim_picks_first_fitting_track() {
        let t = trains(3);
        let mut pool = PoolState::new(&two_track_pool());
        assert_eq!(pool.claim(t[0], fixed(80.0)), ClaimOutcome::Claimed(StorageId(0)));
        assert_eq!(pool.claim(t[1], fixed(80.0)), ClaimOutcome::Claimed(StorageId(1)));
        assert_eq!(pool.claim(t[2], fixed(250.0)), ClaimOutcome::PoolFull);
        assert_eq!(pool.storage[1].remaining, fixed(220.0));
    }

    // -----------------------------------------------------------------------
    // Test 2: repeated claim returns the existing claim
    // -----------------------------------------------------------------------
    #[test]
    fn repeated_claim_is_stable() {
        let t = trains(1);
        let mut pool = PoolState::new(&two_track_pool());
        pool.claim(t[0], fixed(80.0));
        assert_eq!(pool.claim(t[0], fixed(80.0)), ClaimOutcome::AlreadyClaimed(StorageId(0)));
        assert_eq!(pool.storage[0].remaining, fixed(20.0));
    }

    // -----------------------------------------------------------------------
    // Test 3: store requires a claim
    // -----------------------------------------------------------------------
    #[test]
    fn store_requires_claim() {
        let t = trains(2);
        let mut pool = PoolState::new(&two_track_pool());
        assert_eq!(pool.store(t[0]), Err(PoolError::NotClaimed(t[0])));
        pool.claim(t[1], fixed(50.0));
        assert_eq!(pool.store(t[1]), Ok(StorageId(0)));
        assert_eq!(pool.store(t[1]), Err(PoolError::AlreadyStored(t[1])));
    }

    // -----------------------------------------------------------------------
    // Test 4: release is idempotent and frees space
    // -----------------------------------------------------------------------
    #[test]
    fn release_twice() {
        let t = trains(1);
        let mut pool = PoolState::new(&two_track_pool());
        pool.claim(t[0], fixed(60.0));
        pool.store(t[0]).unwrap();
        assert_eq!(pool.release(t[0]), PoolRelease::Released(StorageId(0)));
        assert_eq!(pool.release(t[0]), PoolRelease::AlreadyReleased);
        assert_eq!(pool.storage[0].remaining, fixed(100.0));
    }

    #[test]
    fn gate_opens_only_for_its_train() {
        let t = trains(2);
        let table = TurntableDef {
            section: SectionId(0),
            approach_clearance: fixed(100.0),
            release_clearance: fixed(20.0),
            speed: fixed(3.0),
            initial_angle: Fixed64::ZERO,
        };
        let mut gate = TurntableGate::new(&table);
        assert!(!gate.open_for(Some(t[0])));
        gate.state = GateState::Aligned;
        gate.train = Some(t[0]);
        assert!(gate.open_for(Some(t[0])));
        assert!(!gate.open_for(Some(t[1])));
        assert!(!gate.open_for(None));
    }
}
