//! Serialization and snapshot support for the interlocking engine.
//!
//! Provides binary serialization via `bitcode` with a versioned header,
//! a snapshot ring buffer for rollback, and per-subsystem hashing for
//! desync debugging.
//!
//! The static [`TrackNetwork`] is not part of a snapshot. It is supplied
//! again on restore and checked against the fingerprint in the header.

use crate::command_queue::{Command, CommandQueue};
use crate::config::EngineConfig;
use crate::deadlock::DeadlockInfo;
use crate::engine::Engine;
use crate::event::EventBus;
use crate::fixed::Ticks;
use crate::id::TrainId;
use crate::network::{NetworkState, TrackNetwork};
use crate::pool::{GateState, PoolState};
use crate::signal::SignalRecord;
use crate::sim::{SimState, StateHash};
use crate::train::TrainRecord;
use log::debug;
use serde::{Deserialize, Serialize};
use slotmap::{Key, SlotMap};
use std::collections::BTreeMap;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Magic number identifying an interlocking engine snapshot.
pub const SNAPSHOT_MAGIC: u32 = 0x1A7C_0001;

/// Current format version. Increment when breaking the wire format.
pub const FORMAT_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SerializeError {
    #[error("bitcode encoding failed: {0}")]
    Encode(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DeserializeError {
    #[error("invalid magic number: expected 0x{:08X}, got 0x{:08X}", SNAPSHOT_MAGIC, .0)]
    InvalidMagic(u32),
    #[error("unsupported format version: expected {}, got {}", FORMAT_VERSION, .0)]
    UnsupportedVersion(u32),
    #[error("snapshot from future version {0} (this build supports up to {FORMAT_VERSION})")]
    FutureVersion(u32),
    #[error("snapshot was taken on network {expected:016x}, restoring onto {found:016x}")]
    NetworkMismatch { expected: u64, found: u64 },
    #[error("bitcode decoding failed: {0}")]
    Decode(String),
}

// ---------------------------------------------------------------------------
// Snapshot header
// ---------------------------------------------------------------------------

/// Header stored with every snapshot. Checked before any state is used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub magic: u32,
    pub version: u32,
    /// Tick at which the snapshot was taken.
    pub tick: Ticks,
    /// [`TrackNetwork::fingerprint`] of the network the state belongs to.
    pub network_fingerprint: u64,
}

impl SnapshotHeader {
    pub fn new(tick: Ticks, network_fingerprint: u64) -> Self {
        Self {
            magic: SNAPSHOT_MAGIC,
            version: FORMAT_VERSION,
            tick,
            network_fingerprint,
        }
    }

    pub fn validate(&self) -> Result<(), DeserializeError> {
        if self.magic != SNAPSHOT_MAGIC {
            return Err(DeserializeError::InvalidMagic(self.magic));
        }
        if self.version > FORMAT_VERSION {
            return Err(DeserializeError::FutureVersion(self.version));
        }
        if self.version < FORMAT_VERSION {
            return Err(DeserializeError::UnsupportedVersion(self.version));
        }
        Ok(())
    }
}

/// Decode only far enough to return the header.
///
/// bitcode has no partial decoding, so this decodes the whole snapshot.
pub fn read_snapshot_header(data: &[u8]) -> Result<SnapshotHeader, DeserializeError> {
    let snapshot: EngineSnapshot =
        bitcode::deserialize(data).map_err(|e| DeserializeError::Decode(e.to_string()))?;
    Ok(snapshot.header)
}

// ---------------------------------------------------------------------------
// Serializable engine state
// ---------------------------------------------------------------------------

/// Everything mutable in an [`Engine`]. The event bus (closures) and the
/// command history are left out.
#[derive(Debug, Serialize, Deserialize)]
struct EngineSnapshot {
    header: SnapshotHeader,
    config: EngineConfig,
    sim_state: SimState,
    paused: bool,
    sections: NetworkState,
    signals: Vec<SignalRecord>,
    deadlocks: Vec<DeadlockInfo>,
    pools: Vec<PoolState>,
    trains: SlotMap<TrainId, TrainRecord>,
    arrivals: BTreeMap<(String, String), Ticks>,
    pending_commands: Vec<(u64, Command)>,
    last_seq: u64,
    last_state_hash: u64,
}

// ---------------------------------------------------------------------------
// SubsystemHashes
// ---------------------------------------------------------------------------

/// Per-subsystem state hashes. When two engines diverge, comparing these
/// shows which part of the state went first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubsystemHashes {
    pub sections: u64,
    pub signals: u64,
    pub deadlocks: u64,
    pub pools: u64,
    pub trains: u64,
    pub sim_state: u64,
}

// ---------------------------------------------------------------------------
// SnapshotRingBuffer
// ---------------------------------------------------------------------------

/// Fixed-capacity ring of serialized snapshots; the oldest is evicted when
/// full.
#[derive(Debug)]
pub struct SnapshotRingBuffer {
    entries: Vec<Option<SnapshotEntry>>,
    /// Write position.
    head: usize,
    len: usize,
    /// Including evicted.
    total_taken: u64,
}

#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    pub tick: Ticks,
    pub data: Vec<u8>,
}

impl SnapshotRingBuffer {
    /// A capacity of 0 is clamped to 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: (0..capacity).map(|_| None).collect(),
            head: 0,
            len: 0,
            total_taken: 0,
        }
    }

    pub fn push(&mut self, entry: SnapshotEntry) {
        self.entries[self.head] = Some(entry);
        self.head = (self.head + 1) % self.capacity();
        if self.len < self.capacity() {
            self.len += 1;
        }
        self.total_taken += 1;
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn total_taken(&self) -> u64 {
        self.total_taken
    }

    /// 0 is the oldest stored snapshot.
    pub fn get(&self, index: usize) -> Option<&SnapshotEntry> {
        if index >= self.len {
            return None;
        }
        let start = if self.len < self.capacity() { 0 } else { self.head };
        self.entries[(start + index) % self.capacity()].as_ref()
    }

    pub fn latest(&self) -> Option<&SnapshotEntry> {
        self.len.checked_sub(1).and_then(|i| self.get(i))
    }

    /// Newest snapshot taken at or before `tick`.
    pub fn at_or_before(&self, tick: Ticks) -> Option<&SnapshotEntry> {
        (0..self.len)
            .rev()
            .filter_map(|i| self.get(i))
            .find(|e| e.tick <= tick)
    }

    pub fn clear(&mut self) {
        self.entries.iter_mut().for_each(|e| *e = None);
        self.head = 0;
        self.len = 0;
    }
}

// ---------------------------------------------------------------------------
// Engine serialization methods
// ---------------------------------------------------------------------------

impl Engine {
    /// Serialize all mutable state. Event subscribers are not included and
    /// must be registered again after restore.
    pub fn serialize(&self) -> Result<Vec<u8>, SerializeError> {
        let snapshot = EngineSnapshot {
            header: SnapshotHeader::new(self.sim_state.tick, self.network.fingerprint()),
            config: self.config.clone(),
            sim_state: self.sim_state.clone(),
            paused: self.paused,
            sections: self.sections.clone(),
            signals: self.signals.clone(),
            deadlocks: self.deadlocks.clone(),
            pools: self.pools.clone(),
            trains: self.trains.clone(),
            arrivals: self.arrivals.clone(),
            pending_commands: self.command_queue.pending().to_vec(),
            last_seq: self.command_queue.last_seq(),
            last_state_hash: self.last_state_hash,
        };
        bitcode::serialize(&snapshot).map_err(|e| SerializeError::Encode(e.to_string()))
    }

    /// Restore an engine onto `network`, which must be the network the
    /// snapshot was taken on.
    pub fn deserialize(
        data: &[u8],
        network: impl Into<Arc<TrackNetwork>>,
    ) -> Result<Self, DeserializeError> {
        let snapshot: EngineSnapshot =
            bitcode::deserialize(data).map_err(|e| DeserializeError::Decode(e.to_string()))?;
        snapshot.header.validate()?;

        let network = network.into();
        let found = network.fingerprint();
        if snapshot.header.network_fingerprint != found {
            return Err(DeserializeError::NetworkMismatch {
                expected: snapshot.header.network_fingerprint,
                found,
            });
        }

        let mut command_queue = CommandQueue::new();
        command_queue.restore_pending(snapshot.pending_commands, snapshot.last_seq);
        debug!("restored engine at tick {}", snapshot.header.tick);

        Ok(Engine {
            network,
            event_bus: EventBus::new(snapshot.config.event_capacity),
            config: snapshot.config,
            sim_state: snapshot.sim_state,
            paused: snapshot.paused,
            sections: snapshot.sections,
            signals: snapshot.signals,
            deadlocks: snapshot.deadlocks,
            pools: snapshot.pools,
            trains: snapshot.trains,
            arrivals: snapshot.arrivals,
            last_state_hash: snapshot.last_state_hash,
            command_queue,
        })
    }

    pub fn take_snapshot(&self, buffer: &mut SnapshotRingBuffer) -> Result<(), SerializeError> {
        let data = self.serialize()?;
        buffer.push(SnapshotEntry {
            tick: self.sim_state.tick,
            data,
        });
        Ok(())
    }

    /// Restore entry `index` (0 = oldest). `Ok(None)` when out of range.
    pub fn restore_snapshot(
        buffer: &SnapshotRingBuffer,
        index: usize,
        network: impl Into<Arc<TrackNetwork>>,
    ) -> Result<Option<Engine>, DeserializeError> {
        let Some(entry) = buffer.get(index) else {
            return Ok(None);
        };
        Engine::deserialize(&entry.data, network).map(Some)
    }

    // -----------------------------------------------------------------------
    // Hashing
    // -----------------------------------------------------------------------

    pub fn subsystem_hashes(&self) -> SubsystemHashes {
        fn run(f: impl FnOnce(&mut StateHash)) -> u64 {
            let mut h = StateHash::new();
            f(&mut h);
            h.finish()
        }
        SubsystemHashes {
            sections: run(|h| self.hash_sections(h)),
            signals: run(|h| self.hash_signals(h)),
            deadlocks: run(|h| self.hash_deadlocks(h)),
            pools: run(|h| self.hash_pools(h)),
            trains: run(|h| self.hash_trains(h)),
            sim_state: run(|h| {
                h.write_u64(self.sim_state.tick);
                h.write_u64(self.sim_state.accumulator);
            }),
        }
    }

    pub(crate) fn hash_sections(&self, h: &mut StateHash) {
        for (id, state) in self.sections.iter() {
            h.write_u32(id.0);
            h.write_opt_u64(state.reserved_by().map(train_bits));
            h.write_opt_u64(state.occupant().map(train_bits));
            h.write_u32(state.claims.len() as u32);
            for t in &state.claims {
                h.write_u64(train_bits(*t));
            }
            h.write_u32(state.alignment as u32);
            h.write_u32(state.junction_locks.len() as u32);
        }
    }

    pub(crate) fn hash_signals(&self, h: &mut StateHash) {
        for record in &self.signals {
            h.write_u32(record.state as u32);
            h.write_u32(record.aspect as u32);
            h.write_u32(record.permission as u32);
            h.write_u32(record.flags.bits() as u32);
            h.write_opt_u64(record.enabled_train.map(train_bits));
            h.write_u32(record.route.len() as u32);
            for section in record.route.sections() {
                h.write_u32(section.0);
            }
            h.write_u32(record.request.as_ref().map_or(0, |r| r.pending.len() as u32));
        }
    }

    pub(crate) fn hash_deadlocks(&self, h: &mut StateHash) {
        for info in &self.deadlocks {
            for (train, claim) in &info.train_own_path {
                h.write_u64(train_bits(*train));
                h.write_u32(claim.path.0);
                h.write_u32(claim.state as u32);
                h.write_u64(claim.order);
            }
        }
    }

    pub(crate) fn hash_pools(&self, h: &mut StateHash) {
        for pool in &self.pools {
            for track in &pool.storage {
                h.write_fixed64(track.remaining);
                h.write_u32(track.stored.len() as u32);
            }
            if let Some(gate) = &pool.gate {
                let (tag, at) = match gate.state {
                    GateState::Idle => (0, 0),
                    GateState::Rotating { ready_at } => (1, ready_at),
                    GateState::Aligned => (2, 0),
                    GateState::Occupied => (3, 0),
                    GateState::Clearing { free_at } => (4, free_at),
                };
                h.write_u32(tag);
                h.write_u64(at);
                h.write_fixed64(gate.angle);
            }
        }
    }

    pub(crate) fn hash_trains(&self, h: &mut StateHash) {
        for (id, train) in &self.trains {
            h.write_u64(train_bits(id));
            for pin in &train.position.occupied {
                h.write_u32(pin.section.0);
            }
            h.write_u32(train.stops.len() as u32);
            if let Some(stop) = train.stops.front() {
                h.write_u32(stop.state as u32);
            }
        }
    }
}

/// Slotmap keys hash by their FFI form (version and index).
fn train_bits(t: TrainId) -> u64 {
    t.data().as_ffi()
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::SectionId;
    use crate::signal::{Permission, SignalState};
    use crate::test_utils::*;
    use crate::train::PositionReport;

    /// A line with one train holding a route and a queued position report.
    fn make_test_engine() -> (SignalledLine, Engine) {
        let fx = signalled_line(6, &[0, 3]);
        let mut engine = fx.engine();
        let train = engine.add_train(train_def("t1", 50.0), vec![fx.pin(0)]).unwrap();
        engine.submit_route(train, fx.signals[0], fx.path(1..6));
        engine.step();
        engine.submit_position(train, PositionReport::at(vec![fx.pin(1), fx.pin(0)]));
        (fx, engine)
    }

    // -----------------------------------------------------------------------
    // Test 1: round trip preserves the state hash
    // -----------------------------------------------------------------------
    #[test]
    fn serialize_round_trip_preserves_state_hash() {
        let (fx, engine) = make_test_engine();
        let data = engine.serialize().expect("serialize should succeed");
        let restored =
            Engine::deserialize(&data, fx.network.clone()).expect("deserialize should succeed");

        assert_eq!(restored.state_hash(), engine.state_hash());
        assert_eq!(restored.sim_state.tick, engine.sim_state.tick);
        assert_eq!(restored.subsystem_hashes(), engine.subsystem_hashes());
        assert_eq!(
            restored.signal_state(fx.signals[0]),
            Some(SignalState::FullRouteCleared)
        );
    }

    // -----------------------------------------------------------------------
    // Test 2: garbage is a decode error, not a panic
    // -----------------------------------------------------------------------
    #[test]
    fn serialize_garbage_is_decode_error() {
        let (fx, _) = make_test_engine();
        let result = Engine::deserialize(&[0u8; 10], fx.network.clone());
        assert!(matches!(result, Err(DeserializeError::Decode(_))));
    }

    // -----------------------------------------------------------------------
    // Test 3: restoring onto a different network is refused
    // -----------------------------------------------------------------------
    #[test]
    fn serialize_network_mismatch() {
        let (_, engine) = make_test_engine();
        let data = engine.serialize().unwrap();
        let other = line_network(7);
        match Engine::deserialize(&data, other) {
            Err(DeserializeError::NetworkMismatch { expected, found }) => {
                assert_eq!(expected, engine.network().fingerprint());
                assert_ne!(expected, found);
            }
            other => panic!("expected NetworkMismatch, got {other:?}"),
        }
    }

    // -----------------------------------------------------------------------
    // Test 4: header validation
    // -----------------------------------------------------------------------
    #[test]
    fn serialize_header_versions() {
        let header = SnapshotHeader::new(0, 0);
        assert!(header.validate().is_ok());

        let old = SnapshotHeader {
            version: 0,
            ..header.clone()
        };
        assert!(matches!(
            old.validate(),
            Err(DeserializeError::UnsupportedVersion(0))
        ));

        let future = SnapshotHeader {
            version: FORMAT_VERSION + 1,
            ..header.clone()
        };
        assert!(matches!(
            future.validate(),
            Err(DeserializeError::FutureVersion(_))
        ));

        let wrong = SnapshotHeader {
            magic: 0xDEAD_BEEF,
            ..header
        };
        assert!(matches!(
            wrong.validate(),
            Err(DeserializeError::InvalidMagic(0xDEAD_BEEF))
        ));
    }

    // -----------------------------------------------------------------------
    // Test 5: the header can be read back
    // -----------------------------------------------------------------------
    #[test]
    fn serialize_read_header() {
        let (_, engine) = make_test_engine();
        let data = engine.serialize().unwrap();
        let header = read_snapshot_header(&data).unwrap();
        assert_eq!(header.tick, 1);
        assert_eq!(header.network_fingerprint, engine.network().fingerprint());
    }

    // -----------------------------------------------------------------------
    // Test 6: snapshot ring buffer evicts oldest
    // -----------------------------------------------------------------------
    #[test]
    fn serialize_snapshot_ring_buffer_evicts_oldest() {
        let mut buffer = SnapshotRingBuffer::new(3);
        for i in 0..5u64 {
            buffer.push(SnapshotEntry {
                tick: i,
                data: vec![i as u8],
            });
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.total_taken(), 5);
        assert_eq!(buffer.get(0).unwrap().tick, 2);
        assert_eq!(buffer.latest().unwrap().tick, 4);
        assert_eq!(buffer.at_or_before(3).unwrap().tick, 3);
        assert!(buffer.at_or_before(1).is_none());

        buffer.clear();
        assert!(buffer.is_empty());
        assert!(buffer.latest().is_none());
    }

    // -----------------------------------------------------------------------
    // Test 7: a restored engine continues in lockstep, queued commands
    // included
    // -----------------------------------------------------------------------
    #[test]
    fn serialize_restored_engine_continues() {
        let (fx, mut engine) = make_test_engine();
        let mut buffer = SnapshotRingBuffer::new(4);
        engine.take_snapshot(&mut buffer).unwrap();
        let mut restored = Engine::restore_snapshot(&buffer, 0, fx.network.clone())
            .unwrap()
            .expect("index 0 should exist");
        assert!(Engine::restore_snapshot(&buffer, 1, fx.network.clone())
            .unwrap()
            .is_none());

        engine.step();
        restored.step();
        assert_eq!(engine.state_hash(), restored.state_hash());

        let train = restored.train_id("t1").unwrap();
        assert_eq!(
            restored.snapshot_train(train).unwrap().occupied,
            vec![SectionId(1), SectionId(0)]
        );

        // New submissions keep counting from the same sequence number.
        let seq_a = engine.submit_position(train, PositionReport::at(vec![fx.pin(1)]));
        let seq_b = restored.submit_position(train, PositionReport::at(vec![fx.pin(1)]));
        assert_eq!(seq_a, seq_b);
    }

    // -----------------------------------------------------------------------
    // Test 8: subsystem hashes locate a divergence
    // -----------------------------------------------------------------------
    #[test]
    fn serialize_subsystem_hashes_locate_divergence() {
        let (fx, mut a) = make_test_engine();
        let mut b = Engine::deserialize(&a.serialize().unwrap(), fx.network.clone()).unwrap();
        assert_eq!(a.subsystem_hashes(), b.subsystem_hashes());

        a.set_permission(fx.signals[1], Permission::Reserved).unwrap();
        a.step();
        b.step();
        let (ha, hb) = (a.subsystem_hashes(), b.subsystem_hashes());
        assert_ne!(ha.signals, hb.signals);
        assert_eq!(ha.sim_state, hb.sim_state);
        assert_eq!(ha.pools, hb.pools);
    }
}
