//! State comparison and determinism checking.
//!
//! Compares two engine states to find where they diverge, and checks that
//! running the same snapshot twice gives identical results. Two
//! interlockings fed the same inputs must agree tick for tick.

use crate::engine::Engine;
use crate::id::{SectionId, SignalId, TrainId};
use crate::network::TrackNetwork;
use crate::serialize::DeserializeError;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// State diff types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectionDiff {
    /// Reservation, occupancy, claims, alignment or locks differ.
    StateMismatch { section: SectionId, description: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalDiff {
    StateMismatch { signal: SignalId, description: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrainDiff {
    OnlyInA(TrainId),
    OnlyInB(TrainId),
    StateMismatch { train: TrainId, description: String },
}

/// Per-subsystem match results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubsystemDiff {
    pub sections_match: bool,
    pub signals_match: bool,
    pub deadlocks_match: bool,
    pub pools_match: bool,
    pub trains_match: bool,
    pub sim_state_matches: bool,
}

impl SubsystemDiff {
    pub fn all_match(&self) -> bool {
        self.sections_match
            && self.signals_match
            && self.deadlocks_match
            && self.pools_match
            && self.trains_match
            && self.sim_state_matches
    }
}

#[derive(Debug, Clone)]
pub struct StateDiff {
    pub is_identical: bool,
    pub subsystem_diffs: SubsystemDiff,
    pub section_diffs: Vec<SectionDiff>,
    pub signal_diffs: Vec<SignalDiff>,
    pub train_diffs: Vec<TrainDiff>,
}

// ---------------------------------------------------------------------------
// Quick compare (subsystem-level only)
// ---------------------------------------------------------------------------

pub fn quick_compare(a: &Engine, b: &Engine) -> SubsystemDiff {
    let ha = a.subsystem_hashes();
    let hb = b.subsystem_hashes();
    SubsystemDiff {
        sections_match: ha.sections == hb.sections,
        signals_match: ha.signals == hb.signals,
        deadlocks_match: ha.deadlocks == hb.deadlocks,
        pools_match: ha.pools == hb.pools,
        trains_match: ha.trains == hb.trains,
        sim_state_matches: ha.sim_state == hb.sim_state,
    }
}

// ---------------------------------------------------------------------------
// Full diff
// ---------------------------------------------------------------------------

/// Detailed diff between two engines running on the same network.
pub fn diff_engines(a: &Engine, b: &Engine) -> StateDiff {
    let subsystem_diffs = quick_compare(a, b);

    let mut section_diffs = Vec::new();
    for ((id, sa), (_, sb)) in a.sections.iter().zip(b.sections.iter()) {
        let mut mismatches = Vec::new();
        if sa.reserved_by() != sb.reserved_by() {
            mismatches.push("reservation");
        }
        if sa.occupant() != sb.occupant() {
            mismatches.push("occupancy");
        }
        if sa.claims != sb.claims {
            mismatches.push("claims");
        }
        if sa.alignment != sb.alignment {
            mismatches.push("alignment");
        }
        if sa.junction_locks != sb.junction_locks {
            mismatches.push("junction_locks");
        }
        if !mismatches.is_empty() {
            section_diffs.push(SectionDiff::StateMismatch {
                section: id,
                description: mismatches.join(", "),
            });
        }
    }

    let mut signal_diffs = Vec::new();
    for (index, (ra, rb)) in a.signals.iter().zip(b.signals.iter()).enumerate() {
        let mut mismatches = Vec::new();
        if ra.state != rb.state {
            mismatches.push("state");
        }
        if ra.aspect != rb.aspect {
            mismatches.push("aspect");
        }
        if ra.permission != rb.permission {
            mismatches.push("permission");
        }
        if ra.enabled_train != rb.enabled_train {
            mismatches.push("enabled_train");
        }
        if ra.route != rb.route {
            mismatches.push("route");
        }
        if ra.request != rb.request {
            mismatches.push("request");
        }
        if ra.flags != rb.flags {
            mismatches.push("flags");
        }
        if !mismatches.is_empty() {
            signal_diffs.push(SignalDiff::StateMismatch {
                signal: SignalId(index as u32),
                description: mismatches.join(", "),
            });
        }
    }

    let mut train_diffs = Vec::new();
    for (id, ta) in &a.trains {
        match b.trains.get(id) {
            None => train_diffs.push(TrainDiff::OnlyInA(id)),
            Some(tb) => {
                let mut mismatches = Vec::new();
                if ta.position != tb.position {
                    mismatches.push("position");
                }
                if ta.stops != tb.stops {
                    mismatches.push("stops");
                }
                if ta.completed != tb.completed {
                    mismatches.push("completed");
                }
                if !mismatches.is_empty() {
                    train_diffs.push(TrainDiff::StateMismatch {
                        train: id,
                        description: mismatches.join(", "),
                    });
                }
            }
        }
    }
    for (id, _) in &b.trains {
        if !a.trains.contains_key(id) {
            train_diffs.push(TrainDiff::OnlyInB(id));
        }
    }

    let is_identical = section_diffs.is_empty()
        && signal_diffs.is_empty()
        && train_diffs.is_empty()
        && subsystem_diffs.all_match();

    StateDiff {
        is_identical,
        subsystem_diffs,
        section_diffs,
        signal_diffs,
        train_diffs,
    }
}

// ---------------------------------------------------------------------------
// Determinism validation
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct DeterminismResult {
    pub is_deterministic: bool,
    /// First tick whose hashes differ.
    pub divergence_tick: Option<u64>,
    /// (tick, hash_run1, hash_run2) per tick.
    pub hash_log: Vec<(u64, u64, u64)>,
}

/// Run the same snapshot twice for `ticks` steps and compare hashes.
pub fn validate_determinism(
    snapshot_data: &[u8],
    network: Arc<TrackNetwork>,
    ticks: u64,
) -> Result<DeterminismResult, DeserializeError> {
    let mut engine_a = Engine::deserialize(snapshot_data, Arc::clone(&network))?;
    let mut engine_b = Engine::deserialize(snapshot_data, network)?;

    let mut hash_log = Vec::new();
    let mut divergence_tick = None;

    for _ in 0..ticks {
        engine_a.step();
        engine_b.step();

        let hash_a = engine_a.state_hash();
        let hash_b = engine_b.state_hash();
        let tick = engine_a.sim_state.tick;
        hash_log.push((tick, hash_a, hash_b));

        if hash_a != hash_b && divergence_tick.is_none() {
            divergence_tick = Some(tick);
        }
    }

    Ok(DeterminismResult {
        is_deterministic: divergence_tick.is_none(),
        divergence_tick,
        hash_log,
    })
}

// ===========================================================================
// Tests
// ===========================================================================
