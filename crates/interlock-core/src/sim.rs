//! Simulation strategy, tick state and the state hash.
//!
//! Both strategies run the same six-phase step; they differ only in how
//! many steps one `advance()` call runs.

use crate::command_queue::CommandRecord;
use crate::fixed::{Fixed64, Ticks};

// ---------------------------------------------------------------------------
// Simulation strategy
// ---------------------------------------------------------------------------

/// How the engine advances time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SimulationStrategy {
    /// One step per `advance()` call. The host drives the clock.
    Tick,

    /// The host passes elapsed ticks; the engine runs as many fixed steps
    /// as fit and carries the remainder.
    Delta {
        /// Length of one step in ticks.
        fixed_timestep: Ticks,
    },
}

// ---------------------------------------------------------------------------
// Simulation state
// ---------------------------------------------------------------------------

/// Clock state owned by the engine.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SimState {
    pub tick: Ticks,

    /// Unused remainder in delta mode.
    pub accumulator: Ticks,
}

impl SimState {
    /// Create a new simulation state starting at tick 0.
    pub fn new() -> Self {
        Self {
            tick: 0,
            accumulator: 0,
        }
    }
}

impl Default for SimState {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Advance result
// ---------------------------------------------------------------------------

/// Result of an `Engine::advance()` call.
#[derive(Debug, Default)]
pub struct AdvanceResult {
    pub steps_run: u64,

    /// Outcome of every command applied during these steps, in the order
    /// they were applied.
    pub outcomes: Vec<CommandRecord>,
}

impl AdvanceResult {
    /// Outcome of the command submitted with sequence number `seq`.
    pub fn outcome(&self, seq: u64) -> Option<&CommandRecord> {
        self.outcomes.iter().find(|r| r.seq == seq)
    }
}

// ---------------------------------------------------------------------------
// State hash
// ---------------------------------------------------------------------------

/// FNV-1a (64-bit) over the engine's mutable state. Used for replay
/// checkpoints and desync detection. Not cryptographic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateHash(pub u64);

impl StateHash {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    /// Start a new hash.
    pub fn new() -> Self {
        Self(Self::FNV_OFFSET)
    }

    /// Feed bytes into the hash.
    pub fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(Self::FNV_PRIME);
        }
    }

    /// Feed a u64 into the hash.
    pub fn write_u64(&mut self, v: u64) {
        self.write(&v.to_le_bytes());
    }

    /// Feed a u32 into the hash.
    pub fn write_u32(&mut self, v: u32) {
        self.write(&v.to_le_bytes());
    }

    /// Feed a Fixed64 into the hash.
    pub fn write_fixed64(&mut self, v: Fixed64) {
        self.write(&v.to_bits().to_le_bytes());
    }

    /// Feed an optional u64, distinguishing `None` from every value.
    pub fn write_opt_u64(&mut self, v: Option<u64>) {
        match v {
            None => self.write(&[0]),
            Some(v) => {
                self.write(&[1]);
                self.write_u64(v);
            }
        }
    }

    /// Finalize and return the hash value.
    pub fn finish(self) -> u64 {
        self.0
    }
}

impl Default for StateHash {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_state_starts_at_zero() {
        let state = SimState::new();
        assert_eq!(state.tick, 0);
        assert_eq!(state.accumulator, 0);
    }

    #[test]
    fn state_hash_deterministic() {
        let mut h1 = StateHash::new();
        h1.write_u64(42);
        h1.write_u32(7);

        let mut h2 = StateHash::new();
        h2.write_u64(42);
        h2.write_u32(7);

        assert_eq!(h1.finish(), h2.finish());
    }

    #[test]
    fn state_hash_differs_for_different_inputs() {
        let mut h1 = StateHash::new();
        h1.write_u64(1);

        let mut h2 = StateHash::new();
        h2.write_u64(2);

        assert_ne!(h1.finish(), h2.finish());
    }

    #[test]
    fn strategies_compare_by_timestep() {
        assert_eq!(SimulationStrategy::Tick, SimulationStrategy::Tick);
        assert_ne!(
            SimulationStrategy::Delta { fixed_timestep: 1 },
            SimulationStrategy::Delta { fixed_timestep: 2 }
        );
    }

    #[test]
    fn optional_none_differs_from_zero() {
        let mut a = StateHash::new();
        a.write_opt_u64(None);
        let mut b = StateHash::new();
        b.write_opt_u64(Some(0));
        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn state_hash_order_matters() {
        let mut h1 = StateHash::new();
        h1.write_u32(1);
        h1.write_u32(2);

        let mut h2 = StateHash::new();
        h2.write_u32(2);
        h2.write_u32(1);

        assert_ne!(h1.finish(), h2.finish());
    }
}
