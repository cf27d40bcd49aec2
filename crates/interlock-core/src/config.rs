//! Engine configuration.
//!
//! Everything here is plain data supplied once at [`Engine::new`]. The static
//! network lives separately in [`TrackNetwork`]; this struct only carries
//! policy knobs.
//!
//! [`Engine::new`]: crate::engine::Engine::new
//! [`TrackNetwork`]: crate::network::TrackNetwork

use crate::fixed::{Fixed64, Ticks};
use crate::sim::SimulationStrategy;
use serde::{Deserialize, Serialize};

/// Order in which same-tick route requests are applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TieBreak {
    /// Submission order.
    #[default]
    RequestOrder,
    /// Higher train priority first, then submission order.
    TrainPriority,
}

/// Engine-wide policy settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub strategy: SimulationStrategy,
    pub tie_break: TieBreak,
    /// Wait applied to connections that do not set their own limit.
    pub connection_timeout: Ticks,
    /// Distance kept between a stopping train and a signal.
    pub standard_signal_clearance: Fixed64,
    /// Distance kept when the stop is marked as a close-up stop.
    pub closeup_signal_clearance: Fixed64,
    /// Longest gap between a berthed train and its exit signal that still
    /// lets the signal claim-lock the section beyond it.
    pub max_claim_distance: Fixed64,
    /// Upper bound on how many signals ahead a request is propagated.
    pub max_propagation: u8,
    /// Ring-buffer capacity per event kind.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strategy: SimulationStrategy::Tick,
            tie_break: TieBreak::RequestOrder,
            connection_timeout: 300,
            standard_signal_clearance: Fixed64::from_num(20),
            closeup_signal_clearance: Fixed64::from_num(5),
            max_claim_distance: Fixed64::from_num(30),
            max_propagation: 4,
            event_capacity: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_request_order() {
        let config = EngineConfig::default();
        assert_eq!(config.tie_break, TieBreak::RequestOrder);
        assert!(config.closeup_signal_clearance < config.standard_signal_clearance);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "tie_break": "TrainPriority", "max_propagation": 2 }"#)
                .unwrap();
        assert_eq!(config.tie_break, TieBreak::TrainPriority);
        assert_eq!(config.max_propagation, 2);
        assert_eq!(config.connection_timeout, 300);
    }
}
