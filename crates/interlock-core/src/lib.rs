//! Interlock Core -- the signalling and route-reservation engine for rail
//! simulations.
//!
//! This crate provides the track network, route building, signal state
//! machines, deadlock arbitration for single-track sections, storage pools
//! with turntable gates, station stop control, events, queries,
//! serialization, and deterministic fixed-point arithmetic.
//!
//! Train movement is not modelled here. A movement model reports each
//! train's occupied sections, speed and distance to the next signal; the
//! engine answers with reservations and aspects.
//!
//! # Six-Phase Tick Pipeline
//!
//! Each call to [`engine::Engine::step`] advances the interlocking by one
//! tick:
//!
//! 1. **Pre-tick** -- Apply queued commands: route requests, withdrawals,
//!    permissions, storage claims, train removal.
//! 2. **Occupancy** -- Apply position reports: occupy and vacate sections,
//!    release behind the train, track deadlock group entry and exit.
//! 3. **Stations & pools** -- Arrivals, connections, departure clearance,
//!    turntable gates.
//! 4. **Signals** -- Retry pending requests, approach control, aspects.
//! 5. **Post-tick** -- Deliver buffered events.
//! 6. **Bookkeeping** -- Increment the tick counter and compute the state
//!    hash.
//!
//! # Command Pattern
//!
//! Inputs are queued and applied at the next tick boundary, never
//! immediately:
//!
//! ```rust,ignore
//! let seq = engine.submit_route(train, signal, path);
//! let result = engine.step();
//! let outcome = result.outcome(seq);
//! ```
//!
//! # Key Types
//!
//! - [`engine::Engine`] -- Runtime state and pipeline orchestrator.
//! - [`network::TrackNetwork`] -- Immutable sections, links, signals,
//!   deadlock groups and pools, built with [`network::NetworkBuilder`].
//! - [`route::PartialPathRoute`] -- A validated, ordered run of sections.
//! - [`signal::SignalRecord`] -- Per-signal route state and aspect.
//! - [`deadlock::DeadlockInfo`] -- Direction arbitration for one group.
//! - [`pool::PoolState`] -- Storage tracks and the turntable gate.
//! - [`station::StationStop`] -- Per-stop arrival and departure control.
//! - [`fixed::Fixed64`] -- Q32.32 fixed-point type for deterministic math.
//! - [`event::EventBus`] -- Subscription-based event bus with buffered
//!   delivery.
//! - [`serialize`] -- Versioned snapshots via bitcode.

/// Log and abort on a broken internal invariant. Never used for bad input.
macro_rules! halt {
    ($($arg:tt)+) => {{
        log::error!($($arg)+);
        panic!($($arg)+)
    }};
}

pub mod command_queue;
pub mod config;
pub mod deadlock;
pub mod engine;
pub mod event;
pub mod fixed;
pub mod id;
pub mod network;
pub mod pool;
pub mod query;
pub mod replay;
pub mod route;
pub mod serialize;
pub mod signal;
pub mod sim;
pub mod station;
pub mod train;
pub mod validation;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
