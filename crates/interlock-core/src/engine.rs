//! The interlocking engine: owns all runtime state and runs the six-phase
//! tick pipeline.
//!
//! # Architecture
//!
//! The `Engine` owns:
//! - A shared, immutable [`TrackNetwork`]
//! - Per-section state ([`NetworkState`]), one [`SignalRecord`] per signal,
//!   one [`DeadlockInfo`] per deadlock group and one [`PoolState`] per pool
//! - The registered trains ([`TrainRecord`])
//! - A [`CommandQueue`] and an [`EventBus`]
//!
//! # Six-Phase Pipeline
//!
//! Each `step()` runs:
//! 1. **Pre-tick** -- drain queued commands (including reactive handler
//!    output), order them by class and tie-break, apply them
//! 2. **Occupancy** -- apply position reports: occupy/vacate, progressive
//!    release, deadlock group entry and exit
//! 3. **Stations & pools** -- arrivals, connections, departure clearance,
//!    turntable gates
//! 4. **Signals** -- retry pending requests, approach control, aspects
//! 5. **Post-tick** -- deliver buffered events
//! 6. **Bookkeeping** -- advance the tick counter and compute the state hash

use crate::command_queue::{Command, CommandOutcome, CommandQueue, CommandRecord};
use crate::config::{EngineConfig, TieBreak};
use crate::deadlock::DeadlockInfo;
use crate::event::{EventBus, EventKind};
use crate::fixed::Ticks;
use crate::id::{DeadlockId, PoolId, SectionId, SignalId, TrainId};
use crate::network::{NetworkState, ReservationError, TrackNetwork};
use crate::pool::{PoolError, PoolState};
use crate::route::RouteError;
use crate::signal::{Permission, SignalRecord};
use crate::sim::{AdvanceResult, SimState, SimulationStrategy, StateHash};
use crate::train::{PositionReport, TrainRecord};
use log::{info, trace, warn};
use slotmap::SlotMap;
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Invalid input to an engine operation. Contention is never an error; it
/// comes back as an outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("unknown train {0:?}")]
    UnknownTrain(TrainId),
    #[error("unknown signal {0:?}")]
    UnknownSignal(SignalId),
    #[error("unknown section {0:?}")]
    UnknownSection(SectionId),
    #[error("unknown pool {0:?}")]
    UnknownPool(PoolId),
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error(transparent)]
    Reservation(#[from] ReservationError),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Engine {
    pub(crate) network: Arc<TrackNetwork>,
    pub(crate) config: EngineConfig,

    pub sim_state: SimState,
    pub(crate) paused: bool,

    pub(crate) sections: NetworkState,
    /// Indexed by `SignalId`.
    pub(crate) signals: Vec<SignalRecord>,
    /// Indexed by `DeadlockId`.
    pub(crate) deadlocks: Vec<DeadlockInfo>,
    /// Indexed by `PoolId`.
    pub(crate) pools: Vec<PoolState>,
    pub(crate) trains: SlotMap<TrainId, TrainRecord>,
    /// Arrival tick per (station, train name), for connection waits.
    pub(crate) arrivals: BTreeMap<(String, String), Ticks>,

    pub(crate) last_state_hash: u64,

    pub command_queue: CommandQueue,
    pub event_bus: EventBus,
}

impl Engine {
    pub fn new(network: impl Into<Arc<TrackNetwork>>, config: EngineConfig) -> Self {
        let network = network.into();
        let sections = NetworkState::new(&network);
        let signals = network.signals().iter().map(SignalRecord::new).collect();
        let deadlocks = network
            .deadlock_groups()
            .iter()
            .enumerate()
            .map(|(i, def)| DeadlockInfo::new(DeadlockId(i as u32), def, &network))
            .collect();
        let pools = network.pools().iter().map(PoolState::new).collect();
        let event_bus = EventBus::new(config.event_capacity);
        Self {
            network,
            config,
            sim_state: SimState::new(),
            paused: false,
            sections,
            signals,
            deadlocks,
            pools,
            trains: SlotMap::with_key(),
            arrivals: BTreeMap::new(),
            last_state_hash: 0,
            command_queue: CommandQueue::new(),
            event_bus,
        }
    }

    pub fn network(&self) -> &TrackNetwork {
        &self.network
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Queue a command for the next tick. Returns its sequence number.
    pub fn submit(&mut self, command: Command) -> u64 {
        self.command_queue.push(command)
    }

    /// Convenience for [`Command::RequestRoute`].
    pub fn submit_route(&mut self, train: TrainId, signal: SignalId, path: Vec<SectionId>) -> u64 {
        self.submit(Command::RequestRoute {
            train,
            signal,
            path,
        })
    }

    /// Convenience for [`Command::ReportPosition`].
    pub fn submit_position(&mut self, train: TrainId, report: PositionReport) -> u64 {
        self.submit(Command::ReportPosition { train, report })
    }

    /// Dispatcher override on a signal.
    pub fn set_permission(&mut self, signal: SignalId, permission: Permission) -> Result<(), EngineError> {
        let record = self
            .signals
            .get_mut(signal.index())
            .ok_or(EngineError::UnknownSignal(signal))?;
        if record.permission != permission {
            info!("signal {signal:?}: permission {:?} -> {permission:?}", record.permission);
            record.permission = permission;
        }
        Ok(())
    }

    fn execute(&mut self, seq: u64, command: Command) -> CommandOutcome {
        let result = match command {
            Command::RequestRoute {
                train,
                signal,
                path,
            } => self
                .request_route(train, signal, &path, seq)
                .map(CommandOutcome::Route),
            Command::WithdrawRoute { signal } => {
                self.withdraw_route(signal).map(CommandOutcome::Withdraw)
            }
            Command::SetPermission { signal, permission } => self
                .set_permission(signal, permission)
                .map(|()| CommandOutcome::PermissionSet),
            Command::ReportPosition { train, report } => self
                .apply_position(train, report)
                .map(|()| CommandOutcome::PositionApplied),
            Command::ClaimStorage { train, pool } => {
                self.claim_storage(train, pool).map(CommandOutcome::Claim)
            }
            Command::StoreTrain { train, pool } => {
                self.store_train(train, pool).map(CommandOutcome::Stored)
            }
            Command::ReleaseStorage { train, pool } => self
                .release_storage(train, pool)
                .map(CommandOutcome::StorageReleased),
            Command::RemoveTrain { train } => self
                .remove_train(train)
                .map(|()| CommandOutcome::TrainRemoved),
        };
        result.unwrap_or_else(|e| {
            warn!("command {seq} rejected: {e}");
            CommandOutcome::Rejected(e)
        })
    }

    // -----------------------------------------------------------------------
    // State hash
    // -----------------------------------------------------------------------

    pub fn state_hash(&self) -> u64 {
        self.last_state_hash
    }

    // -----------------------------------------------------------------------
    // Pause / Resume
    // -----------------------------------------------------------------------

    /// While paused, `advance()` and `step()` are no-ops. Commands still
    /// queue.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    // -----------------------------------------------------------------------
    // Event system
    // -----------------------------------------------------------------------

    pub fn suppress_event(&mut self, kind: EventKind) {
        self.event_bus.suppress(kind);
    }

    pub fn on_passive(&mut self, kind: EventKind, listener: crate::event::PassiveListener) {
        self.event_bus.on_passive(kind, listener);
    }

    pub fn on_reactive(&mut self, kind: EventKind, handler: crate::event::ReactiveHandler) {
        self.event_bus.on_reactive(kind, handler);
    }

    // -----------------------------------------------------------------------
    // Advance
    // -----------------------------------------------------------------------

    /// Advance according to the configured strategy. In tick mode `dt` is
    /// ignored and exactly one step runs.
    pub fn advance(&mut self, dt: Ticks) -> AdvanceResult {
        let mut result = AdvanceResult::default();
        if self.paused {
            return result;
        }
        match self.config.strategy {
            SimulationStrategy::Tick => self.step_internal(&mut result),
            SimulationStrategy::Delta { fixed_timestep } => {
                self.sim_state.accumulator += dt;
                let step_size = fixed_timestep.max(1);
                while self.sim_state.accumulator >= step_size {
                    self.sim_state.accumulator -= step_size;
                    self.step_internal(&mut result);
                }
            }
        }
        result
    }

    pub fn step(&mut self) -> AdvanceResult {
        self.advance(0)
    }

    fn step_internal(&mut self, result: &mut AdvanceResult) {
        let reports = self.phase_pre_tick(result);
        self.phase_occupancy(reports, result);
        self.phase_stations();
        self.phase_pools();
        self.phase_signals();
        self.phase_post_tick();
        self.phase_bookkeeping();
        result.steps_run += 1;
    }

    // -----------------------------------------------------------------------
    // Phase 1: Pre-tick
    // -----------------------------------------------------------------------

    /// Apply queued commands. Position reports are handed back for the
    /// occupancy phase.
    fn phase_pre_tick(&mut self, result: &mut AdvanceResult) -> Vec<(u64, TrainId, PositionReport)> {
        let reactive = self.event_bus.drain_commands();
        self.command_queue.push_batch(reactive);

        let tick = self.sim_state.tick;
        let mut commands = self.command_queue.drain(tick);
        let tie_break = self.config.tie_break;
        let trains = &self.trains;
        commands.sort_by_key(|(seq, command)| {
            let priority = match tie_break {
                TieBreak::RequestOrder => 0,
                TieBreak::TrainPriority => command
                    .train()
                    .and_then(|t| trains.get(t))
                    .map_or(0, |t| t.def.priority),
            };
            (command.class(), Reverse(priority), *seq)
        });

        let mut reports = Vec::new();
        for (seq, command) in commands {
            if let Command::ReportPosition { train, report } = command {
                reports.push((seq, train, report));
                continue;
            }
            let outcome = self.execute(seq, command);
            result.outcomes.push(CommandRecord { tick, seq, outcome });
        }
        reports
    }

    // -----------------------------------------------------------------------
    // Phase 2: Occupancy
    // -----------------------------------------------------------------------

    fn phase_occupancy(&mut self, reports: Vec<(u64, TrainId, PositionReport)>, result: &mut AdvanceResult) {
        let tick = self.sim_state.tick;
        for (seq, train, report) in reports {
            let outcome = self.execute(seq, Command::ReportPosition { train, report });
            result.outcomes.push(CommandRecord { tick, seq, outcome });
        }
    }

    // -----------------------------------------------------------------------
    // Phase 4: Signals
    // -----------------------------------------------------------------------

    fn phase_signals(&mut self) {
        self.retry_pending_requests();
        self.evaluate_approach_control();
        self.update_aspects();
    }

    // -----------------------------------------------------------------------
    // Phase 5: Post-tick
    // -----------------------------------------------------------------------

    fn phase_post_tick(&mut self) {
        self.event_bus.deliver();
    }

    // -----------------------------------------------------------------------
    // Phase 6: Bookkeeping
    // -----------------------------------------------------------------------

    fn phase_bookkeeping(&mut self) {
        self.sim_state.tick += 1;
        self.last_state_hash = self.compute_state_hash();
        trace!("tick {} hash {:016x}", self.sim_state.tick, self.last_state_hash);
    }

    /// Deterministic hash over every piece of mutable interlocking state.
    pub(crate) fn compute_state_hash(&self) -> u64 {
        let mut h = StateHash::new();
        h.write_u64(self.sim_state.tick);
        self.hash_sections(&mut h);
        self.hash_signals(&mut h);
        self.hash_deadlocks(&mut h);
        self.hash_pools(&mut h);
        self.hash_trains(&mut h);
        h.finish()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
