//! Signal state machine.
//!
//! Each signal is a single tagged record ([`SignalRecord`]) that moves
//! through `NoRoute -> RouteRequested -> PartialRouteCleared ->
//! FullRouteCleared -> Withdrawing -> NoRoute`. Approach control, claim
//! locking, station holds and turntable gates are orthogonal
//! [`SignalFlags`] layered on top.
//!
//! The request, reservation and release algorithm lives here as an
//! `impl Engine` block because it mutates sections, deadlock groups and
//! signal records together.

use crate::deadlock::DeadlockDecision;
use crate::engine::{Engine, EngineError};
use crate::event::Event;
use crate::fixed::Fixed64;
use crate::id::{DeadlockId, PathId, SectionId, SignalId, TrainId};
use crate::network::{Direction, Pin, TrackNetwork};
use crate::route::{build_route, is_junction, AltMarker, PartialPathRoute, RouteElement};
use crate::station::StopState;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Static definition
// ---------------------------------------------------------------------------

/// Approach-control envelope: the signal stays at stop until the train is
/// this close (and, optionally, this slow).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproachControl {
    pub distance: Fixed64,
    pub max_speed: Option<Fixed64>,
}

/// Static configuration of one signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalDef {
    pub name: String,
    /// The signal stands at the exit of this section...
    pub section: SectionId,
    /// ...for trains travelling in this direction.
    pub direction: Direction,
    pub allow_partial_route: bool,
    /// Show a restricting aspect over a partial route.
    pub allow_partial_clear: bool,
    pub claim_lock: bool,
    pub approach_control: Option<ApproachControl>,
    pub force_propagation_on_approach_control: bool,
    /// How many signals ahead a request is propagated immediately.
    pub clear_ahead: u8,
}

impl SignalDef {
    pub fn new(name: &str, section: SectionId, direction: Direction) -> Self {
        Self {
            name: name.to_string(),
            section,
            direction,
            allow_partial_route: true,
            allow_partial_clear: false,
            claim_lock: false,
            approach_control: None,
            force_propagation_on_approach_control: false,
            clear_ahead: 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Runtime types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalState {
    NoRoute,
    RouteRequested,
    PartialRouteCleared,
    FullRouteCleared,
    Withdrawing,
}

/// Displayed aspect, most restrictive first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Aspect {
    Stop,
    Restricting,
    Approach,
    Clear,
}

/// Dispatcher permission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Permission {
    #[default]
    Normal,
    /// Held at stop by the dispatcher.
    Reserved,
    /// Call-on: at least restricting.
    Overridden,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct SignalFlags: u16 {
        const FULL_ROUTE_CLEARED    = 1 << 0;
        const PARTIAL_ROUTE_ALLOWED = 1 << 1;
        const PROPAGATED_AHEAD      = 1 << 2;
        const CLAIM_LOCKED          = 1 << 3;
        const APPROACH_ACTIVE       = 1 << 4;
        const APPROACH_CLEARED      = 1 << 5;
        const TRAIN_PASSED          = 1 << 6;
        /// Held by a station stop.
        const HELD                  = 1 << 7;
        /// Held by a pool turntable gate.
        const GATED                 = 1 << 8;
    }
}

/// Why a request could not reserve further.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockReason {
    Reserved { section: SectionId, by: TrainId },
    Occupied { section: SectionId, by: TrainId },
    Claimed { section: SectionId, by: TrainId },
    JunctionLocked { section: SectionId },
    DeadlockQueued { group: DeadlockId, behind: TrainId },
    SignalBusy { serving: TrainId },
    /// The signal has no request to work on.
    NoRequest,
}

/// Status of a route request. Contention is reported here, not as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteOutcome {
    FullRouteCleared,
    PartialRouteCleared { reserved: usize, reason: BlockReason },
    /// Nothing reserved yet; the request stays pending.
    Waiting { reason: BlockReason },
    /// The signal may not clear a partial route, or is serving another
    /// train.
    NoRoute { reason: BlockReason },
    PathTooShort { group: DeadlockId, path: PathId },
}

/// Result of a dispatcher withdrawal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WithdrawOutcome {
    Withdrawn { released: usize },
    /// Some sections are still occupied; the signal stays in `Withdrawing`.
    Withdrawing { released: usize, held: usize },
    AlreadyClear,
}

/// A route request being worked on by a signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRequest {
    pub train: TrainId,
    /// Elements up to the next signal still to be reserved.
    pub pending: Vec<RouteElement>,
    /// Elements beyond the next signal, handed over once this signal clears.
    pub remainder: PartialPathRoute,
    pub next_signal: Option<SignalId>,
    pub order: u64,
    /// Signals between the train and this one.
    pub depth: u8,
    pub propagation_limit: u8,
    pub last_block: Option<BlockReason>,
}

/// Runtime state of one signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalRecord {
    pub state: SignalState,
    pub aspect: Aspect,
    pub request: Option<RouteRequest>,
    /// Reserved part of the route, front first.
    pub route: PartialPathRoute,
    pub enabled_train: Option<TrainId>,
    pub flags: SignalFlags,
    pub permission: Permission,
    /// Junctions locked by this route, in locking order.
    pub junctions_passed: Vec<SectionId>,
    /// Trains this signal's train waits for in deadlock groups.
    pub locked_trains: Vec<TrainId>,
    pub claimed_section: Option<SectionId>,
    pub propagated_to: Option<SignalId>,
}

impl SignalRecord {
    pub fn new(def: &SignalDef) -> Self {
        let mut flags = SignalFlags::empty();
        flags.set(SignalFlags::PARTIAL_ROUTE_ALLOWED, def.allow_partial_route);
        Self {
            state: SignalState::NoRoute,
            aspect: Aspect::Stop,
            request: None,
            route: PartialPathRoute::default(),
            enabled_train: None,
            flags,
            permission: Permission::Normal,
            junctions_passed: Vec::new(),
            locked_trains: Vec::new(),
            claimed_section: None,
            propagated_to: None,
        }
    }

    fn reset(&mut self, def: &SignalDef) {
        let permission = self.permission;
        let aspect = self.aspect;
        let held = self.flags & (SignalFlags::HELD | SignalFlags::GATED);
        *self = SignalRecord::new(def);
        self.permission = permission;
        self.aspect = aspect;
        self.flags |= held;
    }

    /// Whether anything is pending or reserved.
    pub fn is_active(&self) -> bool {
        self.state != SignalState::NoRoute
    }

    fn approach_pending(&self, def: &SignalDef) -> bool {
        def.approach_control.is_some() && !self.flags.contains(SignalFlags::APPROACH_CLEARED)
    }
}

/// Cut `route` at the first element whose exit carries a signal in the
/// direction of travel. Returns the head, the tail, and that signal.
pub(crate) fn split_at_signal(
    network: &TrackNetwork,
    mut route: PartialPathRoute,
) -> (PartialPathRoute, PartialPathRoute, Option<SignalId>) {
    let hit = route
        .elements
        .iter()
        .enumerate()
        .find_map(|(i, e)| network.signal_at_exit(e.section, e.direction).map(|s| (i, s)));
    match hit {
        Some((i, signal)) => {
            let tail = route.split_after(i);
            (route, tail, Some(signal))
        }
        None => (route, PartialPathRoute::default(), None),
    }
}

enum Step {
    Reserved,
    Blocked(BlockReason),
    TooShort(AltMarker),
}

// ---------------------------------------------------------------------------
// Engine: request / reserve / release
// ---------------------------------------------------------------------------

impl Engine {
    pub(crate) fn request_route(
        &mut self,
        train: TrainId,
        signal: SignalId,
        path: &[SectionId],
        order: u64,
    ) -> Result<RouteOutcome, EngineError> {
        let network = Arc::clone(&self.network);
        let def = network
            .signal(signal)
            .ok_or(EngineError::UnknownSignal(signal))?;
        if !self.trains.contains_key(train) {
            return Err(EngineError::UnknownTrain(train));
        }
        let mut route = build_route(&network, Pin::new(def.section, def.direction), path)?;

        let record = &self.signals[signal.index()];
        if let Some(serving) = record.enabled_train.filter(|t| *t != train) {
            if record.is_active() {
                return Ok(RouteOutcome::NoRoute {
                    reason: BlockReason::SignalBusy { serving },
                });
            }
        }
        let extends_current = record.enabled_train == Some(train)
            && !record.route.is_empty()
            && record.state != SignalState::Withdrawing
            && route.len() >= record.route.len()
            && record
                .route
                .sections()
                .zip(route.sections())
                .all(|(held, wanted)| held == wanted);
        if extends_current {
            // Only the unreserved part changes.
            debug!("signal {:?}: request from {:?} extends its route", signal, train);
            let reserved = record.route.len();
            route.elements.drain(..reserved);
        } else if record.is_active() {
            self.withdraw_route(signal)?;
            if self.signals[signal.index()].is_active() {
                return Ok(RouteOutcome::NoRoute {
                    reason: BlockReason::SignalBusy { serving: train },
                });
            }
        }

        let (local, remainder, next_signal) = split_at_signal(&network, route);
        let limit = def.clear_ahead.min(self.config.max_propagation);

        let record = &mut self.signals[signal.index()];
        record.request = Some(RouteRequest {
            train,
            pending: local.elements,
            remainder,
            next_signal,
            order,
            depth: 0,
            propagation_limit: limit,
            last_block: None,
        });
        record.enabled_train = Some(train);
        if record.route.is_empty() {
            record.state = SignalState::RouteRequested;
        }
        record.flags.remove(SignalFlags::PROPAGATED_AHEAD);
        debug!("signal {:?}: route requested by {:?}", signal, train);
        Ok(self.process_request(signal))
    }

    /// Try to extend the signal's reservation over its pending elements.
    pub(crate) fn process_request(&mut self, signal: SignalId) -> RouteOutcome {
        let network = Arc::clone(&self.network);
        let Some(def) = network.signal(signal) else {
            halt!("signal {signal:?} missing from network");
        };
        let Some(request) = self.signals[signal.index()].request.clone() else {
            return self.settled_outcome(signal);
        };
        let was_full = self.signals[signal.index()].state == SignalState::FullRouteCleared;

        let mut reserved_now = 0usize;
        let mut block = None;
        let mut too_short = None;
        for element in &request.pending {
            match self.try_reserve(&network, signal, def, request.train, element, request.order) {
                Step::Reserved => {
                    reserved_now += 1;
                    self.signals[signal.index()].route.elements.push(*element);
                }
                Step::Blocked(reason) => {
                    block = Some(reason);
                    break;
                }
                Step::TooShort(marker) => {
                    too_short = Some(marker);
                    break;
                }
            }
        }
        if let Some(req) = self.signals[signal.index()].request.as_mut() {
            req.pending.drain(..reserved_now);
            req.last_block = block;
        }

        if let Some(marker) = too_short {
            self.rollback(signal, reserved_now);
            info!(
                "signal {:?}: {:?} does not fit path {:?} of group {:?}",
                signal, request.train, marker.path, marker.group
            );
            self.abandon_request(signal);
            return RouteOutcome::PathTooShort {
                group: marker.group,
                path: marker.path,
            };
        }

        let tick = self.sim_state.tick;
        match block {
            Some(reason) if !def.allow_partial_route => {
                self.rollback(signal, reserved_now);
                let record = &mut self.signals[signal.index()];
                if record.route.is_empty() {
                    record.state = SignalState::RouteRequested;
                }
                debug!("signal {:?}: full extent unavailable ({:?})", signal, reason);
                RouteOutcome::NoRoute { reason }
            }
            Some(reason) => {
                let record = &mut self.signals[signal.index()];
                if record.route.is_empty() {
                    record.state = SignalState::RouteRequested;
                    RouteOutcome::Waiting { reason }
                } else {
                    if record.state != SignalState::PartialRouteCleared {
                        record.state = SignalState::PartialRouteCleared;
                        self.event_bus.emit(Event::RouteCleared {
                            signal,
                            train: request.train,
                            full: false,
                            tick,
                        });
                    }
                    RouteOutcome::PartialRouteCleared {
                        reserved: self.signals[signal.index()].route.len(),
                        reason,
                    }
                }
            }
            None => {
                let record = &mut self.signals[signal.index()];
                record.state = SignalState::FullRouteCleared;
                record.flags.insert(SignalFlags::FULL_ROUTE_CLEARED);
                if !was_full {
                    info!("signal {:?}: full route cleared for {:?}", signal, request.train);
                    self.event_bus.emit(Event::RouteCleared {
                        signal,
                        train: request.train,
                        full: true,
                        tick,
                    });
                }
                self.propagate(signal);
                RouteOutcome::FullRouteCleared
            }
        }
    }

    fn settled_outcome(&self, signal: SignalId) -> RouteOutcome {
        let record = &self.signals[signal.index()];
        match (record.state, record.enabled_train) {
            (SignalState::FullRouteCleared | SignalState::Withdrawing, _) => {
                RouteOutcome::FullRouteCleared
            }
            (_, Some(serving)) if record.is_active() => RouteOutcome::NoRoute {
                reason: BlockReason::SignalBusy { serving },
            },
            _ => RouteOutcome::NoRoute {
                reason: BlockReason::NoRequest,
            },
        }
    }

    fn try_reserve(
        &mut self,
        network: &TrackNetwork,
        signal: SignalId,
        def: &SignalDef,
        train: TrainId,
        element: &RouteElement,
        order: u64,
    ) -> Step {
        let section = element.section;
        let already_held = self
            .sections
            .section(section)
            .is_some_and(|s| s.reserved_by() == Some(train));

        if let Some(marker) = element.alt_start {
            if !already_held {
                let decision = match self.deadlocks.get_mut(marker.group.index()) {
                    Some(info) => info.request(train, marker.path, marker.reversed, order),
                    None => halt!("route marker names unknown group {:?}", marker.group),
                };
                match decision {
                    DeadlockDecision::Granted => {}
                    DeadlockDecision::Queued { behind } => {
                        let record = &mut self.signals[signal.index()];
                        if !record.locked_trains.contains(&behind) {
                            record.locked_trains.push(behind);
                            self.event_bus.emit(Event::RouteQueued {
                                signal,
                                train,
                                behind,
                                tick: self.sim_state.tick,
                            });
                        }
                        return Step::Blocked(BlockReason::DeadlockQueued {
                            group: marker.group,
                            behind,
                        });
                    }
                    DeadlockDecision::PathTooShort => return Step::TooShort(marker),
                }
            }
        }

        let (blocked, current_alignment) = {
            let Some(state) = self.sections.section(section) else {
                halt!("route element {section:?} outside the network");
            };
            let blocked = if let Some(by) = state.occupant().filter(|t| *t != train) {
                Some(BlockReason::Occupied { section, by })
            } else if let Some(by) = state.reserved_by().filter(|t| *t != train) {
                Some(BlockReason::Reserved { section, by })
            } else {
                state
                    .claims
                    .first()
                    .filter(|t| **t != train)
                    .map(|by| BlockReason::Claimed { section, by: *by })
            };
            (blocked, state.alignment)
        };
        if let Some(reason) = blocked {
            if def.claim_lock && !self.claim_suppressed(signal, train) {
                self.claim_lock(signal, train, section);
            }
            return Step::Blocked(reason);
        }

        let junction = is_junction(network, section);
        if let (true, Some(alignment)) = (junction, element.alignment) {
            if current_alignment != alignment {
                if self
                    .sections
                    .set_alignment(network, section, alignment, Some(train))
                    .is_err()
                {
                    return Step::Blocked(BlockReason::JunctionLocked { section });
                }
                debug!("junction {:?} set to {} for {:?}", section, alignment, train);
            }
        }

        if let Err(e) = self.sections.reserve(section, train, element.direction) {
            halt!("signal {signal:?}: reservation of checked section failed: {e}");
        }
        let record = &mut self.signals[signal.index()];
        if junction && element.alignment.is_some() {
            if let Err(e) = self.sections.lock_junction(section, signal) {
                halt!("signal {signal:?}: junction lock failed: {e}");
            }
            record.junctions_passed.push(section);
        }
        if record.claimed_section == Some(section) {
            record.claimed_section = None;
            record.flags.remove(SignalFlags::CLAIM_LOCKED);
        }
        debug!("section {:?} reserved for {:?} by signal {:?}", section, train, signal);
        self.event_bus.emit(Event::SectionReserved {
            section,
            train,
            tick: self.sim_state.tick,
        });
        Step::Reserved
    }

    fn claim_lock(&mut self, signal: SignalId, train: TrainId, section: SectionId) {
        let record = &mut self.signals[signal.index()];
        if let Some(previous) = record.claimed_section.filter(|s| *s != section) {
            self.sections.unclaim(previous, train);
        }
        if self.sections.claim(section, train).is_ok() {
            record.claimed_section = Some(section);
            record.flags.insert(SignalFlags::CLAIM_LOCKED);
        }
    }

    /// A berthed train does not claim-lock at its exit signal when its stop
    /// says `NO_CLAIM` or it stands too far short of the signal.
    fn claim_suppressed(&self, signal: SignalId, train: TrainId) -> bool {
        self.trains
            .get(train)
            .and_then(|t| t.stops.front())
            .is_some_and(|stop| {
                stop.def.exit_signal == Some(signal)
                    && matches!(stop.state, StopState::Berthed | StopState::DepartureCleared)
                    && !stop.allows_claim(&self.config)
            })
    }

    /// Undo the last `count` reservations of this signal's route, putting the
    /// elements back at the front of the pending list.
    fn rollback(&mut self, signal: SignalId, count: usize) {
        if count == 0 {
            return;
        }
        let record = &mut self.signals[signal.index()];
        let Some(train) = record.request.as_ref().map(|r| r.train) else {
            return;
        };
        let keep = record.route.len().saturating_sub(count);
        let undone: Vec<RouteElement> = record.route.elements.split_off(keep);
        for element in undone.iter().rev() {
            self.release_element(signal, train, element.section);
        }
        if let Some(req) = self.signals[signal.index()].request.as_mut() {
            req.pending.splice(0..0, undone);
        }
    }

    /// Release one reserved section of this signal's route and its junction
    /// lock. Ownership violations halt.
    fn release_element(&mut self, signal: SignalId, train: TrainId, section: SectionId) {
        match self.sections.release(section, train) {
            Ok(_) => {}
            Err(e) => halt!("signal {signal:?}: release of {section:?} failed: {e}"),
        }
        let record = &mut self.signals[signal.index()];
        if let Some(pos) = record.junctions_passed.iter().rposition(|s| *s == section) {
            record.junctions_passed.remove(pos);
            if !self.sections.unlock_junction(section, signal) {
                halt!("signal {signal:?}: junction {section:?} was not locked");
            }
        }
        self.event_bus.emit(Event::SectionReleased {
            section,
            train,
            tick: self.sim_state.tick,
        });
    }

    /// Drop the request entirely and free whatever it holds.
    fn abandon_request(&mut self, signal: SignalId) {
        let record = &self.signals[signal.index()];
        if record.route.is_empty() {
            self.finish_route(signal);
        } else if let Some(req) = self.signals[signal.index()].request.as_mut() {
            req.pending.clear();
            req.remainder = PartialPathRoute::default();
        }
    }

    /// Hand the remainder of a fully cleared request to the next signal.
    pub(crate) fn propagate(&mut self, signal: SignalId) {
        let network = Arc::clone(&self.network);
        let Some(def) = network.signal(signal) else {
            return;
        };
        let record = &self.signals[signal.index()];
        if record.state != SignalState::FullRouteCleared
            || record.flags.contains(SignalFlags::PROPAGATED_AHEAD)
        {
            return;
        }
        let Some(request) = record.request.clone() else {
            return;
        };
        let Some(next) = request.next_signal else {
            return;
        };
        if request.remainder.is_empty() {
            return;
        }
        if record.approach_pending(def) && !def.force_propagation_on_approach_control {
            return;
        }
        let passed = record.flags.contains(SignalFlags::TRAIN_PASSED);
        if request.depth >= request.propagation_limit && !passed {
            return;
        }
        let train = request.train;
        let next_record = &self.signals[next.index()];
        if next_record.is_active() && next_record.enabled_train != Some(train) {
            return;
        }
        if next_record.is_active() {
            // Already working for this train.
            self.signals[signal.index()].flags.insert(SignalFlags::PROPAGATED_AHEAD);
            self.signals[signal.index()].propagated_to = Some(next);
            return;
        }

        let (local, remainder, next_signal) = split_at_signal(&network, request.remainder);
        let depth = if passed { 0 } else { request.depth + 1 };
        let forwarded = RouteRequest {
            train,
            pending: local.elements,
            remainder,
            next_signal,
            order: request.order,
            depth,
            propagation_limit: request.propagation_limit,
            last_block: None,
        };
        let record = &mut self.signals[signal.index()];
        record.flags.insert(SignalFlags::PROPAGATED_AHEAD);
        record.propagated_to = Some(next);
        if let Some(req) = record.request.as_mut() {
            req.remainder = PartialPathRoute::default();
        }
        let next_record = &mut self.signals[next.index()];
        next_record.request = Some(forwarded);
        next_record.enabled_train = Some(train);
        next_record.state = SignalState::RouteRequested;
        debug!("signal {:?}: propagated request of {:?} to {:?}", signal, train, next);
        self.process_request(next);
    }

    /// Dispatcher withdrawal. Unoccupied sections are freed at once; the
    /// signal waits in `Withdrawing` for the rest.
    pub(crate) fn withdraw_route(&mut self, signal: SignalId) -> Result<WithdrawOutcome, EngineError> {
        let record = self
            .signals
            .get(signal.index())
            .ok_or(EngineError::UnknownSignal(signal))?;
        if matches!(record.state, SignalState::NoRoute | SignalState::Withdrawing) {
            return Ok(WithdrawOutcome::AlreadyClear);
        }
        let Some(train) = record.enabled_train else {
            self.finish_route(signal);
            return Ok(WithdrawOutcome::AlreadyClear);
        };

        // Unentered deadlock claims made by this request go too.
        let groups: Vec<DeadlockId> = record
            .route
            .elements
            .iter()
            .chain(record.request.iter().flat_map(|r| r.pending.iter()))
            .filter_map(|e| e.alt_start.map(|m| m.group))
            .collect();
        for group in groups {
            if let Some(info) = self.deadlocks.get_mut(group.index()) {
                if info.claim(train).is_some_and(|c| !c.entered) {
                    info.release(train);
                }
            }
        }

        let downstream = record.propagated_to;
        let record = &mut self.signals[signal.index()];
        record.request = None;
        record.propagated_to = None;
        if let Some(claimed) = record.claimed_section.take() {
            self.sections.unclaim(claimed, train);
        }
        if let Some(next) = downstream {
            if self.signals[next.index()].enabled_train == Some(train) {
                self.withdraw_route(next)?;
            }
        }

        let elements = std::mem::take(&mut self.signals[signal.index()].route.elements);
        let mut kept = Vec::new();
        let mut released = 0;
        for element in elements.into_iter().rev() {
            let occupied = self
                .sections
                .section(element.section)
                .is_some_and(|s| s.occupancy.iter().any(|(t, _)| *t == train));
            if occupied {
                kept.push(element);
            } else {
                self.release_element(signal, train, element.section);
                released += 1;
            }
        }
        kept.reverse();
        info!("signal {:?}: route of {:?} withdrawn", signal, train);
        if kept.is_empty() {
            self.finish_route(signal);
            Ok(WithdrawOutcome::Withdrawn { released })
        } else {
            let held = kept.len();
            let record = &mut self.signals[signal.index()];
            record.route.elements = kept;
            record.state = SignalState::Withdrawing;
            record.flags.remove(SignalFlags::FULL_ROUTE_CLEARED);
            Ok(WithdrawOutcome::Withdrawing { released, held })
        }
    }

    /// Return the signal to `NoRoute`, unwinding any junction locks left.
    pub(crate) fn finish_route(&mut self, signal: SignalId) {
        let network = Arc::clone(&self.network);
        let Some(def) = network.signal(signal) else {
            return;
        };
        let record = &mut self.signals[signal.index()];
        let train = record.enabled_train;
        record.state = SignalState::Withdrawing;
        for section in std::mem::take(&mut record.junctions_passed) {
            if !self.sections.unlock_junction(section, signal) {
                halt!("signal {signal:?}: junction {section:?} was not locked");
            }
        }
        let record = &mut self.signals[signal.index()];
        if let (Some(claimed), Some(t)) = (record.claimed_section, train) {
            self.sections.unclaim(claimed, t);
        }
        let had_route = train.is_some();
        self.signals[signal.index()].reset(def);
        if let (true, Some(train)) = (had_route, train) {
            self.event_bus.emit(Event::RouteWithdrawn {
                signal,
                train,
                tick: self.sim_state.tick,
            });
        }
    }

    /// Train moved: mark passed signals, release sections its rear has
    /// cleared, and finish routes that are fully used.
    pub(crate) fn on_train_moved(&mut self, train: TrainId, entered: &[SectionId], vacated: &[SectionId]) {
        for index in 0..self.signals.len() {
            let signal = SignalId(index as u32);
            let record = &self.signals[index];
            if record.enabled_train != Some(train) || record.flags.contains(SignalFlags::TRAIN_PASSED) {
                continue;
            }
            let Some(first) = record.route.first() else {
                continue;
            };
            if entered.contains(&first.section) {
                debug!("{:?} passed signal {:?}", train, signal);
                self.signals[index].flags.insert(SignalFlags::TRAIN_PASSED);
                let mut next = self.signals[index].propagated_to;
                while let Some(n) = next {
                    let downstream = &mut self.signals[n.index()];
                    if downstream.enabled_train != Some(train) {
                        break;
                    }
                    if let Some(req) = downstream.request.as_mut() {
                        req.depth = req.depth.saturating_sub(1);
                    }
                    next = downstream.propagated_to;
                }
            }
        }

        for &section in vacated {
            let owner = self.signals.iter().position(|r| {
                r.enabled_train == Some(train) && r.route.contains(section)
            });
            let Some(index) = owner else {
                continue;
            };
            let signal = SignalId(index as u32);
            if let Some(pos) = self.signals[index].route.position(section) {
                self.signals[index].route.elements.remove(pos);
            }
            self.release_element(signal, train, section);
            self.complete_if_done(signal);
        }
    }

    fn complete_if_done(&mut self, signal: SignalId) {
        let record = &self.signals[signal.index()];
        if !record.route.is_empty() {
            return;
        }
        let done = match &record.request {
            None => true,
            Some(req) => {
                record.flags.contains(SignalFlags::TRAIN_PASSED)
                    && req.pending.is_empty()
                    && (req.remainder.is_empty()
                        || record.flags.contains(SignalFlags::PROPAGATED_AHEAD))
            }
        };
        if done {
            info!("signal {:?}: route completed", signal);
            self.finish_route(signal);
        }
    }

    /// Retry every pending request. Trains that a deadlock group can now
    /// grant go first, in queue order; the rest follow request order.
    pub(crate) fn retry_pending_requests(&mut self) {
        let mut woken: Vec<TrainId> = Vec::new();
        for info in &self.deadlocks {
            for train in info.grantable() {
                if !woken.contains(&train) {
                    woken.push(train);
                }
            }
        }
        let mut work: Vec<(usize, u64, SignalId)> = self
            .signals
            .iter()
            .enumerate()
            .filter_map(|(i, r)| {
                let req = r.request.as_ref()?;
                let unfinished = !req.pending.is_empty()
                    || (!req.remainder.is_empty() && !r.flags.contains(SignalFlags::PROPAGATED_AHEAD));
                if !unfinished || r.state == SignalState::Withdrawing {
                    return None;
                }
                let rank = woken
                    .iter()
                    .position(|t| *t == req.train)
                    .unwrap_or(usize::MAX);
                Some((rank, req.order, SignalId(i as u32)))
            })
            .collect();
        work.sort();
        for (_, _, signal) in work {
            let has_pending = self.signals[signal.index()]
                .request
                .as_ref()
                .is_some_and(|r| !r.pending.is_empty());
            if has_pending {
                self.process_request(signal);
            } else {
                self.propagate(signal);
            }
        }
    }

    /// Check approach-control envelopes against the trains' latest reports.
    pub(crate) fn evaluate_approach_control(&mut self) {
        let network = Arc::clone(&self.network);
        for (index, def) in network.signals().iter().enumerate() {
            let Some(control) = def.approach_control else {
                continue;
            };
            let signal = SignalId(index as u32);
            let record = &self.signals[index];
            if !record.is_active() || record.flags.contains(SignalFlags::APPROACH_CLEARED) {
                self.signals[index].flags.remove(SignalFlags::APPROACH_ACTIVE);
                continue;
            }
            let Some(train) = record.enabled_train.and_then(|t| self.trains.get(t)) else {
                continue;
            };
            let within = train.position.distance_to_signal.is_some_and(|(s, d)| {
                s == signal
                    && d <= control.distance
                    && control.max_speed.is_none_or(|max| train.position.speed <= max)
            });
            let record = &mut self.signals[index];
            if within {
                record.flags.remove(SignalFlags::APPROACH_ACTIVE);
                record.flags.insert(SignalFlags::APPROACH_CLEARED);
                debug!("signal {:?}: approach control cleared", signal);
                self.propagate(signal);
            } else {
                record.flags.insert(SignalFlags::APPROACH_ACTIVE);
            }
        }
    }

    /// Aspect from the signal's own state, ignoring the signal ahead.
    fn base_aspect(&self, index: usize, def: &SignalDef) -> Aspect {
        let record = &self.signals[index];
        if record.permission == Permission::Reserved {
            return Aspect::Stop;
        }
        let routed = match record.state {
            SignalState::FullRouteCleared => Aspect::Clear,
            SignalState::PartialRouteCleared if def.allow_partial_clear => Aspect::Restricting,
            _ => Aspect::Stop,
        };
        let holds = SignalFlags::HELD
            | SignalFlags::GATED
            | SignalFlags::TRAIN_PASSED
            | SignalFlags::APPROACH_ACTIVE;
        let aspect = if record.flags.intersects(holds) {
            Aspect::Stop
        } else {
            routed
        };
        if record.permission == Permission::Overridden {
            aspect.max(Aspect::Restricting)
        } else {
            aspect
        }
    }

    /// Recompute every aspect. A clear signal in front of a signal at stop
    /// shows approach.
    pub(crate) fn update_aspects(&mut self) {
        let network = Arc::clone(&self.network);
        let base: Vec<Aspect> = network
            .signals()
            .iter()
            .enumerate()
            .map(|(i, def)| self.base_aspect(i, def))
            .collect();
        for (index, &aspect) in base.iter().enumerate() {
            let record = &self.signals[index];
            let mut aspect = aspect;
            if aspect == Aspect::Clear {
                let next = record
                    .route
                    .last()
                    .and_then(|e| network.signal_at_exit(e.section, e.direction));
                if next.is_some_and(|n| base[n.index()] == Aspect::Stop) {
                    aspect = Aspect::Approach;
                }
            }
            if aspect != record.aspect {
                let from = record.aspect;
                self.signals[index].aspect = aspect;
                self.event_bus.emit(Event::AspectChanged {
                    signal: SignalId(index as u32),
                    from,
                    to: aspect,
                    tick: self.sim_state.tick,
                });
            }
        }
    }

    /// Drop a train from every signal. Used when a train is removed.
    pub(crate) fn release_train_signals(&mut self, train: TrainId) {
        for index in 0..self.signals.len() {
            let signal = SignalId(index as u32);
            if self.signals[index].enabled_train == Some(train) {
                let elements = std::mem::take(&mut self.signals[index].route.elements);
                for element in elements.iter().rev() {
                    self.release_element(signal, train, element.section);
                }
                self.signals[index].request = None;
                self.finish_route(signal);
            }
            self.signals[index].locked_trains.retain(|t| *t != train);
        }
    }
}
