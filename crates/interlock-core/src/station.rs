//! Station stop controller.
//!
//! Each train carries an ordered list of [`StationStop`]s. The controller
//! detects arrival at the front stop's platform, waits out the minimum stop
//! time, the scheduled departure and any awaited connections, then clears
//! departure. While `HOLD_SIGNAL` is set the stop's exit signal is held at
//! stop until departure is cleared.
//!
//! A connection never blocks forever: once its wait limit elapses the train
//! departs anyway and the missed connection is logged and reported.

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::event::Event;
use crate::fixed::{Fixed64, Ticks};
use crate::id::{SectionId, SignalId, TrainId};
use crate::query::StopReport;
use crate::signal::SignalFlags;
use log::{info, warn};
use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct StopFlags: u16 {
        /// Keep the exit signal at stop until departure is cleared.
        const HOLD_SIGNAL                 = 1 << 0;
        /// Depart as soon as the minimum stop time has elapsed.
        const NO_WAIT                     = 1 << 1;
        /// No claim locking at the exit signal while berthed.
        const NO_CLAIM                    = 1 << 2;
        /// Use the close-up clearance in front of the exit signal.
        const CLOSEUP_SIGNAL              = 1 << 3;
        /// Stop with the front at the stop position instead of centred.
        const CLOSEUP                     = 1 << 4;
        const RESTRICT_PLATFORM_TO_SIGNAL = 1 << 5;
        const EXTEND_PLATFORM_TO_SIGNAL   = 1 << 6;
        /// Last stop; departure is never cleared.
        const TERMINAL                    = 1 << 7;
        /// The exit signal limits the stopping position.
        const EXIT_SIGNAL                 = 1 << 8;
    }
}

/// Another train this stop waits for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    /// Name of the awaited train.
    pub train: String,
    /// Longest wait after arrival. Falls back to the engine default.
    pub max_wait: Option<Ticks>,
}

/// A scheduled halt at one platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationStopDef {
    pub station: String,
    pub platform: SectionId,
    /// Platform extent, measured along the platform section.
    pub platform_start: Fixed64,
    pub platform_end: Fixed64,
    pub exit_signal: Option<SignalId>,
    /// Position of the exit signal on the same scale as the platform.
    pub signal_offset: Option<Fixed64>,
    pub scheduled_arrival: Ticks,
    pub scheduled_departure: Ticks,
    pub min_stop: Ticks,
    pub boarding_time: Ticks,
    pub flags: StopFlags,
    pub connections: Vec<Connection>,
}

impl StationStopDef {
    pub fn new(station: &str, platform: SectionId, platform_end: Fixed64) -> Self {
        Self {
            station: station.to_string(),
            platform,
            platform_start: Fixed64::ZERO,
            platform_end,
            exit_signal: None,
            signal_offset: None,
            scheduled_arrival: 0,
            scheduled_departure: 0,
            min_stop: 0,
            boarding_time: 0,
            flags: StopFlags::empty(),
            connections: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopState {
    Pending,
    Berthed,
    DepartureCleared,
    Departed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Waiting,
    Arrived { at: Ticks },
    TimedOut { at: Ticks },
}

/// Where a train should stop at a platform, and how far short of the exit
/// signal that leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopGeometry {
    pub stop_position: Fixed64,
    pub claim_distance: Option<Fixed64>,
}

/// Runtime state of one stop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationStop {
    pub def: StationStopDef,
    pub state: StopState,
    pub actual_arrival: Option<Ticks>,
    pub actual_departure: Option<Ticks>,
    pub connections: Vec<ConnectionStatus>,
    /// Fixed on arrival.
    pub geometry: Option<StopGeometry>,
    platform_seen: bool,
}

impl StationStop {
    pub fn new(def: StationStopDef) -> Self {
        let connections = vec![ConnectionStatus::Waiting; def.connections.len()];
        Self {
            def,
            state: StopState::Pending,
            actual_arrival: None,
            actual_departure: None,
            connections,
            geometry: None,
            platform_seen: false,
        }
    }

    pub fn actual_min_stop_time(&self) -> Ticks {
        self.def.min_stop.max(self.def.boarding_time)
    }

    /// Settle waiting connections. `arrived` looks up when an awaited train
    /// reached this station. Returns the names that timed out just now.
    pub fn resolve_connections(
        &mut self,
        tick: Ticks,
        default_timeout: Ticks,
        arrived: impl Fn(&str) -> Option<Ticks>,
    ) -> Vec<String> {
        let Some(arrival) = self.actual_arrival else {
            return Vec::new();
        };
        let mut missed = Vec::new();
        for (status, conn) in self.connections.iter_mut().zip(&self.def.connections) {
            if *status != ConnectionStatus::Waiting {
                continue;
            }
            if let Some(at) = arrived(&conn.train) {
                *status = ConnectionStatus::Arrived { at };
            } else if tick >= arrival + conn.max_wait.unwrap_or(default_timeout) {
                *status = ConnectionStatus::TimedOut { at: tick };
                missed.push(conn.train.clone());
            }
        }
        missed
    }

    /// Whether departure may be cleared at `tick`.
    pub fn departure_ready(&self, tick: Ticks) -> bool {
        let Some(arrival) = self.actual_arrival else {
            return false;
        };
        if self.def.flags.contains(StopFlags::TERMINAL) {
            return false;
        }
        let stopped_long_enough = tick >= arrival + self.actual_min_stop_time();
        let schedule_met =
            self.def.flags.contains(StopFlags::NO_WAIT) || tick >= self.def.scheduled_departure;
        let connections_settled = self
            .connections
            .iter()
            .all(|c| *c != ConnectionStatus::Waiting);
        stopped_long_enough && schedule_met && connections_settled
    }

    pub fn geometry(&self, train_length: Fixed64, config: &EngineConfig) -> StopGeometry {
        let flags = self.def.flags;
        let mut end = self.def.platform_end;
        let signal = self.def.signal_offset.filter(|_| flags.contains(StopFlags::EXIT_SIGNAL));
        if let Some(offset) = signal {
            let clearance = if flags.contains(StopFlags::CLOSEUP_SIGNAL) {
                config.closeup_signal_clearance
            } else {
                config.standard_signal_clearance
            };
            let limit = offset - clearance;
            end = if flags.contains(StopFlags::EXTEND_PLATFORM_TO_SIGNAL) {
                end.max(limit)
            } else if flags.contains(StopFlags::RESTRICT_PLATFORM_TO_SIGNAL) {
                limit
            } else {
                end.min(limit)
            };
        }
        let spare = end - self.def.platform_start - train_length;
        let stop_position = if flags.contains(StopFlags::CLOSEUP) || spare <= Fixed64::ZERO {
            end
        } else {
            end - spare / 2
        };
        StopGeometry {
            stop_position,
            claim_distance: self.def.signal_offset.map(|s| s - stop_position),
        }
    }

    /// Whether the exit signal may claim-lock ahead of this stop: not with
    /// `NO_CLAIM`, and not while the train stands further from the signal
    /// than `max_claim_distance`.
    pub fn allows_claim(&self, config: &EngineConfig) -> bool {
        if self.def.flags.contains(StopFlags::NO_CLAIM) {
            return false;
        }
        self.geometry
            .and_then(|g| g.claim_distance)
            .is_none_or(|d| d <= config.max_claim_distance)
    }

    pub fn report(&self) -> StopReport {
        StopReport {
            station: self.def.station.clone(),
            platform: self.def.platform,
            scheduled_arrival: self.def.scheduled_arrival,
            scheduled_departure: self.def.scheduled_departure,
            actual_arrival: self.actual_arrival,
            actual_departure: self.actual_departure,
            stop_position: self.geometry.map(|g| g.stop_position),
            missed_connections: self
                .connections
                .iter()
                .zip(&self.def.connections)
                .filter(|(s, _)| matches!(s, ConnectionStatus::TimedOut { .. }))
                .map(|(_, c)| c.train.clone())
                .collect(),
            skipped: self.actual_arrival.is_none(),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine: station phase
// ---------------------------------------------------------------------------

impl Engine {
    /// Advance every train's current stop and refresh station holds.
    pub(crate) fn phase_stations(&mut self) {
        let tick = self.sim_state.tick;
        let default_timeout = self.config.connection_timeout;
        let config = self.config.clone();
        for record in &mut self.signals {
            record.flags.remove(SignalFlags::HELD);
        }

        let ids: Vec<TrainId> = self.trains.keys().collect();
        for id in ids {
            let Some(train) = self.trains.get_mut(id) else {
                continue;
            };
            let name = train.def.name.clone();
            let length = train.def.length;
            let front = train.position.occupied.first().map(|p| p.section);
            let stationary = train.position.speed == Fixed64::ZERO;
            let on_platform = |platform: SectionId| {
                train.position.occupied.iter().any(|p| p.section == platform)
            };
            let Some(platform) = train.stops.front().map(|s| s.def.platform) else {
                continue;
            };
            let occupies_platform = on_platform(platform);
            let Some(stop) = train.stops.front_mut() else {
                continue;
            };

            let mut finished = false;
            match stop.state {
                StopState::Pending => {
                    if occupies_platform {
                        stop.platform_seen = true;
                    }
                    if front == Some(platform) && stationary {
                        stop.state = StopState::Berthed;
                        stop.actual_arrival = Some(tick);
                        stop.geometry = Some(stop.geometry(length, &config));
                        self.arrivals
                            .insert((stop.def.station.clone(), name.clone()), tick);
                        info!("{} arrived at {}", name, stop.def.station);
                        self.event_bus.emit(Event::TrainArrived {
                            train: id,
                            station: stop.def.station.clone(),
                            tick,
                        });
                    } else if stop.platform_seen && !occupies_platform {
                        info!("{} passed {} without stopping", name, stop.def.station);
                        finished = true;
                    }
                }
                StopState::Berthed => {
                    let station = stop.def.station.clone();
                    let arrivals = &self.arrivals;
                    let missed = stop.resolve_connections(tick, default_timeout, |awaited| {
                        arrivals.get(&(station.clone(), awaited.to_string())).copied()
                    });
                    for awaited in missed {
                        warn!(
                            "{} departs {} without connection from {}",
                            name, station, awaited
                        );
                        self.event_bus.emit(Event::ConnectionMissed {
                            train: id,
                            awaited,
                            tick,
                        });
                    }
                    if stop.departure_ready(tick) {
                        stop.state = StopState::DepartureCleared;
                        info!("{} cleared to depart {}", name, station);
                        self.event_bus.emit(Event::DepartureCleared { train: id, tick });
                    }
                }
                StopState::DepartureCleared => {
                    if front != Some(platform) {
                        stop.state = StopState::Departed;
                        stop.actual_departure = Some(tick);
                        self.event_bus.emit(Event::TrainDeparted { train: id, tick });
                        finished = true;
                    }
                }
                StopState::Departed => finished = true,
            }

            if finished {
                if let Some(done) = train.stops.pop_front() {
                    train.completed.push(done.report());
                }
            }
            if let Some(stop) = train.stops.front() {
                let holding = matches!(stop.state, StopState::Pending | StopState::Berthed);
                if holding && stop.def.flags.contains(StopFlags::HOLD_SIGNAL) {
                    if let Some(signal) = stop.def.exit_signal {
                        if let Some(record) = self.signals.get_mut(signal.index()) {
                            record.flags.insert(SignalFlags::HELD);
                        }
                    }
                }
            }
        }
    }

    /// Trains whose current stop at `station` waits for `train_name`.
    pub fn awaited_by(&self, station: &str, train_name: &str) -> Vec<TrainId> {
        self.trains
            .iter()
            .filter(|(_, t)| {
                t.stops.front().is_some_and(|s| {
                    s.def.station == station
                        && s.def.connections.iter().any(|c| c.train == train_name)
                })
            })
            .map(|(id, _)| id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fixed;

    fn stop() -> StationStop {
        let mut def = StationStopDef::new("Halt", SectionId(2), fixed(200.0));
        def.min_stop = 30;
        def.boarding_time = 45;
        def.scheduled_departure = 100;
        StationStop::new(def)
    }

    #[test]
    fn min_stop_is_max_of_min_and_boarding() {
        assert_eq!(stop().actual_min_stop_time(), 45);
    }

    #[test]
    fn departure_waits_for_schedule() {
        let mut s = stop();
        s.actual_arrival = Some(10);
        assert!(!s.departure_ready(60));
        assert!(s.departure_ready(100));
    }

    #[test]
    fn no_wait_ignores_schedule() {
        let mut s = stop();
        s.def.flags |= StopFlags::NO_WAIT;
        s.actual_arrival = Some(10);
        assert!(s.departure_ready(55));
    }

    #[test]
    fn terminal_never_departs() {
        let mut s = stop();
        s.def.flags |= StopFlags::TERMINAL;
        s.actual_arrival = Some(0);
        assert!(!s.departure_ready(10_000));
    }

    #[test]
    fn connection_arrival_releases_wait() {
        let mut s = stop();
        s.def.connections.push(Connection {
            train: "B".to_string(),
            max_wait: Some(500),
        });
        s.connections.push(ConnectionStatus::Waiting);
        s.actual_arrival = Some(10);
        assert!(s.resolve_connections(100, 300, |_| None).is_empty());
        assert!(!s.departure_ready(100));
        s.resolve_connections(120, 300, |name| (name == "B").then_some(118));
        assert_eq!(s.connections[0], ConnectionStatus::Arrived { at: 118 });
        assert!(s.departure_ready(120));
    }

    #[test]
    fn connection_times_out_with_default() {
        let mut s = stop();
        s.def.connections.push(Connection {
            train: "B".to_string(),
            max_wait: None,
        });
        s.connections.push(ConnectionStatus::Waiting);
        s.actual_arrival = Some(10);
        assert!(s.resolve_connections(309, 300, |_| None).is_empty());
        assert_eq!(s.resolve_connections(310, 300, |_| None), vec!["B".to_string()]);
        assert!(s.departure_ready(310));
        assert_eq!(s.report().missed_connections, vec!["B".to_string()]);
    }

    #[test]
    fn geometry_centres_short_train() {
        let s = stop();
        let g = s.geometry(fixed(100.0), &EngineConfig::default());
        assert_eq!(g.stop_position, fixed(150.0));
    }

    #[test]
    fn geometry_closeup_stops_at_end() {
        let mut s = stop();
        s.def.flags |= StopFlags::CLOSEUP;
        let g = s.geometry(fixed(100.0), &EngineConfig::default());
        assert_eq!(g.stop_position, fixed(200.0));
    }

    #[test]
    fn exit_signal_limits_stop_position() {
        let mut s = stop();
        s.def.flags |= StopFlags::EXIT_SIGNAL | StopFlags::CLOSEUP;
        s.def.signal_offset = Some(fixed(210.0));
        let config = EngineConfig::default();
        let g = s.geometry(fixed(100.0), &config);
        assert_eq!(g.stop_position, fixed(190.0));
        assert_eq!(g.claim_distance, Some(fixed(20.0)));

        s.def.flags |= StopFlags::CLOSEUP_SIGNAL;
        let g = s.geometry(fixed(100.0), &config);
        assert_eq!(g.stop_position, fixed(200.0));
    }

    #[test]
    fn extend_platform_to_signal() {
        let mut s = stop();
        s.def.flags |= StopFlags::EXIT_SIGNAL | StopFlags::CLOSEUP | StopFlags::EXTEND_PLATFORM_TO_SIGNAL;
        s.def.signal_offset = Some(fixed(260.0));
        let g = s.geometry(fixed(100.0), &EngineConfig::default());
        assert_eq!(g.stop_position, fixed(240.0));
    }
}
