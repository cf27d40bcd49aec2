//! Replay recording and playback for debugging and dispatcher audit.
//!
//! Records the inputs applied to an engine, starting from a serialized
//! snapshot. Playing the log back onto the same network reproduces the
//! exact same interlocking state, with optional hash verification at
//! checkpoints.

use crate::command_queue::Command;
use crate::engine::{Engine, EngineError};
use crate::fixed::Ticks;
use crate::network::{Pin, TrackNetwork};
use crate::serialize::{DeserializeError, SerializeError};
use crate::train::TrainDef;
use log::warn;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// ReplayCommand
// ---------------------------------------------------------------------------

/// An input that can be recorded and replayed.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ReplayCommand {
    Advance { dt: Ticks },
    Step,
    /// Queue a command for the next tick.
    Submit(Command),
    AddTrain { def: TrainDef, occupied: Vec<Pin> },
    Pause,
    Resume,
}

// ---------------------------------------------------------------------------
// ReplayMismatch
// ---------------------------------------------------------------------------

/// Where replay verification failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayMismatch {
    pub command_index: usize,
    pub expected_hash: u64,
    pub actual_hash: u64,
}

// ---------------------------------------------------------------------------
// ReplayLog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ReplayLog {
    /// Serialized engine state at the start of recording.
    pub initial_snapshot: Vec<u8>,
    pub commands: Vec<ReplayCommand>,
    /// (command_index, state_hash) after that command ran.
    pub hash_checkpoints: Vec<(usize, u64)>,
}

impl ReplayLog {
    /// Start recording from the engine's current state.
    pub fn new(engine: &Engine) -> Result<Self, SerializeError> {
        Ok(Self {
            initial_snapshot: engine.serialize()?,
            commands: Vec::new(),
            hash_checkpoints: Vec::new(),
        })
    }

    pub fn record(&mut self, cmd: ReplayCommand) {
        self.commands.push(cmd);
    }

    pub fn record_with_hash(&mut self, cmd: ReplayCommand, hash: u64) {
        let index = self.commands.len();
        self.commands.push(cmd);
        self.hash_checkpoints.push((index, hash));
    }

    /// Apply `cmd` to the live engine and record it. Steps get a hash
    /// checkpoint.
    pub fn apply_and_record(&mut self, engine: &mut Engine, cmd: ReplayCommand) {
        apply_command(engine, &cmd);
        if matches!(cmd, ReplayCommand::Step | ReplayCommand::Advance { .. }) {
            self.record_with_hash(cmd, engine.state_hash());
        } else {
            self.record(cmd);
        }
    }

    pub fn command_count(&self) -> usize {
        self.commands.len()
    }

    pub fn serialize(&self) -> Result<Vec<u8>, SerializeError> {
        bitcode::serialize(self).map_err(|e| SerializeError::Encode(e.to_string()))
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, DeserializeError> {
        bitcode::deserialize(data).map_err(|e| DeserializeError::Decode(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// ReplayResult
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ReplayResult {
    pub commands_executed: usize,
    /// All hash checkpoints matched.
    pub is_verified: bool,
    pub first_mismatch: Option<ReplayMismatch>,
    pub engine: Engine,
}

// ---------------------------------------------------------------------------
// Replay execution
// ---------------------------------------------------------------------------

fn apply_command(engine: &mut Engine, cmd: &ReplayCommand) {
    match cmd {
        ReplayCommand::Advance { dt } => {
            engine.advance(*dt);
        }
        ReplayCommand::Step => {
            engine.step();
        }
        ReplayCommand::Submit(command) => {
            engine.submit(command.clone());
        }
        ReplayCommand::AddTrain { def, occupied } => {
            // A rejected train was rejected when recorded too.
            if let Err(e) = engine.add_train(def.clone(), occupied.clone()) {
                log_rejected(&def.name, &e);
            }
        }
        ReplayCommand::Pause => engine.pause(),
        ReplayCommand::Resume => engine.resume(),
    }
}

fn log_rejected(name: &str, e: &EngineError) {
    warn!("replay: train {name} rejected: {e}");
}

/// Replay a log onto `network` and verify hash checkpoints.
pub fn replay_and_verify(
    log: &ReplayLog,
    network: impl Into<Arc<TrackNetwork>>,
) -> Result<ReplayResult, DeserializeError> {
    let mut engine = Engine::deserialize(&log.initial_snapshot, network)?;
    let mut first_mismatch = None;
    let mut checkpoints = log.hash_checkpoints.iter().peekable();

    for (i, cmd) in log.commands.iter().enumerate() {
        apply_command(&mut engine, cmd);
        while let Some(&&(index, expected_hash)) = checkpoints.peek() {
            if index != i {
                break;
            }
            checkpoints.next();
            let actual_hash = engine.state_hash();
            if actual_hash != expected_hash && first_mismatch.is_none() {
                first_mismatch = Some(ReplayMismatch {
                    command_index: i,
                    expected_hash,
                    actual_hash,
                });
            }
        }
    }

    Ok(ReplayResult {
        commands_executed: log.commands.len(),
        is_verified: first_mismatch.is_none(),
        first_mismatch,
        engine,
    })
}

/// Replay a log without verification, returning the final engine.
pub fn replay(
    log: &ReplayLog,
    network: impl Into<Arc<TrackNetwork>>,
) -> Result<Engine, DeserializeError> {
    let mut engine = Engine::deserialize(&log.initial_snapshot, network)?;
    for cmd in &log.commands {
        apply_command(&mut engine, cmd);
    }
    Ok(engine)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::SignalState;
    use crate::test_utils::*;
    use crate::train::PositionReport;

    /// Records a train clearing a route and moving two sections.
    fn record_run(fx: &SignalledLine) -> (Engine, ReplayLog) {
        let mut engine = fx.engine();
        let mut log = ReplayLog::new(&engine).unwrap();
        log.apply_and_record(
            &mut engine,
            ReplayCommand::AddTrain {
                def: train_def("t1", 50.0),
                occupied: vec![fx.pin(0)],
            },
        );
        let train = engine.train_id("t1").unwrap();
        log.apply_and_record(
            &mut engine,
            ReplayCommand::Submit(Command::RequestRoute {
                train,
                signal: fx.signals[0],
                path: fx.path(1..5),
            }),
        );
        log.apply_and_record(&mut engine, ReplayCommand::Step);
        for front in 1..3 {
            log.apply_and_record(
                &mut engine,
                ReplayCommand::Submit(Command::ReportPosition {
                    train,
                    report: PositionReport::at(vec![fx.pin(front)]),
                }),
            );
            log.apply_and_record(&mut engine, ReplayCommand::Step);
        }
        (engine, log)
    }

    // -----------------------------------------------------------------------
    // Test 1: a new log holds only the initial snapshot
    // -----------------------------------------------------------------------
    #[test]
    fn replay_log_captures_initial_state() {
        let fx = signalled_line(5, &[0]);
        let log = ReplayLog::new(&fx.engine()).unwrap();
        assert!(!log.initial_snapshot.is_empty());
        assert_eq!(log.command_count(), 0);
        assert!(log.hash_checkpoints.is_empty());
    }

    // -----------------------------------------------------------------------
    // Test 2: empty log replays to the initial state
    // -----------------------------------------------------------------------
    #[test]
    fn replay_empty_log_returns_initial_state() {
        let fx = signalled_line(5, &[0]);
        let engine = fx.engine();
        let log = ReplayLog::new(&engine).unwrap();
        let replayed = replay(&log, fx.network.clone()).unwrap();
        assert_eq!(replayed.state_hash(), engine.state_hash());
        assert_eq!(replayed.sim_state.tick, 0);
    }

    // -----------------------------------------------------------------------
    // Test 3: a recorded run verifies and ends in the same state
    // -----------------------------------------------------------------------
    #[test]
    fn replay_verify_passes() {
        let fx = signalled_line(5, &[0]);
        let (engine, log) = record_run(&fx);
        assert_eq!(log.hash_checkpoints.len(), 3);

        let result = replay_and_verify(&log, fx.network.clone()).unwrap();
        assert!(result.is_verified);
        assert_eq!(result.commands_executed, log.command_count());
        assert_eq!(result.engine.state_hash(), engine.state_hash());
        assert_eq!(
            result.engine.signal_state(fx.signals[0]),
            Some(SignalState::FullRouteCleared)
        );
    }

    // -----------------------------------------------------------------------
    // Test 4: a tampered checkpoint is reported
    // -----------------------------------------------------------------------
    #[test]
    fn replay_verify_detects_mismatch() {
        let fx = signalled_line(5, &[0]);
        let (_, mut log) = record_run(&fx);
        let (index, hash) = log.hash_checkpoints[1];
        log.hash_checkpoints[1] = (index, hash ^ 1);

        let result = replay_and_verify(&log, fx.network.clone()).unwrap();
        assert!(!result.is_verified);
        let mismatch = result.first_mismatch.unwrap();
        assert_eq!(mismatch.command_index, index);
        assert_eq!(mismatch.actual_hash, hash);
    }

    // -----------------------------------------------------------------------
    // Test 5: the log survives its own serialization
    // -----------------------------------------------------------------------
    #[test]
    fn replay_round_trip_serialize() {
        let fx = signalled_line(5, &[0]);
        let (engine, log) = record_run(&fx);
        let bytes = log.serialize().unwrap();
        let decoded = ReplayLog::deserialize(&bytes).unwrap();
        assert_eq!(decoded.commands, log.commands);

        let replayed = replay(&decoded, fx.network.clone()).unwrap();
        assert_eq!(replayed.state_hash(), engine.state_hash());
    }

    // -----------------------------------------------------------------------
    // Test 6: paused steps replay as no-ops
    // -----------------------------------------------------------------------
    #[test]
    fn replay_pause_is_recorded() {
        let fx = signalled_line(3, &[0]);
        let mut engine = fx.engine();
        let mut log = ReplayLog::new(&engine).unwrap();
        log.apply_and_record(&mut engine, ReplayCommand::Pause);
        log.apply_and_record(&mut engine, ReplayCommand::Step);
        log.apply_and_record(&mut engine, ReplayCommand::Resume);
        log.apply_and_record(&mut engine, ReplayCommand::Advance { dt: 1 });

        let replayed = replay(&log, fx.network.clone()).unwrap();
        assert_eq!(replayed.sim_state.tick, 1);
        assert!(!replayed.is_paused());
    }
}
