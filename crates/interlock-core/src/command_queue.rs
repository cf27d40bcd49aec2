//! Queue of dispatcher and train-control commands.
//!
//! Commands are submitted between ticks and applied during the pre-tick
//! phase, so every decision happens at a tick boundary. Each command gets a
//! sequence number at submission; that number is the request order used for
//! tie-breaking and deadlock queueing.

use crate::engine::EngineError;
use crate::fixed::Ticks;
use crate::id::{PoolId, SectionId, SignalId, StorageId, TrainId};
use crate::pool::{ClaimOutcome, PoolRelease};
use crate::signal::{Permission, RouteOutcome, WithdrawOutcome};
use crate::train::PositionReport;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Command enum
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Ask `signal` to clear a route along `path` for `train`.
    RequestRoute {
        train: TrainId,
        signal: SignalId,
        path: Vec<SectionId>,
    },
    WithdrawRoute { signal: SignalId },
    SetPermission {
        signal: SignalId,
        permission: Permission,
    },
    ReportPosition {
        train: TrainId,
        report: PositionReport,
    },
    ClaimStorage { train: TrainId, pool: PoolId },
    StoreTrain { train: TrainId, pool: PoolId },
    ReleaseStorage { train: TrainId, pool: PoolId },
    RemoveTrain { train: TrainId },
}

impl Command {
    /// Application class within a tick. Lower classes apply first; route
    /// requests go last so they see withdrawals and releases from the same
    /// tick. Position reports are deferred to the occupancy phase.
    pub fn class(&self) -> u8 {
        match self {
            Command::ReportPosition { .. } => 0,
            Command::RemoveTrain { .. } => 1,
            Command::WithdrawRoute { .. } | Command::SetPermission { .. } => 2,
            Command::ClaimStorage { .. }
            | Command::StoreTrain { .. }
            | Command::ReleaseStorage { .. } => 3,
            Command::RequestRoute { .. } => 4,
        }
    }

    pub fn train(&self) -> Option<TrainId> {
        match self {
            Command::RequestRoute { train, .. }
            | Command::ReportPosition { train, .. }
            | Command::ClaimStorage { train, .. }
            | Command::StoreTrain { train, .. }
            | Command::ReleaseStorage { train, .. }
            | Command::RemoveTrain { train } => Some(*train),
            Command::WithdrawRoute { .. } | Command::SetPermission { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// What applying a command produced. Contention is an outcome; only
/// invalid input is `Rejected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Route(RouteOutcome),
    Withdraw(WithdrawOutcome),
    PermissionSet,
    PositionApplied,
    Claim(ClaimOutcome),
    Stored(StorageId),
    StorageReleased(PoolRelease),
    TrainRemoved,
    Rejected(EngineError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRecord {
    pub tick: Ticks,
    pub seq: u64,
    pub outcome: CommandOutcome,
}

// ---------------------------------------------------------------------------
// CommandQueue
// ---------------------------------------------------------------------------

/// Commands waiting for the next tick boundary, with optional history.
#[derive(Debug, Default)]
pub struct CommandQueue {
    pending: Vec<(u64, Command)>,
    next_seq: u64,
    /// Applied commands: (tick, seq, command).
    history: Vec<(Ticks, u64, Command)>,
    /// 0 keeps no history.
    max_history: usize,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            max_history,
            ..Self::default()
        }
    }

    /// Queue a command. Returns its sequence number.
    pub fn push(&mut self, command: Command) -> u64 {
        self.next_seq += 1;
        self.pending.push((self.next_seq, command));
        self.next_seq
    }

    pub fn push_batch(&mut self, commands: impl IntoIterator<Item = Command>) -> Vec<u64> {
        commands.into_iter().map(|c| self.push(c)).collect()
    }

    /// Take every pending command in submission order and record them in
    /// history under `tick`.
    pub fn drain(&mut self, tick: Ticks) -> Vec<(u64, Command)> {
        let commands = std::mem::take(&mut self.pending);
        if self.max_history > 0 {
            self.history
                .extend(commands.iter().map(|(seq, c)| (tick, *seq, c.clone())));
            let excess = self.history.len().saturating_sub(self.max_history);
            self.history.drain(..excess);
        }
        commands
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Sequence number the next push will receive, minus one.
    pub fn last_seq(&self) -> u64 {
        self.next_seq
    }

    pub(crate) fn pending(&self) -> &[(u64, Command)] {
        &self.pending
    }

    /// Put back commands and the sequence counter after loading a snapshot.
    pub(crate) fn restore_pending(&mut self, pending: Vec<(u64, Command)>, last_seq: u64) {
        self.pending = pending;
        self.next_seq = last_seq;
    }

    pub fn history(&self) -> &[(Ticks, u64, Command)] {
        &self.history
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn train() -> TrainId {
        let mut sm = SlotMap::<TrainId, ()>::with_key();
        sm.insert(())
    }

    fn request(signal: u32) -> Command {
        Command::RequestRoute {
            train: train(),
            signal: SignalId(signal),
            path: vec![SectionId(1), SectionId(2)],
        }
    }

    // -----------------------------------------------------------------------
    // Test 1: sequence numbers increase from one
    // -----------------------------------------------------------------------
    #[test]
    fn sequence_numbers_increase() {
        let mut queue = CommandQueue::new();
        assert_eq!(queue.push(request(0)), 1);
        assert_eq!(queue.push(request(1)), 2);
        assert_eq!(queue.push_batch([request(2), request(3)]), vec![3, 4]);
        assert_eq!(queue.pending_count(), 4);
    }

    // -----------------------------------------------------------------------
    // Test 2: drain keeps submission order and empties the queue
    // -----------------------------------------------------------------------
    #[test]
    fn drain_preserves_order() {
        let mut queue = CommandQueue::new();
        queue.push(request(5));
        queue.push(Command::WithdrawRoute { signal: SignalId(1) });
        let drained = queue.drain(0);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].0, 1);
        assert!(matches!(drained[1].1, Command::WithdrawRoute { .. }));
        assert!(queue.is_empty());
    }

    // -----------------------------------------------------------------------
    // Test 3: history is trimmed to its limit
    // -----------------------------------------------------------------------
    #[test]
    fn history_trimming() {
        let mut queue = CommandQueue::with_max_history(3);
        queue.push_batch([request(0), request(1), request(2)]);
        queue.drain(1);
        queue.push_batch([request(3), request(4)]);
        queue.drain(2);
        let history = queue.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].1, 3);
        assert_eq!(history[2].0, 2);
    }

    // -----------------------------------------------------------------------
    // Test 4: no history by default
    // -----------------------------------------------------------------------
    #[test]
    fn no_history_by_default() {
        let mut queue = CommandQueue::new();
        queue.push(request(0));
        queue.drain(10);
        assert!(queue.history().is_empty());
    }

    #[test]
    fn positions_sort_before_requests() {
        let report = Command::ReportPosition {
            train: train(),
            report: PositionReport::default(),
        };
        assert!(report.class() < request(0).class());
        assert!(Command::WithdrawRoute { signal: SignalId(0) }.class() < request(0).class());
    }
}
