//! Deadlock detection and arbitration for groups of alternative paths.
//!
//! A deadlock group is a stretch of shared track (single line between
//! passing loops, a crossing loop) where two trains travelling towards each
//! other could block one another. Each group carries a fixed table of
//! alternative paths. [`DeadlockInfo`] records which train owns or waits for
//! which alternative and decides, first come first served, who may enter.
//!
//! Arbitration never picks paths for trains. It only answers a request for
//! a specific alternative with [`DeadlockDecision`].

use crate::fixed::Fixed64;
use crate::id::{DeadlockId, PathId, SectionId, TrainId};
use crate::network::{Direction, Pin, TrackNetwork};
use crate::route::PartialPathRoute;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// ---------------------------------------------------------------------------
// Static definition
// ---------------------------------------------------------------------------

/// One alternative through a deadlock group, in its defined direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlternativePathDef {
    pub sections: Vec<Pin>,
    /// Length available to hold a train. Defaults to the summed section
    /// lengths.
    pub usable_length: Option<Fixed64>,
}

impl AlternativePathDef {
    pub fn new(sections: Vec<Pin>) -> Self {
        Self {
            sections,
            usable_length: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadlockGroupDef {
    pub name: String,
    pub paths: Vec<AlternativePathDef>,
}

impl DeadlockGroupDef {
    /// Every section used by any alternative, ascending.
    pub fn sections(&self) -> BTreeSet<SectionId> {
        self.paths
            .iter()
            .flat_map(|p| p.sections.iter().map(|pin| pin.section))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Runtime state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimState {
    Waiting,
    Owned,
}

/// A train's claim on one alternative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathClaim {
    pub path: PathId,
    pub reversed: bool,
    pub state: ClaimState,
    /// Request sequence number; lower is older.
    pub order: u64,
    /// The train has physically entered the group.
    pub entered: bool,
}

/// Answer to a path request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeadlockDecision {
    Granted,
    Queued { behind: TrainId },
    PathTooShort,
}

/// Runtime arbitration state for one deadlock group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadlockInfo {
    pub group: DeadlockId,
    pub available_paths: Vec<PartialPathRoute>,
    usable_lengths: Vec<Fixed64>,
    /// For each path, the paths that share at least one section with it
    /// (itself included).
    pub path_references: Vec<Vec<PathId>>,
    pub train_own_path: BTreeMap<TrainId, PathClaim>,
    /// Trains claiming each path.
    pub inverse_info: BTreeMap<PathId, BTreeSet<TrainId>>,
    /// `train_length_fit[path][train]`.
    pub train_length_fit: Vec<BTreeMap<TrainId, bool>>,
}

impl DeadlockInfo {
    pub fn new(group: DeadlockId, def: &DeadlockGroupDef, network: &TrackNetwork) -> Self {
        let available_paths: Vec<PartialPathRoute> = def
            .paths
            .iter()
            .map(|p| PartialPathRoute::from_pins(&p.sections))
            .collect();
        let usable_lengths = def
            .paths
            .iter()
            .map(|p| {
                p.usable_length.unwrap_or_else(|| {
                    p.sections
                        .iter()
                        .filter_map(|pin| network.section(pin.section))
                        .fold(Fixed64::ZERO, |acc, s| acc + s.length)
                })
            })
            .collect();
        let section_sets: Vec<BTreeSet<SectionId>> = def
            .paths
            .iter()
            .map(|p| p.sections.iter().map(|pin| pin.section).collect())
            .collect();
        let path_references = section_sets
            .iter()
            .map(|a| {
                section_sets
                    .iter()
                    .enumerate()
                    .filter(|(_, b)| !a.is_disjoint(b))
                    .map(|(j, _)| PathId(j as u32))
                    .collect()
            })
            .collect();
        Self {
            group,
            available_paths,
            usable_lengths,
            path_references,
            train_own_path: BTreeMap::new(),
            inverse_info: BTreeMap::new(),
            train_length_fit: vec![BTreeMap::new(); def.paths.len()],
        }
    }

    /// Record a train's length against every alternative.
    pub fn register_train(&mut self, train: TrainId, length: Fixed64) {
        for (fit, usable) in self.train_length_fit.iter_mut().zip(&self.usable_lengths) {
            fit.insert(train, length <= *usable);
        }
    }

    /// Forget a train entirely. Returns waiting trains that became grantable.
    pub fn unregister_train(&mut self, train: TrainId) -> Vec<TrainId> {
        let woken = self.release(train);
        for fit in &mut self.train_length_fit {
            fit.remove(&train);
        }
        woken
    }

    pub fn fits(&self, path: PathId, train: TrainId) -> bool {
        self.train_length_fit
            .get(path.index())
            .and_then(|m| m.get(&train))
            .copied()
            .unwrap_or(false)
    }

    pub fn claim(&self, train: TrainId) -> Option<&PathClaim> {
        self.train_own_path.get(&train)
    }

    /// The oldest train other than `train` owning a path that conflicts
    /// with `path` taken in the given sense.
    fn owner_against(&self, train: TrainId, path: PathId, reversed: bool) -> Option<TrainId> {
        self.train_own_path
            .iter()
            .filter(|(t, c)| **t != train && c.state == ClaimState::Owned)
            .filter(|(_, c)| self.conflicts(path, reversed, c.path, c.reversed))
            .min_by_key(|(_, c)| c.order)
            .map(|(t, _)| *t)
    }

    /// Request `path` for `train`. Steady-state contention is answered with
    /// `Queued`, never an error.
    ///
    /// An owned claim is never given up by a later request: a path that does
    /// not fit leaves it untouched, and a switch to another alternative keeps
    /// ownership and request order unless another owner blocks the new path.
    pub fn request(
        &mut self,
        train: TrainId,
        path: PathId,
        reversed: bool,
        order: u64,
    ) -> DeadlockDecision {
        if !self.fits(path, train) {
            debug!(
                "deadlock group {:?}: {:?} does not fit path {:?}",
                self.group, train, path
            );
            if self
                .claim(train)
                .is_some_and(|c| c.state == ClaimState::Waiting && !c.entered)
            {
                self.release(train);
            }
            return DeadlockDecision::PathTooShort;
        }

        let order = match self.train_own_path.get(&train).copied() {
            Some(c) if c.path == path && c.reversed == reversed => {
                if c.state == ClaimState::Owned {
                    return DeadlockDecision::Granted;
                }
                c.order
            }
            Some(c) if c.state == ClaimState::Owned => {
                if let Some(behind) = self.owner_against(train, path, reversed) {
                    debug!(
                        "deadlock group {:?}: {:?} keeps path {:?}, switch blocked by {:?}",
                        self.group, train, c.path, behind
                    );
                    return DeadlockDecision::Queued { behind };
                }
                self.remove_inverse(c.path, train);
                self.train_own_path.insert(train, PathClaim { path, reversed, ..c });
                self.inverse_info.entry(path).or_default().insert(train);
                debug!(
                    "deadlock group {:?}: {:?} switched to path {:?}",
                    self.group, train, path
                );
                return DeadlockDecision::Granted;
            }
            Some(c) => {
                self.remove_inverse(c.path, train);
                order
            }
            None => order,
        };

        let entered = self.train_own_path.get(&train).is_some_and(|c| c.entered);
        self.train_own_path.insert(
            train,
            PathClaim {
                path,
                reversed,
                state: ClaimState::Waiting,
                order,
                entered,
            },
        );
        self.inverse_info.entry(path).or_default().insert(train);

        if let Some(behind) = self.blocker(train) {
            debug!(
                "deadlock group {:?}: {:?} queued behind {:?}",
                self.group, train, behind
            );
            return DeadlockDecision::Queued { behind };
        }
        if let Some(claim) = self.train_own_path.get_mut(&train) {
            claim.state = ClaimState::Owned;
        }
        debug!(
            "deadlock group {:?}: {:?} owns path {:?}",
            self.group, train, path
        );
        DeadlockDecision::Granted
    }

    /// Mark that `train` is physically inside the group.
    pub fn mark_entered(&mut self, train: TrainId) {
        if let Some(claim) = self.train_own_path.get_mut(&train) {
            claim.entered = true;
        }
    }

    /// Drop `train`'s claim. Returns waiting trains that would now be
    /// granted, oldest first.
    pub fn release(&mut self, train: TrainId) -> Vec<TrainId> {
        let Some(claim) = self.train_own_path.remove(&train) else {
            return Vec::new();
        };
        self.remove_inverse(claim.path, train);
        self.grantable()
    }

    /// Waiting trains with no blocker, oldest first.
    pub fn grantable(&self) -> Vec<TrainId> {
        let mut waiting: Vec<(u64, TrainId)> = self
            .train_own_path
            .iter()
            .filter(|(_, c)| c.state == ClaimState::Waiting)
            .map(|(t, c)| (c.order, *t))
            .collect();
        waiting.sort();
        waiting
            .into_iter()
            .filter(|(_, t)| self.blocker(*t).is_none())
            .map(|(_, t)| t)
            .collect()
    }

    /// Waiting trains, oldest first.
    pub fn waiting(&self) -> Vec<TrainId> {
        let mut waiting: Vec<(u64, TrainId)> = self
            .train_own_path
            .iter()
            .filter(|(_, c)| c.state == ClaimState::Waiting)
            .map(|(t, c)| (c.order, *t))
            .collect();
        waiting.sort();
        waiting.into_iter().map(|(_, t)| t).collect()
    }

    /// Whether two claims may not coexist: they share a section and pass it
    /// in opposite directions.
    pub fn conflicts(&self, a: PathId, a_rev: bool, b: PathId, b_rev: bool) -> bool {
        let shares = self
            .path_references
            .get(a.index())
            .is_some_and(|refs| refs.contains(&b));
        if !shares {
            return false;
        }
        let (Some(pa), Some(pb)) = (
            self.available_paths.get(a.index()),
            self.available_paths.get(b.index()),
        ) else {
            return false;
        };
        pa.elements.iter().any(|ea| {
            pb.elements.iter().any(|eb| {
                ea.section == eb.section
                    && travel(ea.direction, a_rev) != travel(eb.direction, b_rev)
            })
        })
    }

    /// The claim `train` must wait for: the oldest conflicting owner, else
    /// the oldest conflicting earlier waiter.
    fn blocker(&self, train: TrainId) -> Option<TrainId> {
        let mine = self.train_own_path.get(&train)?;
        let mut owner: Option<(u64, TrainId)> = None;
        let mut waiter: Option<(u64, TrainId)> = None;
        for (other, claim) in &self.train_own_path {
            if *other == train || !self.conflicts(mine.path, mine.reversed, claim.path, claim.reversed) {
                continue;
            }
            match claim.state {
                ClaimState::Owned => {
                    if owner.is_none_or(|(o, _)| claim.order < o) {
                        owner = Some((claim.order, *other));
                    }
                }
                ClaimState::Waiting if claim.order < mine.order => {
                    if waiter.is_none_or(|(o, _)| claim.order < o) {
                        waiter = Some((claim.order, *other));
                    }
                }
                ClaimState::Waiting => {}
            }
        }
        owner.or(waiter).map(|(_, t)| t)
    }

    fn remove_inverse(&mut self, path: PathId, train: TrainId) {
        if let Some(set) = self.inverse_info.get_mut(&path) {
            set.remove(&train);
            if set.is_empty() {
                self.inverse_info.remove(&path);
            }
        }
    }
}

fn travel(direction: Direction, reversed: bool) -> Direction {
    if reversed { direction.reverse() } else { direction }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use slotmap::SlotMap;

    fn trains(n: usize) -> Vec<TrainId> {
        let mut sm = SlotMap::<TrainId, ()>::with_key();
        (0..n).map(|_| sm.insert(())).collect()
    }

    fn info() -> DeadlockInfo {
        let fx = single_track_fixture();
        let def = fx.network.deadlock_group(DeadlockId(0)).unwrap().clone();
        DeadlockInfo::new(DeadlockId(0), &def, &fx.network)
    }

    #[test]
    fn opposite_directions_conflict_same_direction_does_not() {
        let info = info();
        assert!(info.conflicts(PathId(0), false, PathId(0), true));
        assert!(!info.conflicts(PathId(0), false, PathId(0), false));
    }

    #[test]
    fn first_requester_owns_second_queues() {
        let mut info = info();
        let t = trains(2);
        info.register_train(t[0], fixed(50.0));
        info.register_train(t[1], fixed(50.0));
        assert_eq!(info.request(t[0], PathId(0), false, 1), DeadlockDecision::Granted);
        assert_eq!(
            info.request(t[1], PathId(0), true, 2),
            DeadlockDecision::Queued { behind: t[0] }
        );
        assert_eq!(info.inverse_info[&PathId(0)].len(), 2);
    }

    #[test]
    fn owner_is_never_displaced() {
        let mut info = info();
        let t = trains(2);
        info.register_train(t[0], fixed(50.0));
        info.register_train(t[1], fixed(50.0));
        info.request(t[0], PathId(0), false, 5);
        info.request(t[1], PathId(0), true, 1);
        assert_eq!(info.request(t[0], PathId(0), false, 9), DeadlockDecision::Granted);
        assert_eq!(info.claim(t[0]).unwrap().state, ClaimState::Owned);
    }

    #[test]
    fn release_wakes_oldest_waiter() {
        let mut info = info();
        let t = trains(3);
        for &train in &t {
            info.register_train(train, fixed(50.0));
        }
        info.request(t[0], PathId(0), false, 1);
        info.request(t[1], PathId(0), true, 2);
        info.request(t[2], PathId(0), true, 3);
        let woken = info.release(t[0]);
        assert_eq!(woken, vec![t[1], t[2]]);
        assert_eq!(info.request(t[1], PathId(0), true, 7), DeadlockDecision::Granted);
    }

    #[test]
    fn later_same_direction_train_waits_behind_earlier_waiter() {
        let mut info = info();
        let t = trains(3);
        for &train in &t {
            info.register_train(train, fixed(50.0));
        }
        info.request(t[0], PathId(0), false, 1);
        info.request(t[1], PathId(0), true, 2);
        // Follows the owner but would starve the waiter.
        assert_eq!(
            info.request(t[2], PathId(0), false, 3),
            DeadlockDecision::Queued { behind: t[1] }
        );
    }

    #[test]
    fn oversized_train_gets_path_too_short() {
        let mut info = info();
        let t = trains(1);
        info.register_train(t[0], fixed(10_000.0));
        assert!(!info.fits(PathId(0), t[0]));
        assert_eq!(
            info.request(t[0], PathId(0), false, 1),
            DeadlockDecision::PathTooShort
        );
        assert!(info.claim(t[0]).is_none());
    }

    /// Path 0 is the whole single line; path 1 is its middle section only,
    /// with `short` metres of room.
    fn two_path_info(short: f64) -> DeadlockInfo {
        let fx = single_track_fixture();
        let [s1, s2, s3] = fx.single;
        let ahead = |s| Pin::new(s, Direction::Ahead);
        let def = DeadlockGroupDef {
            name: "single".to_string(),
            paths: vec![
                AlternativePathDef::new(vec![ahead(s1), ahead(s2), ahead(s3)]),
                AlternativePathDef {
                    sections: vec![ahead(s2)],
                    usable_length: Some(fixed(short)),
                },
            ],
        };
        DeadlockInfo::new(DeadlockId(0), &def, &fx.network)
    }

    #[test]
    fn path_too_short_keeps_entered_owner() {
        let mut info = two_path_info(50.0);
        let t = trains(2);
        info.register_train(t[0], fixed(100.0));
        info.register_train(t[1], fixed(100.0));
        assert_eq!(info.request(t[0], PathId(0), false, 1), DeadlockDecision::Granted);
        info.mark_entered(t[0]);

        assert_eq!(info.request(t[0], PathId(1), false, 2), DeadlockDecision::PathTooShort);
        let claim = info.claim(t[0]).unwrap();
        assert_eq!(claim.state, ClaimState::Owned);
        assert_eq!(claim.path, PathId(0));
        assert_eq!(
            info.request(t[1], PathId(0), true, 3),
            DeadlockDecision::Queued { behind: t[0] }
        );
    }

    #[test]
    fn path_too_short_drops_unentered_waiter() {
        let mut info = two_path_info(50.0);
        let t = trains(2);
        info.register_train(t[0], fixed(100.0));
        info.register_train(t[1], fixed(100.0));
        info.request(t[0], PathId(0), false, 1);
        info.request(t[1], PathId(0), true, 2);
        assert_eq!(info.request(t[1], PathId(1), true, 3), DeadlockDecision::PathTooShort);
        assert!(info.claim(t[1]).is_none());
        assert_eq!(info.inverse_info[&PathId(0)].len(), 1);
    }

    #[test]
    fn owner_switching_path_keeps_its_place() {
        let mut info = two_path_info(300.0);
        let t = trains(2);
        info.register_train(t[0], fixed(100.0));
        info.register_train(t[1], fixed(100.0));
        info.request(t[0], PathId(0), false, 1);
        info.mark_entered(t[0]);
        assert_eq!(
            info.request(t[1], PathId(0), true, 2),
            DeadlockDecision::Queued { behind: t[0] }
        );

        assert_eq!(info.request(t[0], PathId(1), false, 9), DeadlockDecision::Granted);
        let claim = *info.claim(t[0]).unwrap();
        assert_eq!(claim.state, ClaimState::Owned);
        assert_eq!(claim.path, PathId(1));
        assert_eq!(claim.order, 1);
        assert!(claim.entered);
        assert!(info.grantable().is_empty());
        assert_eq!(
            info.request(t[1], PathId(0), true, 2),
            DeadlockDecision::Queued { behind: t[0] }
        );
    }

    #[test]
    fn owner_switch_blocked_by_other_owner_keeps_old_path() {
        let mut info = two_path_info(300.0);
        let t = trains(2);
        info.register_train(t[0], fixed(100.0));
        info.register_train(t[1], fixed(100.0));
        // Path 1 forward and path 0 forward share s2 in the same direction,
        // so both can be owned at once.
        info.request(t[0], PathId(0), false, 1);
        assert_eq!(info.request(t[1], PathId(1), false, 2), DeadlockDecision::Granted);

        assert_eq!(
            info.request(t[0], PathId(1), true, 3),
            DeadlockDecision::Queued { behind: t[1] }
        );
        let claim = info.claim(t[0]).unwrap();
        assert_eq!((claim.path, claim.state), (PathId(0), ClaimState::Owned));
    }

    #[test]
    fn unregister_removes_fit_entries() {
        let mut info = info();
        let t = trains(1);
        info.register_train(t[0], fixed(50.0));
        info.request(t[0], PathId(0), false, 1);
        info.unregister_train(t[0]);
        assert!(info.claim(t[0]).is_none());
        assert!(info.train_length_fit[0].is_empty());
        assert!(info.inverse_info.is_empty());
    }
}
