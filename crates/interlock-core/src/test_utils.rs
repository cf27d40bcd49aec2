//! Shared test helpers for unit tests, integration tests and benchmarks.
//!
//! Gated behind `#[cfg(any(test, feature = "test-utils"))]`.

use crate::config::EngineConfig;
use crate::deadlock::{AlternativePathDef, DeadlockGroupDef};
use crate::engine::Engine;
use crate::fixed::Fixed64;
use crate::id::*;
use crate::network::{Direction, NetworkBuilder, Pin, SectionKind, TrackNetwork};
use crate::signal::SignalDef;
use crate::train::TrainDef;
use std::ops::Range;

// ===========================================================================
// Fixed-point helper
// ===========================================================================

pub fn fixed(v: f64) -> Fixed64 {
    Fixed64::from_num(v)
}

// ===========================================================================
// Trains and engines
// ===========================================================================

pub fn train_def(name: &str, length: f64) -> TrainDef {
    TrainDef::new(name, fixed(length))
}

pub fn engine_for(network: TrackNetwork) -> Engine {
    Engine::new(network, EngineConfig::default())
}

// ===========================================================================
// Plain lines
// ===========================================================================

/// `n` sections `s0..s{n-1}` of 100 m, linked in the `Ahead` direction.
pub fn line_network(n: usize) -> TrackNetwork {
    line_builder(n)
        .build()
        .expect("line network is valid")
}

fn line_builder(n: usize) -> NetworkBuilder {
    let mut b = NetworkBuilder::new();
    let ids: Vec<SectionId> = (0..n)
        .map(|i| b.add_section(&format!("s{i}"), SectionKind::Normal, fixed(100.0)))
        .collect();
    for pair in ids.windows(2) {
        b.connect(pair[0], Direction::Ahead, pair[1], Direction::Ahead);
    }
    b
}

/// A line with signals at the `Ahead` exit of the given section indices.
pub struct SignalledLine {
    pub network: TrackNetwork,
    pub signals: Vec<SignalId>,
    sections: usize,
    defs: Vec<SignalDef>,
}

pub fn signalled_line(n: usize, at: &[usize]) -> SignalledLine {
    let defs = at
        .iter()
        .map(|&i| SignalDef::new(&format!("sig{i}"), SectionId(i as u32), Direction::Ahead))
        .collect();
    let mut fx = SignalledLine {
        network: line_network(n),
        signals: Vec::new(),
        sections: n,
        defs,
    };
    fx.rebuild();
    fx
}

impl SignalledLine {
    fn rebuild(&mut self) {
        let mut b = line_builder(self.sections);
        self.signals = self.defs.iter().cloned().map(|d| b.add_signal(d)).collect();
        self.network = b.build().expect("signalled line is valid");
    }

    /// Change whether signal `i` may hold a partial route.
    pub fn set_partial(&mut self, i: usize, allow: bool) {
        self.defs[i].allow_partial_route = allow;
        self.rebuild();
    }

    /// Apply `f` to signal `i`'s definition.
    pub fn configure(&mut self, i: usize, f: impl FnOnce(&mut SignalDef)) {
        f(&mut self.defs[i]);
        self.rebuild();
    }

    pub fn engine(&self) -> Engine {
        engine_for(self.network.clone())
    }

    pub fn pin(&self, i: usize) -> Pin {
        Pin::new(SectionId(i as u32), Direction::Ahead)
    }

    pub fn path(&self, range: Range<u32>) -> Vec<SectionId> {
        range.map(SectionId).collect()
    }
}

// ===========================================================================
// Single junction
// ===========================================================================

pub struct JunctionIds {
    pub approach: SectionId,
    pub junction: SectionId,
    pub main: SectionId,
    pub branch: SectionId,
}

/// `approach -> junction -> {main, branch}`, facing in the `Ahead`
/// direction, with signal `approach` at the approach exit.
pub fn junction_network() -> (TrackNetwork, JunctionIds) {
    let mut b = NetworkBuilder::new();
    let approach = b.add_section("approach", SectionKind::Normal, fixed(100.0));
    let junction = b.add_section("junction", SectionKind::Junction, fixed(30.0));
    let main = b.add_section("main", SectionKind::Normal, fixed(100.0));
    let branch = b.add_section("branch", SectionKind::Normal, fixed(100.0));
    b.connect(approach, Direction::Ahead, junction, Direction::Ahead);
    b.connect(junction, Direction::Ahead, main, Direction::Ahead);
    b.connect(junction, Direction::Ahead, branch, Direction::Ahead);
    b.add_signal(SignalDef::new("approach", approach, Direction::Ahead));
    let network = b.build().expect("junction network is valid");
    (
        network,
        JunctionIds {
            approach,
            junction,
            main,
            branch,
        },
    )
}

// ===========================================================================
// Single-track section between two loops
// ===========================================================================

/// ```text
///  w1 \                      / e1
///      WJ - s1 - s2 - s3 - EJ
///  w2 /                      \ e2
/// ```
///
/// `s1..s3` form deadlock group 0 with one alternative, traversed `Ahead`.
/// Signal `west` stands at the exit of `w1` eastbound, `east` at the exit
/// of `e2` westbound; both refuse partial routes.
pub struct SingleTrack {
    pub network: TrackNetwork,
    pub west: SignalId,
    pub east: SignalId,
    pub west_entry: Pin,
    pub east_entry: Pin,
    pub eastbound_path: Vec<SectionId>,
    pub westbound_path: Vec<SectionId>,
    pub single: [SectionId; 3],
}

pub fn single_track_fixture() -> SingleTrack {
    let mut b = NetworkBuilder::new();
    let w1 = b.add_section("w1", SectionKind::Normal, fixed(200.0));
    let w2 = b.add_section("w2", SectionKind::Normal, fixed(200.0));
    let wj = b.add_section("WJ", SectionKind::Junction, fixed(30.0));
    let s1 = b.add_section("s1", SectionKind::Normal, fixed(100.0));
    let s2 = b.add_section("s2", SectionKind::Normal, fixed(100.0));
    let s3 = b.add_section("s3", SectionKind::Normal, fixed(100.0));
    let ej = b.add_section("EJ", SectionKind::Junction, fixed(30.0));
    let e1 = b.add_section("e1", SectionKind::Normal, fixed(200.0));
    let e2 = b.add_section("e2", SectionKind::Normal, fixed(200.0));

    b.connect(w1, Direction::Ahead, wj, Direction::Ahead);
    b.connect(w2, Direction::Ahead, wj, Direction::Ahead);
    b.connect(wj, Direction::Ahead, s1, Direction::Ahead);
    b.connect(s1, Direction::Ahead, s2, Direction::Ahead);
    b.connect(s2, Direction::Ahead, s3, Direction::Ahead);
    b.connect(s3, Direction::Ahead, ej, Direction::Ahead);
    b.connect(ej, Direction::Ahead, e1, Direction::Ahead);
    b.connect(ej, Direction::Ahead, e2, Direction::Ahead);

    b.add_deadlock_group(DeadlockGroupDef {
        name: "single".to_string(),
        paths: vec![AlternativePathDef::new(vec![
            Pin::new(s1, Direction::Ahead),
            Pin::new(s2, Direction::Ahead),
            Pin::new(s3, Direction::Ahead),
        ])],
    });

    let mut west = SignalDef::new("west", w1, Direction::Ahead);
    west.allow_partial_route = false;
    let mut east = SignalDef::new("east", e2, Direction::Reverse);
    east.allow_partial_route = false;
    let west = b.add_signal(west);
    let east = b.add_signal(east);

    SingleTrack {
        network: b.build().expect("single-track fixture is valid"),
        west,
        east,
        west_entry: Pin::new(w1, Direction::Ahead),
        east_entry: Pin::new(e2, Direction::Reverse),
        eastbound_path: vec![wj, s1, s2, s3, ej, e1],
        westbound_path: vec![ej, s3, s2, s1, wj, w2],
        single: [s1, s2, s3],
    }
}

impl SingleTrack {
    pub fn engine(&self) -> Engine {
        engine_for(self.network.clone())
    }
}
