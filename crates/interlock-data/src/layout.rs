//! Layout loading: reads a data directory and resolves names into a
//! validated [`TrackNetwork`], an [`EngineConfig`] and the train services.
//!
//! Expected files, each in RON, JSON or TOML:
//!
//! - `network` (required) -- sections, links, signals, deadlock groups, pools.
//! - `config` (optional) -- engine policy overrides.
//! - `timetable` (optional) -- train services and their stops. In TOML the
//!   list lives under the `trains` key.

use crate::loader::{
    DataLoadError, check_duplicate, deserialize_file, deserialize_list, find_data_file,
    require_data_file, resolve_name,
};
use crate::schema::{ConfigData, NetworkData, PinData, StopData, StopFlagData, TrainData};
use interlock_core::config::EngineConfig;
use interlock_core::deadlock::{AlternativePathDef, DeadlockGroupDef};
use interlock_core::fixed::{Fixed64, f64_to_fixed64};
use interlock_core::id::{SectionId, SignalId};
use interlock_core::network::{NetworkBuilder, Pin, TrackNetwork};
use interlock_core::pool::{PoolDef, StorageDef, TurntableDef};
use interlock_core::signal::{ApproachControl, SignalDef};
use interlock_core::sim::SimulationStrategy;
use interlock_core::station::{Connection, StationStopDef, StopFlags};
use interlock_core::train::TrainDef;
use log::info;
use std::collections::HashMap;
use std::path::Path;

/// Everything needed to start an engine.
#[derive(Debug, Clone)]
pub struct Layout {
    pub network: TrackNetwork,
    pub config: EngineConfig,
    pub trains: Vec<TrainDef>,
}

/// Load a layout from `dir`.
pub fn load_layout(dir: &Path) -> Result<Layout, DataLoadError> {
    let network_path = require_data_file(dir, "network")?;
    let network_data: NetworkData = deserialize_file(&network_path)?;
    let network = build_network(&network_data, &network_path)?;
    info!(
        "loaded network from {}: {} sections, {} signals, {} deadlock groups, {} pools",
        network_path.display(),
        network.section_count(),
        network.signals().len(),
        network.deadlock_groups().len(),
        network.pools().len()
    );

    let config = match find_data_file(dir, "config")? {
        Some(path) => {
            let data: ConfigData = deserialize_file(&path)?;
            info!("loaded config overrides from {}", path.display());
            build_config(&data)
        }
        None => EngineConfig::default(),
    };

    let trains = match find_data_file(dir, "timetable")? {
        Some(path) => {
            let data: Vec<TrainData> = deserialize_list(&path, "trains")?;
            let trains = build_trains(&data, &network, &path)?;
            info!("loaded {} trains from {}", trains.len(), path.display());
            trains
        }
        None => Vec::new(),
    };

    Ok(Layout {
        network,
        config,
        trains,
    })
}

// ===========================================================================
// Network
// ===========================================================================

fn resolve_pin(
    sections: &HashMap<String, SectionId>,
    pin: &PinData,
    file: &Path,
) -> Result<Pin, DataLoadError> {
    let section = *resolve_name(sections, &pin.section, file, "section")?;
    Ok(Pin::new(section, pin.direction))
}

fn resolve_pins(
    sections: &HashMap<String, SectionId>,
    pins: &[PinData],
    file: &Path,
) -> Result<Vec<Pin>, DataLoadError> {
    pins.iter().map(|p| resolve_pin(sections, p, file)).collect()
}

/// Resolve names and validate the topology.
pub fn build_network(data: &NetworkData, file: &Path) -> Result<TrackNetwork, DataLoadError> {
    let mut builder = NetworkBuilder::new();

    let mut sections: HashMap<String, SectionId> = HashMap::new();
    for s in &data.sections {
        check_duplicate(&sections, &s.name, file)?;
        let id = builder.add_section(&s.name, s.kind, f64_to_fixed64(s.length));
        if s.default_alignment != 0 {
            builder.set_default_alignment(id, s.default_alignment);
        }
        sections.insert(s.name.clone(), id);
    }

    for link in &data.links {
        let from = *resolve_name(&sections, &link.from, file, "section")?;
        let to = *resolve_name(&sections, &link.to, file, "section")?;
        builder.connect(from, link.from_dir, to, link.to_dir);
    }

    let mut signals: HashMap<String, SignalId> = HashMap::new();
    for s in &data.signals {
        check_duplicate(&signals, &s.name, file)?;
        let section = *resolve_name(&sections, &s.section, file, "section")?;
        let mut def = SignalDef::new(&s.name, section, s.direction);
        def.allow_partial_route = s.allow_partial_route;
        def.allow_partial_clear = s.allow_partial_clear;
        def.claim_lock = s.claim_lock;
        def.approach_control = s.approach_control.as_ref().map(|a| ApproachControl {
            distance: f64_to_fixed64(a.distance),
            max_speed: a.max_speed.map(f64_to_fixed64),
        });
        def.force_propagation_on_approach_control = s.force_propagation_on_approach_control;
        if let Some(n) = s.clear_ahead {
            def.clear_ahead = n;
        }
        signals.insert(s.name.clone(), builder.add_signal(def));
    }

    let mut groups: HashMap<String, ()> = HashMap::new();
    for g in &data.deadlock_groups {
        check_duplicate(&groups, &g.name, file)?;
        let paths = g
            .paths
            .iter()
            .map(|alt| {
                Ok(AlternativePathDef {
                    sections: resolve_pins(&sections, &alt.sections, file)?,
                    usable_length: alt.usable_length.map(f64_to_fixed64),
                })
            })
            .collect::<Result<Vec<_>, DataLoadError>>()?;
        builder.add_deadlock_group(DeadlockGroupDef {
            name: g.name.clone(),
            paths,
        });
        groups.insert(g.name.clone(), ());
    }

    let mut pools: HashMap<String, ()> = HashMap::new();
    for p in &data.pools {
        check_duplicate(&pools, &p.name, file)?;
        let storage = p
            .storage
            .iter()
            .map(|s| {
                Ok(StorageDef {
                    name: s.name.clone(),
                    access_path: resolve_pins(&sections, &s.access_path, file)?,
                    length: f64_to_fixed64(s.length),
                    turntable_angle: s.turntable_angle.map(f64_to_fixed64),
                })
            })
            .collect::<Result<Vec<_>, DataLoadError>>()?;
        let turntable = match &p.turntable {
            Some(t) => Some(TurntableDef {
                section: *resolve_name(&sections, &t.section, file, "section")?,
                approach_clearance: f64_to_fixed64(t.approach_clearance),
                release_clearance: f64_to_fixed64(t.release_clearance),
                speed: f64_to_fixed64(t.speed),
                initial_angle: f64_to_fixed64(t.initial_angle),
            }),
            None => None,
        };
        let access_signal = match &p.access_signal {
            Some(name) => Some(*resolve_name(&signals, name, file, "signal")?),
            None => None,
        };
        builder.add_pool(PoolDef {
            name: p.name.clone(),
            storage,
            turntable,
            access_signal,
        });
        pools.insert(p.name.clone(), ());
    }

    builder.build().map_err(|source| DataLoadError::Topology {
        file: file.to_path_buf(),
        source,
    })
}

// ===========================================================================
// Config
// ===========================================================================

/// Apply overrides on top of [`EngineConfig::default`].
pub fn build_config(data: &ConfigData) -> EngineConfig {
    let mut config = EngineConfig::default();
    if let Some(fixed_timestep) = data.fixed_timestep {
        config.strategy = SimulationStrategy::Delta { fixed_timestep };
    }
    if let Some(tie_break) = data.tie_break {
        config.tie_break = tie_break;
    }
    if let Some(t) = data.connection_timeout {
        config.connection_timeout = t;
    }
    if let Some(c) = data.standard_signal_clearance {
        config.standard_signal_clearance = f64_to_fixed64(c);
    }
    if let Some(c) = data.closeup_signal_clearance {
        config.closeup_signal_clearance = f64_to_fixed64(c);
    }
    if let Some(d) = data.max_claim_distance {
        config.max_claim_distance = f64_to_fixed64(d);
    }
    if let Some(n) = data.max_propagation {
        config.max_propagation = n;
    }
    if let Some(n) = data.event_capacity {
        config.event_capacity = n;
    }
    config
}

// ===========================================================================
// Timetable
// ===========================================================================

fn stop_flags(flags: &[StopFlagData]) -> StopFlags {
    flags.iter().fold(StopFlags::empty(), |acc, f| {
        acc | match f {
            StopFlagData::HoldSignal => StopFlags::HOLD_SIGNAL,
            StopFlagData::NoWait => StopFlags::NO_WAIT,
            StopFlagData::NoClaim => StopFlags::NO_CLAIM,
            StopFlagData::CloseupSignal => StopFlags::CLOSEUP_SIGNAL,
            StopFlagData::Closeup => StopFlags::CLOSEUP,
            StopFlagData::RestrictPlatformToSignal => StopFlags::RESTRICT_PLATFORM_TO_SIGNAL,
            StopFlagData::ExtendPlatformToSignal => StopFlags::EXTEND_PLATFORM_TO_SIGNAL,
            StopFlagData::Terminal => StopFlags::TERMINAL,
            StopFlagData::ExitSignal => StopFlags::EXIT_SIGNAL,
        }
    })
}

fn build_stop(
    stop: &StopData,
    network: &TrackNetwork,
    sections: &HashMap<String, SectionId>,
    signals: &HashMap<String, SignalId>,
    file: &Path,
) -> Result<StationStopDef, DataLoadError> {
    let platform = *resolve_name(sections, &stop.platform, file, "section")?;
    let platform_end = match stop.platform_end {
        Some(end) => f64_to_fixed64(end),
        None => network
            .section(platform)
            .map(|s| s.length)
            .unwrap_or(Fixed64::ZERO),
    };
    let mut def = StationStopDef::new(&stop.station, platform, platform_end);
    def.platform_start = f64_to_fixed64(stop.platform_start);
    def.exit_signal = match &stop.exit_signal {
        Some(name) => Some(*resolve_name(signals, name, file, "signal")?),
        None => None,
    };
    def.signal_offset = stop.signal_offset.map(f64_to_fixed64);
    def.scheduled_arrival = stop.arrival;
    def.scheduled_departure = stop.departure;
    def.min_stop = stop.min_stop;
    def.boarding_time = stop.boarding_time;
    def.flags = stop_flags(&stop.flags);
    def.connections = stop
        .connections
        .iter()
        .map(|c| Connection {
            train: c.train.clone(),
            max_wait: c.max_wait,
        })
        .collect();
    Ok(def)
}

/// Resolve train services against a built network. Connections must name
/// another train in the same timetable.
pub fn build_trains(
    data: &[TrainData],
    network: &TrackNetwork,
    file: &Path,
) -> Result<Vec<TrainDef>, DataLoadError> {
    let sections: HashMap<String, SectionId> = network
        .sections()
        .iter()
        .enumerate()
        .map(|(i, s)| (s.name.clone(), SectionId(i as u32)))
        .collect();
    let signals: HashMap<String, SignalId> = network
        .signals()
        .iter()
        .enumerate()
        .map(|(i, s)| (s.name.clone(), SignalId(i as u32)))
        .collect();

    let mut names: HashMap<String, ()> = HashMap::new();
    for t in data {
        check_duplicate(&names, &t.name, file)?;
        names.insert(t.name.clone(), ());
    }

    let mut trains = Vec::with_capacity(data.len());
    for t in data {
        let mut def = TrainDef::new(&t.name, f64_to_fixed64(t.length));
        def.priority = t.priority;
        for stop in &t.stops {
            for c in &stop.connections {
                resolve_name(&names, &c.train, file, "train")?;
            }
            def.stops
                .push(build_stop(stop, network, &sections, &signals, file)?);
        }
        trains.push(def);
    }
    Ok(trains)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use interlock_core::config::TieBreak;
    use interlock_core::network::{Direction, SectionKind};
    use interlock_core::test_utils::fixed;
    use std::fs;
    use std::path::PathBuf;

    fn make_test_dir(suffix: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "interlock_layout_test_{suffix}_{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn cleanup(dir: &Path) {
        let _ = fs::remove_dir_all(dir);
    }

    const PASSING_LOOP: &str = r#"(
    sections: [
        (name: "west", length: 300.0),
        (name: "wj", kind: Junction, length: 30.0),
        (name: "main", length: 400.0),
        (name: "loop", length: 400.0),
        (name: "ej", kind: Junction, length: 30.0),
        (name: "east", length: 300.0),
    ],
    links: [
        (from: "west", to: "wj"),
        (from: "wj", to: "main"),
        (from: "wj", to: "loop"),
        (from: "main", to: "ej", to_dir: Reverse),
        (from: "loop", to: "ej", to_dir: Reverse),
        (from: "ej", from_dir: Reverse, to: "east"),
    ],
    signals: [
        (name: "W1", section: "west"),
        (name: "E1", section: "east", direction: Reverse, allow_partial_route: false),
        (name: "M1", section: "main", approach_control: Some((distance: 200.0, max_speed: Some(10.0)))),
    ],
    deadlock_groups: [
        (name: "loop_pair", paths: [
            (sections: [(section: "main")]),
            (sections: [(section: "loop")], usable_length: Some(350.0)),
        ]),
    ],
)"#;

    // -----------------------------------------------------------------------
    // Test 1: a RON network resolves names and validates
    // -----------------------------------------------------------------------
    #[test]
    fn load_ron_network() {
        let dir = make_test_dir("ron_network");
        fs::write(dir.join("network.ron"), PASSING_LOOP).unwrap();

        let layout = load_layout(&dir).unwrap();
        let net = &layout.network;
        assert_eq!(net.section_count(), 6);
        let wj = net.section_id("wj").unwrap();
        assert_eq!(net.section(wj).unwrap().kind, SectionKind::Junction);

        let e1 = net.signal_id("E1").unwrap();
        let def = net.signal(e1).unwrap();
        assert_eq!(def.direction, Direction::Reverse);
        assert!(!def.allow_partial_route);

        let m1 = net.signal(net.signal_id("M1").unwrap()).unwrap();
        let approach = m1.approach_control.unwrap();
        assert_eq!(approach.distance, fixed(200.0));

        let group = &net.deadlock_groups()[0];
        assert_eq!(group.paths[1].usable_length, Some(fixed(350.0)));

        assert_eq!(layout.config, EngineConfig::default());
        assert!(layout.trains.is_empty());
        cleanup(&dir);
    }

    // -----------------------------------------------------------------------
    // Test 2: missing network file is an error
    // -----------------------------------------------------------------------
    #[test]
    fn missing_network_is_error() {
        let dir = make_test_dir("missing_network");
        fs::write(dir.join("timetable.ron"), "[]").unwrap();
        assert!(matches!(
            load_layout(&dir),
            Err(DataLoadError::MissingRequired { .. })
        ));
        cleanup(&dir);
    }

    // -----------------------------------------------------------------------
    // Test 3: unknown section in a link
    // -----------------------------------------------------------------------
    #[test]
    fn unknown_link_target_is_unresolved() {
        let dir = make_test_dir("unresolved_link");
        fs::write(
            dir.join("network.json"),
            r#"{
                "sections": [{"name": "a", "length": 100.0}],
                "links": [{"from": "a", "to": "nowhere"}]
            }"#,
        )
        .unwrap();
        let result = load_layout(&dir);
        assert!(matches!(
            result,
            Err(DataLoadError::UnresolvedRef { ref name, expected_kind: "section", .. }) if name == "nowhere"
        ));
        cleanup(&dir);
    }

    // -----------------------------------------------------------------------
    // Test 4: duplicate section names
    // -----------------------------------------------------------------------
    #[test]
    fn duplicate_section_is_rejected() {
        let dir = make_test_dir("duplicate_section");
        fs::write(
            dir.join("network.toml"),
            r#"
[[sections]]
name = "a"
length = 100.0

[[sections]]
name = "a"
length = 50.0
"#,
        )
        .unwrap();
        assert!(matches!(
            load_layout(&dir),
            Err(DataLoadError::DuplicateName { ref name, .. }) if name == "a"
        ));
        cleanup(&dir);
    }

    // -----------------------------------------------------------------------
    // Test 5: a bad topology is reported with its file
    // -----------------------------------------------------------------------
    #[test]
    fn zero_length_section_is_topology_error() {
        let dir = make_test_dir("topology");
        fs::write(
            dir.join("network.ron"),
            r#"(sections: [(name: "a", length: 0.0)])"#,
        )
        .unwrap();
        let result = load_layout(&dir);
        assert!(matches!(
            result,
            Err(DataLoadError::Topology { ref file, .. }) if file.ends_with("network.ron")
        ));
        cleanup(&dir);
    }

    // -----------------------------------------------------------------------
    // Test 6: config overrides keep unset defaults
    // -----------------------------------------------------------------------
    #[test]
    fn config_overrides_apply() {
        let dir = make_test_dir("config");
        fs::write(dir.join("network.ron"), PASSING_LOOP).unwrap();
        fs::write(
            dir.join("config.toml"),
            "tie_break = \"TrainPriority\"\nconnection_timeout = 60\nfixed_timestep = 2\nmax_claim_distance = 12.5\n",
        )
        .unwrap();

        let layout = load_layout(&dir).unwrap();
        let defaults = EngineConfig::default();
        assert_eq!(layout.config.tie_break, TieBreak::TrainPriority);
        assert_eq!(layout.config.connection_timeout, 60);
        assert_eq!(
            layout.config.strategy,
            SimulationStrategy::Delta { fixed_timestep: 2 }
        );
        assert_eq!(layout.config.max_claim_distance, Fixed64::from_num(12.5));
        assert_eq!(layout.config.max_propagation, defaults.max_propagation);
        cleanup(&dir);
    }

    // -----------------------------------------------------------------------
    // Test 7: timetable stops resolve platforms, signals and flags
    // -----------------------------------------------------------------------
    #[test]
    fn timetable_resolves_stops() {
        let dir = make_test_dir("timetable");
        fs::write(dir.join("network.ron"), PASSING_LOOP).unwrap();
        fs::write(
            dir.join("timetable.ron"),
            r#"[
    (name: "IC 1", length: 150.0, priority: 2, stops: [
        (station: "Passing", platform: "main", exit_signal: Some("M1"),
         arrival: 100, departure: 160, min_stop: 30,
         flags: [hold_signal, closeup_signal],
         connections: [(train: "RE 2", max_wait: Some(40))]),
    ]),
    (name: "RE 2", length: 80.0),
]"#,
        )
        .unwrap();

        let layout = load_layout(&dir).unwrap();
        assert_eq!(layout.trains.len(), 2);
        let ic = &layout.trains[0];
        assert_eq!(ic.priority, 2);
        let stop = &ic.stops[0];
        assert_eq!(stop.platform, layout.network.section_id("main").unwrap());
        assert_eq!(stop.platform_end, fixed(400.0));
        assert_eq!(stop.exit_signal, layout.network.signal_id("M1"));
        assert_eq!(stop.flags, StopFlags::HOLD_SIGNAL | StopFlags::CLOSEUP_SIGNAL);
        assert_eq!(stop.connections[0].max_wait, Some(40));
        cleanup(&dir);
    }

    // -----------------------------------------------------------------------
    // Test 8: a connection to an unknown train is unresolved
    // -----------------------------------------------------------------------
    #[test]
    fn connection_to_unknown_train() {
        let dir = make_test_dir("bad_connection");
        fs::write(dir.join("network.ron"), PASSING_LOOP).unwrap();
        fs::write(
            dir.join("timetable.json"),
            r#"[{"name": "IC 1", "length": 150.0, "stops": [
                {"station": "Passing", "platform": "main",
                 "connections": [{"train": "ghost"}]}
            ]}]"#,
        )
        .unwrap();
        assert!(matches!(
            load_layout(&dir),
            Err(DataLoadError::UnresolvedRef { expected_kind: "train", .. })
        ));
        cleanup(&dir);
    }

    // -----------------------------------------------------------------------
    // Test 9: pools resolve their access signal and turntable
    // -----------------------------------------------------------------------
    #[test]
    fn pool_with_turntable() {
        let data: NetworkData = ron::from_str(
            r#"(
    sections: [
        (name: "lead", length: 200.0),
        (name: "table", length: 25.0),
        (name: "bay1", length: 120.0),
    ],
    links: [(from: "lead", to: "table"), (from: "table", to: "bay1")],
    signals: [(name: "shed", section: "lead")],
    pools: [(
        name: "depot",
        storage: [(name: "bay1", access_path: [(section: "table"), (section: "bay1")],
                   length: 120.0, turntable_angle: Some(90.0))],
        turntable: Some((section: "table", approach_clearance: 10.0,
                         release_clearance: 5.0, speed: 3.0)),
        access_signal: Some("shed"),
    )],
)"#,
        )
        .unwrap();

        let net = build_network(&data, Path::new("network.ron")).unwrap();
        let depot = net.pool(net.pool_id("depot").unwrap()).unwrap();
        assert_eq!(depot.access_signal, net.signal_id("shed"));
        let table = depot.turntable.as_ref().unwrap();
        assert_eq!(table.section, net.section_id("table").unwrap());
        assert_eq!(table.initial_angle, Fixed64::ZERO);
        assert_eq!(depot.storage[0].turntable_angle, Some(fixed(90.0)));
    }
}
