//! Layouts loaded from data files drive a live engine.

use interlock_core::engine::Engine;
use interlock_core::network::{Direction, Pin};
use interlock_core::signal::{Aspect, SignalState};
use interlock_core::station::StopState;
use interlock_core::train::PositionReport;
use interlock_data::load_layout;
use std::fs;
use std::path::PathBuf;

fn make_test_dir(suffix: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "interlock_it_{suffix}_{}",
        std::process::id()
    ));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

const BRANCH_LINE: &str = r#"(
    sections: [
        (name: "yard", length: 150.0),
        (name: "p1", length: 220.0),
        (name: "line1", length: 800.0),
        (name: "line2", length: 800.0),
        (name: "terminus", kind: EndOfTrack, length: 180.0),
    ],
    links: [
        (from: "yard", to: "p1"),
        (from: "p1", to: "line1"),
        (from: "line1", to: "line2"),
        (from: "line2", to: "terminus"),
    ],
    signals: [
        (name: "Y1", section: "yard"),
        (name: "P1", section: "p1"),
        (name: "L2", section: "line2"),
    ],
)"#;

const TIMETABLE: &str = r#"
[[trains]]
name = "RB 7"
length = 90.0

[[trains.stops]]
station = "Upton"
platform = "p1"
exit_signal = "P1"
min_stop = 3
departure = 4
flags = ["hold_signal"]
"#;

#[test]
fn loaded_layout_runs_a_service() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = make_test_dir("branch_line");
    fs::write(dir.join("network.ron"), BRANCH_LINE).unwrap();
    fs::write(dir.join("timetable.toml"), TIMETABLE).unwrap();
    fs::write(dir.join("config.json"), r#"{"connection_timeout": 50}"#).unwrap();

    let layout = load_layout(&dir).unwrap();
    let _ = fs::remove_dir_all(&dir);
    assert_eq!(layout.config.connection_timeout, 50);
    assert_eq!(layout.trains.len(), 1);

    let net = &layout.network;
    let p1 = net.section_id("p1").unwrap();
    let line1 = net.section_id("line1").unwrap();
    let line2 = net.section_id("line2").unwrap();
    let terminus = net.section_id("terminus").unwrap();
    let p1_exit = net.signal_id("P1").unwrap();
    let l2 = net.signal_id("L2").unwrap();

    let mut engine = Engine::new(layout.network.clone(), layout.config.clone());
    let train = engine
        .add_train(layout.trains[0].clone(), vec![Pin::new(p1, Direction::Ahead)])
        .unwrap();

    // The route runs past L2, so the request is propagated to it.
    engine.submit_route(train, p1_exit, vec![line1, line2, terminus]);
    engine.step();
    assert_eq!(engine.signal_state(p1_exit), Some(SignalState::FullRouteCleared));
    assert_eq!(engine.signal_state(l2), Some(SignalState::FullRouteCleared));
    assert_eq!(
        engine.snapshot_train(train).unwrap().current_stop,
        Some(("Upton".to_string(), StopState::Berthed))
    );
    assert_eq!(engine.aspect(p1_exit), Some(Aspect::Stop));

    for _ in 0..4 {
        engine.step();
    }
    assert_eq!(
        engine.snapshot_train(train).unwrap().current_stop,
        Some(("Upton".to_string(), StopState::DepartureCleared))
    );
    assert_eq!(engine.aspect(p1_exit), Some(Aspect::Clear));

    engine.submit_position(
        train,
        PositionReport::at(vec![Pin::new(line1, Direction::Ahead), Pin::new(p1, Direction::Ahead)])
            .moving(interlock_core::test_utils::fixed(15.0)),
    );
    engine.step();
    let reports = engine.completed_stops(train).unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].station, "Upton");
    assert_eq!(reports[0].departure_delay(), 1);
}
