//! End-to-end: shorthand source through the compiler, printer and queue.

mod common;

use std::sync::Arc;

use common::{live_with, RecordingTransport};
use printloop_core::compiler::{compile_block, compile_line};
use printloop_core::session::SessionEvent;

#[test]
fn test_shorthand_expands_to_full_chain() {
    let cases = [
        ("# lp.moveto x: 20 y: 20 speed: 80", "lp.moveto({x:20,y:20,speed:80})"),
        ("# moveto x: 20 y: 20 speed: 80 #", "lp.moveto({x:20,y:20,speed:80})"),
        ("# start 210 | move x: 23 y: 50 z: 10", "lp.start(210).move({x:23,y:50,z:10})"),
        ("# turn 45 | dist 10 | go 1", "lp.turn(45).dist(10).go(1)"),
        ("# upto lp.maxz / 2", "lp.upto((lp.maxz/2))"),
    ];
    for (shorthand, expanded) in cases {
        assert_eq!(compile_line(shorthand, 1).unwrap().to_string(), expanded, "{}", shorthand);
    }
}

#[tokio::test]
async fn test_block_with_one_bad_line_runs_the_rest() {
    let body = "\
# lp.moveto x: 20 y: 20
# lp.moveto x: y: 20
# up 1
turn 90 | dist 10
travel";
    let compiled = compile_block(body, 2);
    assert_eq!(compiled.statements.len(), 4);
    assert_eq!(compiled.errors.len(), 1);
    assert_eq!(compiled.errors[0].line, 3);

    let transport = Arc::new(RecordingTransport::new());
    let live = live_with(transport.clone()).await;
    let report = live.run_source(&format!("##\n{}\n##\n", body)).await;

    assert_eq!(report.executed, 4);
    assert_eq!(report.parse_errors, compiled.errors);
    assert_eq!(
        transport.sent(),
        vec!["G0 X20 Y20 Z0 F3000", "G0 X20 Y20 Z1 F3000", "G0 X20 Y30 Z1 F3000"]
    );

    let parse_failures = live
        .session()
        .events()
        .await
        .iter()
        .filter(|r| matches!(r.event, SessionEvent::ParseFailed { line: 3, .. }))
        .count();
    assert_eq!(parse_failures, 1);
    live.shutdown().await;
}

#[tokio::test]
async fn test_pipe_steps_run_left_to_right() {
    let transport = Arc::new(RecordingTransport::new());
    let live = live_with(transport.clone()).await;

    let report = live
        .run_source("# temp 200 | bed 60 | moveto x: 5 | gcode \"M114\"")
        .await;
    assert!(report.is_clean());
    assert_eq!(
        transport.sent(),
        vec!["M104 S200", "M140 S60", "G0 X5 Y0 Z0 F3000", "M114"]
    );
    live.shutdown().await;
}

#[tokio::test]
async fn test_extrusion_accumulates_filament() {
    let transport = Arc::new(RecordingTransport::new());
    let live = live_with(transport.clone()).await;

    let report = live
        .run_source("##\nmoveto x: 10 y: 10 z: 0.2\nextrude x: 10\nextrudeto x: 10 y: 10 e: 5\nretract\n##")
        .await;
    assert!(report.is_clean(), "{:?}", report);

    let state = live.printer().snapshot().await;
    assert_eq!((state.x, state.y), (10.0, 10.0));
    assert_eq!(state.e, 1.0);
    assert_eq!(state.retraction, 4.0);

    let sent = transport.sent();
    assert!(sent[1].starts_with("G1 X20 Y10 Z0.2 E0.3326"), "{}", sent[1]);
    assert_eq!(sent[2], "G1 X10 Y10 Z0.2 E5 F1800");
    assert_eq!(sent[3], "G1 E1 F1800");
    live.shutdown().await;
}
