//! Session lifecycle: bring-up, stop/resume round trips, termination and
//! the outbound ordering guarantees.

use crate::common::{Messages, MockInterp, Op, TestSession, error_id};
use scriptdap::adapter::{DebugSession, RequestPump, RunMode};
use scriptdap::interp::ExceptionKind;
use serde_json::{Value as Json, json};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

fn breakpoint_args(path: &str, lines: &[u32]) -> Json {
    json!({
        "source": {"path": path},
        "breakpoints": lines.iter().map(|l| json!({"line": l})).collect::<Vec<_>>(),
    })
}

#[test]
fn test_full_lifecycle() {
    let mut ts = TestSession::start();

    let response = ts.request("initialize", json!({"adapterID": "scriptdap"}));
    assert_eq!(response["success"], json!(true));
    assert_eq!(
        response["body"]["supportsConfigurationDoneRequest"],
        json!(true)
    );

    let response = ts.request("attach", json!({}));
    assert_eq!(response["success"], json!(true));
    ts.messages.wait_for_event("initialized");

    let response = ts.request("setBreakpoints", breakpoint_args("/p/a.l", &[3]));
    assert_eq!(response["body"]["breakpoints"][0]["verified"], json!(true));

    ts.request("configurationDone", json!({}));

    let program = ts.spawn_program(vec![
        Op::Call { chunk: "@/p/a.l", name: "main" },
        Op::Line(1),
        Op::Line(3),
        Op::Line(4),
        Op::Return,
    ]);

    let stopped = ts.messages.wait_for_event("stopped");
    assert_eq!(stopped["body"]["reason"], json!("breakpoint"));
    assert_eq!(stopped["body"]["threadId"], json!(1));

    let response = ts.request("stackTrace", json!({"threadId": 1}));
    let frames = response["body"]["stackFrames"].as_array().unwrap();
    assert!(!frames.is_empty());
    assert_eq!(frames[0]["source"]["path"], json!("/p/a.l"));
    assert_eq!(frames[0]["line"], json!(3));

    let response = ts.request("continue", json!({"threadId": 1}));
    assert_eq!(response["body"]["allThreadsContinued"], json!(true));
    ts.messages.wait_for_event("continued");

    program.join().unwrap();
    ts.session.handle().on_exit(0);

    let exited = ts.messages.wait_for_event("exited");
    assert_eq!(exited["body"]["exitCode"], json!(0));
    ts.messages.wait_for_event("terminated");

    // seq is strictly increasing across every outbound message.
    let seqs: Vec<i64> = ts
        .messages
        .snapshot()
        .iter()
        .map(|m| m["seq"].as_i64().unwrap())
        .collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]), "seqs not monotonic: {seqs:?}");
}

#[test]
fn test_initialized_event_emitted_once() {
    let mut ts = TestSession::start();
    ts.request("initialize", json!({}));
    ts.request("attach", json!({}));
    ts.messages.wait_for_event("initialized");
    // A second attach re-reads configuration but must not re-announce.
    ts.request("attach", json!({}));
    assert_eq!(ts.messages.events("initialized").len(), 1);
}

#[test]
fn test_requests_invalid_in_running_state() {
    let mut ts = TestSession::start();
    ts.bring_up(json!({}));

    for command in ["stackTrace", "scopes", "variables", "evaluate", "continue"] {
        let response = ts.request(command, json!({}));
        assert_eq!(response["success"], json!(false), "{command}");
        assert_eq!(error_id(&response), 1001, "{command}");
    }
}

#[test]
fn test_unknown_command_not_supported() {
    let mut ts = TestSession::start();
    let response = ts.request("restartFrame", json!({}));
    assert_eq!(response["success"], json!(false));
    assert_eq!(error_id(&response), 1006);
}

#[test]
fn test_malformed_arguments() {
    let mut ts = TestSession::start();
    ts.bring_up(json!({}));
    let response = ts.request("setBreakpoints", json!({"breakpoints": []}));
    assert_eq!(response["success"], json!(false));
    assert_eq!(error_id(&response), 1000);
}

#[test]
fn test_stop_on_entry() {
    let mut ts = TestSession::start();
    ts.bring_up(json!({"stopOnEntry": true}));

    let program = ts.spawn_program(vec![
        Op::Call { chunk: "@/p/a.l", name: "main" },
        Op::Line(1),
        Op::Line(2),
        Op::Return,
    ]);

    let stopped = ts.messages.wait_for_event("stopped");
    assert_eq!(stopped["body"]["reason"], json!("entry"));

    ts.request("continue", json!({}));
    program.join().unwrap();
    assert_eq!(ts.messages.events("stopped").len(), 1);
}

#[test]
fn test_pause_stops_next_event() {
    let mut ts = TestSession::start();
    ts.bring_up(json!({}));

    let response = ts.request("pause", json!({"threadId": 1}));
    assert_eq!(response["success"], json!(true));

    let program = ts.spawn_program(vec![
        Op::Call { chunk: "@/p/a.l", name: "main" },
        Op::Line(1),
        Op::Line(2),
        Op::Return,
    ]);

    let stopped = ts.messages.wait_for_event("stopped");
    assert_eq!(stopped["body"]["reason"], json!("pause"));

    ts.request("continue", json!({}));
    program.join().unwrap();
    assert_eq!(ts.messages.events("stopped").len(), 1);
}

#[test]
fn test_exception_filter_stops() {
    let mut ts = TestSession::start();
    ts.request("initialize", json!({}));
    ts.request("attach", json!({}));
    ts.messages.wait_for_event("initialized");
    let response = ts.request("setExceptionBreakpoints", json!({"filters": ["uncaught"]}));
    assert_eq!(response["success"], json!(true));
    ts.request("configurationDone", json!({}));

    let program = ts.spawn_program(vec![
        Op::Call { chunk: "@/p/a.l", name: "main" },
        Op::Line(1),
        Op::Error("caught one", ExceptionKind::Caught),
        Op::Error("boom", ExceptionKind::Uncaught),
        Op::Return,
    ]);

    let stopped = ts.messages.wait_for_event("stopped");
    assert_eq!(stopped["body"]["reason"], json!("exception"));
    assert_eq!(stopped["body"]["text"], json!("boom"));

    ts.request("continue", json!({}));
    program.join().unwrap();
    assert_eq!(ts.messages.events("stopped").len(), 1);
}

#[test]
fn test_unknown_exception_filter_rejected() {
    let mut ts = TestSession::start();
    ts.request("initialize", json!({}));
    ts.request("attach", json!({}));
    let response = ts.request("setExceptionBreakpoints", json!({"filters": ["sometimes"]}));
    assert_eq!(response["success"], json!(false));
    assert_eq!(error_id(&response), 1000);
}

#[test]
fn test_disconnect_while_stopped_releases_interpreter() {
    let mut ts = TestSession::start();
    ts.request("initialize", json!({}));
    ts.request("attach", json!({}));
    ts.messages.wait_for_event("initialized");
    ts.request("setBreakpoints", breakpoint_args("/p/a.l", &[2]));
    ts.request("configurationDone", json!({}));

    let program = ts.spawn_program(vec![
        Op::Call { chunk: "@/p/a.l", name: "main" },
        Op::Line(1),
        Op::Line(2),
        Op::Line(3),
        Op::Line(4),
        Op::Return,
    ]);
    ts.messages.wait_for_event("stopped");

    let response = ts.request("disconnect", json!({}));
    assert_eq!(response["success"], json!(true));
    ts.messages.wait_for_event("terminated");

    // The interpreter thread is released and the rest of the program runs
    // without a debugger.
    program.join().unwrap();

    // No events are emitted after `terminated`.
    let messages = ts.messages.snapshot();
    let terminated_at = messages
        .iter()
        .position(|m| m["event"] == json!("terminated"))
        .unwrap();
    assert_eq!(terminated_at, messages.len() - 1, "{messages:#?}");
}

#[test]
fn test_output_coding() {
    let ts = {
        let mut ts = TestSession::start();
        ts.bring_up(json!({"consoleCoding": "ansi"}));
        ts
    };
    // 0xE9 is `é` in latin-flavored ANSI code pages and invalid UTF-8.
    ts.session.output("stdout", b"caf\xe9\n");
    let output = ts.messages.wait_for_event("output");
    assert_eq!(output["body"]["category"], json!("stdout"));
    assert_eq!(output["body"]["output"], json!("café\n"));
}

#[test]
fn test_source_request_for_synthetic_chunk() {
    let interp = MockInterp::default();
    interp.set_chunk_text("=stdin", "print('hi')");
    let mut ts = TestSession::with_interp(interp);
    ts.bring_up(json!({"stopOnEntry": true}));

    let program = ts.spawn_program(vec![
        Op::Call { chunk: "=stdin", name: "main" },
        Op::Line(1),
        Op::Return,
    ]);
    ts.messages.wait_for_event("stopped");

    let response = ts.request("stackTrace", json!({"threadId": 1}));
    let source_ref = response["body"]["stackFrames"][0]["source"]["sourceReference"]
        .as_i64()
        .unwrap();
    assert!(source_ref > 0);

    let response = ts.request("source", json!({"sourceReference": source_ref}));
    assert_eq!(response["body"]["content"], json!("print('hi')"));

    ts.request("continue", json!({}));
    program.join().unwrap();
}

/// Enables exactly one log target and drops everything it receives, so the
/// routed/fallback split of `SessionLogger` is observable without noise
/// from other tests in this binary.
struct TargetOnly;

const LOG_TARGET: &str = "session-log-test";

impl log::Log for TargetOnly {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.target() == LOG_TARGET
    }

    fn log(&self, _: &log::Record) {}

    fn flush(&self) {}
}

/// Adapter diagnostics reach the front-end as `output` events when a
/// `SessionLogger` is installed.
#[test]
fn test_session_logger_routes_diagnostics() {
    let ts = TestSession::start();
    scriptdap::log::install(
        scriptdap::log::SessionLogger::new(ts.session.handle(), TargetOnly),
        log::LevelFilter::Info,
    );

    log::info!(target: LOG_TARGET, "ping from the adapter");

    let output = ts.messages.wait_for_event("output");
    assert_eq!(output["body"]["category"], json!("console"));
    let line = output["body"]["output"].as_str().unwrap();
    assert!(line.contains("ping from the adapter"), "{line}");
    assert!(line.starts_with("[INFO]"), "{line}");
}

struct QueuePump(Arc<Mutex<VecDeque<Json>>>);

impl RequestPump for QueuePump {
    fn poll(&mut self) -> Option<Json> {
        self.0.lock().unwrap().pop_front()
    }
}

/// Sync mode: one thread for everything, requests pulled from the pump.
#[test]
fn test_sync_mode_cooperative_pump() {
    let queue = Arc::new(Mutex::new(VecDeque::new()));
    let messages = Messages::default();
    let session = DebugSession::new(
        RunMode::Sync {
            pump: Box::new(QueuePump(queue.clone())),
        },
        Box::new(messages.clone()),
    );
    let interp = Arc::new(MockInterp::default());
    session.attach_interpreter(crate::common::INTERP, interp.clone());

    let mut seq = 0;
    let mut push = |command: &str, arguments: Json| {
        seq += 1;
        queue.lock().unwrap().push_back(json!({
            "seq": seq,
            "type": "request",
            "command": command,
            "arguments": arguments,
        }));
        seq
    };

    push("initialize", json!({}));
    push("attach", json!({}));
    push("setBreakpoints", breakpoint_args("/p/a.l", &[2]));
    push("configurationDone", json!({}));
    assert!(session.update());

    let responses = messages
        .snapshot()
        .iter()
        .filter(|m| m["type"] == json!("response"))
        .count();
    assert_eq!(responses, 4);

    // Queue the resume before running: the idle loop polls the pump itself.
    let continue_seq = push("continue", json!({"threadId": 1}));

    let handle = session.handle();
    crate::common::run_program(
        &interp,
        &handle,
        crate::common::INTERP,
        &[
            Op::Call { chunk: "@/p/a.l", name: "main" },
            Op::Line(1),
            Op::Line(2),
            Op::Line(3),
            Op::Return,
        ],
    );

    assert_eq!(messages.events("stopped").len(), 1);
    let response = messages.wait_for_response(continue_seq);
    assert_eq!(response["success"], json!(true));
    assert!(session.update());
}
