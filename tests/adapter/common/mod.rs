//! Test harness: a scripted mock interpreter behind the facade plus a
//! request/expect driver over an in-memory message sink.

use scriptdap::adapter::{DebugSession, RunMode, SessionHandle};
use scriptdap::dap::MessageSink;
use scriptdap::interp::{
    Callable, EventMask, ExceptionKind, FrameInfo, InterpEvent, InterpId, Interpreter, Value,
    VarScope,
};
use serde_json::{Value as Json, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const INTERP: InterpId = 1;
const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Collects every outbound message for inspection.
#[derive(Clone, Default)]
pub struct Messages(Arc<Mutex<Vec<Json>>>);

impl MessageSink for Messages {
    fn send(&mut self, message: &Json) -> anyhow::Result<()> {
        self.0.lock().unwrap().push(message.clone());
        Ok(())
    }
}

impl Messages {
    pub fn snapshot(&self) -> Vec<Json> {
        self.0.lock().unwrap().clone()
    }

    pub fn wait_for_response(&self, request_seq: i64) -> Json {
        self.wait(|m| {
            m.get("type").and_then(Json::as_str) == Some("response")
                && m.get("request_seq").and_then(Json::as_i64) == Some(request_seq)
        })
    }

    /// Wait for the `skip + 1`-th event with the given name.
    pub fn wait_for_event_nth(&self, name: &str, skip: usize) -> Json {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        loop {
            let found = self
                .snapshot()
                .into_iter()
                .filter(|m| {
                    m.get("type").and_then(Json::as_str) == Some("event")
                        && m.get("event").and_then(Json::as_str) == Some(name)
                })
                .nth(skip);
            if let Some(event) = found {
                return event;
            }
            if Instant::now() > deadline {
                panic!("timed out waiting for event `{name}`: {:#?}", self.snapshot());
            }
            thread::sleep(Duration::from_millis(2));
        }
    }

    pub fn wait_for_event(&self, name: &str) -> Json {
        self.wait_for_event_nth(name, 0)
    }

    pub fn events(&self, name: &str) -> Vec<Json> {
        self.snapshot()
            .into_iter()
            .filter(|m| {
                m.get("type").and_then(Json::as_str) == Some("event")
                    && m.get("event").and_then(Json::as_str) == Some(name)
            })
            .collect()
    }

    fn wait(&self, pred: impl Fn(&Json) -> bool) -> Json {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        loop {
            if let Some(found) = self.snapshot().into_iter().find(|m| pred(m)) {
                return found;
            }
            if Instant::now() > deadline {
                panic!("timed out waiting for message: {:#?}", self.snapshot());
            }
            thread::sleep(Duration::from_millis(2));
        }
    }
}

#[derive(Debug, Clone)]
struct MockFrame {
    chunk: String,
    name: String,
    line: u32,
    locals: Vec<(String, Value)>,
}

#[derive(Debug, Default)]
struct MockState {
    /// Last entry is the innermost frame.
    frames: Vec<MockFrame>,
    globals: Vec<(String, Value)>,
    /// Compound identity -> children.
    objects: HashMap<u64, Vec<(String, Value)>>,
    /// Compiled expressions: callable id indexes here.
    compiled: Vec<(String, Vec<(String, Value)>)>,
    executable_lines: HashMap<String, Vec<u32>>,
    chunk_texts: HashMap<String, String>,
}

/// Scripted interpreter: tests drive it with [`Op`] programs; the adapter
/// observes it through the facade while paused.
#[derive(Default)]
pub struct MockInterp {
    state: Mutex<MockState>,
    pub compile_calls: AtomicUsize,
}

impl MockInterp {
    pub fn with_globals(globals: Vec<(&str, Value)>) -> MockInterp {
        let interp = MockInterp::default();
        interp.state.lock().unwrap().globals = globals
            .into_iter()
            .map(|(n, v)| (n.to_string(), v))
            .collect();
        interp
    }

    pub fn add_object(&self, identity: u64, children: Vec<(&str, Value)>) {
        self.state.lock().unwrap().objects.insert(
            identity,
            children
                .into_iter()
                .map(|(n, v)| (n.to_string(), v))
                .collect(),
        );
    }

    pub fn set_executable_lines(&self, source: &str, lines: Vec<u32>) {
        self.state
            .lock()
            .unwrap()
            .executable_lines
            .insert(source.to_string(), lines);
    }

    pub fn set_chunk_text(&self, chunk: &str, text: &str) {
        self.state
            .lock()
            .unwrap()
            .chunk_texts
            .insert(chunk.to_string(), text.to_string());
    }

    fn frame_at(state: &MockState, depth: u32) -> Option<&MockFrame> {
        let idx = state.frames.len().checked_sub(1 + depth as usize)?;
        state.frames.get(idx)
    }
}

fn eval_atom(expr: &str, bindings: &[(String, Value)], globals: &[(String, Value)]) -> Result<Value, String> {
    let expr = expr.trim();
    if let Ok(int) = expr.parse::<i64>() {
        return Ok(Value::Int(int));
    }
    if let Some(quoted) = expr.strip_prefix('"').and_then(|r| r.strip_suffix('"')) {
        return Ok(Value::Str(quoted.to_string()));
    }
    if expr.is_empty() || !expr.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return Err(format!("syntax error near `{expr}`"));
    }
    let lookup = |table: &[(String, Value)]| {
        table
            .iter()
            .rev()
            .find(|(name, _)| name == expr)
            .map(|(_, value)| value.clone())
    };
    Ok(lookup(bindings).or_else(|| lookup(globals)).unwrap_or(Value::Nil))
}

fn eval_expr(
    expr: &str,
    bindings: &[(String, Value)],
    globals: &[(String, Value)],
) -> Result<Value, String> {
    let expr = expr.trim();
    if expr == "err()" {
        return Err("explicit runtime error".to_string());
    }
    for op in ["==", ">", "<"] {
        if let Some((lhs, rhs)) = expr.split_once(op) {
            let lhs = eval_atom(lhs, bindings, globals)?;
            let rhs = eval_atom(rhs, bindings, globals)?;
            return match (op, &lhs, &rhs) {
                ("==", _, _) => Ok(Value::Bool(lhs == rhs)),
                (">", Value::Int(l), Value::Int(r)) => Ok(Value::Bool(l > r)),
                ("<", Value::Int(l), Value::Int(r)) => Ok(Value::Bool(l < r)),
                _ => Err(format!("cannot compare {lhs:?} and {rhs:?}")),
            };
        }
    }
    eval_atom(expr, bindings, globals)
}

impl Interpreter for MockInterp {
    fn set_event_mask(&self, _: EventMask) {}

    fn stack_depth(&self) -> u32 {
        self.state.lock().unwrap().frames.len() as u32
    }

    fn frame_info(&self, depth: u32) -> Option<FrameInfo> {
        let state = self.state.lock().unwrap();
        MockInterp::frame_at(&state, depth).map(|frame| FrameInfo {
            chunk: frame.chunk.clone(),
            line: frame.line,
            name: Some(frame.name.clone()),
        })
    }

    fn frame_locals(&self, depth: u32) -> Vec<(String, Value)> {
        let state = self.state.lock().unwrap();
        MockInterp::frame_at(&state, depth)
            .map(|frame| frame.locals.clone())
            .unwrap_or_default()
    }

    fn frame_upvalues(&self, _: u32) -> Vec<(String, Value)> {
        Vec::new()
    }

    fn globals(&self) -> Vec<(String, Value)> {
        self.state.lock().unwrap().globals.clone()
    }

    fn expand(&self, identity: u64) -> Vec<(String, Value)> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(&identity)
            .cloned()
            .unwrap_or_default()
    }

    fn compile(&self, expression: &str, bindings: &[(String, Value)]) -> Result<Callable, String> {
        self.compile_calls.fetch_add(1, Ordering::SeqCst);
        let ok = expression == "err()"
            || expression
                .chars()
                .all(|c| c.is_alphanumeric() || " _=<>()+\"".contains(c));
        if expression.trim().is_empty() || !ok {
            return Err(format!("syntax error near `{expression}`"));
        }
        let mut state = self.state.lock().unwrap();
        state.compiled.push((expression.to_string(), bindings.to_vec()));
        Ok(Callable(state.compiled.len() as u64 - 1))
    }

    fn call(&self, callable: Callable) -> Result<Value, String> {
        let (expr, bindings, globals) = {
            let state = self.state.lock().unwrap();
            let (expr, bindings) = state
                .compiled
                .get(callable.0 as usize)
                .cloned()
                .ok_or("stale callable")?;
            (expr, bindings, state.globals.clone())
        };
        eval_expr(&expr, &bindings, &globals)
    }

    fn set_variable(
        &self,
        depth: u32,
        scope: VarScope,
        path: &[String],
        name: &str,
        value: Value,
    ) -> Result<Value, String> {
        let mut state = self.state.lock().unwrap();
        let assign = |entries: &mut Vec<(String, Value)>| {
            match entries.iter_mut().find(|(n, _)| n == name) {
                Some((_, slot)) => *slot = value.clone(),
                None => entries.push((name.to_string(), value.clone())),
            }
            Ok(value.clone())
        };

        if let Some(first) = path.first() {
            // Walk the compound chain from the scope root.
            let root = match scope {
                VarScope::Local => {
                    let idx = state.frames.len() - 1 - depth as usize;
                    state.frames[idx]
                        .locals
                        .iter()
                        .find(|(n, _)| n == first)
                        .map(|(_, v)| v.clone())
                }
                VarScope::Global => state
                    .globals
                    .iter()
                    .find(|(n, _)| n == first)
                    .map(|(_, v)| v.clone()),
                _ => None,
            };
            let mut identity = root
                .and_then(|v| v.identity())
                .ok_or_else(|| format!("`{first}` is not a container"))?;
            for step in &path[1..] {
                identity = state
                    .objects
                    .get(&identity)
                    .and_then(|children| children.iter().find(|(n, _)| n == step))
                    .and_then(|(_, v)| v.identity())
                    .ok_or_else(|| format!("`{step}` is not a container"))?;
            }
            let children = state
                .objects
                .get_mut(&identity)
                .ok_or("container disappeared")?;
            return assign(children);
        }

        match scope {
            VarScope::Local => {
                let idx = state.frames.len() - 1 - depth as usize;
                assign(&mut state.frames[idx].locals)
            }
            VarScope::Global => assign(&mut state.globals),
            other => Err(format!("cannot assign in scope {other:?}")),
        }
    }

    fn executable_lines(&self, source: &str) -> Option<Vec<u32>> {
        self.state.lock().unwrap().executable_lines.get(source).cloned()
    }

    fn chunk_text(&self, chunk: &str) -> Option<String> {
        self.state.lock().unwrap().chunk_texts.get(chunk).cloned()
    }
}

/// One step of a scripted program.
#[derive(Debug, Clone)]
pub enum Op {
    /// Push an activation record and fire a Call event.
    Call { chunk: &'static str, name: &'static str },
    /// Move the innermost frame to a line and fire a Line event.
    Line(u32),
    /// Set a local in the innermost frame, no event.
    Local(&'static str, Value),
    /// Fire a Return event and pop the innermost frame.
    Return,
    /// Fire an Error event.
    Error(&'static str, ExceptionKind),
}

/// Run a scripted program against the session hook. Blocks at every stop,
/// exactly like a real interpreter thread.
pub fn run_program(interp: &MockInterp, handle: &SessionHandle, id: InterpId, ops: &[Op]) {
    for op in ops {
        match op {
            Op::Call { chunk, name } => {
                interp.state.lock().unwrap().frames.push(MockFrame {
                    chunk: chunk.to_string(),
                    name: name.to_string(),
                    line: 0,
                    locals: vec![],
                });
                handle.on_event(id, InterpEvent::Call);
            }
            Op::Line(line) => {
                if let Some(frame) = interp.state.lock().unwrap().frames.last_mut() {
                    frame.line = *line;
                }
                handle.on_event(id, InterpEvent::Line(*line));
            }
            Op::Local(name, value) => {
                if let Some(frame) = interp.state.lock().unwrap().frames.last_mut() {
                    match frame.locals.iter_mut().find(|(n, _)| n == name) {
                        Some((_, slot)) => *slot = value.clone(),
                        None => frame.locals.push((name.to_string(), value.clone())),
                    }
                }
            }
            Op::Return => {
                handle.on_event(id, InterpEvent::Return);
                interp.state.lock().unwrap().frames.pop();
            }
            Op::Error(text, kind) => {
                handle.on_event(
                    id,
                    InterpEvent::Error {
                        text: text.to_string(),
                        kind: *kind,
                    },
                );
            }
        }
    }
}

/// A session wired to a mock interpreter and an in-memory sink.
pub struct TestSession {
    pub session: DebugSession,
    pub messages: Messages,
    pub interp: Arc<MockInterp>,
    next_seq: i64,
}

impl TestSession {
    pub fn start() -> TestSession {
        TestSession::with_interp(MockInterp::default())
    }

    pub fn with_interp(interp: MockInterp) -> TestSession {
        static LOGS: Once = Once::new();
        LOGS.call_once(|| {
            let logger = env_logger::Builder::from_default_env().build();
            let filter = logger.filter();
            scriptdap::log::install(logger, filter);
        });

        let messages = Messages::default();
        let session = DebugSession::new(RunMode::Async, Box::new(messages.clone()));
        let interp = Arc::new(interp);
        session.attach_interpreter(INTERP, interp.clone());
        TestSession {
            session,
            messages,
            interp,
            next_seq: 0,
        }
    }

    /// Send a request and wait for its response.
    pub fn request(&mut self, command: &str, arguments: Json) -> Json {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.session.push_request(json!({
            "seq": seq,
            "type": "request",
            "command": command,
            "arguments": arguments,
        }));
        self.messages.wait_for_response(seq)
    }

    /// initialize + attach (with the given arguments) + configurationDone.
    pub fn bring_up(&mut self, attach_args: Json) {
        let response = self.request("initialize", json!({"adapterID": "scriptdap"}));
        assert_eq!(response["success"], json!(true));

        let response = self.request("attach", attach_args);
        assert_eq!(response["success"], json!(true));
        self.messages.wait_for_event("initialized");

        let response = self.request("configurationDone", json!({}));
        assert_eq!(response["success"], json!(true));
    }

    /// Spawn the scripted program on its own "interpreter thread".
    pub fn spawn_program(&self, ops: Vec<Op>) -> JoinHandle<()> {
        let interp = self.interp.clone();
        let handle = self.session.handle();
        thread::spawn(move || run_program(&interp, &handle, INTERP, &ops))
    }
}

/// Error id carried in a failed response body.
pub fn error_id(response: &Json) -> i64 {
    response["body"]["error"]["id"].as_i64().unwrap_or_default()
}
