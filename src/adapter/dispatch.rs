//! Request routing: two static tables keyed by DAP command name.
//!
//! The main table serves a running session; the hook table serves a stopped
//! one and is a strict superset. A known command looked up in the wrong
//! table is a state error; an unknown command is `NotSupported`. Handlers
//! are pure functions of `(session core, request)` producing a response
//! body plus an optional control-flow effect for the caller's loop.

use crate::adapter::breakpoint::SourceBreakpoint;
use crate::adapter::error::Error;
use crate::adapter::eval::{self, EvalContext};
use crate::adapter::stack::{FrameRef, VarSlot, VarTable};
use crate::adapter::{AdapterConfig, HookFlags, SessionCore, State, THREAD_ID, exception_mask};
use crate::dap::{DapRequest, Outbound};
use crate::interp::{Value as InterpValue, VarScope};
use itertools::Itertools;
use once_cell::sync::Lazy;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Mutex;

/// What the processing loop should do after a handled request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Stay,
    /// Leave the idle loop and let the interpreter run.
    Resume,
    /// Session is terminated; stop processing entirely.
    Terminate,
}

type OutEvent = (&'static str, Option<Value>);

pub(crate) struct Outcome {
    pub body: Option<Value>,
    pub flow: Flow,
    /// Events emitted before the response (e.g. breakpoint verification).
    pub before: Vec<OutEvent>,
    /// Events emitted after the response (e.g. `initialized`).
    pub after: Vec<OutEvent>,
}

impl Outcome {
    fn stay(body: Option<Value>) -> Outcome {
        Outcome {
            body,
            flow: Flow::Stay,
            before: vec![],
            after: vec![],
        }
    }

    fn resume(body: Option<Value>) -> Outcome {
        Outcome {
            body,
            flow: Flow::Resume,
            before: vec![],
            after: vec![(
                "continued",
                Some(json!({"threadId": THREAD_ID, "allThreadsContinued": true})),
            )],
        }
    }
}

type HandlerFn = fn(&mut SessionCore, &HookFlags, &DapRequest) -> Result<Outcome, Error>;

/// Handlers are partitioned by the session state they are valid in.
enum Handler {
    /// Valid always (listed in both tables).
    Main(HandlerFn),
    /// Valid only while stopped (hook table only).
    Hook(HandlerFn),
}

impl Handler {
    fn callable(&self) -> HandlerFn {
        match self {
            Handler::Main(f) | Handler::Hook(f) => *f,
        }
    }
}

static MAIN_TABLE: Lazy<HashMap<&'static str, Handler>> = Lazy::new(|| {
    HashMap::from([
        ("initialize", Handler::Main(initialize)),
        ("attach", Handler::Main(attach_or_launch)),
        ("launch", Handler::Main(attach_or_launch)),
        ("configurationDone", Handler::Main(configuration_done)),
        ("setBreakpoints", Handler::Main(set_breakpoints)),
        ("setExceptionBreakpoints", Handler::Main(set_exception_breakpoints)),
        ("threads", Handler::Main(threads)),
        ("pause", Handler::Main(pause)),
        ("disconnect", Handler::Main(disconnect)),
    ])
});

static HOOK_TABLE: Lazy<HashMap<&'static str, Handler>> = Lazy::new(|| {
    HashMap::from([
        ("initialize", Handler::Main(initialize)),
        ("attach", Handler::Main(attach_or_launch)),
        ("launch", Handler::Main(attach_or_launch)),
        ("configurationDone", Handler::Main(configuration_done)),
        ("setBreakpoints", Handler::Main(set_breakpoints)),
        ("setExceptionBreakpoints", Handler::Main(set_exception_breakpoints)),
        ("threads", Handler::Main(threads)),
        ("pause", Handler::Main(pause)),
        ("disconnect", Handler::Main(disconnect)),
        ("source", Handler::Hook(source)),
        ("stackTrace", Handler::Hook(stack_trace)),
        ("scopes", Handler::Hook(scopes)),
        ("variables", Handler::Hook(variables)),
        ("setVariable", Handler::Hook(set_variable)),
        ("evaluate", Handler::Hook(evaluate)),
        ("continue", Handler::Hook(resume_continue)),
        ("next", Handler::Hook(step_over)),
        ("stepIn", Handler::Hook(step_in)),
        ("stepOut", Handler::Hook(step_out)),
    ])
});

/// Route one request through the table matching the current state, emit the
/// response (and any surrounding events) and report the control-flow effect.
pub(crate) fn dispatch(
    core: &mut SessionCore,
    flags: &HookFlags,
    outbound: &Mutex<Outbound>,
    req: &DapRequest,
) -> Flow {
    log::debug!(target: "dap", "{} {}", req.seq, req.command);

    let stopped = core.state == State::Stopped;
    let (table, other) = if stopped {
        (&*HOOK_TABLE, &*MAIN_TABLE)
    } else {
        (&*MAIN_TABLE, &*HOOK_TABLE)
    };

    let Some(handler) = table.get(req.command.as_str()) else {
        let error = if other.contains_key(req.command.as_str()) {
            Error::State {
                command: req.command.clone(),
                state: core.state.name(),
            }
        } else {
            Error::NotSupported(req.command.clone())
        };
        outbound.lock().unwrap().respond_error(req, &error);
        return Flow::Stay;
    };

    match handler.callable()(core, flags, req) {
        Ok(outcome) => {
            let mut outbound = outbound.lock().unwrap();
            for (event, body) in outcome.before {
                outbound.send_event(event, body);
            }
            outbound.respond_success(req, outcome.body);
            for (event, body) in outcome.after {
                outbound.send_event(event, body);
            }
            outcome.flow
        }
        Err(e) => {
            outbound.lock().unwrap().respond_error(req, &e);
            Flow::Stay
        }
    }
}

// --------------------------------- main table -------------------------------------------------

fn initialize(core: &mut SessionCore, _: &HookFlags, req: &DapRequest) -> Result<Outcome, Error> {
    if core.state != State::Birth {
        return Err(Error::State {
            command: req.command.clone(),
            state: core.state.name(),
        });
    }
    core.state = State::Initialized;
    log::info!(target: "adapter", "initialize, adapter version {}", crate::version::VERSION);

    Ok(Outcome::stay(Some(json!({
        "supportsConfigurationDoneRequest": true,
        "supportsConditionalBreakpoints": true,
        "supportsHitConditionalBreakpoints": true,
        "supportsLogPoints": true,
        "supportsSetVariable": true,
        "supportsEvaluateForHovers": true,
        "supportsExceptionFilterOptions": false,
        "exceptionBreakpointFilters": [
            {"filter": "caught", "label": "Caught errors", "default": false},
            {"filter": "uncaught", "label": "Uncaught errors", "default": true},
            {"filter": "userUnhandled", "label": "User-unhandled errors", "default": false},
        ],
    }))))
}

fn attach_or_launch(
    core: &mut SessionCore,
    flags: &HookFlags,
    req: &DapRequest,
) -> Result<Outcome, Error> {
    if core.state != State::Initialized {
        return Err(Error::State {
            command: req.command.clone(),
            state: core.state.name(),
        });
    }

    let config: AdapterConfig = req.parse_args()?;
    core.hook.exception_mask = exception_mask(&config.exception_filters)?;
    core.apply_config(config);
    core.rearm(flags);

    log::info!(target: "adapter", "{} accepted", req.command);

    let mut outcome = Outcome::stay(None);
    if !core.initialized_sent {
        core.initialized_sent = true;
        outcome.after.push(("initialized", None));
    }
    Ok(outcome)
}

fn configuration_done(
    core: &mut SessionCore,
    flags: &HookFlags,
    req: &DapRequest,
) -> Result<Outcome, Error> {
    if core.state != State::Initialized || !core.initialized_sent {
        return Err(Error::State {
            command: req.command.clone(),
            state: core.state.name(),
        });
    }

    core.state = State::Running;
    if core.config.stop_on_entry {
        core.hook.entry_armed = true;
    }
    core.rearm(flags);

    log::info!(target: "adapter", "configuration done, session running");
    Ok(Outcome {
        body: None,
        flow: Flow::Stay,
        before: vec![],
        after: vec![(
            "thread",
            Some(json!({"reason": "started", "threadId": THREAD_ID})),
        )],
    })
}

fn set_breakpoints(
    core: &mut SessionCore,
    flags: &HookFlags,
    req: &DapRequest,
) -> Result<Outcome, Error> {
    #[derive(Deserialize)]
    struct Args {
        source: SourceArg,
        #[serde(default)]
        breakpoints: Vec<SourceBreakpoint>,
    }
    #[derive(Deserialize)]
    struct SourceArg {
        path: Option<String>,
        #[serde(rename = "sourceReference")]
        source_reference: Option<i64>,
    }

    let args: Args = req.parse_args()?;

    let (key, client_source) = match (&args.source.path, args.source.source_reference) {
        (Some(path), _) => (
            core.convert.client_to_server(path),
            json!({"path": path}),
        ),
        (None, Some(reference)) => {
            let chunk = core
                .convert
                .chunk_by_reference(reference)
                .ok_or(Error::ReferenceNotFound(reference))?
                .to_string();
            let resolved = core.convert.resolve_chunk(&chunk);
            (
                resolved.key,
                json!({"sourceReference": reference}),
            )
        }
        (None, None) => return Err(Error::missing_field("source.path")),
    };

    // Verification needs executable-line info; the first facade that knows
    // the chunk wins.
    let executable_lines = core
        .interps
        .iter()
        .find_map(|(_, interp)| interp.executable_lines(key.as_str()));

    let stored = core
        .breakpoints
        .set(key, args.breakpoints, executable_lines.as_deref())?;
    core.rearm(flags);

    // Adjusted or rejected lines are announced before the response.
    let before = stored
        .iter()
        .filter(|b| !b.verified || b.line != b.requested_line)
        .map(|brkpt| {
            let body = json!({
                "reason": "changed",
                "breakpoint": {
                    "verified": brkpt.verified,
                    "line": brkpt.line,
                    "source": &client_source,
                },
            });
            ("breakpoint", Some(body))
        })
        .collect_vec();

    let breakpoints = stored
        .iter()
        .map(|b| {
            json!({
                "verified": b.verified,
                "line": b.line,
                "source": &client_source,
            })
        })
        .collect_vec();
    Ok(Outcome {
        body: Some(json!({ "breakpoints": breakpoints })),
        flow: Flow::Stay,
        before,
        after: vec![],
    })
}

fn set_exception_breakpoints(
    core: &mut SessionCore,
    flags: &HookFlags,
    req: &DapRequest,
) -> Result<Outcome, Error> {
    #[derive(Deserialize)]
    struct Args {
        filters: Vec<String>,
    }

    let args: Args = req.parse_args()?;
    core.hook.exception_mask = exception_mask(&args.filters)?;
    core.rearm(flags);
    Ok(Outcome::stay(None))
}

fn threads(_: &mut SessionCore, _: &HookFlags, _: &DapRequest) -> Result<Outcome, Error> {
    Ok(Outcome::stay(Some(json!({
        "threads": [{"id": THREAD_ID, "name": "main"}],
    }))))
}

fn source(core: &mut SessionCore, _: &HookFlags, req: &DapRequest) -> Result<Outcome, Error> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Args {
        source_reference: i64,
    }

    let args: Args = req.parse_args()?;
    let chunk = core
        .convert
        .chunk_by_reference(args.source_reference)
        .ok_or(Error::ReferenceNotFound(args.source_reference))?
        .to_string();

    // Any attached facade may know the chunk; first answer wins.
    let content = core
        .interps
        .iter()
        .find_map(|(_, interp)| interp.chunk_text(&chunk));
    // A `=name` chunk has no text unless the facade kept it; fall back to
    // the raw chunk body for anonymous code chunks.
    let content = content.unwrap_or_else(|| chunk.strip_prefix('=').unwrap_or(&chunk).to_string());

    Ok(Outcome::stay(Some(json!({"content": content}))))
}

fn pause(core: &mut SessionCore, flags: &HookFlags, req: &DapRequest) -> Result<Outcome, Error> {
    if !matches!(core.state, State::Running | State::StepPending) {
        return Err(Error::State {
            command: req.command.clone(),
            state: core.state.name(),
        });
    }
    core.hook.pause_requested = true;
    core.rearm(flags);
    Ok(Outcome::stay(None))
}

fn disconnect(core: &mut SessionCore, flags: &HookFlags, _: &DapRequest) -> Result<Outcome, Error> {
    core.terminate(flags);
    Ok(Outcome {
        body: None,
        flow: Flow::Terminate,
        before: vec![],
        after: vec![("terminated", None)],
    })
}

// --------------------------------- hook table -------------------------------------------------

fn stack_trace(core: &mut SessionCore, flags: &HookFlags, req: &DapRequest) -> Result<Outcome, Error> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Args {
        #[allow(unused)]
        thread_id: Option<i64>,
        #[serde(default)]
        start_frame: Option<usize>,
        #[serde(default)]
        levels: Option<usize>,
    }

    let args: Args = req.parse_args()?;
    core.ensure_stack(flags)?;
    let model = core.stack.as_ref().expect("built above");

    let start = args.start_frame.unwrap_or(0);
    let levels = match args.levels {
        Some(0) | None => usize::MAX,
        Some(n) => n,
    };

    let mut frames = model
        .frames
        .iter()
        .enumerate()
        .skip(start)
        .take(levels)
        .map(|(idx, frame)| {
            // On-disk sources go out as client paths; synthetic sources are
            // fetched by reference instead.
            let source = match frame.source.source_reference {
                Some(reference) => json!({
                    "name": frame.source.key.as_str(),
                    "sourceReference": reference,
                }),
                None => json!({
                    "path": core.convert.server_to_client(&frame.source.key),
                    "sourceReference": 0,
                }),
            };
            let mut rendered = json!({
                "id": model.frame_ref(idx).pack(),
                "name": frame.name,
                "line": frame.line,
                "column": 1,
                "source": source,
            });
            if frame.skipped {
                rendered["presentationHint"] = json!("subtle");
            }
            rendered
        })
        .collect_vec();

    if model.truncated && start + frames.len() == model.frames.len() {
        frames.push(json!({
            "id": 0,
            "name": "(more frames available)",
            "line": 0,
            "column": 0,
            "presentationHint": "label",
        }));
    }

    let total = model.frames.len() + usize::from(model.truncated);
    Ok(Outcome::stay(Some(json!({
        "stackFrames": frames,
        "totalFrames": total,
    }))))
}

fn scopes(core: &mut SessionCore, flags: &HookFlags, req: &DapRequest) -> Result<Outcome, Error> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Args {
        frame_id: i64,
    }

    let args: Args = req.parse_args()?;
    core.ensure_stack(flags)?;

    let frame_ref = FrameRef::unpack(args.frame_id);
    let model = core.stack.as_ref().expect("built above");
    let depth = model.frame(frame_ref)?.depth;
    let epoch = core.epoch;

    let scope_entry = |vars: &mut VarTable, scope: VarScope, expensive: bool| {
        let reference = vars.alloc(VarSlot {
            epoch,
            frame_depth: depth,
            scope,
            path: vec![],
            identity: None,
            seen: vec![],
        });
        json!({
            "name": scope.title(),
            "variablesReference": reference,
            "expensive": expensive,
        })
    };

    let scopes = vec![
        scope_entry(&mut core.vars, VarScope::Local, false),
        scope_entry(&mut core.vars, VarScope::Upvalue, false),
        scope_entry(&mut core.vars, VarScope::Global, true),
        scope_entry(&mut core.vars, VarScope::Registry, true),
    ];
    Ok(Outcome::stay(Some(json!({ "scopes": scopes }))))
}

fn variables(core: &mut SessionCore, flags: &HookFlags, req: &DapRequest) -> Result<Outcome, Error> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Args {
        variables_reference: i64,
        #[serde(default)]
        start: Option<usize>,
        #[serde(default)]
        count: Option<usize>,
    }

    let args: Args = req.parse_args()?;
    let slot = core.vars.get(args.variables_reference, core.epoch)?.clone();
    let (_, interp) = core.focus_interp()?;

    let children = flags.disarmed(|| eval::children_of(interp.as_ref(), &slot));

    let start = args.start.unwrap_or(0);
    let count = match args.count {
        Some(0) | None => usize::MAX,
        Some(n) => n,
    };

    let rendered = children
        .into_iter()
        .skip(start)
        .take(count)
        .map(|(name, value)| {
            let reference = core.child_reference(&slot, &name, &value);
            render_variable(&name, &value, reference)
        })
        .collect_vec();

    Ok(Outcome::stay(Some(json!({ "variables": rendered }))))
}

fn set_variable(core: &mut SessionCore, flags: &HookFlags, req: &DapRequest) -> Result<Outcome, Error> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Args {
        variables_reference: i64,
        name: String,
        value: String,
    }

    let args: Args = req.parse_args()?;
    let slot = core.vars.get(args.variables_reference, core.epoch)?.clone();
    let (_, interp) = core.focus_interp()?;

    let stored = flags.disarmed(|| -> Result<InterpValue, Error> {
        let value = eval::evaluate(interp.as_ref(), slot.frame_depth, &args.value)
            .map_err(|e| match e {
                // An unparseable value expression is a compile error for the
                // front-end whichever stage it died in.
                Error::EvalRuntime(msg) => Error::EvalCompile(msg),
                other => other,
            })?;
        interp
            .set_variable(slot.frame_depth, slot.scope, &slot.path, &args.name, value)
            .map_err(Error::EvalRuntime)
    })?;

    let reference = core.child_reference(&slot, &args.name, &stored);
    Ok(Outcome::stay(Some(json!({
        "value": stored.to_string(),
        "type": stored.type_name(),
        "variablesReference": reference,
    }))))
}

fn evaluate(core: &mut SessionCore, flags: &HookFlags, req: &DapRequest) -> Result<Outcome, Error> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Args {
        expression: String,
        #[serde(default)]
        frame_id: Option<i64>,
        #[serde(default)]
        context: Option<String>,
    }

    let args: Args = req.parse_args()?;
    let context = EvalContext::parse(args.context.as_deref());

    let (depth, frame_key) = match args.frame_id {
        Some(raw) => {
            core.ensure_stack(flags)?;
            let model = core.stack.as_ref().expect("built above");
            (model.frame(FrameRef::unpack(raw))?.depth, raw)
        }
        None => (0, -1),
    };
    let epoch = core.epoch;
    let (_, interp) = core.focus_interp()?;

    let value = flags.disarmed(|| -> Result<InterpValue, Error> {
        // Watches are re-requested after every step; reuse the compiled
        // callable within one pause.
        if context == EvalContext::Watch
            && let Some(callable) = core.watches.lookup(&args.expression, frame_key, epoch)
        {
            return interp.call(callable).map_err(Error::EvalRuntime);
        }

        let callable = eval::compile_in_frame(interp.as_ref(), depth, &args.expression)?;
        if context == EvalContext::Watch {
            core.watches
                .insert(args.expression.clone(), frame_key, epoch, callable);
        }
        interp.call(callable).map_err(Error::EvalRuntime)
    })?;

    let scope = if context == EvalContext::Watch {
        VarScope::Watch
    } else {
        VarScope::Evaluated
    };
    let reference = match value.identity() {
        Some(identity) => core.vars.alloc(VarSlot {
            epoch,
            frame_depth: depth,
            scope,
            path: vec![],
            identity: Some(identity),
            seen: vec![identity],
        }),
        None => 0,
    };

    Ok(Outcome::stay(Some(json!({
        "result": value.to_string(),
        "type": value.type_name(),
        "variablesReference": reference,
    }))))
}

fn resume_continue(core: &mut SessionCore, flags: &HookFlags, _: &DapRequest) -> Result<Outcome, Error> {
    core.resume(State::Running, flags);
    Ok(Outcome::resume(Some(json!({"allThreadsContinued": true}))))
}

fn step_over(core: &mut SessionCore, flags: &HookFlags, _: &DapRequest) -> Result<Outcome, Error> {
    let (id, _) = core.focus_interp()?;
    core.hook.step = crate::adapter::step::StepState::step_over(id);
    core.resume(State::StepPending, flags);
    Ok(Outcome::resume(None))
}

fn step_in(core: &mut SessionCore, flags: &HookFlags, _: &DapRequest) -> Result<Outcome, Error> {
    let (id, _) = core.focus_interp()?;
    core.hook.step = crate::adapter::step::StepState::step_in(id);
    core.resume(State::StepPending, flags);
    Ok(Outcome::resume(None))
}

fn step_out(core: &mut SessionCore, flags: &HookFlags, _: &DapRequest) -> Result<Outcome, Error> {
    let (id, _) = core.focus_interp()?;
    core.hook.step = crate::adapter::step::StepState::step_out(id);
    core.resume(State::StepPending, flags);
    Ok(Outcome::resume(None))
}

fn render_variable(name: &str, value: &InterpValue, reference: i64) -> Value {
    let mut rendered = json!({
        "name": name,
        "value": value.to_string(),
        "type": value.type_name(),
        "variablesReference": reference,
    });
    if let InterpValue::Compound { len: Some(len), .. } = value {
        rendered["namedVariables"] = json!(len);
    }
    rendered
}
