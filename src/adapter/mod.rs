//! The debug session: lifecycle state machine, stop-the-world coordination
//! between the interpreter thread(s) and the request side, and the public
//! API a host embeds.
//!
//! Thread discipline (async mode): a network thread feeds requests through
//! [`DebugSession::push_request`]; interpreter threads feed events through
//! [`SessionHandle::on_event`]. One coarse session lock serializes all
//! mutable state. While stopped, the interpreter thread blocks inside the
//! idle loop here, releasing the lock whenever it waits on the inbound
//! queue and reacquiring it per request. In sync mode nothing blocks: the
//! host pumps [`DebugSession::update`] and the idle loop polls the request
//! pump in `idle_interval` slices.

pub mod breakpoint;
pub mod error;
pub mod eval;
pub mod hook;
pub mod source;
pub mod stack;
pub mod step;

mod dispatch;

use crate::adapter::breakpoint::BreakpointStore;
use crate::adapter::dispatch::Flow;
use crate::adapter::error::Error;
use crate::adapter::eval::Watches;
use crate::adapter::hook::{HookDecision, HookEngine, StopReason};
use crate::adapter::source::{PathConvert, SourceMapRule};
use crate::adapter::stack::{StackModel, VarSlot, VarTable};
use crate::adapter::step::StepState;
use crate::dap::{DapRequest, MessageSink, Outbound};
use crate::interp::{EventMask, InterpEvent, InterpId, Interpreter, Value as InterpValue};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::Duration;

/// The single DAP thread id the adapter reports.
pub(crate) const THREAD_ID: i64 = 1;

/// Top-level session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Birth,
    Initialized,
    Running,
    StepPending,
    Stopped,
    Terminated,
}

impl State {
    pub fn name(&self) -> &'static str {
        match self {
            State::Birth => "born",
            State::Initialized => "initialized",
            State::Running => "running",
            State::StepPending => "stepping",
            State::Stopped => "stopped",
            State::Terminated => "terminated",
        }
    }
}

/// Output text encoding announced by the front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleCoding {
    #[default]
    Utf8,
    Ansi,
}

/// Options accepted in attach/launch arguments. Unknown fields (program,
/// cwd, transport settings, ...) belong to outer layers and are ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdapterConfig {
    pub source_maps: Vec<SourceMapRule>,
    pub skip_files: Vec<String>,
    pub stop_on_entry: bool,
    pub console_coding: ConsoleCoding,
    pub stack_trace_limit: u32,
    /// Exception filters armed before the first `setExceptionBreakpoints`.
    pub exception_filters: Vec<String>,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        AdapterConfig {
            source_maps: vec![],
            skip_files: vec![],
            stop_on_entry: false,
            console_coding: ConsoleCoding::default(),
            stack_trace_limit: 200,
            exception_filters: vec![],
        }
    }
}

/// Parse a DAP exception-filter list into the hot-path bitmap.
pub(crate) fn exception_mask(filters: &[String]) -> Result<u8, Error> {
    let mut mask = 0u8;
    for filter in filters {
        mask |= match filter.as_str() {
            "caught" => crate::interp::ExceptionKind::Caught.bit(),
            "uncaught" => crate::interp::ExceptionKind::Uncaught.bit(),
            "userUnhandled" => crate::interp::ExceptionKind::UserUnhandled.bit(),
            other => return Err(Error::Protocol(format!("unknown exception filter `{other}`"))),
        };
    }
    Ok(mask)
}

/// Scheduling mode, fixed at construction.
pub enum RunMode {
    /// Requests arrive from a dedicated network thread via `push_request`.
    Async,
    /// Single-threaded cooperative: the session pulls requests from the
    /// pump, which must poll its I/O non-blockingly.
    Sync { pump: Box<dyn RequestPump> },
}

/// Non-blocking request source for sync mode.
pub trait RequestPump: Send {
    /// The next fully parsed request value, if one is ready.
    fn poll(&mut self) -> Option<Value>;
}

/// Lock-free mirrors of the armed state, checked by the hook before any
/// lock is taken. This is what makes an idle line event O(1).
pub(crate) struct HookFlags {
    /// Cleared while the adapter itself calls into the interpreter, so an
    /// expression with side effects cannot pause recursively.
    allow_hook: AtomicBool,
    line_armed: AtomicBool,
    depth_armed: AtomicBool,
    error_mask: AtomicU8,
    pause: AtomicBool,
    terminated: AtomicBool,
}

impl HookFlags {
    fn new() -> HookFlags {
        HookFlags {
            allow_hook: AtomicBool::new(true),
            line_armed: AtomicBool::new(false),
            depth_armed: AtomicBool::new(false),
            error_mask: AtomicU8::new(0),
            pause: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
        }
    }

    /// Run `f` with the hook disarmed; reentrancy-safe.
    pub(crate) fn disarmed<T>(&self, f: impl FnOnce() -> T) -> T {
        let prev = self.allow_hook.swap(false, Ordering::SeqCst);
        let result = f();
        self.allow_hook.store(prev, Ordering::SeqCst);
        result
    }

    fn wants(&self, event: &InterpEvent) -> bool {
        if self.terminated.load(Ordering::SeqCst) || !self.allow_hook.load(Ordering::SeqCst) {
            return false;
        }
        if self.pause.load(Ordering::SeqCst) {
            return true;
        }
        match event {
            InterpEvent::Line(_) => self.line_armed.load(Ordering::SeqCst),
            InterpEvent::Call | InterpEvent::Return => self.depth_armed.load(Ordering::SeqCst),
            InterpEvent::Error { .. } => self.error_mask.load(Ordering::SeqCst) != 0,
        }
    }
}

/// Everything behind the coarse session lock.
pub(crate) struct SessionCore {
    pub state: State,
    pub config: AdapterConfig,
    pub convert: PathConvert,
    pub breakpoints: BreakpointStore,
    pub interps: Vec<(InterpId, Arc<dyn Interpreter>)>,
    pub hook: HookEngine,
    /// Bumped on every transition into Stopped; stamps every reference.
    pub epoch: u64,
    pub stack: Option<StackModel>,
    pub vars: VarTable,
    pub watches: Watches,
    /// Interpreter currently stopped in the hook.
    pub focus: Option<InterpId>,
    pub initialized_sent: bool,
}

impl SessionCore {
    fn interp_by_id(&self, id: InterpId) -> Option<Arc<dyn Interpreter>> {
        self.interps
            .iter()
            .find(|(interp_id, _)| *interp_id == id)
            .map(|(_, interp)| interp.clone())
    }

    pub(crate) fn focus_interp(&self) -> Result<(InterpId, Arc<dyn Interpreter>), Error> {
        let id = self.focus.ok_or(Error::NoPausedInterpreter)?;
        let interp = self.interp_by_id(id).ok_or(Error::InterpreterDetached(id))?;
        Ok((id, interp))
    }

    fn decide(
        &mut self,
        interp_id: InterpId,
        interp: &dyn Interpreter,
        event: &InterpEvent,
    ) -> HookDecision {
        self.hook
            .decide(interp_id, interp, event, &mut self.breakpoints, &mut self.convert)
    }

    /// Push the armed state down to the lock-free mirrors and the facades.
    pub(crate) fn rearm(&mut self, flags: &HookFlags) {
        let mask = self.hook.wanted_events(&self.breakpoints);
        flags
            .line_armed
            .store(mask.contains(EventMask::LINE), Ordering::SeqCst);
        flags
            .depth_armed
            .store(mask.contains(EventMask::CALL), Ordering::SeqCst);
        flags
            .error_mask
            .store(self.hook.exception_mask, Ordering::SeqCst);
        flags
            .pause
            .store(self.hook.pause_requested, Ordering::SeqCst);

        for (_, interp) in &self.interps {
            interp.set_event_mask(mask);
        }
    }

    pub(crate) fn apply_config(&mut self, config: AdapterConfig) {
        self.convert = PathConvert::new(&config.source_maps, &config.skip_files);
        self.config = config;
    }

    /// Build the paused stack snapshot if this pause does not have one yet.
    pub(crate) fn ensure_stack(&mut self, flags: &HookFlags) -> Result<(), Error> {
        if self.stack.is_some() {
            return Ok(());
        }
        let (id, interp) = self.focus_interp()?;
        let limit = self.config.stack_trace_limit;
        let model = flags.disarmed(|| {
            StackModel::capture(self.epoch, id, interp.as_ref(), &mut self.convert, limit)
        });
        self.stack = Some(model);
        Ok(())
    }

    /// Allocate a variables reference for a child value, unless the child
    /// closes a cycle on its own expansion chain.
    pub(crate) fn child_reference(
        &mut self,
        parent: &VarSlot,
        name: &str,
        value: &InterpValue,
    ) -> i64 {
        let Some(identity) = value.identity() else {
            return 0;
        };
        if parent.seen.contains(&identity) {
            return 0;
        }
        let mut path = parent.path.clone();
        path.push(name.to_string());
        let mut seen = parent.seen.clone();
        seen.push(identity);
        self.vars.alloc(VarSlot {
            epoch: parent.epoch,
            frame_depth: parent.frame_depth,
            scope: parent.scope,
            path,
            identity: Some(identity),
            seen,
        })
    }

    pub(crate) fn resume(&mut self, state: State, flags: &HookFlags) {
        self.state = state;
        self.stack = None;
        self.focus = None;
        self.rearm(flags);
    }

    pub(crate) fn terminate(&mut self, flags: &HookFlags) {
        log::info!(target: "adapter", "session terminated");
        self.state = State::Terminated;
        flags.terminated.store(true, Ordering::SeqCst);
        for (_, interp) in &self.interps {
            interp.set_event_mask(EventMask::EMPTY);
        }
    }
}

struct Shared {
    core: Mutex<SessionCore>,
    /// The outbound channel sits behind its own short-lived lock, shared by
    /// request handlers, the hook and diagnostics. Lock order is always
    /// `core` before `outbound`; nothing takes `core` while holding this.
    outbound: Mutex<Outbound>,
    inbound: Mutex<VecDeque<DapRequest>>,
    inbound_ready: Condvar,
    pump: Mutex<Option<Box<dyn RequestPump>>>,
    flags: HookFlags,
    idle_interval: Duration,
}

impl Shared {
    fn enqueue(&self, value: Value) {
        let request: DapRequest = match serde_json::from_value(value) {
            Ok(req) => req,
            Err(e) => {
                log::warn!(target: "dap", "dropping unparsable message: {e:#}");
                return;
            }
        };
        if request.r#type != "request" {
            log::warn!(target: "dap", "dropping non-request message `{}`", request.r#type);
            return;
        }
        self.inbound.lock().unwrap().push_back(request);
        self.inbound_ready.notify_all();
    }

    fn pump_poll(&self) {
        let mut pump = self.pump.lock().unwrap();
        if let Some(pump) = pump.as_mut() {
            while let Some(value) = pump.poll() {
                self.enqueue(value);
            }
        }
    }

    /// Block (bounded by `idle_interval`) until a request is available.
    fn wait_request(&self) -> Option<DapRequest> {
        self.pump_poll();
        let mut queue = self.inbound.lock().unwrap();
        if let Some(request) = queue.pop_front() {
            return Some(request);
        }
        let (mut queue, _) = self
            .inbound_ready
            .wait_timeout(queue, self.idle_interval)
            .unwrap();
        queue.pop_front()
    }

    fn pop_request(&self) -> Option<DapRequest> {
        self.inbound.lock().unwrap().pop_front()
    }
}

/// A debug session, owned by the host for as long as debugging is offered.
///
/// Cheap to clone handles into interpreter hooks and network readers come
/// from [`DebugSession::handle`]; they hold weak references, so dropping
/// the session is enough to make every callback a no-op.
pub struct DebugSession {
    shared: Arc<Shared>,
}

impl DebugSession {
    pub fn new(mode: RunMode, sink: Box<dyn MessageSink>) -> DebugSession {
        DebugSession::with_idle_interval(mode, sink, Duration::from_millis(10))
    }

    /// Like [`DebugSession::new`] with a custom upper bound on how long the
    /// stopped idle loop may block between queue checks.
    pub fn with_idle_interval(
        mode: RunMode,
        sink: Box<dyn MessageSink>,
        idle_interval: Duration,
    ) -> DebugSession {
        let pump = match mode {
            RunMode::Async => None,
            RunMode::Sync { pump } => Some(pump),
        };
        DebugSession {
            shared: Arc::new(Shared {
                core: Mutex::new(SessionCore {
                    state: State::Birth,
                    config: AdapterConfig::default(),
                    convert: PathConvert::default(),
                    breakpoints: BreakpointStore::default(),
                    interps: vec![],
                    hook: HookEngine::default(),
                    epoch: 0,
                    stack: None,
                    vars: VarTable::default(),
                    watches: Watches::default(),
                    focus: None,
                    initialized_sent: false,
                }),
                outbound: Mutex::new(Outbound::new(sink)),
                inbound: Mutex::new(VecDeque::new()),
                inbound_ready: Condvar::new(),
                pump: Mutex::new(pump),
                flags: HookFlags::new(),
                idle_interval,
            }),
        }
    }

    /// Weak handle for hooks and network readers.
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Register an interpreter instance. `id` is the host's identifier for
    /// it; events must be reported with the same id.
    pub fn attach_interpreter(&self, id: InterpId, interp: Arc<dyn Interpreter>) {
        let mut core = self.shared.core.lock().unwrap();
        core.interps.retain(|(interp_id, _)| *interp_id != id);
        core.interps.push((id, interp));
        core.rearm(&self.shared.flags);
        log::info!(target: "adapter", "interpreter {id} attached");
    }

    pub fn detach_interpreter(&self, id: InterpId) {
        let mut core = self.shared.core.lock().unwrap();
        if let Some(pos) = core.interps.iter().position(|(interp_id, _)| *interp_id == id) {
            let (_, interp) = core.interps.remove(pos);
            interp.set_event_mask(EventMask::EMPTY);
        }
        log::info!(target: "adapter", "interpreter {id} detached");
    }

    /// Feed one parsed DAP message (async mode: called from the network
    /// thread).
    pub fn push_request(&self, value: Value) {
        self.shared.enqueue(value);
        drain_requests(&self.shared);
    }

    /// Cooperative pump: poll the request source and process everything
    /// valid in the current state. Returns `false` once terminated.
    pub fn update(&self) -> bool {
        self.shared.pump_poll();
        drain_requests(&self.shared);
        !self.shared.flags.terminated.load(Ordering::SeqCst)
    }

    /// Emit an `output` event with host-provided text (stdout/stderr
    /// redirects, adapter diagnostics).
    pub fn output(&self, category: &str, bytes: &[u8]) {
        output_event(&self.shared, category, bytes);
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.flags.terminated.load(Ordering::SeqCst)
    }
}

/// Weak reference to a session, safe to stash in interpreter callbacks.
///
/// All methods no-op once the session is dropped or terminated, which is
/// what keeps a teardown-time interpreter callback harmless.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Weak<Shared>,
}

impl SessionHandle {
    /// The interpreter hook. Called by the host's per-event callback on the
    /// interpreter's own thread; blocks there while the session is stopped.
    pub fn on_event(&self, interp: InterpId, event: InterpEvent) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        if !shared.flags.wants(&event) {
            return;
        }
        process_event(&shared, interp, event);
    }

    pub fn push_request(&self, value: Value) {
        if let Some(shared) = self.shared.upgrade() {
            shared.enqueue(value);
            drain_requests(&shared);
        }
    }

    pub fn output(&self, category: &str, bytes: &[u8]) {
        if let Some(shared) = self.shared.upgrade() {
            output_event(&shared, category, bytes);
        }
    }

    /// Best-effort diagnostics channel for [`crate::log::SessionLogger`]:
    /// takes no session lock and never blocks, so it is safe to call from
    /// inside the adapter's own code paths. Returns `false` (line dropped)
    /// when the session is gone or terminated or the channel is busy.
    pub(crate) fn console(&self, text: &str) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let Ok(mut outbound) = shared.outbound.try_lock() else {
            return false;
        };
        if shared.flags.terminated.load(Ordering::SeqCst) {
            return false;
        }
        outbound.send_event(
            "output",
            Some(json!({"category": "console", "output": text})),
        );
        true
    }

    /// Host signal: the debuggee finished on its own. Emits `exited` and
    /// `terminated` and shuts the session down.
    pub fn on_exit(&self, code: i32) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut core = shared.core.lock().unwrap();
        if core.state == State::Terminated {
            return;
        }
        let mut outbound = shared.outbound.lock().unwrap();
        outbound.send_event("thread", Some(json!({"reason": "exited", "threadId": THREAD_ID})));
        outbound.send_event("exited", Some(json!({"exitCode": code})));
        core.terminate(&shared.flags);
        outbound.send_event("terminated", None);
    }
}

fn process_event(shared: &Arc<Shared>, interp_id: InterpId, event: InterpEvent) {
    let mut core = shared.core.lock().unwrap();
    if !matches!(core.state, State::Running | State::StepPending) {
        return;
    }
    let Some(interp) = core.interp_by_id(interp_id) else {
        return;
    };

    let decision = shared
        .flags
        .disarmed(|| core.decide(interp_id, interp.as_ref(), &event));

    match decision {
        HookDecision::Continue => {}
        HookDecision::Log(message) => {
            shared.outbound.lock().unwrap().send_event(
                "output",
                Some(json!({"category": "console", "output": format!("{message}\n")})),
            );
        }
        HookDecision::Stop(reason) => {
            enter_stopped(&mut core, shared, interp_id, reason);
            idle_loop(shared, core);
        }
    }
}

fn enter_stopped(
    core: &mut SessionCore,
    shared: &Shared,
    interp_id: InterpId,
    reason: StopReason,
) {
    core.epoch += 1;
    core.state = State::Stopped;
    core.focus = Some(interp_id);
    core.stack = None;
    core.hook.step = StepState::None;
    core.hook.pause_requested = false;
    core.rearm(&shared.flags);

    let mut body = json!({
        "reason": reason.as_dap(),
        "threadId": THREAD_ID,
        "allThreadsStopped": true,
    });
    if let StopReason::Exception { text } = &reason {
        body["text"] = json!(text);
        body["description"] = json!("runtime error");
    }
    shared.outbound.lock().unwrap().send_event("stopped", Some(body));
    log::debug!(
        target: "adapter",
        "stopped, reason {} (epoch {})", reason.as_dap(), core.epoch
    );
}

/// Drain requests while stopped, blocking the interpreter thread until a
/// resume or disconnect. The session lock is released for every wait on the
/// inbound queue.
fn idle_loop<'a>(shared: &'a Arc<Shared>, mut core: MutexGuard<'a, SessionCore>) {
    loop {
        drop(core);
        let request = shared.wait_request();
        core = shared.core.lock().unwrap();

        match core.state {
            State::Stopped => {}
            State::Terminated => return,
            // Nothing but dispatch below changes the state while this loop
            // owns it.
            _ => break,
        }

        let Some(request) = request else {
            continue;
        };
        match dispatch::dispatch(&mut core, &shared.flags, &shared.outbound, &request) {
            Flow::Stay => {}
            Flow::Resume => break,
            Flow::Terminate => return,
        }
    }

    // Just resumed: requests that raced the transition are served here
    // instead of waiting for the next inbound message.
    drain_requests_locked(&mut core, shared);
}

/// Process queued requests on the caller's thread while the session is not
/// stopped (the idle loop owns them otherwise).
fn drain_requests(shared: &Arc<Shared>) {
    let mut core = shared.core.lock().unwrap();
    drain_requests_locked(&mut core, shared);
}

fn drain_requests_locked(core: &mut MutexGuard<SessionCore>, shared: &Arc<Shared>) {
    loop {
        if core.state == State::Stopped {
            return;
        }
        let Some(request) = shared.pop_request() else {
            return;
        };
        if core.state == State::Terminated {
            log::debug!(target: "dap", "dropping `{}` after termination", request.command);
            continue;
        }
        // Resume/Terminate control flow only matters to the idle loop; the
        // state checks above cover it here.
        let _ = dispatch::dispatch(core, &shared.flags, &shared.outbound, &request);
    }
}

fn output_event(shared: &Arc<Shared>, category: &str, bytes: &[u8]) {
    let coding = {
        let core = shared.core.lock().unwrap();
        if core.state == State::Terminated {
            return;
        }
        core.config.console_coding
    };
    let text = match coding {
        ConsoleCoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
        // Single-byte ANSI code page, widened byte-per-char.
        ConsoleCoding::Ansi => bytes.iter().map(|&b| b as char).collect(),
    };
    shared
        .outbound
        .lock()
        .unwrap()
        .send_event("output", Some(json!({"category": category, "output": text})));
}
