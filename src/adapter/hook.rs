//! The per-event decision engine: continue, emit a log point, or stop.
//!
//! This is the hot path. The session prefilters events through lock-free
//! flags before anything here runs, so with no breakpoints, no pending step,
//! no armed exception filter and no pause request a line event costs two
//! atomic loads and returns.

use crate::adapter::breakpoint::{BreakpointStore, format_log_message};
use crate::adapter::error::Error;
use crate::adapter::eval;
use crate::adapter::source::{PathConvert, SourceKey};
use crate::adapter::step::StepState;
use crate::interp::{EventMask, InterpEvent, InterpId, Interpreter};

/// Why the session stopped; becomes the `reason` of the `stopped` event.
#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    Entry,
    Breakpoint,
    Step,
    Pause,
    Exception { text: String },
}

impl StopReason {
    pub fn as_dap(&self) -> &'static str {
        match self {
            StopReason::Entry => "entry",
            StopReason::Breakpoint => "breakpoint",
            StopReason::Step => "step",
            StopReason::Pause => "pause",
            StopReason::Exception { .. } => "exception",
        }
    }
}

/// Outcome of one hook event.
#[derive(Debug, PartialEq)]
pub enum HookDecision {
    Continue,
    /// A log point fired: emit the rendered message, do not stop.
    Log(String),
    Stop(StopReason),
}

/// Mutable stop-decision state: pending step, armed exception filters and
/// the one-shot pause/entry flags.
#[derive(Debug, Default)]
pub struct HookEngine {
    pub step: StepState,
    pub exception_mask: u8,
    pub pause_requested: bool,
    pub entry_armed: bool,
}

impl HookEngine {
    /// Event classes worth delivering given the current armed state.
    pub fn wanted_events(&self, breakpoints: &BreakpointStore) -> EventMask {
        let mut mask = EventMask::EMPTY;
        if breakpoints.has_any()
            || self.step.is_pending()
            || self.entry_armed
            || self.pause_requested
        {
            mask = mask.union(EventMask::LINE);
        }
        if self.step.is_pending() {
            mask = mask.union(EventMask::CALL).union(EventMask::RETURN);
        }
        if self.exception_mask != 0 {
            mask = mask.union(EventMask::ERROR);
        }
        mask
    }

    /// Decide what to do with one interpreter event.
    ///
    /// `interp` is the facade of the instance that fired the event; frame 0
    /// is the frame the event happened in. Condition and log-point
    /// expressions run here, against that frame; the caller has already
    /// disarmed the hook for the duration.
    pub fn decide(
        &mut self,
        interp_id: InterpId,
        interp: &dyn Interpreter,
        event: &InterpEvent,
        breakpoints: &mut BreakpointStore,
        convert: &mut PathConvert,
    ) -> HookDecision {
        match event {
            InterpEvent::Call => {
                self.step.on_call(interp_id);
                self.take_pause()
            }
            InterpEvent::Return => {
                self.step.on_return(interp_id);
                self.take_pause()
            }
            InterpEvent::Error { text, kind } => {
                if self.exception_mask & kind.bit() != 0 {
                    return HookDecision::Stop(StopReason::Exception { text: text.clone() });
                }
                self.take_pause()
            }
            InterpEvent::Line(line) => self.decide_line(interp_id, interp, *line, breakpoints, convert),
        }
    }

    fn decide_line(
        &mut self,
        interp_id: InterpId,
        interp: &dyn Interpreter,
        line: u32,
        breakpoints: &mut BreakpointStore,
        convert: &mut PathConvert,
    ) -> HookDecision {
        let source = interp
            .frame_info(0)
            .map(|info| convert.resolve_chunk(&info.chunk));

        let in_skipped = source
            .as_ref()
            .is_some_and(|source| convert.is_skipped(&source.key));

        if let Some(source) = &source
            && !in_skipped
            && breakpoints.query(&source.key, line).is_some()
        {
            let armed = self.breakpoint_armed(interp, &source.key, line, breakpoints);
            match armed {
                BreakpointHit::Stop => return HookDecision::Stop(StopReason::Breakpoint),
                BreakpointHit::Log(message) => return HookDecision::Log(message),
                BreakpointHit::Pass => {}
            }
        }

        if !in_skipped && self.step.stops_at_line(interp_id) {
            self.step = StepState::None;
            return HookDecision::Stop(StopReason::Step);
        }

        if !in_skipped && self.entry_armed {
            self.entry_armed = false;
            return HookDecision::Stop(StopReason::Entry);
        }

        self.take_pause()
    }

    fn breakpoint_armed(
        &mut self,
        interp: &dyn Interpreter,
        source: &SourceKey,
        line: u32,
        breakpoints: &mut BreakpointStore,
    ) -> BreakpointHit {
        let brkpt = breakpoints.query(source, line).expect("checked by caller");

        if let Some(condition) = brkpt.condition.clone() {
            let truthy = match eval::evaluate(interp, 0, &condition) {
                Ok(value) => value.truthy(),
                // A broken condition must not silently disarm the
                // breakpoint; surface it by stopping.
                Err(e) => {
                    log::warn!(target: "adapter", "breakpoint condition `{condition}`: {e:#}");
                    true
                }
            };
            if !truthy {
                return BreakpointHit::Pass;
            }
        }

        if !breakpoints.register_hit(source, line) {
            return BreakpointHit::Pass;
        }

        let log_message = breakpoints
            .query(source, line)
            .and_then(|b| b.log_message.clone());
        match log_message {
            Some(template) => {
                let rendered = format_log_message(&template, |expr| {
                    eval::evaluate(interp, 0, expr)
                        .map(|v| v.to_string())
                        .map_err(|e| Error::EvalRuntime(e.to_string()))
                });
                BreakpointHit::Log(rendered)
            }
            None => BreakpointHit::Stop,
        }
    }

    fn take_pause(&mut self) -> HookDecision {
        if self.pause_requested {
            self.pause_requested = false;
            HookDecision::Stop(StopReason::Pause)
        } else {
            HookDecision::Continue
        }
    }
}

enum BreakpointHit {
    Stop,
    Log(String),
    Pass,
}
