//! Step-in/over/out state across call depth transitions.
//!
//! The controller anchors on the interpreter that was paused when the step
//! was requested and tracks the depth *delta* from that anchor through
//! Call/Return events; the absolute depth never needs to be consulted on
//! the hot path. Events from any other interpreter leave the state
//! untouched, so foreign interpreters behave as if simply running.

use crate::interp::InterpId;

/// Pending step operation, or `None` while not stepping.
///
/// Encoded as a tagged variant so "step kind without an anchor" is
/// unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepState {
    #[default]
    None,
    /// Stop at the next line event in any frame of the anchor interpreter.
    In { interp: InterpId },
    /// Stop at the next line event at or above the anchor frame.
    Over { interp: InterpId, delta: i32 },
    /// Stop at the next line event above the anchor frame.
    Out { interp: InterpId, delta: i32 },
}

impl StepState {
    pub fn step_in(interp: InterpId) -> StepState {
        StepState::In { interp }
    }

    pub fn step_over(interp: InterpId) -> StepState {
        StepState::Over { interp, delta: 0 }
    }

    pub fn step_out(interp: InterpId) -> StepState {
        StepState::Out { interp, delta: 0 }
    }

    pub fn is_pending(&self) -> bool {
        !matches!(self, StepState::None)
    }

    /// Depth accounting on a Call event.
    pub fn on_call(&mut self, interp: InterpId) {
        match self {
            StepState::Over { interp: anchor, delta } | StepState::Out { interp: anchor, delta }
                if *anchor == interp =>
            {
                *delta += 1;
            }
            _ => {}
        }
    }

    /// Depth accounting on a Return event.
    pub fn on_return(&mut self, interp: InterpId) {
        match self {
            StepState::Over { interp: anchor, delta } | StepState::Out { interp: anchor, delta }
                if *anchor == interp =>
            {
                *delta -= 1;
            }
            _ => {}
        }
    }

    /// Does a line event in `interp` complete the step?
    pub fn stops_at_line(&self, interp: InterpId) -> bool {
        match *self {
            StepState::None => false,
            StepState::In { interp: anchor } => anchor == interp,
            StepState::Over { interp: anchor, delta } => anchor == interp && delta <= 0,
            StepState::Out { interp: anchor, delta } => anchor == interp && delta < 0,
        }
    }
}
