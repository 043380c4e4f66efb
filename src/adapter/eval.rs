//! Expression evaluation against a paused frame, plus the watch cache.
//!
//! Expressions are compiled by the facade as anonymous callables that see
//! the frame's locals and upvalues as their enclosing scope. The session
//! disarms the hook around every facade call so an expression with side
//! effects can never pause recursively.

use crate::adapter::error::Error;
use crate::adapter::stack::VarSlot;
use crate::interp::{Callable, Interpreter, Value, VarScope};
use std::collections::VecDeque;

/// Front-end context an `evaluate` request originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvalContext {
    Watch,
    #[default]
    Repl,
    Hover,
    Clipboard,
}

impl EvalContext {
    pub fn parse(s: Option<&str>) -> EvalContext {
        match s {
            Some("watch") => EvalContext::Watch,
            Some("hover") => EvalContext::Hover,
            Some("clipboard") => EvalContext::Clipboard,
            _ => EvalContext::Repl,
        }
    }
}

/// Compile `expression` with the bindings visible in the frame at `depth`.
pub fn compile_in_frame(
    interp: &dyn Interpreter,
    depth: u32,
    expression: &str,
) -> Result<Callable, Error> {
    let mut bindings = interp.frame_locals(depth);
    bindings.extend(interp.frame_upvalues(depth));
    interp
        .compile(expression, &bindings)
        .map_err(Error::EvalCompile)
}

/// Compile and run `expression` in the frame at `depth`.
///
/// A failure is always an error *value* ([`Error::EvalCompile`] or
/// [`Error::EvalRuntime`]); it never affects session state.
pub fn evaluate(interp: &dyn Interpreter, depth: u32, expression: &str) -> Result<Value, Error> {
    let callable = compile_in_frame(interp, depth, expression)?;
    interp.call(callable).map_err(Error::EvalRuntime)
}

/// Children of the container a variables reference points at.
pub fn children_of(interp: &dyn Interpreter, slot: &VarSlot) -> Vec<(String, Value)> {
    match slot.identity {
        Some(identity) => interp.expand(identity),
        None => match slot.scope {
            VarScope::Local => interp.frame_locals(slot.frame_depth),
            VarScope::Upvalue => interp.frame_upvalues(slot.frame_depth),
            VarScope::Global => interp.globals(),
            VarScope::Registry => interp.registry(),
            // Watch/Evaluated roots always carry an identity.
            VarScope::Watch | VarScope::Evaluated => Vec::new(),
        },
    }
}

#[derive(Debug)]
struct WatchEntry {
    expression: String,
    frame: i64,
    epoch: u64,
    callable: Callable,
}

/// Small LRU of compiled watch expressions.
///
/// Front-ends re-request every watch after every step; caching the compiled
/// callable per `(expression, frame, epoch)` skips the recompilation.
#[derive(Debug)]
pub struct Watches {
    entries: VecDeque<WatchEntry>,
    capacity: usize,
}

impl Default for Watches {
    fn default() -> Self {
        Watches {
            entries: VecDeque::new(),
            capacity: 32,
        }
    }
}

impl Watches {
    pub fn lookup(&mut self, expression: &str, frame: i64, epoch: u64) -> Option<Callable> {
        let idx = self.entries.iter().position(|e| {
            e.expression == expression && e.frame == frame && e.epoch == epoch
        })?;
        let entry = self.entries.remove(idx).expect("index is valid");
        let callable = entry.callable;
        self.entries.push_front(entry);
        Some(callable)
    }

    pub fn insert(&mut self, expression: String, frame: i64, epoch: u64, callable: Callable) {
        if self.entries.len() == self.capacity {
            self.entries.pop_back();
        }
        self.entries.push_front(WatchEntry {
            expression,
            frame,
            epoch,
            callable,
        });
    }
}
