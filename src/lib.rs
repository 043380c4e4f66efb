//! scriptdap - the execution-control core of a DAP debug adapter for
//! embedded scripting interpreters.
//!
//! A host process that embeds one or more interpreter instances creates a
//! [`adapter::DebugSession`], registers each interpreter behind the
//! [`interp::Interpreter`] facade and forwards interpreter events into the
//! session through a [`adapter::SessionHandle`]. The session translates DAP
//! requests (breakpoints, stepping, stack/variable inspection, expression
//! evaluation) into precise control of interpreter execution, and interpreter
//! events back into DAP events.
//!
//! DAP framing is a collaborator concern: the session consumes parsed request
//! values and emits response/event values. [`dap::transport`] ships a
//! Content-Length codec for hosts that want the batteries included.

pub mod adapter;
pub mod dap;
pub mod interp;
pub mod log;

pub mod version {
    /// Adapter version reported in `initialize` responses.
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}
