//! Logging plumbing for a library that lives inside someone else's process.
//!
//! The crate logs through the `log` facade with targets `adapter` and
//! `dap`. Because the host owns the global logger registration, [`install`]
//! registers one forwarding logger the first time it is called and after
//! that only swaps the sink behind it, so hosts and tests can re-route
//! diagnostics at any point. [`SessionLogger`] is the sink a DAP host
//! usually wants: records become `output` events on the session's wire.

use crate::adapter::SessionHandle;
use log::{LevelFilter, Log, Metadata, Record};
use std::fmt::Write as _;
use std::sync::RwLock;

static SINK: RwLock<Option<Box<dyn Log>>> = RwLock::new(None);

struct ForwardingLogger;

static FORWARDER: ForwardingLogger = ForwardingLogger;

impl Log for ForwardingLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        match &*SINK.read().unwrap() {
            Some(sink) => sink.enabled(metadata),
            None => false,
        }
    }

    fn log(&self, record: &Record) {
        if let Some(sink) = &*SINK.read().unwrap() {
            sink.log(record);
        }
    }

    fn flush(&self) {
        if let Some(sink) = &*SINK.read().unwrap() {
            sink.flush();
        }
    }
}

/// Install (or replace) the sink receiving the crate's diagnostics and
/// reset the global maximum log level.
///
/// Until the first call everything is swallowed. If the host already
/// registered its own global logger, the swap is a no-op for routing (the
/// host's logger keeps receiving the records) but the level still applies.
pub fn install<L: Log + 'static>(logger: L, level_filter: LevelFilter) {
    *SINK.write().unwrap() = Some(Box::new(logger));
    log::set_max_level(level_filter);
    // First call registers the forwarder; later calls only swapped the sink.
    let _ = log::set_logger(&FORWARDER);
}

/// Sink that surfaces adapter diagnostics to the debugger front-end as DAP
/// `output` events (category `console`).
///
/// `inner` decides which records are enabled and catches the ones the
/// session cannot take: before attach, after termination, or while the
/// outbound channel is busy with the very record being reported.
pub struct SessionLogger<L> {
    session: SessionHandle,
    inner: L,
}

impl<L: Log> SessionLogger<L> {
    pub fn new(session: SessionHandle, inner: L) -> SessionLogger<L> {
        SessionLogger { session, inner }
    }
}

impl<L: Log> Log for SessionLogger<L> {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if !self.inner.enabled(record.metadata()) {
            return;
        }

        let mut line = String::new();
        let _ = write!(line, "[{}] ", record.level());
        if let Some(module) = record.module_path() {
            let _ = write!(line, "{module} ");
        }
        let _ = writeln!(line, "{}", record.args());

        if !self.session.console(&line) {
            self.inner.log(record);
        }
    }

    fn flush(&self) {
        self.inner.flush()
    }
}
