use crate::interp::InterpId;

/// Every fault that can cross the DAP boundary.
///
/// Each variant carries a stable numeric code (see [`Error::code`]) so
/// front-ends can match on error identity rather than message text.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- request faults --------------------------------------------
    #[error("malformed request: {0}")]
    Protocol(String),
    #[error("command `{command}` is not valid while {state}")]
    State {
        command: String,
        state: &'static str,
    },
    #[error("command `{0}` is not supported")]
    NotSupported(String),
    #[error("no interpreter is paused")]
    NoPausedInterpreter,

    // --------------------------------- reference faults ------------------------------------------
    #[error("stale reference: {0} belongs to an earlier pause")]
    StaleReference(i64),
    #[error("unknown variables reference {0}")]
    ReferenceNotFound(i64),
    #[error("frame {0} not found")]
    FrameNotFound(i64),

    // --------------------------------- evaluation faults -----------------------------------------
    #[error("compile error: {0}")]
    EvalCompile(String),
    #[error("evaluation error: {0}")]
    EvalRuntime(String),

    // --------------------------------- interpreter faults ----------------------------------------
    #[error("interpreter {0} is not attached")]
    InterpreterDetached(InterpId),

    // --------------------------------- decoding faults -------------------------------------------
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Stable DAP error code for this kind of fault.
    pub fn code(&self) -> i64 {
        match self {
            Error::Protocol(_) | Error::Json(_) => 1000,
            Error::State { .. } | Error::NoPausedInterpreter => 1001,
            Error::StaleReference(_) | Error::ReferenceNotFound(_) | Error::FrameNotFound(_) => {
                1002
            }
            Error::EvalCompile(_) => 1003,
            Error::EvalRuntime(_) => 1004,
            Error::InterpreterDetached(_) => 1005,
            Error::NotSupported(_) => 1006,
        }
    }

    /// Named field missing or of the wrong shape in a request.
    pub fn missing_field(field: &str) -> Error {
        Error::Protocol(format!("missing or malformed field `{field}`"))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "adapter", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "adapter", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and puts the error into debug logs if
/// it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}
