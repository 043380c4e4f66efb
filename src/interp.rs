//! Interpreter facade: the seam between the adapter core and a concrete
//! embedded interpreter.
//!
//! The host implements [`Interpreter`] once per embedded instance and
//! registers it with the session. The adapter never touches interpreter
//! internals directly; everything it needs (frames, bindings, compilation,
//! value expansion) goes through this trait.

use std::fmt;

/// Identifier of an attached interpreter instance, assigned by the host.
pub type InterpId = u32;

/// Opaque handle to an expression compiled by the facade.
///
/// Produced by [`Interpreter::compile`], consumed by [`Interpreter::call`].
/// The facade owns the compiled object; the handle is only meaningful for
/// the instance that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Callable(pub u64);

/// Scope a variable lives in, from the front-end point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VarScope {
    Local,
    Upvalue,
    Global,
    Registry,
    Watch,
    Evaluated,
}

impl VarScope {
    pub fn title(&self) -> &'static str {
        match self {
            VarScope::Local => "Locals",
            VarScope::Upvalue => "Upvalues",
            VarScope::Global => "Globals",
            VarScope::Registry => "Registry",
            VarScope::Watch => "Watch",
            VarScope::Evaluated => "Evaluated",
        }
    }
}

/// A value observed through the facade.
///
/// Scalars are carried by value. Compound values (tables, arrays, userdata,
/// closures with visible state, ...) are carried as a handle: `identity` is
/// stable for the lifetime of the underlying object and backs both child
/// expansion ([`Interpreter::expand`]) and cycle detection.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Num(f64),
    Str(String),
    Compound {
        /// Interpreter-reported type name ("table", "array", ...).
        type_name: String,
        /// Object identity, stable while the object is alive.
        identity: u64,
        /// Child count hint when the facade knows it cheaply.
        len: Option<usize>,
    },
}

impl Value {
    /// Identity of the underlying object for compound values.
    pub fn identity(&self) -> Option<u64> {
        match self {
            Value::Compound { identity, .. } => Some(*identity),
            _ => None,
        }
    }

    /// Truthiness as the usual dynamic-language rule: everything except
    /// `nil` and `false` is true.
    pub fn truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn type_name(&self) -> &str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "boolean",
            Value::Int(_) | Value::Num(_) => "number",
            Value::Str(_) => "string",
            Value::Compound { type_name, .. } => type_name,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Num(n) => write!(f, "{n}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Compound {
                type_name,
                identity,
                len,
            } => match len {
                Some(len) => write!(f, "{type_name}[{len}]: 0x{identity:08x}"),
                None => write!(f, "{type_name}: 0x{identity:08x}"),
            },
        }
    }
}

/// Classification of a runtime error event, matched against the armed
/// exception filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionKind {
    Caught,
    Uncaught,
    UserUnhandled,
}

impl ExceptionKind {
    pub(crate) fn bit(&self) -> u8 {
        match self {
            ExceptionKind::Caught => 1,
            ExceptionKind::Uncaught => 2,
            ExceptionKind::UserUnhandled => 4,
        }
    }
}

/// One event fired by the interpreter hook.
#[derive(Debug, Clone, PartialEq)]
pub enum InterpEvent {
    /// A function call pushed a new activation record.
    Call,
    /// An activation record popped.
    Return,
    /// Execution reached a new source line of the innermost frame.
    Line(u32),
    /// A runtime error surfaced, classified for exception filtering.
    Error { text: String, kind: ExceptionKind },
}

/// Event classes the adapter currently wants delivered.
///
/// The facade may deliver more than requested (the hook tolerates it), but
/// honoring the mask removes the per-line callback cost while no breakpoint,
/// step or exception filter is armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventMask(u8);

impl EventMask {
    pub const EMPTY: EventMask = EventMask(0);
    pub const LINE: EventMask = EventMask(1);
    pub const CALL: EventMask = EventMask(2);
    pub const RETURN: EventMask = EventMask(4);
    pub const ERROR: EventMask = EventMask(8);

    pub const fn union(self, other: EventMask) -> EventMask {
        EventMask(self.0 | other.0)
    }

    pub fn contains(&self, other: EventMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// Position info for one activation record.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameInfo {
    /// Chunk name exactly as the interpreter reports it (`@/path/to/file`,
    /// `=stdin`, or the source text of an anonymous chunk).
    pub chunk: String,
    /// Current 1-based line.
    pub line: u32,
    /// Function-name hint when the interpreter has one.
    pub name: Option<String>,
}

/// The facade a host implements per embedded interpreter instance.
///
/// Thread discipline: frame and value accessors (`stack_depth`,
/// `frame_info`, binding enumeration, `expand`, `compile`, `call`,
/// `set_variable`) are only invoked while the interpreter is paused inside
/// the hook, i.e. on the interpreter's own thread. `executable_lines`,
/// `chunk_text` and `set_event_mask` operate on static chunk metadata and
/// may be called from the session's request thread; implementations must
/// keep them safe for that.
pub trait Interpreter: Send + Sync {
    /// Request delivery of the given event classes only.
    fn set_event_mask(&self, mask: EventMask);

    /// Number of activation records currently on the call stack.
    fn stack_depth(&self) -> u32;

    /// Info for the frame at `depth` (0 = innermost).
    fn frame_info(&self, depth: u32) -> Option<FrameInfo>;

    /// Local variables of the frame at `depth`, innermost declaration last.
    fn frame_locals(&self, depth: u32) -> Vec<(String, Value)>;

    /// Upvalues captured by the function executing at `depth`.
    fn frame_upvalues(&self, depth: u32) -> Vec<(String, Value)>;

    /// Global environment entries.
    fn globals(&self) -> Vec<(String, Value)>;

    /// Interpreter registry entries, for interpreters that expose one.
    fn registry(&self) -> Vec<(String, Value)> {
        Vec::new()
    }

    /// Children of the compound value with the given identity.
    fn expand(&self, identity: u64) -> Vec<(String, Value)>;

    /// Compile `expression` as an anonymous callable with `bindings` visible
    /// as its enclosing scope. An `Err` is the compiler's message text.
    fn compile(&self, expression: &str, bindings: &[(String, Value)]) -> Result<Callable, String>;

    /// Run a compiled callable. An `Err` is the runtime error text.
    fn call(&self, callable: Callable) -> Result<Value, String>;

    /// Assign `value` to `name` inside the container reached by walking
    /// `path` from the root of `scope` in the frame at `depth`. Returns the
    /// value actually stored (after any interpreter-side coercion).
    fn set_variable(
        &self,
        depth: u32,
        scope: VarScope,
        path: &[String],
        name: &str,
        value: Value,
    ) -> Result<Value, String>;

    /// Sorted executable lines of a source, when the interpreter can tell.
    /// `source` is the canonical source key (see the session's path
    /// conversion), not the raw chunk name. `None` means breakpoints are
    /// trusted as-given.
    fn executable_lines(&self, source: &str) -> Option<Vec<u32>> {
        let _ = source;
        None
    }

    /// Source text of a chunk, for sources without an on-disk backing.
    fn chunk_text(&self, chunk: &str) -> Option<String> {
        let _ = chunk;
        None
    }
}
