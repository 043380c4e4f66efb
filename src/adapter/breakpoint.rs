//! Breakpoint store: per-source sets with conditions, hit conditions and
//! log messages, plus the allocation-free line lookup used on every hook
//! event.

use crate::adapter::error::Error;
use crate::adapter::source::SourceKey;
use indexmap::IndexMap;
use serde::Deserialize;
use std::str::FromStr;

/// One breakpoint line as requested by the front-end.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceBreakpoint {
    pub line: u32,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub hit_condition: Option<String>,
    #[serde(default)]
    pub log_message: Option<String>,
}

/// Hit-condition mini-grammar: a comparison against the number of times the
/// breakpoint's condition held. `N` is shorthand for `==N`; `%N` holds on
/// every N-th hit. Anything else is a protocol error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitCondition {
    Eq(u32),
    Gt(u32),
    Ge(u32),
    Lt(u32),
    Le(u32),
    Every(u32),
}

impl HitCondition {
    pub fn satisfied(&self, hits: u32) -> bool {
        match *self {
            HitCondition::Eq(n) => hits == n,
            HitCondition::Gt(n) => hits > n,
            HitCondition::Ge(n) => hits >= n,
            HitCondition::Lt(n) => hits < n,
            HitCondition::Le(n) => hits <= n,
            HitCondition::Every(n) => n != 0 && hits % n == 0,
        }
    }
}

impl FromStr for HitCondition {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let s = s.trim();
        let (ctor, rest): (fn(u32) -> HitCondition, &str) = if let Some(r) = s.strip_prefix("==") {
            (HitCondition::Eq, r)
        } else if let Some(r) = s.strip_prefix(">=") {
            (HitCondition::Ge, r)
        } else if let Some(r) = s.strip_prefix("<=") {
            (HitCondition::Le, r)
        } else if let Some(r) = s.strip_prefix('>') {
            (HitCondition::Gt, r)
        } else if let Some(r) = s.strip_prefix('<') {
            (HitCondition::Lt, r)
        } else if let Some(r) = s.strip_prefix('%') {
            (HitCondition::Every, r)
        } else {
            (HitCondition::Eq, s)
        };

        rest.trim()
            .parse::<u32>()
            .map(ctor)
            .map_err(|_| Error::Protocol(format!("unsupported hit condition `{s}`")))
    }
}

/// A verified breakpoint at rest in the store.
#[derive(Debug, Clone)]
pub struct Breakpoint {
    /// Line the breakpoint actually sits on (post verification snap).
    pub line: u32,
    /// Line the front-end asked for.
    pub requested_line: u32,
    pub condition: Option<String>,
    pub hit_condition: Option<HitCondition>,
    pub log_message: Option<String>,
    pub verified: bool,
    /// Number of times the condition held (or the line was hit, for
    /// unconditional breakpoints).
    pub hits: u32,
}

#[derive(Debug, Default)]
struct SourceSet {
    by_line: IndexMap<u32, Breakpoint>,
    /// Sorted copy of the keys for the hot-path binary search.
    lines: Vec<u32>,
}

/// All breakpoints of the session, keyed by canonical source.
#[derive(Debug, Default)]
pub struct BreakpointStore {
    sources: IndexMap<SourceKey, SourceSet>,
    total: usize,
}

impl BreakpointStore {
    /// Atomically replace every breakpoint of `source`.
    ///
    /// `executable_lines`, when known, drives verification: a requested line
    /// snaps to the nearest following executable line, or stays unverified
    /// if there is none. Two requests snapping to one line collapse; the
    /// later request wins. Returns the stored set in request order.
    pub fn set(
        &mut self,
        source: SourceKey,
        requested: Vec<SourceBreakpoint>,
        executable_lines: Option<&[u32]>,
    ) -> Result<Vec<Breakpoint>, Error> {
        let mut set = SourceSet::default();
        let mut result = Vec::with_capacity(requested.len());

        for req in requested {
            let hit_condition = req
                .hit_condition
                .as_deref()
                .map(HitCondition::from_str)
                .transpose()?;

            let (line, verified) = match executable_lines {
                Some(lines) => match lines[lines.partition_point(|&l| l < req.line)..].first() {
                    Some(&snapped) => (snapped, true),
                    None => (req.line, false),
                },
                None => (req.line, true),
            };

            let brkpt = Breakpoint {
                line,
                requested_line: req.line,
                condition: req.condition,
                hit_condition,
                log_message: req.log_message,
                verified,
                hits: 0,
            };
            result.push(brkpt.clone());
            set.by_line.insert(line, brkpt);
        }

        set.lines = set.by_line.keys().copied().collect();
        set.lines.sort_unstable();

        self.total -= self.sources.get(&source).map_or(0, |s| s.by_line.len());
        self.total += set.by_line.len();
        self.sources.insert(source, set);
        Ok(result)
    }

    /// Hot path: the breakpoint sitting on `(source, line)`, if any.
    /// No allocation.
    pub fn query(&self, source: &SourceKey, line: u32) -> Option<&Breakpoint> {
        let set = self.sources.get(source)?;
        set.lines.binary_search(&line).ok()?;
        set.by_line.get(&line)
    }

    /// Count one condition-true event and report whether the hit condition
    /// is satisfied at the new count.
    pub fn register_hit(&mut self, source: &SourceKey, line: u32) -> bool {
        let Some(brkpt) = self
            .sources
            .get_mut(source)
            .and_then(|set| set.by_line.get_mut(&line))
        else {
            return false;
        };
        brkpt.hits += 1;
        match brkpt.hit_condition {
            Some(cond) => cond.satisfied(brkpt.hits),
            None => true,
        }
    }

    pub fn has_any(&self) -> bool {
        self.total != 0
    }
}

/// Expand a log-point template: `{expr}` segments are evaluated through
/// `eval`, `{{`/`}}` escape literal braces.
pub fn format_log_message(
    template: &str,
    mut eval: impl FnMut(&str) -> Result<String, Error>,
) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    loop {
        let Some(open) = rest.find(['{', '}']) else {
            out.push_str(rest);
            return out;
        };
        out.push_str(&rest[..open]);
        let tail = &rest[open..];

        if let Some(r) = tail.strip_prefix("{{") {
            out.push('{');
            rest = r;
        } else if let Some(r) = tail.strip_prefix("}}") {
            out.push('}');
            rest = r;
        } else if tail.starts_with('}') {
            // Unbalanced close, keep it literal.
            out.push('}');
            rest = &tail[1..];
        } else {
            match tail[1..].find('}') {
                Some(close) => {
                    let expr = &tail[1..1 + close];
                    match eval(expr) {
                        Ok(rendered) => out.push_str(&rendered),
                        Err(e) => out.push_str(&format!("{{{expr}: {e}}}")),
                    }
                    rest = &tail[close + 2..];
                }
                None => {
                    out.push_str(tail);
                    return out;
                }
            }
        }
    }
}
