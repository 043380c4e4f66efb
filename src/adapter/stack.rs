//! Paused stack snapshot and the epoch-tagged variable reference table.
//!
//! Everything a front-end can point at while paused (frames, scopes,
//! expandable values) is issued from here, and everything is stamped with
//! the pause epoch so a reference surviving a resume fails loudly instead
//! of reading the wrong state.

use crate::adapter::error::Error;
use crate::adapter::source::{PathConvert, ResolvedSource};
use crate::interp::{InterpId, Interpreter, VarScope};

/// Dense frame identifier, valid within one pause epoch.
///
/// The DAP `frameId` packs the epoch with the frame index so a stale id
/// from an earlier pause can be told apart from a current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRef {
    pub epoch: u64,
    pub index: u16,
}

impl FrameRef {
    pub fn pack(self) -> i64 {
        ((self.epoch << 16) | self.index as u64) as i64
    }

    pub fn unpack(raw: i64) -> FrameRef {
        let raw = raw as u64;
        FrameRef {
            epoch: raw >> 16,
            index: (raw & 0xFFFF) as u16,
        }
    }
}

/// One captured activation record.
#[derive(Debug, Clone)]
pub struct Frame {
    /// 0 = innermost.
    pub depth: u32,
    pub source: ResolvedSource,
    pub line: u32,
    pub name: String,
    /// Source was matched by a skip-files glob; presented subdued.
    pub skipped: bool,
}

/// Snapshot of the paused interpreter's call stack.
///
/// Built lazily on the first `stackTrace` of a pause and dropped on resume.
#[derive(Debug)]
pub struct StackModel {
    pub epoch: u64,
    pub interp: InterpId,
    pub frames: Vec<Frame>,
    /// Frames beyond the configured limit were elided.
    pub truncated: bool,
}

impl StackModel {
    /// Walk the facade's frames innermost outward, resolving chunk names
    /// through the path table, stopping at `limit` frames.
    pub fn capture(
        epoch: u64,
        interp_id: InterpId,
        interp: &dyn Interpreter,
        convert: &mut PathConvert,
        limit: u32,
    ) -> StackModel {
        let depth = interp.stack_depth();
        let captured = depth.min(limit);

        let mut frames = Vec::with_capacity(captured as usize);
        for d in 0..captured {
            let Some(info) = interp.frame_info(d) else {
                break;
            };
            let source = convert.resolve_chunk(&info.chunk);
            let skipped = convert.is_skipped(&source.key);
            frames.push(Frame {
                depth: d,
                source,
                line: info.line,
                name: info.name.unwrap_or_else(|| "?".to_string()),
                skipped,
            });
        }

        StackModel {
            epoch,
            interp: interp_id,
            frames,
            truncated: depth > captured,
        }
    }

    pub fn frame(&self, frame_ref: FrameRef) -> Result<&Frame, Error> {
        if frame_ref.epoch != self.epoch {
            return Err(Error::StaleReference(frame_ref.pack()));
        }
        self.frames
            .get(frame_ref.index as usize)
            .ok_or(Error::FrameNotFound(frame_ref.pack()))
    }

    pub fn frame_ref(&self, index: usize) -> FrameRef {
        FrameRef {
            epoch: self.epoch,
            index: index as u16,
        }
    }
}

/// Where a variables reference points: a scope root or an expandable value
/// reached from one.
#[derive(Debug, Clone)]
pub struct VarSlot {
    pub epoch: u64,
    pub frame_depth: u32,
    pub scope: VarScope,
    /// Names walked from the scope root down to this container.
    pub path: Vec<String>,
    /// Identity of the compound value to expand; `None` for scope roots.
    pub identity: Option<u64>,
    /// Identities on the expansion chain from the root, cycle guard: a
    /// child whose identity already appears here is not expandable again.
    pub seen: Vec<u64>,
}

/// Append-only table of issued variable references.
///
/// References are monotonic and never reused; a lookup whose slot belongs
/// to an earlier epoch is a [`Error::StaleReference`].
#[derive(Debug, Default)]
pub struct VarTable {
    slots: Vec<VarSlot>,
}

/// DAP reserves 0 for "not expandable"; start above it.
const FIRST_VAR_REF: i64 = 1;

impl VarTable {
    pub fn alloc(&mut self, slot: VarSlot) -> i64 {
        self.slots.push(slot);
        self.slots.len() as i64 - 1 + FIRST_VAR_REF
    }

    pub fn get(&self, reference: i64, current_epoch: u64) -> Result<&VarSlot, Error> {
        let slot = usize::try_from(reference - FIRST_VAR_REF)
            .ok()
            .and_then(|idx| self.slots.get(idx))
            .ok_or(Error::ReferenceNotFound(reference))?;
        if slot.epoch != current_epoch {
            return Err(Error::StaleReference(reference));
        }
        Ok(slot)
    }
}
