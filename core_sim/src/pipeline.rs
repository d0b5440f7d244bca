use std::fmt;

use crate::{
    circular::{BufferError, CircularBuffer},
    instr::{MicroOp, MicroOpcode},
};

/// Where the instruction fetched after a branch came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Successor {
    pub location: u64,
    pub speculative: bool,
}

/// Bookkeeping for one in-flight micro-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorderEntry {
    pub opcode: MicroOpcode,
    /// address of the macro-instruction the micro-op belongs to
    pub location: u64,
    pub speculative: bool,
    /// filled in on `JMP` entries once the next instruction is decoded
    pub successor: Option<Successor>,
}

impl From<(&MicroOp, u64)> for ReorderEntry {
    fn from((op, location): (&MicroOp, u64)) -> Self {
        Self {
            opcode: op.opcode,
            location,
            speculative: op.speculative,
            successor: None,
        }
    }
}

impl fmt::Display for ReorderEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<7} @{}", self.opcode, self.location)?;
        if self.speculative {
            write!(f, " *")?;
        }
        if let Some(s) = self.successor {
            write!(
                f,
                " -> {}{}",
                s.location,
                if s.speculative { " (taken)" } else { "" }
            )?;
        }
        Ok(())
    }
}

pub type ReorderBuffer = CircularBuffer<ReorderEntry>;
pub type PipelineBuffer = CircularBuffer<MicroOp>;

/// The reorder buffer and pipeline buffer, which only ever move together.
pub struct InFlight {
    rob: ReorderBuffer,
    pipeline: PipelineBuffer,
}

impl InFlight {
    pub fn new(rob_capacity: usize, pipeline_capacity: usize) -> Self {
        Self {
            rob: ReorderBuffer::new("reorder buffer", rob_capacity),
            pipeline: PipelineBuffer::new("pipeline buffer", pipeline_capacity),
        }
    }
    pub fn free(&self) -> usize {
        self.rob.free().min(self.pipeline.free())
    }
    pub fn size(&self) -> usize {
        self.pipeline.size()
    }
    pub fn is_empty(&self) -> bool {
        self.pipeline.is_empty()
    }
    /// Appends a decoded group fetched from `location`.
    ///
    /// The youngest in-flight `JMP` learns where its successor came from.
    pub fn issue(&mut self, group: &[MicroOp], location: u64) -> Result<(), BufferError> {
        if let (Some(last), Some(first)) = (self.rob.back_mut(), group.first()) {
            if last.opcode == MicroOpcode::Jmp && last.successor.is_none() {
                last.successor = Some(Successor {
                    location,
                    speculative: first.speculative,
                });
            }
        }
        for op in group {
            self.rob.add((op, location))?;
            self.pipeline.add(op.clone())?;
        }
        Ok(())
    }
    pub fn head(&self) -> Option<(&MicroOp, &ReorderEntry)> {
        Some((self.pipeline.front()?, self.rob.front()?))
    }
    pub fn retire(&mut self) {
        self.pipeline.remove();
        self.rob.remove();
    }
    pub fn flush(&mut self) {
        self.pipeline.flush();
        self.rob.flush();
    }
    pub fn rob(&self) -> &ReorderBuffer {
        &self.rob
    }
    pub fn pipeline(&self) -> &PipelineBuffer {
        &self.pipeline
    }
}
