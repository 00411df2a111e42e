//! Where code is being emitted: instrumentation points and the traces containing them.

use crate::reg::RegSet;
use std::fmt;

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PointId(pub u32);

impl fmt::Display for PointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// An instrumentation point: the location of one original instruction, together with liveness
/// information computed by the surrounding rewriter.
#[derive(Clone, Debug)]
pub struct InstPoint {
    pub id: PointId,
    pub addr: usize,
    /// Registers live immediately after the instruction.
    pub live_regs: RegSet,
    /// Flags (as [iced_x86::RflagsBits]) live immediately after the instruction.
    pub live_flags: u32,
}

impl InstPoint {
    pub fn new(id: u32, addr: usize, live_regs: RegSet, live_flags: u32) -> Self {
        Self {
            id: PointId(id),
            addr,
            live_regs,
            live_flags,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct TraceId(pub u64);

/// The code region a unit belongs to.
#[derive(Clone, Debug)]
pub struct Trace {
    pub id: TraceId,
    /// The containing function, if known.
    pub func: Option<String>,
}

impl Trace {
    pub fn new(id: u64, func: Option<String>) -> Self {
        Self {
            id: TraceId(id),
            func,
        }
    }

    /// The pseudo-trace shared translators placed at finalization are attributed to.
    pub fn outlined() -> Self {
        Self {
            id: TraceId(u64::MAX),
            func: None,
        }
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.id == Trace::outlined().id {
            return write!(f, "outlined");
        }
        write!(f, "t{}", self.id.0)?;
        if let Some(func) = &self.func {
            write!(f, " in {func}")?;
        }
        Ok(())
    }
}
