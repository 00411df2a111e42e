//! The units of code a [crate::Session] emits.

use crate::{
    asm::Asm,
    codebuf::{CodeBuffer, TrackerKind},
    emulator::MemAccessEmulator,
    errors::EmulationError,
    insn::Insn,
    patch::{DeferredPatch, PatchSite},
    point::{PointId, Trace},
    reg::Reg,
    session::EmitCtx,
    translator::SharedTranslator,
};
use std::{fmt, sync::Arc};

pub enum Unit {
    Emulated(MemAccessEmulator),
    Translator(Arc<SharedTranslator>),
    Insn(RelocatedInsn),
    TranslatorCall(TranslatorCall),
}

impl Unit {
    pub fn generate(
        &mut self,
        ctx: &mut EmitCtx<'_>,
        buf: &mut CodeBuffer,
        trace: &Trace,
    ) -> Result<(), EmulationError> {
        match self {
            Unit::Emulated(x) => x.generate(ctx, buf, trace),
            Unit::Translator(x) => x.generate(ctx, buf, trace),
            Unit::Insn(x) => x.generate(ctx, buf, trace),
            Unit::TranslatorCall(x) => x.generate(ctx, buf, trace),
        }
    }

    /// The original address this unit replaces, if any.
    pub fn addr(&self) -> Option<usize> {
        match self {
            Unit::Emulated(x) => Some(x.addr()),
            Unit::Insn(x) => Some(x.insn.addr()),
            Unit::Translator(_) | Unit::TranslatorCall(_) => None,
        }
    }

    /// The number of original bytes this unit replaces.
    pub fn size(&self) -> usize {
        match self {
            Unit::Emulated(x) => x.size(),
            Unit::Insn(x) => x.insn.len(),
            Unit::Translator(_) | Unit::TranslatorCall(_) => 0,
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unit::Emulated(x) => write!(f, "{x}"),
            Unit::Translator(x) => write!(f, "{x}"),
            Unit::Insn(x) => write!(f, "insn({:?})", x.insn),
            Unit::TranslatorCall(x) => write!(f, "call translator({}) at {}", x.reg, x.point),
        }
    }
}

/// An instruction moved without emulation. IP-relative operands are re-encoded for the new
/// address.
pub struct RelocatedInsn {
    insn: Insn,
}

impl RelocatedInsn {
    pub fn new(insn: Insn) -> Self {
        Self { insn }
    }

    fn generate(
        &self,
        ctx: &mut EmitCtx<'_>,
        buf: &mut CodeBuffer,
        trace: &Trace,
    ) -> Result<(), EmulationError> {
        let mut asm = Asm::new(buf.next_addr(), ctx.log_asm());
        if self.insn.is_ip_relative() {
            asm.push_inst(Ok(*self.insn.inst()))?;
        } else {
            asm.push_bytes(self.insn.bytes());
        }
        let kind = TrackerKind::Insn {
            orig: self.insn.addr(),
        };
        ctx.commit(buf, asm, Vec::new(), kind, trace)?;
        Ok(())
    }
}

/// A bare call to the translator for `reg`, resolved at finalization. The surrounding code is
/// responsible for the stack alignment and register saves the translator expects.
pub struct TranslatorCall {
    reg: Reg,
    point: PointId,
}

impl TranslatorCall {
    pub fn new(reg: Reg, point: PointId) -> Self {
        Self { reg, point }
    }

    fn generate(
        &self,
        ctx: &mut EmitCtx<'_>,
        buf: &mut CodeBuffer,
        trace: &Trace,
    ) -> Result<(), EmulationError> {
        ctx.translator(self.reg)?;
        let mut asm = Asm::new(buf.next_addr(), ctx.log_asm());
        let site = PatchSite {
            reg: self.reg,
            point: self.point,
            off: asm.off().as_usize(),
        };
        asm.push_nops(DeferredPatch::estimate());
        let kind = TrackerKind::TranslatorCall {
            reg: self.reg,
            point: self.point,
        };
        ctx.commit(buf, asm, vec![site], kind, trace)?;
        Ok(())
    }
}
