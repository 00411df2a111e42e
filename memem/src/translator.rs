//! Shared translators: one small out-of-line routine per effective-address register, which
//! passes the address to the runtime translation routine and puts the result back in the same
//! register. Every emulator redirecting through a given register calls the same translator.

use crate::{
    asm::Asm,
    codebuf::{CodeBuffer, TrackerKind},
    errors::EmulationError,
    point::Trace,
    reg::{Reg, ALLOC_ORDER},
    save::move_register,
    session::EmitCtx,
};
use iced_x86::{Code, Instruction as Op, Register};
use std::{collections::HashMap, fmt, sync::Arc};

#[derive(Debug)]
pub struct SharedTranslator {
    reg: Reg,
}

impl SharedTranslator {
    fn new(reg: Reg) -> Self {
        Self { reg }
    }

    pub fn reg(&self) -> Reg {
        self.reg
    }

    pub fn tracker(&self) -> TrackerKind {
        TrackerKind::Translator { reg: self.reg }
    }

    /// Place this translator in `buf`. A translator is placed at most once per buffer: if it's
    /// already there this does nothing.
    ///
    /// Callers arrive via a `call` from a 16 byte aligned stack, so on entry `rsp` is 8 bytes off
    /// alignment. The translator realigns before calling the runtime, and may clobber the flags
    /// and any register in the translation ABI's clobber set other than its own.
    pub fn generate(
        &self,
        ctx: &mut EmitCtx<'_>,
        buf: &mut CodeBuffer,
        trace: &Trace,
    ) -> Result<(), EmulationError> {
        if buf.translator_addr(self.reg).is_some() {
            return Ok(());
        }
        let abi = &ctx.cfg().abi;
        let target = ctx.translator_addr()?;
        let mut asm = Asm::new(buf.next_addr(), ctx.log_asm());
        asm.log(format!("translator {}", self.reg));
        asm.push_inst(Op::with2(Code::Sub_rm64_imm8, Register::RSP, 8i32))?;
        move_register(&mut asm, self.reg, abi.arg)?;
        asm.push_inst(Op::with2(
            Code::Mov_r64_imm64,
            abi.scratch.to_reg64(),
            target as u64,
        ))?;
        asm.push_inst(Op::with1(Code::Call_rm64, abi.scratch.to_reg64()))?;
        move_register(&mut asm, abi.ret, self.reg)?;
        self.generate_return(&mut asm)?;
        ctx.commit(buf, asm, Vec::new(), self.tracker(), trace)?;
        Ok(())
    }

    fn generate_return(&self, asm: &mut Asm) -> Result<(), EmulationError> {
        asm.push_inst(Op::with2(Code::Add_rm64_imm8, Register::RSP, 8i32))?;
        asm.push_inst(Ok(Op::with(Code::Retnq)))
    }
}

impl fmt::Display for SharedTranslator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "translator({})", self.reg)
    }
}

/// Something which hands out the [SharedTranslator] for a register.
pub trait TranslatorSource {
    fn translator(&mut self, reg: Reg) -> Result<Arc<SharedTranslator>, EmulationError>;
}

/// Translators keyed by register, created on first request. Single-threaded: to share
/// translators between threads, [TranslatorCache::freeze] the cache.
#[derive(Default)]
pub struct TranslatorCache {
    translators: HashMap<Reg, Arc<SharedTranslator>>,
}

impl TranslatorCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a translator for every register an emulator could use for its effective address.
    pub fn init_all(&mut self) {
        for r in ALLOC_ORDER {
            self.get_or_create(r);
        }
    }

    pub fn get(&self, reg: Reg) -> Option<Arc<SharedTranslator>> {
        self.translators.get(&reg).cloned()
    }

    pub fn get_or_create(&mut self, reg: Reg) -> Arc<SharedTranslator> {
        Arc::clone(
            self.translators
                .entry(reg)
                .or_insert_with(|| Arc::new(SharedTranslator::new(reg))),
        )
    }

    pub fn len(&self) -> usize {
        self.translators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.translators.is_empty()
    }

    /// Stop creating translators. The result can be shared between threads.
    pub fn freeze(self) -> Arc<FrozenTranslatorCache> {
        Arc::new(FrozenTranslatorCache {
            translators: self.translators,
        })
    }
}

impl TranslatorSource for TranslatorCache {
    fn translator(&mut self, reg: Reg) -> Result<Arc<SharedTranslator>, EmulationError> {
        Ok(self.get_or_create(reg))
    }
}

/// A read-only [TranslatorCache]. Asking for a translator it doesn't hold is an error.
#[derive(Debug)]
pub struct FrozenTranslatorCache {
    translators: HashMap<Reg, Arc<SharedTranslator>>,
}

impl FrozenTranslatorCache {
    pub fn get(&self, reg: Reg) -> Option<Arc<SharedTranslator>> {
        self.translators.get(&reg).cloned()
    }
}

impl TranslatorSource for Arc<FrozenTranslatorCache> {
    fn translator(&mut self, reg: Reg) -> Result<Arc<SharedTranslator>, EmulationError> {
        self.get(reg)
            .ok_or(EmulationError::TranslatorUnavailable(reg))
    }
}
