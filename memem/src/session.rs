//! A session emits units one after the other into a single [CodeBuffer] and, when finalized,
//! places the translators the emitted code needs and resolves the calls to them.

use crate::{
    asm::Asm,
    codebuf::{CodeBuffer, FinalCode, TrackerKind},
    config::EmulatorConfig,
    errors::EmulationError,
    log::{
        stats::{Counter, Stats},
        Log, Verbosity,
    },
    patch::PatchSite,
    point::Trace,
    reg::Reg,
    runtime::SymbolResolver,
    translator::{SharedTranslator, TranslatorSource},
    unit::Unit,
};
use std::{error::Error, ops::Range, sync::Arc};

/// What a unit can see while it generates code.
pub struct EmitCtx<'a> {
    cfg: &'a EmulatorConfig,
    translators: &'a mut dyn TranslatorSource,
    resolver: &'a dyn SymbolResolver,
    log: &'a Log,
}

impl<'a> EmitCtx<'a> {
    pub fn new(
        cfg: &'a EmulatorConfig,
        translators: &'a mut dyn TranslatorSource,
        resolver: &'a dyn SymbolResolver,
        log: &'a Log,
    ) -> Self {
        Self {
            cfg,
            translators,
            resolver,
            log,
        }
    }

    pub fn cfg(&self) -> &'a EmulatorConfig {
        self.cfg
    }

    pub fn translator(&mut self, reg: Reg) -> Result<Arc<SharedTranslator>, EmulationError> {
        self.translators.translator(reg)
    }

    /// The address of the runtime translation routine.
    pub fn translator_addr(&self) -> Result<usize, EmulationError> {
        let sym = &self.cfg.abi.symbol;
        self.resolver
            .resolve(sym)
            .ok_or_else(|| EmulationError::TranslatorUnresolved(sym.clone()))
    }

    pub(crate) fn log_asm(&self) -> bool {
        self.log.should_log_asm()
    }

    /// Finish `asm` and append it to `buf`.
    pub(crate) fn commit(
        &self,
        buf: &mut CodeBuffer,
        asm: Asm,
        sites: Vec<PatchSite>,
        kind: TrackerKind,
        trace: &Trace,
    ) -> Result<Range<usize>, EmulationError> {
        let unit = asm.finish()?;
        if let Some(s) = &unit.log {
            self.log.log_asm(s);
        }
        buf.commit(unit, sites, kind, trace)
    }
}

pub struct Session<T: TranslatorSource> {
    cfg: EmulatorConfig,
    translators: T,
    resolver: Box<dyn SymbolResolver>,
    buf: CodeBuffer,
    log: Log,
    stats: Stats,
}

impl<T: TranslatorSource> Session<T> {
    /// Create a session whose code will live at `base`, with logging configured from the
    /// environment.
    pub fn new(
        cfg: EmulatorConfig,
        translators: T,
        resolver: Box<dyn SymbolResolver>,
        base: usize,
    ) -> Result<Self, Box<dyn Error>> {
        Ok(Self::with_log(cfg, translators, resolver, base, Log::new()?))
    }

    pub fn with_log(
        cfg: EmulatorConfig,
        translators: T,
        resolver: Box<dyn SymbolResolver>,
        base: usize,
        log: Log,
    ) -> Self {
        Self {
            cfg,
            translators,
            resolver,
            buf: CodeBuffer::new(base),
            log,
            stats: Stats::new(),
        }
    }

    pub fn buffer(&self) -> &CodeBuffer {
        &self.buf
    }

    pub fn translators(&self) -> &T {
        &self.translators
    }

    /// Generate `unit` at the end of the buffer, returning the addresses it occupies. On error
    /// the buffer is unchanged.
    pub fn emit(&mut self, unit: &mut Unit, trace: &Trace) -> Result<Range<usize>, EmulationError> {
        let start = self.buf.next_addr();
        let mut ctx = EmitCtx::new(
            &self.cfg,
            &mut self.translators,
            &*self.resolver,
            &self.log,
        );
        let r = unit.generate(&mut ctx, &mut self.buf, trace);
        let code = start..self.buf.next_addr();
        match &r {
            Ok(()) => {
                self.log.log(
                    Verbosity::Emission,
                    &format!("{trace}: {unit} at {:#x}..{:#x}", code.start, code.end),
                );
                match unit {
                    Unit::Emulated(_) => self.stats.incr(Counter::EmulationOk),
                    Unit::Translator(_) if !code.is_empty() => {
                        self.stats.incr(Counter::TranslatorPlaced)
                    }
                    _ => (),
                }
                self.stats
                    .add(Counter::BytesEmitted, (code.end - code.start) as u64);
            }
            Err(e) => {
                self.log.log(Verbosity::Warning, &format!("{trace}: {unit}: {e}"));
                if let Unit::Emulated(_) = unit {
                    self.stats.incr(Counter::EmulationErr);
                }
            }
        }
        r.map(|_| code)
    }

    /// Place every translator a deferred call needs, resolve the calls, and return the finished
    /// code.
    pub fn finalize(mut self) -> Result<FinalCode, EmulationError> {
        let trace = Trace::outlined();
        for reg in self.buf.unplaced_translators() {
            let mut unit = Unit::Translator(self.translators.translator(reg)?);
            self.emit(&mut unit, &trace)?;
        }
        let n = self.buf.resolve_patches()?;
        self.stats.add(Counter::PatchApplied, n as u64);
        self.stats.output();
        Ok(self.buf.into_final())
    }

    #[cfg(test)]
    pub(crate) fn stats(&self) -> &Stats {
        &self.stats
    }
}
