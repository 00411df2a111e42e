//! The code buffer units are emitted into.

use crate::{
    asm::{disassemble, Assembled},
    errors::EmulationError,
    patch::{DeferredPatch, PatchSite},
    point::{PointId, Trace, TraceId},
    reg::Reg,
};
use std::{collections::HashMap, ops::Range};

/// What a [TrackerElement] describes.
#[derive(Clone, Debug, PartialEq)]
pub enum TrackerKind {
    /// An emulated memory access, replacing the instruction originally at `orig`.
    Emulated { orig: usize, point: PointId },
    /// The shared translator for `reg`.
    Translator { reg: Reg },
    /// An instruction relocated without emulation.
    Insn { orig: usize },
    /// A bare call to a translator.
    TranslatorCall { reg: Reg, point: PointId },
}

/// Maps a range of emitted code back to where it came from.
#[derive(Clone, Debug)]
pub struct TrackerElement {
    pub kind: TrackerKind,
    pub trace: TraceId,
    /// Absolute addresses of the emitted code.
    pub code: Range<usize>,
}

pub struct CodeBuffer {
    /// The address the first byte will be placed at.
    base: usize,
    code: Vec<u8>,
    patches: Vec<DeferredPatch>,
    trackers: Vec<TrackerElement>,
    /// Where each placed translator starts.
    translators: HashMap<Reg, usize>,
}

impl CodeBuffer {
    pub fn new(base: usize) -> Self {
        Self {
            base,
            code: Vec::new(),
            patches: Vec::new(),
            trackers: Vec::new(),
            translators: HashMap::new(),
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// The address the next unit will be placed at.
    pub fn next_addr(&self) -> usize {
        self.base + self.code.len()
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn patches(&self) -> &[DeferredPatch] {
        &self.patches
    }

    pub fn trackers(&self) -> &[TrackerElement] {
        &self.trackers
    }

    /// The address of `reg`'s translator, if it has been placed.
    pub fn translator_addr(&self, reg: Reg) -> Option<usize> {
        self.translators.get(&reg).copied()
    }

    /// Translators some patch refers to which have not been placed, in register order.
    pub fn unplaced_translators(&self) -> Vec<Reg> {
        let mut regs = self
            .patches
            .iter()
            .map(|p| p.reg())
            .filter(|r| !self.translators.contains_key(r))
            .collect::<Vec<_>>();
        regs.sort();
        regs.dedup();
        regs
    }

    /// Append a finished unit. This is the only way code enters the buffer, so a unit whose
    /// generation fails before reaching this point leaves no trace.
    pub(crate) fn commit(
        &mut self,
        unit: Assembled,
        sites: Vec<PatchSite>,
        kind: TrackerKind,
        trace: &Trace,
    ) -> Result<Range<usize>, EmulationError> {
        let start = self.next_addr();
        if unit.base != start {
            return Err(EmulationError::Internal(format!(
                "Unit assembled for {:#x} committed at {start:#x}",
                unit.base
            )));
        }
        if let TrackerKind::Translator { reg } = kind {
            if self.translators.contains_key(&reg) {
                return Err(EmulationError::Internal(format!(
                    "Translator for {reg} placed twice"
                )));
            }
            self.translators.insert(reg, start);
        }
        let off = self.code.len();
        self.patches.extend(
            sites
                .into_iter()
                .map(|s| DeferredPatch::new(s.reg, s.point, off + s.off)),
        );
        self.code.extend_from_slice(&unit.bytes);
        let code = start..self.next_addr();
        self.trackers.push(TrackerElement {
            kind,
            trace: trace.id,
            code: code.clone(),
        });
        Ok(code)
    }

    /// Point every pending patch at its placed translator, returning how many were applied.
    pub(crate) fn resolve_patches(&mut self) -> Result<usize, EmulationError> {
        let mut n = 0;
        for p in self.patches.iter_mut().filter(|p| !p.is_applied()) {
            let dest = *self.translators.get(&p.reg()).ok_or_else(|| {
                EmulationError::Internal(format!("Translator for {} never placed", p.reg()))
            })?;
            p.apply(&mut self.code, self.base, dest)?;
            n += 1;
        }
        Ok(n)
    }

    pub(crate) fn into_final(self) -> FinalCode {
        let mut translators = self.translators.into_iter().collect::<Vec<_>>();
        translators.sort();
        FinalCode {
            base: self.base,
            code: self.code,
            trackers: self.trackers,
            translators,
        }
    }
}

/// Fully resolved code, ready to be copied to [FinalCode::base].
#[derive(Debug)]
pub struct FinalCode {
    pub base: usize,
    pub code: Vec<u8>,
    pub trackers: Vec<TrackerElement>,
    /// The address of each placed translator.
    pub translators: Vec<(Reg, usize)>,
}

impl FinalCode {
    pub fn disassemble(&self, with_addrs: bool) -> String {
        disassemble(self.base, &self.code, with_addrs)
    }

    /// The bytes a tracker element covers.
    pub fn bytes(&self, te: &TrackerElement) -> &[u8] {
        &self.code[te.code.start - self.base..te.code.end - self.base]
    }
}
