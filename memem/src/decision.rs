//! The decision sequence: a chain of compares and conditional branches which routes an effective
//! address to the exit for the guarded range (if any) containing it.
//!
//! For ranges `r0, ..., rn` sorted by address, the chain is:
//!
//! ```text
//!   cmp ea, r0.start ; jb skip
//!   cmp ea, rn.end   ; jae skip
//!   cmp ea, r1.start ; jb skip       (only if there's a gap between r0 and r1)
//!   cmp ea, r0.end   ; jb exit(r0)
//!   ...
//!   jmp exit(rn)
//! ```
//!
//! Boundaries which can't be expressed as a sign-extended 32 bit immediate are first loaded into a
//! scratch register.

use crate::{
    asm::{Asm, LabelIdx},
    errors::EmulationError,
    guard::GuardTable,
    reg::Reg,
};
use iced_x86::{Code, Instruction as Op};
use std::fmt;

/// Where the decision sequence can send an address.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Exit {
    /// Outside every guarded range: perform the original access.
    Skip,
    /// In a safe range: perform the original access.
    Original,
    /// Ask the translation routine for the real address.
    Redirect,
    /// Add a constant displacement to the address.
    Text(i32),
}

impl fmt::Display for Exit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exit::Skip => write!(f, "skip"),
            Exit::Original => write!(f, "original"),
            Exit::Redirect => write!(f, "redirect"),
            Exit::Text(d) => write!(f, "text{d:+}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Cond {
    Below,
    AboveEq,
    Always,
}

/// One compare-and-branch. `bound` is `None` only for [Cond::Always].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Step {
    pub bound: Option<u64>,
    pub cond: Cond,
    pub exit: Exit,
}

/// Labels for the exits the decision sequence branches to, in the order they were first used.
pub(crate) struct Exits {
    labels: Vec<(Exit, LabelIdx)>,
}

impl Exits {
    pub(crate) fn new() -> Self {
        Self { labels: Vec::new() }
    }

    pub(crate) fn label(&mut self, asm: &mut Asm, exit: Exit) -> LabelIdx {
        match self.labels.iter().find(|(e, _)| *e == exit) {
            Some((_, l)) => *l,
            None => {
                let l = asm.mk_label();
                self.labels.push((exit, l));
                l
            }
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (Exit, LabelIdx)> + '_ {
        self.labels.iter().copied()
    }
}

/// Can `bound` be compared against with a sign-extended 32 bit immediate?
fn fits_imm32(bound: u64) -> bool {
    i32::try_from(bound as i64).is_ok()
}

pub struct DecisionSeq {
    ea: Reg,
    scratch: Option<Reg>,
    steps: Vec<Step>,
}

impl DecisionSeq {
    /// Will a chain for `guards` need a scratch register for wide boundaries?
    pub fn needs_scratch(guards: &GuardTable) -> bool {
        guards
            .iter()
            .any(|r| !fits_imm32(r.start) || !fits_imm32(r.end))
    }

    /// Build the chain of steps comparing `ea` against `guards`.
    pub fn plan(ea: Reg, scratch: Option<Reg>, guards: &GuardTable) -> Result<Self, EmulationError> {
        if scratch.is_none() && Self::needs_scratch(guards) {
            return Err(EmulationError::Internal(
                "Wide range boundaries need a scratch register".to_owned(),
            ));
        }
        let step = |bound, cond, exit| Step {
            bound: Some(bound),
            cond,
            exit,
        };
        let mut steps = vec![
            step(guards.lo(), Cond::Below, Exit::Skip),
            step(guards.hi(), Cond::AboveEq, Exit::Skip),
        ];
        let mut prev_end = guards.lo();
        for (i, r) in guards.iter().enumerate() {
            if r.start > prev_end {
                steps.push(step(r.start, Cond::Below, Exit::Skip));
            }
            if i + 1 < guards.len() {
                steps.push(step(r.end, Cond::Below, r.kind.exit()));
            } else {
                steps.push(Step {
                    bound: None,
                    cond: Cond::Always,
                    exit: r.kind.exit(),
                });
            }
            prev_end = r.end;
        }
        Ok(Self { ea, scratch, steps })
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn uses(&self, exit: Exit) -> bool {
        self.steps.iter().any(|s| s.exit == exit)
    }

    /// Which exit would the chain take for `addr`?
    pub fn evaluate(&self, addr: u64) -> Exit {
        for s in &self.steps {
            let taken = match (s.cond, s.bound) {
                (Cond::Below, Some(b)) => addr < b,
                (Cond::AboveEq, Some(b)) => addr >= b,
                _ => true,
            };
            if taken {
                return s.exit;
            }
        }
        Exit::Skip
    }

    pub(crate) fn emit(&self, asm: &mut Asm, exits: &mut Exits) -> Result<(), EmulationError> {
        for s in &self.steps {
            if let Some(b) = s.bound {
                self.emit_compare(asm, b)?;
            }
            let code = match s.cond {
                Cond::Below => Code::Jb_rel32_64,
                Cond::AboveEq => Code::Jae_rel32_64,
                Cond::Always => Code::Jmp_rel32_64,
            };
            let l = exits.label(asm, s.exit);
            asm.push_reloc(Op::with_branch(code, 0), l)?;
        }
        Ok(())
    }

    fn emit_compare(&self, asm: &mut Asm, bound: u64) -> Result<(), EmulationError> {
        let ea = self.ea.to_reg64();
        if fits_imm32(bound) {
            asm.push_inst(Op::with2(Code::Cmp_rm64_imm32, ea, bound as i64 as i32))
        } else {
            let scratch = self
                .scratch
                .ok_or_else(|| EmulationError::Internal("No scratch register".to_owned()))?
                .to_reg64();
            asm.push_inst(Op::with2(Code::Mov_r64_imm64, scratch, bound))?;
            asm.push_inst(Op::with2(Code::Cmp_rm64_r64, ea, scratch))
        }
    }
}
