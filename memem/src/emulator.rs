//! The memory access emulator: replaces one original instruction with code which computes the
//! instruction's effective address, decides which guarded range (if any) the address lies in,
//! and then performs the access at the original address, a shadowed address, or an address
//! supplied by the runtime.
//!
//! The emitted unit looks like:
//!
//! ```text
//!     <save flags>          (only if flags are live)
//!     <ea = effective address>
//!     <decision sequence>
//!   skip:
//!     <restore flags> <original instruction>                  jmp done
//!   redirect:
//!     <save registers> call translator(ea) <restore registers>
//!     <restore flags> <instruction accessing [ea]>            jmp done
//!   text:
//!     lea ea, [ea+delta] <restore flags> <instruction accessing [ea]>
//!     ...
//!   done:
//! ```
//!
//! Only exits the decision sequence can reach have bodies. All temporaries (the effective
//! address, the saved flags, the saved `rax`, and a scratch register for wide range boundaries)
//! are registers which are neither mentioned by the instruction nor live after it.

use crate::{
    asm::Asm,
    codebuf::{CodeBuffer, TrackerKind},
    config::{EmulatorConfig, TranslatorAbi},
    decision::{DecisionSeq, Exit, Exits},
    errors::EmulationError,
    insn::{AccessForm, Insn, AH_FLAGS},
    patch::{DeferredPatch, PatchSite},
    point::{InstPoint, Trace},
    reg::{Reg, RegSet, ALLOC_ORDER},
    save::{move_register, AlignedFrame, FlagSave, FpuState, PushSet, RedZone},
    session::EmitCtx,
};
use iced_x86::{Code, Instruction as Op, MemoryOperand, Register, RflagsBits};
use std::fmt;

pub struct MemAccessEmulator {
    insn: Insn,
    point: InstPoint,
    /// Registers whose values the original instruction, or code after it, may observe.
    live_before: RegSet,
    /// Must OF survive until the original access?
    save_of: bool,
    /// Must the flags `lahf` transfers survive until the original access?
    save_others: bool,
    /// The register holding the effective address.
    ea: Option<Reg>,
    flag_save: Option<FlagSave>,
    /// Where wide range boundaries are loaded for comparison.
    bound_scratch: Option<Reg>,
}

impl MemAccessEmulator {
    pub fn new(insn: Insn, point: InstPoint) -> Self {
        Self {
            insn,
            point,
            live_before: RegSet::empty(),
            save_of: false,
            save_others: false,
            ea: None,
            flag_save: None,
            bound_scratch: None,
        }
    }

    pub fn addr(&self) -> usize {
        self.insn.addr()
    }

    /// The number of original bytes this emulator replaces.
    pub fn size(&self) -> usize {
        self.insn.len()
    }

    pub fn insn(&self) -> &Insn {
        &self.insn
    }

    pub fn point(&self) -> &InstPoint {
        &self.point
    }

    /// The effective address register chosen by the last call to [Self::generate].
    pub fn ea_reg(&self) -> Option<Reg> {
        self.ea
    }

    /// The register flags are kept in, if they needed saving.
    pub fn flag_reg(&self) -> Option<Reg> {
        self.flag_save.map(|f| f.reg)
    }

    pub fn rax_save_reg(&self) -> Option<Reg> {
        self.flag_save.and_then(|f| f.rax_save)
    }

    pub fn bound_scratch(&self) -> Option<Reg> {
        self.bound_scratch
    }

    pub fn tracker(&self) -> TrackerKind {
        TrackerKind::Emulated {
            orig: self.insn.addr(),
            point: self.point.id,
        }
    }

    pub fn generate(
        &mut self,
        ctx: &mut EmitCtx<'_>,
        buf: &mut CodeBuffer,
        trace: &Trace,
    ) -> Result<(), EmulationError> {
        let cfg = ctx.cfg();
        let form = self.insn.access_form()?;
        self.check_live_flags();
        self.calc_write_set();
        self.alloc_registers(cfg)?;
        let ea = self
            .ea
            .ok_or_else(|| EmulationError::Internal("No effective address register".into()))?;

        let seq = DecisionSeq::plan(ea, self.bound_scratch, &cfg.guards)?;
        if seq.uses(Exit::Redirect) {
            // Fail now, rather than at finalization, if the translator can never be provided.
            ctx.translator(ea)?;
            ctx.translator_addr()?;
        }

        let mut asm = Asm::new(buf.next_addr(), ctx.log_asm());
        asm.log(format!("emulate {:?} via {ea}", self.insn));
        if let Some(fs) = &self.flag_save {
            fs.save(&mut asm)?;
        }
        self.compute_effective_address(&mut asm, form, ea)?;
        let mut exits = Exits::new();
        seq.emit(&mut asm, &mut exits)?;

        let done = asm.mk_label();
        let bodies = exits.iter().collect::<Vec<_>>();
        let mut sites = Vec::new();
        for (i, (exit, lidx)) in bodies.iter().enumerate() {
            asm.attach_label(*lidx);
            asm.log(format!("{exit}"));
            match exit {
                Exit::Skip | Exit::Original => self.generate_orig(&mut asm)?,
                Exit::Redirect => self.generate_inst(&mut asm, cfg, form, ea, &mut sites)?,
                Exit::Text(delta) => self.generate_text(&mut asm, form, ea, *delta)?,
            }
            if i + 1 < bodies.len() {
                asm.push_reloc(Op::with_branch(Code::Jmp_rel32_64, 0), done)?;
            }
        }
        asm.attach_label(done);
        ctx.commit(buf, asm, sites, self.tracker(), trace)?;
        Ok(())
    }

    /// Work out which flags must survive until the original access: those it reads, and those
    /// live afterwards which it doesn't overwrite.
    fn check_live_flags(&mut self) {
        let live = self.insn.flags_read() | (self.point.live_flags & !self.insn.flags_killed());
        self.save_of = live & RflagsBits::OF != 0;
        self.save_others = live & AH_FLAGS != 0;
    }

    fn calc_write_set(&mut self) {
        self.live_before = self
            .insn
            .reads()
            .union(self.point.live_regs.difference(self.insn.writes()));
    }

    fn alloc_registers(&mut self, cfg: &EmulatorConfig) -> Result<(), EmulationError> {
        let save_flags = self.save_of || self.save_others;
        let mut excluded = self
            .insn
            .used()
            .union(self.point.live_regs)
            .with(Reg::RSP)
            .with(Reg::RBP);
        if save_flags {
            // `rax` transfers the flags, so it can't also hold one of our temporaries.
            excluded.insert(Reg::RAX);
        }
        let mut free = ALLOC_ORDER.iter().copied().filter(|r| !excluded.contains(*r));
        let mut take = |what: &str| {
            free.next().ok_or_else(|| {
                EmulationError::NoFreeRegister(format!("{what} for {:?}", self.insn))
            })
        };

        self.ea = Some(take("effective address")?);
        self.flag_save = if save_flags {
            let reg = take("saved flags")?;
            let rax_save = if self.live_before.contains(Reg::RAX) {
                Some(take("saved rax")?)
            } else {
                None
            };
            Some(FlagSave {
                of: self.save_of,
                others: self.save_others,
                reg,
                rax_save,
            })
        } else {
            None
        };
        self.bound_scratch = if DecisionSeq::needs_scratch(&cfg.guards) {
            Some(take("range boundary")?)
        } else {
            None
        };
        Ok(())
    }

    fn compute_effective_address(
        &self,
        asm: &mut Asm,
        form: AccessForm,
        ea: Reg,
    ) -> Result<(), EmulationError> {
        match form {
            AccessForm::ModRm => self.generate_via_modrm(asm, ea),
            AccessForm::SegOverride(seg) => self.generate_via_override(asm, ea, seg),
            AccessForm::Lods => move_register(asm, Reg::RSI, ea),
            AccessForm::Scas => move_register(asm, Reg::RDI, ea),
        }
    }

    /// `lea ea, <memory operand>`. An IP-relative operand is re-encoded relative to the new IP.
    fn generate_via_modrm(&self, asm: &mut Asm, ea: Reg) -> Result<(), EmulationError> {
        let inst = self.insn.inst();
        let mem = MemoryOperand::new(
            inst.memory_base(),
            inst.memory_index(),
            inst.memory_index_scale(),
            inst.memory_displacement64() as i64,
            inst.memory_displ_size(),
            false,
            Register::None,
        );
        asm.push_inst(Op::with2(Code::Lea_r64_m, ea.to_reg64(), mem))
    }

    /// The `fs`/`gs` base is read from `seg:[0]`, which holds the segment's linear address on
    /// x64 Linux, and added to the offset within the segment.
    fn generate_via_override(
        &self,
        asm: &mut Asm,
        ea: Reg,
        seg: Register,
    ) -> Result<(), EmulationError> {
        self.generate_via_modrm(asm, ea)?;
        asm.push_inst(Op::with2(
            Code::Add_r64_rm64,
            ea.to_reg64(),
            MemoryOperand::new(Register::None, Register::None, 1, 0, 8, false, seg),
        ))
    }

    /// The original access, as if nothing had happened.
    fn generate_orig(&self, asm: &mut Asm) -> Result<(), EmulationError> {
        if let Some(fs) = &self.flag_save {
            fs.restore(asm)?;
        }
        if self.insn.is_ip_relative() {
            asm.push_inst(Ok(*self.insn.inst()))
        } else {
            asm.push_bytes(self.insn.bytes());
            Ok(())
        }
    }

    /// Call the translator for `ea`, then access the address it returns.
    fn generate_inst(
        &self,
        asm: &mut Asm,
        cfg: &EmulatorConfig,
        form: AccessForm,
        ea: Reg,
        sites: &mut Vec<PatchSite>,
    ) -> Result<(), EmulationError> {
        let red_zone = RedZone(cfg.red_zone);
        let saves = PushSet::new(self.redirect_saves(&cfg.abi, ea).iter());
        red_zone.save(asm)?;
        saves.save(asm)?;
        AlignedFrame.save(asm)?;
        if cfg.abi.clobbers_fpu {
            FpuState.save(asm)?;
        }
        sites.push(PatchSite {
            reg: ea,
            point: self.point.id,
            off: asm.off().as_usize(),
        });
        asm.log(format!("call translator({ea})"));
        asm.push_nops(DeferredPatch::estimate());
        if cfg.abi.clobbers_fpu {
            FpuState.restore(asm)?;
        }
        AlignedFrame.restore(asm)?;
        saves.restore(asm)?;
        red_zone.restore(asm)?;
        self.generate_access(asm, form, ea)
    }

    /// Registers the translator may clobber which hold something we need afterwards.
    fn redirect_saves(&self, abi: &TranslatorAbi, ea: Reg) -> RegSet {
        let mut keep = self.live_before;
        if let Some(fs) = &self.flag_save {
            keep.insert(fs.reg);
            if let Some(s) = fs.rax_save {
                keep.insert(s);
            }
        }
        keep.intersection(abi.clobbers)
            .without(ea)
            .without(Reg::RSP)
            .without(Reg::RBP)
    }

    fn generate_text(
        &self,
        asm: &mut Asm,
        form: AccessForm,
        ea: Reg,
        delta: i32,
    ) -> Result<(), EmulationError> {
        asm.push_inst(Op::with2(
            Code::Lea_r64_m,
            ea.to_reg64(),
            MemoryOperand::with_base_displ(ea.to_reg64(), i64::from(delta)),
        ))?;
        self.generate_access(asm, form, ea)
    }

    /// Perform the original instruction's access at the address in `ea`.
    fn generate_access(&self, asm: &mut Asm, form: AccessForm, ea: Reg) -> Result<(), EmulationError> {
        match form {
            AccessForm::ModRm | AccessForm::SegOverride(_) => {
                if let Some(fs) = &self.flag_save {
                    fs.restore(asm)?;
                }
                let mut inst = *self.insn.inst();
                inst.set_memory_base(ea.to_reg64());
                inst.set_memory_index(Register::None);
                inst.set_memory_index_scale(1);
                inst.set_memory_displacement64(0);
                inst.set_memory_displ_size(0);
                inst.set_segment_prefix(Register::None);
                asm.push_inst(Ok(inst))
            }
            AccessForm::Lods | AccessForm::Scas => {
                // Point the string register at the new address, remembering how far that moved
                // it, then run the original instruction and move the register back. Whatever the
                // instruction's own adjustment was is preserved.
                let ptr = if form == AccessForm::Lods {
                    Register::RSI
                } else {
                    Register::RDI
                };
                asm.push_inst(Op::with2(Code::Xchg_rm64_r64, ptr, ea.to_reg64()))?;
                asm.push_inst(Op::with2(Code::Sub_r64_rm64, ea.to_reg64(), ptr))?;
                if let Some(fs) = &self.flag_save {
                    fs.restore(asm)?;
                }
                asm.push_bytes(self.insn.bytes());
                asm.push_inst(Op::with2(
                    Code::Lea_r64_m,
                    ptr,
                    MemoryOperand::with_base_index(ptr, ea.to_reg64()),
                ))
            }
        }
    }
}

impl fmt::Display for MemAccessEmulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "emulate({:?})", self.insn)
    }
}
