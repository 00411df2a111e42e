//! Save and restore sequences. Every `save` has a `restore` which emits its inverse, so that
//! pairing them around arbitrary code preserves the saved state.

use crate::{asm::Asm, errors::EmulationError, reg::Reg};
use iced_x86::{Code, Instruction as Op, MemoryOperand, Register};

/// Emit `mov to, from`, or nothing if the registers are the same.
pub(crate) fn move_register(asm: &mut Asm, from: Reg, to: Reg) -> Result<(), EmulationError> {
    if from != to {
        asm.push_inst(Op::with2(Code::Mov_r64_rm64, to.to_reg64(), from.to_reg64()))?;
    }
    Ok(())
}

fn adjust_rsp(asm: &mut Asm, delta: i64) -> Result<(), EmulationError> {
    // `lea` rather than `add`/`sub` so that flags are unaffected.
    asm.push_inst(Op::with2(
        Code::Lea_r64_m,
        Register::RSP,
        MemoryOperand::with_base_displ(Register::RSP, delta),
    ))
}

/// The bytes below `rsp` which must not be overwritten.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RedZone(pub(crate) u32);

impl RedZone {
    pub(crate) fn save(&self, asm: &mut Asm) -> Result<(), EmulationError> {
        if self.0 > 0 {
            adjust_rsp(asm, -i64::from(self.0))?;
        }
        Ok(())
    }

    pub(crate) fn restore(&self, asm: &mut Asm) -> Result<(), EmulationError> {
        if self.0 > 0 {
            adjust_rsp(asm, i64::from(self.0))?;
        }
        Ok(())
    }
}

/// Registers saved on the stack, restored in reverse order.
#[derive(Clone, Debug)]
pub(crate) struct PushSet {
    regs: Vec<Reg>,
}

impl PushSet {
    pub(crate) fn new(regs: impl IntoIterator<Item = Reg>) -> Self {
        Self {
            regs: regs.into_iter().collect(),
        }
    }

    pub(crate) fn save(&self, asm: &mut Asm) -> Result<(), EmulationError> {
        for r in &self.regs {
            asm.push_inst(Op::with1(Code::Push_r64, r.to_reg64()))?;
        }
        Ok(())
    }

    pub(crate) fn restore(&self, asm: &mut Asm) -> Result<(), EmulationError> {
        for r in self.regs.iter().rev() {
            asm.push_inst(Op::with1(Code::Pop_r64, r.to_reg64()))?;
        }
        Ok(())
    }
}

/// A frame anchored in `rbp` with `rsp` aligned to 16 bytes, as a call requires.
pub(crate) struct AlignedFrame;

impl AlignedFrame {
    pub(crate) fn save(&self, asm: &mut Asm) -> Result<(), EmulationError> {
        asm.push_inst(Op::with1(Code::Push_r64, Register::RBP))?;
        asm.push_inst(Op::with2(Code::Mov_r64_rm64, Register::RBP, Register::RSP))?;
        asm.push_inst(Op::with2(Code::And_rm64_imm8, Register::RSP, -16i32))
    }

    pub(crate) fn restore(&self, asm: &mut Asm) -> Result<(), EmulationError> {
        asm.push_inst(Op::with2(Code::Mov_r64_rm64, Register::RSP, Register::RBP))?;
        asm.push_inst(Op::with1(Code::Pop_r64, Register::RBP))
    }
}

/// The x87, SSE and MXCSR state, kept in a 512 byte block on the stack. `rsp` must be 16 byte
/// aligned.
pub(crate) struct FpuState;

impl FpuState {
    const SIZE: i64 = 512;

    pub(crate) fn save(&self, asm: &mut Asm) -> Result<(), EmulationError> {
        adjust_rsp(asm, -Self::SIZE)?;
        asm.push_inst(Op::with1(
            Code::Fxsave64_m512byte,
            MemoryOperand::with_base(Register::RSP),
        ))
    }

    pub(crate) fn restore(&self, asm: &mut Asm) -> Result<(), EmulationError> {
        asm.push_inst(Op::with1(
            Code::Fxrstor64_m512byte,
            MemoryOperand::with_base(Register::RSP),
        ))?;
        adjust_rsp(asm, Self::SIZE)
    }
}

/// Arithmetic flags kept in a register while the emulator runs code that clobbers them.
///
/// `lahf` copies SF, ZF, AF, PF and CF into `ah`; `seto al` records OF in `al`. Restoring adds
/// `0x7f` to `al`, which overflows precisely when `al` is 1, and `sahf` reloads the rest. The
/// `add` clobbers the flags `sahf` then restores, so the order matters.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FlagSave {
    /// Save OF.
    pub(crate) of: bool,
    /// Save the flags `lahf` transfers.
    pub(crate) others: bool,
    /// Where the flags are kept.
    pub(crate) reg: Reg,
    /// If `rax` is live, where it is kept while being used to transfer flags.
    pub(crate) rax_save: Option<Reg>,
}

impl FlagSave {
    pub(crate) fn save(&self, asm: &mut Asm) -> Result<(), EmulationError> {
        if let Some(s) = self.rax_save {
            move_register(asm, Reg::RAX, s)?;
        }
        if self.others {
            asm.push_inst(Ok(Op::with(Code::Lahf)))?;
        }
        if self.of {
            asm.push_inst(Op::with1(Code::Seto_rm8, Register::AL))?;
        }
        move_register(asm, Reg::RAX, self.reg)?;
        if let Some(s) = self.rax_save {
            move_register(asm, s, Reg::RAX)?;
        }
        Ok(())
    }

    pub(crate) fn restore(&self, asm: &mut Asm) -> Result<(), EmulationError> {
        if let Some(s) = self.rax_save {
            move_register(asm, Reg::RAX, s)?;
        }
        move_register(asm, self.reg, Reg::RAX)?;
        if self.of {
            asm.push_inst(Op::with2(Code::Add_rm8_imm8, Register::AL, 0x7Fi32))?;
        }
        if self.others {
            asm.push_inst(Ok(Op::with(Code::Sahf)))?;
        }
        if let Some(s) = self.rax_save {
            move_register(asm, s, Reg::RAX)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{asm::disassemble, testing::fmatch};

    fn assemble<F>(f: F) -> String
    where
        F: FnOnce(&mut Asm) -> Result<(), EmulationError>,
    {
        let mut asm = Asm::new(0x1000, false);
        f(&mut asm).unwrap();
        let a = asm.finish().unwrap();
        disassemble(a.base, &a.bytes, false)
    }

    #[test]
    fn push_set_is_symmetric() {
        let ps = PushSet::new([Reg::RAX, Reg::RDI, Reg::R11]);
        fmatch(
            &assemble(|asm| {
                ps.save(asm)?;
                ps.restore(asm)
            }),
            "push rax
             push rdi
             push r11
             pop r11
             pop rdi
             pop rax",
        );
    }

    #[test]
    fn red_zone_and_frame() {
        fmatch(
            &assemble(|asm| {
                RedZone(128).save(asm)?;
                AlignedFrame.save(asm)?;
                FpuState.save(asm)?;
                FpuState.restore(asm)?;
                AlignedFrame.restore(asm)?;
                RedZone(128).restore(asm)?;
                RedZone(0).save(asm)
            }),
            "lea rsp, [rsp-0x80]
             push rbp
             mov rbp, rsp
             and rsp, ...
             lea rsp, [rsp-0x200]
             fxsave64 ...
             fxrstor64 ...
             lea rsp, [rsp+0x200]
             mov rsp, rbp
             pop rbp
             lea rsp, [rsp+0x80]",
        );
    }

    #[test]
    fn flags_with_live_rax() {
        let fs = FlagSave {
            of: true,
            others: true,
            reg: Reg::R14,
            rax_save: Some(Reg::R13),
        };
        fmatch(
            &assemble(|asm| {
                fs.save(asm)?;
                fs.restore(asm)
            }),
            "mov r13, rax
             lahf
             seto al
             mov r14, rax
             mov rax, r13
             mov r13, rax
             mov rax, r14
             add al, 0x7f
             sahf
             mov rax, r13",
        );
    }

    #[test]
    fn flags_partial() {
        let fs = FlagSave {
            of: false,
            others: true,
            reg: Reg::R15,
            rax_save: None,
        };
        fmatch(
            &assemble(|asm| {
                fs.save(asm)?;
                fs.restore(asm)
            }),
            "lahf
             mov r15, rax
             mov rax, r15
             sahf",
        );
        let fs = FlagSave {
            of: true,
            others: false,
            reg: Reg::R15,
            rax_save: None,
        };
        fmatch(
            &assemble(|asm| fs.save(asm)),
            "seto al
             mov r15, rax",
        );
    }
}
