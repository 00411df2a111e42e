//! Decoded original instructions.

use crate::{
    asm::disassemble,
    errors::EmulationError,
    reg::{Reg, RegSet},
};
use iced_x86::{
    Code, Decoder, DecoderOptions, FlowControl, Instruction, InstructionInfoFactory, Mnemonic,
    OpAccess, OpKind, Register, RflagsBits,
};
use std::fmt;

/// The flags `lahf` / `sahf` transfer via `AH`.
pub(crate) const AH_FLAGS: u32 =
    RflagsBits::SF | RflagsBits::ZF | RflagsBits::AF | RflagsBits::PF | RflagsBits::CF;

/// How an instruction computes the address it accesses.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AccessForm {
    /// A ModRM/SIB memory operand, possibly RIP-relative.
    ModRm,
    /// A ModRM/SIB operand with an `fs` or `gs` segment override.
    SegOverride(Register),
    /// `lods*`: the address is `rsi`.
    Lods,
    /// `scas*`: the address is `rdi`.
    Scas,
}

/// An original instruction at a known address.
#[derive(Clone)]
pub struct Insn {
    addr: usize,
    bytes: Vec<u8>,
    inst: Instruction,
    /// Registers whose value on entry may be observed.
    reads: RegSet,
    /// Registers fully overwritten.
    writes: RegSet,
    /// Every register the instruction mentions, explicitly or implicitly.
    used: RegSet,
    /// How many memory accesses the instruction makes, including implicit stack accesses.
    mem_accesses: usize,
}

impl Insn {
    /// Decode exactly one instruction from `bytes`, which were originally at `addr`.
    pub fn decode(addr: usize, bytes: &[u8]) -> Result<Self, EmulationError> {
        let mut dec = Decoder::with_ip(64, bytes, addr as u64, DecoderOptions::NONE);
        let inst = dec.decode();
        if inst.is_invalid() {
            return Err(EmulationError::UnsupportedEncoding(format!(
                "can't decode {bytes:02X?}"
            )));
        }
        if inst.len() != bytes.len() {
            return Err(EmulationError::UnsupportedEncoding(format!(
                "{} trailing bytes after instruction",
                bytes.len() - inst.len()
            )));
        }

        let mut reads = RegSet::empty();
        let mut writes = RegSet::empty();
        let mut used = RegSet::empty();
        let mut factory = InstructionInfoFactory::new();
        let info = factory.info(&inst);
        let mem_accesses = info
            .used_memory()
            .iter()
            .filter(|m| !matches!(m.access(), OpAccess::NoMemAccess | OpAccess::None))
            .count();
        for ur in info.used_registers() {
            let Some(r) = Reg::from_iced(ur.register()) else {
                continue;
            };
            used.insert(r);
            // A write to an 8 or 16 bit register leaves the rest of the register intact, so it
            // counts as a read. 32 bit writes zero the upper half.
            let full = ur.register().size() >= 4;
            match ur.access() {
                OpAccess::Write if full => writes.insert(r),
                OpAccess::ReadWrite if full => {
                    reads.insert(r);
                    writes.insert(r);
                }
                OpAccess::None | OpAccess::NoMemAccess => (),
                _ => reads.insert(r),
            }
        }

        Ok(Self {
            addr,
            bytes: bytes.to_vec(),
            inst,
            reads,
            writes,
            used,
            mem_accesses,
        })
    }

    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub(crate) fn inst(&self) -> &Instruction {
        &self.inst
    }

    pub fn reads(&self) -> RegSet {
        self.reads
    }

    pub fn writes(&self) -> RegSet {
        self.writes
    }

    pub fn used(&self) -> RegSet {
        self.used
    }

    pub fn is_ip_relative(&self) -> bool {
        self.inst.is_ip_rel_memory_operand()
    }

    pub fn flags_read(&self) -> u32 {
        self.inst.rflags_read()
    }

    /// The flags whose value after this instruction is independent of their value before it.
    pub fn flags_killed(&self) -> u32 {
        if self.is_variable_shift() {
            0
        } else {
            self.inst.rflags_modified()
        }
    }

    /// Shifts and rotates leave every flag untouched when their (masked) count is zero.
    fn is_variable_shift(&self) -> bool {
        if !matches!(
            self.inst.mnemonic(),
            Mnemonic::Shl
                | Mnemonic::Sal
                | Mnemonic::Shr
                | Mnemonic::Sar
                | Mnemonic::Rol
                | Mnemonic::Ror
                | Mnemonic::Rcl
                | Mnemonic::Rcr
                | Mnemonic::Shld
                | Mnemonic::Shrd
        ) {
            return false;
        }
        let count = self.inst.op_count() - 1;
        self.inst.op_kind(count) != OpKind::Immediate8 || self.inst.immediate8() & 0x3F == 0
    }

    /// Classify how this instruction addresses memory, rejecting forms that can't be emulated.
    pub fn access_form(&self) -> Result<AccessForm, EmulationError> {
        let unsupported = |s: &str| Err(EmulationError::UnsupportedEncoding(format!("{s}: {self}")));
        let inst = &self.inst;
        if inst.flow_control() != FlowControl::Next {
            return unsupported("control transfer");
        }
        let string_op = match inst.mnemonic() {
            Mnemonic::Lodsb | Mnemonic::Lodsw | Mnemonic::Lodsd | Mnemonic::Lodsq => {
                Some((AccessForm::Lods, OpKind::MemorySegRSI))
            }
            Mnemonic::Scasb | Mnemonic::Scasw | Mnemonic::Scasd | Mnemonic::Scasq => {
                Some((AccessForm::Scas, OpKind::MemoryESRDI))
            }
            _ => None,
        };
        if let Some((form, kind)) = string_op {
            if inst.has_rep_prefix() || inst.has_repe_prefix() || inst.has_repne_prefix() {
                return unsupported("repeated string operation");
            }
            if inst.segment_prefix() != Register::None {
                return unsupported("string operation with segment override");
            }
            if !(0..inst.op_count()).any(|i| inst.op_kind(i) == kind) {
                return unsupported("32 bit string addressing");
            }
            return Ok(form);
        }

        let mem_ops = (0..inst.op_count())
            .filter(|i| inst.op_kind(*i) == OpKind::Memory)
            .count();
        if mem_ops != 1 || matches!(inst.mnemonic(), Mnemonic::Lea | Mnemonic::Nop) {
            return unsupported("no explicit memory access");
        }
        if self.mem_accesses > 1 || inst.stack_pointer_increment() != 0 {
            return unsupported("more than one memory access");
        }
        // With a register bit offset, the bit string extends beyond the addressed byte in either
        // direction.
        if matches!(
            inst.mnemonic(),
            Mnemonic::Bt | Mnemonic::Bts | Mnemonic::Btr | Mnemonic::Btc
        ) && inst.op1_kind() == OpKind::Register
        {
            return unsupported("bit test with a register offset");
        }
        if inst.is_vsib() {
            return unsupported("vector SIB addressing");
        }
        let (base, index) = (inst.memory_base(), inst.memory_index());
        if base == Register::EIP || base.is_gpr32() || index.is_gpr32() {
            return unsupported("32 bit addressing");
        }
        if matches!(
            inst.code(),
            Code::Mov_AL_moffs8
                | Code::Mov_AX_moffs16
                | Code::Mov_EAX_moffs32
                | Code::Mov_RAX_moffs64
                | Code::Mov_moffs8_AL
                | Code::Mov_moffs16_AX
                | Code::Mov_moffs32_EAX
                | Code::Mov_moffs64_RAX
        ) {
            return unsupported("absolute 64 bit address");
        }
        match inst.segment_prefix() {
            Register::FS | Register::GS => Ok(AccessForm::SegOverride(inst.segment_prefix())),
            _ => Ok(AccessForm::ModRm),
        }
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", disassemble(self.addr, &self.bytes, false))
    }
}

impl fmt::Debug for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}: {self}", self.addr)
    }
}
