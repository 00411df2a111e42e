//! A small forward assembler for a single unit of code. Operations are encoded with [iced_x86] at
//! the address they will eventually occupy, so that IP-relative operands are correct from the
//! outset; only branches to labels within the unit need relocating, which happens in
//! [Asm::finish].
//!
//! As in the rest of this crate, iced64 instructions are called "operations" to avoid confusing
//! them with the original [crate::insn::Insn]s being rewritten.

use crate::errors::EmulationError;
use iced_x86::{Decoder, DecoderOptions, Encoder, Formatter, Instruction as Op, NasmFormatter};
use index_vec::{index_vec, IndexVec};

/// Multi-byte nops, indexed by length - 1. From https://en.wikipedia.org/wiki/NOP_(code).
const NOPS: [&[u8]; 9] = [
    &[0x90],
    &[0x66, 0x90],
    &[0x0F, 0x1F, 0x00],
    &[0x0F, 0x1F, 0x40, 0x00],
    &[0x0F, 0x1F, 0x44, 0x00, 0x00],
    &[0x66, 0x0F, 0x1F, 0x44, 0x00, 0x00],
    &[0x0F, 0x1F, 0x80, 0x00, 0x00, 0x00, 0x00],
    &[0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
    &[0x66, 0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
];

/// Fill `buf` with as few nop instructions as possible.
pub(crate) fn fill_nops(mut buf: &mut [u8]) {
    while !buf.is_empty() {
        let nop = NOPS[buf.len().min(NOPS.len()) - 1];
        buf[..nop.len()].copy_from_slice(nop);
        buf = &mut buf[nop.len()..];
    }
}

fn mk_formatter() -> NasmFormatter {
    let mut fmtr = NasmFormatter::new();
    fmtr.options_mut().set_branch_leading_zeros(false);
    fmtr.options_mut().set_hex_prefix("0x");
    fmtr.options_mut().set_hex_suffix("");
    fmtr.options_mut().set_uppercase_hex(false);
    fmtr.options_mut().set_rip_relative_addresses(true);
    fmtr.options_mut().set_show_branch_size(false);
    fmtr.options_mut().set_space_after_operand_separator(true);
    fmtr
}

/// Disassemble `bytes`, which will live at address `base`, one operation per line.
pub fn disassemble(base: usize, bytes: &[u8], with_addrs: bool) -> String {
    let mut fmtr = mk_formatter();
    let mut dec = Decoder::with_ip(64, bytes, base as u64, DecoderOptions::NONE);
    let mut out = Vec::new();
    while dec.can_decode() {
        let op = dec.decode();
        let mut s = String::new();
        fmtr.format(&op, &mut s);
        if with_addrs {
            out.push(format!("{:#x}: {s}", op.ip()));
        } else {
            out.push(s);
        }
    }
    out.join("\n")
}

/// The position of an operation within a unit.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct CodeOff(u32);

impl CodeOff {
    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

pub(crate) struct Asm {
    /// The address the first byte of [Self::buf] will be placed at.
    base: u64,
    buf: Vec<u8>,
    /// A scratch encoder used solely by [Self::push_inst] to avoid reallocations.
    enc: Encoder,
    /// Set to `None` if logging is not enabled.
    fmtr: Option<NasmFormatter>,
    /// Labels. New labels start with a value of `None`; when attached they become `Some(offset)`.
    labels: IndexVec<LabelIdx, Option<u32>>,
    /// Branches to labels: `(offset, operation length, target)`.
    relocs: Vec<(u32, u8, LabelIdx)>,
    log: Option<Vec<String>>,
}

/// The output of a successful [Asm::finish].
pub(crate) struct Assembled {
    pub(crate) base: usize,
    pub(crate) bytes: Vec<u8>,
    pub(crate) log: Option<String>,
}

impl Asm {
    pub(crate) fn new(base: usize, log: bool) -> Self {
        Asm {
            base: base as u64,
            buf: Vec::new(),
            enc: Encoder::new(64),
            fmtr: if log { Some(mk_formatter()) } else { None },
            labels: index_vec![],
            relocs: Vec::new(),
            log: if log { Some(Vec::new()) } else { None },
        }
    }

    pub(crate) fn log(&mut self, s: String) {
        if let Some(x) = &mut self.log {
            x.push(format!("; {s}"))
        }
    }

    /// The address the next operation will be placed at.
    pub(crate) fn ip(&self) -> u64 {
        self.base + self.buf.len() as u64
    }

    pub(crate) fn off(&self) -> CodeOff {
        CodeOff(self.buf.len() as u32)
    }

    /// Create a new free-floating label: it will only be attached when `attach_label` is called on
    /// the label.
    pub(crate) fn mk_label(&mut self) -> LabelIdx {
        self.labels.push(None)
    }

    /// Attach `lidx` to the next operation pushed.
    pub(crate) fn attach_label(&mut self, lidx: LabelIdx) {
        if let Some(log) = &mut self.log {
            log.push(format!("l{}:", usize::from(lidx)));
        }
        self.labels[lidx] = Some(self.buf.len() as u32);
    }

    /// Push `n` bytes of `nop` instructions.
    pub(crate) fn push_nops(&mut self, n: usize) {
        let start = self.buf.len();
        self.buf.resize(start + n, 0);
        fill_nops(&mut self.buf[start..]);
        self.log_bytes(start);
    }

    /// Push `bytes` verbatim: they must be position independent.
    pub(crate) fn push_bytes(&mut self, bytes: &[u8]) {
        let start = self.buf.len();
        self.buf.extend_from_slice(bytes);
        self.log_bytes(start);
    }

    fn log_bytes(&mut self, start: usize) {
        if self.log.is_some() {
            let s = disassemble(self.base as usize + start, &self.buf[start..], false);
            if let Some(log) = &mut self.log {
                log.extend(s.lines().map(|x| x.to_owned()));
            }
        }
    }

    /// Push an icedx64 [Op].
    pub(crate) fn push_inst(
        &mut self,
        op: Result<Op, iced_x86::IcedError>,
    ) -> Result<(), EmulationError> {
        let mut inst = op?;
        let ip = self.ip();
        // Branches to labels don't know their target yet. The encoder rejects a target of 0, so
        // use the current IP and patch it in `finish`.
        if (inst.is_call_near() || inst.is_jmp_near() || inst.is_jcc_near())
            && inst.near_branch64() == 0
        {
            inst.set_near_branch64(ip);
        }
        self.enc.encode(&inst, ip)?;
        let mut enc_buf = self.enc.take_buffer();
        self.buf.extend_from_slice(&enc_buf);
        enc_buf.clear();
        self.enc.set_buffer(enc_buf);

        if let (Some(log), Some(fmtr)) = (&mut self.log, &mut self.fmtr) {
            let mut inst_s = String::new();
            fmtr.format(&inst, &mut inst_s);
            log.push(inst_s);
        }
        Ok(())
    }

    /// Push a near `jmp` or `jcc` with a target of 0, to be relocated to `lidx`.
    pub(crate) fn push_reloc(
        &mut self,
        op: Result<Op, iced_x86::IcedError>,
        lidx: LabelIdx,
    ) -> Result<(), EmulationError> {
        let old_len = self.buf.len();
        self.push_inst(op)?;
        if let Some(s) = self.log.as_mut().and_then(|x| x.last_mut()) {
            if let Some(off) = s.rfind(' ') {
                s.replace_range(off.., &format!(" l{}", usize::from(lidx)));
            }
        }
        self.relocs.push((
            old_len as u32,
            u8::try_from(self.buf.len() - old_len)
                .map_err(|e| EmulationError::Internal(e.to_string()))?,
            lidx,
        ));
        Ok(())
    }

    /// Resolve label relocations and return the finished code.
    pub(crate) fn finish(mut self) -> Result<Assembled, EmulationError> {
        for (off, inst_len, lidx) in &self.relocs {
            let off = *off as usize;
            let bufs = &mut self.buf;
            // Find which part of the operation holds the displacement by inspecting its opcode.
            let patch_off = if bufs[off] == 0xE9 {
                off + 1 // JMP rel32
            } else if bufs[off] == 0x0F && (0x80..=0x8F).contains(&bufs[off + 1]) {
                off + 2 // Jcc rel32
            } else {
                return Err(EmulationError::Internal(format!(
                    "Can't relocate {:X?}",
                    &bufs[off..off + usize::from(*inst_len)]
                )));
            };
            let target = self.labels[*lidx].ok_or_else(|| {
                EmulationError::Internal(format!("Label l{} never attached", usize::from(*lidx)))
            })?;
            let next = off + usize::from(*inst_len);
            let diff = i32::try_from(i64::from(target) - next as i64)
                .map_err(|e| EmulationError::Internal(e.to_string()))?;
            bufs[patch_off..patch_off + 4].copy_from_slice(&diff.to_le_bytes());
        }
        Ok(Assembled {
            base: self.base as usize,
            bytes: self.buf,
            log: self.log.map(|x| x.join("\n")),
        })
    }
}

index_vec::define_index_type! {
    pub(crate) struct LabelIdx = u32;
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::fmatch;
    use iced_x86::{Code, Register};

    #[test]
    fn nops() {
        for n in 0..20 {
            let mut asm = Asm::new(0x1000, false);
            asm.push_nops(n);
            let a = asm.finish().unwrap();
            assert_eq!(a.bytes.len(), n);
            for l in disassemble(0x1000, &a.bytes, false).lines() {
                assert!(l.starts_with("nop") || l == "xchg ax, ax", "{l}");
            }
        }
    }

    #[test]
    fn labels() {
        let mut asm = Asm::new(0x4000, true);
        let fwd = asm.mk_label();
        let back = asm.mk_label();
        asm.attach_label(back);
        asm.push_inst(Op::with1(Code::Push_r64, Register::RAX))
            .unwrap();
        asm.push_reloc(Op::with_branch(Code::Jb_rel32_64, 0), fwd)
            .unwrap();
        asm.push_reloc(Op::with_branch(Code::Jmp_rel32_64, 0), back)
            .unwrap();
        asm.attach_label(fwd);
        asm.push_inst(Ok(Op::with(Code::Retnq))).unwrap();
        let a = asm.finish().unwrap();
        fmatch(
            &disassemble(a.base, &a.bytes, true),
            "0x4000: push rax
             0x4001: jb 0x400c
             0x4007: jmp 0x4000
             0x400c: ret",
        );
        fmatch(
            &a.log.unwrap(),
            "l1:
             push rax
             jb l0
             jmp l1
             l0:
             ret",
        );
    }

    #[test]
    fn unattached_label() {
        let mut asm = Asm::new(0, false);
        let l = asm.mk_label();
        asm.push_reloc(Op::with_branch(Code::Jmp_rel32_64, 0), l)
            .unwrap();
        assert!(matches!(asm.finish(), Err(EmulationError::Internal(_))));
    }
}
