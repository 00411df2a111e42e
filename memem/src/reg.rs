//! General purpose registers and sets of them.

use iced_x86::Register;
use std::fmt;
use strum::{EnumCount, EnumIter, FromRepr, IntoEnumIterator};

/// An x64 general purpose register. Variants are numbered in hardware encoding order so that
/// [RegSet] can store them as a `u16` bitfield.
#[derive(
    Clone, Copy, Debug, EnumCount, EnumIter, Eq, FromRepr, Hash, Ord, PartialEq, PartialOrd,
)]
#[repr(u8)]
pub enum Reg {
    RAX = 0,
    RCX,
    RDX,
    RBX,
    RSP,
    RBP,
    RSI,
    RDI,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

const REG64: [Register; Reg::COUNT] = [
    Register::RAX,
    Register::RCX,
    Register::RDX,
    Register::RBX,
    Register::RSP,
    Register::RBP,
    Register::RSI,
    Register::RDI,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
    Register::R12,
    Register::R13,
    Register::R14,
    Register::R15,
];

/// The order in which emulator temporaries are chosen. `RSP` and `RBP` never appear: the former
/// is the stack pointer, the latter anchors the frame set up around translation calls.
pub(crate) const ALLOC_ORDER: [Reg; 14] = [
    Reg::R15,
    Reg::R14,
    Reg::R13,
    Reg::R12,
    Reg::R11,
    Reg::R10,
    Reg::R9,
    Reg::R8,
    Reg::RDI,
    Reg::RSI,
    Reg::RBX,
    Reg::RDX,
    Reg::RCX,
    Reg::RAX,
];

impl Reg {
    pub fn to_reg64(self) -> Register {
        REG64[self as usize]
    }

    /// Map any sized general purpose register (e.g. `AL`, `R9D`) to the [Reg] it is part of.
    /// Returns `None` for anything that isn't a general purpose register.
    pub fn from_iced(reg: Register) -> Option<Self> {
        if !reg.is_gpr() {
            return None;
        }
        let full = reg.full_register();
        REG64
            .iter()
            .position(|x| *x == full)
            .and_then(|i| Reg::from_repr(u8::try_from(i).ok()?))
    }

    /// Is this register part of the SysV x64 caller-saved set?
    pub fn is_caller_saved(self) -> bool {
        matches!(
            self,
            Reg::RAX
                | Reg::RDI
                | Reg::RSI
                | Reg::RDX
                | Reg::RCX
                | Reg::R8
                | Reg::R9
                | Reg::R10
                | Reg::R11
        )
    }

    #[cfg(test)]
    pub(crate) fn from_str(s: &str) -> Option<Self> {
        REG64
            .iter()
            .position(|x| format!("{x:?}").eq_ignore_ascii_case(s))
            .and_then(|i| Reg::from_repr(i as u8))
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", format!("{:?}", self).to_lowercase())
    }
}

/// A set of [Reg]s.
#[derive(Clone, Copy, Default, Eq, Hash, PartialEq)]
pub struct RegSet(u16);

impl RegSet {
    pub const fn empty() -> Self {
        RegSet(0)
    }

    /// The SysV x64 caller-saved registers.
    pub fn caller_saved() -> Self {
        Reg::iter().filter(|r| r.is_caller_saved()).collect()
    }

    pub fn insert(&mut self, reg: Reg) {
        self.0 |= 1 << reg as u16;
    }

    pub fn remove(&mut self, reg: Reg) {
        self.0 &= !(1 << reg as u16);
    }

    pub fn contains(&self, reg: Reg) -> bool {
        self.0 & (1 << reg as u16) != 0
    }

    pub fn with(mut self, reg: Reg) -> Self {
        self.insert(reg);
        self
    }

    pub fn without(mut self, reg: Reg) -> Self {
        self.remove(reg);
        self
    }

    pub fn union(self, other: RegSet) -> Self {
        RegSet(self.0 | other.0)
    }

    pub fn intersection(self, other: RegSet) -> Self {
        RegSet(self.0 & other.0)
    }

    pub fn difference(self, other: RegSet) -> Self {
        RegSet(self.0 & !other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Iterate over the registers in this set in hardware encoding order.
    pub fn iter(&self) -> impl Iterator<Item = Reg> + '_ {
        Reg::iter().filter(move |r| self.contains(*r))
    }
}

impl FromIterator<Reg> for RegSet {
    fn from_iter<I: IntoIterator<Item = Reg>>(iter: I) -> Self {
        let mut s = RegSet::empty();
        for r in iter {
            s.insert(r);
        }
        s
    }
}

impl<const N: usize> From<[Reg; N]> for RegSet {
    fn from(regs: [Reg; N]) -> Self {
        regs.into_iter().collect()
    }
}

impl fmt::Debug for RegSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for RegSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{{}}}",
            self.iter()
                .map(|r| r.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )
    }
}
