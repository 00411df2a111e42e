//! Errors raised while generating emulation code.

use crate::reg::Reg;
use thiserror::Error;

/// Why generation of a unit failed. A unit that fails leaves the code buffer untouched: the caller
/// may fall back to relocating the instruction verbatim.
#[derive(Debug, Error)]
pub enum EmulationError {
    /// No dead register could be found for one of the emulator's temporaries.
    #[error("No free register: {0}")]
    NoFreeRegister(String),
    /// The instruction's memory operand uses an addressing form which can't be emulated.
    #[error("Unsupported encoding: {0}")]
    UnsupportedEncoding(String),
    /// The runtime translation routine couldn't be resolved.
    #[error("Can't resolve translation routine '{0}'")]
    TranslatorUnresolved(String),
    /// A frozen translator cache has no translator for this register.
    #[error("No translator for register {0}")]
    TranslatorUnavailable(Reg),
    /// Resolving a deferred call failed.
    #[error(transparent)]
    Patch(#[from] PatchError),
    /// The encoder rejected an instruction.
    #[error("Encoding failed: {0}")]
    Encoding(String),
    /// Something went wrong that shouldn't be possible.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<iced_x86::IcedError> for EmulationError {
    fn from(e: iced_x86::IcedError) -> Self {
        EmulationError::Encoding(e.to_string())
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum PatchError {
    #[error("Patch at offset {0:#x} has already been applied")]
    AlreadyApplied(usize),
    #[error("Patch needs {needed} bytes but only {estimate} were reserved")]
    TooLarge { needed: usize, estimate: usize },
    #[error("Patch site {site:#x} lies outside a buffer of {len} bytes")]
    OutOfBounds { site: usize, len: usize },
    #[error("Can't encode call from {from:#x} to {to:#x}: {msg}")]
    Encoding { from: usize, to: usize, msg: String },
}

/// A configuration was rejected at construction time.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("No guarded ranges given")]
    NoRanges,
    #[error("Range {start:#x}..{end:#x} is empty")]
    EmptyRange { start: u64, end: u64 },
    #[error("Ranges {0:#x}.. and {1:#x}.. overlap")]
    Overlap(u64, u64),
    #[error("Register {0} can't be used by the translation ABI")]
    ReservedRegister(Reg),
    #[error("Register {0} must be in the translation routine's clobber set")]
    NotClobbered(Reg),
    #[error("Register {0} can't both pass the address and hold the routine's address")]
    ScratchIsArg(Reg),
    #[error("Red zone of {0} bytes is not a multiple of 8")]
    MisalignedRedZone(u32),
}
