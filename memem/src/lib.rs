//! Memory access emulation for x64 binary rewriting.
//!
//! When a rewriter relocates code, some memory the original code touches may have moved: the
//! original text may now hold instrumented code, or the runtime may keep data elsewhere. Each
//! [MemAccessEmulator] replaces one memory-accessing instruction with code that checks the
//! address at run-time and, if it lies in a guarded range, performs the access somewhere else.
//!
//! Code is generated through a [Session], which appends [Unit]s to a single code buffer and, on
//! [Session::finalize], places the [SharedTranslator]s the emitted code calls.

#![allow(clippy::upper_case_acronyms)]
#![allow(clippy::len_without_is_empty)]

mod asm;
pub mod codebuf;
pub mod config;
pub mod decision;
pub mod emulator;
pub mod errors;
pub mod guard;
pub mod insn;
pub mod log;
pub mod patch;
pub mod point;
pub mod reg;
pub mod runtime;
mod save;
pub mod session;
#[cfg(test)]
mod testing;
pub mod translator;
pub mod unit;

pub use self::asm::disassemble;
pub use self::codebuf::{FinalCode, TrackerElement, TrackerKind};
pub use self::config::{EmulatorConfig, TranslatorAbi};
pub use self::emulator::MemAccessEmulator;
pub use self::errors::{ConfigError, EmulationError, PatchError};
pub use self::guard::{GuardKind, GuardTable, GuardedRange};
pub use self::insn::Insn;
pub use self::point::{InstPoint, Trace};
pub use self::reg::{Reg, RegSet};
pub use self::runtime::{DlsymResolver, StaticResolver, SymbolResolver};
pub use self::session::{EmitCtx, Session};
pub use self::translator::{FrozenTranslatorCache, SharedTranslator, TranslatorCache};
pub use self::unit::Unit;
