//! Helpers shared by this crate's tests.

use crate::{
    asm::disassemble,
    codebuf::FinalCode,
    config::EmulatorConfig,
    guard::{GuardKind, GuardTable, GuardedRange},
    insn::Insn,
    log::Log,
    point::InstPoint,
    reg::{Reg, RegSet},
    runtime::StaticResolver,
    session::Session,
    translator::TranslatorCache,
};
use fm::{FMBuilder, FMatcher};
use iced_x86::{Decoder, DecoderOptions, Instruction};
use regex::Regex;
use std::sync::LazyLock;

/// Use `{{name}}` to match non-literal strings in tests: every occurrence of the same name must
/// match the same text.
static PTN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{\{.+?\}\}").unwrap());
static TEXT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[a-zA-Z0-9\._]+").unwrap());

pub(crate) const TRANSLATE_ADDR: usize = 0x7f00_0000_1000;

fn fmatcher(ptn: &str) -> FMatcher<'_> {
    FMBuilder::new(ptn)
        .unwrap()
        .name_matcher(PTN_RE.clone(), TEXT_RE.clone())
        .build()
        .unwrap()
}

/// Match `s` against the [fm] pattern `ptn`, panicking with a readable diff if it fails.
pub(crate) fn fmatch(s: &str, ptn: &str) {
    if let Err(e) = fmatcher(ptn).matches(s) {
        panic!("{e}");
    }
}

/// Redirect `0x1000..0x2000`, shadow `0x3000..0x4000` at `+0x10000`, and treat
/// `0x4000..0x5000` as safe.
pub(crate) fn three_ranges() -> EmulatorConfig {
    EmulatorConfig::new(
        GuardTable::new(vec![
            GuardedRange::new(0x1000, 0x2000, GuardKind::Redirect),
            GuardedRange::new(0x3000, 0x4000, GuardKind::Text { shadow_delta: 0x10000 }),
            GuardedRange::new(0x4000, 0x5000, GuardKind::Safe),
        ])
        .unwrap(),
    )
}

pub(crate) fn resolver() -> StaticResolver {
    StaticResolver::new().with("RTtranslateMemory", TRANSLATE_ADDR)
}

pub(crate) fn insn(addr: usize, bytes: &[u8]) -> Insn {
    Insn::decode(addr, bytes).unwrap()
}

/// A point whose live registers are named in `regs` (e.g. `"rax rbx"`).
pub(crate) fn point(id: u32, addr: usize, regs: &str, flags: u32) -> InstPoint {
    InstPoint::new(
        id,
        addr,
        regs.split_whitespace()
            .map(|x| Reg::from_str(x).unwrap())
            .collect::<RegSet>(),
        flags,
    )
}

/// A session with logging disabled and translators created on demand.
pub(crate) fn session(cfg: EmulatorConfig, base: usize) -> Session<TranslatorCache> {
    Session::with_log(
        cfg,
        TranslatorCache::new(),
        Box::new(resolver()),
        base,
        Log::from_spec("0").unwrap(),
    )
}

pub(crate) fn decode_all(fc: &FinalCode) -> Vec<Instruction> {
    let mut dec = Decoder::with_ip(64, &fc.code, fc.base as u64, DecoderOptions::NONE);
    let mut v = Vec::new();
    while dec.can_decode() {
        v.push(dec.decode());
    }
    v
}

/// For every near branch and call in `fc`, the text of the instruction it goes to (`<end>` if
/// it goes to the end of the code).
pub(crate) fn branch_targets(fc: &FinalCode) -> Vec<String> {
    let insts = decode_all(fc);
    insts
        .iter()
        .filter(|i| i.is_jcc_near() || i.is_jmp_near() || i.is_call_near())
        .map(|i| {
            let t = i.near_branch64();
            if t == (fc.base + fc.code.len()) as u64 {
                return "<end>".to_owned();
            }
            match insts.iter().find(|x| x.ip() == t) {
                Some(x) => {
                    let off = x.ip() as usize - fc.base;
                    disassemble(x.ip() as usize, &fc.code[off..off + x.len()], false)
                }
                None => format!("<bad target {t:#x}>"),
            }
        })
        .collect()
}
