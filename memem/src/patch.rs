//! Deferred calls to shared translators. When an emulator is generated the translator it needs
//! may not have been placed yet, so a [DeferredPatch] reserves space for the call and records
//! what it needs; once every translator is placed the patch writes the real call.

use crate::{asm::fill_nops, errors::PatchError, point::PointId, reg::Reg};
use iced_x86::{Code, Encoder, Instruction as Op};

/// `call rel32`.
const CALL_REL32_LEN: usize = 5;

/// Where, in a unit under construction, a deferred call was reserved.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PatchSite {
    pub(crate) reg: Reg,
    pub(crate) point: PointId,
    /// Offset from the start of the unit.
    pub(crate) off: usize,
}

#[derive(Clone, Debug)]
pub struct DeferredPatch {
    /// Which translator to call.
    reg: Reg,
    /// The instrumentation point the call belongs to.
    point: PointId,
    /// Offset of the reserved bytes from the start of the code buffer.
    site: usize,
    /// The translator's address, once applied.
    dest: Option<usize>,
}

impl DeferredPatch {
    pub(crate) fn new(reg: Reg, point: PointId, site: usize) -> Self {
        Self {
            reg,
            point,
            site,
            dest: None,
        }
    }

    /// How many bytes must be reserved for this patch. This never changes.
    pub fn estimate() -> usize {
        CALL_REL32_LEN
    }

    pub fn reg(&self) -> Reg {
        self.reg
    }

    pub fn point(&self) -> PointId {
        self.point
    }

    pub fn site(&self) -> usize {
        self.site
    }

    pub fn dest(&self) -> Option<usize> {
        self.dest
    }

    pub fn is_applied(&self) -> bool {
        self.dest.is_some()
    }

    /// Write a call to `dest` into `code`, whose first byte lives at address `base`. Any reserved
    /// bytes the call doesn't need are filled with nops. A patch can be applied only once; if
    /// anything goes wrong `code` is left untouched.
    pub fn apply(&mut self, code: &mut [u8], base: usize, dest: usize) -> Result<(), PatchError> {
        if self.dest.is_some() {
            return Err(PatchError::AlreadyApplied(self.site));
        }
        let estimate = Self::estimate();
        if self.site + estimate > code.len() {
            return Err(PatchError::OutOfBounds {
                site: self.site,
                len: code.len(),
            });
        }
        let from = base + self.site;
        let enc_err = |msg: String| PatchError::Encoding {
            from,
            to: dest,
            msg,
        };
        let op = Op::with_branch(Code::Call_rel32_64, dest as u64).map_err(|e| enc_err(e.to_string()))?;
        let mut enc = Encoder::new(64);
        let needed = enc
            .encode(&op, from as u64)
            .map_err(|e| enc_err(e.to_string()))?;
        if needed > estimate {
            return Err(PatchError::TooLarge { needed, estimate });
        }
        let bytes = enc.take_buffer();
        let reserved = &mut code[self.site..self.site + estimate];
        reserved[..needed].copy_from_slice(&bytes);
        fill_nops(&mut reserved[needed..]);
        self.dest = Some(dest);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{asm::disassemble, testing::fmatch};

    #[test]
    fn apply_once() {
        let mut code = vec![0x90; 16];
        let mut p = DeferredPatch::new(Reg::R15, PointId(3), 4);
        assert!(!p.is_applied());
        p.apply(&mut code, 0x1000, 0x2000).unwrap();
        assert_eq!(p.dest(), Some(0x2000));
        assert_eq!(&code[..4], &[0x90; 4]);
        assert_eq!(&code[9..], &[0x90; 7]);
        fmatch(
            &disassemble(0x1000, &code, true),
            "...
             0x1004: call 0x2000
             ...",
        );
        let before = code.clone();
        assert_eq!(
            p.apply(&mut code, 0x1000, 0x3000),
            Err(PatchError::AlreadyApplied(4))
        );
        assert_eq!(code, before);
        assert_eq!(p.dest(), Some(0x2000));
    }

    #[test]
    fn backwards_call() {
        let mut code = vec![0; 5];
        let mut p = DeferredPatch::new(Reg::RAX, PointId(0), 0);
        p.apply(&mut code, 0x10_0000, 0x8000).unwrap();
        assert_eq!(code[0], 0xE8);
        let rel = i32::from_le_bytes(code[1..5].try_into().unwrap());
        assert_eq!(0x10_0005 + i64::from(rel), 0x8000);
    }

    #[test]
    fn failures() {
        let mut code = vec![0; 6];
        let mut p = DeferredPatch::new(Reg::RAX, PointId(0), 2);
        assert_eq!(
            p.apply(&mut code, 0, 0x100),
            Err(PatchError::OutOfBounds { site: 2, len: 6 })
        );
        let mut p = DeferredPatch::new(Reg::RAX, PointId(0), 0);
        assert!(matches!(
            p.apply(&mut code, 0x1000, 0x7fff_0000_0000),
            Err(PatchError::Encoding { .. })
        ));
        assert!(!p.is_applied());
        assert_eq!(code, vec![0; 6]);
        assert_eq!(DeferredPatch::estimate(), 5);
    }
}
