//! Configuration shared by every unit emitted in a [crate::Session].

use crate::{
    errors::ConfigError,
    guard::GuardTable,
    reg::{Reg, RegSet},
};

/// The calling convention of the runtime translation routine.
#[derive(Clone, Debug)]
pub struct TranslatorAbi {
    /// The symbol resolved to find the routine.
    pub symbol: String,
    /// The register the untranslated address is passed in.
    pub arg: Reg,
    /// The register the translated address is returned in.
    pub ret: Reg,
    /// The register the routine's address is loaded into before the call.
    pub scratch: Reg,
    /// Every general purpose register the routine may clobber.
    pub clobbers: RegSet,
    /// May the routine clobber the x87, SSE or MXCSR state? If so, that state is saved around
    /// every call with `fxsave64`. A routine which doesn't need this must preserve every
    /// non general purpose register.
    pub clobbers_fpu: bool,
}

impl TranslatorAbi {
    /// The SysV x64 convention, calling `RTtranslateMemory`.
    pub fn sysv() -> Self {
        Self {
            symbol: "RTtranslateMemory".to_owned(),
            arg: Reg::RDI,
            ret: Reg::RAX,
            scratch: Reg::R11,
            clobbers: RegSet::caller_saved(),
            clobbers_fpu: true,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for r in [self.arg, self.ret, self.scratch] {
            if matches!(r, Reg::RSP | Reg::RBP) {
                return Err(ConfigError::ReservedRegister(r));
            }
            if !self.clobbers.contains(r) {
                return Err(ConfigError::NotClobbered(r));
            }
        }
        if self.scratch == self.arg {
            return Err(ConfigError::ScratchIsArg(self.arg));
        }
        for r in [Reg::RSP, Reg::RBP] {
            if self.clobbers.contains(r) {
                return Err(ConfigError::ReservedRegister(r));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct EmulatorConfig {
    pub guards: GuardTable,
    pub abi: TranslatorAbi,
    /// Bytes below `RSP` which the rewritten code may be using and which must be stepped over
    /// before anything is pushed.
    pub red_zone: u32,
}

impl EmulatorConfig {
    /// A configuration using the SysV ABI and its 128 byte red zone.
    pub fn new(guards: GuardTable) -> Self {
        Self {
            guards,
            abi: TranslatorAbi::sysv(),
            red_zone: 128,
        }
    }

    pub fn with_abi(mut self, abi: TranslatorAbi) -> Result<Self, ConfigError> {
        abi.validate()?;
        self.abi = abi;
        Ok(self)
    }

    pub fn with_red_zone(mut self, red_zone: u32) -> Result<Self, ConfigError> {
        if red_zone % 8 != 0 {
            return Err(ConfigError::MisalignedRedZone(red_zone));
        }
        self.red_zone = red_zone;
        Ok(self)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::guard::{GuardKind, GuardedRange};

    fn guards() -> GuardTable {
        GuardTable::new(vec![GuardedRange::new(0x1000, 0x2000, GuardKind::Redirect)]).unwrap()
    }

    #[test]
    fn sysv_is_valid() {
        TranslatorAbi::sysv().validate().unwrap();
        // A C routine is free to use every vector register.
        assert!(TranslatorAbi::sysv().clobbers_fpu);
        assert_eq!(EmulatorConfig::new(guards()).red_zone, 128);
    }

    #[test]
    fn rejects_bad_abis() {
        let mut abi = TranslatorAbi::sysv();
        abi.scratch = Reg::R12;
        assert_eq!(
            EmulatorConfig::new(guards()).with_abi(abi).unwrap_err(),
            ConfigError::NotClobbered(Reg::R12)
        );
        let mut abi = TranslatorAbi::sysv();
        abi.arg = Reg::RSP;
        assert_eq!(abi.validate(), Err(ConfigError::ReservedRegister(Reg::RSP)));
        let mut abi = TranslatorAbi::sysv();
        abi.scratch = Reg::RDI;
        assert_eq!(abi.validate(), Err(ConfigError::ScratchIsArg(Reg::RDI)));
        let mut abi = TranslatorAbi::sysv();
        abi.clobbers.insert(Reg::RBP);
        assert_eq!(abi.validate(), Err(ConfigError::ReservedRegister(Reg::RBP)));
        assert_eq!(
            EmulatorConfig::new(guards()).with_red_zone(12).unwrap_err(),
            ConfigError::MisalignedRedZone(12)
        );
    }
}
