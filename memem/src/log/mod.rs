//! The implementation of the `MEMEM_LOG*` environment variables.

use std::{env, error::Error, fs::File, io::Write, path::PathBuf};
use strum::{EnumCount, FromRepr};

pub(crate) mod stats;

/// How verbose should logging be?
#[repr(u8)]
#[derive(Copy, Clone, Debug, EnumCount, FromRepr, PartialEq, PartialOrd)]
pub enum Verbosity {
    /// Disable logging entirely.
    Disabled,
    /// Log errors.
    Error,
    /// Log warnings, including units which could not be emulated.
    Warning,
    /// Log every unit emitted into a code buffer.
    Emission,
}

/// Where a log line goes: `None` means stderr.
fn parse_path(path: &str) -> Option<PathBuf> {
    if path == "-" {
        None
    } else {
        let path = PathBuf::from(path);
        // Truncate any previous run's output so that later appends start from empty.
        File::create(&path).ok();
        Some(path)
    }
}

fn append(path: &Option<PathBuf>, s: &str) {
    match path {
        Some(p) => {
            File::options()
                .append(true)
                .open(p)
                .map(|mut x| x.write_all(s.as_bytes()))
                .ok();
        }
        None => eprint!("{s}"),
    }
}

pub struct Log {
    /// The requested [Verbosity] level for logging.
    level: Verbosity,
    /// The path to write to. `None` means stderr.
    path: Option<PathBuf>,
    /// If set, where the disassembly of every emitted unit is written (`None` meaning stderr).
    asm: Option<Option<PathBuf>>,
}

impl Log {
    /// Configure logging from `MEMEM_LOG=[<path|->:]<level>` and `MEMEM_LOG_ASM=<path|->`.
    pub fn new() -> Result<Self, Box<dyn Error>> {
        let mut log = match env::var("MEMEM_LOG") {
            Ok(s) => Self::from_spec(&s)?,
            Err(_) => Self {
                level: Verbosity::Error,
                path: None,
                asm: None,
            },
        };
        if let Ok(p) = env::var("MEMEM_LOG_ASM") {
            log.set_asm_path(&p);
        }
        Ok(log)
    }

    /// Parse a `[<path|->:]<level>` string.
    pub fn from_spec(s: &str) -> Result<Self, Box<dyn Error>> {
        let (path, level) = match s.split(':').collect::<Vec<_>>()[..] {
            [path, level] => (parse_path(path), level),
            [level] => (None, level),
            [..] => return Err("MEMEM_LOG must be of the format `[<path|->:]<level>`".into()),
        };
        let level = level
            .parse::<u8>()
            .map_err(|e| format!("Invalid MEMEM_LOG level '{s}': {e}"))?;
        let max_level = Verbosity::COUNT - 1;
        let level = Verbosity::from_repr(level)
            .ok_or_else(|| format!("MEMEM_LOG level {level} exceeds maximum {max_level}"))?;
        Ok(Self {
            level,
            path,
            asm: None,
        })
    }

    pub fn level(&self) -> Verbosity {
        self.level
    }

    /// Log `msg` with the [Verbosity] level `level`.
    ///
    /// # Panics
    ///
    /// If `level == Verbosity::Disabled`.
    pub fn log(&self, level: Verbosity, msg: &str) {
        if level <= self.level {
            let prefix = match level {
                Verbosity::Disabled => panic!(),
                Verbosity::Error => "memem-error",
                Verbosity::Warning => "memem-warning",
                Verbosity::Emission => "memem-emit",
            };
            append(&self.path, &format!("{prefix}: {msg}\n"));
        }
    }

    /// Log the disassembly of emitted units to `p` (`-` meaning stderr).
    pub fn set_asm_path(&mut self, p: &str) {
        self.asm = Some(parse_path(p));
    }

    /// Should emitted units have their disassembly logged?
    pub fn should_log_asm(&self) -> bool {
        self.asm.is_some()
    }

    pub fn log_asm(&self, s: &str) {
        if let Some(p) = &self.asm {
            append(p, &format!("--- Begin unit ---\n{s}\n--- End unit ---\n"));
        }
    }
}
