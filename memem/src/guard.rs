//! Guarded address ranges: the parts of the address space whose accesses an emulated
//! instruction must not perform directly.

use crate::{decision::Exit, errors::ConfigError};
use std::fmt;

/// What to do with an access that falls in a [GuardedRange].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum GuardKind {
    /// Ask the runtime translation routine where the access should go.
    Redirect,
    /// The range has a shadow copy at a constant displacement: add `shadow_delta` to the address.
    Text { shadow_delta: i32 },
    /// Known safe: perform the original access.
    Safe,
}

impl GuardKind {
    pub fn exit(self) -> Exit {
        match self {
            GuardKind::Redirect => Exit::Redirect,
            GuardKind::Text { shadow_delta } => Exit::Text(shadow_delta),
            GuardKind::Safe => Exit::Original,
        }
    }
}

/// The half-open address range `start..end`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GuardedRange {
    pub start: u64,
    pub end: u64,
    pub kind: GuardKind,
}

impl GuardedRange {
    pub fn new(start: u64, end: u64, kind: GuardKind) -> Self {
        Self { start, end, kind }
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }
}

impl fmt::Display for GuardedRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}..{:#x} ", self.start, self.end)?;
        match self.kind {
            GuardKind::Redirect => write!(f, "redirect"),
            GuardKind::Text { shadow_delta } => write!(f, "text{shadow_delta:+}"),
            GuardKind::Safe => write!(f, "safe"),
        }
    }
}

/// A non-empty, sorted, non-overlapping set of [GuardedRange]s.
#[derive(Clone, Debug)]
pub struct GuardTable {
    ranges: Vec<GuardedRange>,
}

impl GuardTable {
    /// Build a table from `ranges` in any order.
    pub fn new(mut ranges: Vec<GuardedRange>) -> Result<Self, ConfigError> {
        if ranges.is_empty() {
            return Err(ConfigError::NoRanges);
        }
        if let Some(r) = ranges.iter().find(|r| r.start >= r.end) {
            return Err(ConfigError::EmptyRange {
                start: r.start,
                end: r.end,
            });
        }
        ranges.sort_by_key(|r| r.start);
        for w in ranges.windows(2) {
            if w[1].start < w[0].end {
                return Err(ConfigError::Overlap(w[0].start, w[1].start));
            }
        }
        Ok(Self { ranges })
    }

    /// The lowest guarded address.
    pub fn lo(&self) -> u64 {
        self.ranges[0].start
    }

    /// One past the highest guarded address.
    pub fn hi(&self) -> u64 {
        self.ranges[self.ranges.len() - 1].end
    }

    pub fn iter(&self) -> impl Iterator<Item = &GuardedRange> {
        self.ranges.iter()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Which exit should an access to `addr` take?
    pub fn classify(&self, addr: u64) -> Exit {
        self.ranges
            .iter()
            .find(|r| r.contains(addr))
            .map(|r| r.kind.exit())
            .unwrap_or(Exit::Skip)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn validation() {
        assert_eq!(GuardTable::new(vec![]).unwrap_err(), ConfigError::NoRanges);
        assert_eq!(
            GuardTable::new(vec![GuardedRange::new(8, 8, GuardKind::Safe)]).unwrap_err(),
            ConfigError::EmptyRange { start: 8, end: 8 }
        );
        assert_eq!(
            GuardTable::new(vec![
                GuardedRange::new(0x2000, 0x3000, GuardKind::Safe),
                GuardedRange::new(0x1000, 0x2001, GuardKind::Redirect),
            ])
            .unwrap_err(),
            ConfigError::Overlap(0x1000, 0x2000)
        );
    }

    #[test]
    fn classify() {
        let t = GuardTable::new(vec![
            GuardedRange::new(0x3000, 0x4000, GuardKind::Text { shadow_delta: 16 }),
            GuardedRange::new(0x1000, 0x2000, GuardKind::Redirect),
        ])
        .unwrap();
        assert_eq!((t.lo(), t.hi()), (0x1000, 0x4000));
        assert_eq!(t.classify(0xfff), Exit::Skip);
        assert_eq!(t.classify(0x1000), Exit::Redirect);
        assert_eq!(t.classify(0x2000), Exit::Skip);
        assert_eq!(t.classify(0x3fff), Exit::Text(16));
        assert_eq!(t.classify(0x4000), Exit::Skip);
        assert_eq!(t.iter().next().unwrap().to_string(), "0x1000..0x2000 redirect");
    }
}
