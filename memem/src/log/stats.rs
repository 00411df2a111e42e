//! Counters describing what a [crate::Session] emitted. Recording is only enabled if the end user
//! defines `MEMEM_LOG_STATS`; in testing mode it is always enabled, with output sent to stderr.

#[cfg(not(test))]
use std::env;
use parking_lot::Mutex;
use std::fs;
use strum::{Display, EnumCount, EnumIter, IntoEnumIterator};

pub(crate) struct Stats {
    // Most runs don't record anything, so the outer `Option` keeps the disabled case to a null
    // check without taking a lock.
    inner: Option<Mutex<StatsInner>>,
}

struct StatsInner {
    /// The path to write output. If exactly equal to `-`, output will be written to stderr.
    output_path: String,
    counts: [u64; Counter::COUNT],
}

/// The quantities recorded. The `to_string` of each variant is its key in the JSON output.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Display, EnumCount, EnumIter)]
pub(crate) enum Counter {
    /// Memory accesses emulated successfully.
    #[strum(to_string = "emulations_ok")]
    EmulationOk,
    /// Memory accesses which could not be emulated.
    #[strum(to_string = "emulations_err")]
    EmulationErr,
    /// Shared translators placed into a code buffer.
    #[strum(to_string = "translators_placed")]
    TranslatorPlaced,
    /// Deferred calls resolved at finalization.
    #[strum(to_string = "patches_applied")]
    PatchApplied,
    /// Bytes committed to a code buffer.
    #[strum(to_string = "bytes_emitted")]
    BytesEmitted,
}

impl Stats {
    #[cfg(not(test))]
    pub fn new() -> Self {
        Self {
            inner: env::var("MEMEM_LOG_STATS")
                .ok()
                .map(|p| Mutex::new(StatsInner::new(p))),
        }
    }

    #[cfg(test)]
    pub fn new() -> Self {
        Self::with_output("-")
    }

    #[cfg(test)]
    pub fn with_output(p: &str) -> Self {
        Self {
            inner: Some(Mutex::new(StatsInner::new(p.to_owned()))),
        }
    }

    /// If recording is enabled, run `f` on the inner counters, otherwise return immediately.
    fn update_with<F>(&self, f: F)
    where
        F: FnOnce(&mut StatsInner),
    {
        if let Some(mtx) = &self.inner {
            f(&mut mtx.lock());
        }
    }

    pub fn add(&self, c: Counter, n: u64) {
        self.update_with(|inner| inner.counts[c as usize] += n);
    }

    pub fn incr(&self, c: Counter) {
        self.add(c, 1);
    }

    #[cfg(test)]
    pub fn get(&self, c: Counter) -> u64 {
        self.inner
            .as_ref()
            .map(|x| x.lock().counts[c as usize])
            .unwrap_or(0)
    }

    /// Output these statistics to the appropriate output path.
    pub fn output(&self) {
        self.update_with(|inner| inner.output());
    }
}

impl StatsInner {
    fn new(output_path: String) -> Self {
        Self {
            output_path,
            counts: [0; Counter::COUNT],
        }
    }

    fn output(&self) {
        let json = self.to_json();
        if self.output_path == "-" {
            eprintln!("{json}");
        } else {
            fs::write(&self.output_path, json).ok();
        }
    }

    /// Turn these statistics into JSON, sorted by key so that the output can be matched
    /// textually.
    fn to_json(&self) -> String {
        let mut fields = Counter::iter()
            .map(|c| (c.to_string(), self.counts[c as usize]))
            .collect::<Vec<_>>();
        fields.sort_unstable_by(|(k1, _), (k2, _)| k1.cmp(k2));
        format!(
            "{{\n    {}\n}}",
            fields
                .iter()
                .map(|(k, v)| format!(r#""{k}": {v}"#))
                .collect::<Vec<_>>()
                .join(",\n    ")
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn json_is_sorted() {
        let tdir = tempfile::tempdir().unwrap();
        let p = tdir.path().join("stats.json");
        let stats = Stats::with_output(p.to_str().unwrap());
        stats.incr(Counter::EmulationOk);
        stats.add(Counter::BytesEmitted, 42);
        stats.output();
        assert_eq!(
            fs::read_to_string(&p).unwrap(),
            r#"{
    "bytes_emitted": 42,
    "emulations_err": 0,
    "emulations_ok": 1,
    "patches_applied": 0,
    "translators_placed": 0
}"#
        );
    }
}
