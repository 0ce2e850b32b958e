//! Aggregation of per-file upload results and wall-clock timing.

use crate::store::BulkWriteResult;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::ops::{Add, BitAnd};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Per-file counters for one (file, cluster) upload.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegfileCounter {
    /// Documents matched by bulk-write filters.
    #[serde(default)]
    pub matched: u64,
    /// Documents modified by bulk writes.
    #[serde(default)]
    pub modified: u64,
    /// Documents inserted through upserts.
    #[serde(default)]
    pub upserted: u64,
    /// Lines read so far.
    #[serde(default)]
    pub line_cur: u64,
    /// Lines rejected by the strategy.
    #[serde(default)]
    pub line_invalid: u64,
    /// Total lines of the file, known once a run completed.
    #[serde(default)]
    pub line_total: u64,
}

impl SegfileCounter {
    /// Feeds the counts of one acknowledged bulk write.
    pub fn count_bulk_write_result(&mut self, result: &BulkWriteResult) {
        self.matched += result.matched;
        self.modified += result.modified;
        self.upserted += result.upserted;
    }

    /// Clears everything except `line_total`, which keeps percentage display
    /// meaningful when a known file is re-uploaded.
    pub fn reset_run(&mut self) {
        let line_total = self.line_total;
        *self = Self {
            line_total,
            ..Self::default()
        };
    }
}

/// Sums every field; aggregation across distinct files.
impl Add for SegfileCounter {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            matched: self.matched + other.matched,
            modified: self.modified + other.modified,
            upserted: self.upserted + other.upserted,
            line_cur: self.line_cur + other.line_cur,
            line_invalid: self.line_invalid + other.line_invalid,
            line_total: self.line_total + other.line_total,
        }
    }
}

/// Merges counters of the same file uploaded to different clusters: the line
/// counts are those of the first operand (every cluster read the same file),
/// the document counts are summed.
impl BitAnd for SegfileCounter {
    type Output = Self;

    fn bitand(self, other: Self) -> Self {
        Self {
            matched: self.matched + other.matched,
            modified: self.modified + other.modified,
            upserted: self.upserted + other.upserted,
            line_cur: self.line_cur,
            line_invalid: self.line_invalid,
            line_total: self.line_total,
        }
    }
}

impl fmt::Display for SegfileCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Lines: total - {}, invalid - {}. Documents: matched - {}",
            self.line_total, self.line_invalid, self.matched
        )?;
        if self.modified > 0 {
            write!(f, ", modified - {}", self.modified)?;
        }
        if self.upserted > 0 {
            write!(f, ", upserted - {}", self.upserted)?;
        }
        write!(f, ".")
    }
}

/// The outcome of one (file, cluster) job.
#[derive(Clone, Debug)]
pub struct JobResult {
    /// Segment file name.
    pub name: String,
    /// `0` for skipped-or-ok, `1` for invalid.
    pub error_code: u8,
    /// The per-file counters, `None` when the file was skipped.
    pub counter: Option<SegfileCounter>,
    /// Provider which owns the file.
    pub provider: String,
    /// Target cluster name.
    pub cluster: String,
}

#[derive(Clone, Debug)]
struct Entry {
    file: String,
    provider: String,
    cluster: String,
    counter: Option<SegfileCounter>,
}

/// Aggregates job results across files, providers and clusters.
#[derive(Clone, Debug, Default)]
pub struct Counter {
    entries: Vec<Entry>,
    invalid: BTreeSet<String>,
}

impl Counter {
    /// An empty counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the result of one job; a later result for the same
    /// (file, provider, cluster) replaces the earlier one.
    pub fn count_result(&mut self, result: &JobResult) {
        if result.error_code != 0 {
            self.invalid.insert(result.name.clone());
        }
        match self.entries.iter_mut().find(|e| {
            e.file == result.name && e.provider == result.provider && e.cluster == result.cluster
        }) {
            Some(entry) => entry.counter = result.counter.clone(),
            None => self.entries.push(Entry {
                file: result.name.clone(),
                provider: result.provider.clone(),
                cluster: result.cluster.clone(),
                counter: result.counter.clone(),
            }),
        }
    }

    fn files_with_counter(&self) -> BTreeSet<&str> {
        self.entries
            .iter()
            .filter(|e| e.counter.is_some())
            .map(|e| e.file.as_str())
            .collect()
    }

    /// Files for which at least one cluster produced real counters.
    pub fn processed(&self) -> usize {
        self.files_with_counter().len()
    }

    /// Files which were marked invalid on at least one cluster.
    pub fn invalid(&self) -> usize {
        self.invalid.len()
    }

    /// Files for which every cluster skipped the upload.
    pub fn skipped(&self) -> usize {
        let with_counter = self.files_with_counter();
        self.entries
            .iter()
            .map(|e| e.file.as_str())
            .filter(|file| !with_counter.contains(file))
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Aggregates per-file counters, optionally restricted to the given
    /// providers and/or clusters: `&` across clusters of one file, `+`
    /// across files. `None` when nothing matched.
    pub fn aggregate(
        &self,
        providers: Option<&[&str]>,
        clusters: Option<&[&str]>,
    ) -> Option<SegfileCounter> {
        let mut per_file: Vec<((&str, &str), SegfileCounter)> = Vec::new();
        for entry in &self.entries {
            let counter = match &entry.counter {
                Some(counter) => counter,
                None => continue,
            };
            if providers.is_some_and(|p| !p.contains(&entry.provider.as_str())) {
                continue;
            }
            if clusters.is_some_and(|c| !c.contains(&entry.cluster.as_str())) {
                continue;
            }
            let key = (entry.file.as_str(), entry.provider.as_str());
            match per_file.iter_mut().find(|(k, _)| *k == key) {
                Some((_, acc)) => *acc = acc.clone() & counter.clone(),
                None => per_file.push((key, counter.clone())),
            }
        }
        per_file
            .into_iter()
            .map(|(_, counter)| counter)
            .reduce(|acc, counter| acc + counter)
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Total files: processed - {}", self.processed())?;
        if self.invalid() > 0 {
            write!(f, ", invalid - {}", self.invalid())?;
        }
        if self.skipped() > 0 {
            write!(f, ", skipped - {}", self.skipped())?;
        }
        write!(f, ".")?;
        if let Some(aggregate) = self.aggregate(None, None) {
            write!(f, " {aggregate}")?;
        }
        Ok(())
    }
}

fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Wall-clock timing of one file plus a cooperative scheduler for periodic
/// side tasks.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Timer {
    /// Epoch seconds when processing started.
    pub started_ts: Option<f64>,
    /// Epoch seconds when processing finished.
    pub finished_ts: Option<f64>,
    #[serde(skip)]
    last_runs: HashMap<String, Instant>,
}

impl Timer {
    /// A fresh, unstarted timer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the start of processing, clearing any previous finish mark.
    pub fn start(&mut self) {
        self.started_ts = Some(epoch_now());
        self.finished_ts = None;
    }

    /// Marks the end of processing.
    pub fn stop(&mut self) {
        self.finished_ts = Some(epoch_now());
    }

    /// Elapsed seconds between start and finish (or now while running).
    pub fn elapsed_secs(&self) -> f64 {
        match (self.started_ts, self.finished_ts) {
            (Some(started), Some(finished)) => (finished - started).max(0.0),
            (Some(started), None) => (epoch_now() - started).max(0.0),
            _ => 0.0,
        }
    }

    /// Records `key` as run just now without running anything, so the first
    /// [`Timer::execute`] fires only after a full interval.
    pub fn touch(&mut self, key: &str) {
        self.last_runs.insert(key.to_owned(), Instant::now());
    }

    /// Runs `task` only if `interval` has elapsed since the last run under
    /// `key` (a never-run key runs immediately). Returns whether it ran.
    pub fn execute(&mut self, key: &str, interval: Duration, task: impl FnOnce()) -> bool {
        let due = self
            .last_runs
            .get(key)
            .map_or(true, |last| last.elapsed() >= interval);
        if due {
            self.last_runs.insert(key.to_owned(), Instant::now());
            task();
        }
        due
    }
}

impl fmt::Display for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total = self.elapsed_secs() as u64;
        write!(
            f,
            "Processing time - {} hours {} minutes {} seconds.",
            total / 3600,
            total % 3600 / 60,
            total % 60
        )
    }
}
