//! Shared state visible across workers: the progress ring used for
//! percent-complete display and the per-(provider, cluster) metric cells.

use crate::error::Error;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Number of `u32` slots in the progress ring, including the index slot.
pub const PROGRESS_SLOTS: usize = 1000;

/// A fixed ring of integers holding the live `line_total` of in-flight
/// files. Slot 0 is the rolling allocation index; each other slot has
/// exactly one writer, the [`ProgressSlot`] guard handed to a file.
#[derive(Debug)]
pub struct ProgressRing {
    slots: Vec<AtomicU32>,
}

impl ProgressRing {
    /// A zeroed ring.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            slots: (0..PROGRESS_SLOTS).map(|_| AtomicU32::new(0)).collect(),
        })
    }

    /// Claims the next slot. The returned guard is the slot's only writer;
    /// binding it to one file enforces the single-writer rule.
    pub fn allocate(self: &Arc<Self>) -> ProgressSlot {
        let next = self.slots[0].fetch_add(1, Ordering::Relaxed);
        let index = (next as usize % (PROGRESS_SLOTS - 1)) + 1;
        self.slots[index].store(0, Ordering::Relaxed);
        ProgressSlot {
            ring: Arc::clone(self),
            index,
        }
    }

    /// Reads one slot; display only.
    pub fn get(&self, index: usize) -> u32 {
        self.slots[index].load(Ordering::Relaxed)
    }
}

/// Write guard for one progress-ring slot.
#[derive(Debug)]
pub struct ProgressSlot {
    ring: Arc<ProgressRing>,
    index: usize,
}

impl ProgressSlot {
    /// Publishes the file's `line_total`.
    pub fn set(&self, line_total: u32) {
        self.ring.slots[self.index].store(line_total, Ordering::Relaxed);
    }

    /// Current published value.
    pub fn get(&self) -> u32 {
        self.ring.slots[self.index].load(Ordering::Relaxed)
    }

    /// Index of this slot within the ring.
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Two atomic counters per (provider, cluster): lines pushed through the
/// pipeline and lines rejected as invalid.
#[derive(Debug, Default)]
pub struct MetricsCell {
    lines_processed: AtomicU64,
    invalid_lines: AtomicU64,
}

impl MetricsCell {
    /// Advances both counters; called once per full batch and once for the
    /// final remainder.
    pub fn advance(&self, lines: u64, invalid: u64) {
        self.lines_processed.fetch_add(lines, Ordering::Relaxed);
        self.invalid_lines.fetch_add(invalid, Ordering::Relaxed);
    }

    /// `(lines_processed, invalid_lines)` snapshot.
    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.lines_processed.load(Ordering::Relaxed),
            self.invalid_lines.load(Ordering::Relaxed),
        )
    }
}

/// All metric cells of one run, keyed by (provider, cluster).
#[derive(Debug, Default)]
pub struct MetricsTable {
    cells: HashMap<(String, String), Arc<MetricsCell>>,
}

impl MetricsTable {
    /// Builds one cell per (provider, cluster) pair.
    pub fn new<'a>(
        providers: impl IntoIterator<Item = &'a str>,
        clusters: &[&str],
    ) -> Self {
        let mut cells = HashMap::new();
        for provider in providers {
            for cluster in clusters {
                cells.insert(
                    (provider.to_owned(), (*cluster).to_owned()),
                    Arc::new(MetricsCell::default()),
                );
            }
        }
        Self { cells }
    }

    /// The cell of one (provider, cluster) pair.
    pub fn cell(&self, provider: &str, cluster: &str) -> Option<Arc<MetricsCell>> {
        self.cells
            .get(&(provider.to_owned(), cluster.to_owned()))
            .map(Arc::clone)
    }

    /// Appends one graphite-style line per (provider, cluster, metric) to
    /// the metrics file: `<prefix>.<provider>.<cluster>.<metric> <value> <ts>`.
    /// Metrics are `lines_processed` and `uploaded` (processed minus invalid).
    pub fn flush(&self, prefix: &str, path: &Path) -> Result<(), Error> {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| Error::io("open metrics file", path, source))?;

        let mut keys: Vec<_> = self.cells.keys().collect();
        keys.sort();
        for key in keys {
            let (provider, cluster) = key;
            let (lines_processed, invalid_lines) = self.cells[key].snapshot();
            let uploaded = lines_processed.saturating_sub(invalid_lines);
            writeln!(
                file,
                "{prefix}.{provider}.{cluster}.lines_processed {lines_processed} {ts}"
            )
            .and_then(|()| {
                writeln!(file, "{prefix}.{provider}.{cluster}.uploaded {uploaded} {ts}")
            })
            .map_err(|source| Error::io("append to metrics file", path, source))?;
        }
        Ok(())
    }
}
