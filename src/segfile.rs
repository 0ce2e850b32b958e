//! One input file containing segments: type detection, line iteration,
//! batch production and per-file metadata.

use crate::{
    counter::{SegfileCounter, Timer},
    error::Error,
    shared::{MetricsCell, ProgressSlot},
    store::{Document, UpdateOne},
    strategy::{separator_for, Strategy},
};
use flate2::read::GzDecoder;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Interval between progress log lines while pumping batches.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(30);

/// Extension-to-MIME mapping, augmentable from config.
#[derive(Clone, Debug)]
pub struct MimeMap {
    map: BTreeMap<String, String>,
}

impl MimeMap {
    /// The built-in extension map.
    pub fn with_defaults() -> Self {
        let map = [
            ("tsv", "text/tab-separated-values"),
            ("csv", "text/csv"),
            ("txt", "text/plain"),
            ("tar", "application/x-tar"),
        ]
        .into_iter()
        .map(|(ext, mime)| (ext.to_owned(), mime.to_owned()))
        .collect();
        Self { map }
    }

    /// Adds or replaces `extension: mime` entries. Extensions are accepted
    /// with or without a leading dot.
    pub fn extend<'a>(&mut self, entries: impl IntoIterator<Item = (&'a str, &'a str)>) {
        for (ext, mime) in entries {
            self.map
                .insert(ext.trim_start_matches('.').to_owned(), mime.to_owned());
        }
    }

    /// Deduces `(mime, encoding)` from the file name. `.gz` and `.tgz`
    /// suffixes yield a gzip encoding.
    pub fn detect(&self, path: &Path) -> FileKind {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let (stem, encoding) = if let Some(stem) = name.strip_suffix(".gz") {
            (stem.to_owned(), Some("gzip".to_owned()))
        } else if name.ends_with(".tgz") {
            (format!("{}.tar", name.trim_end_matches(".tgz")), Some("gzip".to_owned()))
        } else {
            (name, None)
        };

        let mime = stem
            .rsplit_once('.')
            .and_then(|(_, ext)| self.map.get(ext))
            .cloned();
        FileKind { mime, encoding }
    }
}

/// Detected `(mime, encoding)` of a file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileKind {
    /// MIME type, when the extension is known.
    pub mime: Option<String>,
    /// Content encoding; `gzip` triggers streaming decompression.
    pub encoding: Option<String>,
}

impl FileKind {
    fn as_json(&self) -> Value {
        json!([self.mime, self.encoding])
    }

    /// Whether the content is gzip-framed.
    pub fn is_gzip(&self) -> bool {
        self.encoding.as_deref() == Some("gzip")
    }
}

/// A file containing segments, bound to one provider.
///
/// One instance represents the file's processing on one cluster; the
/// coordinator derives a fresh instance per target cluster with
/// [`SegmentFile::for_pair`].
#[derive(Debug)]
pub struct SegmentFile {
    /// Absolute path of the file on disk.
    pub path: PathBuf,
    /// Identity within the metadata collection.
    pub name: String,
    /// The provider that delivered the file; immutable after binding.
    pub provider: String,
    /// Detected (or overridden) type.
    pub kind: FileKind,
    /// Whether the file was marked invalid on this cluster.
    pub invalid: bool,
    /// Whether a run completed on this cluster.
    pub processed: bool,
    /// Per-run counters.
    pub counter: SegfileCounter,
    /// Per-run wall-clock timing.
    pub timer: Timer,
    strategy: Arc<Strategy>,
    metrics: Option<Arc<MetricsCell>>,
    slot: Option<Arc<ProgressSlot>>,
}

impl SegmentFile {
    /// Binds `path` to `provider` under `strategy`.
    ///
    /// The file must exist; its type must be one of the strategy's allowed
    /// MIME types (after `file_type_override`).
    pub fn new(
        path: impl Into<PathBuf>,
        provider: impl Into<String>,
        strategy: Arc<Strategy>,
        mime_map: &MimeMap,
    ) -> Result<Self, Error> {
        let path = path.into();
        let provider = provider.into();
        std::fs::metadata(&path).map_err(|source| Error::io("stat segment file", &path, source))?;

        let name = strategy.rewrite_filename(&path).unwrap_or_else(|| {
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
                .split('.')
                .next()
                .unwrap_or_default()
                .to_owned()
        });

        let mut kind = mime_map.detect(&path);
        if let Some(mime) = &strategy.file_type_override {
            kind.mime = Some(mime.clone());
        }
        let allowed = &strategy.allowed_types;
        if !kind
            .mime
            .as_deref()
            .is_some_and(|mime| allowed.iter().any(|a| a == mime))
        {
            return Err(Error::WrongFileType {
                name,
                found: kind.mime.unwrap_or_else(|| "unknown".to_owned()),
                expected: allowed.join(" or "),
            });
        }

        Ok(Self {
            path,
            name,
            provider,
            kind,
            invalid: false,
            processed: false,
            counter: SegfileCounter::default(),
            timer: Timer::new(),
            strategy,
            metrics: None,
            slot: None,
        })
    }

    /// The strategy this file is parsed with.
    pub fn strategy(&self) -> &Arc<Strategy> {
        &self.strategy
    }

    /// Attaches the progress-ring slot owned by this file.
    pub fn set_slot(&mut self, slot: Arc<ProgressSlot>) {
        self.slot = Some(slot);
    }

    /// A fresh instance of the same file for one (provider, cluster) pair:
    /// counters and flags reset, shared slot and the pair's metric cell
    /// attached.
    pub fn for_pair(&self, metrics: Option<Arc<MetricsCell>>) -> Self {
        Self {
            path: self.path.clone(),
            name: self.name.clone(),
            provider: self.provider.clone(),
            kind: self.kind.clone(),
            invalid: false,
            processed: false,
            counter: SegfileCounter::default(),
            timer: Timer::new(),
            strategy: Arc::clone(&self.strategy),
            metrics,
            slot: self.slot.clone(),
        }
    }

    fn open(&self) -> Result<Box<dyn BufRead + Send>, Error> {
        let file =
            File::open(&self.path).map_err(|source| Error::io("open segment file", &self.path, source))?;
        if self.kind.is_gzip() {
            debug!(file = %self.name, "opening with gzip");
            Ok(Box::new(BufReader::new(GzDecoder::new(file))))
        } else {
            debug!(file = %self.name, "opening");
            Ok(Box::new(BufReader::new(file)))
        }
    }

    /// Lazy line reader; the handle closes when the reader drops, on every
    /// exit path.
    pub fn lines(&self) -> Result<impl Iterator<Item = std::io::Result<String>> + Send, Error> {
        Ok(self.open()?.lines())
    }

    /// Validates and renders one raw line.
    pub fn get_setter(&self, line: &str) -> Result<UpdateOne, Error> {
        let mime = self
            .kind
            .mime
            .as_deref()
            .ok_or_else(|| Error::BadLine("file has no MIME type".to_owned()))?;
        let separator = separator_for(mime)
            .ok_or_else(|| Error::BadLine(format!("no separator for '{mime}'")))?;
        let fields: Vec<&str> = line.split(separator).collect();
        self.strategy
            .get_setter(&fields, mime)
            .map_err(|err| match err {
                Error::BadLine(_) => Error::BadLine(format!("line '{line}' is invalid")),
                other => other,
            })
    }

    /// The lazy batch producer. Starts the timer on first use.
    pub fn batches(&mut self) -> Result<Batches<'_>, Error> {
        let lines = self.open()?.lines();
        if self.timer.started_ts.is_none() {
            self.timer.start();
        }
        self.timer.touch("progress");
        let log_invalid = self.strategy.log_invalid_lines;
        let header_pending = self.kind.mime.as_deref() == Some("text/csv");
        Ok(Batches {
            file: self,
            lines,
            batch_lines: 0,
            ilc: 0,
            header_pending,
            log_invalid,
            done: false,
        })
    }

    fn advance_metrics(&self, lines: u64, invalid: u64) {
        if let Some(metrics) = &self.metrics {
            metrics.advance(lines, invalid);
        }
    }

    fn publish_line_total(&self) {
        if let Some(slot) = &self.slot {
            slot.set(self.counter.line_total.min(u32::MAX as u64) as u32);
        }
    }

    fn progress_tick(&mut self) {
        let name = self.name.clone();
        let line_cur = self.counter.line_cur;
        let line_total = self.counter.line_total;
        let elapsed = self.timer.elapsed_secs();
        self.timer.execute("progress", PROGRESS_INTERVAL, || {
            let rate = if elapsed > 0.0 {
                line_cur as f64 / elapsed
            } else {
                0.0
            };
            if line_total > 0 {
                info!(
                    file = %name,
                    "processed {} lines ({:.1}%), {:.0} lines/s",
                    line_cur,
                    line_cur as f64 * 100.0 / line_total as f64,
                    rate,
                );
            } else {
                info!(file = %name, "processed {} lines, {:.0} lines/s", line_cur, rate);
            }
        });
    }

    /// Serializes the persistent per-file record.
    pub fn dump_metadata(&self) -> Document {
        json!({
            "_id": self.name,
            "path": self.path.to_string_lossy(),
            "provider": self.provider,
            "type": self.kind.as_json(),
            "invalid": self.invalid,
            "processed": self.processed,
            "timer": {
                "started_ts": self.timer.started_ts,
                "finished_ts": self.timer.finished_ts,
            },
            "counter": {
                "matched": self.counter.matched,
                "modified": self.counter.modified,
                "upserted": self.counter.upserted,
                "line_cur": self.counter.line_cur,
                "line_invalid": self.counter.line_invalid,
                "line_total": self.counter.line_total,
            },
        })
    }

    /// Restores flags, timer and counters from a persisted record.
    ///
    /// A record written by a different provider is an error. When the prior
    /// run did not complete cleanly, `line_total` is cleared so the percent
    /// display stays honest on resume.
    pub fn load_metadata(&mut self, record: &Document) -> Result<(), Error> {
        if let Some(stored) = record.get("provider").and_then(Value::as_str) {
            if stored != self.provider {
                return Err(Error::invalid_segfile(
                    &self.name,
                    format!(
                        "file was delivered by provider '{stored}', processing as '{}'",
                        self.provider
                    ),
                ));
            }
        }
        self.invalid = record
            .get("invalid")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        self.processed = record
            .get("processed")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if let Some(timer) = record.get("timer") {
            self.timer.started_ts = timer.get("started_ts").and_then(Value::as_f64);
            self.timer.finished_ts = timer.get("finished_ts").and_then(Value::as_f64);
        }
        if let Some(counter) = record.get("counter") {
            self.counter = serde_json::from_value(counter.clone()).unwrap_or_default();
        }
        if !self.processed || self.invalid {
            self.counter.line_total = 0;
        }
        if self.counter.line_total > 0 {
            self.publish_line_total();
        }
        Ok(())
    }
}

impl AsRef<Path> for SegmentFile {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

/// The batch pump: a finite lazy sequence of bulk-write batches which also
/// maintains the file's counters, timer and shared metrics.
pub struct Batches<'a> {
    file: &'a mut SegmentFile,
    lines: std::io::Lines<Box<dyn BufRead + Send>>,
    /// Lines consumed in the current batch window (valid and invalid).
    batch_lines: u64,
    /// Invalid lines in the current batch window.
    ilc: u64,
    header_pending: bool,
    log_invalid: bool,
    done: bool,
}

impl std::fmt::Debug for Batches<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batches")
            .field("file", &self.file.name)
            .field("done", &self.done)
            .finish()
    }
}

impl Batches<'_> {
    /// Feeds one bulk-write result into the file's counter.
    pub fn count_bulk_write_result(&mut self, result: &crate::store::BulkWriteResult) {
        self.file.counter.count_bulk_write_result(result);
    }

    /// Closes the batch window: metrics, invalid-line accounting and the
    /// threshold check. Returns an error when the file must stop here.
    fn close_window(&mut self) -> Result<(), Error> {
        let strategy = Arc::clone(&self.file.strategy);
        self.file.advance_metrics(self.batch_lines, self.ilc);
        self.file.counter.line_invalid += self.ilc;

        let threshold_hit = self.batch_lines == strategy.batch_size as u64
            && self.ilc * 100
                >= u64::from(strategy.threshold_percent_invalid_lines_in_batch)
                    * strategy.batch_size as u64;
        if threshold_hit && !self.file.invalid {
            error!(
                file = %self.file.name,
                "{} of {} lines in a batch are invalid, marking file as invalid",
                self.ilc,
                strategy.batch_size,
            );
            self.file.invalid = true;
            if !strategy.process_invalid_file_to_end {
                return Err(Error::invalid_segfile(
                    &self.file.name,
                    format!("{} of {} lines in a batch are invalid", self.ilc, strategy.batch_size),
                ));
            }
            // Keep pumping to the end, but stop flooding the log.
            self.log_invalid = false;
        }
        self.batch_lines = 0;
        self.ilc = 0;
        Ok(())
    }

    fn finish(&mut self) {
        self.done = true;
        self.file.processed = true;
        if !self.file.invalid || self.file.strategy.process_invalid_file_to_end {
            self.file.counter.line_total = self.file.counter.line_cur;
            self.file.publish_line_total();
        }
        self.file.timer.stop();
    }
}

impl Iterator for Batches<'_> {
    type Item = Result<Vec<UpdateOne>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let batch_size = self.file.strategy.batch_size;
        let mut batch = Vec::with_capacity(batch_size);

        loop {
            let raw = match self.lines.next() {
                Some(Ok(raw)) => raw,
                Some(Err(source)) => {
                    self.done = true;
                    return Some(Err(Error::io(
                        "read segment file",
                        &self.file.path,
                        source,
                    )));
                }
                None => {
                    // Stream end: account for the partial window and flush.
                    if self.batch_lines > 0 || self.ilc > 0 {
                        if let Err(err) = self.close_window() {
                            self.done = true;
                            return Some(Err(err));
                        }
                    }
                    self.finish();
                    return if batch.is_empty() { None } else { Some(Ok(batch)) };
                }
            };

            let line = raw.trim();
            let header_candidate = std::mem::take(&mut self.header_pending);
            match self.file.get_setter(line) {
                Ok(setter) => {
                    self.file.counter.line_cur += 1;
                    self.batch_lines += 1;
                    batch.push(setter);
                }
                Err(Error::BadLine(message)) => {
                    if header_candidate {
                        debug!(file = %self.file.name, "skipping header line");
                        continue;
                    }
                    self.file.counter.line_cur += 1;
                    self.batch_lines += 1;
                    self.ilc += 1;
                    if self.log_invalid {
                        warn!("{},{}. {}", self.file.name, self.file.counter.line_cur, message);
                    }
                }
                Err(other) => {
                    self.done = true;
                    return Some(Err(other));
                }
            }

            self.file.progress_tick();

            if self.batch_lines == batch_size as u64 {
                if let Err(err) = self.close_window() {
                    self.done = true;
                    return Some(Err(err));
                }
                return Some(Ok(batch));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use crate::template::Registry;
    use flate2::{write::GzEncoder, Compression};
    use serde_json::json;
    use std::io::Write;
    use tempfile::TempDir;

    fn strategy(yaml: &str) -> Arc<Strategy> {
        let config: ProviderConfig = serde_yaml::from_str(yaml).unwrap();
        Arc::new(Strategy::new(&config, &Registry::with_builtins()).unwrap())
    }

    fn liveramp_tsv() -> Arc<Strategy> {
        strategy(
            r"
            collection: a.b
            input:
              text/tab-separated-values:
                - user_id: '^[a-f0-9]{8}-?[a-f0-9]{4}-?4[a-f0-9]{3}-?[89ab][a-f0-9]{3}-?[a-f0-9]{12}$'
                - segments: '^[0-9a-z_]+(?:,[0-9a-z_]+)*$'
            update:
              _id: '{{user_id}}'
              $set:
                lvmp: '{{segments}}'
            ",
        )
    }

    fn write_file(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    const TSV_CONTENT: &str = "f35ac18d-de62-42d1-97b5-ac6136187451\t1995228346\n\
                               0100e0ba-5c29-4d2c-8a23-0c2e76bc38df\t1000812376";

    #[test]
    fn mime_detection() {
        let map = MimeMap::with_defaults();
        assert_eq!(
            map.detect(Path::new("/x/audiencemembership.tsv.gz")),
            FileKind {
                mime: Some("text/tab-separated-values".to_owned()),
                encoding: Some("gzip".to_owned()),
            }
        );
        assert_eq!(
            map.detect(Path::new("file.csv")),
            FileKind {
                mime: Some("text/csv".to_owned()),
                encoding: None,
            }
        );
        assert_eq!(
            map.detect(Path::new("file_p1.tgz")),
            FileKind {
                mime: Some("application/x-tar".to_owned()),
                encoding: Some("gzip".to_owned()),
            }
        );
        assert_eq!(map.detect(Path::new("noext")), FileKind::default());

        let mut map = map;
        map.extend([(".log", "text/plain")]);
        assert_eq!(
            map.detect(Path::new("a.log")).mime.as_deref(),
            Some("text/plain")
        );
    }

    #[test]
    fn rejects_missing_file_and_wrong_type() {
        let dir = TempDir::new().unwrap();
        let strategy = liveramp_tsv();
        let mime_map = MimeMap::with_defaults();

        assert!(matches!(
            SegmentFile::new(dir.path().join("absent.tsv"), "liveramp", Arc::clone(&strategy), &mime_map),
            Err(Error::Io { .. })
        ));

        let csv = write_file(&dir, "file.csv", "a,b");
        assert!(matches!(
            SegmentFile::new(csv, "liveramp", strategy, &mime_map),
            Err(Error::WrongFileType { found, .. }) if found == "text/csv"
        ));
    }

    #[test]
    fn tsv_happy_path_produces_one_batch() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "tsv_file.tsv", TSV_CONTENT);
        let mut segfile =
            SegmentFile::new(path, "liveramp", liveramp_tsv(), &MimeMap::with_defaults()).unwrap();
        assert_eq!(segfile.name, "tsv_file");

        let lines: Vec<String> = segfile.lines().unwrap().map(Result::unwrap).collect();
        assert_eq!(
            lines,
            vec![
                "f35ac18d-de62-42d1-97b5-ac6136187451\t1995228346",
                "0100e0ba-5c29-4d2c-8a23-0c2e76bc38df\t1000812376",
            ]
        );

        let batches: Vec<_> = segfile.batches().unwrap().collect::<Result<_, _>>().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(
            batches[0],
            vec![
                UpdateOne {
                    filter: json!({"_id": "f35ac18d-de62-42d1-97b5-ac6136187451"}),
                    update: json!({"$set": {"lvmp": "1995228346"}}),
                    upsert: false,
                },
                UpdateOne {
                    filter: json!({"_id": "0100e0ba-5c29-4d2c-8a23-0c2e76bc38df"}),
                    update: json!({"$set": {"lvmp": "1000812376"}}),
                    upsert: false,
                },
            ]
        );
        assert!(segfile.processed);
        assert!(!segfile.invalid);
        assert_eq!(segfile.counter.line_cur, 2);
        assert_eq!(segfile.counter.line_total, 2);
        assert_eq!(segfile.counter.line_invalid, 0);
        assert!(segfile.timer.finished_ts.is_some());
    }

    #[test]
    fn gzip_files_are_decompressed_on_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tsv_file.tsv.gz");
        let mut encoder = GzEncoder::new(std::fs::File::create(&path).unwrap(), Compression::default());
        encoder.write_all(TSV_CONTENT.as_bytes()).unwrap();
        encoder.finish().unwrap();

        let mut segfile =
            SegmentFile::new(path, "liveramp", liveramp_tsv(), &MimeMap::with_defaults()).unwrap();
        assert!(segfile.kind.is_gzip());
        let batches: Vec<_> = segfile.batches().unwrap().collect::<Result<_, _>>().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
    }

    #[test]
    fn csv_header_is_skipped_once() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "file.csv", "user_id,segments\nwefv,678269\nwqxs,678270");
        let strategy = strategy(
            r"
            collection: a.b
            input:
              text/csv:
                - user_id: '^[a-z0-9]{4}$'
                - segments: '^[0-9]+$'
            update:
              _id: '{{user_id}}'
              lvmp: '{{segments}}'
            ",
        );
        let mut segfile =
            SegmentFile::new(path, "liveramp", strategy, &MimeMap::with_defaults()).unwrap();
        let batches: Vec<_> = segfile.batches().unwrap().collect::<Result<_, _>>().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
        // The header line is not counted.
        assert_eq!(segfile.counter.line_cur, 2);
        assert_eq!(segfile.counter.line_invalid, 0);
    }

    fn numbered_strategy(process_invalid_to_end: bool) -> Arc<Strategy> {
        strategy(&format!(
            r"
            collection: a.b
            input:
              text/tab-separated-values:
                - user_id: '^[a-z]+$'
                - segments: '^[0-9]+$'
            update:
              _id: '{{{{user_id}}}}'
              lvmp: '{{{{segments}}}}'
            batch_size: 5
            process_invalid_file_to_end: {process_invalid_to_end}
            "
        ))
    }

    // 5-line window with 4 bad rows breaches the default 80% threshold.
    const MOSTLY_BAD: &str = "aaa\t1\nBAD\nBAD\nBAD\nBAD\nbbb\t2\nccc\t3";

    #[test]
    fn threshold_breach_aborts_when_configured() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "bad.tsv", MOSTLY_BAD);
        let mut segfile = SegmentFile::new(
            path,
            "liveramp",
            numbered_strategy(false),
            &MimeMap::with_defaults(),
        )
        .unwrap();
        let results: Vec<_> = segfile.batches().unwrap().collect();
        assert_eq!(results.len(), 1);
        assert!(matches!(
            results[0],
            Err(Error::InvalidSegmentFile { .. })
        ));
        assert!(segfile.invalid);
        assert!(!segfile.processed);
        assert_eq!(segfile.counter.line_total, 0);
        assert_eq!(segfile.counter.line_invalid, 4);
    }

    #[test]
    fn threshold_breach_continues_to_end_by_default() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "bad.tsv", MOSTLY_BAD);
        let mut segfile = SegmentFile::new(
            path,
            "liveramp",
            numbered_strategy(true),
            &MimeMap::with_defaults(),
        )
        .unwrap();
        let batches: Vec<_> = segfile.batches().unwrap().collect::<Result<_, _>>().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[1].len(), 2);
        assert!(segfile.invalid);
        assert!(segfile.processed);
        assert_eq!(segfile.counter.line_cur, 7);
        assert_eq!(segfile.counter.line_total, 7);
        assert_eq!(segfile.counter.line_invalid, 4);
    }

    #[test]
    fn under_threshold_batch_stays_valid() {
        let dir = TempDir::new().unwrap();
        // 3 of 5 lines invalid: 60% < 80%.
        let path = write_file(&dir, "soso.tsv", "aaa\t1\nBAD\nBAD\nBAD\nbbb\t2\nccc\t3");
        let mut segfile = SegmentFile::new(
            path,
            "liveramp",
            numbered_strategy(false),
            &MimeMap::with_defaults(),
        )
        .unwrap();
        let batches: Vec<_> = segfile.batches().unwrap().collect::<Result<_, _>>().unwrap();
        assert_eq!(batches.len(), 2);
        assert!(!segfile.invalid);
        assert_eq!(segfile.counter.line_invalid, 3);
        assert_eq!(segfile.counter.line_total, 6);
    }

    #[test]
    fn metadata_round_trip_and_provider_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "tsv_file.tsv", TSV_CONTENT);
        let mut segfile =
            SegmentFile::new(&path, "liveramp", liveramp_tsv(), &MimeMap::with_defaults()).unwrap();

        let foreign = json!({
            "provider": "lotame",
            "invalid": true,
            "processed": true,
            "timer": {"started_ts": 1_545_820_888.727_645, "finished_ts": 1_545_821_147.860_29},
            "counter": {"matched": 0, "modified": 0, "upserted": 0,
                        "line_cur": 3_455_803, "line_invalid": 1267, "line_total": 3_455_803},
        });
        assert!(matches!(
            segfile.load_metadata(&foreign),
            Err(Error::InvalidSegmentFile { .. })
        ));

        let record = json!({
            "_id": "audiencemembership_2018122500",
            "path": "/data/lotame/2018122500/4827/audiencemembership.tsv.gz",
            "provider": "liveramp",
            "type": ["text/tab-separated-values", "gzip"],
            "invalid": true,
            "processed": true,
            "timer": {"started_ts": 1_545_820_888.727_645, "finished_ts": 1_545_821_147.860_29},
            "counter": {"matched": 0, "modified": 0, "upserted": 0,
                        "line_cur": 3_455_803, "line_invalid": 1267, "line_total": 3_455_803},
        });
        segfile.load_metadata(&record).unwrap();
        assert!(segfile.invalid);
        assert!(segfile.processed);
        // A previously-invalid record loses its line_total on resume.
        assert_eq!(segfile.counter.line_total, 0);
        assert_eq!(segfile.counter.line_cur, 3_455_803);

        let dump = segfile.dump_metadata();
        assert_eq!(dump["_id"], "tsv_file");
        assert_eq!(dump["path"], path.to_string_lossy().as_ref());
        assert_eq!(dump["provider"], "liveramp");
        assert_eq!(dump["type"], json!(["text/tab-separated-values", null]));
        assert_eq!(dump["invalid"], true);
        assert_eq!(dump["processed"], true);
        assert_eq!(dump["timer"]["started_ts"], 1_545_820_888.727_645);
        assert_eq!(
            dump["counter"],
            json!({"matched": 0, "modified": 0, "upserted": 0,
                   "line_cur": 3_455_803, "line_invalid": 1267, "line_total": 0})
        );
    }

    #[test]
    fn clean_metadata_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "tsv_file.tsv", TSV_CONTENT);
        let mut segfile =
            SegmentFile::new(&path, "liveramp", liveramp_tsv(), &MimeMap::with_defaults()).unwrap();
        segfile.batches().unwrap().for_each(|batch| {
            batch.unwrap();
        });
        let dump = segfile.dump_metadata();

        let mut restored =
            SegmentFile::new(&path, "liveramp", liveramp_tsv(), &MimeMap::with_defaults()).unwrap();
        restored.load_metadata(&dump).unwrap();
        assert!(restored.processed);
        assert!(!restored.invalid);
        assert_eq!(restored.counter, segfile.counter);
        assert_eq!(restored.timer.started_ts, segfile.timer.started_ts);
        assert_eq!(restored.timer.finished_ts, segfile.timer.finished_ts);
        assert_eq!(restored.dump_metadata(), dump);
    }
}
