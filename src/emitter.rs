//! Per-provider façade: one strategy, one or more observers and a queue of
//! segment files ready for upload.

use crate::{
    config::{LocalDeliveryConfig, ProviderConfig, SortDirection, SortingConfig},
    error::Error,
    observer::{EventHandler, LocalFilesObserver, ReadySignal},
    segfile::{MimeMap, SegmentFile},
    strategy::Strategy,
    template::Registry,
};
use regex::Regex;
use serde_yaml::Value as Yaml;
use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tracing::{debug, error, warn};

/// One sortable attribute of a file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SortKey {
    /// The n-th capture group of the path regex (0-based).
    Path(usize),
    /// `stat.st_size`.
    Size,
    /// `stat.st_mtime`.
    Mtime,
}

/// Multi-key stable file ordering driven by a path regex and a rule list.
#[derive(Debug)]
pub struct Sorter {
    regex: Regex,
    order: Vec<(SortKey, SortDirection)>,
}

struct Decorated<T> {
    groups: Vec<String>,
    size: u64,
    mtime: f64,
    item: T,
}

impl Sorter {
    /// Compiles the sorting config.
    pub fn new(config: &SortingConfig) -> Result<Self, Error> {
        let regex = Regex::new(&config.file_path_regexp)?;
        let mut order = Vec::new();
        for rule in &config.order {
            for (key, direction) in rule {
                let key = match key.as_str() {
                    "stat.st_size" => SortKey::Size,
                    "stat.st_mtime" => SortKey::Mtime,
                    other => match other.strip_prefix("path.").and_then(|n| n.parse().ok()) {
                        Some(index) => SortKey::Path(index),
                        None => {
                            return Err(Error::InvalidStrategy(format!(
                                "unknown sort key '{other}'"
                            )))
                        }
                    },
                };
                order.push((key, *direction));
            }
        }
        Ok(Self { regex, order })
    }

    /// Sorts items by applying the rules in reverse with a stable sort, so
    /// the first rule becomes the primary key. Every path must match the
    /// regex.
    pub fn sort<T: AsRef<Path>>(&self, items: Vec<T>) -> Result<Vec<T>, Error> {
        let mut decorated = Vec::with_capacity(items.len());
        for item in items {
            let path = item.as_ref();
            let path_str = path.to_string_lossy().into_owned();
            let captures = self.regex.captures(&path_str).ok_or_else(|| {
                Error::invalid_segfile(&path_str, "path does not match file_path_regexp")
            })?;
            let groups = captures
                .iter()
                .skip(1)
                .map(|group| group.map_or_else(String::new, |m| m.as_str().to_owned()))
                .collect();
            let meta = std::fs::metadata(path)
                .map_err(|source| Error::io("stat file for sorting", path, source))?;
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
                .map_or(0.0, |d| d.as_secs_f64());
            decorated.push(Decorated {
                groups,
                size: meta.len(),
                mtime,
                item,
            });
        }

        for (key, direction) in self.order.iter().rev() {
            decorated.sort_by(|a, b| {
                let ordering = match key {
                    SortKey::Path(index) => {
                        let empty = String::new();
                        let left = a.groups.get(*index).unwrap_or(&empty);
                        let right = b.groups.get(*index).unwrap_or(&empty);
                        left.cmp(right)
                    }
                    SortKey::Size => a.size.cmp(&b.size),
                    SortKey::Mtime => {
                        a.mtime.partial_cmp(&b.mtime).unwrap_or(Ordering::Equal)
                    }
                };
                match direction {
                    SortDirection::Asc => ordering,
                    SortDirection::Desc => ordering.reverse(),
                }
            });
        }
        Ok(decorated.into_iter().map(|d| d.item).collect())
    }
}

/// Shared queue-side state of an emitter; the observers hold it as the
/// event handler.
struct EmitterCore {
    provider: String,
    strategy: Arc<Strategy>,
    mime_map: MimeMap,
    queue: Mutex<VecDeque<SegmentFile>>,
    items_ready: ReadySignal,
    errors: AtomicBool,
}

impl EventHandler for EmitterCore {
    fn items_ready(&self) -> &ReadySignal {
        &self.items_ready
    }

    fn on_file_discovered(&self, path: &Path) {
        debug!("{} is discovered, putting in queue", path.display());
        match SegmentFile::new(path, &self.provider, Arc::clone(&self.strategy), &self.mime_map) {
            Ok(segfile) => {
                self.queue
                    .lock()
                    .expect("emitter queue poisoned")
                    .push_back(segfile);
                self.items_ready.set();
            }
            Err(err) => {
                error!("{err}");
                self.errors.store(true, AtomicOrdering::Relaxed);
            }
        }
    }
}

/// Owns one provider's strategy, observers and the ready queue.
pub struct FileEmitter {
    core: Arc<EmitterCore>,
    observers: Vec<LocalFilesObserver>,
    sorter: Option<Sorter>,
}

impl std::fmt::Debug for FileEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileEmitter")
            .field("provider", &self.core.provider)
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl FileEmitter {
    /// Builds the emitter and starts the configured delivery observers.
    ///
    /// Unknown delivery names (and misconfigured ones) are warned about and
    /// skipped; ending up with no observer at all is a
    /// [`Error::NoAnyDelivery`].
    pub fn new(
        provider: impl Into<String>,
        config: &ProviderConfig,
        registry: &Registry,
        mime_map: MimeMap,
    ) -> Result<Self, Error> {
        let provider = provider.into();
        let strategy = Arc::new(Strategy::new(config, registry)?);
        debug!("loaded strategy for {provider}");
        let sorter = config.sorting.as_ref().map(Sorter::new).transpose()?;
        let core = Arc::new(EmitterCore {
            provider,
            strategy,
            mime_map,
            queue: Mutex::new(VecDeque::new()),
            items_ready: ReadySignal::new(),
            errors: AtomicBool::new(false),
        });
        let mut emitter = Self {
            core,
            observers: Vec::new(),
            sorter,
        };
        emitter.start_observers(&config.delivery)?;
        Ok(emitter)
    }

    fn start_observers(&mut self, delivery: &BTreeMap<String, Yaml>) -> Result<(), Error> {
        for (name, config) in delivery {
            match name.as_str() {
                "local" => {
                    let config: LocalDeliveryConfig = match serde_yaml::from_value(config.clone()) {
                        Ok(config) => config,
                        Err(err) => {
                            warn!(
                                "bad 'local' delivery config for '{}': {err}, ignoring",
                                self.core.provider
                            );
                            continue;
                        }
                    };
                    debug!("starting local watcher for {}", self.core.provider);
                    self.observers.push(LocalFilesObserver::start(
                        Arc::clone(&self.core) as Arc<dyn EventHandler>,
                        config,
                    )?);
                }
                other => {
                    warn!(
                        "don't know how to deliver '{}' from '{other}', ignoring",
                        self.core.provider
                    );
                }
            }
        }
        if self.observers.is_empty() {
            return Err(Error::NoAnyDelivery(self.core.provider.clone()));
        }
        Ok(())
    }

    /// The provider this emitter serves.
    pub fn provider(&self) -> &str {
        &self.core.provider
    }

    /// The shared strategy.
    pub fn strategy(&self) -> Arc<Strategy> {
        Arc::clone(&self.core.strategy)
    }

    /// Event raised when a polling pass has classified the directory.
    pub fn items_ready(&self) -> &ReadySignal {
        &self.core.items_ready
    }

    /// Whether any discovered file was dropped (wrong type).
    pub fn has_errors(&self) -> bool {
        self.core.errors.load(AtomicOrdering::Relaxed)
    }

    /// Feeds one discovered path through the emitter, as the observers do.
    pub fn on_file_discovered(&self, path: &Path) {
        self.core.on_file_discovered(path);
    }

    /// Takes every queued file, in configured order.
    pub fn drain(&self) -> Result<Vec<SegmentFile>, Error> {
        let drained: Vec<SegmentFile> = self
            .core
            .queue
            .lock()
            .expect("emitter queue poisoned")
            .drain(..)
            .collect();
        match (&self.sorter, drained.len()) {
            (Some(sorter), 2..) => sorter.sort(drained),
            _ => Ok(drained),
        }
    }

    /// Stops all observers.
    pub fn stop(&mut self) {
        for observer in &mut self.observers {
            observer.stop();
        }
    }
}
